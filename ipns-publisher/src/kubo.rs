//!
//! [RecordStore] backed by the routing commands of the Kubo RPC API.
//!
//! Both `routing/put` and `routing/get` answer with a stream of newline
//! delimited JSON query events.
//!

use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::store::{QueryEvent, QueryEventStream, RecordStore, StoreError};

/// Default address of the Kubo RPC API.
pub const DEFAULT_KUBO_API_URL: &str = "http://127.0.0.1:5001";

#[derive(Debug, Deserialize)]
struct KuboQueryEvent {
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(rename = "Type")]
    kind: i64,
    #[serde(rename = "Responses", default)]
    responses: Option<Vec<KuboPeer>>,
    #[serde(rename = "Extra", default)]
    extra: String,
}

#[derive(Debug, Deserialize)]
struct KuboPeer {
    #[serde(rename = "ID", default)]
    #[allow(dead_code)]
    id: String,
}

#[derive(Debug, Deserialize)]
struct KuboError {
    #[serde(rename = "Message")]
    message: String,
}

impl From<KuboQueryEvent> for QueryEvent {
    fn from(event: KuboQueryEvent) -> Self {
        let KuboQueryEvent {
            id,
            kind,
            responses,
            extra,
        } = event;
        match kind {
            0 => QueryEvent::SendingQuery { to: id },
            1 => QueryEvent::PeerResponse {
                from: id,
                closer: responses.map(|peers| peers.len()).unwrap_or_default(),
            },
            2 => QueryEvent::FinalPeer { from: id },
            3 => QueryEvent::QueryError {
                from: id,
                message: extra,
            },
            4 => QueryEvent::Provider { from: id },
            5 => {
                // Kubo base64 encodes values, fall back to the raw text.
                let value = STANDARD
                    .decode(extra.as_bytes())
                    .map(Bytes::from)
                    .unwrap_or_else(|_| Bytes::from(extra.into_bytes()));
                QueryEvent::Value { from: id, value }
            }
            6 => QueryEvent::AddingPeer { peer: id },
            7 => QueryEvent::DialingPeer { peer: id },
            kind => QueryEvent::Unknown { kind },
        }
    }
}

/// Kubo (go-ipfs) RPC client used as the record store.
#[derive(Debug, Clone)]
pub struct KuboStore {
    client: reqwest::Client,
    api_url: Url,
}

impl KuboStore {
    pub fn new(api_url: Url) -> Self {
        Self::new_with_client(reqwest::Client::new(), api_url)
    }

    pub fn new_with_client(client: reqwest::Client, api_url: Url) -> Self {
        Self { client, api_url }
    }

    pub fn api_url(&self) -> &Url {
        &self.api_url
    }

    fn command_url(&self, command: &str, arg: &str) -> Result<Url, StoreError> {
        let mut url = self
            .api_url
            .join(&format!("api/v0/{command}"))
            .map_err(|e| StoreError::Request(e.to_string()))?;
        url.query_pairs_mut().append_pair("arg", arg);
        Ok(url)
    }
}

/// Turns an unsuccessful response into [StoreError::Api].
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, StoreError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| StoreError::Request(e.to_string()))?;
    let message = serde_json::from_str::<KuboError>(&body)
        .map(|e| e.message)
        .unwrap_or_else(|_| format!("{status}: {body}"));
    Err(StoreError::Api(message))
}

/// Splits a byte stream into NDJSON query events.
fn query_events<S>(
    body: S,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<QueryEvent, StoreError>> + Send
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
{
    async_stream::try_stream! {
        let mut body = Box::pin(body);
        let mut buffer: Vec<u8> = Vec::new();
        loop {
            let chunk = cancel
                .run_until_cancelled(body.next())
                .await
                .ok_or(StoreError::Cancelled)?;
            let Some(chunk) = chunk else {
                break;
            };
            let chunk = chunk.map_err(|e| StoreError::Request(e.to_string()))?;
            buffer.extend_from_slice(&chunk);
            while let Some(position) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=position).collect();
                if let Some(event) = parse_line(&line)? {
                    yield event;
                }
            }
        }
        if let Some(event) = parse_line(&buffer)? {
            yield event;
        }
    }
}

fn put_events(
    client: reqwest::Client,
    url: Result<Url, StoreError>,
    record: Bytes,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<QueryEvent, StoreError>> + Send {
    async_stream::try_stream! {
        let url = url?;
        let form = Form::new().part("file", Part::stream(record));
        let response = cancel
            .run_until_cancelled(client.post(url).multipart(form).send())
            .await
            .ok_or(StoreError::Cancelled)?
            .map_err(|e| StoreError::Request(e.to_string()))?;
        let response = check_status(response).await?;
        let mut events = Box::pin(query_events(response.bytes_stream(), cancel));
        while let Some(event) = events.next().await {
            yield event?;
        }
    }
}

fn parse_line(line: &[u8]) -> Result<Option<QueryEvent>, StoreError> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return Ok(None);
    }
    let event: KuboQueryEvent =
        serde_json::from_slice(line).map_err(|e| StoreError::InvalidResponse(e.to_string()))?;
    Ok(Some(event.into()))
}

#[async_trait::async_trait]
impl RecordStore for KuboStore {
    fn put(&self, path: &str, record: Bytes, cancel: CancellationToken) -> QueryEventStream {
        let url = self.command_url("routing/put", path);
        Box::pin(put_events(self.client.clone(), url, record, cancel))
    }

    async fn get(&self, path: &str) -> Result<Option<Bytes>, StoreError> {
        let url = self.command_url("routing/get", path)?;
        let response = self
            .client
            .post(url)
            .send()
            .await
            .map_err(|e| StoreError::Request(e.to_string()))?;
        let response = match check_status(response).await {
            Ok(response) => response,
            Err(StoreError::Api(message)) if message.contains("not found") => return Ok(None),
            Err(e) => return Err(e),
        };

        let mut events = Box::pin(query_events(
            response.bytes_stream(),
            CancellationToken::new(),
        ));
        while let Some(event) = events.next().await {
            if let QueryEvent::Value { value, .. } = event? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }
}
