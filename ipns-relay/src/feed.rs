//!
//! Watches the name service feed over a websocket and relays every update.
//!

use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    time::Duration,
};

use futures_util::StreamExt;
use ipns_publisher::{Ingest, RecordKey};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use crate::config::DEFAULT_RECONNECT_DELAY;

/// Path of the watch endpoint, relative to the feed endpoint.
pub const WATCH_PATH: &str = "name/*/watch";

/// Number of mailboxes feed updates are spread over.
const FEED_WORKERS: usize = 8;
/// Updates a mailbox holds before the socket read waits.
const MAILBOX_CAPACITY: usize = 64;

/// Running feed watcher. Stops when dropped.
pub struct FeedWatcher {
    url: Url,
    task: JoinHandle<()>,
}

impl FeedWatcher {
    /// Start watching `endpoint`, reconnecting after the default delay.
    pub fn start(endpoint: &Url, ingest: Ingest) -> anyhow::Result<Self> {
        Self::start_with_delay(endpoint, ingest, DEFAULT_RECONNECT_DELAY)
    }

    pub fn start_with_delay(
        endpoint: &Url,
        ingest: Ingest,
        reconnect_delay: Duration,
    ) -> anyhow::Result<Self> {
        let url = endpoint.join(WATCH_PATH)?;
        let dispatcher = FeedDispatcher::new(ingest, FEED_WORKERS, MAILBOX_CAPACITY);
        let task = tokio::spawn(watch_loop(url.clone(), dispatcher, reconnect_delay));
        Ok(Self { url, task })
    }

    /// The watch url connected to.
    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl Drop for FeedWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn watch_loop(url: Url, dispatcher: FeedDispatcher, reconnect_delay: Duration) {
    loop {
        match connect_async(url.as_str()).await {
            Ok((mut ws, _)) => {
                tracing::info!("Connected to feed {url}");
                while let Some(frame) = ws.next().await {
                    match frame {
                        Ok(Message::Text(text)) => dispatcher.dispatch(&text).await,
                        Ok(Message::Binary(_)) => tracing::warn!("received binary message"),
                        Ok(Message::Close(frame)) => {
                            tracing::info!("Feed closed the connection: {frame:?}");
                            break;
                        }
                        Ok(_) => {}
                        Err(error) => {
                            tracing::warn!("Feed read failed: {error}");
                            break;
                        }
                    }
                }
            }
            Err(error) => tracing::warn!("Feed connect to {url} failed: {error}"),
        }

        tracing::info!(
            "Reconnecting to feed in {}s",
            reconnect_delay.as_secs_f32()
        );
        tokio::time::sleep(reconnect_delay).await;
    }
}

/// Hands feed updates to a fixed set of mailboxes, one consumer each.
///
/// Updates of one name always land in the same mailbox, so they are admitted
/// in the order the feed sent them. Updates of different names are admitted
/// concurrently, and a slow freshness lookup only holds up its own mailbox.
struct FeedDispatcher {
    mailboxes: Vec<flume::Sender<Value>>,
    workers: Vec<JoinHandle<()>>,
}

impl FeedDispatcher {
    fn new(ingest: Ingest, workers: usize, capacity: usize) -> Self {
        let (mailboxes, workers) = (0..workers.max(1))
            .map(|_| {
                let (tx, rx) = flume::bounded(capacity);
                let ingest = ingest.clone();
                let worker = tokio::spawn(async move {
                    while let Ok(payload) = rx.recv_async().await {
                        handle_update(&ingest, &payload).await;
                    }
                });
                (tx, worker)
            })
            .unzip();
        Self { mailboxes, workers }
    }

    /// Parses a text frame and queues it. Waits only when the mailbox is full.
    async fn dispatch(&self, text: &str) {
        let payload: Value = match serde_json::from_str(text) {
            Ok(payload) => payload,
            Err(error) => {
                tracing::warn!("Feed update rejected: invalid JSON: {error}");
                return;
            }
        };
        let key = payload.get("key").and_then(Value::as_str).unwrap_or_default();
        let mailbox = &self.mailboxes[self.mailbox_for(key)];
        if mailbox.send_async(payload).await.is_err() {
            tracing::warn!("Feed mailbox closed, dropping update");
        }
    }

    /// Index of the mailbox serving `key`. Spellings of one name share it.
    fn mailbox_for(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        match RecordKey::parse(key) {
            Ok(parsed) => parsed.as_str().hash(&mut hasher),
            Err(_) => key.hash(&mut hasher),
        }
        (hasher.finish() % self.mailboxes.len() as u64) as usize
    }
}

impl Drop for FeedDispatcher {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

async fn handle_update(ingest: &Ingest, payload: &Value) {
    match ingest.submit_json(payload).await {
        Ok(update) => tracing::debug!("Feed update for {} accepted", update.key.short()),
        Err(error) => tracing::warn!("Feed update rejected: {error}"),
    }
}
