//!
//! Boundary to the distributed store records are written to.
//!

use std::pin::Pin;

use bytes::Bytes;
use futures_util::Stream;
use tokio_util::sync::CancellationToken;

/// Progress events emitted while the store routes a query.
/// They are only ever logged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryEvent {
    SendingQuery { to: String },
    PeerResponse { from: String, closer: usize },
    FinalPeer { from: String },
    QueryError { from: String, message: String },
    Provider { from: String },
    Value { from: String, value: Bytes },
    AddingPeer { peer: String },
    DialingPeer { peer: String },
    Unknown { kind: i64 },
}

impl QueryEvent {
    pub fn name(&self) -> &'static str {
        match self {
            QueryEvent::SendingQuery { .. } => "SENDING_QUERY",
            QueryEvent::PeerResponse { .. } => "PEER_RESPONSE",
            QueryEvent::FinalPeer { .. } => "FINAL_PEER",
            QueryEvent::QueryError { .. } => "QUERY_ERROR",
            QueryEvent::Provider { .. } => "PROVIDER",
            QueryEvent::Value { .. } => "VALUE",
            QueryEvent::AddingPeer { .. } => "ADDING_PEER",
            QueryEvent::DialingPeer { .. } => "DIALING_PEER",
            QueryEvent::Unknown { .. } => "UNKNOWN",
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Request(String),
    #[error("store returned an error: {0}")]
    Api(String),
    #[error("invalid store response: {0}")]
    InvalidResponse(String),
    #[error("store operation was cancelled")]
    Cancelled,
}

pub type QueryEventStream = Pin<Box<dyn Stream<Item = Result<QueryEvent, StoreError>> + Send>>;

/// A key addressed store, e.g. the IPFS DHT.
#[async_trait::async_trait]
pub trait RecordStore: Send + Sync + 'static {
    /// Writes `record` under `path`.
    ///
    /// The returned stream is lazy and yields progress events until the write
    /// completes. The write ends with the first error. Implementations must stop
    /// work once `cancel` fires.
    fn put(&self, path: &str, record: Bytes, cancel: CancellationToken) -> QueryEventStream;

    /// Reads the record currently stored under `path`, if any.
    async fn get(&self, path: &str) -> Result<Option<Bytes>, StoreError>;
}
