//!
//! Publishes a single record to the store within a deadline.
//!

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    key::{shorten, RecordKey},
    store::{QueryEvent, RecordStore, StoreError},
};

/// Default deadline of a single store write.
pub const DEFAULT_PUT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("Publishing timed out after {0:?}.")]
    Timeout(Duration),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PublishError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, PublishError::Timeout(_))
    }

    pub fn is_store_error(&self) -> bool {
        matches!(self, PublishError::Store(_))
    }
}

#[derive(Debug, Clone)]
pub struct PublishInfo {
    /// How long the write took.
    pub elapsed: Duration,
    /// Number of query events the store reported.
    pub event_count: usize,
}

/// Settings for creating a publisher
#[derive(Debug, Clone)]
pub struct PublisherSettings {
    pub(crate) put_timeout: Duration,
}

impl PublisherSettings {
    pub fn new() -> Self {
        Self {
            put_timeout: DEFAULT_PUT_TIMEOUT,
        }
    }

    /// Deadline after which a write is cancelled.
    pub fn put_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.put_timeout = timeout;
        self
    }
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes records to a [RecordStore].
///
/// Every attempt gets its own cancellation token which fires when the deadline
/// elapses. Failures are reported and logged but never retried.
#[derive(Clone)]
pub struct Publisher {
    store: Arc<dyn RecordStore>,
    put_timeout: Duration,
}

impl Publisher {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self::new_with_settings(store, PublisherSettings::new())
    }

    pub fn new_with_settings(store: Arc<dyn RecordStore>, settings: PublisherSettings) -> Self {
        Self {
            store,
            put_timeout: settings.put_timeout,
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Publish the record of a single key.
    pub async fn publish(
        &self,
        key: &RecordKey,
        value: &str,
        record: Bytes,
    ) -> Result<PublishInfo, PublishError> {
        let path = key.path();
        let short_key = key.short();
        tracing::info!("Publish {short_key} -> {value}");

        let start = Instant::now();
        let cancel = CancellationToken::new();
        let mut events = self.store.put(&path, record, cancel.clone());
        let drain = async {
            let mut event_count = 0;
            while let Some(event) = events.next().await {
                let event = event?;
                log_query_event(&short_key, &event);
                event_count += 1;
            }
            Ok::<usize, StoreError>(event_count)
        };

        let result = tokio::select! {
            result = drain => result.map_err(PublishError::from),
            _ = tokio::time::sleep(self.put_timeout) => {
                cancel.cancel();
                Err(PublishError::Timeout(self.put_timeout))
            }
        };

        let elapsed = start.elapsed();
        match result {
            Ok(event_count) => {
                tracing::info!(
                    "Published {short_key} within {}ms. events={event_count}",
                    elapsed.as_millis()
                );
                Ok(PublishInfo {
                    elapsed,
                    event_count,
                })
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to publish {short_key} within {}ms. {e}",
                    elapsed.as_millis()
                );
                Err(e)
            }
        }
    }
}

fn log_query_event(short_key: &str, event: &QueryEvent) {
    let name = event.name();
    match event {
        QueryEvent::SendingQuery { to } => {
            tracing::debug!("{short_key} {name} to {}", shorten(to))
        }
        QueryEvent::PeerResponse { from, closer } => {
            tracing::debug!("{short_key} {name} from {} closer={closer}", shorten(from))
        }
        QueryEvent::FinalPeer { from } | QueryEvent::Provider { from } => {
            tracing::debug!("{short_key} {name} {}", shorten(from))
        }
        QueryEvent::QueryError { from, message } => {
            tracing::debug!("{short_key} {name} from {}: {message}", shorten(from))
        }
        QueryEvent::Value { from, value } => {
            tracing::debug!("{short_key} {name} from {} {} bytes", shorten(from), value.len())
        }
        QueryEvent::AddingPeer { peer } | QueryEvent::DialingPeer { peer } => {
            tracing::debug!("{short_key} {name} {}", shorten(peer))
        }
        QueryEvent::Unknown { kind } => tracing::debug!("{short_key} {name} type={kind}"),
    }
}
