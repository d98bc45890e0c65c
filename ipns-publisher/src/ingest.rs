//!
//! Entry point for updates from any transport: validate, then enqueue.
//!

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    coordinator::{Coordinator, EnqueueOutcome},
    key::RecordKey,
    record::IpnsRecord,
    store::RecordStore,
    validator::{AdmittedUpdate, RejectReason, Validator},
};

/// Default bound on fetching the current record for the freshness check.
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum IngestError {
    #[error("JSON payload missing key '{0}'")]
    MissingField(&'static str),
    #[error("JSON payload key '{0}' must be a string")]
    InvalidField(&'static str),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(String),
    #[error(transparent)]
    Rejected(#[from] RejectReason),
}

impl IngestError {
    /// The admission rejection, if this is one.
    pub fn rejection(&self) -> Option<&RejectReason> {
        match self {
            IngestError::Rejected(reason) => Some(reason),
            _ => None,
        }
    }
}

/// Whether an update is compared to the record currently in the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FreshnessPolicy {
    /// Trust the feed to only deliver newer records.
    Disabled,
    /// Fetch the current record and reject updates that don't win over it.
    #[default]
    Store,
}

#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub(crate) freshness: FreshnessPolicy,
    pub(crate) lookup_timeout: Duration,
}

impl IngestSettings {
    pub fn new() -> Self {
        Self {
            freshness: FreshnessPolicy::default(),
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
        }
    }

    pub fn freshness(&mut self, policy: FreshnessPolicy) -> &mut Self {
        self.freshness = policy;
        self
    }

    /// Bound on fetching the current record. Failed lookups count as "no record".
    pub fn lookup_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.lookup_timeout = timeout;
        self
    }
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self::new()
    }
}

/// Validates updates and hands admitted ones to the [Coordinator].
///
/// Used by the feed watcher and the HTTP relay alike.
#[derive(Clone)]
pub struct Ingest {
    validator: Validator,
    coordinator: Coordinator,
    store: Arc<dyn RecordStore>,
    freshness: FreshnessPolicy,
    lookup_timeout: Duration,
}

impl Ingest {
    pub fn new(coordinator: Coordinator) -> Self {
        Self::new_with_settings(coordinator, Validator::default(), IngestSettings::new())
    }

    pub fn new_with_settings(
        coordinator: Coordinator,
        validator: Validator,
        settings: IngestSettings,
    ) -> Self {
        Self {
            store: coordinator.store().clone(),
            validator,
            coordinator,
            freshness: settings.freshness,
            lookup_timeout: settings.lookup_timeout,
        }
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Submits a `{"key": ..., "record": ...}` text payload.
    pub async fn submit_str(&self, payload: &str) -> Result<AdmittedUpdate, IngestError> {
        let payload: serde_json::Value =
            serde_json::from_str(payload).map_err(|e| IngestError::InvalidJson(e.to_string()))?;
        self.submit_json(&payload).await
    }

    /// Submits a `{"key": ..., "record": ...}` payload. Other fields are ignored.
    pub async fn submit_json(
        &self,
        payload: &serde_json::Value,
    ) -> Result<AdmittedUpdate, IngestError> {
        if !payload.is_object() {
            return Err(IngestError::InvalidJson(
                "expected a JSON object".to_string(),
            ));
        }
        let key = string_field(payload, "key")?;
        let record = string_field(payload, "record")?;
        self.submit(key, record).await
    }

    /// Admits the update and enqueues it for publishing.
    pub async fn submit(&self, key: &str, record_b64: &str) -> Result<AdmittedUpdate, IngestError> {
        let update = self.validator.admit(key, record_b64)?;
        if self.freshness == FreshnessPolicy::Store {
            if let Some(current) = self.current_record(&update.key).await {
                Validator::check_freshness(&current, &update.decoded)?;
            }
        }

        let outcome = self.coordinator.enqueue(
            update.key.clone(),
            update.value.clone(),
            update.record.clone(),
        );
        let action = match outcome {
            EnqueueOutcome::Queued => "queued",
            EnqueueOutcome::Coalesced => "coalesced",
        };
        tracing::info!(
            "Admitted {} seq={} -> {}, {action}.",
            update.key.short(),
            update.decoded.sequence(),
            update.value
        );
        Ok(update)
    }

    /// The record currently in the store. Lookup failures count as none.
    async fn current_record(&self, key: &RecordKey) -> Option<IpnsRecord> {
        let path = key.path();
        let raw = match tokio::time::timeout(self.lookup_timeout, self.store.get(&path)).await {
            Ok(Ok(Some(raw))) => raw,
            Ok(Ok(None)) => return None,
            Ok(Err(e)) => {
                tracing::debug!("Failed to look up {}: {e}", key.short());
                return None;
            }
            Err(_) => {
                tracing::debug!(
                    "Looking up {} timed out after {:?}.",
                    key.short(),
                    self.lookup_timeout
                );
                return None;
            }
        };
        match IpnsRecord::decode(&raw) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::debug!("Ignoring undecodable record of {}: {e}", key.short());
                None
            }
        }
    }
}

fn string_field<'a>(
    payload: &'a serde_json::Value,
    name: &'static str,
) -> Result<&'a str, IngestError> {
    match payload.get(name) {
        None | Some(serde_json::Value::Null) => Err(IngestError::MissingField(name)),
        Some(serde_json::Value::String(value)) => Ok(value),
        Some(_) => Err(IngestError::InvalidField(name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        coordinator::CoordinatorSettings,
        test_utils::{MockStore, RecordFactory},
        verify::IpnsVerifier,
    };
    use base64::{engine::general_purpose::STANDARD, Engine};
    use bytes::Bytes;
    use serde_json::json;

    fn ingest(store: &MockStore, freshness: FreshnessPolicy) -> Ingest {
        let coordinator =
            Coordinator::new_with_settings(Arc::new(store.clone()), CoordinatorSettings::new());
        let mut settings = IngestSettings::new();
        settings
            .freshness(freshness)
            .lookup_timeout(Duration::from_secs(2));
        Ingest::new_with_settings(
            coordinator,
            Validator::new(Arc::new(IpnsVerifier::new())),
            settings,
        )
    }

    async fn wait_until_idle(ingest: &Ingest) {
        while !ingest.coordinator().is_idle() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn publishes_an_admitted_update() {
        let store = MockStore::new();
        let ingest = ingest(&store, FreshnessPolicy::Store);
        let factory = RecordFactory::new(1);
        let raw = factory.record(1).build();

        let payload = json!({
            "key": factory.key().as_str(),
            "value": "/ipfs/bafybeigdyrzt5sfp7udm7hu76uh7y26nf3efuylqabf3oclgtqy55fbzdi",
            "record": STANDARD.encode(&raw),
        });
        ingest.submit_json(&payload).await.unwrap();
        wait_until_idle(&ingest).await;

        let puts = store.puts();
        assert_eq!(puts.len(), 1);
        assert_eq!(puts[0].path, format!("/ipns/{}", factory.key().as_str()));
        assert_eq!(puts[0].record, Bytes::from(raw));
    }

    #[tokio::test]
    async fn back_to_back_updates_publish_once() {
        let store = MockStore::new();
        let ingest = ingest(&store, FreshnessPolicy::Store);
        let factory = RecordFactory::new(1);
        let key = factory.key();
        let r1 = factory.record(1).build_base64();
        let r2 = factory.record(2).build_base64();

        ingest.submit(key.as_str(), &r1).await.unwrap();
        let second = ingest.submit(key.as_str(), &r2).await.unwrap();
        wait_until_idle(&ingest).await;

        let puts = store.puts();
        assert_eq!(puts.len(), 1);
        assert_eq!(puts[0].record, second.record);
        assert_eq!(IpnsRecord::decode(&puts[0].record).unwrap().sequence(), 2);
    }

    #[tokio::test]
    async fn missing_fields() {
        let store = MockStore::new();
        let ingest = ingest(&store, FreshnessPolicy::Store);
        let factory = RecordFactory::new(1);

        let err = ingest
            .submit_json(&json!({ "key": factory.key().as_str() }))
            .await
            .unwrap_err();
        assert_eq!(err, IngestError::MissingField("record"));
        assert_eq!(err.to_string(), "JSON payload missing key 'record'");

        let err = ingest
            .submit_json(&json!({ "record": factory.record(1).build_base64() }))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "JSON payload missing key 'key'");

        let err = ingest
            .submit_json(&json!({ "key": 1, "record": "" }))
            .await
            .unwrap_err();
        assert_eq!(err, IngestError::InvalidField("key"));

        let err = ingest.submit_str("[1, 2]").await.unwrap_err();
        assert!(matches!(err, IngestError::InvalidJson(_)));

        assert_eq!(ingest.coordinator().pending_len(), 0);
        assert!(store.puts().is_empty());
    }

    #[tokio::test]
    async fn stale_update_is_not_enqueued() {
        let store = MockStore::new();
        let factory = RecordFactory::new(1);
        store.insert(&factory.key().path(), Bytes::from(factory.record(5).build()));
        let ingest = ingest(&store, FreshnessPolicy::Store);

        let err = ingest
            .submit(factory.key().as_str(), &factory.record(4).build_base64())
            .await
            .unwrap_err();
        assert_eq!(err.rejection(), Some(&RejectReason::StaleRecord));
        assert_eq!(ingest.coordinator().pending_len(), 0);

        ingest
            .submit(factory.key().as_str(), &factory.record(6).build_base64())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn disabled_freshness_skips_the_lookup() {
        let store = MockStore::new();
        let factory = RecordFactory::new(1);
        store.insert(&factory.key().path(), Bytes::from(factory.record(5).build()));
        let ingest = ingest(&store, FreshnessPolicy::Disabled);

        ingest
            .submit(factory.key().as_str(), &factory.record(4).build_base64())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn undecodable_current_record_is_ignored() {
        let store = MockStore::new();
        let factory = RecordFactory::new(1);
        store.insert(&factory.key().path(), Bytes::from_static(&[0xff, 0xff]));
        let ingest = ingest(&store, FreshnessPolicy::Store);

        ingest
            .submit(factory.key().as_str(), &factory.record(1).build_base64())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn slow_lookup_counts_as_no_record() {
        let store = MockStore::new();
        let factory = RecordFactory::new(1);
        store.insert(&factory.key().path(), Bytes::from(factory.record(5).build()));
        store.set_get_delay(Duration::from_secs(60));
        let ingest = ingest(&store, FreshnessPolicy::Store);

        ingest
            .submit(factory.key().as_str(), &factory.record(4).build_base64())
            .await
            .unwrap();
    }

    #[test]
    fn freshness_policy_names() {
        let policy: FreshnessPolicy = serde_json::from_str("\"disabled\"").unwrap();
        assert_eq!(policy, FreshnessPolicy::Disabled);
        assert_eq!(
            serde_json::to_string(&FreshnessPolicy::Store).unwrap(),
            "\"store\""
        );
    }
}
