//!
//! Deterministic records and an in-memory store for tests.
//!

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signer, SigningKey};
use futures_util::Stream;
use prost::Message;
use tokio_util::sync::CancellationToken;

use crate::{
    key::{PublicKey, RecordKey},
    record::{format_validity, IpnsEntryProto, SignatureData, ValidityType, SIGNATURE_V2_PREFIX},
    store::{QueryEvent, QueryEventStream, RecordStore, StoreError},
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Signs records with a keypair derived from a seed byte.
#[derive(Debug, Clone)]
pub struct RecordFactory {
    signing_key: SigningKey,
}

impl RecordFactory {
    pub fn new(seed: u8) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&[seed; 32]),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::new(self.signing_key.verifying_key())
    }

    /// The base36 name of the key.
    pub fn key(&self) -> RecordKey {
        RecordKey::from_public_key(&self.public_key()).expect("ed25519 keys are inlined")
    }

    pub fn record(&self, sequence: u64) -> RecordBuilder<'_> {
        RecordBuilder {
            factory: self,
            sequence,
            value: "/ipfs/bafybeigdyrzt5sfp7udm7hu76uh7y26nf3efuylqabf3oclgtqy55fbzdi".to_string(),
            validity: Utc::now() + chrono::Duration::days(365),
            ttl: 3_600_000_000_000,
            legacy: false,
            corrupt_signature: false,
            protobuf_value: None,
            embedded_public_key: None,
            unsigned_data: None,
            without_data: false,
        }
    }
}

pub struct RecordBuilder<'a> {
    factory: &'a RecordFactory,
    sequence: u64,
    value: String,
    validity: DateTime<Utc>,
    ttl: u64,
    legacy: bool,
    corrupt_signature: bool,
    protobuf_value: Option<String>,
    embedded_public_key: Option<Vec<u8>>,
    unsigned_data: Option<SignatureData>,
    without_data: bool,
}

impl RecordBuilder<'_> {
    pub fn value(mut self, value: &str) -> Self {
        self.value = value.to_string();
        self
    }

    pub fn validity(mut self, validity: DateTime<Utc>) -> Self {
        self.validity = validity;
        self
    }

    /// Only sign with the V1 signature, without signed CBOR data.
    pub fn legacy(mut self) -> Self {
        self.legacy = true;
        self
    }

    /// Flip a bit in the signature.
    pub fn corrupt_signature(mut self) -> Self {
        self.corrupt_signature = true;
        self
    }

    /// Put a different value in the protobuf than in the signed data.
    pub fn protobuf_value(mut self, value: &str) -> Self {
        self.protobuf_value = Some(value.to_string());
        self
    }

    /// Embed a protobuf encoded public key.
    pub fn embed_public_key(mut self, key: Vec<u8>) -> Self {
        self.embedded_public_key = Some(key);
        self
    }

    /// A legacy record that also carries a CBOR document nobody signed.
    pub fn unsigned_data(mut self, value: &str, sequence: u64, validity: DateTime<Utc>) -> Self {
        self.legacy = true;
        self.unsigned_data = Some(SignatureData {
            value: value.as_bytes().to_vec(),
            validity: format_validity(&validity),
            validity_type: ValidityType::Eol as u64,
            sequence,
            ttl: self.ttl,
        });
        self
    }

    /// Keep the V2 signature but leave the signed CBOR document out.
    pub fn without_data(mut self) -> Self {
        self.without_data = true;
        self
    }

    pub fn build(self) -> Vec<u8> {
        let validity = format_validity(&self.validity);
        let value = self.value.into_bytes();

        let mut v1_payload = value.clone();
        v1_payload.extend_from_slice(&validity);
        v1_payload.extend_from_slice(b"EOL");
        let mut signature_v1 = self.factory.signing_key.sign(&v1_payload).to_vec();

        let mut proto = IpnsEntryProto {
            value: Some(self.protobuf_value.map(String::into_bytes).unwrap_or(value.clone())),
            signature_v1: None,
            validity_type: Some(ValidityType::Eol as i32),
            validity: Some(validity.clone()),
            sequence: Some(self.sequence),
            ttl: Some(self.ttl),
            pub_key: self.embedded_public_key,
            signature_v2: None,
            data: None,
        };

        if self.legacy {
            if self.corrupt_signature {
                signature_v1[0] ^= 1;
            }
            proto.data = self.unsigned_data.map(|data| data.to_cbor());
        } else {
            let data = SignatureData {
                value,
                validity,
                validity_type: ValidityType::Eol as u64,
                sequence: self.sequence,
                ttl: self.ttl,
            }
            .to_cbor();
            let mut v2_payload = SIGNATURE_V2_PREFIX.to_vec();
            v2_payload.extend_from_slice(&data);
            let mut signature_v2 = self.factory.signing_key.sign(&v2_payload).to_vec();
            if self.corrupt_signature {
                signature_v2[0] ^= 1;
            }
            proto.signature_v2 = Some(signature_v2);
            proto.data = (!self.without_data).then_some(data);
        }
        proto.signature_v1 = Some(signature_v1);
        proto.encode_to_vec()
    }

    pub fn build_base64(self) -> String {
        STANDARD.encode(self.build())
    }
}

/// A write seen by the [MockStore].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutCall {
    pub path: String,
    pub record: Bytes,
}

#[derive(Debug, Default)]
struct Activity {
    per_path: HashMap<String, usize>,
    total: usize,
    max_total: usize,
    max_per_path: usize,
}

#[derive(Debug, Default)]
struct Inner {
    puts: Mutex<Vec<PutCall>>,
    records: Mutex<HashMap<String, Bytes>>,
    activity: Mutex<Activity>,
    delay: Mutex<Duration>,
    path_delays: Mutex<HashMap<String, Duration>>,
    get_delay: Mutex<Duration>,
    failure: Mutex<Option<StoreError>>,
}

impl Inner {
    fn put_delay(&self, path: &str) -> Duration {
        lock(&self.path_delays)
            .get(path)
            .copied()
            .unwrap_or_else(|| *lock(&self.delay))
    }
}

/// Marks a write as in flight until dropped.
struct ActiveGuard {
    inner: Arc<Inner>,
    path: String,
}

impl ActiveGuard {
    fn enter(inner: Arc<Inner>, path: &str) -> Self {
        {
            let mut activity = lock(&inner.activity);
            activity.total += 1;
            activity.max_total = activity.max_total.max(activity.total);
            let count = activity.per_path.entry(path.to_string()).or_default();
            *count += 1;
            let count = *count;
            activity.max_per_path = activity.max_per_path.max(count);
        }
        Self {
            inner,
            path: path.to_string(),
        }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let mut activity = lock(&self.inner.activity);
        activity.total -= 1;
        if let Some(count) = activity.per_path.get_mut(&self.path) {
            *count -= 1;
        }
    }
}

fn put_events(
    inner: Arc<Inner>,
    path: String,
    record: Bytes,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<QueryEvent, StoreError>> + Send {
    async_stream::try_stream! {
        let _active = ActiveGuard::enter(inner.clone(), &path);
        lock(&inner.puts).push(PutCall {
            path: path.clone(),
            record: record.clone(),
        });
        yield QueryEvent::SendingQuery {
            to: "12D3KooWMockPeerA".to_string(),
        };

        let delay = inner.put_delay(&path);
        if !delay.is_zero() {
            cancel
                .run_until_cancelled(tokio::time::sleep(delay))
                .await
                .ok_or(StoreError::Cancelled)?;
        }
        let failure = lock(&inner.failure).clone();
        if let Some(e) = failure {
            Err::<(), _>(e)?;
        }

        lock(&inner.records).insert(path, record);
        yield QueryEvent::FinalPeer {
            from: "12D3KooWMockPeerB".to_string(),
        };
    }
}

/// In-memory [RecordStore] that records every write.
#[derive(Debug, Clone, Default)]
pub struct MockStore {
    inner: Arc<Inner>,
}

impl MockStore {
    /// Events yielded by a successful put.
    pub const EVENTS_PER_PUT: usize = 2;

    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every write by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.inner.delay) = delay;
    }

    /// Delay writes to `path` by `delay`.
    pub fn set_path_delay(&self, path: &str, delay: Duration) {
        lock(&self.inner.path_delays).insert(path.to_string(), delay);
    }

    /// Delay every read by `delay`.
    pub fn set_get_delay(&self, delay: Duration) {
        *lock(&self.inner.get_delay) = delay;
    }

    /// Fail every write with `error`.
    pub fn fail_with(&self, error: StoreError) {
        *lock(&self.inner.failure) = Some(error);
    }

    /// Store a record that reads return.
    pub fn insert(&self, path: &str, record: Bytes) {
        lock(&self.inner.records).insert(path.to_string(), record);
    }

    pub fn record(&self, path: &str) -> Option<Bytes> {
        lock(&self.inner.records).get(path).cloned()
    }

    pub fn puts(&self) -> Vec<PutCall> {
        lock(&self.inner.puts).clone()
    }

    pub fn puts_for(&self, path: &str) -> Vec<PutCall> {
        self.puts().into_iter().filter(|put| put.path == path).collect()
    }

    /// Writes currently in flight.
    pub fn active(&self) -> usize {
        lock(&self.inner.activity).total
    }

    /// Highest number of writes in flight at once.
    pub fn max_active(&self) -> usize {
        lock(&self.inner.activity).max_total
    }

    /// Highest number of writes to the same path in flight at once.
    pub fn max_active_per_path(&self) -> usize {
        lock(&self.inner.activity).max_per_path
    }
}

#[async_trait::async_trait]
impl RecordStore for MockStore {
    fn put(&self, path: &str, record: Bytes, cancel: CancellationToken) -> QueryEventStream {
        Box::pin(put_events(
            self.inner.clone(),
            path.to_string(),
            record,
            cancel,
        ))
    }

    async fn get(&self, path: &str) -> Result<Option<Bytes>, StoreError> {
        let delay = *lock(&self.inner.get_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(self.record(path))
    }
}
