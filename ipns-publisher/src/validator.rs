//!
//! Admission of record updates: decides whether an update may be published.
//!

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;

use crate::{
    key::{KeyError, PublicKey, RecordKey},
    record::{IpnsRecord, RecordError},
    verify::{IpnsVerifier, RecordVerifier},
};

/// Why an update was not admitted.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    #[error("invalid key")]
    InvalidKeyEncoding,
    #[error("invalid key, expected: {expected} codec code but got: {found}")]
    WrongKeyCodec { expected: u64, found: u64 },
    #[error("invalid record encoding: {0}")]
    InvalidEncoding(String),
    #[error("invalid ipns entry: {0}")]
    MalformedRecord(RecordError),
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),
    #[error("invalid ipns entry: {0}")]
    SignatureInvalid(String),
    #[error("embedded public key did not match the key of the name")]
    EmbeddedKeyMismatch,
    #[error("supplied record is older or has lower sequence number than existing record")]
    StaleRecord,
}

impl RejectReason {
    pub fn is_embedded_key_mismatch(&self) -> bool {
        matches!(self, RejectReason::EmbeddedKeyMismatch)
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, RejectReason::StaleRecord)
    }
}

impl From<KeyError> for RejectReason {
    fn from(e: KeyError) -> Self {
        match e {
            KeyError::InvalidEncoding => RejectReason::InvalidKeyEncoding,
            KeyError::WrongCodec { expected, found } => {
                RejectReason::WrongKeyCodec { expected, found }
            }
            KeyError::InvalidPublicKey(message) => RejectReason::InvalidPublicKey(message),
        }
    }
}

/// An update that passed admission.
#[derive(Debug, Clone)]
pub struct AdmittedUpdate {
    pub key: RecordKey,
    /// The record value as text, e.g. `/ipfs/bafy...`.
    pub value: String,
    /// The serialized record exactly as submitted.
    pub record: Bytes,
    pub decoded: IpnsRecord,
}

/// Validates keys and records of incoming updates. Has no side effects.
#[derive(Clone)]
pub struct Validator {
    verifier: Arc<dyn RecordVerifier>,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(Arc::new(IpnsVerifier::new()))
    }
}

impl Validator {
    pub fn new(verifier: Arc<dyn RecordVerifier>) -> Self {
        Self { verifier }
    }

    /// Admits an update without comparing it to a previous record.
    pub fn admit(&self, key: &str, record_b64: &str) -> Result<AdmittedUpdate, RejectReason> {
        self.admit_over(key, record_b64, None)
    }

    /// Admits an update that must also win over `current` if given.
    pub fn admit_over(
        &self,
        key: &str,
        record_b64: &str,
        current: Option<&IpnsRecord>,
    ) -> Result<AdmittedUpdate, RejectReason> {
        let key = RecordKey::parse(key)?;

        let raw = STANDARD
            .decode(record_b64)
            .map_err(|e| RejectReason::InvalidEncoding(e.to_string()))?;
        let decoded = IpnsRecord::decode(&raw).map_err(RejectReason::MalformedRecord)?;

        let public_key = key.public_key()?;
        self.verifier
            .validate(&public_key, &raw)
            .map_err(|e| RejectReason::SignatureInvalid(e.to_string()))?;
        Self::check_embedded_key(&public_key, &decoded)?;

        if let Some(current) = current {
            Self::check_freshness(current, &decoded)?;
        }

        Ok(AdmittedUpdate {
            value: decoded.value_string(),
            key,
            record: Bytes::from(raw),
            decoded,
        })
    }

    /// An embedded key must have the same canonical encoding as the key of the name.
    fn check_embedded_key(public_key: &PublicKey, record: &IpnsRecord) -> Result<(), RejectReason> {
        let Some(embedded) = record.embedded_public_key() else {
            return Ok(());
        };
        match PublicKey::from_protobuf(embedded) {
            Ok(embedded) if embedded.to_protobuf() == public_key.to_protobuf() => Ok(()),
            _ => Err(RejectReason::EmbeddedKeyMismatch),
        }
    }

    /// The candidate must be allowed to overwrite the current record.
    pub fn check_freshness(current: &IpnsRecord, candidate: &IpnsRecord) -> Result<(), RejectReason> {
        if current.can_be_overwritten_by(candidate) {
            Ok(())
        } else {
            Err(RejectReason::StaleRecord)
        }
    }
}
