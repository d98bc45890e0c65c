//!
//! Signature and validity verification of IPNS records.
//!

use chrono::{DateTime, Utc};

use crate::{
    key::PublicKey,
    record::{IpnsRecord, RecordError},
};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("record signature verification failed")]
    InvalidSignatureV2,
    #[error("legacy record signature verification failed")]
    InvalidSignatureV1,
    #[error("record has no signature")]
    MissingSignature,
    #[error("field \"{0}\" did not match between protobuf and CBOR")]
    FieldMismatch(&'static str),
    #[error("record has expired at {0}")]
    Expired(DateTime<Utc>),
    #[error(transparent)]
    Record(#[from] RecordError),
}

/// Validates a serialized record against the public key of its name.
pub trait RecordVerifier: Send + Sync {
    fn validate(&self, public_key: &PublicKey, raw: &[u8]) -> Result<(), VerifyError>;
}

#[derive(Debug, Clone, Copy, Default)]
enum Clock {
    #[default]
    System,
    Fixed(DateTime<Utc>),
}

/// Ed25519 verifier following the IPNS record validation rules.
///
/// - A V2 signature covers `"ipns-signature:" || data` and the protobuf fields
///   present must match the signed CBOR document.
/// - Records without a V2 signature fall back to the legacy V1 signature over
///   `value || validity || "EOL"`.
/// - The validity must lie in the future.
#[derive(Debug, Clone, Default)]
pub struct IpnsVerifier {
    clock: Clock,
}

impl IpnsVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Verifier that checks expiry against a fixed point in time.
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            clock: Clock::Fixed(now),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        match self.clock {
            Clock::System => Utc::now(),
            Clock::Fixed(now) => now,
        }
    }

    fn check_fields_match(record: &IpnsRecord) -> Result<(), VerifyError> {
        let (Some(data), proto) = (&record.data, &record.proto) else {
            return Ok(());
        };
        if proto.value.as_ref().is_some_and(|value| *value != data.value) {
            return Err(VerifyError::FieldMismatch("value"));
        }
        if proto
            .validity
            .as_ref()
            .is_some_and(|validity| *validity != data.validity)
        {
            return Err(VerifyError::FieldMismatch("validity"));
        }
        if proto
            .validity_type
            .is_some_and(|validity_type| validity_type as u64 != data.validity_type)
        {
            return Err(VerifyError::FieldMismatch("validityType"));
        }
        if proto.sequence.is_some_and(|sequence| sequence != data.sequence) {
            return Err(VerifyError::FieldMismatch("sequence"));
        }
        if proto.ttl.is_some_and(|ttl| ttl != data.ttl) {
            return Err(VerifyError::FieldMismatch("ttl"));
        }
        Ok(())
    }
}

impl RecordVerifier for IpnsVerifier {
    fn validate(&self, public_key: &PublicKey, raw: &[u8]) -> Result<(), VerifyError> {
        let record = IpnsRecord::decode(raw)?;

        if record.has_v2_signature() {
            if !public_key.verify(&record.signature_v2_payload(), record.signature_v2()) {
                return Err(VerifyError::InvalidSignatureV2);
            }
            Self::check_fields_match(&record)?;
        } else if record.signature_v1().is_empty() {
            return Err(VerifyError::MissingSignature);
        } else if !public_key.verify(&record.signature_v1_payload(), record.signature_v1()) {
            return Err(VerifyError::InvalidSignatureV1);
        }

        if record.validity() <= self.now() {
            return Err(VerifyError::Expired(record.validity()));
        }
        Ok(())
    }
}
