//!
//! IPNS record codec and the freshness comparator.
//!
//! Records are decoded into a strongly typed [IpnsRecord]. Decoding fails closed:
//! either every field is present and well formed or a [RecordError] is returned.
//!

use chrono::{DateTime, SecondsFormat, Utc};
use ciborium::value::{Integer, Value};
use prost::Message;

/// Maximum size of a serialized record.
pub const MAX_RECORD_SIZE: usize = 10 * 1024;

/// Prefix of the signed payload of a V2 signature.
pub const SIGNATURE_V2_PREFIX: &[u8] = b"ipns-signature:";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("record is {size} bytes, the maximum is {MAX_RECORD_SIZE}")]
    TooLarge { size: usize },
    #[error("invalid protobuf: {0}")]
    Protobuf(String),
    #[error("record is missing the {0} field")]
    MissingField(&'static str),
    #[error("unsupported validity type {0}")]
    UnsupportedValidityType(i64),
    #[error("invalid validity: {0}")]
    InvalidValidity(String),
    #[error("invalid signature data: {0}")]
    InvalidData(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ValidityType {
    /// Valid until the end of life timestamp in `validity`.
    Eol = 0,
}

/// `IpnsEntry` protobuf message.
#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct IpnsEntryProto {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub value: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub signature_v1: Option<Vec<u8>>,
    #[prost(enumeration = "ValidityType", optional, tag = "3")]
    pub validity_type: Option<i32>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub validity: Option<Vec<u8>>,
    #[prost(uint64, optional, tag = "5")]
    pub sequence: Option<u64>,
    #[prost(uint64, optional, tag = "6")]
    pub ttl: Option<u64>,
    #[prost(bytes = "vec", optional, tag = "7")]
    pub pub_key: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "8")]
    pub signature_v2: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "9")]
    pub data: Option<Vec<u8>>,
}

/// The DAG-CBOR document covered by the V2 signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureData {
    pub value: Vec<u8>,
    pub validity: Vec<u8>,
    pub validity_type: u64,
    pub sequence: u64,
    pub ttl: u64,
}

impl SignatureData {
    pub fn from_cbor(bytes: &[u8]) -> Result<Self, RecordError> {
        let document: Value = ciborium::de::from_reader(bytes)
            .map_err(|e| RecordError::InvalidData(e.to_string()))?;
        let Value::Map(entries) = document else {
            return Err(RecordError::InvalidData("expected a map".to_string()));
        };

        let mut value = None;
        let mut validity = None;
        let mut validity_type = None;
        let mut sequence = None;
        let mut ttl = None;
        for (name, field) in entries {
            let Value::Text(name) = name else {
                return Err(RecordError::InvalidData("map keys must be text".to_string()));
            };
            match name.as_str() {
                "Value" => value = Some(cbor_bytes(field, "Value")?),
                "Validity" => validity = Some(cbor_bytes(field, "Validity")?),
                "ValidityType" => validity_type = Some(cbor_u64(field, "ValidityType")?),
                "Sequence" => sequence = Some(cbor_u64(field, "Sequence")?),
                "TTL" => ttl = Some(cbor_u64(field, "TTL")?),
                // Unknown keys are allowed by the record format.
                _ => {}
            }
        }

        Ok(Self {
            value: value.ok_or(RecordError::MissingField("Value"))?,
            validity: validity.ok_or(RecordError::MissingField("Validity"))?,
            validity_type: validity_type.ok_or(RecordError::MissingField("ValidityType"))?,
            sequence: sequence.ok_or(RecordError::MissingField("Sequence"))?,
            ttl: ttl.ok_or(RecordError::MissingField("TTL"))?,
        })
    }

    /// Encodes the document with keys in DAG-CBOR order (length first, then bytewise).
    pub fn to_cbor(&self) -> Vec<u8> {
        let document = Value::Map(vec![
            (Value::Text("TTL".into()), Value::Integer(Integer::from(self.ttl))),
            (Value::Text("Value".into()), Value::Bytes(self.value.clone())),
            (
                Value::Text("Sequence".into()),
                Value::Integer(Integer::from(self.sequence)),
            ),
            (Value::Text("Validity".into()), Value::Bytes(self.validity.clone())),
            (
                Value::Text("ValidityType".into()),
                Value::Integer(Integer::from(self.validity_type)),
            ),
        ]);
        let mut bytes = Vec::new();
        // Writing into a Vec can't fail.
        let _ = ciborium::ser::into_writer(&document, &mut bytes);
        bytes
    }
}

fn cbor_bytes(value: Value, field: &'static str) -> Result<Vec<u8>, RecordError> {
    match value {
        Value::Bytes(bytes) => Ok(bytes),
        _ => Err(RecordError::InvalidData(format!("{field} must be bytes"))),
    }
}

fn cbor_u64(value: Value, field: &'static str) -> Result<u64, RecordError> {
    match value {
        Value::Integer(i) => u64::try_from(i)
            .map_err(|_| RecordError::InvalidData(format!("{field} out of range"))),
        _ => Err(RecordError::InvalidData(format!("{field} must be an integer"))),
    }
}

/// Parses the RFC3339 validity of a record, e.g. `2125-07-14T09:16:29.541000000Z`.
pub fn parse_validity(bytes: &[u8]) -> Result<DateTime<Utc>, RecordError> {
    let text = std::str::from_utf8(bytes).map_err(|e| RecordError::InvalidValidity(e.to_string()))?;
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RecordError::InvalidValidity(format!("{text}: {e}")))
}

/// Formats a validity the way go-ipns and js-ipns do.
pub fn format_validity(validity: &DateTime<Utc>) -> Vec<u8> {
    validity
        .to_rfc3339_opts(SecondsFormat::Nanos, true)
        .into_bytes()
}

/// A decoded IPNS record.
#[derive(Debug, Clone, PartialEq)]
pub struct IpnsRecord {
    pub(crate) value: Vec<u8>,
    pub(crate) validity: DateTime<Utc>,
    pub(crate) sequence: u64,
    pub(crate) ttl: Option<u64>,
    pub(crate) signature_v1: Vec<u8>,
    pub(crate) signature_v2: Vec<u8>,
    pub(crate) data: Option<SignatureData>,
    pub(crate) data_raw: Vec<u8>,
    pub(crate) embedded_public_key: Option<Vec<u8>>,
    pub(crate) proto: IpnsEntryProto,
    pub(crate) raw_len: usize,
}

impl IpnsRecord {
    /// Decodes a serialized record.
    pub fn decode(raw: &[u8]) -> Result<Self, RecordError> {
        if raw.len() > MAX_RECORD_SIZE {
            return Err(RecordError::TooLarge { size: raw.len() });
        }
        let proto =
            IpnsEntryProto::decode(raw).map_err(|e| RecordError::Protobuf(e.to_string()))?;

        let signature_v2 = proto.signature_v2.clone().unwrap_or_default();
        // The CBOR document is only covered by the V2 signature. Without one it is
        // ignored and the record is read like a legacy record.
        let data_raw = match proto.data.clone() {
            Some(data) if !signature_v2.is_empty() => data,
            _ => Vec::new(),
        };
        let data = if data_raw.is_empty() {
            None
        } else {
            Some(SignatureData::from_cbor(&data_raw)?)
        };

        // The signed CBOR document is authoritative, protobuf fields are read
        // for legacy records.
        let (value, validity_raw, validity_type, sequence, ttl) = match &data {
            Some(data) => (
                data.value.clone(),
                data.validity.clone(),
                data.validity_type as i64,
                data.sequence,
                Some(data.ttl),
            ),
            None => (
                proto.value.clone().ok_or(RecordError::MissingField("value"))?,
                proto
                    .validity
                    .clone()
                    .ok_or(RecordError::MissingField("validity"))?,
                proto.validity_type.unwrap_or(ValidityType::Eol as i32) as i64,
                proto.sequence.unwrap_or(0),
                proto.ttl,
            ),
        };
        if validity_type != ValidityType::Eol as i64 {
            return Err(RecordError::UnsupportedValidityType(validity_type));
        }
        let validity = parse_validity(&validity_raw)?;

        Ok(Self {
            value,
            validity,
            sequence,
            ttl,
            signature_v1: proto.signature_v1.clone().unwrap_or_default(),
            signature_v2,
            data,
            data_raw,
            embedded_public_key: proto.pub_key.clone().filter(|key| !key.is_empty()),
            proto,
            raw_len: raw.len(),
        })
    }

    /// The target of the name, e.g. `/ipfs/bafy...`.
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn value_string(&self) -> String {
        String::from_utf8_lossy(&self.value).into_owned()
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn validity(&self) -> DateTime<Utc> {
        self.validity
    }

    pub fn ttl(&self) -> Option<u64> {
        self.ttl
    }

    pub fn has_v2_signature(&self) -> bool {
        !self.signature_v2.is_empty() && self.data.is_some()
    }

    pub fn signature_v1(&self) -> &[u8] {
        &self.signature_v1
    }

    pub fn signature_v2(&self) -> &[u8] {
        &self.signature_v2
    }

    /// The protobuf encoded public key embedded in the record, if any.
    pub fn embedded_public_key(&self) -> Option<&[u8]> {
        self.embedded_public_key.as_deref()
    }

    /// Length of the serialized record.
    pub fn raw_len(&self) -> usize {
        self.raw_len
    }

    /// Payload covered by the V2 signature.
    pub(crate) fn signature_v2_payload(&self) -> Vec<u8> {
        let mut payload = SIGNATURE_V2_PREFIX.to_vec();
        payload.extend_from_slice(&self.data_raw);
        payload
    }

    /// Payload covered by the legacy V1 signature.
    pub(crate) fn signature_v1_payload(&self) -> Vec<u8> {
        let mut payload = self.proto.value.clone().unwrap_or_default();
        payload.extend_from_slice(self.proto.validity.as_deref().unwrap_or_default());
        payload.extend_from_slice(b"EOL");
        payload
    }

    /// Can `self` (current) be overwritten by `candidate`?
    pub fn can_be_overwritten_by(&self, candidate: &IpnsRecord) -> bool {
        can_overwrite(self, candidate)
    }
}

/// Can the current record be overwritten with the candidate?
///
/// V2 signed records always win over legacy ones. Otherwise the sequence number
/// decides, with validity and then serialized length breaking ties.
pub fn can_overwrite(current: &IpnsRecord, candidate: &IpnsRecord) -> bool {
    if current.has_v2_signature() && !candidate.has_v2_signature() {
        return false;
    }
    if candidate.has_v2_signature() && !current.has_v2_signature() {
        return true;
    }
    if candidate.sequence > current.sequence {
        return true;
    }
    if candidate.sequence == current.sequence {
        if candidate.validity > current.validity {
            return true;
        }
        return candidate.validity == current.validity && candidate.raw_len > current.raw_len;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(v2: bool, sequence: u64, validity_offset: i64, raw_len: usize) -> IpnsRecord {
        let base = DateTime::parse_from_rfc3339("2100-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let validity = base + Duration::seconds(validity_offset);
        let data = SignatureData {
            value: b"/ipfs/bafy".to_vec(),
            validity: format_validity(&validity),
            validity_type: 0,
            sequence,
            ttl: 0,
        };
        IpnsRecord {
            value: data.value.clone(),
            validity,
            sequence,
            ttl: Some(0),
            signature_v1: vec![1; 64],
            signature_v2: if v2 { vec![2; 64] } else { vec![] },
            data: v2.then(|| data.clone()),
            data_raw: if v2 { data.to_cbor() } else { vec![] },
            embedded_public_key: None,
            proto: IpnsEntryProto::default(),
            raw_len,
        }
    }

    #[test]
    fn comparator_is_the_lexicographic_order() {
        let mut all = vec![];
        for v2 in [false, true] {
            for sequence in 0..3 {
                for validity in 0..3 {
                    for len in 0..3 {
                        all.push(((v2, sequence, validity, len), record(v2, sequence, validity, 100 + len)));
                    }
                }
            }
        }

        for (current_key, current) in all.iter() {
            for (candidate_key, candidate) in all.iter() {
                assert_eq!(
                    can_overwrite(current, candidate),
                    candidate_key > current_key,
                    "current {current_key:?} candidate {candidate_key:?}"
                );
            }
        }
    }

    #[test]
    fn v2_dominates_higher_sequence() {
        let legacy = record(false, 10, 0, 100);
        let v2 = record(true, 1, 0, 100);
        assert!(can_overwrite(&legacy, &v2));
        assert!(!can_overwrite(&v2, &legacy));
    }

    #[test]
    fn equal_sequence_shorter_record_loses() {
        let current = record(true, 5, 0, 200);
        let candidate = record(true, 5, 0, 150);
        assert!(!can_overwrite(&current, &candidate));
        assert!(current.can_be_overwritten_by(&record(true, 5, 0, 201)));
    }

    #[test]
    fn identical_records_do_not_overwrite() {
        let current = record(true, 5, 0, 200);
        assert!(!can_overwrite(&current, &current.clone()));
    }

    #[test]
    fn signature_data_roundtrip() {
        let data = SignatureData {
            value: b"/ipfs/bafybeigdyrzt5sfp7udm7hu76uh7y26nf3efuylqabf3oclgtqy55fbzdi".to_vec(),
            validity: b"2125-07-14T09:16:29.541000000Z".to_vec(),
            validity_type: 0,
            sequence: 1,
            ttl: 3_600_000_000_000,
        };
        assert_eq!(SignatureData::from_cbor(&data.to_cbor()).unwrap(), data);
    }

    #[test]
    fn signature_data_requires_all_fields() {
        let document = Value::Map(vec![(Value::Text("Value".into()), Value::Bytes(vec![1]))]);
        let mut bytes = vec![];
        ciborium::ser::into_writer(&document, &mut bytes).unwrap();
        assert!(matches!(
            SignatureData::from_cbor(&bytes),
            Err(RecordError::MissingField(_))
        ));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            IpnsRecord::decode(&[0xff, 0xff, 0xff]),
            Err(RecordError::Protobuf(_))
        ));
        assert!(matches!(
            IpnsRecord::decode(&vec![0u8; MAX_RECORD_SIZE + 1]),
            Err(RecordError::TooLarge { .. })
        ));
    }

    #[test]
    fn decode_legacy_record() {
        let proto = IpnsEntryProto {
            value: Some(b"/ipfs/bafy".to_vec()),
            signature_v1: Some(vec![1; 64]),
            validity_type: Some(0),
            validity: Some(b"2125-07-14T09:16:29.541000000Z".to_vec()),
            sequence: Some(3),
            ..Default::default()
        };
        let raw = proto.encode_to_vec();
        let record = IpnsRecord::decode(&raw).unwrap();
        assert_eq!(record.sequence(), 3);
        assert_eq!(record.value(), b"/ipfs/bafy");
        assert!(!record.has_v2_signature());
        assert_eq!(record.raw_len(), raw.len());
    }

    #[test]
    fn unsigned_data_is_not_read() {
        let factory = crate::test_utils::RecordFactory::new(1);
        let forged_validity = Utc::now() + Duration::days(3650);
        let raw = factory
            .record(4)
            .value("/ipfs/signed")
            .unsigned_data("/ipfs/forged", 1_000_000, forged_validity)
            .build();
        let forged = IpnsRecord::decode(&raw).unwrap();
        assert!(!forged.has_v2_signature());
        assert_eq!(forged.value(), b"/ipfs/signed");
        assert_eq!(forged.sequence(), 4);
        assert_ne!(forged.validity(), forged_validity);

        let current = IpnsRecord::decode(&factory.record(5).legacy().build()).unwrap();
        assert!(!can_overwrite(&current, &forged));
    }

    #[test]
    fn v2_signature_without_data_decodes_as_legacy() {
        let factory = crate::test_utils::RecordFactory::new(1);
        let record = IpnsRecord::decode(&factory.record(6).without_data().build()).unwrap();
        assert!(!record.has_v2_signature());
        assert_eq!(record.sequence(), 6);
        assert_eq!(record.ttl(), Some(3_600_000_000_000));
    }

    #[test]
    fn decode_rejects_bad_validity() {
        let proto = IpnsEntryProto {
            value: Some(b"/ipfs/bafy".to_vec()),
            validity: Some(b"tomorrow".to_vec()),
            ..Default::default()
        };
        assert!(matches!(
            IpnsRecord::decode(&proto.encode_to_vec()),
            Err(RecordError::InvalidValidity(_))
        ));
    }
}
