//!
//! Record keys: the textual IPNS name and the Ed25519 public key it inlines.
//!
//! A name is a CID with the `libp2p-key` codec whose multihash is the identity
//! hash of a protobuf encoded libp2p public key.
//!

use std::{fmt, str::FromStr};

use cid::{multibase::Base, multihash::Multihash, Cid};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use prost::Message;

/// Multicodec code of `libp2p-key`.
pub const LIBP2P_KEY_CODEC: u64 = 0x72;
/// Multihash code of the identity "hash".
pub const IDENTITY_MULTIHASH: u64 = 0x00;
/// Namespace records are written under in the store.
pub const IPNS_NAMESPACE: &str = "ipns";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("invalid key")]
    InvalidEncoding,
    #[error("invalid key, expected: {expected} codec code but got: {found}")]
    WrongCodec { expected: u64, found: u64 },
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum KeyType {
    Rsa = 0,
    Ed25519 = 1,
    Secp256k1 = 2,
    Ecdsa = 3,
}

/// libp2p `PublicKey` protobuf message.
#[derive(Clone, PartialEq, prost::Message)]
struct PublicKeyProto {
    #[prost(enumeration = "KeyType", tag = "1")]
    key_type: i32,
    #[prost(bytes = "vec", tag = "2")]
    data: Vec<u8>,
}

/// An Ed25519 public key as used by libp2p.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    pub fn new(key: VerifyingKey) -> Self {
        Self(key)
    }

    /// Decodes a protobuf encoded libp2p public key.
    /// Only Ed25519 keys are supported.
    pub fn from_protobuf(bytes: &[u8]) -> Result<Self, KeyError> {
        let proto = PublicKeyProto::decode(bytes)
            .map_err(|e| KeyError::InvalidPublicKey(e.to_string()))?;
        match KeyType::try_from(proto.key_type) {
            Ok(KeyType::Ed25519) => {}
            Ok(other) => {
                return Err(KeyError::InvalidPublicKey(format!(
                    "unsupported key type {other:?}"
                )))
            }
            Err(e) => return Err(KeyError::InvalidPublicKey(e.to_string())),
        }
        let raw: [u8; 32] = proto.data.as_slice().try_into().map_err(|_| {
            KeyError::InvalidPublicKey(format!(
                "expected 32 byte ed25519 key, got {} bytes",
                proto.data.len()
            ))
        })?;
        let key =
            VerifyingKey::from_bytes(&raw).map_err(|e| KeyError::InvalidPublicKey(e.to_string()))?;
        Ok(Self(key))
    }

    /// Canonical protobuf encoding of the key.
    pub fn to_protobuf(&self) -> Vec<u8> {
        PublicKeyProto {
            key_type: KeyType::Ed25519 as i32,
            data: self.0.to_bytes().to_vec(),
        }
        .encode_to_vec()
    }

    /// Whether `signature` is a valid signature of `message` by this key.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        match Signature::from_slice(signature) {
            Ok(signature) => self.0.verify(message, &signature).is_ok(),
            Err(_) => false,
        }
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PublicKey").field(&self.0.as_bytes()).finish()
    }
}

/// The identifier of an IPNS name, e.g. `k51qzi5uqu5d...`.
///
/// Always held in its canonical base36 form, so a name written in base32 and
/// base36 is one key with one store path.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RecordKey {
    text: String,
    cid: Cid,
}

impl RecordKey {
    /// Parses any multibase encoded CID and checks it carries the `libp2p-key` codec.
    pub fn parse(text: &str) -> Result<Self, KeyError> {
        let cid = Cid::try_from(text).map_err(|_| KeyError::InvalidEncoding)?;
        if cid.codec() != LIBP2P_KEY_CODEC {
            return Err(KeyError::WrongCodec {
                expected: LIBP2P_KEY_CODEC,
                found: cid.codec(),
            });
        }
        Ok(Self {
            text: canonical_text(&cid),
            cid,
        })
    }

    /// Builds the base36 name of a public key.
    pub fn from_public_key(key: &PublicKey) -> Result<Self, KeyError> {
        let hash = Multihash::<64>::wrap(IDENTITY_MULTIHASH, &key.to_protobuf())
            .map_err(|e| KeyError::InvalidPublicKey(e.to_string()))?;
        let cid = Cid::new_v1(LIBP2P_KEY_CODEC, hash);
        Ok(Self {
            text: canonical_text(&cid),
            cid,
        })
    }

    /// Derives the public key from the inlined identity multihash.
    pub fn public_key(&self) -> Result<PublicKey, KeyError> {
        let hash = self.cid.hash();
        if hash.code() != IDENTITY_MULTIHASH {
            return Err(KeyError::InvalidPublicKey(format!(
                "multihash code {:#x} does not inline the key",
                hash.code()
            )));
        }
        PublicKey::from_protobuf(hash.digest())
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn cid(&self) -> &Cid {
        &self.cid
    }

    /// Store path of the record, `/ipns/<key>`.
    pub fn path(&self) -> String {
        format!("/{IPNS_NAMESPACE}/{}", self.text)
    }

    /// Shortened form for log lines.
    pub fn short(&self) -> String {
        shorten(&self.text)
    }
}

impl FromStr for RecordKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

fn canonical_text(cid: &Cid) -> String {
    cid.to_string_of_base(Base::Base36Lower)
        .unwrap_or_else(|_| cid.to_string())
}

/// `k51qzi5uqu5dhwvecw8o6...uigc6tlyu` becomes `k51qzi..c6tlyu`.
pub fn shorten(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= 14 {
        return s.to_string();
    }
    let head: String = chars[..6].iter().collect();
    let tail: String = chars[chars.len() - 6..].iter().collect();
    format!("{head}..{tail}")
}
