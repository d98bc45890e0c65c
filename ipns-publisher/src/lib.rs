//!
//! Relays signed IPNS records to the DHT.
//!
//! Updates are admitted by the [Validator], coalesced per key by the
//! [Coordinator] and written to a [RecordStore] by the [Publisher].
//!

mod coordinator;
mod ingest;
mod key;
mod kubo;
mod publisher;
mod record;
mod store;
mod validator;
mod verify;

#[cfg(any(test, feature = "testing"))]
pub mod test_utils;

pub use coordinator::*;
pub use ingest::*;
pub use key::*;
pub use kubo::*;
pub use publisher::*;
pub use record::*;
pub use store::*;
pub use validator::*;
pub use verify::*;
