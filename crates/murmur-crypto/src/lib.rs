//! Cryptographic session orchestration for Murmur: device identity
//! bootstrap, pre-key bundle publishing, and pairwise forward-secret
//! sessions between any two devices.
//!
//! The raw primitives (handshake arithmetic, ratchet, AEAD) live behind the
//! [`CryptoEngine`] capability; this crate owns the protocol state machines
//! around them and the persistence of session state. There is no
//! unencrypted fallback anywhere in this crate: if the engine is missing or
//! fails to initialize, every operation fails.

pub mod context;
pub mod directory;
pub mod engine;
pub mod envelope;
pub mod epoch;
pub mod error;
pub mod identity;
pub mod memory;
pub mod prekeys;
pub mod session;
pub mod store;

#[cfg(any(test, feature = "test-engine"))]
pub mod test_engine;

pub use context::{DeviceContext, DEFAULT_DEVICE_ID};
pub use directory::Directory;
pub use engine::{CryptoEngine, EngineCell};
pub use epoch::{ConnectionEpoch, EpochToken, StaleEpoch};
pub use error::CryptoError;
pub use identity::ensure_identity;
pub use memory::{MemoryBlobStore, MemoryDirectory};
pub use prekeys::{PreKeyBundle, PreKeyUpload};
pub use session::PairwiseSession;
pub use store::{KeyedBlobStore, Partition, SignalStore};
