//! The opaque crypto engine capability.
//!
//! All handshake arithmetic, ratcheting, and AEAD work happens behind
//! [`CryptoEngine`]; this crate only moves its opaque session-state bytes
//! between calls and the blob store. Key bytes crossing this boundary are
//! fixed-length blobs.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;

use crate::error::CryptoError;
use crate::prekeys::{OneTimePreKeyRecord, PreKeyBundle, SignedPreKeyRecord};

/// Wire length of identity and ephemeral public keys (curve point with a
/// leading type byte).
pub const PUBLIC_KEY_LEN: usize = 33;

/// A freshly generated long-term device identity.
pub struct GeneratedIdentity {
    pub public_key: Vec<u8>,
    pub private_key: Vec<u8>,
    pub registration_id: u32,
}

/// Pre-key material produced alongside a fresh identity. The records carry
/// the private halves; the caller persists them and uploads only the
/// public projections.
pub struct GeneratedBundle {
    pub signed: SignedPreKeyRecord,
    pub one_time: Vec<OneTimePreKeyRecord>,
}

/// Initiator-side handshake output: opaque session state plus the
/// ephemeral public key the responder needs to mirror the agreement.
pub struct InitiatorHandshake {
    pub session_state: Vec<u8>,
    pub ephemeral_public: Vec<u8>,
}

pub struct EncryptOutcome {
    pub ciphertext: Vec<u8>,
    pub updated_state: Vec<u8>,
}

pub struct DecryptOutcome {
    pub plaintext: Vec<u8>,
    pub updated_state: Vec<u8>,
}

/// Responder-side private material addressed by a handshake envelope.
pub struct ResponderKeys<'a> {
    pub identity_private: &'a [u8],
    pub signed_prekey_public: &'a [u8],
    pub signed_prekey_private: &'a [u8],
    pub one_time_prekey_private: Option<&'a [u8]>,
}

/// Initiator public material carried in a handshake envelope.
pub struct HandshakeHello<'a> {
    pub sender_identity: &'a [u8],
    pub sender_ephemeral: &'a [u8],
}

/// External provider of the cryptographic primitives.
///
/// Session state is opaque to callers: every encrypt/decrypt returns an
/// advanced state that must replace the previous one. One-time pre-keys in
/// a generated bundle are numbered `1..=count` so a device can re-derive
/// its public projection from the store alone.
#[async_trait]
pub trait CryptoEngine: Send + Sync {
    async fn generate_identity(&self) -> Result<GeneratedIdentity, CryptoError>;

    async fn generate_prekey_bundle(
        &self,
        identity_public: &[u8],
        identity_private: &[u8],
        registration_id: u32,
        one_time_count: u32,
    ) -> Result<GeneratedBundle, CryptoError>;

    /// Run the initiator side of the asynchronous handshake against a
    /// remote device's published bundle.
    async fn handshake_initiator(
        &self,
        remote_bundle: &PreKeyBundle,
        local_identity_private: &[u8],
    ) -> Result<InitiatorHandshake, CryptoError>;

    /// Mirror the agreement on the responder side, producing session state
    /// compatible with the initiator's.
    async fn handshake_responder(
        &self,
        local: ResponderKeys<'_>,
        remote: HandshakeHello<'_>,
    ) -> Result<Vec<u8>, CryptoError>;

    async fn encrypt(
        &self,
        session_state: &[u8],
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> Result<EncryptOutcome, CryptoError>;

    async fn decrypt(
        &self,
        session_state: &[u8],
        ciphertext: &[u8],
        associated_data: &[u8],
    ) -> Result<DecryptOutcome, CryptoError>;
}

/// Lazily initialized engine slot.
///
/// The engine loads on first use (it may be an expensive external module);
/// initialization is one-shot and safe against concurrent first callers. A
/// failed load leaves the cell empty so a later attempt can retry, but any
/// session operation issued before a successful load fails closed with
/// [`CryptoError::EngineNotReady`].
#[derive(Default)]
pub struct EngineCell {
    cell: OnceCell<Arc<dyn CryptoEngine>>,
}

impl EngineCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a cell around an already-initialized engine.
    pub fn preloaded(engine: Arc<dyn CryptoEngine>) -> Self {
        Self {
            cell: OnceCell::new_with(Some(engine)),
        }
    }

    /// Load the engine if it has not been loaded yet. Concurrent callers
    /// share a single load; a load failure is fatal for the caller but
    /// does not poison the cell.
    pub async fn init<F, Fut>(&self, load: F) -> Result<(), CryptoError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<dyn CryptoEngine>, CryptoError>>,
    {
        match self.cell.get_or_try_init(load).await {
            Ok(_) => Ok(()),
            Err(CryptoError::Init(msg)) => Err(CryptoError::Init(msg)),
            Err(other) => Err(CryptoError::Init(other.to_string())),
        }
    }

    pub fn get(&self) -> Result<&Arc<dyn CryptoEngine>, CryptoError> {
        self.cell.get().ok_or(CryptoError::EngineNotReady)
    }

    pub fn is_ready(&self) -> bool {
        self.cell.initialized()
    }
}
