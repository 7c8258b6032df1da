use thiserror::Error;

use crate::epoch::StaleEpoch;

#[derive(Debug, Error)]
pub enum CryptoError {
    /// The crypto engine capability failed to initialize. Fatal and
    /// blocking: no encrypted operation may proceed past this point.
    #[error("crypto engine failed to initialize: {0}")]
    Init(String),

    #[error("crypto engine not initialized")]
    EngineNotReady,

    #[error("engine operation failed: {0}")]
    Engine(String),

    /// No pre-key bundle published for the target. The message was not
    /// sent; the caller may retry once the target has published keys.
    #[error("no pre-key bundle published for {user}/{device}")]
    NoBundle { user: String, device: String },

    /// No session exists for an incoming envelope. The message is
    /// permanently undecryptable on this device.
    #[error("no session with {user}/{device}")]
    NoSession { user: String, device: String },

    #[error("no local identity installed")]
    NoIdentity,

    #[error("signed pre-key {0} not found")]
    MissingSignedPreKey(u32),

    #[error("one-time pre-key {0} not found")]
    MissingOneTimePreKey(u32),

    #[error("key storage error: {0}")]
    Storage(String),

    #[error("directory error: {0}")]
    Directory(String),

    #[error("malformed envelope: {0}")]
    Envelope(String),

    #[error("record serialization failed: {0}")]
    Serialization(String),

    #[error(transparent)]
    Stale(#[from] StaleEpoch),
}

impl From<serde_json::Error> for CryptoError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
