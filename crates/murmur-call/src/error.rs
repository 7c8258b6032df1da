use thiserror::Error;

use murmur_crypto::{CryptoError, StaleEpoch};

use crate::transport::{MediaSinkError, TransportError};

#[derive(Debug, Error)]
pub enum CallError {
    /// Delivering a call key to a peer failed even after retries. The peer
    /// is degraded, not the call: media continues for everyone else.
    #[error("key exchange with {peer} failed after {attempts} attempts: {reason}")]
    KeyExchange {
        peer: String,
        attempts: u32,
        reason: String,
    },

    #[error("call is closed")]
    Closed,

    #[error("malformed key delivery: {0}")]
    Delivery(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    MediaSink(#[from] MediaSinkError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Stale(#[from] StaleEpoch),
}
