//! Outward-facing capabilities: the signaling transport that carries
//! envelopes between devices, and the media pipeline that consumes call
//! keys.

use async_trait::async_trait;
use thiserror::Error;

use crate::group_key::GROUP_KEY_LEN;

#[derive(Debug, Error)]
#[error("transport send failed: {0}")]
pub struct TransportError(pub String);

/// What an envelope carries, so the receiving side can route it without
/// decrypting first. The payload itself stays opaque to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Chat,
    GroupKey,
}

/// Delivers an encrypted envelope to a specific remote device.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn send(
        &self,
        to_user: &str,
        to_device: &str,
        kind: MessageKind,
        envelope: &[u8],
    ) -> Result<(), TransportError>;
}

#[derive(Debug, Error)]
#[error("media sink rejected key: {0}")]
pub struct MediaSinkError(pub String);

/// Hands adopted call keys to the media encryption layer. Called with the
/// key index so the pipeline can label frames for late-keyed receivers.
pub trait MediaKeySink: Send + Sync {
    fn apply_key(&self, key: &[u8; GROUP_KEY_LEN], index: u64) -> Result<(), MediaSinkError>;
}
