//! Group call key management for Murmur: deterministic key-holder
//! election, call key generation and rotation, retried delivery through
//! pairwise encrypted sessions, and inbound message routing.
//!
//! Builds on [`murmur_crypto`] for the pairwise sessions that carry key
//! deliveries; this crate owns everything call-scoped.

pub mod error;
pub mod group_key;
pub mod leader;
pub mod manager;
pub mod retry;
pub mod router;
pub mod transport;

pub use error::CallError;
pub use group_key::{GroupKey, KeyDelivery, GROUP_KEY_LEN};
pub use leader::elect_holder;
pub use manager::{GroupKeyManager, KeyReceipt};
pub use retry::{retry_with_backoff, RetryPolicy};
pub use router::{InboundEvent, InboundMessage, InboundRouter};
pub use transport::{
    MediaKeySink, MediaSinkError, MessageKind, SignalingTransport, TransportError,
};
