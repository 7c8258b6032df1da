//! Inbound envelope routing.
//!
//! Everything encrypted arrives through one funnel: chat goes straight to
//! the pairwise session, group-key deliveries are forwarded to the active
//! call. An envelope with no matching session is reported as permanently
//! undecryptable instead of crashing the pipeline.

use std::sync::Arc;

use parking_lot::Mutex;

use murmur_crypto::{envelope, CryptoError, PairwiseSession};

use crate::error::CallError;
use crate::manager::{GroupKeyManager, KeyReceipt};
use crate::transport::MessageKind;

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub from_user: String,
    pub from_device: String,
    pub kind: MessageKind,
    pub envelope: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Chat {
        from_user: String,
        from_device: String,
        plaintext: Vec<u8>,
    },
    KeyAdopted {
        index: u64,
    },
    KeyIgnored {
        index: u64,
    },
    /// No session could decrypt this envelope; it is lost for good on this
    /// device. Surfaced so the UI can say so instead of showing nothing.
    Undecryptable {
        from_user: String,
        reason: String,
    },
}

pub struct InboundRouter {
    session: Arc<PairwiseSession>,
    active_call: Mutex<Option<Arc<GroupKeyManager>>>,
}

impl InboundRouter {
    pub fn new(session: Arc<PairwiseSession>) -> Self {
        Self {
            session,
            active_call: Mutex::new(None),
        }
    }

    /// Point group-key traffic at the current call, or detach it.
    pub fn set_active_call(&self, call: Option<Arc<GroupKeyManager>>) {
        *self.active_call.lock() = call;
    }

    pub async fn handle(&self, msg: InboundMessage) -> Result<InboundEvent, CallError> {
        match msg.kind {
            MessageKind::Chat => self.handle_chat(msg).await,
            MessageKind::GroupKey => self.handle_group_key(msg).await,
        }
    }

    async fn handle_chat(&self, msg: InboundMessage) -> Result<InboundEvent, CallError> {
        let result = if envelope::is_handshake(&msg.envelope) {
            self.session
                .accept_handshake(&msg.from_user, &msg.from_device, &msg.envelope)
                .await
        } else {
            self.session
                .decrypt_from(&msg.from_user, &msg.from_device, &msg.envelope)
                .await
        };

        match result {
            Ok(plaintext) => Ok(InboundEvent::Chat {
                from_user: msg.from_user,
                from_device: msg.from_device,
                plaintext,
            }),
            Err(err @ CryptoError::NoSession { .. }) => {
                tracing::warn!(from = %msg.from_user, "dropping undecryptable chat message");
                Ok(InboundEvent::Undecryptable {
                    from_user: msg.from_user,
                    reason: err.to_string(),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn handle_group_key(&self, msg: InboundMessage) -> Result<InboundEvent, CallError> {
        let call = self.active_call.lock().clone();
        let Some(call) = call else {
            tracing::warn!(from = %msg.from_user, "key delivery with no active call");
            return Ok(InboundEvent::Undecryptable {
                from_user: msg.from_user,
                reason: "no active call".to_string(),
            });
        };

        match call
            .receive_delivery(&msg.from_user, &msg.from_device, &msg.envelope)
            .await
        {
            Ok(KeyReceipt::Adopted { index }) => Ok(InboundEvent::KeyAdopted { index }),
            Ok(KeyReceipt::Ignored { index }) => Ok(InboundEvent::KeyIgnored { index }),
            Err(CallError::Crypto(err @ CryptoError::NoSession { .. })) => {
                tracing::warn!(from = %msg.from_user, "dropping undecryptable key delivery");
                Ok(InboundEvent::Undecryptable {
                    from_user: msg.from_user,
                    reason: err.to_string(),
                })
            }
            Err(err) => Err(err),
        }
    }
}
