//! Per-call key lifecycle: generation, distribution, rotation, adoption.
//!
//! One manager per joined call. The first participant to connect alone
//! creates the key; when someone joins, every participant that holds a key
//! delivers it through a pairwise session, and the strictly-greater index
//! rule makes the duplicates harmless. Departures rotate the key so the
//! leaver cannot decrypt future media, with only the elected holder (see
//! [`crate::leader`]) rotating to avoid competing keys. A failed delivery
//! degrades that one peer instead of failing the call.

use std::collections::BTreeSet;
use std::sync::Arc;

use murmur_crypto::envelope;
use murmur_crypto::{ConnectionEpoch, EpochToken, PairwiseSession, DEFAULT_DEVICE_ID};

use crate::error::CallError;
use crate::group_key::{GroupKey, KeyDelivery};
use crate::leader::elect_holder;
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::transport::{MediaKeySink, MessageKind, SignalingTransport};

/// Outcome of an inbound key delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyReceipt {
    Adopted { index: u64 },
    Ignored { index: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    NoKey,
    HasKey,
    Closed,
}

struct CallState {
    phase: Phase,
    current: Option<GroupKey>,
    participants: BTreeSet<String>,
    degraded: BTreeSet<String>,
}

pub struct GroupKeyManager {
    channel_id: String,
    session: Arc<PairwiseSession>,
    transport: Arc<dyn SignalingTransport>,
    sink: Arc<dyn MediaKeySink>,
    policy: RetryPolicy,
    epoch: ConnectionEpoch,
    state: tokio::sync::Mutex<CallState>,
}

impl GroupKeyManager {
    pub fn new(
        channel_id: impl Into<String>,
        session: Arc<PairwiseSession>,
        transport: Arc<dyn SignalingTransport>,
        sink: Arc<dyn MediaKeySink>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            session,
            transport,
            sink,
            policy,
            epoch: ConnectionEpoch::new(),
            state: tokio::sync::Mutex::new(CallState {
                phase: Phase::NoKey,
                current: None,
                participants: BTreeSet::new(),
                degraded: BTreeSet::new(),
            }),
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// The epoch guarding this call's commits. Advancing it (directly or
    /// via [`GroupKeyManager::close`]) strands every in-flight operation.
    pub fn epoch(&self) -> &ConnectionEpoch {
        &self.epoch
    }

    fn local_user(&self) -> &str {
        self.session.context().user_id()
    }

    pub async fn current_index(&self) -> Option<u64> {
        self.state.lock().await.current.as_ref().map(GroupKey::index)
    }

    /// Peers that never acknowledged a key delivery. They stay in the call
    /// but cannot decrypt media keyed since their last good delivery.
    pub async fn degraded_peers(&self) -> Vec<String> {
        self.state.lock().await.degraded.iter().cloned().collect()
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.phase == Phase::Closed
    }

    /// Install the initial roster. A participant connecting alone creates
    /// the call key (index 0); anyone connecting into an existing call
    /// waits for a delivery instead of minting a competing key.
    pub async fn on_connected(&self, participants: &[String]) -> Result<(), CallError> {
        let mut st = self.state.lock().await;
        ensure_open(&st)?;

        st.participants = participants.iter().cloned().collect();
        st.participants.insert(self.local_user().to_string());

        if st.participants.len() > 1 || st.current.is_some() {
            return Ok(());
        }

        let key = GroupKey::generate(0);
        self.sink.apply_key(key.material(), key.index())?;
        st.current = Some(key);
        st.phase = Phase::HasKey;
        tracing::info!(channel = %self.channel_id, index = 0, "created call key");
        Ok(())
    }

    /// A peer joined: every participant that holds a key sends it to them.
    /// The duplicates this produces are idempotent on the receiving side,
    /// and a participant still waiting for its own key stays quiet.
    pub async fn on_participant_joined(&self, user: &str) -> Result<(), CallError> {
        let token = self.epoch.token();
        let key = {
            let mut st = self.state.lock().await;
            ensure_open(&st)?;

            st.participants.insert(user.to_string());
            match &st.current {
                Some(key) => key.clone(),
                None => return Ok(()),
            }
        };

        self.distribute(&key, &[user.to_string()], &token).await;
        Ok(())
    }

    /// A peer left: the holder rotates to a fresh key the leaver never saw,
    /// applies it to local media immediately, then fans it out. Each
    /// delivery retries independently; a peer that cannot be reached is
    /// degraded rather than blocking the others.
    pub async fn on_participant_left(&self, user: &str) -> Result<(), CallError> {
        let token = self.epoch.token();
        let (key, targets) = {
            let mut st = self.state.lock().await;
            ensure_open(&st)?;

            st.participants.remove(user);
            st.degraded.remove(user);

            let is_holder =
                elect_holder(st.participants.iter().map(String::as_str)) == Some(self.local_user());
            if !is_holder {
                return Ok(());
            }

            let next_index = st.current.as_ref().map_or(0, |k| k.index() + 1);
            let key = GroupKey::generate(next_index);
            // Local media first so our own frames never stall on delivery.
            self.sink.apply_key(key.material(), key.index())?;
            st.current = Some(key.clone());
            st.phase = Phase::HasKey;
            tracing::info!(
                channel = %self.channel_id,
                index = key.index(),
                departed = %user,
                "rotated call key after departure"
            );
            (key, self.remote_targets(&st))
        };

        self.distribute(&key, &targets, &token).await;
        Ok(())
    }

    /// Handle an inbound key delivery envelope from a peer.
    ///
    /// Adopts the carried key only when its index is strictly above the
    /// current one; an equal or lower index is ignored, which makes
    /// duplicate and out-of-order deliveries harmless. Deliveries for other
    /// channels are ignored too.
    pub async fn receive_delivery(
        &self,
        from_user: &str,
        from_device: &str,
        raw: &[u8],
    ) -> Result<KeyReceipt, CallError> {
        let token = self.epoch.token();
        {
            let st = self.state.lock().await;
            ensure_open(&st)?;
        }

        let plaintext = if envelope::is_handshake(raw) {
            self.session.accept_handshake(from_user, from_device, raw).await?
        } else {
            self.session.decrypt_from(from_user, from_device, raw).await?
        };

        let delivery = KeyDelivery::from_bytes(&plaintext)?;
        if delivery.channel_id != self.channel_id {
            tracing::warn!(
                channel = %self.channel_id,
                delivered_for = %delivery.channel_id,
                from = %from_user,
                "ignoring key delivery for another channel"
            );
            return Ok(KeyReceipt::Ignored { index: delivery.index });
        }
        let index = delivery.index;
        let key = delivery.into_key()?;

        // Decrypting took time; re-check the call under the lock before
        // committing anything.
        let mut st = self.state.lock().await;
        ensure_open(&st)?;
        token.ensure_fresh()?;

        if st.current.as_ref().is_some_and(|cur| index <= cur.index()) {
            tracing::debug!(
                channel = %self.channel_id,
                index,
                current = st.current.as_ref().map(GroupKey::index),
                "ignoring stale key delivery"
            );
            return Ok(KeyReceipt::Ignored { index });
        }

        self.sink.apply_key(key.material(), index)?;
        st.current = Some(key);
        st.phase = Phase::HasKey;
        tracing::info!(channel = %self.channel_id, index, from = %from_user, "adopted call key");
        Ok(KeyReceipt::Adopted { index })
    }

    /// Leave the call: strand in-flight work and discard key material.
    pub async fn close(&self) {
        self.epoch.advance();
        let mut st = self.state.lock().await;
        st.phase = Phase::Closed;
        st.current = None;
        st.participants.clear();
        st.degraded.clear();
        tracing::info!(channel = %self.channel_id, "call closed; key material discarded");
    }

    fn remote_targets(&self, st: &CallState) -> Vec<String> {
        st.participants
            .iter()
            .filter(|p| p.as_str() != self.local_user())
            .cloned()
            .collect()
    }

    async fn distribute(&self, key: &GroupKey, targets: &[String], token: &EpochToken) {
        for peer in targets {
            match self.distribute_to(peer, key, token).await {
                Ok(()) => {
                    let mut st = self.state.lock().await;
                    st.degraded.remove(peer);
                }
                Err(err) => {
                    tracing::warn!(
                        channel = %self.channel_id,
                        peer = %peer,
                        error = %err,
                        "key delivery failed; peer degraded"
                    );
                    let mut st = self.state.lock().await;
                    st.degraded.insert(peer.clone());
                }
            }
        }
    }

    /// Encrypt the delivery once, then retry only the transport send, so
    /// the pairwise ratchet advances exactly once per delivery no matter
    /// how flaky the transport is.
    async fn distribute_to(
        &self,
        peer: &str,
        key: &GroupKey,
        token: &EpochToken,
    ) -> Result<(), CallError> {
        let payload = KeyDelivery::new(&self.channel_id, key).to_bytes()?;
        let sealed = self
            .session
            .encrypt_to(peer, DEFAULT_DEVICE_ID, &payload, token)
            .await?;

        let sent = retry_with_backoff(
            &self.policy,
            |attempt, err| {
                tracing::warn!(
                    channel = %self.channel_id,
                    peer = %peer,
                    attempt,
                    error = %err,
                    "key delivery attempt failed; backing off"
                );
            },
            |_| {
                let transport = Arc::clone(&self.transport);
                let sealed = sealed.clone();
                async move {
                    transport
                        .send(peer, DEFAULT_DEVICE_ID, MessageKind::GroupKey, &sealed)
                        .await
                }
            },
        )
        .await;

        match sent {
            Ok(()) => Ok(()),
            Err(err) => {
                // If the lost envelope carried the handshake, the peer has
                // no session and never will unless we forget ours too: the
                // next delivery then re-handshakes instead of sending
                // ratchet messages nobody can read.
                if envelope::is_handshake(&sealed) {
                    if let Err(reset_err) =
                        self.session.reset_session(peer, DEFAULT_DEVICE_ID).await
                    {
                        tracing::warn!(
                            peer = %peer,
                            error = %reset_err,
                            "failed to forget undelivered session"
                        );
                    }
                }
                Err(CallError::KeyExchange {
                    peer: peer.to_string(),
                    attempts: self.policy.max_attempts,
                    reason: err.to_string(),
                })
            }
        }
    }
}

fn ensure_open(st: &CallState) -> Result<(), CallError> {
    if st.phase == Phase::Closed {
        return Err(CallError::Closed);
    }
    Ok(())
}
