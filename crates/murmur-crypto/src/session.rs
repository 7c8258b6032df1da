//! Pairwise forward-secret sessions.
//!
//! One logical session per (remote user, remote device). The first encrypt
//! toward a peer runs the asynchronous handshake against their published
//! bundle and emits a handshake envelope; every later message rides the
//! established ratchet. Inbound handshakes are mirrored with
//! [`PairwiseSession::accept_handshake`]; [`PairwiseSession::decrypt_from`]
//! never establishes state on its own.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::DeviceContext;
use crate::engine::{HandshakeHello, ResponderKeys, PUBLIC_KEY_LEN};
use crate::envelope::{self, HandshakeEnvelope, ParsedEnvelope};
use crate::epoch::EpochToken;
use crate::error::CryptoError;
use crate::store::SessionRecord;
use crate::DEFAULT_DEVICE_ID;

pub struct PairwiseSession {
    ctx: Arc<DeviceContext>,
    // Serializes handshake-vs-encrypt races per remote device. The map only
    // grows; entries are tiny and the peer set is bounded in practice.
    pair_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl PairwiseSession {
    pub fn new(ctx: Arc<DeviceContext>) -> Self {
        Self {
            ctx,
            pair_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.ctx
    }

    fn pair_lock(&self, user: &str, device: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.pair_locks
            .lock()
            .entry(format!("{user}/{device}"))
            .or_default()
            .clone()
    }

    pub async fn has_session(&self, user: &str, device: &str) -> Result<bool, CryptoError> {
        Ok(self.ctx.store().session(user, device).await?.is_some())
    }

    /// Forget the session with a remote device so the next send re-runs the
    /// handshake. For the case where the envelope carrying the handshake
    /// never reached the peer: the local ratchet is ahead of a peer that
    /// has nothing, and only a fresh handshake can reconcile them.
    pub async fn reset_session(&self, user: &str, device: &str) -> Result<(), CryptoError> {
        let lock = self.pair_lock(user, device);
        let _guard = lock.lock().await;
        self.ctx.store().delete_session(user, device).await?;
        tracing::debug!(peer = %user, peer_device = %device, "forgot outbound session");
        Ok(())
    }

    /// Encrypt `plaintext` for a remote device, establishing a session on
    /// first use. Returns the complete envelope for the transport.
    ///
    /// The session commit is guarded by `token`: if the connection epoch
    /// advanced while the handshake or encryption was in flight, nothing is
    /// persisted and the call fails with [`CryptoError::Stale`].
    pub async fn encrypt_to(
        &self,
        user: &str,
        device: &str,
        plaintext: &[u8],
        token: &EpochToken,
    ) -> Result<Vec<u8>, CryptoError> {
        let lock = self.pair_lock(user, device);
        let _guard = lock.lock().await;

        match self.ctx.store().session(user, device).await? {
            Some(record) => self.encrypt_existing(user, device, &record, plaintext, token).await,
            None => self.encrypt_initial(user, device, plaintext, token).await,
        }
    }

    async fn encrypt_existing(
        &self,
        user: &str,
        device: &str,
        record: &SessionRecord,
        plaintext: &[u8],
        token: &EpochToken,
    ) -> Result<Vec<u8>, CryptoError> {
        let engine = self.ctx.engine().get()?;
        let outcome = engine.encrypt(&record.state, plaintext, &record.ad).await?;

        token.ensure_fresh()?;
        self.ctx
            .store()
            .set_session(
                user,
                device,
                &SessionRecord {
                    state: outcome.updated_state,
                    ad: record.ad.clone(),
                },
            )
            .await?;
        Ok(envelope::build_regular(&outcome.ciphertext))
    }

    async fn encrypt_initial(
        &self,
        user: &str,
        device: &str,
        plaintext: &[u8],
        token: &EpochToken,
    ) -> Result<Vec<u8>, CryptoError> {
        let engine = self.ctx.engine().get()?;
        let store = self.ctx.store();
        let identity = store.identity().await?.ok_or(CryptoError::NoIdentity)?;

        // The default device id targets "whichever device the directory
        // resolves"; a concrete id pins the query.
        let device_query = (device != DEFAULT_DEVICE_ID).then_some(device);
        let bundle = self
            .ctx
            .directory()
            .fetch_bundle(user, device_query)
            .await?
            .ok_or_else(|| CryptoError::NoBundle {
                user: user.to_string(),
                device: device.to_string(),
            })?;

        let handshake = engine
            .handshake_initiator(&bundle, &identity.private_key)
            .await?;
        let ad = build_associated_data(&identity.public_key, &bundle.identity_key);
        let outcome = engine.encrypt(&handshake.session_state, plaintext, &ad).await?;

        token.ensure_fresh()?;
        store
            .set_session(
                user,
                device,
                &SessionRecord {
                    state: outcome.updated_state,
                    ad: ad.clone(),
                },
            )
            .await?;

        tracing::debug!(
            peer = %user,
            peer_device = %device,
            one_time_key = bundle.one_time_prekey_id.is_some(),
            "established outbound session"
        );
        envelope::build_handshake(
            &identity.public_key,
            &handshake.ephemeral_public,
            bundle.signed_prekey_id,
            bundle.one_time_prekey_id,
            &outcome.ciphertext,
        )
    }

    /// Decrypt a regular envelope from an established session.
    ///
    /// Fails with [`CryptoError::NoSession`] when no session exists: such a
    /// message is permanently undecryptable here, and the caller surfaces
    /// that rather than guessing at recovery. Handshake envelopes are
    /// rejected; route them to [`PairwiseSession::accept_handshake`].
    pub async fn decrypt_from(
        &self,
        user: &str,
        device: &str,
        raw: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let payload = match envelope::parse(raw)? {
            ParsedEnvelope::Regular { payload } => payload,
            ParsedEnvelope::Handshake(_) => {
                return Err(CryptoError::Envelope(
                    "handshake envelope routed to regular decrypt".into(),
                ));
            }
        };

        let lock = self.pair_lock(user, device);
        let _guard = lock.lock().await;

        let store = self.ctx.store();
        let record = store
            .session(user, device)
            .await?
            .ok_or_else(|| CryptoError::NoSession {
                user: user.to_string(),
                device: device.to_string(),
            })?;

        let engine = self.ctx.engine().get()?;
        let outcome = engine.decrypt(&record.state, &payload, &record.ad).await?;
        store
            .set_session(
                user,
                device,
                &SessionRecord {
                    state: outcome.updated_state,
                    ad: record.ad,
                },
            )
            .await?;
        Ok(outcome.plaintext)
    }

    /// Accept an inbound handshake envelope: mirror the key agreement with
    /// the addressed pre-key material, decrypt the first payload, persist
    /// the new session, and retire the consumed one-time pre-key.
    pub async fn accept_handshake(
        &self,
        user: &str,
        device: &str,
        raw: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let ParsedEnvelope::Handshake(hs) = envelope::parse(raw)? else {
            return Err(CryptoError::Envelope(
                "regular envelope routed to handshake acceptance".into(),
            ));
        };

        let lock = self.pair_lock(user, device);
        let _guard = lock.lock().await;
        self.accept_handshake_locked(user, device, &hs).await
    }

    async fn accept_handshake_locked(
        &self,
        user: &str,
        device: &str,
        hs: &HandshakeEnvelope,
    ) -> Result<Vec<u8>, CryptoError> {
        let engine = self.ctx.engine().get()?;
        let store = self.ctx.store();
        let identity = store.identity().await?.ok_or(CryptoError::NoIdentity)?;

        let signed = store
            .signed_prekey(hs.signed_prekey_id)
            .await?
            .ok_or(CryptoError::MissingSignedPreKey(hs.signed_prekey_id))?;
        let one_time = match hs.one_time_prekey_id {
            Some(id) => Some(
                store
                    .one_time_prekey(id)
                    .await?
                    .ok_or(CryptoError::MissingOneTimePreKey(id))?,
            ),
            None => None,
        };

        let state = engine
            .handshake_responder(
                ResponderKeys {
                    identity_private: &identity.private_key,
                    signed_prekey_public: &signed.public_key,
                    signed_prekey_private: &signed.private_key,
                    one_time_prekey_private: one_time.as_ref().map(|k| k.private_key.as_slice()),
                },
                HandshakeHello {
                    sender_identity: &hs.sender_identity,
                    sender_ephemeral: &hs.sender_ephemeral,
                },
            )
            .await?;

        let ad = build_associated_data(&hs.sender_identity, &identity.public_key);
        let outcome = engine.decrypt(&state, &hs.payload, &ad).await?;

        store
            .set_session(
                user,
                device,
                &SessionRecord {
                    state: outcome.updated_state,
                    ad,
                },
            )
            .await?;

        // Only after the session is durable: a one-time pre-key is never
        // reusable once a handshake has bound to it.
        if let Some(consumed) = &one_time {
            store.delete_one_time_prekey(consumed.id).await?;
        }

        tracing::debug!(
            peer = %user,
            peer_device = %device,
            one_time_key = one_time.is_some(),
            "established inbound session"
        );
        Ok(outcome.plaintext)
    }
}

/// Associated data binding both long-term identities to every message:
/// initiator identity key followed by responder identity key.
fn build_associated_data(initiator_identity: &[u8], responder_identity: &[u8]) -> Vec<u8> {
    let mut ad = Vec::with_capacity(2 * PUBLIC_KEY_LEN);
    ad.extend_from_slice(initiator_identity);
    ad.extend_from_slice(responder_identity);
    ad
}
