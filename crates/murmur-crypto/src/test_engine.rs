//! Deterministic stand-in engine for tests.
//!
//! Not secure: generated public keys embed their private halves, which is
//! what lets both sides of a "handshake" reach the same shared secret
//! without real curve arithmetic. It exists so orchestration, persistence,
//! and ratchet-advance behavior can be exercised end to end.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::engine::{
    CryptoEngine, DecryptOutcome, EncryptOutcome, GeneratedBundle, GeneratedIdentity,
    HandshakeHello, InitiatorHandshake, ResponderKeys, PUBLIC_KEY_LEN,
};
use crate::error::CryptoError;
use crate::prekeys::{OneTimePreKeyRecord, PreKeyBundle, SignedPreKeyRecord};

const ROLE_INITIATOR: u8 = 1;
const ROLE_RESPONDER: u8 = 2;
const SECRET_LEN: usize = 32;
const TAG_LEN: usize = 32;
// shared secret + role byte + send counter + recv counter
const STATE_LEN: usize = SECRET_LEN + 1 + 8 + 8;

#[derive(Default)]
pub struct XorEngine {
    pub identity_generations: AtomicUsize,
    pub handshakes_initiated: AtomicUsize,
    pub handshakes_accepted: AtomicUsize,
    pub encrypts: AtomicUsize,
}

impl XorEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

fn random_secret() -> [u8; SECRET_LEN] {
    let mut secret = [0u8; SECRET_LEN];
    rand::rngs::OsRng.fill_bytes(&mut secret);
    secret
}

fn public_of(secret: &[u8; SECRET_LEN]) -> Vec<u8> {
    let mut public = Vec::with_capacity(PUBLIC_KEY_LEN);
    public.push(0x05);
    public.extend_from_slice(secret);
    public
}

fn secret_of_public(public: &[u8]) -> Result<[u8; SECRET_LEN], CryptoError> {
    if public.len() != PUBLIC_KEY_LEN {
        return Err(CryptoError::Engine(format!(
            "bad public key length {}",
            public.len()
        )));
    }
    let mut secret = [0u8; SECRET_LEN];
    secret.copy_from_slice(&public[1..]);
    Ok(secret)
}

fn secret_of_private(private: &[u8]) -> Result<[u8; SECRET_LEN], CryptoError> {
    private
        .try_into()
        .map_err(|_| CryptoError::Engine(format!("bad private key length {}", private.len())))
}

fn derive_shared(
    initiator_identity: &[u8; SECRET_LEN],
    responder_identity: &[u8; SECRET_LEN],
    signed_prekey: &[u8; SECRET_LEN],
    one_time_prekey: Option<&[u8; SECRET_LEN]>,
    ephemeral: &[u8; SECRET_LEN],
) -> [u8; SECRET_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(initiator_identity);
    hasher.update(responder_identity);
    hasher.update(signed_prekey);
    if let Some(otp) = one_time_prekey {
        hasher.update(otp);
    }
    hasher.update(ephemeral);
    hasher.finalize().into()
}

struct State {
    shared: [u8; SECRET_LEN],
    role: u8,
    send: u64,
    recv: u64,
}

impl State {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(STATE_LEN);
        buf.extend_from_slice(&self.shared);
        buf.push(self.role);
        buf.extend_from_slice(&self.send.to_le_bytes());
        buf.extend_from_slice(&self.recv.to_le_bytes());
        buf
    }

    fn decode(raw: &[u8]) -> Result<Self, CryptoError> {
        if raw.len() != STATE_LEN {
            return Err(CryptoError::Engine("corrupt session state".into()));
        }
        let mut shared = [0u8; SECRET_LEN];
        shared.copy_from_slice(&raw[..SECRET_LEN]);
        let role = raw[SECRET_LEN];
        let send = u64::from_le_bytes(raw[SECRET_LEN + 1..SECRET_LEN + 9].try_into().unwrap());
        let recv = u64::from_le_bytes(raw[SECRET_LEN + 9..].try_into().unwrap());
        Ok(Self { shared, role, send, recv })
    }
}

fn keystream(shared: &[u8; SECRET_LEN], dir: u8, counter: u64, ad: &[u8], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut block: u32 = 0;
    while out.len() < len {
        let mut hasher = Sha256::new();
        hasher.update(shared);
        hasher.update([dir]);
        hasher.update(counter.to_le_bytes());
        hasher.update(block.to_le_bytes());
        hasher.update(ad);
        out.extend_from_slice(&hasher.finalize());
        block += 1;
    }
    out.truncate(len);
    out
}

fn tag(shared: &[u8; SECRET_LEN], dir: u8, counter: u64, ciphertext: &[u8], ad: &[u8]) -> [u8; TAG_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(b"tag");
    hasher.update(shared);
    hasher.update([dir]);
    hasher.update(counter.to_le_bytes());
    hasher.update(ciphertext);
    hasher.update(ad);
    hasher.finalize().into()
}

#[async_trait]
impl CryptoEngine for XorEngine {
    async fn generate_identity(&self) -> Result<GeneratedIdentity, CryptoError> {
        self.identity_generations.fetch_add(1, Ordering::SeqCst);
        let secret = random_secret();
        Ok(GeneratedIdentity {
            public_key: public_of(&secret),
            private_key: secret.to_vec(),
            registration_id: rand::rngs::OsRng.next_u32(),
        })
    }

    async fn generate_prekey_bundle(
        &self,
        identity_public: &[u8],
        identity_private: &[u8],
        _registration_id: u32,
        one_time_count: u32,
    ) -> Result<GeneratedBundle, CryptoError> {
        let identity_secret = secret_of_private(identity_private)?;
        if public_of(&identity_secret) != identity_public {
            return Err(CryptoError::Engine("identity key pair mismatch".into()));
        }

        let spk_secret = random_secret();
        let spk_public = public_of(&spk_secret);
        let mut sig = Sha256::new();
        sig.update(identity_private);
        sig.update(&spk_public);

        let one_time = (1..=one_time_count)
            .map(|id| {
                let secret = random_secret();
                OneTimePreKeyRecord {
                    id,
                    public_key: public_of(&secret),
                    private_key: secret.to_vec(),
                }
            })
            .collect();

        Ok(GeneratedBundle {
            signed: SignedPreKeyRecord {
                id: 1,
                public_key: spk_public,
                private_key: spk_secret.to_vec(),
                signature: sig.finalize().to_vec(),
            },
            one_time,
        })
    }

    async fn handshake_initiator(
        &self,
        remote_bundle: &PreKeyBundle,
        local_identity_private: &[u8],
    ) -> Result<InitiatorHandshake, CryptoError> {
        self.handshakes_initiated.fetch_add(1, Ordering::SeqCst);

        let ephemeral = random_secret();
        let otp_secret = remote_bundle
            .one_time_prekey
            .as_deref()
            .map(secret_of_public)
            .transpose()?;
        let shared = derive_shared(
            &secret_of_private(local_identity_private)?,
            &secret_of_public(&remote_bundle.identity_key)?,
            &secret_of_public(&remote_bundle.signed_prekey)?,
            otp_secret.as_ref(),
            &ephemeral,
        );

        let state = State {
            shared,
            role: ROLE_INITIATOR,
            send: 0,
            recv: 0,
        };
        Ok(InitiatorHandshake {
            session_state: state.encode(),
            ephemeral_public: public_of(&ephemeral),
        })
    }

    async fn handshake_responder(
        &self,
        local: ResponderKeys<'_>,
        remote: HandshakeHello<'_>,
    ) -> Result<Vec<u8>, CryptoError> {
        self.handshakes_accepted.fetch_add(1, Ordering::SeqCst);

        let otp_secret = local
            .one_time_prekey_private
            .map(secret_of_private)
            .transpose()?;
        let shared = derive_shared(
            &secret_of_public(remote.sender_identity)?,
            &secret_of_private(local.identity_private)?,
            &secret_of_private(local.signed_prekey_private)?,
            otp_secret.as_ref(),
            &secret_of_public(remote.sender_ephemeral)?,
        );

        let state = State {
            shared,
            role: ROLE_RESPONDER,
            send: 0,
            recv: 0,
        };
        Ok(state.encode())
    }

    async fn encrypt(
        &self,
        session_state: &[u8],
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> Result<EncryptOutcome, CryptoError> {
        self.encrypts.fetch_add(1, Ordering::SeqCst);

        let mut state = State::decode(session_state)?;
        let ks = keystream(&state.shared, state.role, state.send, associated_data, plaintext.len());
        let mut ciphertext: Vec<u8> = plaintext.iter().zip(&ks).map(|(p, k)| p ^ k).collect();
        let mac = tag(&state.shared, state.role, state.send, &ciphertext, associated_data);
        ciphertext.extend_from_slice(&mac);

        state.send += 1;
        Ok(EncryptOutcome {
            ciphertext,
            updated_state: state.encode(),
        })
    }

    async fn decrypt(
        &self,
        session_state: &[u8],
        ciphertext: &[u8],
        associated_data: &[u8],
    ) -> Result<DecryptOutcome, CryptoError> {
        let mut state = State::decode(session_state)?;
        if ciphertext.len() < TAG_LEN {
            return Err(CryptoError::Engine("ciphertext too short".into()));
        }
        let (body, mac) = ciphertext.split_at(ciphertext.len() - TAG_LEN);

        let peer_role = if state.role == ROLE_INITIATOR {
            ROLE_RESPONDER
        } else {
            ROLE_INITIATOR
        };
        if tag(&state.shared, peer_role, state.recv, body, associated_data).as_slice() != mac {
            return Err(CryptoError::Engine("message authentication failed".into()));
        }

        let ks = keystream(&state.shared, peer_role, state.recv, associated_data, body.len());
        let plaintext = body.iter().zip(&ks).map(|(c, k)| c ^ k).collect();

        state.recv += 1;
        Ok(DecryptOutcome {
            plaintext,
            updated_state: state.encode(),
        })
    }
}
