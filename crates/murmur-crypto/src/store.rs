//! Persistence traits and the typed record layer.
//!
//! The backing store is an external keyed blob store scoped to the local
//! (user, device); this module defines its partitions and the serde
//! records written into them.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;
use crate::prekeys::{OneTimePreKeyRecord, SignedPreKeyRecord};

const IDENTITY_KEY: &str = "identity";
const REGISTRATION_ID_KEY: &str = "registrationId";
const PUBLISHED_KEY: &str = "published";

/// Store partitions. The backing implementation scopes all of them to the
/// local (user, device).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
    Identity,
    Sessions,
    SignedPreKeys,
    OtpPrivateKeys,
}

/// External persistence capability: get/set/delete opaque blobs by key
/// within a partition.
#[async_trait]
pub trait KeyedBlobStore: Send + Sync {
    async fn get(&self, partition: Partition, key: &str) -> Result<Option<Vec<u8>>, CryptoError>;
    async fn put(&self, partition: Partition, key: &str, value: &[u8]) -> Result<(), CryptoError>;
    async fn delete(&self, partition: Partition, key: &str) -> Result<(), CryptoError>;
}

/// Long-term device identity. The private half never leaves the store.
#[derive(Clone, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct IdentityRecord {
    pub public_key: Vec<u8>,
    pub private_key: Vec<u8>,
}

impl std::fmt::Debug for IdentityRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityRecord")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

/// Opaque ratchet state plus the associated data binding both identities.
/// Re-persisted after every encrypt/decrypt; the state is monotonic and is
/// never rewound past a persisted point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub state: Vec<u8>,
    pub ad: Vec<u8>,
}

/// Typed access layer over the keyed blob store.
#[derive(Clone)]
pub struct SignalStore {
    inner: Arc<dyn KeyedBlobStore>,
}

impl SignalStore {
    pub fn new(inner: Arc<dyn KeyedBlobStore>) -> Self {
        Self { inner }
    }

    fn session_key(user: &str, device: &str) -> String {
        format!("session-{user}-{device}")
    }

    fn spk_key(id: u32) -> String {
        format!("spk-{id}")
    }

    fn otp_key(id: u32) -> String {
        format!("otp-{id}")
    }

    async fn get_record<T: for<'de> Deserialize<'de>>(
        &self,
        partition: Partition,
        key: &str,
    ) -> Result<Option<T>, CryptoError> {
        match self.inner.get(partition, key).await? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    async fn put_record<T: Serialize>(
        &self,
        partition: Partition,
        key: &str,
        record: &T,
    ) -> Result<(), CryptoError> {
        let raw = serde_json::to_vec(record)?;
        self.inner.put(partition, key, &raw).await
    }

    pub async fn identity(&self) -> Result<Option<IdentityRecord>, CryptoError> {
        self.get_record(Partition::Identity, IDENTITY_KEY).await
    }

    pub async fn set_identity(&self, record: &IdentityRecord) -> Result<(), CryptoError> {
        self.put_record(Partition::Identity, IDENTITY_KEY, record).await
    }

    pub async fn registration_id(&self) -> Result<Option<u32>, CryptoError> {
        self.get_record(Partition::Identity, REGISTRATION_ID_KEY).await
    }

    pub async fn set_registration_id(&self, id: u32) -> Result<(), CryptoError> {
        self.put_record(Partition::Identity, REGISTRATION_ID_KEY, &id).await
    }

    /// Whether this device's public bundle has been accepted by the
    /// directory. Written only after a successful upload, so a device is
    /// never treated as ready with unpublished keys.
    pub async fn is_published(&self) -> Result<bool, CryptoError> {
        Ok(self
            .get_record::<bool>(Partition::Identity, PUBLISHED_KEY)
            .await?
            .unwrap_or(false))
    }

    pub async fn mark_published(&self) -> Result<(), CryptoError> {
        self.put_record(Partition::Identity, PUBLISHED_KEY, &true).await
    }

    pub async fn session(
        &self,
        remote_user: &str,
        remote_device: &str,
    ) -> Result<Option<SessionRecord>, CryptoError> {
        self.get_record(Partition::Sessions, &Self::session_key(remote_user, remote_device))
            .await
    }

    pub async fn set_session(
        &self,
        remote_user: &str,
        remote_device: &str,
        record: &SessionRecord,
    ) -> Result<(), CryptoError> {
        self.put_record(
            Partition::Sessions,
            &Self::session_key(remote_user, remote_device),
            record,
        )
        .await
    }

    /// Remove a session so the next outbound message re-runs the handshake.
    pub async fn delete_session(
        &self,
        remote_user: &str,
        remote_device: &str,
    ) -> Result<(), CryptoError> {
        self.inner
            .delete(Partition::Sessions, &Self::session_key(remote_user, remote_device))
            .await
    }

    pub async fn signed_prekey(&self, id: u32) -> Result<Option<SignedPreKeyRecord>, CryptoError> {
        self.get_record(Partition::SignedPreKeys, &Self::spk_key(id)).await
    }

    pub async fn set_signed_prekey(&self, record: &SignedPreKeyRecord) -> Result<(), CryptoError> {
        self.put_record(Partition::SignedPreKeys, &Self::spk_key(record.id), record)
            .await
    }

    pub async fn one_time_prekey(
        &self,
        id: u32,
    ) -> Result<Option<OneTimePreKeyRecord>, CryptoError> {
        self.get_record(Partition::OtpPrivateKeys, &Self::otp_key(id)).await
    }

    pub async fn set_one_time_prekey(
        &self,
        record: &OneTimePreKeyRecord,
    ) -> Result<(), CryptoError> {
        self.put_record(Partition::OtpPrivateKeys, &Self::otp_key(record.id), record)
            .await
    }

    /// Remove a consumed one-time pre-key (forward secrecy).
    pub async fn delete_one_time_prekey(&self, id: u32) -> Result<(), CryptoError> {
        self.inner
            .delete(Partition::OtpPrivateKeys, &Self::otp_key(id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBlobStore;

    fn store() -> SignalStore {
        SignalStore::new(Arc::new(MemoryBlobStore::new()))
    }

    #[tokio::test]
    async fn identity_roundtrip() {
        let store = store();
        assert!(store.identity().await.unwrap().is_none());

        let record = IdentityRecord {
            public_key: vec![1; 33],
            private_key: vec![2; 32],
        };
        store.set_identity(&record).await.unwrap();
        store.set_registration_id(4242).await.unwrap();

        let loaded = store.identity().await.unwrap().unwrap();
        assert_eq!(loaded.public_key, record.public_key);
        assert_eq!(loaded.private_key, record.private_key);
        assert_eq!(store.registration_id().await.unwrap(), Some(4242));
    }

    #[tokio::test]
    async fn published_marker_defaults_to_false() {
        let store = store();
        assert!(!store.is_published().await.unwrap());
        store.mark_published().await.unwrap();
        assert!(store.is_published().await.unwrap());
    }

    #[tokio::test]
    async fn sessions_are_keyed_per_device() {
        let store = store();
        let record = SessionRecord {
            state: vec![9, 9, 9],
            ad: vec![1, 2],
        };
        store.set_session("bob", "default", &record).await.unwrap();

        assert!(store.session("bob", "default").await.unwrap().is_some());
        assert!(store.session("bob", "laptop").await.unwrap().is_none());
        assert!(store.session("carol", "default").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn one_time_prekey_delete_is_permanent() {
        let store = store();
        let record = OneTimePreKeyRecord {
            id: 7,
            public_key: vec![1],
            private_key: vec![2],
        };
        store.set_one_time_prekey(&record).await.unwrap();
        assert!(store.one_time_prekey(7).await.unwrap().is_some());

        store.delete_one_time_prekey(7).await.unwrap();
        assert!(store.one_time_prekey(7).await.unwrap().is_none());
    }
}
