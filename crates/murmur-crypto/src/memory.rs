//! In-memory implementations of the external persistence and directory
//! capabilities.
//!
//! Suitable for tests and development. Data is lost on process exit; for
//! production use, implement the traits over the platform's keyed store
//! and the real directory API.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::directory::Directory;
use crate::error::CryptoError;
use crate::prekeys::{PreKeyBundle, PreKeyUpload};
use crate::store::{KeyedBlobStore, Partition};

/// In-memory keyed blob store.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<(Partition, String), Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyedBlobStore for MemoryBlobStore {
    async fn get(&self, partition: Partition, key: &str) -> Result<Option<Vec<u8>>, CryptoError> {
        Ok(self.blobs.lock().get(&(partition, key.to_string())).cloned())
    }

    async fn put(&self, partition: Partition, key: &str, value: &[u8]) -> Result<(), CryptoError> {
        self.blobs
            .lock()
            .insert((partition, key.to_string()), value.to_vec());
        Ok(())
    }

    async fn delete(&self, partition: Partition, key: &str) -> Result<(), CryptoError> {
        self.blobs.lock().remove(&(partition, key.to_string()));
        Ok(())
    }
}

/// In-memory pre-key directory shared between test devices.
///
/// Mirrors the real directory's consumption rule: each fetch that finds
/// one-time pre-keys removes the one it hands out, so no two handshakes
/// ever see the same one.
#[derive(Default)]
pub struct MemoryDirectory {
    uploads: Mutex<HashMap<String, Vec<PreKeyUpload>>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many one-time pre-keys remain unconsumed for a device.
    pub fn remaining_one_time_keys(&self, user_id: &str, device_id: &str) -> usize {
        self.uploads
            .lock()
            .get(user_id)
            .and_then(|devices| devices.iter().find(|u| u.device_id == device_id))
            .map_or(0, |u| u.one_time_prekeys.len())
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn fetch_bundle(
        &self,
        user_id: &str,
        device_id: Option<&str>,
    ) -> Result<Option<PreKeyBundle>, CryptoError> {
        let mut uploads = self.uploads.lock();
        let Some(devices) = uploads.get_mut(user_id) else {
            return Ok(None);
        };
        let upload = match device_id {
            Some(id) => devices.iter_mut().find(|u| u.device_id == id),
            None => devices.first_mut(),
        };
        let Some(upload) = upload else {
            return Ok(None);
        };

        // Consume one one-time pre-key per fetch.
        let one_time = if upload.one_time_prekeys.is_empty() {
            None
        } else {
            Some(upload.one_time_prekeys.remove(0))
        };

        Ok(Some(PreKeyBundle {
            identity_key: upload.identity_key.clone(),
            signed_prekey_id: upload.signed_prekey_id,
            signed_prekey: upload.signed_prekey.clone(),
            signed_prekey_signature: upload.signed_prekey_signature.clone(),
            one_time_prekey_id: one_time.as_ref().map(|k| k.id),
            one_time_prekey: one_time.map(|k| k.public_key),
            registration_id: upload.registration_id,
        }))
    }

    async fn publish_bundle(
        &self,
        user_id: &str,
        upload: &PreKeyUpload,
    ) -> Result<(), CryptoError> {
        let mut uploads = self.uploads.lock();
        let devices = uploads.entry(user_id.to_string()).or_default();
        devices.retain(|u| u.device_id != upload.device_id);
        devices.push(upload.clone());
        Ok(())
    }
}
