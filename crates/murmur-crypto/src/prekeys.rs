//! Pre-key bundle types shared by the directory service and the engine.
//!
//! Public halves travel to the directory; private halves stay in the local
//! blob store so the responder side of a handshake can run later.

use serde::{Deserialize, Serialize};

/// Public bundle fetched from the directory for one remote device.
///
/// The one-time pre-key is optional: the directory hands each one out at
/// most once, and a device that has exhausted its batch publishes bundles
/// without one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreKeyBundle {
    pub identity_key: Vec<u8>,
    pub signed_prekey_id: u32,
    pub signed_prekey: Vec<u8>,
    pub signed_prekey_signature: Vec<u8>,
    pub one_time_prekey_id: Option<u32>,
    pub one_time_prekey: Option<Vec<u8>>,
    pub registration_id: u32,
}

/// One public one-time pre-key inside an upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneTimePreKeyPublic {
    pub id: u32,
    pub public_key: Vec<u8>,
}

/// The full public projection a device publishes at bootstrap. Contains no
/// private material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreKeyUpload {
    pub device_id: String,
    pub identity_key: Vec<u8>,
    pub signed_prekey_id: u32,
    pub signed_prekey: Vec<u8>,
    pub signed_prekey_signature: Vec<u8>,
    pub registration_id: u32,
    pub one_time_prekeys: Vec<OneTimePreKeyPublic>,
}

/// Signed pre-key with its private half, persisted locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPreKeyRecord {
    pub id: u32,
    pub public_key: Vec<u8>,
    pub private_key: Vec<u8>,
    pub signature: Vec<u8>,
}

/// One-time pre-key with its private half. Single-use: deleted as soon as
/// an incoming handshake consumes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneTimePreKeyRecord {
    pub id: u32,
    pub public_key: Vec<u8>,
    pub private_key: Vec<u8>,
}
