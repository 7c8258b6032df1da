//! The shared call key and its wire form.

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CallError;

pub const GROUP_KEY_LEN: usize = 32;

/// Symmetric media key shared by all call participants, tagged with a
/// strictly increasing index so receivers can order competing deliveries.
/// Material is wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct GroupKey {
    material: [u8; GROUP_KEY_LEN],
    index: u64,
}

impl GroupKey {
    pub fn generate(index: u64) -> Self {
        let mut material = [0u8; GROUP_KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut material);
        Self { material, index }
    }

    pub fn from_parts(material: [u8; GROUP_KEY_LEN], index: u64) -> Self {
        Self { material, index }
    }

    /// All-zero stand-in for a media pipeline that needs a key before the
    /// first real delivery has landed. Never tracked as a call key: the
    /// manager represents "no real key yet" as the absence of one.
    pub fn placeholder() -> Self {
        Self {
            material: [0u8; GROUP_KEY_LEN],
            index: 0,
        }
    }

    pub fn material(&self) -> &[u8; GROUP_KEY_LEN] {
        &self.material
    }

    pub fn index(&self) -> u64 {
        self.index
    }
}

impl std::fmt::Debug for GroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupKey")
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

/// Plaintext payload of a key delivery, sent through a pairwise session.
/// The channel id pins the delivery to one call.
#[derive(Debug, Serialize, Deserialize)]
pub struct KeyDelivery {
    pub channel_id: String,
    pub key: String,
    pub index: u64,
}

impl KeyDelivery {
    pub fn new(channel_id: &str, key: &GroupKey) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            key: BASE64_STANDARD.encode(key.material()),
            index: key.index(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CallError> {
        serde_json::to_vec(self).map_err(|e| CallError::Delivery(e.to_string()))
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self, CallError> {
        serde_json::from_slice(raw).map_err(|e| CallError::Delivery(e.to_string()))
    }

    pub fn into_key(self) -> Result<GroupKey, CallError> {
        let decoded = BASE64_STANDARD
            .decode(&self.key)
            .map_err(|e| CallError::Delivery(e.to_string()))?;
        let material: [u8; GROUP_KEY_LEN] = decoded
            .try_into()
            .map_err(|raw: Vec<u8>| CallError::Delivery(format!("key is {} bytes", raw.len())))?;
        Ok(GroupKey::from_parts(material, self.index))
    }
}
