//! The published pre-key directory (external service).

use async_trait::async_trait;

use crate::error::CryptoError;
use crate::prekeys::{PreKeyBundle, PreKeyUpload};

/// Directory of published public pre-key material.
///
/// The directory hands each one-time pre-key out at most once; a fetched
/// bundle may therefore carry none when the target's batch is exhausted.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Fetch a device's bundle. `None` for the device id means "any
    /// device": the directory returns the first published bundle for the
    /// user. `Ok(None)` means the target has published nothing.
    async fn fetch_bundle(
        &self,
        user_id: &str,
        device_id: Option<&str>,
    ) -> Result<Option<PreKeyBundle>, CryptoError>;

    /// Publish the public projection of a freshly generated bundle,
    /// replacing any previous upload for the same device.
    async fn publish_bundle(&self, user_id: &str, upload: &PreKeyUpload)
        -> Result<(), CryptoError>;
}
