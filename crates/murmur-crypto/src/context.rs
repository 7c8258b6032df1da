//! Per-device context.
//!
//! One context per local device lifetime, owning the engine slot and the
//! handles to the external collaborators. Passed explicitly to every
//! orchestration entry point; there is no ambient global state.

use std::sync::Arc;

use crate::directory::Directory;
use crate::engine::EngineCell;
use crate::store::SignalStore;

/// Device id used when the caller does not target a specific device.
pub const DEFAULT_DEVICE_ID: &str = "default";

pub struct DeviceContext {
    local_user_id: String,
    local_device_id: String,
    engine: EngineCell,
    store: SignalStore,
    directory: Arc<dyn Directory>,
}

impl DeviceContext {
    pub fn new(
        local_user_id: impl Into<String>,
        local_device_id: impl Into<String>,
        engine: EngineCell,
        store: SignalStore,
        directory: Arc<dyn Directory>,
    ) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            local_device_id: local_device_id.into(),
            engine,
            store,
            directory,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.local_user_id
    }

    pub fn device_id(&self) -> &str {
        &self.local_device_id
    }

    pub fn engine(&self) -> &EngineCell {
        &self.engine
    }

    pub fn store(&self) -> &SignalStore {
        &self.store
    }

    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.directory
    }
}
