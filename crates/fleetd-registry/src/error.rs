// ABOUTME: Error type for device registry operations.
// ABOUTME: Lets callers tell outcomes of valid state (duplicate, not found) apart from storage faults.

use fleetd_core::{ConfigLookupError, Mode};
use fleetd_store::PersistenceError;
use thiserror::Error;

/// Errors returned by registry operations. A failed mutation leaves both the
/// in-memory registry and the stored snapshot unchanged.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("duplicate device: {0}")]
    DuplicateDevice(String),

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("operation {operation} is not authorized in {mode} mode")]
    Unauthorized { operation: String, mode: Mode },

    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("failed to load registry state: {0}")]
    StateLoad(#[source] PersistenceError),

    #[error("device type lookup failed: {0}")]
    Config(#[from] ConfigLookupError),
}

impl RegistryError {
    /// Only storage faults are worth retrying; the other kinds describe the
    /// registry's current contents or a caller mistake.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RegistryError::Persistence(e) if e.is_retryable())
    }
}
