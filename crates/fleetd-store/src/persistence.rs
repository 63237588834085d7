// ABOUTME: Persistence manager wrapping a storage backend with snapshot load/save and exclusive transactions.
// ABOUTME: run_exclusive acquires the lock, runs a unit of work, and always releases the lock afterwards.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use fleetd_core::{DeviceRecord, Mode};
use thiserror::Error;

use crate::backend::StorageBackend;
use crate::snapshot::RegistrySnapshot;

/// Errors that can occur while loading, saving, or locking registry storage.
/// All but `Stale` mean storage is unavailable and a later retry may succeed.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("storage at {0} is already locked")]
    AlreadyLocked(String),

    /// The stored snapshot is not the one this writer last loaded or saved.
    #[error("storage at {0} was modified by another registry instance")]
    Stale(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PersistenceError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Stale(_))
    }
}

/// Durable storage for the registry snapshot. Only one `run_exclusive` may be
/// in flight per storage location; contention fails fast instead of queuing.
#[derive(Clone)]
pub struct PersistenceManager {
    backend: Arc<dyn StorageBackend>,
}

/// Releases the backend lock when dropped, so the lock is freed whether the
/// work returned normally, returned an error, or panicked.
struct LockGuard<'a> {
    backend: &'a dyn StorageBackend,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.backend.unlock() {
            tracing::error!("failed to release storage lock on {}: {}", self.backend.location(), e);
        }
    }
}

impl PersistenceManager {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    pub fn location(&self) -> String {
        self.backend.location()
    }

    /// Load the stored snapshot. An absent document is a valid initial state and
    /// yields an empty snapshot; an unreadable or unparseable one is an error.
    pub fn load_snapshot(&self) -> Result<RegistrySnapshot, PersistenceError> {
        match self.load_stored()? {
            Some(snapshot) => {
                tracing::info!(
                    "loaded registry snapshot with {} devices from {}",
                    snapshot.devices.len(),
                    self.backend.location()
                );
                Ok(snapshot)
            }
            None => {
                tracing::info!("no registry snapshot at {}, starting empty", self.backend.location());
                Ok(RegistrySnapshot::empty())
            }
        }
    }

    /// The stored snapshot, or `None` when nothing has been written yet.
    pub fn load_stored(&self) -> Result<Option<RegistrySnapshot>, PersistenceError> {
        self.backend
            .read_document()?
            .map(|contents| serde_json::from_str(&contents))
            .transpose()
            .map_err(PersistenceError::from)
    }

    /// Fail with `Stale` unless the stored snapshot's `last_updated` equals
    /// `expected`, where `None` means nothing may have been written yet.
    /// Call inside `run_exclusive` so the check and the following save are atomic.
    pub fn ensure_unchanged(&self, expected: Option<DateTime<Utc>>) -> Result<(), PersistenceError> {
        let stored = self.load_stored()?.map(|snapshot| snapshot.last_updated);
        if stored != expected {
            tracing::warn!(
                "registry snapshot at {} changed underneath this instance (expected {:?}, found {:?})",
                self.backend.location(),
                expected,
                stored
            );
            return Err(PersistenceError::Stale(self.backend.location()));
        }
        Ok(())
    }

    /// Serialize and write the full snapshot, replacing whatever was stored.
    /// Returns the `last_updated` stamp that was written.
    pub fn save_snapshot(
        &self,
        devices: &BTreeMap<String, DeviceRecord>,
        default_device: Option<&str>,
        mode: Mode,
    ) -> Result<DateTime<Utc>, PersistenceError> {
        let snapshot = RegistrySnapshot::from_map(devices, default_device, mode);
        let json = serde_json::to_string_pretty(&snapshot)?;
        self.backend.write_document(&json)?;
        tracing::debug!(
            "saved registry snapshot with {} devices to {}",
            snapshot.devices.len(),
            self.backend.location()
        );
        Ok(snapshot.last_updated)
    }

    /// Run `work` while holding the exclusive storage lock. Fails immediately
    /// with `AlreadyLocked` if the lock is held by anyone, including this manager.
    pub fn run_exclusive<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<PersistenceError>,
    {
        let acquired = self.backend.try_lock().map_err(PersistenceError::from)?;
        if !acquired {
            return Err(PersistenceError::AlreadyLocked(self.backend.location()).into());
        }

        let _guard = LockGuard {
            backend: self.backend.as_ref(),
        };
        work()
    }
}
