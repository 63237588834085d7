// ABOUTME: Persistence layer for fleetd, handling durable registry storage and audit records.
// ABOUTME: Provides the storage backends, the locking persistence manager, and the JSONL audit log.

pub mod audit_log;
pub mod backend;
pub mod persistence;
pub mod snapshot;

pub use audit_log::JsonlAuditLog;
pub use backend::{FileBackend, MemoryBackend, StorageBackend};
pub use persistence::{PersistenceError, PersistenceManager};
pub use snapshot::RegistrySnapshot;
