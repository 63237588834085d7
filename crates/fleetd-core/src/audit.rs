// ABOUTME: Audit sink interface receiving an immutable record of registry mutations, mode changes, and errors.
// ABOUTME: Includes the AuditEntry envelope plus no-op and in-memory sink implementations.

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

use crate::model::Mode;

/// Errors an audit sink may report. Callers log these and carry on; an audit
/// failure never fails the device operation that produced it.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("audit sink unavailable: {0}")]
    Unavailable(String),
}

/// One audit record as written to durable audit storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub entry_id: Ulid,
    pub timestamp: DateTime<Utc>,
    pub kind: AuditKind,
}

/// What an audit entry describes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AuditKind {
    Operation {
        operation: String,
        device_id: String,
        metadata: Option<serde_json::Value>,
    },
    ModeChange {
        mode: Mode,
    },
    Error {
        message: String,
        error: String,
        metadata: Option<serde_json::Value>,
    },
}

impl AuditEntry {
    pub fn new(kind: AuditKind) -> Self {
        Self {
            entry_id: Ulid::new(),
            timestamp: Utc::now(),
            kind,
        }
    }
}

/// Compliance log for registry and recovery activity. Implementations persist
/// each entry; the three record methods are the only inputs.
pub trait AuditSink: Send + Sync {
    fn write_entry(&self, entry: AuditEntry) -> Result<(), AuditError>;

    fn record(
        &self,
        operation: &str,
        device_id: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<(), AuditError> {
        self.write_entry(AuditEntry::new(AuditKind::Operation {
            operation: operation.to_string(),
            device_id: device_id.to_string(),
            metadata,
        }))
    }

    fn record_mode_change(&self, mode: Mode) -> Result<(), AuditError> {
        self.write_entry(AuditEntry::new(AuditKind::ModeChange { mode }))
    }

    fn record_error(
        &self,
        message: &str,
        error: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<(), AuditError> {
        self.write_entry(AuditEntry::new(AuditKind::Error {
            message: message.to_string(),
            error: error.to_string(),
            metadata,
        }))
    }
}

/// Sink that drops every entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAuditSink;

impl AuditSink for NoopAuditSink {
    fn write_entry(&self, _entry: AuditEntry) -> Result<(), AuditError> {
        Ok(())
    }
}

/// Sink that keeps entries in memory. Useful in tests and for short-lived tools.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn kinds(&self) -> Vec<AuditKind> {
        self.entries().into_iter().map(|e| e.kind).collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn write_entry(&self, entry: AuditEntry) -> Result<(), AuditError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_keeps_entries_in_order() {
        let sink = MemoryAuditSink::new();
        sink.record("add_device", "d1", None).unwrap();
        sink.record_mode_change(Mode::Production).unwrap();
        sink.record_error("delete_device failed", "device not found: d9", None)
            .unwrap();

        let kinds = sink.kinds();
        assert_eq!(kinds.len(), 3);
        assert!(matches!(&kinds[0], AuditKind::Operation { operation, device_id, .. }
            if operation == "add_device" && device_id == "d1"));
        assert_eq!(kinds[1], AuditKind::ModeChange { mode: Mode::Production });
        assert!(matches!(&kinds[2], AuditKind::Error { message, .. } if message == "delete_device failed"));
    }

    #[test]
    fn audit_entry_serde_round_trip() {
        let entry = AuditEntry::new(AuditKind::Operation {
            operation: "promote_device".to_string(),
            device_id: "d2".to_string(),
            metadata: Some(serde_json::json!({"previous": "d1"})),
        });

        let json = serde_json::to_string(&entry).expect("serialize");
        assert!(json.contains(r#""type":"Operation""#));

        let back: AuditEntry = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.entry_id, entry.entry_id);
        assert_eq!(back.kind, entry.kind);
    }
}
