// ABOUTME: File-backed audit trail for registry operations, mode changes, errors, and recovery attempts.
// ABOUTME: One entry per line, durable before the call returns; replay reads the trail back for inspection.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use fleetd_core::{AuditEntry, AuditError, AuditSink};

/// Audit trail shared by the registry and the recovery engine. Entries are
/// never rewritten in place, so the file reads as the fleet's history.
pub struct JsonlAuditLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlAuditLog {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Continue the trail at `path`, starting a new one if none exists yet.
    pub fn open(path: &Path) -> Result<Self, AuditError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    /// Record one entry. The registry writes its entry after the snapshot has
    /// been committed, so the line is synced here to keep a crash from leaving
    /// a committed change with no trace in the trail.
    pub fn append(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        let json = serde_json::to_string(entry)?;
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(file, "{}", json)?;
        file.sync_all()?;
        Ok(())
    }

    /// Read back every recorded entry, oldest first.
    pub fn replay(path: &Path) -> Result<Vec<AuditEntry>, AuditError> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();

        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }

        Ok(entries)
    }

    /// Drop lines that are not whole entries, such as one cut short by a crash
    /// mid-append, so `replay` succeeds again. Returns how many entries survive.
    pub fn repair(path: &Path) -> Result<usize, AuditError> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let mut valid_lines: Vec<String> = Vec::new();

        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if serde_json::from_str::<AuditEntry>(&line).is_ok() {
                valid_lines.push(line);
            }
        }

        let count = valid_lines.len();

        let tmp_path = path.with_extension("jsonl.tmp");
        let mut tmp_file = File::create(&tmp_path)?;
        for line in &valid_lines {
            writeln!(tmp_file, "{}", line)?;
        }
        tmp_file.sync_all()?;

        fs::rename(&tmp_path, path)?;

        if let Some(parent) = path.parent()
            && let Ok(dir) = File::open(parent)
        {
            let _ = dir.sync_all();
        }

        Ok(count)
    }
}

impl AuditSink for JsonlAuditLog {
    fn write_entry(&self, entry: AuditEntry) -> Result<(), AuditError> {
        self.append(&entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetd_core::{AuditKind, Mode};
    use tempfile::TempDir;

    #[test]
    fn record_and_replay_in_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audit.jsonl");

        let log = JsonlAuditLog::open(&path).unwrap();
        log.record("add_device", "d1", None).unwrap();
        log.record_mode_change(Mode::Production).unwrap();
        log.record_error("add_device failed", "duplicate device: d1", None)
            .unwrap();
        drop(log);

        let entries = JsonlAuditLog::replay(&path).unwrap();
        assert_eq!(entries.len(), 3);
        assert!(matches!(&entries[0].kind, AuditKind::Operation { device_id, .. } if device_id == "d1"));
        assert_eq!(entries[1].kind, AuditKind::ModeChange { mode: Mode::Production });
        assert!(matches!(&entries[2].kind, AuditKind::Error { .. }));
    }

    #[test]
    fn reopen_appends_rather_than_truncates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audit.jsonl");

        JsonlAuditLog::open(&path)
            .unwrap()
            .record("add_device", "d1", None)
            .unwrap();
        JsonlAuditLog::open(&path)
            .unwrap()
            .record("delete_device", "d1", None)
            .unwrap();

        assert_eq!(JsonlAuditLog::replay(&path).unwrap().len(), 2);
    }

    #[test]
    fn repair_truncates_partial_last_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audit.jsonl");

        let log = JsonlAuditLog::open(&path).unwrap();
        log.record("add_device", "d1", None).unwrap();
        log.record("add_device", "d2", None).unwrap();
        drop(log);

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        write!(file, r#"{{"entry_id":"01J","timestamp":"2024-"#).unwrap();
        drop(file);

        assert!(JsonlAuditLog::replay(&path).is_err());

        let count = JsonlAuditLog::repair(&path).unwrap();
        assert_eq!(count, 2);
        assert_eq!(JsonlAuditLog::replay(&path).unwrap().len(), 2);
    }

    #[test]
    fn open_creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs").join("audit.jsonl");

        let log = JsonlAuditLog::open(&path).unwrap();
        assert_eq!(log.path(), path.as_path());
        assert!(path.exists());
    }
}
