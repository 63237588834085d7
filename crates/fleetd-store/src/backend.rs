// ABOUTME: Storage backends holding exactly one registry document plus an exclusive lock token.
// ABOUTME: FileBackend uses an atomic rename for writes and an fs2 advisory lock; MemoryBackend is for tests.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use fs2::FileExt;

const SNAPSHOT_FILE_NAME: &str = "registry.json";
const LOCK_FILE_NAME: &str = "registry.lock";

/// Read/write/lock primitives over a single durable document. No registry
/// logic lives here; the persistence manager decides when to call what.
pub trait StorageBackend: Send + Sync {
    /// Human-readable location, used in errors and logs.
    fn location(&self) -> String;

    /// Returns `None` when no document has been written yet.
    fn read_document(&self) -> io::Result<Option<String>>;

    /// Replace the stored document in full.
    fn write_document(&self, contents: &str) -> io::Result<()>;

    /// Try to take the exclusive lock without waiting. `Ok(false)` means
    /// someone else holds it.
    fn try_lock(&self) -> io::Result<bool>;

    fn unlock(&self) -> io::Result<()>;
}

fn lock_ignoring_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Filesystem backend rooted at a data directory:
/// `registry.json` holds the document and `registry.lock` is the lock token.
pub struct FileBackend {
    dir: PathBuf,
    lock_file: Mutex<Option<File>>,
}

impl FileBackend {
    /// Create a backend rooted at `dir`, creating the directory if needed.
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            lock_file: Mutex::new(None),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE_NAME)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.dir.join(LOCK_FILE_NAME)
    }
}

impl StorageBackend for FileBackend {
    fn location(&self) -> String {
        self.snapshot_path().display().to_string()
    }

    fn read_document(&self) -> io::Result<Option<String>> {
        match fs::read_to_string(self.snapshot_path()) {
            Ok(contents) if contents.trim().is_empty() => Ok(None),
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Write to a temp file, fsync, rename over the document, then fsync the
    /// directory so the rename itself is durable.
    fn write_document(&self, contents: &str) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;

        let final_path = self.snapshot_path();
        let tmp_path = final_path.with_extension("json.tmp");

        let mut file = File::create(&tmp_path)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp_path, &final_path)?;

        // Best-effort: the rename already succeeded and the data is consistent.
        if let Ok(dir) = File::open(&self.dir) {
            let _ = dir.sync_all();
        }

        Ok(())
    }

    fn try_lock(&self) -> io::Result<bool> {
        let mut held = lock_ignoring_poison(&self.lock_file);
        if held.is_some() {
            return Ok(false);
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.lock_path())?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                // Owner PID for diagnostics only.
                let _ = file.set_len(0);
                let _ = writeln!(file, "{}", std::process::id());
                tracing::debug!("acquired storage lock on {}", self.lock_path().display());
                *held = Some(file);
                Ok(true)
            }
            Err(e) if is_contended(&e) => {
                let owner = fs::read_to_string(self.lock_path()).unwrap_or_default();
                tracing::debug!(
                    "storage lock on {} is held (owner pid: {})",
                    self.lock_path().display(),
                    owner.trim()
                );
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn unlock(&self) -> io::Result<()> {
        let mut held = lock_ignoring_poison(&self.lock_file);
        if let Some(file) = held.take() {
            FileExt::unlock(&file)?;
            tracing::debug!("released storage lock on {}", self.lock_path().display());
        }
        Ok(())
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[derive(Debug, Default)]
struct MemoryState {
    document: Option<String>,
    locked: bool,
    fail_reads: bool,
    fail_writes: bool,
    writes: usize,
}

/// In-memory backend with failure injection. Share one instance through an
/// `Arc` to model two managers pointed at the same storage location.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(document: impl Into<String>) -> Self {
        let backend = Self::new();
        lock_ignoring_poison(&backend.state).document = Some(document.into());
        backend
    }

    pub fn document(&self) -> Option<String> {
        lock_ignoring_poison(&self.state).document.clone()
    }

    /// Number of successful `write_document` calls so far.
    pub fn write_count(&self) -> usize {
        lock_ignoring_poison(&self.state).writes
    }

    pub fn is_locked(&self) -> bool {
        lock_ignoring_poison(&self.state).locked
    }

    pub fn set_fail_reads(&self, fail: bool) {
        lock_ignoring_poison(&self.state).fail_reads = fail;
    }

    pub fn set_fail_writes(&self, fail: bool) {
        lock_ignoring_poison(&self.state).fail_writes = fail;
    }
}

impl StorageBackend for MemoryBackend {
    fn location(&self) -> String {
        "memory".to_string()
    }

    fn read_document(&self) -> io::Result<Option<String>> {
        let state = lock_ignoring_poison(&self.state);
        if state.fail_reads {
            return Err(io::Error::other("injected read failure"));
        }
        Ok(state.document.clone())
    }

    fn write_document(&self, contents: &str) -> io::Result<()> {
        let mut state = lock_ignoring_poison(&self.state);
        if state.fail_writes {
            return Err(io::Error::other("injected write failure"));
        }
        state.document = Some(contents.to_string());
        state.writes += 1;
        Ok(())
    }

    fn try_lock(&self) -> io::Result<bool> {
        let mut state = lock_ignoring_poison(&self.state);
        if state.locked {
            return Ok(false);
        }
        state.locked = true;
        Ok(true)
    }

    fn unlock(&self) -> io::Result<()> {
        lock_ignoring_poison(&self.state).locked = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn file_backend_reads_none_before_first_write() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::new(dir.path()).unwrap();

        assert!(backend.read_document().unwrap().is_none());
    }

    #[test]
    fn file_backend_treats_empty_file_as_absent() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::new(dir.path()).unwrap();
        fs::write(backend.snapshot_path(), "  \n").unwrap();

        assert!(backend.read_document().unwrap().is_none());
    }

    #[test]
    fn file_backend_write_replaces_document_without_leaving_temp_file() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::new(dir.path()).unwrap();

        backend.write_document("first").unwrap();
        backend.write_document("second").unwrap();

        assert_eq!(backend.read_document().unwrap().as_deref(), Some("second"));
        assert!(!dir.path().join("registry.json.tmp").exists());
    }

    #[test]
    fn file_backend_creates_nested_directory() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("deep").join("fleet");

        let backend = FileBackend::new(&nested).unwrap();
        backend.write_document("{}").unwrap();

        assert!(nested.join("registry.json").exists());
    }

    #[test]
    fn file_lock_is_exclusive_across_instances() {
        let dir = TempDir::new().unwrap();
        let first = FileBackend::new(dir.path()).unwrap();
        let second = FileBackend::new(dir.path()).unwrap();

        assert!(first.try_lock().unwrap());
        assert!(!second.try_lock().unwrap(), "second instance must fail fast");
        assert!(!first.try_lock().unwrap(), "lock is not re-entrant");

        first.unlock().unwrap();
        assert!(second.try_lock().unwrap());
        second.unlock().unwrap();
    }

    #[test]
    fn file_lock_records_owner_pid() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::new(dir.path()).unwrap();

        assert!(backend.try_lock().unwrap());
        let contents = fs::read_to_string(backend.lock_path()).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());
        backend.unlock().unwrap();
    }

    #[test]
    fn memory_backend_injects_failures() {
        let backend = MemoryBackend::new();
        backend.set_fail_writes(true);
        assert!(backend.write_document("x").is_err());
        assert_eq!(backend.write_count(), 0);

        backend.set_fail_writes(false);
        backend.write_document("x").unwrap();
        assert_eq!(backend.write_count(), 1);

        backend.set_fail_reads(true);
        assert!(backend.read_document().is_err());
    }
}
