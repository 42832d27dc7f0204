//! JSON snapshot store.
//!
//! Each operation reads the snapshot, applies itself, and (for writes)
//! replaces the file through a uniquely named temp file and a rename, so a
//! crash never leaves a half-written snapshot. Every operation holds an OS
//! file lock on a `<snapshot>.lock` sidecar: shared for reads, exclusive
//! from load through save for writes. Separate processes (the scheduler and
//! an operator running repairs) therefore never lose each other's writes.
//! The conditional-write rules are the same as
//! [`MemoryStore`](super::MemoryStore).

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fd_lock::RwLock;
use log::debug;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use super::{
    table_compare_and_swap, table_due, table_insert, table_scan, CasOutcome, ExecutionStore,
    RecordQuery, RecordTable,
};
use crate::error::{StoreError, StoreResult};
use crate::store::record::{ExecutionId, ExecutionRecord};

const SNAPSHOT_FORMAT: u32 = 1;

#[derive(Serialize, Deserialize)]
struct Snapshot {
    format: u32,
    saved_at: DateTime<Utc>,
    records: Vec<ExecutionRecord>,
}

/// Record store persisted as a single JSON document.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl FileStore {
    /// Opens (or lazily creates) a snapshot at `path`.
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let mut lock_name = path
            .file_name()
            .map(OsString::from)
            .unwrap_or_else(|| OsString::from("executions"));
        lock_name.push(".lock");
        Self {
            lock_path: path.with_file_name(lock_name),
            path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }

    fn dir(&self) -> &Path {
        self.path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
    }

    fn lock_file(&self) -> StoreResult<RwLock<File>> {
        fs::create_dir_all(self.dir()).map_err(|e| self.io_error(e))?;
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(|e| self.io_error(e))?;
        Ok(RwLock::new(file))
    }

    fn load(&self) -> StoreResult<RecordTable> {
        if !self.path.exists() {
            return Ok(RecordTable::new());
        }
        let content = fs::read_to_string(&self.path).map_err(|e| self.io_error(e))?;
        if content.trim().is_empty() {
            return Ok(RecordTable::new());
        }
        let snapshot: Snapshot = serde_json::from_str(&content)?;
        Ok(snapshot.records.into_iter().map(|r| (r.id, r)).collect())
    }

    fn save(&self, table: &RecordTable) -> StoreResult<()> {
        let snapshot = Snapshot {
            format: SNAPSHOT_FORMAT,
            saved_at: Utc::now(),
            records: table.values().cloned().collect(),
        };
        let json = serde_json::to_vec_pretty(&snapshot)?;

        let mut tmp = NamedTempFile::new_in(self.dir()).map_err(|e| self.io_error(e))?;
        tmp.write_all(&json).map_err(|e| self.io_error(e))?;
        tmp.as_file().sync_all().map_err(|e| self.io_error(e))?;
        tmp.persist(&self.path).map_err(|e| self.io_error(e.error))?;

        debug!("Saved {} records to {}", table.len(), self.path.display());
        Ok(())
    }

    fn read<T>(&self, f: impl FnOnce(&RecordTable) -> T) -> StoreResult<T> {
        let lock = self.lock_file()?;
        let _held = lock.read().map_err(|e| self.io_error(e))?;
        let table = self.load()?;
        Ok(f(&table))
    }

    /// Runs `f` under the exclusive lock; saves when it reports a change.
    fn write<T>(
        &self,
        f: impl FnOnce(&mut RecordTable) -> StoreResult<(T, bool)>,
    ) -> StoreResult<T> {
        let mut lock = self.lock_file()?;
        let _held = lock.write().map_err(|e| self.io_error(e))?;
        let mut table = self.load()?;
        let (value, changed) = f(&mut table)?;
        if changed {
            self.save(&table)?;
        }
        Ok(value)
    }
}

impl ExecutionStore for FileStore {
    fn insert(&self, record: ExecutionRecord) -> StoreResult<ExecutionRecord> {
        self.write(|table| Ok((table_insert(table, record)?, true)))
    }

    fn get(&self, id: ExecutionId) -> StoreResult<Option<ExecutionRecord>> {
        self.read(|table| table.get(&id).cloned())
    }

    fn due(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<ExecutionRecord>> {
        self.read(|table| table_due(table, now, limit))
    }

    fn scan(&self, query: &RecordQuery) -> StoreResult<Vec<ExecutionRecord>> {
        self.read(|table| table_scan(table, query))
    }

    fn compare_and_swap(
        &self,
        observed: &ExecutionRecord,
        next: ExecutionRecord,
    ) -> StoreResult<CasOutcome> {
        self.write(|table| {
            let outcome = table_compare_and_swap(table, observed, next);
            let applied = outcome.is_applied();
            Ok((outcome, applied))
        })
    }

    fn len(&self) -> StoreResult<usize> {
        self.read(RecordTable::len)
    }
}
