// src/history/mod.rs

//! Persisted run history: item key → fingerprint from prior successful runs.
//!
//! The store is a single JSON file under `<output>/.rundag/`, loaded at run
//! start and rewritten on flush. Only one run may hold the store for
//! writing; an advisory lock file is taken at open time and an existing
//! lock is a fatal "store busy" error, never silent corruption.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::{Result, RundagError};
use crate::graph::TaskId;
use crate::tracked::{Fingerprint, ItemKey};

/// Directory under the output location holding the store and its lock.
pub const STORE_DIR: &str = ".rundag";
const HISTORY_FILE: &str = "history.json";
const LOCK_FILE: &str = "lock";

/// One persisted record: the fingerprint an item had when the owning task
/// last completed successfully.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub fingerprint: Fingerprint,
    pub task_id: TaskId,
    pub timestamp: DateTime<Utc>,
}

/// Handle to the on-disk history store. Holds the advisory lock for its
/// whole lifetime; dropping it releases the lock.
#[derive(Debug)]
pub struct HistoryStore {
    dir: PathBuf,
    records: HashMap<ItemKey, HistoryRecord>,
    dirty: bool,
    locked: bool,
}

impl HistoryStore {
    /// Open (creating if needed) the store under `output_dir`, taking the
    /// advisory lock. Fails fast with [`RundagError::StoreBusy`] if another
    /// run already holds it.
    pub fn open(output_dir: &Path) -> Result<Self> {
        let dir = output_dir.join(STORE_DIR);
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating history directory {dir:?}"))
            .map_err(RundagError::Other)?;

        let lock_path = dir.join(LOCK_FILE);
        match OpenOptions::new().write(true).create_new(true).open(&lock_path) {
            Ok(mut f) => {
                let _ = writeln!(f, "{}", std::process::id());
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(RundagError::StoreBusy(lock_path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        let records = load_records(&dir.join(HISTORY_FILE))?;
        info!(dir = ?dir, records = records.len(), "opened history store");

        Ok(Self {
            dir,
            records,
            dirty: false,
            locked: true,
        })
    }

    /// In-memory store for library callers and tests; nothing is persisted.
    pub fn in_memory() -> Self {
        Self {
            dir: PathBuf::new(),
            records: HashMap::new(),
            dirty: false,
            locked: false,
        }
    }

    pub fn lookup(&self, key: &ItemKey) -> Option<&Fingerprint> {
        self.records.get(key).map(|r| &r.fingerprint)
    }

    /// Record an item's fingerprint after its owning task completed.
    ///
    /// Called for both targets (new fingerprint) and depends (fingerprint at
    /// time of use), so a later task reusing the same item as a dependency
    /// observes the correct baseline.
    pub fn record(&mut self, key: ItemKey, fingerprint: Fingerprint, task_id: TaskId) {
        debug!(key = %key, task = task_id, "recording fingerprint");
        self.records.insert(
            key,
            HistoryRecord {
                fingerprint,
                task_id,
                timestamp: Utc::now(),
            },
        );
        self.dirty = true;
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Persist pending records: write to a temp file, then rename over the
    /// old store so a crash never leaves a half-written file.
    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty || !self.locked {
            return Ok(());
        }
        let path = self.dir.join(HISTORY_FILE);
        let tmp = self.dir.join(format!("{HISTORY_FILE}.tmp"));

        let encoded: HashMap<&str, &HistoryRecord> = self
            .records
            .iter()
            .map(|(k, v)| (k.0.as_str(), v))
            .collect();
        let json = serde_json::to_string_pretty(&encoded)
            .context("serializing history store")
            .map_err(RundagError::Other)?;

        fs::write(&tmp, json)
            .with_context(|| format!("writing history to {tmp:?}"))
            .map_err(RundagError::Other)?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("renaming {tmp:?} over {path:?}"))
            .map_err(RundagError::Other)?;

        self.dirty = false;
        debug!(records = self.records.len(), "flushed history store");
        Ok(())
    }

    /// Flush and release the advisory lock.
    pub fn close(mut self) -> Result<()> {
        self.flush()?;
        self.release_lock();
        Ok(())
    }

    fn release_lock(&mut self) {
        if self.locked {
            let lock_path = self.dir.join(LOCK_FILE);
            if let Err(e) = fs::remove_file(&lock_path) {
                warn!(path = ?lock_path, error = %e, "failed to remove history lock file");
            }
            self.locked = false;
        }
    }
}

impl Drop for HistoryStore {
    fn drop(&mut self) {
        self.release_lock();
    }
}

fn load_records(path: &Path) -> Result<HashMap<ItemKey, HistoryRecord>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let contents = File::open(path)
        .and_then(|f| {
            serde_json::from_reader::<_, HashMap<String, HistoryRecord>>(f)
                .map_err(std::io::Error::other)
        })
        .with_context(|| format!("reading history store {path:?}"))
        .map_err(RundagError::Other)?;

    Ok(contents
        .into_iter()
        .map(|(k, v)| (ItemKey(k), v))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn roundtrips_records_across_reopen() {
        let dir = TempDir::new().unwrap();

        let mut store = HistoryStore::open(dir.path()).unwrap();
        store.record(ItemKey("file:/a".into()), Fingerprint("f1".into()), 0);
        store.close().unwrap();

        let store = HistoryStore::open(dir.path()).unwrap();
        assert_eq!(
            store.lookup(&ItemKey("file:/a".into())),
            Some(&Fingerprint("f1".into()))
        );
    }

    #[test]
    fn second_open_fails_with_store_busy() {
        let dir = TempDir::new().unwrap();

        let _held = HistoryStore::open(dir.path()).unwrap();
        let err = HistoryStore::open(dir.path()).unwrap_err();
        assert!(matches!(err, RundagError::StoreBusy(_)));
    }

    #[test]
    fn lock_is_released_on_drop() {
        let dir = TempDir::new().unwrap();

        drop(HistoryStore::open(dir.path()).unwrap());
        assert!(HistoryStore::open(dir.path()).is_ok());
    }

    #[test]
    fn records_overwrite_by_key() {
        let mut store = HistoryStore::in_memory();
        store.record(ItemKey("var:a:b".into()), Fingerprint("1".into()), 0);
        store.record(ItemKey("var:a:b".into()), Fingerprint("2".into()), 3);
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.lookup(&ItemKey("var:a:b".into())),
            Some(&Fingerprint("2".into()))
        );
    }
}
