//! In-memory record index with a JSON snapshot on disk.
//!
//! The index maps cache keys to [`CacheRecord`]s. A single reader/writer lock
//! guards the whole map: lookups take the read lock, every insert, update and
//! delete takes the write lock. Expiry sweeps hold the write lock for the
//! entire scan so no reader ever observes a half-swept index.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::record::CacheRecord;

/// Callback invoked for every key removed by a sweep.
pub type EvictCallback = Arc<dyn Fn(&str) -> Result<()> + Send + Sync>;

/// Outcome of one sweep cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Records removed from the index.
    pub expired: usize,
    /// Removed records whose eviction callback failed.
    pub evict_failures: usize,
    /// Whether the snapshot was written after the sweep.
    pub saved: bool,
}

/// Record index shared by request tasks and the sweeper.
pub struct RecordIndex {
    records: RwLock<HashMap<String, CacheRecord>>,
    snapshot_path: Option<PathBuf>,
    /// Bumped under the write lock on every mutation.
    generation: AtomicU64,
    /// Generation captured by the last successful snapshot.
    saved_generation: AtomicU64,
    on_evict: EvictCallback,
}

impl std::fmt::Debug for RecordIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordIndex")
            .field("records", &self.records.read().len())
            .field("snapshot_path", &self.snapshot_path)
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

impl RecordIndex {
    /// Creates an empty index that is never persisted.
    pub fn in_memory(on_evict: EvictCallback) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            snapshot_path: None,
            generation: AtomicU64::new(0),
            saved_generation: AtomicU64::new(0),
            on_evict,
        }
    }

    /// Loads the index from `snapshot_path`, or starts empty if the file is absent.
    pub fn load(snapshot_path: impl Into<PathBuf>, on_evict: EvictCallback) -> Result<Self> {
        let snapshot_path = snapshot_path.into();

        let records = if snapshot_path.exists() {
            let json = fs::read(&snapshot_path)?;
            let records: HashMap<String, CacheRecord> = serde_json::from_slice(&json)?;
            info!(
                "Loaded {} cache records from {:?}",
                records.len(),
                snapshot_path
            );
            records
        } else {
            debug!("No record snapshot at {:?}, starting empty", snapshot_path);
            HashMap::new()
        };

        Ok(Self {
            records: RwLock::new(records),
            snapshot_path: Some(snapshot_path),
            generation: AtomicU64::new(0),
            saved_generation: AtomicU64::new(0),
            on_evict,
        })
    }

    /// Returns the snapshot file path, if the index is persisted.
    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot_path.as_deref()
    }

    /// Records a fresh write of `key` with the given freshness window.
    pub fn touch(&self, key: &str, max_age: Duration) {
        self.mutate(|records| {
            records.insert(key.to_string(), CacheRecord::new(max_age, Utc::now()));
        });
    }

    /// Puts back the record `key` had before a failed write.
    pub(crate) fn restore(&self, key: &str, previous: Option<CacheRecord>) {
        self.mutate(|records| match previous {
            Some(record) => {
                records.insert(key.to_string(), record);
            }
            None => {
                records.remove(key);
            }
        });
    }

    /// Overrides the last-updated timestamp of `key`.
    ///
    /// Creates an immortal record if the key is unknown.
    pub fn set_last_updated(&self, key: &str, at: DateTime<Utc>) {
        self.mutate(|records| {
            let record = records
                .entry(key.to_string())
                .or_insert_with(|| CacheRecord::new(Duration::ZERO, at));
            record.last_updated = at;
            record.dirty = true;
        });
    }

    /// Overrides the freshness window of `key`.
    pub fn set_max_age(&self, key: &str, max_age: Duration) {
        self.mutate(|records| {
            let record = records
                .entry(key.to_string())
                .or_insert_with(|| CacheRecord::new(max_age, Utc::now()));
            record.max_age = max_age;
            record.dirty = true;
        });
    }

    /// Returns a copy of the record for `key`.
    pub fn get(&self, key: &str) -> Option<CacheRecord> {
        self.records.read().get(key).cloned()
    }

    /// Returns true if `key` has a record.
    pub fn contains(&self, key: &str) -> bool {
        self.records.read().contains_key(key)
    }

    /// Removes the record for `key` without invoking the eviction callback.
    pub fn remove(&self, key: &str) -> Option<CacheRecord> {
        let mut removed = None;
        self.mutate(|records| removed = records.remove(key));
        removed
    }

    /// Returns the number of records.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Returns true if there are no records.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Returns true if the index changed since the last successful snapshot.
    pub fn is_dirty(&self) -> bool {
        self.generation.load(Ordering::Acquire) != self.saved_generation.load(Ordering::Acquire)
    }

    /// Removes every record expired at `now`, invoking the eviction callback once per key.
    ///
    /// A failed eviction is logged and counted; the record is dropped regardless.
    pub fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        let mut records = self.records.write();

        let expired: Vec<String> = records
            .iter()
            .filter(|(_, record)| record.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            records.remove(key);
            report.expired += 1;

            if let Err(e) = (self.on_evict)(key) {
                warn!("Failed to evict {}: {}", key, e);
                report.evict_failures += 1;
            } else {
                debug!("Expired {}", key);
            }
        }

        if report.expired > 0 {
            self.generation.fetch_add(1, Ordering::AcqRel);
        }

        report
    }

    /// Writes the snapshot file and clears dirty flags on unchanged records.
    ///
    /// Returns the number of records written. A no-op for in-memory indexes.
    pub fn save(&self) -> Result<usize> {
        let Some(path) = &self.snapshot_path else {
            return Ok(0);
        };

        let (generation, snapshot) = {
            let records = self.records.read();
            (self.generation.load(Ordering::Acquire), records.clone())
        };

        let json = serde_json::to_vec(&snapshot)?;
        write_atomically(path, &json)?;

        {
            let mut records = self.records.write();
            for (key, saved) in &snapshot {
                if let Some(current) = records.get_mut(key) {
                    if current.same_metadata(saved) {
                        current.dirty = false;
                    }
                }
            }
        }
        self.saved_generation.store(generation, Ordering::Release);

        debug!("Saved {} cache records to {:?}", snapshot.len(), path);
        Ok(snapshot.len())
    }

    /// Runs one sweep and persists the snapshot if anything changed.
    ///
    /// Snapshot failures are logged; the index stays dirty so the next cycle retries.
    pub fn sweep_and_save(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = self.sweep(now);

        if self.is_dirty() {
            match self.save() {
                Ok(_) => report.saved = true,
                Err(e) => warn!("Failed to save cache records, will retry: {}", e),
            }
        }

        report
    }

    fn mutate(&self, f: impl FnOnce(&mut HashMap<String, CacheRecord>)) {
        let mut records = self.records.write();
        f(&mut records);
        self.generation.fetch_add(1, Ordering::AcqRel);
    }
}

/// Writes `contents` to a temp file next to `path` and renames it into place.
pub(crate) fn write_atomically(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(contents)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}
