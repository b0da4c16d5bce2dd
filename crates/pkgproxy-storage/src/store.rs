//! Expiring key-value store.
//!
//! Combines a [`BlobStore`] with a [`RecordIndex`] persisted as
//! `records.json` in the base directory. Blobs without a record (left over
//! from an earlier run without metadata) are served but never expire until
//! they are written again.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use directories::ProjectDirs;
use tracing::{debug, info};

use crate::blob::BlobStore;
use crate::error::Result;
use crate::index::{EvictCallback, RecordIndex, SweepReport};
use crate::record::CacheRecord;
use crate::sweeper::{spawn_sweeper, SweeperHandle};

/// Name of the metadata snapshot file.
pub const RECORDS_FILE: &str = "records.json";

/// Directory name used under the system temp dir when no cache dir is known.
const TMP_BASE: &str = "package-proxy";

/// Default interval between expiry sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Durable byte-blob storage with per-key TTLs.
#[derive(Debug, Clone)]
pub struct ExpiringStore {
    blobs: BlobStore,
    index: Arc<RecordIndex>,
    sync_writes: bool,
}

impl ExpiringStore {
    /// Opens (or creates) a store rooted at `base_dir`.
    pub fn open(base_dir: impl AsRef<Path>) -> Result<Self> {
        let base_dir = base_dir.as_ref();
        std::fs::create_dir_all(base_dir)?;

        let blobs = BlobStore::new(base_dir);
        let evict_blobs = blobs.clone();
        let on_evict: EvictCallback = Arc::new(move |key: &str| {
            info!("Expiring {}", key);
            evict_blobs.erase(key)
        });

        let index = RecordIndex::load(base_dir.join(RECORDS_FILE), on_evict)?;

        Ok(Self {
            blobs,
            index: Arc::new(index),
            sync_writes: false,
        })
    }

    /// Opens a store in the default cache directory.
    pub fn with_default_dir() -> Result<Self> {
        Self::open(Self::default_dir())
    }

    /// Returns the default cache directory.
    ///
    /// Falls back to `$TMP/package-proxy` if the platform has no cache dir.
    pub fn default_dir() -> PathBuf {
        ProjectDirs::from("", "package-proxy", "PackageProxy")
            .map(|dirs| dirs.cache_dir().to_path_buf())
            .unwrap_or_else(|| std::env::temp_dir().join(TMP_BASE))
    }

    /// Flush every blob to disk before acknowledging the write.
    pub fn with_sync_writes(mut self, sync_writes: bool) -> Self {
        self.sync_writes = sync_writes;
        self
    }

    /// Returns the base directory.
    pub fn base_dir(&self) -> &Path {
        self.blobs.base_dir()
    }

    /// Returns the shared record index.
    pub fn index(&self) -> &Arc<RecordIndex> {
        &self.index
    }

    /// Stores `bytes` under `key` with the given time to live.
    ///
    /// `ttl` of zero stores the key without expiry.
    ///
    /// The record is touched before the blob lands so a concurrent sweep
    /// never evicts the new blob under an old record. If the blob write
    /// fails the previous record is put back.
    pub fn write(&self, key: &str, bytes: &[u8], ttl: Duration) -> Result<()> {
        let previous = self.index.get(key);
        self.index.touch(key, ttl);

        if let Err(e) = self.blobs.write(key, bytes, self.sync_writes) {
            self.index.restore(key, previous);
            return Err(e);
        }

        debug!("Stored {} ({} bytes, ttl {:?})", key, bytes.len(), ttl);
        Ok(())
    }

    /// Reads the blob stored under `key`.
    pub fn read(&self, key: &str) -> Result<Vec<u8>> {
        self.blobs.read(key)
    }

    /// Returns the file a blob for `key` is stored at.
    pub fn blob_path(&self, key: &str) -> PathBuf {
        self.blobs.path_for(key)
    }

    /// Returns true if a blob exists for `key`.
    pub fn has(&self, key: &str) -> bool {
        self.blobs.has(key)
    }

    /// Removes the blob and record for `key`.
    pub fn erase(&self, key: &str) -> Result<()> {
        self.index.remove(key);
        self.blobs.erase(key)
    }

    /// Returns the freshness record for `key`.
    pub fn record(&self, key: &str) -> Option<CacheRecord> {
        self.index.get(key)
    }

    /// Runs one expiry sweep now and persists the snapshot if needed.
    pub fn sweep_now(&self) -> SweepReport {
        self.index.sweep_and_save(Utc::now())
    }

    /// Writes the record snapshot immediately.
    pub fn save(&self) -> Result<usize> {
        self.index.save()
    }

    /// Starts the background sweeper on the current Tokio runtime.
    pub fn start_sweeper(&self, interval: Duration) -> SweeperHandle {
        spawn_sweeper(self.index.clone(), interval)
    }
}
