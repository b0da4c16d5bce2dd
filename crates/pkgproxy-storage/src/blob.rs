//! Content-addressed blob files.
//!
//! Each key maps to `<base>/default/<3 hex chars>/<sha256(key)>`. Writes go
//! through a temp file in the destination directory and are renamed into
//! place, so a reader never sees a partially written blob.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{Result, StorageError};

/// Directory under the base path that holds all blobs.
const BLOB_PREFIX: &str = "default";

/// Number of hex characters used for the fan-out directory.
const FANOUT_CHARS: usize = 3;

/// Raw byte storage keyed by string.
#[derive(Debug, Clone)]
pub struct BlobStore {
    base_dir: PathBuf,
}

impl BlobStore {
    /// Creates a blob store rooted at `base_dir`.
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }

    /// Returns the base directory.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Returns the file path a key is stored at.
    pub fn path_for(&self, key: &str) -> PathBuf {
        let digest = format!("{:x}", Sha256::digest(key.as_bytes()));
        self.base_dir
            .join(BLOB_PREFIX)
            .join(&digest[..FANOUT_CHARS])
            .join(digest)
    }

    /// Writes `bytes` under `key`, replacing any previous blob.
    ///
    /// With `sync` the file is flushed to disk before it is renamed into place.
    pub fn write(&self, key: &str, bytes: &[u8], sync: bool) -> Result<()> {
        validate_key(key)?;

        let path = self.path_for(key);
        let dir = path
            .parent()
            .ok_or_else(|| StorageError::InvalidKey(key.to_string()))?;
        fs::create_dir_all(dir)?;

        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        file.write_all(bytes)?;
        if sync {
            file.as_file().sync_all()?;
        }
        file.persist(&path).map_err(|e| e.error)?;

        Ok(())
    }

    /// Reads the blob stored under `key`.
    pub fn read(&self, key: &str) -> Result<Vec<u8>> {
        validate_key(key)?;

        fs::read(self.path_for(key)).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StorageError::NotFound(key.to_string()),
            _ => StorageError::Io(e),
        })
    }

    /// Returns true if a blob exists for `key`.
    pub fn has(&self, key: &str) -> bool {
        !key.is_empty() && self.path_for(key).is_file()
    }

    /// Deletes the blob stored under `key`.
    pub fn erase(&self, key: &str) -> Result<()> {
        validate_key(key)?;

        fs::remove_file(self.path_for(key)).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StorageError::NotFound(key.to_string()),
            _ => StorageError::Io(e),
        })
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(StorageError::InvalidKey("empty key".to_string()));
    }
    Ok(())
}
