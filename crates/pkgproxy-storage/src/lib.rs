//! Package Proxy Storage - expiring on-disk blob store.
//!
//! This crate provides the durable half of the package cache:
//!
//! - Blob files addressed by a hash of the cache key
//! - Per-key freshness records (`maxAge`, `lastUpdated`) kept in memory
//! - A `records.json` snapshot reloaded on startup
//! - A background sweeper that evicts expired keys
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use pkgproxy_storage::ExpiringStore;
//!
//! let store = ExpiringStore::open("/var/cache/package-proxy").unwrap();
//! store.write("ubuntu/pool/main/a/apt/apt.deb", b"...", Duration::from_secs(3600)).unwrap();
//! assert!(store.has("ubuntu/pool/main/a/apt/apt.deb"));
//! ```

mod blob;
pub mod error;
mod index;
mod record;
mod store;
mod sweeper;

pub use blob::BlobStore;
pub use error::{Result, StorageError};
pub use index::{EvictCallback, RecordIndex, SweepReport};
pub use record::CacheRecord;
pub use store::{ExpiringStore, DEFAULT_SWEEP_INTERVAL, RECORDS_FILE};
pub use sweeper::{spawn_sweeper, SweeperHandle};
