//! Per-key freshness metadata.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Freshness metadata for one cache key.
///
/// Owned by [`RecordIndex`](crate::RecordIndex); callers only ever see clones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheRecord {
    /// Freshness window. Zero means the record never expires on its own.
    ///
    /// Persisted in nanoseconds so sub-second windows survive a reload.
    #[serde(with = "duration_nanos")]
    pub max_age: Duration,
    /// When the blob for this key was last written.
    pub last_updated: DateTime<Utc>,
    /// Set when the record changed since the last snapshot.
    #[serde(skip)]
    pub dirty: bool,
}

impl CacheRecord {
    /// Creates a freshly written record.
    pub fn new(max_age: Duration, now: DateTime<Utc>) -> Self {
        Self {
            max_age,
            last_updated: now,
            dirty: true,
        }
    }

    /// Returns true if the record has no expiry.
    pub fn is_immortal(&self) -> bool {
        self.max_age.is_zero()
    }

    /// Returns the instant this record expires, if it ever does.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        if self.is_immortal() {
            return None;
        }
        let max_age = chrono::Duration::from_std(self.max_age).ok()?;
        self.last_updated.checked_add_signed(max_age)
    }

    /// Returns the remaining time to live at `now`.
    ///
    /// `None` for immortal records. Negative or zero once expired.
    pub fn ttl(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.expires_at().map(|at| at - now)
    }

    /// Returns true if the record is due for eviction at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.ttl(now).is_some_and(|ttl| ttl <= chrono::Duration::zero())
    }

    /// Compares persisted fields only.
    pub(crate) fn same_metadata(&self, other: &CacheRecord) -> bool {
        self.max_age == other.max_age && self.last_updated == other.last_updated
    }
}

mod duration_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_nanos()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_record_is_not_expired() {
        let now = Utc::now();
        let record = CacheRecord::new(Duration::from_secs(3600), now);
        assert!(!record.is_expired(now));
        assert_eq!(record.ttl(now), Some(chrono::Duration::hours(1)));
    }

    #[test]
    fn record_expires_exactly_at_max_age() {
        let now = Utc::now();
        let record = CacheRecord::new(Duration::from_secs(60), now - chrono::Duration::seconds(60));
        assert!(record.is_expired(now));
    }

    #[test]
    fn zero_max_age_is_immortal() {
        let now = Utc::now();
        let record = CacheRecord::new(Duration::ZERO, now - chrono::Duration::days(365));
        assert!(record.is_immortal());
        assert!(record.ttl(now).is_none());
        assert!(!record.is_expired(now));
    }

    #[test]
    fn serializes_camel_case_without_dirty_flag() {
        let now = Utc::now();
        let record = CacheRecord::new(Duration::from_secs(90), now);
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["maxAge"], 90_000_000_000u64);
        assert!(json.get("lastUpdated").is_some());
        assert!(json.get("dirty").is_none());

        let back: CacheRecord = serde_json::from_value(json).unwrap();
        assert!(!back.dirty);
        assert!(back.same_metadata(&record));
    }

    #[test]
    fn sub_second_max_age_is_not_truncated() {
        let now = Utc::now();
        let record = CacheRecord::new(Duration::from_millis(500), now);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["maxAge"], 500_000_000u64);

        let back: CacheRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back.max_age, Duration::from_millis(500));
        assert!(!back.is_immortal());
    }
}
