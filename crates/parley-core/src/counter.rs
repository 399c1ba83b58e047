//! Fixed-bucket sliding-window counter.
//!
//! Time is cut into buckets of `interval`; a bucket lives while its key is
//! within `time_window / interval` keys of the current one. Eviction always
//! runs from the oldest bucket forward and stops at the first live one.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::UserId;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub count: u64,
    pub user_ids: BTreeSet<UserId>,
}

pub struct SlidingWindowCounter {
    window_ms: i64,
    interval_ms: i64,
    buckets: Mutex<BTreeMap<i64, Bucket>>,
}

impl SlidingWindowCounter {
    pub fn new(time_window: Duration, interval: Duration) -> Result<Self> {
        let window_ms = i64::try_from(time_window.as_millis())
            .map_err(|_| Error::Config("time window too large".into()))?;
        let interval_ms = i64::try_from(interval.as_millis())
            .map_err(|_| Error::Config("interval too large".into()))?;

        if interval_ms <= 0 || window_ms <= 0 {
            return Err(Error::Config(
                "time window and interval must both be positive".into(),
            ));
        }
        if window_ms % interval_ms != 0 {
            return Err(Error::Config(format!(
                "time window ({window_ms}ms) is not a multiple of the interval ({interval_ms}ms)"
            )));
        }

        Ok(Self {
            window_ms,
            interval_ms,
            buckets: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn time_window(&self) -> Duration {
        Duration::from_millis(self.window_ms as u64)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms as u64)
    }

    /// Bucket key for an instant.
    pub fn key_at(&self, now: DateTime<Utc>) -> i64 {
        now.timestamp_millis().div_euclid(self.interval_ms)
    }

    pub fn count(&self, user_id: Option<UserId>) {
        self.count_at(Utc::now(), user_id);
    }

    pub fn count_at(&self, now: DateTime<Utc>, user_id: Option<UserId>) {
        let current = self.key_at(now);
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(current).or_default();
        bucket.count += 1;
        if let Some(user_id) = user_id {
            bucket.user_ids.insert(user_id);
        }
        self.evict(&mut buckets, current);
    }

    /// Live buckets, oldest first.
    pub fn snapshot(&self) -> BTreeMap<i64, Bucket> {
        self.snapshot_at(Utc::now())
    }

    pub fn snapshot_at(&self, now: DateTime<Utc>) -> BTreeMap<i64, Bucket> {
        let mut buckets = self.buckets.lock();
        self.evict(&mut buckets, self.key_at(now));
        buckets.clone()
    }

    /// Sum of all live bucket counts.
    pub fn total_at(&self, now: DateTime<Utc>) -> u64 {
        self.snapshot_at(now).values().map(|b| b.count).sum()
    }

    pub fn len_at(&self, now: DateTime<Utc>) -> usize {
        let mut buckets = self.buckets.lock();
        self.evict(&mut buckets, self.key_at(now));
        buckets.len()
    }

    pub fn len(&self) -> usize {
        self.len_at(Utc::now())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace the buckets with previously dumped ones. Expired buckets are
    /// dropped on the next access.
    pub fn restore(&self, buckets: BTreeMap<i64, Bucket>) {
        *self.buckets.lock() = buckets;
    }

    fn evict(&self, buckets: &mut BTreeMap<i64, Bucket>, current: i64) {
        let horizon = current - self.window_ms / self.interval_ms;
        while let Some(entry) = buckets.first_entry() {
            if *entry.key() > horizon {
                break;
            }
            entry.remove();
        }
    }
}
