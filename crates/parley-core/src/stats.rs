//! Process-wide usage statistics: an ask counter, an HTTP request counter
//! and a time-bounded log of finished asks.

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::UserId;
use crate::counter::{Bucket, SlidingWindowCounter};
use crate::error::Result;
use crate::models::Source;

#[derive(Debug, Clone)]
pub struct StatsConfig {
    pub request_window: Duration,
    pub request_interval: Duration,
    pub ask_window: Duration,
    pub ask_interval: Duration,
    /// How long finished asks stay in the ask log. Must cover the longest
    /// configured rate-limit window.
    pub ask_log_window: Duration,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            request_window: Duration::from_secs(24 * 60 * 60),
            request_interval: Duration::from_secs(60),
            ask_window: Duration::from_secs(24 * 60 * 60),
            ask_interval: Duration::from_secs(60),
            ask_log_window: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// How an admitted ask ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AskStatus {
    Completed,
    Canceled,
    LeftQueue,
    Timeout,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AskRecord {
    pub time: DateTime<Utc>,
    pub user_id: UserId,
    pub source: Source,
    pub model: String,
    pub status: AskStatus,
    /// Seconds spent waiting for admission.
    pub queueing_time: Option<f64>,
    /// Seconds between admission and the end of the ask.
    pub ask_time: Option<f64>,
}

/// Asks of one model within one aggregation interval.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AskSummary {
    pub count: u64,
    pub completed: u64,
    /// Summed seconds; divide by `count` for the mean.
    pub queueing_time: f64,
    pub ask_time: f64,
}

pub struct AskLog {
    window: Duration,
    entries: Mutex<VecDeque<AskRecord>>,
}

impl AskLog {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, record: AskRecord) {
        let now = record.time;
        let mut entries = self.entries.lock();
        entries.push_back(record);
        self.expire(&mut entries, now);
    }

    pub fn entries_at(&self, now: DateTime<Utc>) -> Vec<AskRecord> {
        let mut entries = self.entries.lock();
        self.expire(&mut entries, now);
        entries.iter().cloned().collect()
    }

    /// Asks by `user_id` against `source` newer than `now - within`.
    pub fn count_recent(
        &self,
        user_id: UserId,
        source: Source,
        within: Duration,
        now: DateTime<Utc>,
    ) -> usize {
        let since = chrono::Duration::from_std(within)
            .ok()
            .and_then(|w| now.checked_sub_signed(w))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut entries = self.entries.lock();
        self.expire(&mut entries, now);
        entries
            .iter()
            .filter(|r| r.user_id == user_id && r.source == source && r.time > since)
            .count()
    }

    /// Live entries grouped by interval start (unix seconds) and model.
    pub fn aggregate(
        &self,
        interval: Duration,
        now: DateTime<Utc>,
    ) -> BTreeMap<i64, BTreeMap<String, AskSummary>> {
        let step = interval.as_secs().max(1) as i64;
        let mut groups: BTreeMap<i64, BTreeMap<String, AskSummary>> = BTreeMap::new();
        for record in self.entries_at(now) {
            let start = record.time.timestamp().div_euclid(step) * step;
            let summary = groups
                .entry(start)
                .or_default()
                .entry(record.model)
                .or_default();
            summary.count += 1;
            if record.status == AskStatus::Completed {
                summary.completed += 1;
            }
            summary.queueing_time += record.queueing_time.unwrap_or(0.0);
            summary.ask_time += record.ask_time.unwrap_or(0.0);
        }
        groups
    }

    fn expire(&self, entries: &mut VecDeque<AskRecord>, now: DateTime<Utc>) {
        let Some(horizon) = chrono::Duration::from_std(self.window)
            .ok()
            .and_then(|w| now.checked_sub_signed(w))
        else {
            return;
        };
        while entries.front().is_some_and(|r| r.time < horizon) {
            entries.pop_front();
        }
    }

    fn replace(&self, records: Vec<AskRecord>, now: DateTime<Utc>) {
        let mut entries = self.entries.lock();
        *entries = records.into_iter().collect();
        entries.make_contiguous().sort_by_key(|r| r.time);
        self.expire(&mut entries, now);
    }
}

pub struct UsageStats {
    requests: SlidingWindowCounter,
    asks: SlidingWindowCounter,
    log: AskLog,
}

#[derive(Serialize, Deserialize)]
struct CounterDump {
    interval_ms: u64,
    buckets: BTreeMap<i64, Bucket>,
}

#[derive(Serialize, Deserialize)]
struct StatsDump {
    request_counter: CounterDump,
    ask_counter: CounterDump,
    #[serde(default)]
    ask_log: Vec<AskRecord>,
}

impl UsageStats {
    pub fn new(config: &StatsConfig) -> Result<Self> {
        Ok(Self {
            requests: SlidingWindowCounter::new(config.request_window, config.request_interval)?,
            asks: SlidingWindowCounter::new(config.ask_window, config.ask_interval)?,
            log: AskLog::new(config.ask_log_window),
        })
    }

    pub fn requests(&self) -> &SlidingWindowCounter {
        &self.requests
    }

    pub fn asks(&self) -> &SlidingWindowCounter {
        &self.asks
    }

    pub fn log(&self) -> &AskLog {
        &self.log
    }

    pub fn record_request(&self, user_id: Option<UserId>) {
        self.requests.count(user_id);
    }

    pub fn record_ask(&self, record: AskRecord) {
        self.asks.count_at(record.time, Some(record.user_id));
        self.log.push(record);
    }

    pub fn dump(&self, path: &Path) -> Result<()> {
        let now = Utc::now();
        let dump = StatsDump {
            request_counter: counter_dump(&self.requests, now),
            ask_counter: counter_dump(&self.asks, now),
            ask_log: self.log.entries_at(now),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec(&dump)?)?;
        tracing::debug!(path = %path.display(), "usage statistics saved");
        Ok(())
    }

    /// Restore a previous dump. A missing file is not an error. A counter
    /// dumped with a different interval is discarded.
    pub fn load(&self, path: &Path) -> Result<()> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let dump: StatsDump = serde_json::from_slice(&bytes)?;

        restore_counter(&self.requests, dump.request_counter, "request");
        restore_counter(&self.asks, dump.ask_counter, "ask");
        self.log.replace(dump.ask_log, Utc::now());
        tracing::info!(path = %path.display(), "usage statistics restored");
        Ok(())
    }
}

fn counter_dump(counter: &SlidingWindowCounter, now: DateTime<Utc>) -> CounterDump {
    CounterDump {
        interval_ms: counter.interval().as_millis() as u64,
        buckets: counter.snapshot_at(now),
    }
}

fn restore_counter(counter: &SlidingWindowCounter, dump: CounterDump, name: &str) {
    let configured = counter.interval().as_millis() as u64;
    if dump.interval_ms != configured {
        tracing::warn!(
            counter = name,
            saved = dump.interval_ms,
            configured,
            "counter interval changed, discarding saved buckets"
        );
        return;
    }
    counter.restore(dump.buckets);
}
