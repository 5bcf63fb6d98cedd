//! Per-ad-unit backoff table. The exchange tells us how long to stay away; we refuse to fetch until then.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock};

/// Backoff instruction from one response. Forwarded as-is, absent duration included.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RateLimitDirective {
    pub duration_ms: Option<i64>,
    pub reason: Option<String>,
}

/// One stored block. Expired once `started_at + duration` has passed, whether or not still stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitRecord {
    pub started_at: u64,
    pub duration: Duration,
    pub reason: Option<String>,
}

impl RateLimitRecord {
    fn target_millis(&self) -> u64 {
        self.started_at
            .saturating_add(self.duration.as_millis() as u64)
    }

    /// Time left on the block at `now`, or None once expired.
    pub fn remaining_at(&self, now: u64) -> Option<Duration> {
        let target = self.target_millis();
        (now < target).then(|| Duration::from_millis(target - now))
    }
}

/// Shared by every orchestrator in the process. Reads take the read lock; register takes the write lock.
pub struct RateLimiter {
    records: RwLock<HashMap<String, RateLimitRecord>>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_clock(SystemClock::shared())
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Store a block for `ad_unit_id`. A missing or non-positive duration clears it instead.
    pub fn register(&self, ad_unit_id: &str, duration_ms: Option<i64>, reason: Option<&str>) {
        match duration_ms {
            Some(ms) if ms > 0 => {
                let record = RateLimitRecord {
                    started_at: self.clock.now_millis(),
                    duration: Duration::from_millis(ms as u64),
                    reason: reason.map(str::to_string),
                };
                info!(ad_unit_id, backoff_ms = ms, reason, "rate limit registered");
                self.records.write().insert(ad_unit_id.to_string(), record);
            }
            _ => {
                if self.records.write().remove(ad_unit_id).is_some() {
                    debug!(ad_unit_id, "rate limit cleared");
                }
            }
        }
    }

    pub fn apply(&self, ad_unit_id: &str, directive: &RateLimitDirective) {
        self.register(ad_unit_id, directive.duration_ms, directive.reason.as_deref());
    }

    pub fn is_blocked(&self, ad_unit_id: &str) -> bool {
        self.remaining(ad_unit_id).is_some()
    }

    /// Time until `ad_unit_id` may fetch again; None when not blocked.
    pub fn remaining(&self, ad_unit_id: &str) -> Option<Duration> {
        let now = self.clock.now_millis();
        self.records
            .read()
            .get(ad_unit_id)
            .and_then(|r| r.remaining_at(now))
    }

    /// Live record for `ad_unit_id`. Expired records read as absent.
    pub fn record(&self, ad_unit_id: &str) -> Option<RateLimitRecord> {
        let now = self.clock.now_millis();
        self.records
            .read()
            .get(ad_unit_id)
            .filter(|r| r.remaining_at(now).is_some())
            .cloned()
    }

    /// Time left and reason of a live block, read under one lock.
    pub fn active_block(&self, ad_unit_id: &str) -> Option<(Duration, Option<String>)> {
        let now = self.clock.now_millis();
        let records = self.records.read();
        let record = records.get(ad_unit_id)?;
        record
            .remaining_at(now)
            .map(|left| (left, record.reason.clone()))
    }

    /// Physically stored entries, expired ones included.
    pub fn stored_len(&self) -> usize {
        self.records.read().len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
