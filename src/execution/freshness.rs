// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache age buckets, the hybrid freshness score and per-query latency
//! history used to resolve `Hybrid`.

use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;

use crate::storage::CachedData;

const FIVE_MIN: Duration = Duration::from_secs(5 * 60);
const THIRTY_MIN: Duration = Duration::from_secs(30 * 60);
const TWO_HOURS: Duration = Duration::from_secs(2 * 60 * 60);

/// Weight of the newest sample in the latency moving average.
const LATENCY_ALPHA: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    /// Synced under 5 minutes ago.
    High,
    /// Synced under 30 minutes ago.
    Medium,
    /// Older, or past its expiry.
    Stale,
}

impl Freshness {
    #[must_use]
    pub fn from_age(age: Duration) -> Self {
        if age < FIVE_MIN {
            Self::High
        } else if age < THIRTY_MIN {
            Self::Medium
        } else {
            Self::Stale
        }
    }

    /// Bucket for a cache entry; expired entries are always stale.
    #[must_use]
    pub fn of(entry: &CachedData, now_ms: u64) -> Self {
        if entry.is_expired(now_ms) {
            return Self::Stale;
        }
        Self::from_age(age_of(entry, now_ms))
    }
}

#[must_use]
pub fn age_of(entry: &CachedData, now_ms: u64) -> Duration {
    Duration::from_millis(now_ms.saturating_sub(entry.sync_timestamp))
}

/// Score from the average age of the cached tables: `< 5 min → 0.9`,
/// `< 30 min → 0.7`, `< 2 h → 0.4`, older or nothing cached `→ 0.1`.
#[must_use]
pub fn hybrid_freshness_score(ages: &[Duration]) -> f64 {
    if ages.is_empty() {
        return 0.1;
    }
    let avg = ages.iter().sum::<Duration>() / ages.len() as u32;
    if avg < FIVE_MIN {
        0.9
    } else if avg < THIRTY_MIN {
        0.7
    } else if avg < TWO_HOURS {
        0.4
    } else {
        0.1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Path {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, Default)]
struct Averages {
    local: Option<f64>,
    remote: Option<f64>,
}

fn blend(current: Option<f64>, sample: f64) -> f64 {
    match current {
        Some(avg) => avg + LATENCY_ALPHA * (sample - avg),
        None => sample,
    }
}

/// Exponential moving average of local and remote latency per query hash,
/// LRU-bounded.
pub struct LatencyHistory {
    entries: Mutex<LruCache<String, Averages>>,
}

impl LatencyHistory {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn record(&self, query_hash: &str, path: Path, elapsed: Duration) {
        let sample = elapsed.as_secs_f64() * 1000.0;
        let mut entries = self.entries.lock();
        let mut averages = entries.get(query_hash).copied().unwrap_or_default();
        match path {
            Path::Local => averages.local = Some(blend(averages.local, sample)),
            Path::Remote => averages.remote = Some(blend(averages.remote, sample)),
        }
        entries.put(query_hash.to_string(), averages);
    }

    /// `(local_ms, remote_ms)` moving averages.
    #[must_use]
    pub fn averages(&self, query_hash: &str) -> (Option<f64>, Option<f64>) {
        self.entries
            .lock()
            .peek(query_hash)
            .map(|a| (a.local, a.remote))
            .unwrap_or((None, None))
    }

    /// Strictly faster path; `Local` on a tie or missing history.
    #[must_use]
    pub fn faster(&self, query_hash: &str) -> Path {
        match self.averages(query_hash) {
            (Some(local), Some(remote)) if remote < local => Path::Remote,
            _ => Path::Local,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::CacheType;

    fn entry(sync: u64, expires: Option<u64>) -> CachedData {
        CachedData {
            data: vec![],
            sync_timestamp: sync,
            expires_at: expires,
            cache_type: CacheType::Temporary,
        }
    }

    #[test]
    fn test_age_buckets() {
        assert_eq!(Freshness::from_age(Duration::from_secs(10)), Freshness::High);
        assert_eq!(Freshness::from_age(FIVE_MIN), Freshness::Medium);
        assert_eq!(Freshness::from_age(Duration::from_secs(29 * 60)), Freshness::Medium);
        assert_eq!(Freshness::from_age(THIRTY_MIN), Freshness::Stale);
        assert_eq!(Freshness::from_age(Duration::from_secs(5 * 3600)), Freshness::Stale);
    }

    #[test]
    fn test_expired_entry_is_stale() {
        assert_eq!(Freshness::of(&entry(1_000, Some(2_000)), 1_500), Freshness::High);
        assert_eq!(Freshness::of(&entry(1_000, Some(2_000)), 2_000), Freshness::Stale);
    }

    #[test]
    fn test_hybrid_score() {
        assert_eq!(hybrid_freshness_score(&[]), 0.1);
        assert_eq!(hybrid_freshness_score(&[Duration::from_secs(60)]), 0.9);
        assert_eq!(hybrid_freshness_score(&[Duration::from_secs(60), Duration::from_secs(1_140)]), 0.7);
        assert_eq!(hybrid_freshness_score(&[Duration::from_secs(3_600)]), 0.4);
        assert_eq!(hybrid_freshness_score(&[TWO_HOURS]), 0.1);
    }

    #[test]
    fn test_latency_history() {
        let history = LatencyHistory::new(2);
        assert_eq!(history.faster("q1"), Path::Local);

        history.record("q1", Path::Local, Duration::from_millis(50));
        history.record("q1", Path::Remote, Duration::from_millis(10));
        assert_eq!(history.faster("q1"), Path::Remote);

        // Moving average pulls toward new samples
        history.record("q1", Path::Remote, Duration::from_millis(110));
        let (_, remote) = history.averages("q1");
        assert!((remote.unwrap() - 40.0).abs() < 1e-9);

        history.record("q2", Path::Local, Duration::from_millis(1));
        history.record("q3", Path::Local, Duration::from_millis(1));
        assert_eq!(history.len(), 2);
        assert_eq!(history.averages("q1"), (None, None));
    }
}
