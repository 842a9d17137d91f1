//! Per-tenant runtime statistics

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::time::{Duration, Instant};

/// Counters kept for one tenant instance
///
/// Visit and error recording come from arbitrary handler tasks, so the
/// mutable parts live behind an `RwLock`. `snapshot()` is the only read
/// path and clones out under the read lock.
#[derive(Debug)]
pub struct RuntimeStats {
    /// Monotonic start for uptime math
    started: Instant,
    /// Wall-clock start for reporting
    started_at: DateTime<Utc>,
    inner: RwLock<StatsInner>,
}

#[derive(Debug, Default)]
struct StatsInner {
    visits: u64,
    errors: Vec<String>,
}

/// Point-in-time copy of a tenant's counters
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub visits: u64,
    pub error_count: usize,
    pub errors: Vec<String>,
    pub started_at: DateTime<Utc>,
    #[serde(rename = "uptime_secs", serialize_with = "serialize_secs")]
    pub uptime: Duration,
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_secs())
}

impl RuntimeStats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            started_at: Utc::now(),
            inner: RwLock::new(StatsInner::default()),
        }
    }

    /// Record one served page view
    pub fn record_visit(&self) {
        self.inner.write().visits += 1;
    }

    /// Record a tenant-level failure (bind errors, handler faults)
    pub fn record_error(&self, message: impl Into<String>) {
        self.inner.write().errors.push(message.into());
    }

    pub fn visits(&self) -> u64 {
        self.inner.read().visits
    }

    pub fn error_count(&self) -> usize {
        self.inner.read().errors.len()
    }

    /// Time since the stats object was created
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Copy all counters out under a single read lock
    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = self.inner.read();
        StatsSnapshot {
            visits: inner.visits,
            error_count: inner.errors.len(),
            errors: inner.errors.clone(),
            started_at: self.started_at,
            uptime: self.started.elapsed(),
        }
    }
}

impl Default for RuntimeStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_visit_and_error_counters() {
        let stats = RuntimeStats::new();
        assert_eq!(stats.visits(), 0);
        assert_eq!(stats.error_count(), 0);

        stats.record_visit();
        stats.record_visit();
        stats.record_error("listener bind failed");

        assert_eq!(stats.visits(), 2);
        assert_eq!(stats.error_count(), 1);

        let snap = stats.snapshot();
        assert_eq!(snap.visits, 2);
        assert_eq!(snap.errors, vec!["listener bind failed".to_string()]);
    }

    #[test]
    fn test_snapshot_is_detached() {
        let stats = RuntimeStats::new();
        stats.record_visit();
        let snap = stats.snapshot();
        stats.record_visit();

        assert_eq!(snap.visits, 1);
        assert_eq!(stats.visits(), 2);
    }

    // Multi-thread flavor, so the writers genuinely contend for the lock
    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_visits_all_counted() {
        let stats = Arc::new(RuntimeStats::new());

        let mut handles = Vec::new();
        for _ in 0..100 {
            let stats = Arc::clone(&stats);
            handles.push(tokio::spawn(async move {
                stats.record_visit();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(stats.visits(), 100);
    }

    #[test]
    fn test_snapshot_serializes_uptime_secs() {
        let stats = RuntimeStats::new();
        let json = serde_json::to_string(&stats.snapshot()).unwrap();
        assert!(json.contains("\"uptime_secs\":"));
        assert!(json.contains("\"visits\":0"));
    }
}
