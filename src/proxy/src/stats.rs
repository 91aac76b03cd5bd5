//! Lock-free counters for the running proxy (§3, §5): connection/session counts, query totals, and
//! blocked-query totals, plus a point-in-time snapshot with derived rates for the control socket's
//! `stats` command.

use serde::Serialize;
use std::sync::atomic::{self, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Default)]
pub struct StatsCollector {
    total_connections: AtomicU64,
    active_sessions: AtomicU64,
    total_queries: AtomicU64,
    blocked_queries: AtomicU64,
    started_at: once_started_at::OnceInstant,
}

mod once_started_at {
    use std::sync::OnceLock;
    use std::time::Instant;

    #[derive(Debug, Default)]
    pub struct OnceInstant(OnceLock<Instant>);

    impl OnceInstant {
        pub fn get_or_init(&self) -> Instant {
            *self.0.get_or_init(Instant::now)
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub total_connections: u64,
    pub active_sessions: u64,
    pub total_queries: u64,
    pub blocked_queries: u64,
    /// Queries per second since process start.
    pub queries_per_second: f64,
    /// Fraction of queries blocked, in `[0, 1]`. `0.0` when no queries have been seen.
    pub block_rate: f64,
    pub uptime_seconds: u64,
    /// Wall-clock time the snapshot was taken, Unix epoch milliseconds.
    pub captured_at_ms: u64,
}

impl StatsCollector {
    pub fn new() -> Self {
        let collector = StatsCollector::default();
        collector.started_at.get_or_init();
        collector
    }

    pub fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::AcqRel);
        self.active_sessions.fetch_add(1, Ordering::AcqRel);
    }

    pub fn connection_closed(&self) {
        self.active_sessions.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn query_seen(&self) {
        self.total_queries.fetch_add(1, Ordering::AcqRel);
    }

    pub fn query_blocked(&self) {
        self.blocked_queries.fetch_add(1, Ordering::AcqRel);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        atomic::fence(Ordering::Acquire);

        let total_queries = self.total_queries.load(Ordering::Relaxed);
        let blocked_queries = self.blocked_queries.load(Ordering::Relaxed);
        let uptime: Duration = self.started_at.get_or_init().elapsed();
        let uptime_secs = uptime.as_secs_f64();
        let captured_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        StatsSnapshot {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            total_queries,
            blocked_queries,
            queries_per_second: if uptime_secs > 0.0 {
                total_queries as f64 / uptime_secs
            } else {
                0.0
            },
            block_rate: if total_queries > 0 {
                blocked_queries as f64 / total_queries as f64
            } else {
                0.0
            },
            uptime_seconds: uptime.as_secs(),
            captured_at_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_connections_and_queries() {
        let stats = StatsCollector::new();
        stats.connection_opened();
        stats.connection_opened();
        stats.connection_closed();
        stats.query_seen();
        stats.query_seen();
        stats.query_blocked();

        let snap = stats.snapshot();
        assert_eq!(snap.total_connections, 2);
        assert_eq!(snap.active_sessions, 1);
        assert_eq!(snap.total_queries, 2);
        assert_eq!(snap.blocked_queries, 1);
        assert!((snap.block_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn block_rate_is_zero_with_no_queries() {
        let stats = StatsCollector::new();
        assert_eq!(stats.snapshot().block_rate, 0.0);
    }

    #[test]
    fn snapshot_carries_a_wall_clock_timestamp() {
        let stats = StatsCollector::new();
        assert!(stats.snapshot().captured_at_ms > 0);
    }
}
