//! Ingest metrics for observability
//!
//! Counters for the chat → vote → save pipeline.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug, Default)]
pub struct IngestMetrics {
    /// Channel signals delivered to listeners (messages, closes, revocations)
    pub signals_received: AtomicU64,
    pub votes_accepted: AtomicU64,
    pub votes_rejected: AtomicU64,
    pub saves_succeeded: AtomicU64,
    pub saves_failed: AtomicU64,
    /// Editors dropped from the cache to make room
    pub evictions: AtomicU64,

    start_time: Option<Instant>,
}

impl IngestMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn signal_received(&self) {
        self.signals_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn vote_accepted(&self) {
        self.votes_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn vote_rejected(&self) {
        self.votes_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn save_succeeded(&self) {
        self.saves_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn save_failed(&self) {
        self.saves_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn evicted(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            signals_received: self.signals_received.load(Ordering::Relaxed),
            votes: VoteMetrics {
                accepted: self.votes_accepted.load(Ordering::Relaxed),
                rejected: self.votes_rejected.load(Ordering::Relaxed),
            },
            saves: SaveMetrics {
                succeeded: self.saves_succeeded.load(Ordering::Relaxed),
                failed: self.saves_failed.load(Ordering::Relaxed),
            },
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub signals_received: u64,
    pub votes: VoteMetrics,
    pub saves: SaveMetrics,
    pub evictions: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VoteMetrics {
    pub accepted: u64,
    pub rejected: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SaveMetrics {
    pub succeeded: u64,
    pub failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_snapshot() {
        let m = IngestMetrics::new();
        m.signal_received();
        m.signal_received();
        m.vote_accepted();
        m.vote_rejected();
        m.vote_rejected();
        m.save_succeeded();
        m.save_failed();
        m.evicted();

        let s = m.snapshot();
        assert_eq!(s.signals_received, 2);
        assert_eq!(s.votes, VoteMetrics { accepted: 1, rejected: 2 });
        assert_eq!(s.saves, SaveMetrics { succeeded: 1, failed: 1 });
        assert_eq!(s.evictions, 1);
    }

    #[test]
    fn default_has_no_uptime() {
        assert_eq!(IngestMetrics::default().uptime_secs(), 0);
    }

    #[test]
    fn snapshot_serializes_nested() {
        let json = serde_json::to_value(IngestMetrics::new().snapshot()).unwrap();
        assert_eq!(json["votes"]["accepted"], 0);
        assert_eq!(json["saves"]["failed"], 0);
    }
}
