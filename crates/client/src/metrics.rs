//! Synchronizer Metrics Module
//!
//! Lock-free counters describing what the vote-state synchronizer did.
//!
//! ## Metrics Tracked
//!
//! | Metric | Description |
//! |--------|-------------|
//! | polls_issued | Polls started (inline or spawned) |
//! | polls_applied | Poll results published to the snapshot |
//! | polls_stale | Results dropped: newer poll issued or epoch advanced |
//! | polls_coalesced | Requests folded into the trailing re-poll |
//! | polls_failed | Polls that returned an RPC error |
//! | events_received | Live `Voted` events forwarded to the feed |
//! | events_duplicate | Events dropped as already seen |
//! | votes_submitted | Vote transactions confirmed |
//! | votes_failed | Vote submissions that returned an error |
//!
//! Increments use `Ordering::Relaxed`; reads use `Ordering::SeqCst`.

use std::sync::atomic::{AtomicU64, Ordering};

/// Plain-data copy of [`SyncMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncMetricsSnapshot {
    pub polls_issued: u64,
    pub polls_applied: u64,
    pub polls_stale: u64,
    pub polls_coalesced: u64,
    pub polls_failed: u64,
    pub events_received: u64,
    pub events_duplicate: u64,
    pub votes_submitted: u64,
    pub votes_failed: u64,
}

/// Counters for one synchronizer.
#[derive(Debug, Default)]
pub struct SyncMetrics {
    polls_issued: AtomicU64,
    polls_applied: AtomicU64,
    polls_stale: AtomicU64,
    polls_coalesced: AtomicU64,
    polls_failed: AtomicU64,
    events_received: AtomicU64,
    events_duplicate: AtomicU64,
    votes_submitted: AtomicU64,
    votes_failed: AtomicU64,
}

impl SyncMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ════════════════════════════════════════════════════════════════════════════
    // INCREMENT METHODS
    // ════════════════════════════════════════════════════════════════════════════

    pub fn record_poll_issued(&self) {
        self.polls_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_poll_applied(&self) {
        self.polls_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_poll_stale(&self) {
        self.polls_stale.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_poll_coalesced(&self) {
        self.polls_coalesced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_poll_failed(&self) {
        self.polls_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event_received(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event_duplicate(&self) {
        self.events_duplicate.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_vote_submitted(&self) {
        self.votes_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_vote_failed(&self) {
        self.votes_failed.fetch_add(1, Ordering::Relaxed);
    }

    // ════════════════════════════════════════════════════════════════════════════
    // READ / EXPORT
    // ════════════════════════════════════════════════════════════════════════════

    /// Read every counter.
    ///
    /// Not atomic across fields; each counter is read independently.
    #[must_use]
    pub fn snapshot(&self) -> SyncMetricsSnapshot {
        SyncMetricsSnapshot {
            polls_issued: self.polls_issued.load(Ordering::SeqCst),
            polls_applied: self.polls_applied.load(Ordering::SeqCst),
            polls_stale: self.polls_stale.load(Ordering::SeqCst),
            polls_coalesced: self.polls_coalesced.load(Ordering::SeqCst),
            polls_failed: self.polls_failed.load(Ordering::SeqCst),
            events_received: self.events_received.load(Ordering::SeqCst),
            events_duplicate: self.events_duplicate.load(Ordering::SeqCst),
            votes_submitted: self.votes_submitted.load(Ordering::SeqCst),
            votes_failed: self.votes_failed.load(Ordering::SeqCst),
        }
    }

    /// Export in Prometheus text exposition format.
    ///
    /// ## Guarantees
    ///
    /// - One HELP/TYPE pair per counter, all counters typed `counter`
    /// - Deterministic output order
    #[must_use]
    pub fn to_prometheus(&self) -> String {
        let s = self.snapshot();
        let rows: [(&str, &str, u64); 9] = [
            ("polls_issued", "Polls started", s.polls_issued),
            ("polls_applied", "Poll results published", s.polls_applied),
            ("polls_stale", "Poll results discarded as stale", s.polls_stale),
            ("polls_coalesced", "Poll requests folded into a trailing re-poll", s.polls_coalesced),
            ("polls_failed", "Polls that failed with an RPC error", s.polls_failed),
            ("events_received", "Live vote events received", s.events_received),
            ("events_duplicate", "Live vote events dropped as duplicates", s.events_duplicate),
            ("votes_submitted", "Vote transactions confirmed", s.votes_submitted),
            ("votes_failed", "Vote submissions that failed", s.votes_failed),
        ];
        let mut out = String::new();
        for (name, help, value) in rows {
            out.push_str(&format!(
                "# HELP teapoll_sync_{name}_total {help}\n\
                 # TYPE teapoll_sync_{name}_total counter\n\
                 teapoll_sync_{name}_total {value}\n"
            ));
        }
        out
    }
}
