//! Recent Vote Feed
//!
//! Bounded, deduplicated, newest-first feed of `Voted` events.
//!
//! ## Window / Pending Rule
//!
//! ```text
//! window.len() < 5   ──insert──▶ window (sorted newest-first)
//! window.len() == 5  ──insert──▶ pending
//! pending.len() == 5 ─────────▶ window := pending, pending := []
//! ```
//!
//! Events are identified by [`SequenceKey`]. A key already in the
//! window, in pending, or among the recently seen keys is dropped, so
//! redelivered events never change the feed.
//!
//! The transition is a pure function, [`FeedState::apply`]; the
//! [`RecentVoteFeed`] wrapper only owns the current state.

use std::collections::{HashSet, VecDeque};

use teapoll_common::{RecentVoteWindow, SequenceKey, VoteEvent, FEED_CAPACITY};

const DEFAULT_DEDUP_MEMORY: usize = 256;

/// What `insert` did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Key already known; state unchanged.
    Duplicate,
    /// Added to the window.
    Added,
    /// Window full; added to pending, which now holds `n` events.
    Pending(usize),
    /// Pending reached capacity and replaced the window.
    Rotated,
}

/// Bounded memory of sequence keys seen so far.
#[derive(Debug, Clone)]
struct SeenKeys {
    order: VecDeque<SequenceKey>,
    set: HashSet<SequenceKey>,
    capacity: usize,
}

impl SeenKeys {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            set: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    fn contains(&self, key: &SequenceKey) -> bool {
        self.set.contains(key)
    }

    fn remember(&mut self, key: SequenceKey) {
        if !self.set.insert(key) {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
    }
}

/// Feed state: the displayed window, the pending batch and seen keys.
#[derive(Debug, Clone)]
pub struct FeedState {
    window: Vec<VoteEvent>,
    pending: Vec<VoteEvent>,
    seen: SeenKeys,
}

impl Default for FeedState {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_MEMORY)
    }
}

/// Insert keeping newest-first order by sequence key.
fn insert_sorted(list: &mut Vec<VoteEvent>, event: VoteEvent) {
    let pos = list
        .iter()
        .position(|e| e.sequence_key < event.sequence_key)
        .unwrap_or(list.len());
    list.insert(pos, event);
}

impl FeedState {
    /// Empty feed remembering up to `dedup_memory` keys.
    pub fn new(dedup_memory: usize) -> Self {
        Self {
            window: Vec::with_capacity(FEED_CAPACITY),
            pending: Vec::with_capacity(FEED_CAPACITY),
            seen: SeenKeys::new(dedup_memory),
        }
    }

    fn knows(&self, key: &SequenceKey) -> bool {
        self.seen.contains(key)
            || self
                .window
                .iter()
                .chain(self.pending.iter())
                .any(|e| e.sequence_key == *key)
    }

    /// Apply one event.
    pub fn apply(mut self, event: VoteEvent) -> (FeedState, InsertOutcome) {
        let outcome = self.step(event);
        (self, outcome)
    }

    /// Seed from history (newest first). No-op unless the window is empty.
    ///
    /// Returns whether anything was seeded.
    pub fn seed(mut self, events: Vec<VoteEvent>) -> (FeedState, bool) {
        let seeded = self.seed_in_place(events);
        (self, seeded)
    }

    fn step(&mut self, event: VoteEvent) -> InsertOutcome {
        let key = event.sequence_key;
        if self.knows(&key) {
            return InsertOutcome::Duplicate;
        }
        self.seen.remember(key);

        if self.window.len() < FEED_CAPACITY {
            insert_sorted(&mut self.window, event);
            return InsertOutcome::Added;
        }

        insert_sorted(&mut self.pending, event);
        if self.pending.len() >= FEED_CAPACITY {
            self.window = std::mem::take(&mut self.pending);
            return InsertOutcome::Rotated;
        }
        InsertOutcome::Pending(self.pending.len())
    }

    fn seed_in_place(&mut self, events: Vec<VoteEvent>) -> bool {
        if !self.window.is_empty() {
            return false;
        }
        let mut seeded = false;
        for event in events {
            if self.window.len() >= FEED_CAPACITY {
                break;
            }
            if self.knows(&event.sequence_key) {
                continue;
            }
            self.seen.remember(event.sequence_key);
            insert_sorted(&mut self.window, event);
            seeded = true;
        }
        seeded
    }

    pub fn window(&self) -> RecentVoteWindow {
        RecentVoteWindow {
            window: self.window.clone(),
            pending: self.pending.clone(),
        }
    }
}

/// Single-owner holder of the feed state.
#[derive(Debug, Default)]
pub struct RecentVoteFeed {
    state: FeedState,
}

impl RecentVoteFeed {
    pub fn new(dedup_memory: usize) -> Self {
        Self {
            state: FeedState::new(dedup_memory),
        }
    }

    /// Same transition as [`FeedState::apply`], in place.
    pub fn insert(&mut self, event: VoteEvent) -> InsertOutcome {
        self.state.step(event)
    }

    /// One-time initial load; see [`FeedState::seed`].
    pub fn seed(&mut self, events: Vec<VoteEvent>) -> bool {
        self.state.seed_in_place(events)
    }

    pub fn snapshot(&self) -> RecentVoteWindow {
        self.state.window()
    }

    /// `(collected, needed)` for the "n/5 new votes collected" indicator.
    ///
    /// Only meaningful while the window is full; otherwise `(0, 5)`.
    pub fn pending_progress(&self) -> (usize, usize) {
        (self.state.pending.len(), FEED_CAPACITY)
    }
}
