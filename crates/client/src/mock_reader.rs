//! Mock ChainReader for Testing
//!
//! Fully in-memory stand-in for the poll contract. No network calls.
//!
//! # Features
//!
//! - Settable totals, per-account eligibility and vote history
//! - Per-account and totals latency simulation (async, non-blocking)
//! - Failure injection per operation
//! - Call log for asserting which reads were issued
//! - `emit()` pushes an event into every open subscription
//!
//! # Example
//!
//! ```ignore
//! let reader = MockChainReader::new();
//! reader.set_totals(PollTotals::from_u64(10, 4));
//! let mut sub = reader.subscribe_votes().await?;
//! reader.emit(event.clone());
//! assert_eq!(sub.next().await, Some(event));
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use teapoll_common::{Address, PollTotals, SequenceKey, Sentiment, VoteEvent, U256};

use crate::chain_reader::{ChainReader, RpcError, VoteSubscription};

/// A read issued against the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderCall {
    Totals,
    CanVote(Address),
    Cooldown(Address),
    History(u64),
    Subscribe,
}

/// Operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Totals,
    Eligibility,
    Cooldown,
    History,
    Subscribe,
}

type Subscribers = Arc<Mutex<HashMap<u64, mpsc::UnboundedSender<VoteEvent>>>>;

/// In-memory poll contract.
pub struct MockChainReader {
    totals: Mutex<PollTotals>,
    /// account -> (can_vote, seconds until next vote)
    eligibility: Mutex<HashMap<Address, (bool, U256)>>,
    history: Mutex<Vec<VoteEvent>>,
    totals_latency: Mutex<Duration>,
    account_latency: Mutex<HashMap<Address, Duration>>,
    failing: Mutex<HashMap<MockOp, bool>>,
    /// Operations that fail on their next call only.
    fail_once: Mutex<HashSet<MockOp>>,
    calls: Mutex<Vec<ReaderCall>>,
    subscribers: Subscribers,
    next_subscriber: AtomicU64,
    /// Cooldown applied by `record_vote`.
    cooldown_secs: AtomicU64,
    closed_any: Arc<AtomicBool>,
}

impl std::fmt::Debug for MockChainReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockChainReader")
            .field("totals", &*self.totals.lock())
            .field("history_len", &self.history.lock().len())
            .field("subscribers", &self.subscribers.lock().len())
            .finish()
    }
}

impl MockChainReader {
    /// Empty contract: zero totals, no history, every account eligible.
    pub fn new() -> Self {
        Self {
            totals: Mutex::new(PollTotals::default()),
            eligibility: Mutex::new(HashMap::new()),
            history: Mutex::new(Vec::new()),
            totals_latency: Mutex::new(Duration::ZERO),
            account_latency: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashMap::new()),
            fail_once: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_subscriber: AtomicU64::new(1),
            cooldown_secs: AtomicU64::new(3600),
            closed_any: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_totals(&self, totals: PollTotals) {
        *self.totals.lock() = totals;
    }

    pub fn totals(&self) -> PollTotals {
        *self.totals.lock()
    }

    /// Set what `canVote` / `secondsUntilNextVote` return for an account.
    pub fn set_eligibility(&self, account: &Address, can_vote: bool, cooldown_secs: u64) {
        self.eligibility
            .lock()
            .insert(account.clone(), (can_vote, U256::from(cooldown_secs)));
    }

    /// Cooldown `record_vote` gives the voter.
    pub fn set_vote_cooldown(&self, secs: u64) {
        self.cooldown_secs.store(secs, Ordering::SeqCst);
    }

    /// Replace the stored history (oldest first).
    pub fn set_history(&self, events: Vec<VoteEvent>) {
        *self.history.lock() = events;
    }

    /// Latency of `get_totals`.
    pub fn set_totals_latency(&self, latency: Duration) {
        *self.totals_latency.lock() = latency;
    }

    /// Latency of every account-scoped read for `account`.
    pub fn set_account_latency(&self, account: &Address, latency: Duration) {
        self.account_latency.lock().insert(account.clone(), latency);
    }

    /// Make an operation fail (or succeed again) with `RpcError::Transport`.
    pub fn set_failing(&self, op: MockOp, failing: bool) {
        self.failing.lock().insert(op, failing);
    }

    /// Make the next call of an operation fail.
    pub fn fail_next(&self, op: MockOp) {
        self.fail_once.lock().insert(op);
    }

    /// All reads issued so far.
    pub fn calls(&self) -> Vec<ReaderCall> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Number of open subscriptions.
    pub fn active_subscriptions(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Whether any subscription was ever closed.
    pub fn any_closed(&self) -> bool {
        self.closed_any.load(Ordering::SeqCst)
    }

    /// Deliver an event to every open subscription.
    pub fn emit(&self, event: VoteEvent) {
        let subs = self.subscribers.lock();
        for tx in subs.values() {
            let _ = tx.send(event.clone());
        }
    }

    /// Apply a vote the way the contract would: bump the matching
    /// counter, start the voter's cooldown, append to history and emit.
    pub fn record_vote(&self, voter: &Address, sentiment: Sentiment, key: SequenceKey, timestamp: u64) -> VoteEvent {
        {
            let mut totals = self.totals.lock();
            match sentiment {
                Sentiment::Bull => totals.bullish += U256::from(1u8),
                Sentiment::Bear => totals.bearish += U256::from(1u8),
            }
        }
        let cooldown = self.cooldown_secs.load(Ordering::SeqCst);
        self.set_eligibility(voter, false, cooldown);

        let event = VoteEvent {
            voter: voter.clone(),
            sentiment,
            timestamp: U256::from(timestamp),
            sequence_key: key,
        };
        self.history.lock().push(event.clone());
        self.emit(event.clone());
        event
    }

    fn log(&self, call: ReaderCall) {
        self.calls.lock().push(call);
    }

    fn fail_if(&self, op: MockOp) -> Result<(), RpcError> {
        let once = self.fail_once.lock().remove(&op);
        if once || self.failing.lock().get(&op).copied().unwrap_or(false) {
            return Err(RpcError::Transport(format!("mock {:?} failure", op)));
        }
        Ok(())
    }

    async fn account_delay(&self, account: &Address) {
        let latency = self.account_latency.lock().get(account).copied();
        if let Some(d) = latency {
            if !d.is_zero() {
                tokio::time::sleep(d).await;
            }
        }
    }

    fn lookup(&self, account: &Address) -> (bool, U256) {
        self.eligibility
            .lock()
            .get(account)
            .copied()
            .unwrap_or((true, U256::ZERO))
    }
}

impl Default for MockChainReader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChainReader for MockChainReader {
    async fn get_totals(&self) -> Result<PollTotals, RpcError> {
        self.log(ReaderCall::Totals);
        let latency = *self.totals_latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.fail_if(MockOp::Totals)?;
        Ok(self.totals())
    }

    async fn can_vote(&self, account: &Address) -> Result<bool, RpcError> {
        self.log(ReaderCall::CanVote(account.clone()));
        self.account_delay(account).await;
        self.fail_if(MockOp::Eligibility)?;
        Ok(self.lookup(account).0)
    }

    async fn get_cooldown_remaining(&self, account: &Address) -> Result<U256, RpcError> {
        self.log(ReaderCall::Cooldown(account.clone()));
        self.account_delay(account).await;
        self.fail_if(MockOp::Cooldown)?;
        Ok(self.lookup(account).1)
    }

    async fn query_recent_votes(&self, lookback_blocks: u64) -> Result<Vec<VoteEvent>, RpcError> {
        self.log(ReaderCall::History(lookback_blocks));
        self.fail_if(MockOp::History)?;
        Ok(self.history.lock().clone())
    }

    async fn subscribe_votes(&self) -> Result<VoteSubscription, RpcError> {
        self.log(ReaderCall::Subscribe);
        self.fail_if(MockOp::Subscribe)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_subscriber.fetch_add(1, Ordering::SeqCst);
        self.subscribers.lock().insert(id, tx);
        debug!("mock subscription {} opened", id);

        let subscribers = Arc::clone(&self.subscribers);
        let closed_any = Arc::clone(&self.closed_any);
        Ok(VoteSubscription::new(rx, move || {
            subscribers.lock().remove(&id);
            closed_any.store(true, Ordering::SeqCst);
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(b: u8) -> Address {
        Address::from_bytes([b; 20])
    }

    #[tokio::test]
    async fn eligibility_defaults_to_eligible() {
        let reader = MockChainReader::new();
        let e = reader.get_eligibility(&addr(1)).await.unwrap();
        assert!(e.can_vote);
        assert_eq!(e.cooldown_remaining_secs, 0);
        assert_eq!(reader.calls(), vec![ReaderCall::CanVote(addr(1))]);
    }

    #[tokio::test]
    async fn cooling_down_reads_cooldown() {
        let reader = MockChainReader::new();
        reader.set_eligibility(&addr(1), false, 90);
        let e = reader.get_eligibility(&addr(1)).await.unwrap();
        assert!(!e.can_vote);
        assert_eq!(e.cooldown_remaining_secs, 90);
        assert_eq!(
            reader.calls(),
            vec![ReaderCall::CanVote(addr(1)), ReaderCall::Cooldown(addr(1))]
        );
    }

    #[tokio::test]
    async fn failure_injection() {
        let reader = MockChainReader::new();
        reader.set_failing(MockOp::Totals, true);
        assert!(matches!(reader.get_totals().await, Err(RpcError::Transport(_))));
        reader.set_failing(MockOp::Totals, false);
        assert!(reader.get_totals().await.is_ok());
    }

    #[tokio::test]
    async fn fail_next_fails_one_call() {
        let reader = MockChainReader::new();
        reader.fail_next(MockOp::Cooldown);
        assert!(reader.get_cooldown_remaining(&addr(2)).await.is_err());
        assert!(reader.get_cooldown_remaining(&addr(2)).await.is_ok());
    }

    #[tokio::test]
    async fn emit_reaches_open_subscriptions_only() {
        let reader = MockChainReader::new();
        let mut a = reader.subscribe_votes().await.unwrap();
        let mut b = reader.subscribe_votes().await.unwrap();
        assert_eq!(reader.active_subscriptions(), 2);

        b.close();
        assert_eq!(reader.active_subscriptions(), 1);
        assert!(reader.any_closed());

        let ev = reader.record_vote(&addr(2), Sentiment::Bull, SequenceKey::new(1, 0), 100);
        assert_eq!(a.next().await, Some(ev));
        assert_eq!(b.next().await, None);
        assert_eq!(reader.totals(), PollTotals::from_u64(1, 0));
        assert!(!reader.lookup(&addr(2)).0);
    }
}
