//! # Vote State Synchronizer
//!
//! Merges the three signals that change the poll view into one
//! published [`Snapshot`]:
//!
//! 1. Polled contract reads (totals + eligibility)
//! 2. The live `Voted` event subscription
//! 3. Votes sent from this client
//!
//! ## Data Flow
//!
//! ```text
//!  WalletSession ──SessionChange──┐
//!                                 ▼
//!  ChainReader ──VoteEvent──▶ ┌──────────────────────┐
//!        ▲                    │ VoteStateSynchronizer │──watch──▶ Snapshot
//!        └──── poll ───────── │  epoch · gate · feed  │
//!  CooldownClock ──expired──▶ └──────────────────────┘
//! ```
//!
//! ## Epochs
//!
//! Every session change (and shutdown) advances a monotonic epoch. A
//! poll captures the epoch when it is issued and its result is applied
//! only if the epoch is unchanged AND it is still the last poll issued.
//! Anything else is dropped as stale.
//!
//! ## Poll Coalescing
//!
//! At most one poll runs per epoch. Requests arriving while it runs set
//! a single trailing flag; when the running poll finishes, one more poll
//! is issued if the flag is set.
//!
//! ## Lock Order
//!
//! `gate` → `state` → `feed`. The subscription slot is only taken
//! after `state` or on its own. It holds the subscription handle and its
//! forwarder task together, so they are installed and closed as one.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use teapoll_common::{
    display_secs, Account, Config, Eligibility, PollTotals, Sentiment, Snapshot, VoteEvent,
};

use crate::chain_reader::{ChainReader, RpcError, SubscriptionHandle};
use crate::cooldown_clock::CooldownClock;
use crate::metrics::{SyncMetrics, SyncMetricsSnapshot};
use crate::recent_feed::{InsertOutcome, RecentVoteFeed};
use crate::wallet_session::{TxReceipt, WalletError, WalletSession};

// ════════════════════════════════════════════════════════════════════════════════
// PUBLIC TYPES
// ════════════════════════════════════════════════════════════════════════════════

/// Why a poll was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollCause {
    Startup,
    Refresh,
    SessionChange,
    LiveEvent,
    CooldownExpired,
    PostVote,
}

/// Result of one poll request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Result published.
    Applied,
    /// Another poll was running; folded into its trailing re-poll.
    Coalesced,
    /// Superseded by a newer poll or a session change; dropped.
    Stale,
    /// A read failed; snapshot unchanged.
    Failed(RpcError),
}

/// Errors returned by [`VoteStateSynchronizer::submit_vote`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VoteError {
    #[error("connect a wallet to vote")]
    NoAccount,

    #[error("no wallet provider found; install a browser wallet to continue")]
    NoProvider,

    #[error("vote rejected in wallet")]
    UserRejected,

    #[error("vote transaction reverted: {0}")]
    TransactionReverted(String),

    #[error("vote failed: {0}")]
    Rpc(String),
}

impl From<WalletError> for VoteError {
    fn from(e: WalletError) -> Self {
        match e {
            WalletError::NoProvider => VoteError::NoProvider,
            WalletError::UserRejected => VoteError::UserRejected,
            WalletError::NoAccount => VoteError::NoAccount,
            WalletError::TransactionReverted(reason) => VoteError::TransactionReverted(reason),
            WalletError::ChainSwitchFailed(reason) | WalletError::Rpc(reason) => VoteError::Rpc(reason),
        }
    }
}

/// Side channel for errors the synchronizer swallows.
///
/// Read failures never reach the snapshot; they are reported here.
pub trait SyncObserver: Send + Sync {
    fn poll_failed(&self, cause: PollCause, error: &RpcError);

    fn subscription_failed(&self, _error: &RpcError) {}

    fn history_failed(&self, _error: &RpcError) {}
}

/// Observer that logs through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl SyncObserver for TracingObserver {
    fn poll_failed(&self, cause: PollCause, error: &RpcError) {
        warn!("poll ({:?}) failed: {}", cause, error);
    }

    fn subscription_failed(&self, error: &RpcError) {
        warn!("vote subscription failed: {}", error);
    }

    fn history_failed(&self, error: &RpcError) {
        warn!("recent vote history unavailable: {}", error);
    }
}

/// Tunables taken from [`Config`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    pub history_lookback_blocks: u64,
    pub dedup_memory: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            history_lookback_blocks: 5000,
            dedup_memory: 256,
        }
    }
}

impl SyncOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            history_lookback_blocks: cfg.history_lookback_blocks,
            dedup_memory: cfg.dedup_memory,
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// INTERNAL STATE
// ════════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct SyncState {
    epoch: u64,
    account: Option<Account>,
    totals: PollTotals,
    eligibility: Option<Eligibility>,
    last_issued: u64,
}

/// An open vote subscription and the task forwarding its events.
struct LiveSubscription {
    handle: SubscriptionHandle,
    forwarder: JoinHandle<()>,
}

impl LiveSubscription {
    fn close(self) {
        debug!("closing vote subscription {}", self.handle.id());
        self.handle.close();
        self.forwarder.abort();
    }
}

#[derive(Debug, Default)]
struct PollGate {
    epoch: u64,
    in_flight: bool,
    trailing: bool,
}

struct SyncInner {
    reader: Arc<dyn ChainReader>,
    session: Arc<WalletSession>,
    options: SyncOptions,
    gate: Mutex<PollGate>,
    state: Mutex<SyncState>,
    feed: Mutex<RecentVoteFeed>,
    clock: CooldownClock,
    expired_rx: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
    snapshot_tx: watch::Sender<Snapshot>,
    subscription: Mutex<Option<LiveSubscription>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    next_poll: AtomicU64,
    history_seeded: AtomicBool,
    running: AtomicBool,
    observer: Arc<dyn SyncObserver>,
    metrics: SyncMetrics,
}

// ════════════════════════════════════════════════════════════════════════════════
// SYNCHRONIZER
// ════════════════════════════════════════════════════════════════════════════════

/// Owner of the published [`Snapshot`].
///
/// ## Lifecycle
///
/// 1. `new(reader, session, options)`
/// 2. `start()`: follow the session, open the subscription, seed history, poll
/// 3. `subscribe()` / `snapshot()` to read state
/// 4. `refresh()` / `submit_vote()` on user action
/// 5. `shutdown()`
///
/// Cloning shares the same synchronizer.
#[derive(Clone)]
pub struct VoteStateSynchronizer {
    inner: Arc<SyncInner>,
}

impl VoteStateSynchronizer {
    pub fn new(reader: Arc<dyn ChainReader>, session: Arc<WalletSession>, options: SyncOptions) -> Self {
        Self::with_observer(reader, session, options, Arc::new(TracingObserver))
    }

    pub fn with_observer(
        reader: Arc<dyn ChainReader>,
        session: Arc<WalletSession>,
        options: SyncOptions,
        observer: Arc<dyn SyncObserver>,
    ) -> Self {
        let (clock, expired_rx) = CooldownClock::new();
        let (snapshot_tx, _) = watch::channel(Snapshot::default());
        Self {
            inner: Arc::new(SyncInner {
                reader,
                session,
                options,
                gate: Mutex::new(PollGate::default()),
                state: Mutex::new(SyncState::default()),
                feed: Mutex::new(RecentVoteFeed::new(options.dedup_memory)),
                clock,
                expired_rx: Mutex::new(Some(expired_rx)),
                snapshot_tx,
                subscription: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                next_poll: AtomicU64::new(1),
                history_seeded: AtomicBool::new(false),
                running: AtomicBool::new(false),
                observer,
                metrics: SyncMetrics::new(),
            }),
        }
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> Snapshot {
        self.inner.snapshot_tx.borrow().clone()
    }

    /// Receive every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.inner.snapshot_tx.subscribe()
    }

    /// Locally ticking cooldown, in seconds.
    pub fn cooldown(&self) -> watch::Receiver<u64> {
        self.inner.clock.watch()
    }

    pub fn epoch(&self) -> u64 {
        self.inner.state.lock().epoch
    }

    pub fn metrics(&self) -> SyncMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn metrics_prometheus(&self) -> String {
        self.inner.metrics.to_prometheus()
    }

    /// `(collected, needed)` for the pending vote batch.
    pub fn pending_progress(&self) -> (usize, usize) {
        self.inner.feed.lock().pending_progress()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Start following the session and the chain.
    ///
    /// Adopts the session's current account, opens the vote
    /// subscription, loads recent history once and runs the first poll.
    /// Returns `false` if already running.
    pub async fn start(&self) -> bool {
        let inner = &self.inner;
        if inner.running.swap(true, Ordering::SeqCst) {
            return false;
        }

        let mut changes = inner.session.subscribe();
        let epoch = {
            let mut gate = inner.gate.lock();
            let mut st = inner.state.lock();
            st.account = inner.session.current_account();
            gate.epoch = st.epoch;
            inner.publish(&st);
            st.epoch
        };

        let follower = Arc::clone(inner);
        let session_task = tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => follower.on_session_change(change.account).await,
                    Err(RecvError::Lagged(n)) => {
                        warn!("missed {} session changes, re-reading account", n);
                        let account = follower.session.current_account();
                        follower.on_session_change(account).await;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        inner.tasks.lock().push(session_task);

        // Spawned once; ends when the clock is dropped with the synchronizer.
        let expired = inner.expired_rx.lock().take();
        if let Some(mut expired) = expired {
            let weak = Arc::downgrade(inner);
            tokio::spawn(async move {
                while expired.recv().await.is_some() {
                    let Some(poller) = weak.upgrade() else { break };
                    if poller.running.load(Ordering::SeqCst) {
                        debug!("cooldown expired, re-polling");
                        poller.request_poll(PollCause::CooldownExpired);
                    }
                }
            });
        }

        inner.resubscribe(epoch).await;
        inner.seed_history().await;
        let outcome = inner.run_poll(PollCause::Startup).await;
        info!("synchronizer started (epoch {}, first poll {:?})", epoch, outcome);
        true
    }

    /// Stop all background work. Late results are dropped.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        if !inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        {
            let mut gate = inner.gate.lock();
            let mut st = inner.state.lock();
            st.epoch += 1;
            *gate = PollGate {
                epoch: st.epoch,
                ..PollGate::default()
            };
        }
        inner.close_subscription();
        for task in inner.tasks.lock().drain(..) {
            task.abort();
        }
        inner.clock.reset();
        info!("synchronizer stopped");
    }

    /// Poll now and wait for the outcome.
    pub async fn refresh(&self) -> PollOutcome {
        self.inner.run_poll(PollCause::Refresh).await
    }

    /// Poll in the background.
    pub fn request_poll(&self, cause: PollCause) {
        self.inner.request_poll(cause);
    }

    /// Cast a vote from the connected account.
    ///
    /// ## Phases
    ///
    /// 1. Send the transaction and wait for it to be mined
    /// 2. Optimistic apply: `can_vote = false` and a fresh cooldown read
    /// 3. Reconcile: one full poll
    ///
    /// If phase 1 fails the error is returned and the snapshot is not
    /// touched. With no account connected, fails with
    /// [`VoteError::NoAccount`] before any network call.
    pub async fn submit_vote(&self, sentiment: Sentiment) -> Result<TxReceipt, VoteError> {
        let inner = &self.inner;
        let account = match inner.session.current_account() {
            Some(a) => a,
            None => {
                inner.metrics.record_vote_failed();
                return Err(VoteError::NoAccount);
            }
        };
        let epoch = inner.state.lock().epoch;

        let receipt = match inner.send_and_confirm(sentiment).await {
            Ok(r) => r,
            Err(e) => {
                inner.metrics.record_vote_failed();
                warn!("vote {} failed: {}", sentiment, e);
                return Err(e);
            }
        };
        inner.metrics.record_vote_submitted();
        info!("vote {} confirmed in block {}", sentiment, receipt.block_number);

        inner.optimistic_apply(epoch, &account).await;
        inner.reconcile().await;
        Ok(receipt)
    }
}

impl SyncInner {
    fn publish(&self, st: &SyncState) {
        let snapshot = Snapshot {
            epoch: st.epoch,
            account: st.account.clone(),
            totals: st.totals,
            eligibility: st.eligibility,
            recent: self.feed.lock().snapshot(),
        };
        self.snapshot_tx.send_replace(snapshot);
    }

    fn request_poll(self: &Arc<Self>, cause: PollCause) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.run_poll(cause).await;
        });
    }

    /// Run a poll through the gate, plus any trailing re-polls.
    async fn run_poll(&self, cause: PollCause) -> PollOutcome {
        let (epoch, mut seq, account) = {
            let mut gate = self.gate.lock();
            if gate.in_flight {
                gate.trailing = true;
                self.metrics.record_poll_coalesced();
                return PollOutcome::Coalesced;
            }
            gate.in_flight = true;
            let mut st = self.state.lock();
            let seq = self.issue(&mut st);
            (st.epoch, seq, st.account.clone())
        };

        let mut cause = cause;
        loop {
            let outcome = self.poll_once(cause, epoch, seq, account.as_ref()).await;

            let next = {
                let mut gate = self.gate.lock();
                if gate.epoch != epoch {
                    // The gate now belongs to a newer epoch.
                    None
                } else if !gate.trailing {
                    gate.in_flight = false;
                    None
                } else {
                    gate.trailing = false;
                    let mut st = self.state.lock();
                    Some(self.issue(&mut st))
                }
            };
            match next {
                Some(s) => {
                    seq = s;
                    cause = PollCause::Refresh;
                }
                None => return outcome,
            }
        }
    }

    fn issue(&self, st: &mut SyncState) -> u64 {
        let seq = self.next_poll.fetch_add(1, Ordering::SeqCst);
        st.last_issued = seq;
        self.metrics.record_poll_issued();
        seq
    }

    async fn poll_once(
        &self,
        cause: PollCause,
        epoch: u64,
        seq: u64,
        account: Option<&Account>,
    ) -> PollOutcome {
        let eligibility = async {
            match account {
                Some(a) => self.reader.get_eligibility(&a.address).await.map(Some),
                None => Ok(None),
            }
        };
        let (totals, eligibility) = tokio::join!(self.reader.get_totals(), eligibility);

        let mut st = self.state.lock();
        if st.epoch != epoch || st.last_issued != seq {
            debug!("dropping stale poll #{} (epoch {}, now {})", seq, epoch, st.epoch);
            self.metrics.record_poll_stale();
            return PollOutcome::Stale;
        }
        let (totals, eligibility) = match (totals, eligibility) {
            (Ok(t), Ok(e)) => (t, e),
            (Err(e), _) | (_, Err(e)) => {
                drop(st);
                self.metrics.record_poll_failed();
                self.observer.poll_failed(cause, &e);
                return PollOutcome::Failed(e);
            }
        };

        st.totals = totals;
        st.eligibility = eligibility;
        if let Some(e) = eligibility {
            self.clock.set(e.cooldown_remaining_secs);
        }
        self.publish(&st);
        self.metrics.record_poll_applied();
        PollOutcome::Applied
    }

    async fn on_session_change(self: &Arc<Self>, account: Option<Account>) {
        let epoch = {
            let mut gate = self.gate.lock();
            let mut st = self.state.lock();
            st.epoch += 1;
            st.account = account;
            st.eligibility = None;
            *gate = PollGate {
                epoch: st.epoch,
                ..PollGate::default()
            };
            self.clock.reset();
            self.publish(&st);
            st.epoch
        };
        debug!("session changed, epoch {}", epoch);
        self.request_poll(PollCause::SessionChange);
        self.resubscribe(epoch).await;
    }

    fn close_subscription(&self) {
        let live = self.subscription.lock().take();
        if let Some(live) = live {
            live.close();
        }
    }

    /// Replace the vote subscription. The old one is closed first.
    async fn resubscribe(self: &Arc<Self>, epoch: u64) {
        let old = {
            let st = self.state.lock();
            if st.epoch != epoch {
                return;
            }
            self.subscription.lock().take()
        };
        if let Some(old) = old {
            old.close();
        }
        let sub = match self.reader.subscribe_votes().await {
            Ok(s) => s,
            Err(e) => {
                self.observer.subscription_failed(&e);
                return;
            }
        };
        let (handle, mut events) = sub.into_parts();
        let inner = Arc::clone(self);
        let forwarder = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                inner.on_vote_event(event);
            }
        });
        let live = LiveSubscription { handle, forwarder };

        let st = self.state.lock();
        if st.epoch != epoch || !self.running.load(Ordering::SeqCst) {
            // A newer session change owns the slot.
            drop(st);
            live.close();
            return;
        }
        debug!("vote subscription {} open (epoch {})", live.handle.id(), epoch);
        let old = self.subscription.lock().replace(live);
        drop(st);
        if let Some(old) = old {
            old.close();
        }
    }

    fn on_vote_event(self: &Arc<Self>, event: VoteEvent) {
        self.metrics.record_event_received();
        {
            let st = self.state.lock();
            let outcome = self.feed.lock().insert(event);
            match outcome {
                InsertOutcome::Duplicate => self.metrics.record_event_duplicate(),
                _ => self.publish(&st),
            }
        }
        self.request_poll(PollCause::LiveEvent);
    }

    /// Load recent history into the feed, once per lifetime.
    async fn seed_history(&self) {
        if self.history_seeded.swap(true, Ordering::SeqCst) {
            return;
        }
        match self.reader.query_recent_votes(self.options.history_lookback_blocks).await {
            Ok(mut events) => {
                events.reverse();
                let st = self.state.lock();
                let seeded = self.feed.lock().seed(events);
                if seeded {
                    self.publish(&st);
                } else {
                    debug!("history not seeded: feed already populated");
                }
            }
            Err(e) => self.observer.history_failed(&e),
        }
    }

    async fn send_and_confirm(&self, sentiment: Sentiment) -> Result<TxReceipt, VoteError> {
        let hash = self.session.send_vote(sentiment).await?;
        Ok(self.session.wait_for_confirmation(&hash).await?)
    }

    /// Mark the account as just-voted and read its new cooldown.
    ///
    /// Any poll still in flight was issued before the vote, so it is
    /// superseded here. If the cooldown read fails, a full poll runs
    /// instead.
    async fn optimistic_apply(&self, epoch: u64, account: &Account) {
        {
            let mut st = self.state.lock();
            if st.epoch != epoch {
                return;
            }
            st.last_issued = self.next_poll.fetch_add(1, Ordering::SeqCst);
            let remaining = st.eligibility.map_or(0, |e| e.cooldown_remaining_secs);
            st.eligibility = Some(Eligibility::cooling_down(remaining));
            self.publish(&st);
        }

        match self.reader.get_cooldown_remaining(&account.address).await {
            Ok(secs) => {
                let secs = display_secs(secs);
                let mut st = self.state.lock();
                if st.epoch != epoch {
                    return;
                }
                st.eligibility = Some(Eligibility::cooling_down(secs));
                self.clock.set(secs);
                self.publish(&st);
            }
            Err(e) => {
                self.observer.poll_failed(PollCause::PostVote, &e);
                self.run_poll(PollCause::PostVote).await;
            }
        }
    }

    /// Bring the snapshot back in line with the chain after a vote.
    async fn reconcile(&self) -> PollOutcome {
        self.run_poll(PollCause::PostVote).await
    }
}

impl std::fmt::Debug for VoteStateSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoteStateSynchronizer")
            .field("epoch", &self.epoch())
            .field("running", &self.is_running())
            .finish()
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use teapoll_common::{Address, ChainParams, SequenceKey, U256};

    use crate::mock_reader::{MockChainReader, MockOp, ReaderCall};

    #[derive(Default)]
    struct RecordingObserver {
        polls: Mutex<Vec<PollCause>>,
        history: Mutex<usize>,
    }

    impl SyncObserver for RecordingObserver {
        fn poll_failed(&self, cause: PollCause, _error: &RpcError) {
            self.polls.lock().push(cause);
        }

        fn history_failed(&self, _error: &RpcError) {
            *self.history.lock() += 1;
        }
    }

    fn ev(block: u64) -> VoteEvent {
        VoteEvent {
            voter: Address::from_bytes([7; 20]),
            sentiment: Sentiment::Bull,
            timestamp: U256::from(1_700_000_000u64),
            sequence_key: SequenceKey::new(block, 0),
        }
    }

    fn build(reader: &Arc<MockChainReader>, observer: Arc<RecordingObserver>) -> VoteStateSynchronizer {
        let session = Arc::new(WalletSession::watch_only(
            Address::from_bytes([0xcc; 20]),
            ChainParams::default(),
        ));
        let r: Arc<dyn ChainReader> = reader.clone();
        VoteStateSynchronizer::with_observer(r, session, SyncOptions::default(), observer)
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_refreshes_coalesce() {
        let reader = Arc::new(MockChainReader::new());
        reader.set_totals_latency(Duration::from_secs(1));
        let sync = build(&reader, Arc::default());

        let (a, b, c) = tokio::join!(sync.refresh(), sync.refresh(), sync.refresh());
        assert_eq!(a, PollOutcome::Applied);
        assert_eq!(b, PollOutcome::Coalesced);
        assert_eq!(c, PollOutcome::Coalesced);

        // One poll plus a single trailing re-poll.
        let totals_calls = reader.calls().iter().filter(|c| **c == ReaderCall::Totals).count();
        assert_eq!(totals_calls, 2);
        let m = sync.metrics();
        assert_eq!(m.polls_issued, 2);
        assert_eq!(m.polls_coalesced, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_poll_leaves_snapshot_and_notifies() {
        let reader = Arc::new(MockChainReader::new());
        reader.set_totals(PollTotals::from_u64(3, 2));
        let observer = Arc::new(RecordingObserver::default());
        let sync = build(&reader, observer.clone());
        assert_eq!(sync.refresh().await, PollOutcome::Applied);
        let before = sync.snapshot();

        reader.set_failing(MockOp::Totals, true);
        reader.set_totals(PollTotals::from_u64(9, 9));
        assert!(matches!(sync.refresh().await, PollOutcome::Failed(_)));
        assert_eq!(sync.snapshot(), before);
        assert_eq!(*observer.polls.lock(), vec![PollCause::Refresh]);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_from_old_epoch_is_dropped() {
        let reader = Arc::new(MockChainReader::new());
        reader.set_totals(PollTotals::from_u64(1, 1));
        reader.set_totals_latency(Duration::from_secs(2));
        let sync = build(&reader, Arc::default());

        let slow = {
            let s = sync.clone();
            tokio::spawn(async move { s.refresh().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        reader.set_totals_latency(Duration::ZERO);
        reader.set_totals(PollTotals::from_u64(5, 5));
        sync.inner.on_session_change(None).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sync.snapshot().totals, PollTotals::from_u64(5, 5));
        let epoch = sync.epoch();

        reader.set_totals(PollTotals::from_u64(1, 1));
        assert_eq!(slow.await.unwrap(), PollOutcome::Stale);
        let snap = sync.snapshot();
        assert_eq!(snap.epoch, epoch);
        assert_eq!(snap.totals, PollTotals::from_u64(5, 5));
    }

    #[tokio::test(start_paused = true)]
    async fn history_seeds_once() {
        let reader = Arc::new(MockChainReader::new());
        reader.set_history((1..=7).map(ev).collect());
        let sync = build(&reader, Arc::default());
        assert!(sync.start().await);

        let blocks: Vec<u64> = sync
            .snapshot()
            .recent
            .window
            .iter()
            .map(|e| e.sequence_key.block_number)
            .collect();
        assert_eq!(blocks, vec![7, 6, 5, 4, 3]);

        sync.shutdown();
        assert!(sync.start().await);
        let history_calls = reader
            .calls()
            .iter()
            .filter(|c| matches!(c, ReaderCall::History(5000)))
            .count();
        assert_eq!(history_calls, 1);
        sync.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn history_failure_is_observed() {
        let reader = Arc::new(MockChainReader::new());
        reader.set_failing(MockOp::History, true);
        let observer = Arc::new(RecordingObserver::default());
        let sync = build(&reader, observer.clone());
        sync.start().await;
        assert_eq!(*observer.history.lock(), 1);
        assert!(sync.snapshot().recent.is_empty());
        sync.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_subscription() {
        let reader = Arc::new(MockChainReader::new());
        let sync = build(&reader, Arc::default());
        sync.start().await;
        assert_eq!(reader.active_subscriptions(), 1);
        let epoch = sync.epoch();

        sync.shutdown();
        assert_eq!(reader.active_subscriptions(), 0);
        assert_eq!(sync.epoch(), epoch + 1);
        assert!(!sync.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn resubscribe_for_old_epoch_keeps_current_feed() {
        let reader = Arc::new(MockChainReader::new());
        let sync = build(&reader, Arc::default());
        sync.start().await;
        let old_epoch = sync.epoch();

        sync.inner.on_session_change(None).await;
        assert_eq!(reader.active_subscriptions(), 1);

        // A late resubscribe from the previous epoch must not displace
        // the current subscription or its forwarder.
        sync.inner.resubscribe(old_epoch).await;
        assert_eq!(reader.active_subscriptions(), 1);

        reader.emit(ev(42));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sync.snapshot().recent.window.first(), Some(&ev(42)));
        sync.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_session_changes_leave_one_forwarding_subscription() {
        let reader = Arc::new(MockChainReader::new());
        let sync = build(&reader, Arc::default());
        sync.start().await;

        for round in 0..20u64 {
            let changes: Vec<_> = (0..4)
                .map(|_| {
                    let inner = Arc::clone(&sync.inner);
                    tokio::spawn(async move { inner.on_session_change(None).await })
                })
                .collect();
            for change in changes {
                change.await.unwrap();
            }
            assert_eq!(reader.active_subscriptions(), 1);

            reader.emit(ev(100 + round));
            let mut received = 0;
            for _ in 0..100 {
                received = sync.metrics().events_received;
                if received > round {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert_eq!(received, round + 1);
        }
        sync.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_events_counted() {
        let reader = Arc::new(MockChainReader::new());
        let sync = build(&reader, Arc::default());
        sync.start().await;

        reader.emit(ev(10));
        reader.emit(ev(10));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let m = sync.metrics();
        assert_eq!(m.events_received, 2);
        assert_eq!(m.events_duplicate, 1);
        assert_eq!(sync.snapshot().recent.window.len(), 1);
        sync.shutdown();
    }

    #[test]
    fn wallet_errors_map_to_vote_errors() {
        assert_eq!(VoteError::from(WalletError::UserRejected), VoteError::UserRejected);
        assert_eq!(VoteError::from(WalletError::NoProvider), VoteError::NoProvider);
        assert_eq!(
            VoteError::from(WalletError::TransactionReverted("Cooldown active".into())),
            VoteError::TransactionReverted("Cooldown active".into())
        );
        assert_eq!(
            VoteError::from(WalletError::Rpc("nonce too low".into())),
            VoteError::Rpc("nonce too low".into())
        );
    }
}
