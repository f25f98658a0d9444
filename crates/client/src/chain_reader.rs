//! # ChainReader: Read-Only Contract Access
//!
//! Stateless accessor over the poll contract's view functions and its
//! `Voted` event log.
//!
//! ## Architecture
//!
//! ```text
//! VoteStateSynchronizer
//!      │
//!      ├─ get_totals()            ──▶ getTotals()
//!      ├─ get_eligibility(addr)   ──▶ canVote(addr) [+ secondsUntilNextVote(addr)]
//!      ├─ query_recent_votes(n)   ──▶ eth_getLogs(Voted, latest - n .. latest)
//!      └─ subscribe_votes()       ──▶ VoteSubscription (until close())
//!      │
//!      ▼
//! dyn ChainReader { JsonRpcChainReader | MockChainReader }
//! ```
//!
//! ## No Implicit Retry
//!
//! Every call performs a single attempt. A failure is returned as
//! [`RpcError`] and the caller decides what to do with it.
//!
//! ## Numeric Domain
//!
//! Counters and second counts are returned as `U256`. Narrowing to
//! `u64` only happens through [`display_secs`], and only where the
//! value feeds a local timer.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::Stream;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;

use teapoll_common::abi::AbiError;
use teapoll_common::{display_secs, Address, Eligibility, PollTotals, VoteEvent, U256};

// ════════════════════════════════════════════════════════════════════════════════
// ERROR
// ════════════════════════════════════════════════════════════════════════════════

/// Failure of a single read, log query or subscription request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    /// Network-level failure reaching the node.
    #[error("rpc transport error: {0}")]
    Transport(String),

    /// The node did not answer within the configured timeout.
    #[error("rpc request timed out")]
    Timeout,

    /// The node answered with a JSON-RPC error object.
    #[error("rpc node error {code}: {message}")]
    Node { code: i64, message: String },

    /// The answer could not be decoded.
    #[error("rpc decode error: {0}")]
    Decode(String),
}

impl From<AbiError> for RpcError {
    fn from(e: AbiError) -> Self {
        RpcError::Decode(e.to_string())
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// SUBSCRIPTION
// ════════════════════════════════════════════════════════════════════════════════

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

/// Owner-side handle of a live vote subscription.
///
/// `close()` runs the reader's unsubscribe hook synchronously, so once
/// it returns the reader no longer delivers events for this handle.
/// Dropping the handle closes it.
pub struct SubscriptionHandle {
    id: u64,
    closer: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl SubscriptionHandle {
    /// Subscription identifier, unique per process.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Unsubscribe. Idempotent.
    pub fn close(&self) {
        let closer = self.closer.lock().take();
        if let Some(f) = closer {
            f();
        }
    }

    /// Whether `close()` already ran.
    pub fn is_closed(&self) -> bool {
        self.closer.lock().is_none()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A cancellable stream of `Voted` events.
///
/// The event channel ends (`next()` yields `None`) once the handle is
/// closed and the reader has dropped its sending side.
pub struct VoteSubscription {
    handle: SubscriptionHandle,
    events: mpsc::UnboundedReceiver<VoteEvent>,
}

impl VoteSubscription {
    /// Build a subscription from an event channel and an unsubscribe hook.
    pub fn new(
        events: mpsc::UnboundedReceiver<VoteEvent>,
        on_close: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            handle: SubscriptionHandle {
                id: NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed),
                closer: Mutex::new(Some(Box::new(on_close))),
            },
            events,
        }
    }

    pub fn id(&self) -> u64 {
        self.handle.id
    }

    /// Wait for the next event.
    pub async fn next(&mut self) -> Option<VoteEvent> {
        self.events.recv().await
    }

    /// Unsubscribe and stop receiving.
    pub fn close(&mut self) {
        self.handle.close();
        self.events.close();
    }

    /// Separate the handle (kept by the owner) from the receiver
    /// (moved into a forwarding task).
    pub fn into_parts(self) -> (SubscriptionHandle, mpsc::UnboundedReceiver<VoteEvent>) {
        (self.handle, self.events)
    }
}

impl Stream for VoteSubscription {
    type Item = VoteEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<VoteEvent>> {
        self.events.poll_recv(cx)
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// READER TRAIT
// ════════════════════════════════════════════════════════════════════════════════

/// Async read surface of the poll contract.
///
/// ## Contract
///
/// - Implementations are stateless from the caller's point of view and
///   safe to call concurrently.
/// - Implementations MUST NOT retry internally.
/// - Numeric values MUST NOT be narrowed below 256 bits.
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// `getTotals()`.
    async fn get_totals(&self) -> Result<PollTotals, RpcError>;

    /// `canVote(account)`.
    async fn can_vote(&self, account: &Address) -> Result<bool, RpcError>;

    /// `secondsUntilNextVote(account)`.
    async fn get_cooldown_remaining(&self, account: &Address) -> Result<U256, RpcError>;

    /// Eligibility of `account`.
    ///
    /// The cooldown is only read when the contract says the account
    /// cannot vote; an eligible account has a cooldown of 0.
    async fn get_eligibility(&self, account: &Address) -> Result<Eligibility, RpcError> {
        if self.can_vote(account).await? {
            return Ok(Eligibility::eligible());
        }
        let remaining = self.get_cooldown_remaining(account).await?;
        Ok(Eligibility::cooling_down(display_secs(remaining)))
    }

    /// `Voted` logs from the last `lookback_blocks` blocks, oldest first.
    async fn query_recent_votes(&self, lookback_blocks: u64) -> Result<Vec<VoteEvent>, RpcError>;

    /// Open a live subscription to new `Voted` logs.
    async fn subscribe_votes(&self) -> Result<VoteSubscription, RpcError>;
}
