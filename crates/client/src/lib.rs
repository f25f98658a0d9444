//! # Teapoll Client Crate
//!
//! Client-side vote-state synchronization for the on-chain sentiment
//! poll. The contract is the source of truth; this crate keeps one
//! consistent [`Snapshot`](teapoll_common::Snapshot) of it.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      VoteStateSynchronizer                        │
//! │                                                                   │
//! │  ┌───────────────┐   ┌───────────────┐   ┌────────────────────┐  │
//! │  │ WalletSession │   │  ChainReader  │   │   CooldownClock    │  │
//! │  │  account      │   │  totals       │   │   Idle/Counting    │  │
//! │  │  chain        │   │  eligibility  │   │   1s local ticks   │  │
//! │  │  signer       │   │  Voted logs   │   │   expiry → poll    │  │
//! │  └───────┬───────┘   └───────┬───────┘   └─────────┬──────────┘  │
//! │          │ epoch++           │ last-issued-wins    │              │
//! │          └───────────────────┼─────────────────────┘              │
//! │                              ▼                                    │
//! │                ┌──────────────────────────┐                       │
//! │                │ RecentVoteFeed (window 5) │                       │
//! │                └────────────┬─────────────┘                       │
//! │                             ▼                                     │
//! │                    watch::Sender<Snapshot>                        │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Role |
//! |--------|------|
//! | `chain_reader` | Read trait, `RpcError`, cancellable vote subscription |
//! | `rpc_reader` | JSON-RPC reader over HTTP |
//! | `mock_reader` | In-memory reader for tests |
//! | `wallet_session` | Wallet provider trait and the connected session |
//! | `mock_wallet` | In-memory wallet provider for tests |
//! | `cooldown_clock` | Local cooldown countdown |
//! | `recent_feed` | Bounded deduplicated vote feed |
//! | `synchronizer` | Poll / event / vote orchestration |
//! | `metrics` | Synchronizer counters |

pub mod chain_reader;
pub mod cooldown_clock;
pub mod metrics;
pub mod mock_reader;
pub mod mock_wallet;
pub mod recent_feed;
pub mod rpc_reader;
pub mod synchronizer;
pub mod wallet_session;

pub use chain_reader::{ChainReader, RpcError, SubscriptionHandle, VoteSubscription};
pub use cooldown_clock::{CooldownClock, CooldownState};
pub use metrics::{SyncMetrics, SyncMetricsSnapshot};
pub use mock_reader::{MockChainReader, MockOp, ReaderCall};
pub use mock_wallet::{MockWalletProvider, WalletMethod};
pub use recent_feed::{FeedState, InsertOutcome, RecentVoteFeed};
pub use rpc_reader::JsonRpcChainReader;
pub use synchronizer::{
    PollCause, PollOutcome, SyncObserver, SyncOptions, TracingObserver, VoteError,
    VoteStateSynchronizer,
};
pub use wallet_session::{
    ProviderError, ProviderNotification, SessionChange, TransactionRequest, TxHash, TxReceipt,
    WalletError, WalletProvider, WalletSession,
};

// ════════════════════════════════════════════════════════════════════════════════
// COMPILE-TIME ASSERTIONS
// ════════════════════════════════════════════════════════════════════════════════

const _: () = {
    fn assert_send_sync<T: Send + Sync>() {}
    fn check() {
        assert_send_sync::<VoteStateSynchronizer>();
        assert_send_sync::<WalletSession>();
        assert_send_sync::<JsonRpcChainReader>();
        assert_send_sync::<MockChainReader>();
        assert_send_sync::<MockWalletProvider>();
        assert_send_sync::<CooldownClock>();
        assert_send_sync::<SyncMetrics>();
        assert_send_sync::<SubscriptionHandle>();
    }
    let _ = check;
};
