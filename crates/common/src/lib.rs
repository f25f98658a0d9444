//! # Teapoll Common Crate
//!
//! Shared types for the sentiment poll client.
//!
//! ## Modules
//! - `types`: Accounts, votes, totals, eligibility and the published snapshot
//! - `abi`: Contract call/log encoding for the poll contract
//! - `config`: Configuration management
//! - `display`: Presentation helpers (addresses, timestamps, countdowns)
//!
//! ## Data Ownership
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────────┐
//! │ WalletSession│   │ Synchronizer │   │ RecentVoteFeed   │
//! │   Account    │   │ PollTotals   │   │ RecentVoteWindow │
//! │              │   │ Eligibility  │   │                  │
//! └──────┬───────┘   └──────┬───────┘   └────────┬─────────┘
//!        └──────────────────┼────────────────────┘
//!                           ▼
//!                       Snapshot
//! ```

pub mod abi;
pub mod config;
pub mod display;
pub mod types;

pub use alloy_primitives::U256;
pub use config::{ChainParams, Config, ConfigError};
pub use types::{
    display_secs, Account, Address, ChainId, Eligibility, PollTotals, RecentVoteWindow,
    SequenceKey, Sentiment, Snapshot, VoteEvent, FEED_CAPACITY,
};
