//! Poll Domain Types
//!
//! Plain data shared by every layer of the client: accounts, votes,
//! totals, eligibility and the published [`Snapshot`].
//!
//! ## Identity Rules
//!
//! | Type          | Identity                                     |
//! |---------------|----------------------------------------------|
//! | `Address`     | Lowercase form of the address string         |
//! | `VoteEvent`   | `SequenceKey` (block number, log index)      |
//! | `Snapshot`    | Epoch + content, replaced wholesale          |
//!
//! Numeric values that originate on chain stay in the 256-bit domain
//! (`U256`) until a caller asks for a display-safe conversion.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};

/// Maximum number of entries in the recent vote window and in the
/// pending batch.
pub const FEED_CAPACITY: usize = 5;

// ════════════════════════════════════════════════════════════════════════════
// ADDRESS
// ════════════════════════════════════════════════════════════════════════════

/// Account address as reported by the wallet or the chain.
///
/// The original string is kept for display, while equality, ordering
/// and hashing use the lowercase form: `0xABC…` and `0xabc…` denote the
/// same account.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    /// Wrap an address string without validation.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The address exactly as it was received.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lowercase form used for identity comparisons.
    pub fn normalized(&self) -> String {
        self.0.to_ascii_lowercase()
    }

    /// Whether the string is a `0x`-prefixed 20-byte hex address.
    pub fn is_well_formed(&self) -> bool {
        self.to_bytes().is_some()
    }

    /// Decode into the 20 raw bytes used for ABI encoding.
    ///
    /// Returns `None` if the string is not `0x` followed by 40 hex digits.
    pub fn to_bytes(&self) -> Option<[u8; 20]> {
        let hex_part = self
            .0
            .strip_prefix("0x")
            .or_else(|| self.0.strip_prefix("0X"))?;
        if hex_part.len() != 40 {
            return None;
        }
        let mut out = [0u8; 20];
        hex::decode_to_slice(hex_part, &mut out).ok()?;
        Some(out)
    }

    /// Build an address from raw bytes (lowercase hex).
    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(format!("0x{}", hex::encode(bytes)))
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for b in self.0.bytes() {
            state.write_u8(b.to_ascii_lowercase());
        }
    }
}

impl PartialOrd for Address {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Address {
    fn cmp(&self, other: &Self) -> Ordering {
        self.normalized().cmp(&other.normalized())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// ACCOUNT
// ════════════════════════════════════════════════════════════════════════════

/// EVM chain identifier (e.g. 10218 for Tea Sepolia).
pub type ChainId = u64;

/// The locally connected wallet account.
///
/// Owned by the wallet session; every other component only reads it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Account {
    /// Connected address.
    pub address: Address,
    /// Chain the wallet is currently on, if known.
    pub chain_id: Option<ChainId>,
}

impl Account {
    /// Create an account on a known or unknown chain.
    pub fn new(address: impl Into<Address>, chain_id: Option<ChainId>) -> Self {
        Self {
            address: address.into(),
            chain_id,
        }
    }
}

impl From<String> for Address {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// SENTIMENT
// ════════════════════════════════════════════════════════════════════════════

/// Binary vote classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sentiment {
    /// Bullish vote (`sentiment == 0` on chain).
    Bull,
    /// Bearish vote (any other value on chain).
    Bear,
}

impl Sentiment {
    /// Decode the `sentiment` word of the `Voted` event.
    pub fn from_word(word: U256) -> Self {
        if word.is_zero() {
            Sentiment::Bull
        } else {
            Sentiment::Bear
        }
    }

    /// Wire code emitted by the contract.
    pub fn code(self) -> u8 {
        match self {
            Sentiment::Bull => 0,
            Sentiment::Bear => 1,
        }
    }

    /// Short label used in feeds.
    pub fn label(self) -> &'static str {
        match self {
            Sentiment::Bull => "Bull",
            Sentiment::Bear => "Bear",
        }
    }
}

impl fmt::Display for Sentiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ════════════════════════════════════════════════════════════════════════════
// VOTE EVENT
// ════════════════════════════════════════════════════════════════════════════

/// Position of a log on chain.
///
/// Ordered by block number first, then log index within the block.
/// Two events with the same key are the same event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SequenceKey {
    /// Block containing the log.
    pub block_number: u64,
    /// Index of the log within the block.
    pub log_index: u64,
}

impl SequenceKey {
    pub fn new(block_number: u64, log_index: u64) -> Self {
        Self {
            block_number,
            log_index,
        }
    }
}

impl fmt::Display for SequenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.block_number, self.log_index)
    }
}

/// A decoded `Voted(address,uint8,uint256)` log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteEvent {
    /// Account that voted.
    pub voter: Address,
    /// Direction of the vote.
    pub sentiment: Sentiment,
    /// Block timestamp reported by the contract (unix seconds).
    pub timestamp: U256,
    /// Ordering and deduplication key.
    pub sequence_key: SequenceKey,
}

// ════════════════════════════════════════════════════════════════════════════
// TOTALS & ELIGIBILITY
// ════════════════════════════════════════════════════════════════════════════

/// Aggregate vote counters read from `getTotals()`.
///
/// Always replaced wholesale with the chain's values; the client never
/// increments these itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PollTotals {
    pub bullish: U256,
    pub bearish: U256,
}

impl PollTotals {
    pub fn new(bullish: U256, bearish: U256) -> Self {
        Self { bullish, bearish }
    }

    /// Convenience constructor for small values.
    pub fn from_u64(bullish: u64, bearish: u64) -> Self {
        Self::new(U256::from(bullish), U256::from(bearish))
    }

    /// Total number of votes (saturating at `U256::MAX`).
    pub fn total(&self) -> U256 {
        self.bullish.saturating_add(self.bearish)
    }

    /// Whole-percent split `(bullish, bearish)`, rounded to nearest.
    ///
    /// The two values always sum to 100 unless there are no votes, in
    /// which case both are 0.
    pub fn split(&self) -> (u8, u8) {
        let total = self.total();
        if total.is_zero() {
            return (0, 0);
        }
        let hundred = U256::from(100u8);
        // bullish <= total, so bullish * 100 only overflows near U256::MAX;
        // fall back to dividing first in that case.
        let scaled = match self.bullish.checked_mul(hundred) {
            Some(v) => (v + total / U256::from(2u8)) / total,
            None => self.bullish / (total / hundred),
        };
        let bull = u8::try_from(scaled.min(hundred)).unwrap_or(100);
        (bull, 100 - bull)
    }
}

/// Whether an account may vote right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Eligibility {
    pub can_vote: bool,
    pub cooldown_remaining_secs: u64,
}

impl Eligibility {
    /// Eligibility of an account that may vote immediately.
    pub fn eligible() -> Self {
        Self {
            can_vote: true,
            cooldown_remaining_secs: 0,
        }
    }

    /// Eligibility of an account still in cooldown.
    pub fn cooling_down(remaining: u64) -> Self {
        Self {
            can_vote: false,
            cooldown_remaining_secs: remaining,
        }
    }
}

/// Narrow a chain-reported second count into `u64` for timers.
///
/// Values that do not fit saturate at `u64::MAX`.
pub fn display_secs(value: U256) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}

// ════════════════════════════════════════════════════════════════════════════
// WINDOW & SNAPSHOT
// ════════════════════════════════════════════════════════════════════════════

/// Published view of the recent vote feed.
///
/// ## Invariants
///
/// - `window.len() <= FEED_CAPACITY`
/// - `pending` is non-empty only when `window.len() == FEED_CAPACITY`
/// - No sequence key appears in both `window` and `pending`
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RecentVoteWindow {
    /// Displayed votes, newest first.
    pub window: Vec<VoteEvent>,
    /// Votes collected since the window filled, newest first.
    pub pending: Vec<VoteEvent>,
}

impl RecentVoteWindow {
    pub fn is_empty(&self) -> bool {
        self.window.is_empty() && self.pending.is_empty()
    }

    /// Whether a sequence key is present in the window or the pending batch.
    pub fn contains(&self, key: &SequenceKey) -> bool {
        self.window
            .iter()
            .chain(self.pending.iter())
            .any(|e| e.sequence_key == *key)
    }
}

/// The single consistent state exposed to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Snapshot {
    /// Session epoch this snapshot was published under.
    pub epoch: u64,
    /// Account the eligibility belongs to.
    pub account: Option<Account>,
    /// Latest totals read from chain.
    pub totals: PollTotals,
    /// Eligibility of `account`, absent when no account is connected
    /// or before the first poll for it completes.
    pub eligibility: Option<Eligibility>,
    /// Recent vote feed.
    pub recent: RecentVoteWindow,
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════
