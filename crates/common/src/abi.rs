//! Contract ABI Codec
//!
//! Minimal encoder/decoder for the poll contract surface. Only the
//! shapes the contract actually uses are supported: zero or one
//! `address` argument, `bool`/`uint256` return words, and the
//! `Voted(address indexed, uint8, uint256)` log layout.
//!
//! ## Log Layout
//!
//! ```text
//! topics[0] = keccak256("Voted(address,uint8,uint256)")
//! topics[1] = voter (left-padded to 32 bytes)
//! data      = sentiment word (32 bytes) ‖ timestamp word (32 bytes)
//! ```

use alloy_primitives::U256;
use sha3::{Digest, Keccak256};
use thiserror::Error;

use crate::types::{Address, SequenceKey, Sentiment, VoteEvent};

pub const GET_TOTALS: &str = "getTotals()";
pub const CAN_VOTE: &str = "canVote(address)";
pub const SECONDS_UNTIL_NEXT_VOTE: &str = "secondsUntilNextVote(address)";
pub const VOTE_BULLISH: &str = "voteBullish()";
pub const VOTE_BEARISH: &str = "voteBearish()";
pub const VOTED_EVENT: &str = "Voted(address,uint8,uint256)";

const WORD: usize = 32;

/// Errors from encoding calls or decoding return data and logs.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AbiError {
    #[error("invalid address argument: {0}")]
    InvalidAddress(String),

    #[error("return data too short: expected {expected} bytes, found {found}")]
    ShortData { expected: usize, found: usize },

    #[error("unexpected log topics: {0}")]
    BadTopics(String),

    #[error("invalid hex: {0}")]
    Hex(String),
}

/// keccak-256 of arbitrary bytes.
pub fn keccak(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Four-byte function selector of a canonical signature.
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Event topic of a canonical signature.
pub fn event_topic(signature: &str) -> [u8; 32] {
    keccak(signature.as_bytes())
}

/// Encode a call with no arguments.
pub fn encode_call(signature: &str) -> Vec<u8> {
    selector(signature).to_vec()
}

/// Encode a call taking a single `address`.
pub fn encode_call_with_address(signature: &str, address: &Address) -> Result<Vec<u8>, AbiError> {
    let bytes = address
        .to_bytes()
        .ok_or_else(|| AbiError::InvalidAddress(address.to_string()))?;
    let mut out = Vec::with_capacity(4 + WORD);
    out.extend_from_slice(&selector(signature));
    out.extend_from_slice(&[0u8; 12]);
    out.extend_from_slice(&bytes);
    Ok(out)
}

/// Calldata of the vote transaction for a sentiment.
pub fn vote_calldata(sentiment: Sentiment) -> Vec<u8> {
    match sentiment {
        Sentiment::Bull => encode_call(VOTE_BULLISH),
        Sentiment::Bear => encode_call(VOTE_BEARISH),
    }
}

/// Decode `count` consecutive uint256 words.
pub fn decode_words(data: &[u8], count: usize) -> Result<Vec<U256>, AbiError> {
    let expected = count * WORD;
    if data.len() < expected {
        return Err(AbiError::ShortData {
            expected,
            found: data.len(),
        });
    }
    Ok(data[..expected]
        .chunks_exact(WORD)
        .map(U256::from_be_slice)
        .collect())
}

/// Decode a single `bool` return word.
pub fn decode_bool(data: &[u8]) -> Result<bool, AbiError> {
    let words = decode_words(data, 1)?;
    Ok(!words[0].is_zero())
}

/// Decode a `Voted` log into a [`VoteEvent`].
pub fn decode_voted_log(
    topics: &[[u8; 32]],
    data: &[u8],
    sequence_key: SequenceKey,
) -> Result<VoteEvent, AbiError> {
    if topics.len() < 2 {
        return Err(AbiError::BadTopics(format!("expected 2 topics, found {}", topics.len())));
    }
    if topics[0] != event_topic(VOTED_EVENT) {
        return Err(AbiError::BadTopics("topic0 is not Voted".to_string()));
    }
    let mut voter = [0u8; 20];
    voter.copy_from_slice(&topics[1][12..]);

    let words = decode_words(data, 2)?;

    Ok(VoteEvent {
        voter: Address::from_bytes(voter),
        sentiment: Sentiment::from_word(words[0]),
        timestamp: words[1],
        sequence_key,
    })
}

/// Encode bytes as `0x`-prefixed lowercase hex.
pub fn to_hex_data(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Decode `0x`-prefixed hex into bytes. An empty `0x` is an empty vector.
pub fn parse_hex_data(s: &str) -> Result<Vec<u8>, AbiError> {
    let body = s.strip_prefix("0x").unwrap_or(s);
    if body.len() % 2 == 1 {
        let padded = format!("0{}", body);
        return hex::decode(padded).map_err(|e| AbiError::Hex(e.to_string()));
    }
    hex::decode(body).map_err(|e| AbiError::Hex(e.to_string()))
}

/// Decode a 32-byte hex value (topic, hash).
pub fn parse_hex_word(s: &str) -> Result<[u8; 32], AbiError> {
    let bytes = parse_hex_data(s)?;
    if bytes.len() != WORD {
        return Err(AbiError::ShortData {
            expected: WORD,
            found: bytes.len(),
        });
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Decode a JSON-RPC quantity (`0x1a`) into `u64`.
pub fn parse_quantity(s: &str) -> Result<u64, AbiError> {
    let body = s.strip_prefix("0x").unwrap_or(s);
    if body.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(body, 16).map_err(|e| AbiError::Hex(format!("{}: {}", s, e)))
}

/// Encode a `u64` as a JSON-RPC quantity.
pub fn to_quantity(value: u64) -> String {
    format!("0x{:x}", value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(value: u64) -> [u8; 32] {
        U256::from(value).to_be_bytes::<32>()
    }

    #[test]
    fn known_selectors() {
        // transfer(address,uint256) is the canonical check value.
        assert_eq!(selector("transfer(address,uint256)"), [0xa9, 0x05, 0x9c, 0xbb]);
        assert_eq!(encode_call(GET_TOTALS).len(), 4);
    }

    #[test]
    fn address_argument_is_left_padded() {
        let addr = Address::new("0x00000000000000000000000000000000000000ff");
        let data = encode_call_with_address(CAN_VOTE, &addr).unwrap();
        assert_eq!(data.len(), 36);
        assert_eq!(&data[..4], &selector(CAN_VOTE));
        assert!(data[4..35].iter().all(|b| *b == 0));
        assert_eq!(data[35], 0xff);

        let err = encode_call_with_address(CAN_VOTE, &Address::new("bogus"));
        assert!(matches!(err, Err(AbiError::InvalidAddress(_))));
    }

    #[test]
    fn vote_calldata_per_sentiment() {
        assert_eq!(vote_calldata(Sentiment::Bull), selector(VOTE_BULLISH).to_vec());
        assert_eq!(vote_calldata(Sentiment::Bear), selector(VOTE_BEARISH).to_vec());
    }

    #[test]
    fn decode_totals_words() {
        let mut data = Vec::new();
        data.extend_from_slice(&word(10));
        data.extend_from_slice(&word(4));
        let words = decode_words(&data, 2).unwrap();
        assert_eq!(words, vec![U256::from(10u8), U256::from(4u8)]);

        let short = decode_words(&data[..40], 2);
        assert_eq!(short, Err(AbiError::ShortData { expected: 64, found: 40 }));
    }

    #[test]
    fn decode_bool_word() {
        assert!(decode_bool(&word(1)).unwrap());
        assert!(!decode_bool(&word(0)).unwrap());
    }

    #[test]
    fn decode_voted() {
        let mut voter_topic = [0u8; 32];
        voter_topic[12..].copy_from_slice(&[0xab; 20]);
        let topics = [event_topic(VOTED_EVENT), voter_topic];

        let mut data = Vec::new();
        data.extend_from_slice(&word(1));
        data.extend_from_slice(&word(1_700_000_000));

        let event = decode_voted_log(&topics, &data, SequenceKey::new(5, 2)).unwrap();
        assert_eq!(event.voter, Address::from_bytes([0xab; 20]));
        assert_eq!(event.sentiment, Sentiment::Bear);
        assert_eq!(event.timestamp, U256::from(1_700_000_000u64));
        assert_eq!(event.sequence_key, SequenceKey::new(5, 2));
    }

    #[test]
    fn decode_voted_reads_whole_sentiment_word() {
        let topics = [event_topic(VOTED_EVENT), [0u8; 32]];
        let mut data = Vec::new();
        data.extend_from_slice(&word(0x100));
        data.extend_from_slice(&word(1));
        let event = decode_voted_log(&topics, &data, SequenceKey::new(1, 0)).unwrap();
        assert_eq!(event.sentiment, Sentiment::Bear);

        let data = [0u8; 64];
        let event = decode_voted_log(&topics, &data, SequenceKey::new(1, 0)).unwrap();
        assert_eq!(event.sentiment, Sentiment::Bull);
    }

    #[test]
    fn decode_voted_rejects_foreign_topic() {
        let topics = [event_topic("Other()"), [0u8; 32]];
        let data = [0u8; 64];
        let res = decode_voted_log(&topics, &data, SequenceKey::new(1, 0));
        assert!(matches!(res, Err(AbiError::BadTopics(_))));
    }

    #[test]
    fn hex_helpers() {
        assert_eq!(parse_quantity("0x1a").unwrap(), 26);
        assert_eq!(parse_quantity("0x").unwrap(), 0);
        assert_eq!(to_quantity(26), "0x1a");
        assert_eq!(parse_hex_data("0x").unwrap(), Vec::<u8>::new());
        assert_eq!(to_hex_data(&[0xde, 0xad]), "0xdead");
        assert!(parse_hex_word("0x00").is_err());
    }
}
