//! Presentation helpers.
//!
//! Everything here is a pure function of raw snapshot fields so the
//! presentation layer never needs lossy intermediate state.

use alloy_primitives::U256;
use chrono::DateTime;

use crate::types::{display_secs, Address, PollTotals};

/// `0x1234…abcd` form of an address (first 6, last 4 characters).
///
/// Strings too short to truncate are returned as-is.
pub fn short_address(address: &Address) -> String {
    let s = address.as_str();
    if s.len() <= 10 || !s.is_ascii() {
        return s.to_string();
    }
    format!("{}…{}", &s[..6], &s[s.len() - 4..])
}

/// UTC timestamp as `YYYY-MM-DD HH:MM:SS UTC`.
///
/// Timestamps outside the representable range are shown as the raw
/// integer.
pub fn format_timestamp(timestamp: U256) -> String {
    let secs = display_secs(timestamp);
    i64::try_from(secs)
        .ok()
        .and_then(|s| DateTime::from_timestamp(s, 0))
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| timestamp.to_string())
}

/// Countdown as `MM:SS`, or `HH:MM:SS` once it spans an hour.
pub fn format_countdown(secs: u64) -> String {
    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    let rem = secs % 60;
    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, mins, rem)
    } else {
        format!("{:02}:{:02}", mins, rem)
    }
}

/// One-line summary such as `bull 10 (71%) / bear 4 (29%) / total 14`.
pub fn format_totals(totals: &PollTotals) -> String {
    let (bull_pct, bear_pct) = totals.split();
    format!(
        "bull {} ({}%) / bear {} ({}%) / total {}",
        totals.bullish,
        bull_pct,
        totals.bearish,
        bear_pct,
        totals.total()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_address_truncates() {
        let a = Address::new("0x84eF19739811238D71321968AA96D1Aa3EcD4704");
        assert_eq!(short_address(&a), "0x84eF…4704");
        assert_eq!(short_address(&Address::new("0xabc")), "0xabc");
    }

    #[test]
    fn countdown_formats() {
        assert_eq!(format_countdown(0), "00:00");
        assert_eq!(format_countdown(75), "01:15");
        assert_eq!(format_countdown(3600 + 61), "01:01:01");
    }

    #[test]
    fn timestamp_formats() {
        assert_eq!(format_timestamp(U256::from(0u8)), "1970-01-01 00:00:00 UTC");
        assert_eq!(
            format_timestamp(U256::from(1_700_000_000u64)),
            "2023-11-14 22:13:20 UTC"
        );
        assert_eq!(format_timestamp(U256::MAX), U256::MAX.to_string());
    }

    #[test]
    fn totals_line() {
        let line = format_totals(&PollTotals::from_u64(10, 4));
        assert_eq!(line, "bull 10 (71%) / bear 4 (29%) / total 14");
    }
}
