//! Token estimation heuristics used for reservations.
//!
//! The ledger reserves before the service reports real usage, so sizes are estimated from
//! character counts at roughly four characters per token.

use serde::Serialize;

pub const CHARS_PER_TOKEN: u64 = 4;

pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(CHARS_PER_TOKEN)
}

/// Estimate for a value as it would be sent over the wire.
pub fn estimate_json_tokens<T: Serialize + ?Sized>(value: &T) -> u64 {
    serde_json::to_string(value)
        .map(|s| estimate_tokens(&s))
        .unwrap_or(0)
}
