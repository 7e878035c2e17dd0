//! Clock and TTL value encodings shared by the engine and the facade.
//!
//! Clocks are persisted big-endian so that lexicographic key order equals
//! numeric order, which makes range deletes over clock intervals a single
//! ordered-range operation. In TTL mode every stored value carries an
//! 8-byte big-endian nanosecond write timestamp as a suffix; the suffix is
//! applied when a batch is built and stripped on every read.

use std::time::{SystemTime, UNIX_EPOCH};

/// Reserved key holding the current clock.
///
/// Starts with eight `0xff` bytes, so it sorts strictly after every 8-byte
/// big-endian clock key: range deletes over clock intervals (whose upper
/// bound is exclusive) can never touch it, and it can never collide with a
/// clock key.
pub const CLOCK_K: &[u8] = b"\xff\xff\xff\xff\xff\xff\xff\xff@clock";

/// Width of the TTL timestamp suffix.
pub const TTL_SUFFIX_LEN: usize = 8;

/// Encodes a clock as 8 big-endian bytes.
#[must_use]
pub fn encode_clock(clock: u64) -> [u8; 8] {
    clock.to_be_bytes()
}

/// Decodes a clock from the first 8 bytes of `value`.
///
/// Returns `None` when the value is too short. Values read in TTL mode may
/// be longer than 8 bytes; the suffix is ignored here.
#[must_use]
pub fn decode_clock(value: &[u8]) -> Option<u64> {
    let head: [u8; 8] = value.get(..8)?.try_into().ok()?;
    Some(u64::from_be_bytes(head))
}

/// Current wall-clock time in nanoseconds since the Unix epoch.
#[must_use]
pub fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Appends the TTL timestamp suffix to a value.
#[must_use]
pub fn wrap_ttl(value: &[u8], write_nanos: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len() + TTL_SUFFIX_LEN);
    out.extend_from_slice(value);
    out.extend_from_slice(&write_nanos.to_be_bytes());
    out
}

/// Strips the TTL timestamp suffix from a stored value.
///
/// Values written in TTL mode always carry the suffix; a shorter value is
/// returned unchanged so corrupt data surfaces as-is instead of panicking.
#[must_use]
pub fn unwrap_ttl(stored: &[u8]) -> &[u8] {
    if stored.len() >= TTL_SUFFIX_LEN {
        &stored[..stored.len() - TTL_SUFFIX_LEN]
    } else {
        stored
    }
}

/// Reads the write timestamp from a TTL-suffixed value.
#[must_use]
pub fn ttl_write_nanos(stored: &[u8]) -> Option<u64> {
    if stored.len() < TTL_SUFFIX_LEN {
        return None;
    }
    let tail: [u8; 8] = stored[stored.len() - TTL_SUFFIX_LEN..].try_into().ok()?;
    Some(u64::from_be_bytes(tail))
}

/// Whether a TTL-suffixed value has outlived `ttl_seconds` as of `now_nanos`.
#[must_use]
pub fn ttl_expired(stored: &[u8], ttl_seconds: u64, now_nanos: u64) -> bool {
    match ttl_write_nanos(stored) {
        Some(written) => now_nanos.saturating_sub(written) > ttl_seconds.saturating_mul(1_000_000_000),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_round_trip() {
        for clock in [0u64, 1, 255, 1 << 32, u64::MAX] {
            assert_eq!(decode_clock(&encode_clock(clock)), Some(clock));
        }
    }

    #[test]
    fn test_clock_order_matches_lexical_order() {
        let a = encode_clock(999_999);
        let b = encode_clock(1_000_000);
        assert!(a < b);
    }

    #[test]
    fn test_decode_clock_short_value() {
        assert_eq!(decode_clock(b"abc"), None);
    }

    #[test]
    fn test_decode_clock_ignores_ttl_suffix() {
        let wrapped = wrap_ttl(&encode_clock(42), now_nanos());
        assert_eq!(decode_clock(&wrapped), Some(42));
    }

    #[test]
    fn test_ttl_wrap_unwrap() {
        let wrapped = wrap_ttl(b"value", 123);
        assert_eq!(unwrap_ttl(&wrapped), b"value");
        assert_eq!(ttl_write_nanos(&wrapped), Some(123));
    }

    #[test]
    fn test_ttl_expiry() {
        let second = 1_000_000_000u64;
        let wrapped = wrap_ttl(b"v", 10 * second);
        assert!(!ttl_expired(&wrapped, 5, 14 * second));
        assert!(ttl_expired(&wrapped, 5, 16 * second));
    }
}
