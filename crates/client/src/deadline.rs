//! `grpc-timeout` header encoding.
//!
//! The header value is at most eight ASCII digits followed by a unit:
//! `H` hours, `M` minutes, `S` seconds, `m` milliseconds, `u` microseconds,
//! `n` nanoseconds. The finest unit that fits is chosen, rounding up so the
//! server never sees a shorter timeout than the client's.

use std::time::Duration;

use wayfinder_types::{Code, Status};

const MAX_DIGITS_VALUE: u128 = 99_999_999;

const UNITS: [(u128, char); 6] = [
    (1, 'n'),
    (1_000, 'u'),
    (1_000_000, 'm'),
    (1_000_000_000, 'S'),
    (60 * 1_000_000_000, 'M'),
    (3_600 * 1_000_000_000, 'H'),
];

/// Encodes the time remaining until a deadline.
///
/// # Errors
///
/// Returns DEADLINE_EXCEEDED for a zero timeout and OUT_OF_RANGE when the
/// timeout exceeds what eight digits of hours can express.
pub fn encode_timeout(timeout: Duration) -> Result<String, Status> {
    let nanos = timeout.as_nanos();
    if nanos == 0 {
        return Err(Status::deadline_exceeded("deadline already passed"));
    }
    UNITS
        .iter()
        .find_map(|&(per_unit, unit)| {
            let amount = nanos.div_ceil(per_unit);
            (amount <= MAX_DIGITS_VALUE).then(|| format!("{amount}{unit}"))
        })
        .ok_or_else(|| {
            Status::new(Code::OutOfRange, format!("timeout {timeout:?} cannot be encoded"))
        })
}

/// Parses a `grpc-timeout` header value.
#[must_use]
pub fn decode_timeout(value: &str) -> Option<Duration> {
    let unit = value.chars().last()?;
    let digits = &value[..value.len() - unit.len_utf8()];
    if digits.is_empty() || digits.len() > 8 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let amount: u64 = digits.parse().ok()?;
    let duration = match unit {
        'H' => Duration::from_secs(amount.checked_mul(3_600)?),
        'M' => Duration::from_secs(amount.checked_mul(60)?),
        'S' => Duration::from_secs(amount),
        'm' => Duration::from_millis(amount),
        'u' => Duration::from_micros(amount),
        'n' => Duration::from_nanos(amount),
        _ => return None,
    };
    Some(duration)
}
