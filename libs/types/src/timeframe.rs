//! Timeframe tokens
//!
//! A timeframe is a window width in milliseconds. Configuration and the
//! history API express it as `<number><unit>` with unit one of `s`, `m`,
//! `h`, `d` (case-insensitive).

use crate::errors::TimeframeError;

const SECOND_MS: u64 = 1_000;
const MINUTE_MS: u64 = 60 * SECOND_MS;
const HOUR_MS: u64 = 60 * MINUTE_MS;
const DAY_MS: u64 = 24 * HOUR_MS;

/// Parse a timeframe token such as `5m` into milliseconds.
///
/// Unknown units, missing numbers and zero widths are rejected; there is
/// no fallback value.
pub fn parse_timeframe_ms(token: &str) -> Result<u64, TimeframeError> {
    let token = token.trim();
    if token.is_empty() {
        return Err(TimeframeError::Empty);
    }

    let digits_end = token
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(token.len());
    if digits_end == 0 {
        return Err(TimeframeError::InvalidFormat(token.to_string()));
    }

    let value: u64 = token[..digits_end]
        .parse()
        .map_err(|_| TimeframeError::Overflow(token.to_string()))?;
    if value == 0 {
        return Err(TimeframeError::NotPositive(token.to_string()));
    }

    let unit = token[digits_end..].to_ascii_lowercase();
    let unit_ms = match unit.as_str() {
        "s" => SECOND_MS,
        "m" => MINUTE_MS,
        "h" => HOUR_MS,
        "d" => DAY_MS,
        "" => return Err(TimeframeError::InvalidFormat(token.to_string())),
        _ => return Err(TimeframeError::UnknownUnit { unit }),
    };

    let ms = value
        .checked_mul(unit_ms)
        .ok_or_else(|| TimeframeError::Overflow(token.to_string()))?;
    // Window math runs on i64 timestamps.
    if ms > i64::MAX as u64 {
        return Err(TimeframeError::Overflow(token.to_string()));
    }
    Ok(ms)
}

/// Render a width in milliseconds as the coarsest exact token (`60000` → `1m`).
///
/// Widths that are not whole seconds fall back to `<n>ms`.
pub fn format_timeframe(ms: u64) -> String {
    for (unit_ms, suffix) in [(DAY_MS, "d"), (HOUR_MS, "h"), (MINUTE_MS, "m"), (SECOND_MS, "s")] {
        if ms >= unit_ms && ms % unit_ms == 0 {
            return format!("{}{}", ms / unit_ms, suffix);
        }
    }
    format!("{}ms", ms)
}

/// Align a timestamp (ms) to the start of its window.
pub fn window_start(timestamp_ms: i64, timeframe_ms: u64) -> i64 {
    let width = timeframe_ms as i64;
    timestamp_ms.div_euclid(width) * width
}
