//! Parsing of human-readable resource limits.
//!
//! Memory accepts an integer with an optional `k`/`m`/`g` suffix (binary
//! multiples, case-insensitive). CPU accepts a decimal number of cores and
//! converts it to a CFS quota over a 100ms period. An empty string means
//! unlimited and yields zero. Neither accepts a `+` sign or exponent
//! notation.

use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};

/// CFS period in microseconds that CPU quotas are expressed against.
pub const CPU_PERIOD: i64 = 100_000;

pub fn parse_memory_limit(raw: &str) -> Result<i64> {
    let s = raw.trim();
    if s.is_empty() {
        return Ok(0);
    }

    let invalid = |reason: &str| RuntimeError::InvalidLimit {
        kind: "memory",
        value: raw.to_string(),
        reason: reason.to_string(),
    };

    let (digits, multiplier) = match s.char_indices().last() {
        Some((idx, c)) if c.eq_ignore_ascii_case(&'k') => (&s[..idx], 1024_i64),
        Some((idx, c)) if c.eq_ignore_ascii_case(&'m') => (&s[..idx], 1024 * 1024),
        Some((idx, c)) if c.eq_ignore_ascii_case(&'g') => (&s[..idx], 1024 * 1024 * 1024),
        _ => (s, 1),
    };

    if !is_plain_number(digits, false) {
        return Err(invalid("expected an integer with an optional k, m or g suffix"));
    }
    let value: i64 = digits
        .parse()
        .map_err(|_| invalid("expected an integer with an optional k, m or g suffix"))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| invalid("value overflows a 64-bit byte count"))
}

pub fn parse_cpu_limit(raw: &str) -> Result<i64> {
    let s = raw.trim();
    if s.is_empty() {
        return Ok(0);
    }

    let invalid = || RuntimeError::InvalidLimit {
        kind: "cpu",
        value: raw.to_string(),
        reason: "expected a decimal number of cores".to_string(),
    };
    if !is_plain_number(s, true) {
        return Err(invalid());
    }
    let cores: f64 = s.parse().map_err(|_| invalid())?;
    if !cores.is_finite() {
        return Err(RuntimeError::InvalidLimit {
            kind: "cpu",
            value: raw.to_string(),
            reason: "value is not finite".to_string(),
        });
    }
    Ok((cores * CPU_PERIOD as f64).floor() as i64)
}

/// An optional leading `-` followed by ASCII digits, with at most one `.`
/// when `decimal` is set.
fn is_plain_number(s: &str, decimal: bool) -> bool {
    let body = s.strip_prefix('-').unwrap_or(s);
    let mut dots = 0;
    let mut digits = 0;
    for c in body.chars() {
        match c {
            '0'..='9' => digits += 1,
            '.' if decimal => dots += 1,
            _ => return false,
        }
    }
    digits > 0 && dots <= 1
}

/// Parsed limits applied to every agent container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    /// CFS quota in microseconds per [`CPU_PERIOD`]; zero is unlimited.
    pub cpu_quota: i64,
    /// Memory ceiling in bytes; zero is unlimited.
    pub memory_bytes: i64,
}

impl ResourceLimits {
    pub fn from_config(config: &RuntimeConfig) -> Result<Self> {
        Ok(Self {
            cpu_quota: parse_cpu_limit(&config.cpu_limit)?,
            memory_bytes: parse_memory_limit(&config.memory_limit)?,
        })
    }
}
