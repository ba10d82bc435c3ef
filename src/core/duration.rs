//! Duration parsing for rule configuration.
//!
//! This module turns human duration strings such as `"10s"`, `"1h30m"` or
//! `"2d"` (and raw second counts) into whole seconds. Parsing happens when a
//! rule is configured, so every failure here is a configuration error.

use std::fmt;
use thiserror::Error;

const SECOND: u64 = 1;
const MINUTE: u64 = 60 * SECOND;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

/// Largest accepted duration, in seconds.
pub const MAX_DURATION: u64 = u32::MAX as u64;

/// Errors that can occur while parsing a duration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DurationError {
    #[error("non-integer value provided: {0}")]
    NonInteger(String),
    #[error("negative value provided: {0}")]
    Negative(String),
    #[error("value too large: {0}")]
    TooLarge(String),
    #[error("invalid duration: empty string")]
    Empty,
    #[error("invalid duration: {0}")]
    Invalid(String),
    #[error("unsupported decimal duration: {0}")]
    Decimal(String),
    #[error("missing unit in duration: {0}")]
    MissingUnit(String),
    #[error("unknown unit \"{unit}\" in duration {original}")]
    UnknownUnit { unit: String, original: String },
    #[error("duration overflows: {0}")]
    Overflow(String),
}

/// A duration as supplied by a caller configuring a rule
#[derive(Debug, Clone, PartialEq)]
pub enum DurationInput {
    /// Number of seconds; may be fractional or negative and is checked
    Number(f64),
    /// Duration string made of `<digits><unit>` segments
    Text(String),
}

impl fmt::Display for DurationInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DurationInput::Number(n) => write!(f, "{}", n),
            DurationInput::Text(s) => f.write_str(s),
        }
    }
}

impl From<u32> for DurationInput {
    fn from(value: u32) -> Self {
        DurationInput::Number(f64::from(value))
    }
}

impl From<i64> for DurationInput {
    fn from(value: i64) -> Self {
        DurationInput::Number(value as f64)
    }
}

impl From<i32> for DurationInput {
    fn from(value: i32) -> Self {
        DurationInput::Number(f64::from(value))
    }
}

impl From<f64> for DurationInput {
    fn from(value: f64) -> Self {
        DurationInput::Number(value)
    }
}

impl From<&str> for DurationInput {
    fn from(value: &str) -> Self {
        DurationInput::Text(value.to_string())
    }
}

impl From<String> for DurationInput {
    fn from(value: String) -> Self {
        DurationInput::Text(value)
    }
}

fn unit_seconds(unit: &str) -> Option<u64> {
    match unit {
        "s" => Some(SECOND),
        "m" => Some(MINUTE),
        "h" => Some(HOUR),
        "d" => Some(DAY),
        _ => None,
    }
}

/// Parse a duration into whole seconds
///
/// # Arguments
///
/// * `value` - A second count or a duration string such as `"1h30m"`
///
/// # Returns
///
/// * `Ok(seconds)`, never more than [`MAX_DURATION`]
/// * `Err(DurationError)` describing the first problem found
pub fn parse(value: impl Into<DurationInput>) -> Result<u32, DurationError> {
    match value.into() {
        DurationInput::Number(n) => parse_number(n),
        DurationInput::Text(s) => parse_text(&s),
    }
}

fn parse_number(value: f64) -> Result<u32, DurationError> {
    let original = value.to_string();
    if !value.is_finite() || value.fract() != 0.0 {
        return Err(DurationError::NonInteger(original));
    }
    if value < 0.0 {
        return Err(DurationError::Negative(original));
    }
    if value > MAX_DURATION as f64 {
        return Err(DurationError::TooLarge(original));
    }
    Ok(value as u32)
}

fn parse_text(original: &str) -> Result<u32, DurationError> {
    if original == "0" {
        return Ok(0);
    }
    if original.is_empty() {
        return Err(DurationError::Empty);
    }

    let bytes = original.as_bytes();
    let mut pos = 0;
    let mut total: u64 = 0;

    while pos < bytes.len() {
        if !bytes[pos].is_ascii_digit() {
            return Err(DurationError::Invalid(original.to_string()));
        }

        let mut amount: u64 = 0;
        while pos < bytes.len() && bytes[pos].is_ascii_digit() {
            amount = amount * 10 + u64::from(bytes[pos] - b'0');
            if amount > MAX_DURATION {
                return Err(DurationError::Overflow(original.to_string()));
            }
            pos += 1;
        }

        if pos < bytes.len() && bytes[pos] == b'.' {
            return Err(DurationError::Decimal(original.to_string()));
        }

        let unit_start = pos;
        while pos < bytes.len() && !bytes[pos].is_ascii_digit() && bytes[pos] != b'.' {
            pos += 1;
        }
        if unit_start == pos {
            return Err(DurationError::MissingUnit(original.to_string()));
        }

        let unit = &original[unit_start..pos];
        let multiplier = unit_seconds(unit).ok_or_else(|| DurationError::UnknownUnit {
            unit: unit.to_string(),
            original: original.to_string(),
        })?;

        total = amount
            .checked_mul(multiplier)
            .and_then(|seconds| total.checked_add(seconds))
            .filter(|sum| *sum <= MAX_DURATION)
            .ok_or_else(|| DurationError::Overflow(original.to_string()))?;
    }

    Ok(total as u32)
}
