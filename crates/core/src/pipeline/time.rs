//! Conversion of time field values to whole seconds since the epoch

use crate::job::TimeFormat;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use thiserror::Error;

/// A time value the configured format rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Cannot parse timestamp '{value}' with format '{format}'")]
pub struct TimestampParseError {
    /// Offending value
    pub value: String,
    /// Format it was parsed with
    pub format: String,
}

/// Converts time values in one [`TimeFormat`] to epoch seconds
#[derive(Debug, Clone)]
pub struct DateTransformer {
    format: TimeFormat,
}

impl DateTransformer {
    /// Transformer for `format`
    pub fn new(format: TimeFormat) -> Self {
        Self { format }
    }

    /// Epoch seconds for `value`
    pub fn transform(&self, value: &str) -> Result<i64, TimestampParseError> {
        let value = value.trim();
        let parsed = match &self.format {
            TimeFormat::EpochSeconds => parse_epoch(value, 1),
            TimeFormat::EpochMillis => parse_epoch(value, 1000),
            TimeFormat::Pattern(pattern) => parse_pattern(value, pattern),
        };
        parsed.ok_or_else(|| TimestampParseError {
            value: value.to_string(),
            format: self.format.to_string(),
        })
    }
}

/// Integer parse first so large values keep full precision; fractional
/// values are truncated.
fn parse_epoch(value: &str, divisor: i64) -> Option<i64> {
    if let Ok(whole) = value.parse::<i64>() {
        return Some(whole / divisor);
    }
    let float = value.parse::<f64>().ok().filter(|f| f.is_finite())?;
    let seconds = (float / divisor as f64).trunc();
    if seconds < i64::MIN as f64 || seconds > i64::MAX as f64 {
        return None;
    }
    Some(seconds as i64)
}

/// Patterns with an offset are honoured; patterns without one are UTC.
fn parse_pattern(value: &str, pattern: &str) -> Option<i64> {
    if let Ok(dt) = DateTime::parse_from_str(value, pattern) {
        return Some(dt.timestamp());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, pattern) {
        return Some(naive.and_utc().timestamp());
    }
    NaiveDate::parse_from_str(value, pattern)
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc().timestamp())
}
