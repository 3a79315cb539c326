//! Instant parsing and rendering in the organization timezone.
//!
//! Every instant arriving on the wire must carry an explicit offset. It is
//! converted to the organization timezone and then to Unix milliseconds, so
//! no comparison downstream ever mixes offsets.

use chrono::{DateTime, SecondsFormat, TimeZone};
use chrono_tz::Tz;

use crate::model::{Ms, Span};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeError {
    /// Not RFC 3339, or no offset given.
    Malformed(String),
    /// `start >= end`.
    EmptyWindow,
}

impl std::fmt::Display for TimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeError::Malformed(raw) => {
                write!(f, "malformed instant {raw:?}: expected ISO-8601 with offset")
            }
            TimeError::EmptyWindow => write!(f, "window start must be before end"),
        }
    }
}

impl std::error::Error for TimeError {}

/// Parse an offset-bearing ISO-8601 instant into the organization timezone.
pub fn normalize(raw: &str, tz: Tz) -> Result<DateTime<Tz>, TimeError> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|dt| dt.with_timezone(&tz))
        .map_err(|_| TimeError::Malformed(raw.to_string()))
}

pub fn parse_instant(raw: &str, tz: Tz) -> Result<Ms, TimeError> {
    normalize(raw, tz).map(|dt| dt.timestamp_millis())
}

pub fn parse_window(start: &str, end: &str, tz: Tz) -> Result<Span, TimeError> {
    let start = parse_instant(start, tz)?;
    let end = parse_instant(end, tz)?;
    Span::try_new(start, end).ok_or(TimeError::EmptyWindow)
}

/// Render as RFC 3339 in the organization timezone.
pub fn format_instant(ms: Ms, tz: Tz) -> String {
    match tz.timestamp_millis_opt(ms).single() {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::AutoSi, false),
        None => ms.to_string(),
    }
}
