//! Timestamp parsing for calculation service responses.
//!
//! The service emits ISO-8601 in more than one shape: with or without
//! fractional seconds, `Z` or a literal `+00:00` offset, and occasionally
//! a bare naive timestamp. Try the strict form first, then fall back.

use chrono::{DateTime, NaiveDateTime, Utc};

/// Parse a service timestamp, attempting each known variant in turn.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();

    // RFC 3339: fractional or whole seconds, `Z` or explicit offset.
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }

    // Offset written without RFC 3339 niceties (e.g. `+0000`).
    if let Ok(dt) = DateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(dt.with_timezone(&Utc));
    }

    // Naive timestamp: the service means UTC.
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }

    None
}
