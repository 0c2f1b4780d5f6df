//! Timestamp format used on the slave wire.
//!
//! Slaves format step and build timestamps as e.g.
//! `"4 10 23 22:53:11 2024 +0000"` (weekday, month, day, time, year,
//! offset). Everything is converted to UTC before persistence.

use chrono::{DateTime, Utc};

use crate::error::{BellowsError, Result};

pub const WIRE_TIME_FORMAT: &str = "%w %m %d %H:%M:%S %Y %z";

/// Parses a wire timestamp and converts it to UTC.
pub fn parse_wire(field: &'static str, s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_str(s, WIRE_TIME_FORMAT)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| BellowsError::DateParse {
            field,
            message: format!("{:?}: {}", s, e),
        })
}

/// Formats a timestamp the way slaves expect it on the wire.
pub fn format_wire(dt: &DateTime<Utc>) -> String {
    dt.format(WIRE_TIME_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_roundtrip() {
        let dt = Utc.with_ymd_and_hms(2024, 10, 23, 22, 53, 11).unwrap();
        let formatted = format_wire(&dt);
        let parsed = parse_wire("test", &formatted).unwrap();
        assert_eq!(parsed, dt);
    }

    #[test]
    fn test_parse_converts_offset_to_utc() {
        // 22:53:11 at -0300 is 01:53:11 UTC the next day.
        let parsed = parse_wire("test", "3 10 23 22:53:11 2024 -0300").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2024, 10, 24, 1, 53, 11).unwrap());
    }

    #[test]
    fn test_parse_garbage_is_an_error() {
        assert!(parse_wire("test", "not-a-timestamp").is_err());
    }
}
