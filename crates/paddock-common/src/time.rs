//! ---
//! pdk_section: "01-core-functionality"
//! pdk_subsection: "module"
//! pdk_type: "source"
//! pdk_scope: "code"
//! pdk_description: "Shared primitives and utilities for the replay runtime."
//! pdk_version: "v0.0.0-prealpha"
//! pdk_owner: "tbd"
//! ---
use chrono::{DateTime, SecondsFormat, Utc};

/// Parse an ISO-8601 / RFC 3339 timestamp into a UTC instant.
pub fn parse_instant(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Render a UTC instant the way it travels on the wire: RFC 3339 with the
/// minimal fractional-second width (`…T14:00:00Z`, `…T14:00:00.200Z`).
pub fn format_instant(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Whole milliseconds between two instants. Negative when `later < earlier`.
pub fn millis_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> i64 {
    (later - earlier).num_milliseconds()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn round_trips_wire_timestamps() {
        let parsed = parse_instant("2024-05-12T14:00:00Z").expect("parses");
        assert_eq!(format_instant(parsed), "2024-05-12T14:00:00Z");

        let sub_second = parse_instant("2024-05-12T14:00:00.200Z").expect("parses");
        assert_eq!(format_instant(sub_second), "2024-05-12T14:00:00.200Z");
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_instant("not-a-timestamp").is_none());
        assert!(parse_instant("").is_none());
    }

    #[test]
    fn millis_between_is_signed() {
        let start = Utc.with_ymd_and_hms(2024, 5, 12, 14, 0, 0).unwrap();
        let end = start + chrono::Duration::milliseconds(250);
        assert_eq!(millis_between(start, end), 250);
        assert_eq!(millis_between(end, start), -250);
    }
}
