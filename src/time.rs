//! Canonical UTC timestamp handling.
//!
//! All writes and reads of `detection_time` (and other instants) go
//! through [`to_canonical`]/[`from_canonical`] so that the stored string
//! representation sorts lexicographically in the same order as the
//! underlying instant.

use chrono::{DateTime, SecondsFormat, Utc};

pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Format an instant as a sortable, millisecond-precision UTC string.
pub fn to_canonical(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a canonical timestamp string back into an instant.
pub fn from_canonical(s: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn canonical_round_trip() {
        let t = Utc.with_ymd_and_hms(2026, 7, 31, 12, 0, 0).unwrap() + chrono::Duration::milliseconds(123);
        let s = to_canonical(t);
        assert_eq!(from_canonical(&s).unwrap(), t);
    }

    #[test]
    fn canonical_strings_sort_chronologically() {
        let a = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let b = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 1).unwrap();
        assert!(to_canonical(a) < to_canonical(b));
    }
}
