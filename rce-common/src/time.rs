//! Timestamp utilities

use chrono::{DateTime, SecondsFormat, Utc};

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// RFC 3339 rendering with microsecond precision
pub fn to_iso(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Current time as an RFC 3339 string
pub fn now_iso() -> String {
    to_iso(&now())
}

/// Filesystem-safe form of an ISO timestamp (':' is not allowed on every platform)
pub fn colon_safe(iso: &str) -> String {
    iso.replace(':', "-")
}

/// Milliseconds elapsed between two instants (never negative)
pub fn elapsed_ms(start: &DateTime<Utc>, end: &DateTime<Utc>) -> f64 {
    let micros = (*end - *start).num_microseconds().unwrap_or(0);
    (micros.max(0) as f64) / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_now_returns_recent_timestamp() {
        let timestamp = now();
        assert!(timestamp.timestamp() > 946_684_800); // 2000-01-01
        assert!(timestamp.timestamp() < 4_102_444_800); // 2100-01-01
    }

    #[test]
    fn test_colon_safe_removes_colons() {
        let safe = colon_safe("2025-01-02T03:04:05.000000Z");
        assert_eq!(safe, "2025-01-02T03-04-05.000000Z");
        assert!(!safe.contains(':'));
    }

    #[test]
    fn test_to_iso_round_trips() {
        let ts = now();
        let parsed = DateTime::parse_from_rfc3339(&to_iso(&ts)).unwrap();
        assert_eq!(parsed.timestamp(), ts.timestamp());
    }

    #[test]
    fn test_elapsed_ms() {
        let start = now();
        let end = start + Duration::milliseconds(250);
        assert!((elapsed_ms(&start, &end) - 250.0).abs() < 1e-9);
        assert_eq!(elapsed_ms(&end, &start), 0.0);
    }
}
