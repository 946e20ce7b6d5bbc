use std::time::{SystemTime, UNIX_EPOCH};

/// Current UTC timestamp in ISO 8601 format with second precision.
pub fn utc_now() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Current unix time as fractional seconds.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Format a unix timestamp as ISO 8601 UTC with microsecond precision.
pub fn iso_from_unix(ts: f64) -> String {
    let secs = ts.trunc() as i64;
    let micros = ((ts.fract() * 1_000_000.0).round() as u32).min(999_999);
    chrono::DateTime::from_timestamp(secs, micros * 1000)
        .unwrap_or_default()
        .format("%Y-%m-%dT%H:%M:%S.%6fZ")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utc_now_format() {
        let ts = utc_now();
        assert!(ts.ends_with('Z'));
        assert_eq!(ts.len(), 20);
        assert_eq!(&ts[10..11], "T");
    }

    #[test]
    fn test_unix_now_is_recent() {
        // Sometime after 2023.
        assert!(unix_now() > 1_680_000_000.0);
    }

    #[test]
    fn test_iso_from_unix() {
        let iso = iso_from_unix(0.0);
        assert_eq!(iso, "1970-01-01T00:00:00.000000Z");
        let iso = iso_from_unix(1_700_000_000.5);
        assert!(iso.starts_with("2023-11-14T22:13:20.5"));
    }
}
