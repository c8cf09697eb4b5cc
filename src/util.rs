use chrono::{DateTime, Utc};
use std::time::Duration;

pub(crate) fn retriable_status(code: u16) -> bool {
    matches!(code, 500 | 502 | 503 | 504 | 429 | 408)
}

/// Doubles the previous delay, never exceeding `max`.
pub(crate) fn backoff(current: Duration, max: Duration) -> Duration {
    let next = current.saturating_mul(2);
    if next > max { max } else { next }
}

pub(crate) fn urljoin(base: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    if path.starts_with('/') {
        // Absolute path: keep scheme and authority of the base.
        if let Some(scheme_end) = base.find("://") {
            let authority_end = base[scheme_end + 3..]
                .find('/')
                .map(|i| scheme_end + 3 + i)
                .unwrap_or(base.len());
            return format!("{}{}", &base[..authority_end], path);
        }
        return format!("{}{}", base.trim_end_matches('/'), path);
    }
    let base = base.trim_end_matches('/');
    format!("{}/{}", base, path)
}

/// Quotes a string literal for an OData `$filter` expression.
pub(crate) fn odata_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Timestamp format expected by the CDSE catalog, e.g. `2024-03-18T00:00:00.000Z`.
pub(crate) fn odata_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn backoff_doubles_and_caps() {
        let max = Duration::from_secs(30);
        assert_eq!(backoff(Duration::from_secs(1), max), Duration::from_secs(2));
        assert_eq!(backoff(Duration::from_secs(20), max), max);
        assert_eq!(backoff(Duration::ZERO, max), Duration::ZERO);
    }

    #[test]
    fn retriable_statuses() {
        assert!(retriable_status(503));
        assert!(retriable_status(429));
        assert!(!retriable_status(404));
        assert!(!retriable_status(401));
    }

    #[test]
    fn urljoin_handles_relative_and_absolute() {
        assert_eq!(urljoin("https://a.b/odata/v1/", "Products"), "https://a.b/odata/v1/Products");
        assert_eq!(urljoin("https://a.b/odata/v1", "/x/y"), "https://a.b/x/y");
        assert_eq!(urljoin("https://a.b/odata", "https://c.d/z"), "https://c.d/z");
    }

    #[test]
    fn quotes_are_doubled() {
        assert_eq!(odata_quote("O'Brien"), "'O''Brien'");
    }

    #[test]
    fn timestamps_render_with_millis() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 18, 0, 0, 0).unwrap();
        assert_eq!(odata_timestamp(&ts), "2024-03-18T00:00:00.000Z");
    }
}
