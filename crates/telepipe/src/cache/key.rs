//! Cache key derivation.
//!
//! A key is `{namespace}:{indicator}:{url_hash}:{start}:{end}` where the
//! stamps are the enclosing time window at minute granularity
//! (`%Y%m%d%H%M`) and `url_hash` is the first 16 hex digits of the BLAKE3
//! digest of the URL with query string and fragment removed.

use std::fmt;

use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::event::Event;

/// Hex digits of the URL digest kept in a key.
pub const URL_HASH_LEN: usize = 16;

const STAMP_FORMAT: &str = "%Y%m%d%H%M";

/// Strip the query string and fragment from a URL.
#[must_use]
pub fn normalize_url(url: &str) -> &str {
    let end = url.find(|c: char| c == '?' || c == '#').unwrap_or(url.len());
    url[..end].trim()
}

/// Fixed-length fingerprint of a normalized URL.
#[must_use]
pub fn url_fingerprint(normalized_url: &str) -> String {
    let digest = blake3::hash(normalized_url.as_bytes());
    digest.to_hex()[..URL_HASH_LEN].to_string()
}

/// The window of length `window` that contains `at`.
///
/// Windows are aligned to the Unix epoch, so with a one-minute window the
/// start is `at` rounded down to the minute.
#[must_use]
pub fn bucket(at: DateTime<Utc>, window: Duration) -> (DateTime<Utc>, DateTime<Utc>) {
    let window_ms = window.num_milliseconds().max(60_000);
    let start_ms = at.timestamp_millis().div_euclid(window_ms) * window_ms;
    let start = Utc
        .timestamp_millis_opt(start_ms)
        .single()
        .unwrap_or(at);
    (start, start + Duration::milliseconds(window_ms))
}

/// Identifies one metric series for one indicator, URL and time window.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    namespace: String,
    indicator_id: u32,
    url_hash: String,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
}

impl CacheKey {
    /// Derive the key for a URL and instant.
    #[must_use]
    pub fn derive(
        namespace: &str,
        indicator_id: u32,
        url: &str,
        at: DateTime<Utc>,
        window: Duration,
    ) -> Self {
        let (window_start, window_end) = bucket(at, window);
        Self {
            namespace: namespace.to_string(),
            indicator_id,
            url_hash: url_fingerprint(normalize_url(url)),
            window_start,
            window_end,
        }
    }

    /// Derive the key an event is aggregated under, using the event's own
    /// timestamp. `None` if the timestamp is not representable.
    #[must_use]
    pub fn for_event(namespace: &str, event: &Event, window: Duration) -> Option<Self> {
        let at = event.occurred_at()?;
        Some(Self::derive(
            namespace,
            event.indicator_id(),
            event.url(),
            at,
            window,
        ))
    }

    /// Namespace prefix.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Indicator identifier.
    #[must_use]
    pub fn indicator_id(&self) -> u32 {
        self.indicator_id
    }

    /// URL fingerprint.
    #[must_use]
    pub fn url_hash(&self) -> &str {
        &self.url_hash
    }

    /// Inclusive window start.
    #[must_use]
    pub fn window_start(&self) -> DateTime<Utc> {
        self.window_start
    }

    /// Exclusive window end.
    #[must_use]
    pub fn window_end(&self) -> DateTime<Utc> {
        self.window_end
    }

    /// Whether this key's window overlaps `[start, end]`.
    #[must_use]
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.window_start <= end && start < self.window_end
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}",
            self.namespace,
            self.indicator_id,
            self.url_hash,
            self.window_start.format(STAMP_FORMAT),
            self.window_end.format(STAMP_FORMAT)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_normalize_url() {
        assert_eq!(normalize_url("/api/x?id=1#top"), "/api/x");
        assert_eq!(normalize_url("/api/x#frag"), "/api/x");
        assert_eq!(normalize_url("/api/x"), "/api/x");
        assert_eq!(normalize_url("?only=query"), "");
    }

    #[test]
    fn test_fingerprint_is_fixed_length_hex() {
        let hash = url_fingerprint("/api/x");
        assert_eq!(hash.len(), URL_HASH_LEN);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash, url_fingerprint("/api/x"));
        assert_ne!(hash, url_fingerprint("/api/y"));
    }

    #[test]
    fn test_bucket_rounds_to_minute() {
        let (start, end) = bucket(at("2024-03-05T10:15:42.123Z"), Duration::minutes(1));
        assert_eq!(start, at("2024-03-05T10:15:00Z"));
        assert_eq!(end, at("2024-03-05T10:16:00Z"));
    }

    #[test]
    fn test_bucket_wider_window() {
        let (start, end) = bucket(at("2024-03-05T10:17:42Z"), Duration::minutes(5));
        assert_eq!(start, at("2024-03-05T10:15:00Z"));
        assert_eq!(end, at("2024-03-05T10:20:00Z"));
    }

    #[test]
    fn test_same_minute_same_key() {
        let window = Duration::minutes(1);
        let a = CacheKey::derive("telemetry", 7, "/api/x", at("2024-01-01T00:00:01Z"), window);
        let b = CacheKey::derive(
            "telemetry",
            7,
            "/api/x?page=2",
            at("2024-01-01T00:00:59Z"),
            window,
        );
        assert_eq!(a, b);

        let c = CacheKey::derive("telemetry", 7, "/api/x", at("2024-01-01T00:01:00Z"), window);
        assert_ne!(a, c);
        let d = CacheKey::derive("telemetry", 8, "/api/x", at("2024-01-01T00:00:01Z"), window);
        assert_ne!(a, d);
    }

    #[test]
    fn test_rendered_key() {
        let key = CacheKey::derive(
            "telemetry",
            7,
            "/api/x",
            at("2024-01-01T00:00:30Z"),
            Duration::minutes(1),
        );
        let rendered = key.to_string();
        let parts: Vec<&str> = rendered.split(':').collect();
        assert_eq!(parts.len(), 5);
        assert_eq!(parts[0], "telemetry");
        assert_eq!(parts[1], "7");
        assert_eq!(parts[2], url_fingerprint("/api/x"));
        assert_eq!(parts[3], "202401010000");
        assert_eq!(parts[4], "202401010001");
    }

    #[test]
    fn test_overlaps() {
        let key = CacheKey::derive(
            "t",
            1,
            "/",
            at("2024-01-01T00:00:30Z"),
            Duration::minutes(1),
        );
        assert!(key.overlaps(at("2024-01-01T00:00:00Z"), at("2024-01-01T00:00:00Z")));
        assert!(key.overlaps(at("2023-12-31T23:00:00Z"), at("2024-01-01T01:00:00Z")));
        assert!(!key.overlaps(at("2024-01-01T00:01:00Z"), at("2024-01-01T00:02:00Z")));
        assert!(!key.overlaps(at("2023-12-31T23:00:00Z"), at("2023-12-31T23:59:59Z")));
    }
}
