//! The stored time series for one cache key.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::event::MetricType;

/// Timestamps and values for one key, kept in timestamp order.
///
/// The two sequences always have the same length. When `max_points` is
/// exceeded the oldest samples are pruned first.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    url: String,
    metric_type: MetricType,
    last_update_time: DateTime<Utc>,
    timestamps: Vec<i64>,
    values: Vec<f64>,
}

impl CacheEntry {
    /// Create an empty entry for a normalized URL.
    #[must_use]
    pub fn new(url: impl Into<String>, metric_type: MetricType, now: DateTime<Utc>) -> Self {
        Self {
            url: url.into(),
            metric_type,
            last_update_time: now,
            timestamps: Vec::new(),
            values: Vec::new(),
        }
    }

    /// Normalized URL whose series this is.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Metric family.
    #[must_use]
    pub fn metric_type(&self) -> MetricType {
        self.metric_type
    }

    /// When a sample was last appended.
    #[must_use]
    pub fn last_update_time(&self) -> DateTime<Utc> {
        self.last_update_time
    }

    /// Sample timestamps in epoch milliseconds, ascending.
    #[must_use]
    pub fn timestamps(&self) -> &[i64] {
        &self.timestamps
    }

    /// Sample values, parallel to [`CacheEntry::timestamps`].
    #[must_use]
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Number of samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    /// Whether the entry holds no samples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Sum of all values.
    #[must_use]
    pub fn sum(&self) -> f64 {
        self.values.iter().sum()
    }

    /// Append a sample and prune to `max_points`.
    pub fn push(&mut self, timestamp: i64, value: f64, now: DateTime<Utc>, max_points: usize) {
        let at = self.timestamps.partition_point(|&t| t <= timestamp);
        self.timestamps.insert(at, timestamp);
        self.values.insert(at, value);
        self.last_update_time = self.last_update_time.max(now);
        self.prune(max_points);
    }

    /// Fold another entry's samples into this one.
    pub fn merge(&mut self, other: &CacheEntry, max_points: usize) {
        for (&t, &v) in other.timestamps.iter().zip(&other.values) {
            let at = self.timestamps.partition_point(|&x| x <= t);
            self.timestamps.insert(at, t);
            self.values.insert(at, v);
        }
        self.last_update_time = self.last_update_time.max(other.last_update_time);
        self.prune(max_points);
    }

    /// Drop samples outside `[start_ms, end_ms]`.
    pub fn retain_range(&mut self, start_ms: i64, end_ms: i64) {
        let from = self.timestamps.partition_point(|&t| t < start_ms);
        let to = self.timestamps.partition_point(|&t| t <= end_ms);
        self.timestamps.truncate(to);
        self.values.truncate(to);
        self.timestamps.drain(..from.min(to));
        self.values.drain(..from.min(to));
    }

    fn prune(&mut self, max_points: usize) {
        let max_points = max_points.max(1);
        if self.timestamps.len() > max_points {
            let excess = self.timestamps.len() - max_points;
            self.timestamps.drain(..excess);
            self.values.drain(..excess);
        }
        debug_assert_eq!(self.timestamps.len(), self.values.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> CacheEntry {
        CacheEntry::new("/api/x", MetricType::Performance, Utc::now())
    }

    #[test]
    fn test_push_keeps_parallel_and_sorted() {
        let mut e = entry();
        let now = Utc::now();
        e.push(30, 3.0, now, 100);
        e.push(10, 1.0, now, 100);
        e.push(20, 2.0, now, 100);

        assert_eq!(e.timestamps(), &[10, 20, 30]);
        assert_eq!(e.values(), &[1.0, 2.0, 3.0]);
        assert_eq!(e.len(), 3);
        assert!((e.sum() - 6.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_prune_oldest_first() {
        let mut e = entry();
        let now = Utc::now();
        for t in 0..5 {
            e.push(t, 1.0, now, 3);
        }
        assert_eq!(e.timestamps(), &[2, 3, 4]);
        assert_eq!(e.values().len(), 3);
    }

    #[test]
    fn test_last_update_advances() {
        let start = Utc::now();
        let mut e = CacheEntry::new("/", MetricType::Error, start);
        let later = start + chrono::Duration::seconds(5);
        e.push(1, 1.0, later, 10);
        assert_eq!(e.last_update_time(), later);
        e.push(2, 1.0, start, 10);
        assert_eq!(e.last_update_time(), later);
    }

    #[test]
    fn test_merge_and_retain_range() {
        let now = Utc::now();
        let mut a = entry();
        a.push(10, 1.0, now, 100);
        a.push(40, 4.0, now, 100);
        let mut b = entry();
        b.push(20, 2.0, now, 100);
        b.push(30, 3.0, now, 100);

        a.merge(&b, 100);
        assert_eq!(a.timestamps(), &[10, 20, 30, 40]);

        a.retain_range(15, 30);
        assert_eq!(a.timestamps(), &[20, 30]);
        assert_eq!(a.values(), &[2.0, 3.0]);
    }

    #[test]
    fn test_retain_empty_range() {
        let now = Utc::now();
        let mut a = entry();
        a.push(10, 1.0, now, 100);
        a.retain_range(50, 60);
        assert!(a.is_empty());
        assert!(a.values().is_empty());
    }

    #[test]
    fn test_serializes_camel_case() {
        let json = serde_json::to_value(entry()).unwrap();
        assert!(json.get("lastUpdateTime").is_some());
        assert_eq!(json["metricType"], "performance");
        assert!(json["timestamps"].as_array().unwrap().is_empty());
    }
}
