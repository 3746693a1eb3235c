//! Event collection and batching.
//!
//! The [`Collector`] keeps one buffer per [`Priority`]. A buffer is drained
//! into an immutable [`ProcessingRecord`] when it reaches the batch size, when
//! the periodic flush timer fires, or, for ERROR events, immediately.
//! Recording never suspends; the timer lives in [`crate::pipeline`].

use tracing::trace;

use crate::record::{Priority, ProcessingRecord};

/// Per-priority event buffers.
#[derive(Debug)]
pub struct Collector {
    buffers: [Vec<String>; 3],
    max_batch_size: usize,
}

impl Collector {
    /// Create a collector that flushes a buffer once it holds
    /// `max_batch_size` events. A size of zero is treated as one.
    #[must_use]
    pub fn new(max_batch_size: usize) -> Self {
        Self {
            buffers: [Vec::new(), Vec::new(), Vec::new()],
            max_batch_size: max_batch_size.max(1),
        }
    }

    /// Append a serialized event to its priority buffer.
    ///
    /// Returns a record when this append triggered a flush: always for
    /// [`Priority::Error`], otherwise once the buffer reaches the batch size.
    pub fn record(&mut self, event: String, priority: Priority) -> Option<ProcessingRecord> {
        let buffer = &mut self.buffers[priority.index()];
        buffer.push(event);

        if priority == Priority::Error || buffer.len() >= self.max_batch_size {
            return self.flush(priority);
        }
        None
    }

    /// Drain one priority buffer into a record. An empty buffer yields `None`.
    pub fn flush(&mut self, priority: Priority) -> Option<ProcessingRecord> {
        let buffer = &mut self.buffers[priority.index()];
        if buffer.is_empty() {
            return None;
        }
        let events = std::mem::take(buffer);
        let record = ProcessingRecord::new(priority, events);
        trace!(
            record_id = record.id(),
            priority = %priority,
            events = record.len(),
            "Flushed buffer"
        );
        Some(record)
    }

    /// Drain every non-empty buffer, highest priority first.
    pub fn flush_all(&mut self) -> Vec<ProcessingRecord> {
        Priority::ALL
            .into_iter()
            .filter_map(|priority| self.flush(priority))
            .collect()
    }

    /// Events waiting in one priority buffer.
    #[must_use]
    pub fn pending(&self, priority: Priority) -> usize {
        self.buffers[priority.index()].len()
    }

    /// Events waiting across all buffers.
    #[must_use]
    pub fn total_pending(&self) -> usize {
        self.buffers.iter().map(Vec::len).sum()
    }

    /// Configured batch size.
    #[must_use]
    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(n: usize) -> String {
        format!(r#"{{"n":{n}}}"#)
    }

    #[test]
    fn test_record_below_threshold_buffers() {
        let mut collector = Collector::new(3);
        assert!(collector.record(ev(1), Priority::Performance).is_none());
        assert!(collector.record(ev(2), Priority::Performance).is_none());
        assert_eq!(collector.pending(Priority::Performance), 2);
    }

    #[test]
    fn test_record_at_threshold_flushes() {
        let mut collector = Collector::new(2);
        assert!(collector.record(ev(1), Priority::UserBehavior).is_none());
        let record = collector
            .record(ev(2), Priority::UserBehavior)
            .expect("threshold flush");
        assert_eq!(record.priority(), Priority::UserBehavior);
        assert_eq!(record.events(), &[ev(1), ev(2)]);
        assert_eq!(collector.pending(Priority::UserBehavior), 0);
    }

    #[test]
    fn test_error_flushes_immediately_and_only_errors() {
        let mut collector = Collector::new(10);
        collector.record(ev(1), Priority::Performance);
        collector.record(ev(2), Priority::UserBehavior);

        let record = collector.record(ev(3), Priority::Error).expect("error flush");
        assert_eq!(record.priority(), Priority::Error);
        assert_eq!(record.len(), 1);
        assert_eq!(collector.pending(Priority::Performance), 1);
        assert_eq!(collector.pending(Priority::UserBehavior), 1);
    }

    #[test]
    fn test_flush_empty_yields_none() {
        let mut collector = Collector::new(5);
        assert!(collector.flush(Priority::Performance).is_none());
        assert!(collector.flush_all().is_empty());
    }

    #[test]
    fn test_flush_all_orders_by_priority() {
        let mut collector = Collector::new(10);
        collector.record(ev(1), Priority::UserBehavior);
        collector.record(ev(2), Priority::Performance);

        let records = collector.flush_all();
        let priorities: Vec<_> = records.iter().map(ProcessingRecord::priority).collect();
        assert_eq!(
            priorities,
            vec![Priority::Performance, Priority::UserBehavior]
        );
        assert_eq!(collector.total_pending(), 0);
    }

    #[test]
    fn test_records_preserve_event_order() {
        let mut collector = Collector::new(100);
        for i in 0..5 {
            collector.record(ev(i), Priority::Performance);
        }
        let record = collector.flush(Priority::Performance).unwrap();
        let expected: Vec<_> = (0..5).map(ev).collect();
        assert_eq!(record.events(), expected.as_slice());
        assert_eq!(record.retries(), 0);
    }

    #[test]
    fn test_zero_batch_size_is_clamped() {
        let mut collector = Collector::new(0);
        assert_eq!(collector.max_batch_size(), 1);
        assert!(collector.record(ev(1), Priority::UserBehavior).is_some());
    }
}
