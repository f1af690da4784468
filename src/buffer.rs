use crate::record::LogRecord;

/// In-memory queue of records awaiting the next flush.
///
/// The buffer never evicts on its own; callers decide when to drain it.
/// `push` reports whether the capacity has been reached so the caller can
/// schedule a flush.
#[derive(Debug)]
pub struct RecordBuffer {
    records: Vec<LogRecord>,
    capacity: usize,
}

impl RecordBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a record; returns `true` once the buffer is at capacity.
    pub fn push(&mut self, record: LogRecord) -> bool {
        self.records.push(record);
        self.is_full()
    }

    /// Empty the buffer and return its contents in insertion order.
    pub fn drain_all(&mut self) -> Vec<LogRecord> {
        std::mem::replace(&mut self.records, Vec::with_capacity(self.capacity))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.records.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize;
    use crate::record::StaticMetadata;
    use serde_json::json;
    use std::sync::Arc;

    fn record(msg: &str) -> LogRecord {
        normalize(json!({ "msg": msg }), &Arc::new(StaticMetadata::default()))
    }

    #[test]
    fn reports_full_at_capacity() {
        let mut buffer = RecordBuffer::new(2);
        assert!(!buffer.push(record("a")));
        assert!(buffer.push(record("b")));
        assert!(buffer.push(record("c")));
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn drain_preserves_order_and_empties() {
        let mut buffer = RecordBuffer::new(8);
        for msg in ["a", "b", "c"] {
            buffer.push(record(msg));
        }
        let drained: Vec<_> = buffer.drain_all().into_iter().map(|r| r.message).collect();
        assert_eq!(drained, ["a", "b", "c"]);
        assert!(buffer.is_empty());
        assert!(buffer.drain_all().is_empty());
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let mut buffer = RecordBuffer::new(0);
        assert_eq!(buffer.capacity(), 1);
        assert!(buffer.push(record("a")));
    }
}
