//! Ring positions and the records stored at them.
//!
//! A log of capacity `N` addresses its slots `0..N` and wraps around.
//! [`RecordInfo`] carries both the slot and the capacity so every position
//! can compute its own successor without a reference back to the log.
//!
//! ```text
//!          checkpoint          committed            last
//!              │                   │                  │
//!   ... ───────┼───────────────────┼──────────────────┼───────── ...
//!      purged  │  readable records │ reserved, not    │  free
//!              │                   │ yet committed    │
//! ```

use std::hash::{Hash, Hasher};
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Position of a record inside a circular log.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RecordInfo {
    pub index: i64,
    pub max_queue_length: i64,
}

impl RecordInfo {
    /// Sentinel index meaning "no record yet".
    pub const INVALID_INDEX: i64 = -1;

    pub fn new(index: i64, max_queue_length: i64) -> Self {
        Self {
            index,
            max_queue_length,
        }
    }

    /// The position before slot 0.
    pub fn invalid(max_queue_length: i64) -> Self {
        Self::new(Self::INVALID_INDEX, max_queue_length)
    }

    pub fn is_valid(&self) -> bool {
        self.index != Self::INVALID_INDEX
    }

    /// Successor slot, wrapping at the capacity. The sentinel's successor is 0.
    pub fn next(&self) -> Self {
        Self::new((self.index + 1) % self.max_queue_length, self.max_queue_length)
    }

    /// Number of forward steps from `self` to `other`.
    ///
    /// The sentinel behaves as if it sat at `max_queue_length - 1`, so the
    /// distance from the sentinel to slot 0 is 1.
    pub fn distance_to(&self, other: &RecordInfo) -> i64 {
        let from = self.ring_position();
        let to = other.ring_position();
        (to - from).rem_euclid(self.max_queue_length)
    }

    fn ring_position(&self) -> i64 {
        if self.is_valid() {
            self.index
        } else {
            self.max_queue_length - 1
        }
    }
}

impl PartialEq for RecordInfo {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl Eq for RecordInfo {}

impl Hash for RecordInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}

impl std::fmt::Display for RecordInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.index, self.max_queue_length)
    }
}

/// An item read back from a log together with its position.
#[derive(Debug, Clone, PartialEq)]
pub struct Record<T> {
    pub item: T,
    pub record_info: RecordInfo,
}

impl<T> Record<T> {
    pub fn new(item: T, record_info: RecordInfo) -> Self {
        Self { item, record_info }
    }
}

/// Commit bookkeeping for one reserved slot.
#[derive(Debug, Clone)]
pub struct CommitInfo {
    pub record_info: RecordInfo,
    pub is_committed: bool,
    pub append_time: Instant,
}

impl CommitInfo {
    pub fn pending(record_info: RecordInfo) -> Self {
        Self {
            record_info,
            is_committed: false,
            append_time: Instant::now(),
        }
    }
}

/// Range of records a consumer has finished with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointInfo {
    pub first_record_info: RecordInfo,
    pub last_record_info: RecordInfo,
    pub record_count: usize,
}

impl CheckpointInfo {
    pub fn new(first: RecordInfo, last: RecordInfo, record_count: usize) -> Self {
        Self {
            first_record_info: first,
            last_record_info: last,
            record_count,
        }
    }

    /// Checkpoint covering a batch returned by `read`. `None` for an empty batch.
    pub fn for_records<T>(records: &[Record<T>]) -> Option<Self> {
        let first = records.first()?;
        let last = records.last()?;
        Some(Self::new(first.record_info, last.record_info, records.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_wraps_at_capacity() {
        let info = RecordInfo::new(4, 5);
        assert_eq!(info.next().index, 0);
        assert_eq!(RecordInfo::new(2, 5).next().index, 3);
    }

    #[test]
    fn test_invalid_next_is_zero() {
        let info = RecordInfo::invalid(8);
        assert!(!info.is_valid());
        assert_eq!(info.next().index, 0);
    }

    #[test]
    fn test_equality_ignores_capacity() {
        assert_eq!(RecordInfo::new(3, 10), RecordInfo::new(3, 20));
        assert_ne!(RecordInfo::new(3, 10), RecordInfo::new(4, 10));
    }

    #[test]
    fn test_distance_across_wrap() {
        let a = RecordInfo::new(8, 10);
        let b = RecordInfo::new(2, 10);
        assert_eq!(a.distance_to(&b), 4);
        assert_eq!(b.distance_to(&a), 6);
        assert_eq!(a.distance_to(&a), 0);
    }

    #[test]
    fn test_distance_from_sentinel() {
        let start = RecordInfo::invalid(10);
        assert_eq!(start.distance_to(&RecordInfo::new(0, 10)), 1);
        assert_eq!(start.distance_to(&RecordInfo::new(9, 10)), 0);
    }

    #[test]
    fn test_checkpoint_for_records() {
        let records = vec![
            Record::new("a", RecordInfo::new(9, 10)),
            Record::new("b", RecordInfo::new(0, 10)),
            Record::new("c", RecordInfo::new(1, 10)),
        ];
        let cp = CheckpointInfo::for_records(&records).unwrap();
        assert_eq!(cp.first_record_info.index, 9);
        assert_eq!(cp.last_record_info.index, 1);
        assert_eq!(cp.record_count, 3);

        assert!(CheckpointInfo::for_records::<&str>(&[]).is_none());
    }
}
