use std::{cmp::Ordering, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;

use crate::{interface::record::RecordBatch, Result};

pub(crate) mod layout;
pub mod memory;

/// The durable partitioned log the host consumes from.
#[async_trait]
pub trait PartitionedLog: Send + Sync {
    /// Every partition of the event hub. The set never changes.
    async fn partition_ids(&self) -> Result<Vec<String>>;

    /// Append a record. Records with the same key land on the same partition;
    /// records without one are spread randomly. Returns the partition and the
    /// offset assigned.
    async fn send(&self, partition_key: Option<&str>, payload: Bytes) -> Result<(String, u64)>;

    /// Up to `max_count` contiguous records starting at `from_offset`, waiting
    /// at most `max_wait` for the first one. An empty batch means nothing
    /// arrived in time.
    async fn read_batch(
        &self,
        partition_id: &str,
        from_offset: u64,
        max_count: usize,
        max_wait: Duration,
    ) -> Result<RecordBatch>;

    /// Offset of the oldest retained record.
    async fn earliest_offset(&self, partition_id: &str) -> Result<u64>;

    /// Offset the next appended record will receive.
    async fn next_offset(&self, partition_id: &str) -> Result<u64>;
}

/// Numeric order when both ids are integers, lexicographic otherwise.
pub fn compare_partition_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}
