//! In-process partitioned log, used by the sample binary and the tests.

use std::{
    collections::{hash_map::DefaultHasher, HashMap},
    hash::{Hash, Hasher},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use tokio::{
    sync::{Notify, RwLock},
    time::{timeout_at, Instant},
};
use tracing::debug;

use super::PartitionedLog;
use crate::{
    interface::record::{EventRecord, RecordBatch},
    util::now_ms,
    Error, Result,
};

/// Named event hubs, created on first use.
#[derive(Default)]
pub struct InMemoryNamespace {
    hubs: RwLock<HashMap<String, Arc<InMemoryLog>>>,
}

impl InMemoryNamespace {
    pub fn new() -> Self {
        Self::default()
    }

    /// The hub called `name`, created with `partition_count` partitions if it
    /// does not exist yet. An existing hub keeps its original partition count.
    pub async fn create_if_absent(&self, name: &str, partition_count: usize) -> Arc<InMemoryLog> {
        let mut hubs = self.hubs.write().await;
        hubs.entry(name.to_string())
            .or_insert_with(|| {
                debug!(hub = %name, partitions = partition_count, "Created event hub");
                Arc::new(InMemoryLog::new(name, partition_count))
            })
            .clone()
    }

    pub async fn get(&self, name: &str) -> Option<Arc<InMemoryLog>> {
        self.hubs.read().await.get(name).cloned()
    }
}

struct Partition {
    records: RwLock<Vec<EventRecord>>,
    appended: Notify,
    transient_faults: AtomicUsize,
    broken: AtomicBool,
}

impl Partition {
    fn new() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            appended: Notify::new(),
            transient_faults: AtomicUsize::new(0),
            broken: AtomicBool::new(false),
        }
    }

    fn check_faults(&self, partition_id: &str) -> Result<()> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(Error::Read {
                partition_id: partition_id.to_string(),
                message: "partition is unavailable".into(),
            });
        }
        let consumed = self
            .transient_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if consumed {
            return Err(Error::TransientRead {
                partition_id: partition_id.to_string(),
                message: "service busy".into(),
            });
        }
        Ok(())
    }
}

/// One event hub: a fixed set of append-only partitions named "0".."n-1".
pub struct InMemoryLog {
    name: String,
    partition_ids: Vec<String>,
    partitions: Vec<Partition>,
}

impl InMemoryLog {
    pub fn new(name: impl Into<String>, partition_count: usize) -> Self {
        Self {
            name: name.into(),
            partition_ids: (0..partition_count).map(|i| i.to_string()).collect(),
            partitions: (0..partition_count).map(|_| Partition::new()).collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append directly to one partition.
    pub async fn send_to(&self, partition_id: &str, payload: Bytes) -> Result<u64> {
        let partition = self.partition(partition_id)?;
        Ok(Self::append(partition, None, payload).await)
    }

    /// Make the next `count` reads of a partition fail with a transient error.
    pub fn fail_next_reads(&self, partition_id: &str, count: usize) -> Result<()> {
        self.partition(partition_id)?
            .transient_faults
            .store(count, Ordering::SeqCst);
        Ok(())
    }

    /// Make every read of a partition fail with a non-retryable error.
    pub fn break_partition(&self, partition_id: &str) -> Result<()> {
        self.partition(partition_id)?
            .broken
            .store(true, Ordering::SeqCst);
        Ok(())
    }

    pub async fn record_count(&self, partition_id: &str) -> Result<usize> {
        Ok(self.partition(partition_id)?.records.read().await.len())
    }

    fn partition(&self, partition_id: &str) -> Result<&Partition> {
        partition_id
            .parse::<usize>()
            .ok()
            .and_then(|index| self.partitions.get(index))
            .ok_or_else(|| Error::Read {
                partition_id: partition_id.to_string(),
                message: format!("no such partition in {}", self.name),
            })
    }

    fn route(&self, partition_key: Option<&str>) -> usize {
        match partition_key {
            Some(key) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % self.partitions.len() as u64) as usize
            }
            None => rand::thread_rng().gen_range(0..self.partitions.len()),
        }
    }

    async fn append(partition: &Partition, partition_key: Option<&str>, payload: Bytes) -> u64 {
        let offset = {
            let mut records = partition.records.write().await;
            let offset = records.len() as u64;
            records.push(EventRecord {
                offset,
                partition_key: partition_key.map(str::to_string),
                payload,
                enqueued_at_ms: now_ms(),
            });
            offset
        };
        partition.appended.notify_waiters();
        offset
    }
}

#[async_trait]
impl PartitionedLog for InMemoryLog {
    async fn partition_ids(&self) -> Result<Vec<String>> {
        Ok(self.partition_ids.clone())
    }

    async fn send(&self, partition_key: Option<&str>, payload: Bytes) -> Result<(String, u64)> {
        if self.partitions.is_empty() {
            return Err(Error::Configuration(format!(
                "event hub {} has no partitions",
                self.name
            )));
        }
        let index = self.route(partition_key);
        let offset = Self::append(&self.partitions[index], partition_key, payload).await;
        Ok((self.partition_ids[index].clone(), offset))
    }

    async fn read_batch(
        &self,
        partition_id: &str,
        from_offset: u64,
        max_count: usize,
        max_wait: Duration,
    ) -> Result<RecordBatch> {
        let partition = self.partition(partition_id)?;
        partition.check_faults(partition_id)?;

        let deadline = Instant::now() + max_wait;
        loop {
            // Registered before the length check so an append in between still wakes us.
            let appended = partition.appended.notified();
            {
                let records = partition.records.read().await;
                let start = from_offset as usize;
                if start < records.len() {
                    let end = records.len().min(start.saturating_add(max_count.max(1)));
                    return Ok(records[start..end].to_vec());
                }
            }
            if timeout_at(deadline, appended).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn earliest_offset(&self, partition_id: &str) -> Result<u64> {
        self.partition(partition_id)?;
        Ok(0)
    }

    async fn next_offset(&self, partition_id: &str) -> Result<u64> {
        Ok(self.partition(partition_id)?.records.read().await.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_keyed_sends_share_a_partition() {
        let log = InMemoryLog::new("hub", 4);
        let (first, _) = log
            .send(Some("device-7"), Bytes::from_static(b"a"))
            .await
            .unwrap();
        let (second, offset) = log
            .send(Some("device-7"), Bytes::from_static(b"b"))
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(offset, 1);
    }

    #[tokio::test]
    async fn test_read_batch_is_bounded_and_contiguous() {
        let log = InMemoryLog::new("hub", 1);
        for i in 0..5u8 {
            log.send_to("0", Bytes::from(vec![i])).await.unwrap();
        }

        let batch = log
            .read_batch("0", 1, 3, Duration::from_millis(10))
            .await
            .unwrap();
        let offsets: Vec<u64> = batch.iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![1, 2, 3]);
        assert_eq!(log.next_offset("0").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_read_batch_waits_for_append() {
        let log = Arc::new(InMemoryLog::new("hub", 1));
        let writer = log.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer
                .send_to("0", Bytes::from_static(b"late"))
                .await
                .unwrap();
        });

        let batch = log
            .read_batch("0", 0, 10, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload_str(), Some("late"));
    }

    #[tokio::test]
    async fn test_read_batch_times_out_empty() {
        let log = InMemoryLog::new("hub", 1);
        let batch = log
            .read_batch("0", 0, 10, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let log = InMemoryLog::new("hub", 2);
        log.fail_next_reads("0", 1).unwrap();
        let err = log
            .read_batch("0", 0, 1, Duration::from_millis(1))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(log
            .read_batch("0", 0, 1, Duration::from_millis(1))
            .await
            .is_ok());

        log.break_partition("1").unwrap();
        let err = log
            .read_batch("1", 0, 1, Duration::from_millis(1))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_namespace_create_if_absent() {
        let namespace = InMemoryNamespace::new();
        let hub = namespace.create_if_absent("orders", 4).await;
        let again = namespace.create_if_absent("orders", 8).await;
        assert!(Arc::ptr_eq(&hub, &again));
        assert_eq!(again.partition_ids().await.unwrap().len(), 4);
        assert!(namespace.get("missing").await.is_none());
    }
}
