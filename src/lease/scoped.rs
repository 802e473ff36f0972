//! Per consumer group view of a shared lease store.
//!
//! Rows are keyed `<event hub>/<consumer group>/<partition id>`, so groups
//! reading the same hub through one store each get their own leases and
//! checkpoints. Callers only ever see bare partition ids.

use std::sync::Arc;

use async_trait::async_trait;

use super::{CasOutcome, CheckpointOutcome, Lease, LeaseStore};
use crate::{stream::compare_partition_ids, Result};

pub struct ScopedLeaseStore {
    inner: Arc<dyn LeaseStore>,
    prefix: String,
}

impl ScopedLeaseStore {
    pub fn new(inner: Arc<dyn LeaseStore>, event_hub_name: &str, consumer_group: &str) -> Self {
        Self {
            inner,
            prefix: format!("{event_hub_name}/{consumer_group}/"),
        }
    }

    /// The key a partition's lease is stored under in the shared store.
    pub fn key(&self, partition_id: &str) -> String {
        format!("{}{}", self.prefix, partition_id)
    }

    fn outbound(&self, lease: &Lease) -> Lease {
        Lease {
            partition_id: self.key(&lease.partition_id),
            ..lease.clone()
        }
    }

    fn inbound(&self, mut lease: Lease) -> Lease {
        let stripped = lease
            .partition_id
            .strip_prefix(self.prefix.as_str())
            .map(str::to_string);
        if let Some(partition_id) = stripped {
            lease.partition_id = partition_id;
        }
        lease
    }
}

#[async_trait]
impl LeaseStore for ScopedLeaseStore {
    async fn create_if_absent(&self, partition_id: &str) -> Result<Lease> {
        let lease = self.inner.create_if_absent(&self.key(partition_id)).await?;
        Ok(self.inbound(lease))
    }

    async fn get(&self, partition_id: &str) -> Result<Option<Lease>> {
        let lease = self.inner.get(&self.key(partition_id)).await?;
        Ok(lease.map(|lease| self.inbound(lease)))
    }

    async fn list(&self) -> Result<Vec<Lease>> {
        let mut leases: Vec<Lease> = self
            .inner
            .list()
            .await?
            .into_iter()
            .filter(|lease| lease.partition_id.starts_with(&self.prefix))
            .map(|lease| self.inbound(lease))
            .collect();
        leases.sort_by(|a, b| compare_partition_ids(&a.partition_id, &b.partition_id));
        Ok(leases)
    }

    async fn compare_and_swap(&self, expected: &Lease, replacement: &Lease) -> Result<CasOutcome> {
        let outcome = self
            .inner
            .compare_and_swap(&self.outbound(expected), &self.outbound(replacement))
            .await?;
        Ok(match outcome {
            CasOutcome::Swapped(lease) => CasOutcome::Swapped(self.inbound(lease)),
            CasOutcome::Conflict(lease) => CasOutcome::Conflict(self.inbound(lease)),
        })
    }

    async fn checkpoint(
        &self,
        partition_id: &str,
        owner: &str,
        epoch: u64,
        offset: u64,
        now_ms: u64,
    ) -> Result<CheckpointOutcome> {
        self.inner
            .checkpoint(&self.key(partition_id), owner, epoch, offset, now_ms)
            .await
    }
}
