//! Lease store held in process memory.
//!
//! Every operation runs under one write lock, which makes each conditional
//! write atomic. Hosts sharing an `Arc<InMemoryLeaseStore>` behave like hosts
//! sharing a real store.

use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{CasOutcome, CheckpointOutcome, Lease, LeaseStore};
use crate::{stream::compare_partition_ids, Error, Result};

#[derive(Default)]
pub struct InMemoryLeaseStore {
    leases: RwLock<BTreeMap<String, Lease>>,
    unavailable: AtomicBool,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every call fails with a store error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(Error::Store("lease store unavailable".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn create_if_absent(&self, partition_id: &str) -> Result<Lease> {
        self.check_available()?;
        let mut leases = self.leases.write().await;
        Ok(leases
            .entry(partition_id.to_string())
            .or_insert_with(|| Lease::new(partition_id))
            .clone())
    }

    async fn get(&self, partition_id: &str) -> Result<Option<Lease>> {
        self.check_available()?;
        Ok(self.leases.read().await.get(partition_id).cloned())
    }

    async fn list(&self) -> Result<Vec<Lease>> {
        self.check_available()?;
        let mut all: Vec<Lease> = self.leases.read().await.values().cloned().collect();
        all.sort_by(|a, b| compare_partition_ids(&a.partition_id, &b.partition_id));
        Ok(all)
    }

    async fn compare_and_swap(&self, expected: &Lease, replacement: &Lease) -> Result<CasOutcome> {
        self.check_available()?;
        let mut leases = self.leases.write().await;
        let stored = leases.get_mut(&expected.partition_id).ok_or_else(|| {
            Error::Store(format!("no lease for partition {}", expected.partition_id))
        })?;

        if !stored.same_ownership(expected) {
            return Ok(CasOutcome::Conflict(stored.clone()));
        }

        stored.owner = replacement.owner.clone();
        stored.epoch = replacement.epoch;
        stored.expires_at_ms = replacement.expires_at_ms;
        Ok(CasOutcome::Swapped(stored.clone()))
    }

    async fn checkpoint(
        &self,
        partition_id: &str,
        owner: &str,
        epoch: u64,
        offset: u64,
        now_ms: u64,
    ) -> Result<CheckpointOutcome> {
        self.check_available()?;
        let mut leases = self.leases.write().await;
        let stored = leases
            .get_mut(partition_id)
            .ok_or_else(|| Error::Store(format!("no lease for partition {}", partition_id)))?;

        if stored.epoch != epoch || stored.owner.as_deref() != Some(owner) {
            return Ok(CheckpointOutcome::Rejected {
                current_epoch: stored.epoch,
            });
        }
        if let Some(current) = stored.checkpoint {
            if offset <= current {
                return Ok(CheckpointOutcome::Ignored { current });
            }
        }

        stored.checkpoint = Some(offset);
        stored.last_checkpoint_ms = Some(now_ms);
        Ok(CheckpointOutcome::Persisted)
    }
}
