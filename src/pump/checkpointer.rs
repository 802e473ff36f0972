use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use tracing::debug;

use crate::{
    error::StaleReason,
    lease::{CheckpointOutcome, OwnedLease, PartitionLeaseManager},
    Error, Result,
};

const NONE: u64 = u64::MAX;

fn load(cell: &AtomicU64) -> Option<u64> {
    match cell.load(Ordering::SeqCst) {
        NONE => None,
        offset => Some(offset),
    }
}

/// Persists checkpoints for one partition epoch.
///
/// Only offsets the pump has already handed to the processor are accepted,
/// and only while the pump is open and the lease is still ours.
pub struct Checkpointer {
    manager: Arc<PartitionLeaseManager>,
    lease: Arc<OwnedLease>,
    delivered: AtomicU64,
    persisted: AtomicU64,
    closed: AtomicBool,
}

impl Checkpointer {
    pub(crate) fn new(
        manager: Arc<PartitionLeaseManager>,
        lease: Arc<OwnedLease>,
        persisted: Option<u64>,
    ) -> Self {
        Self {
            manager,
            lease,
            delivered: AtomicU64::new(NONE),
            persisted: AtomicU64::new(persisted.unwrap_or(NONE)),
            closed: AtomicBool::new(false),
        }
    }

    pub fn last_delivered(&self) -> Option<u64> {
        load(&self.delivered)
    }

    pub fn last_persisted(&self) -> Option<u64> {
        load(&self.persisted)
    }

    pub(crate) fn mark_delivered(&self, offset: u64) {
        self.delivered.store(offset, Ordering::SeqCst);
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub async fn checkpoint(&self, offset: u64) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(self.stale(offset, StaleReason::Closed));
        }
        if self.lease.is_lost() {
            return Err(self.stale(offset, StaleReason::LeaseLost));
        }
        match self.last_delivered() {
            Some(delivered) if offset <= delivered => {}
            _ => return Err(self.stale(offset, StaleReason::NotDelivered)),
        }

        match self.manager.checkpoint(&self.lease, offset).await? {
            CheckpointOutcome::Persisted => {
                let previous = self.persisted.load(Ordering::SeqCst);
                if previous == NONE || previous < offset {
                    self.persisted.store(offset, Ordering::SeqCst);
                }
                debug!(
                    partition = %self.lease.partition_id(),
                    epoch = self.lease.epoch(),
                    offset,
                    "Checkpoint persisted"
                );
                Ok(())
            }
            CheckpointOutcome::Ignored { current } => {
                debug!(
                    partition = %self.lease.partition_id(),
                    offset,
                    current,
                    "Checkpoint at or below the stored one, ignored"
                );
                Ok(())
            }
            CheckpointOutcome::Rejected { .. } => Err(self.stale(offset, StaleReason::LeaseLost)),
        }
    }

    fn stale(&self, offset: u64, reason: StaleReason) -> Error {
        Error::StaleCheckpoint {
            partition_id: self.lease.partition_id().to_string(),
            offset,
            reason,
        }
    }
}
