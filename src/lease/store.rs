use async_trait::async_trait;

use super::Lease;
use crate::Result;

/// Result of a conditional ownership write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    /// The write went through; carries the lease as now stored.
    Swapped(Lease),
    /// The stored ownership no longer matched; carries the lease as stored.
    Conflict(Lease),
}

/// Result of a checkpoint write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointOutcome {
    Persisted,
    /// The stored checkpoint is already at or past the offset.
    Ignored { current: u64 },
    /// Owner or epoch no longer match the stored lease.
    Rejected { current_epoch: u64 },
}

/// Durable per-partition lease records with conditional writes.
///
/// Ownership must hold across processes and machines, so every mutation is
/// conditional inside the store; callers never read-modify-write.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Create an unowned lease for the partition unless one exists. Returns
    /// the stored lease either way.
    async fn create_if_absent(&self, partition_id: &str) -> Result<Lease>;

    async fn get(&self, partition_id: &str) -> Result<Option<Lease>>;

    async fn list(&self) -> Result<Vec<Lease>>;

    /// Overwrite owner, epoch and expiry with `replacement`'s iff the stored
    /// lease has the same ownership as `expected`. Checkpoint fields are kept.
    async fn compare_and_swap(&self, expected: &Lease, replacement: &Lease) -> Result<CasOutcome>;

    /// Record `offset` iff `owner` and `epoch` match the stored lease. Offsets
    /// at or below the stored checkpoint are ignored.
    async fn checkpoint(
        &self,
        partition_id: &str,
        owner: &str,
        epoch: u64,
        offset: u64,
        now_ms: u64,
    ) -> Result<CheckpointOutcome>;
}
