use std::{collections::HashMap, sync::Arc, time::Duration};

use futures_retry::FutureRetry;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{CasOutcome, CheckpointOutcome, Lease, LeaseStore, OwnedLease};
use crate::{
    error::ConflictKind,
    stream::compare_partition_ids,
    util::{now_ms, retry::FixedCountWithDelayStrategy},
    Error, Result,
};

const RELEASE_ATTEMPTS: usize = 3;
const RELEASE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Acquires, renews, steals and releases partition leases for one host.
///
/// The store decides ownership. The `owned` map only caches the handles this
/// host believes valid, and every entry is dropped as soon as a conditional
/// write proves otherwise.
pub struct PartitionLeaseManager {
    store: Arc<dyn LeaseStore>,
    host_name: String,
    lease_duration: Duration,
    owned: RwLock<HashMap<String, Arc<OwnedLease>>>,
}

impl PartitionLeaseManager {
    pub fn new(store: Arc<dyn LeaseStore>, host_name: impl Into<String>, lease_duration: Duration) -> Self {
        Self {
            store,
            host_name: host_name.into(),
            lease_duration,
            owned: RwLock::new(HashMap::new()),
        }
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn store(&self) -> &Arc<dyn LeaseStore> {
        &self.store
    }

    /// Make sure a lease record exists for every partition.
    pub async fn register(&self, partition_ids: &[String]) -> Result<()> {
        for partition_id in partition_ids {
            self.store.create_if_absent(partition_id).await?;
        }
        info!(
            host = %self.host_name,
            partitions = partition_ids.len(),
            "Registered with lease store"
        );
        Ok(())
    }

    /// Take an unowned or expired lease, bumping its epoch.
    pub async fn acquire(&self, partition_id: &str) -> Result<Arc<OwnedLease>> {
        let current = self.store.create_if_absent(partition_id).await?;
        let now = now_ms();

        if !current.is_expired(now) {
            let owner = current.owner.clone().unwrap_or_default();
            if owner == self.host_name {
                if let Some(existing) = self.owned_lease(partition_id).await {
                    if existing.epoch() == current.epoch && !existing.is_lost() {
                        return Ok(existing);
                    }
                }
            }
            return Err(Error::LeaseConflict {
                partition_id: partition_id.to_string(),
                kind: ConflictKind::AlreadyOwned { owner },
            });
        }

        self.take_over(&current, now).await
    }

    /// Take a live lease from another host. Used only to even out ownership.
    pub async fn steal(&self, current: &Lease) -> Result<Arc<OwnedLease>> {
        let lease = self.take_over(current, now_ms()).await?;
        info!(
            host = %self.host_name,
            partition = %current.partition_id,
            previous_owner = current.owner.as_deref().unwrap_or("-"),
            epoch = lease.epoch(),
            "Stole lease"
        );
        Ok(lease)
    }

    async fn take_over(&self, current: &Lease, now: u64) -> Result<Arc<OwnedLease>> {
        let replacement = Lease {
            owner: Some(self.host_name.clone()),
            epoch: current.epoch + 1,
            expires_at_ms: now + self.lease_duration.as_millis() as u64,
            ..current.clone()
        };

        match self.store.compare_and_swap(current, &replacement).await? {
            CasOutcome::Swapped(stored) => {
                let owned = Arc::new(OwnedLease::new(stored));
                if let Some(previous) = self
                    .owned
                    .write()
                    .await
                    .insert(current.partition_id.clone(), owned.clone())
                {
                    previous.mark_lost();
                }
                debug!(
                    host = %self.host_name,
                    partition = %current.partition_id,
                    epoch = owned.epoch(),
                    "Acquired lease"
                );
                Ok(owned)
            }
            CasOutcome::Conflict(stored) => Err(Error::LeaseConflict {
                partition_id: stored.partition_id,
                kind: ConflictKind::Contended,
            }),
        }
    }

    /// Extend the expiry of a lease this host holds.
    pub async fn renew(&self, lease: &OwnedLease) -> Result<()> {
        if lease.is_lost() {
            return Err(self.lost(lease.partition_id()));
        }

        let expected = lease.snapshot();
        let replacement = Lease {
            expires_at_ms: now_ms() + self.lease_duration.as_millis() as u64,
            ..expected.clone()
        };

        match self.store.compare_and_swap(&expected, &replacement).await {
            Ok(CasOutcome::Swapped(stored)) => {
                lease.update(stored);
                Ok(())
            }
            Ok(CasOutcome::Conflict(stored)) => {
                warn!(
                    host = %self.host_name,
                    partition = %stored.partition_id,
                    owner = stored.owner.as_deref().unwrap_or("-"),
                    epoch = stored.epoch,
                    "Lease taken over by another host"
                );
                self.forget(lease).await;
                Err(self.lost(lease.partition_id()))
            }
            Err(err) => {
                // Without a successful renewal the lease cannot outlive its expiry.
                if expected.is_expired(now_ms()) {
                    self.forget(lease).await;
                    return Err(self.lost(lease.partition_id()));
                }
                Err(err)
            }
        }
    }

    /// Give a lease up so another host can take it without waiting for expiry.
    /// Releasing a lease that was already superseded is a no-op. On a store
    /// error the handle stays owned so the release can be retried.
    pub async fn release(&self, lease: &OwnedLease) -> Result<()> {
        if lease.is_lost() {
            self.forget(lease).await;
            return Ok(());
        }

        let mut expected = lease.snapshot();
        loop {
            let replacement = Lease {
                owner: None,
                expires_at_ms: 0,
                ..expected.clone()
            };

            match self.store.compare_and_swap(&expected, &replacement).await? {
                CasOutcome::Swapped(_) => {
                    info!(
                        host = %self.host_name,
                        partition = %lease.partition_id(),
                        epoch = lease.epoch(),
                        "Released lease"
                    );
                    break;
                }
                // A renewal of our own landed in between; retry against it.
                CasOutcome::Conflict(stored)
                    if stored.epoch == lease.epoch()
                        && stored.owner.as_deref() == Some(self.host_name.as_str()) =>
                {
                    expected = stored;
                }
                CasOutcome::Conflict(stored) => {
                    debug!(
                        host = %self.host_name,
                        partition = %stored.partition_id,
                        epoch = stored.epoch,
                        "Lease already moved on, nothing to release"
                    );
                    break;
                }
            }
        }
        self.forget(lease).await;
        Ok(())
    }

    /// Release every lease this host holds, retrying store failures a few
    /// times. Returns the first error that survived the retries.
    pub async fn release_all(&self) -> Result<()> {
        let leases: Vec<Arc<OwnedLease>> = self.owned.read().await.values().cloned().collect();
        let mut first_error = None;

        for lease in leases {
            let lease: &OwnedLease = &lease;
            let released = FutureRetry::new(
                move || self.release(lease),
                FixedCountWithDelayStrategy::new(RELEASE_ATTEMPTS, RELEASE_RETRY_DELAY),
            )
            .await;
            if let Err((err, attempts)) = released {
                warn!(
                    host = %self.host_name,
                    partition = %lease.partition_id(),
                    attempts,
                    error = %err,
                    "Failed to release lease"
                );
                // Nobody will renew it any more; make sure no pump keeps using it.
                self.forget(lease).await;
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Persist a checkpoint under the lease's epoch.
    pub async fn checkpoint(&self, lease: &OwnedLease, offset: u64) -> Result<CheckpointOutcome> {
        let outcome = self
            .store
            .checkpoint(
                lease.partition_id(),
                &self.host_name,
                lease.epoch(),
                offset,
                now_ms(),
            )
            .await?;

        if let CheckpointOutcome::Rejected { current_epoch } = outcome {
            warn!(
                host = %self.host_name,
                partition = %lease.partition_id(),
                epoch = lease.epoch(),
                current_epoch,
                "Checkpoint rejected, lease superseded"
            );
            self.forget(lease).await;
        }
        Ok(outcome)
    }

    /// Partitions whose lease anyone may acquire right now, best candidates
    /// first: oldest checkpoint activity (never checkpointed before all
    /// others), then lowest partition id.
    pub async fn list_unowned_or_expired(&self) -> Result<Vec<String>> {
        let now = now_ms();
        let mut available: Vec<Lease> = self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|lease| lease.is_expired(now))
            .collect();
        sort_by_preference(&mut available);
        Ok(available.into_iter().map(|lease| lease.partition_id).collect())
    }

    /// Handles this host still considers valid.
    pub async fn owned_leases(&self) -> Vec<Arc<OwnedLease>> {
        let mut leases: Vec<Arc<OwnedLease>> = self
            .owned
            .read()
            .await
            .values()
            .filter(|lease| !lease.is_lost())
            .cloned()
            .collect();
        leases.sort_by(|a, b| compare_partition_ids(a.partition_id(), b.partition_id()));
        leases
    }

    pub async fn owned_lease(&self, partition_id: &str) -> Option<Arc<OwnedLease>> {
        self.owned.read().await.get(partition_id).cloned()
    }

    /// Stop tracking a lease whose release could not be written. The stored
    /// row keeps its owner until it expires and is taken under a new epoch.
    pub(crate) async fn abandon(&self, lease: &OwnedLease) {
        warn!(
            host = %self.host_name,
            partition = %lease.partition_id(),
            epoch = lease.epoch(),
            "Abandoning lease until it expires"
        );
        self.forget(lease).await;
    }

    /// Drop a handle from the owned set and signal its pump.
    async fn forget(&self, lease: &OwnedLease) {
        lease.mark_lost();
        let mut owned = self.owned.write().await;
        if owned
            .get(lease.partition_id())
            .map_or(false, |current| current.epoch() == lease.epoch())
        {
            owned.remove(lease.partition_id());
        }
    }

    fn lost(&self, partition_id: &str) -> Error {
        Error::LeaseLost {
            partition_id: partition_id.to_string(),
        }
    }
}

pub(crate) fn sort_by_preference(leases: &mut [Lease]) {
    leases.sort_by(|a, b| {
        a.last_checkpoint_ms
            .cmp(&b.last_checkpoint_ms)
            .then_with(|| compare_partition_ids(&a.partition_id, &b.partition_id))
    });
}
