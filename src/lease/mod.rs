use std::sync::Mutex;

use tokio::sync::watch;

pub mod manager;
pub mod memory;
pub(crate) mod renewer;
pub mod scoped;
pub mod store;
pub(crate) mod taker;

pub use manager::PartitionLeaseManager;
pub use memory::InMemoryLeaseStore;
pub use scoped::ScopedLeaseStore;
pub use store::{CasOutcome, CheckpointOutcome, LeaseStore};

/// Ownership and progress record for one partition, as kept in the lease store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub partition_id: String,
    pub owner: Option<String>,
    /// Wall-clock milliseconds after which the lease may be taken.
    pub expires_at_ms: u64,
    /// Bumped on every acquire or steal.
    pub epoch: u64,
    /// Offset of the last record processed; consumption resumes after it.
    pub checkpoint: Option<u64>,
    pub last_checkpoint_ms: Option<u64>,
}

impl Lease {
    /// An unowned lease that has never been acquired.
    pub fn new(partition_id: impl Into<String>) -> Self {
        Self {
            partition_id: partition_id.into(),
            owner: None,
            expires_at_ms: 0,
            epoch: 0,
            checkpoint: None,
            last_checkpoint_ms: None,
        }
    }

    /// Unowned leases count as expired.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.owner.is_none() || now_ms >= self.expires_at_ms
    }

    pub fn is_held_by(&self, host_name: &str, now_ms: u64) -> bool {
        !self.is_expired(now_ms) && self.owner.as_deref() == Some(host_name)
    }

    /// Whether `other` carries the same owner, epoch and expiry. Conditional
    /// lease writes compare on exactly these fields.
    pub fn same_ownership(&self, other: &Lease) -> bool {
        self.owner == other.owner
            && self.epoch == other.epoch
            && self.expires_at_ms == other.expires_at_ms
    }
}

/// This host's handle on a lease it acquired, valid for a single epoch.
///
/// Once marked lost it never becomes valid again; reacquiring the partition
/// produces a new handle.
#[derive(Debug)]
pub struct OwnedLease {
    partition_id: String,
    epoch: u64,
    latest: Mutex<Lease>,
    lost: watch::Sender<bool>,
}

impl OwnedLease {
    pub(crate) fn new(lease: Lease) -> Self {
        let (lost, _) = watch::channel(false);
        Self {
            partition_id: lease.partition_id.clone(),
            epoch: lease.epoch,
            latest: Mutex::new(lease),
            lost,
        }
    }

    pub fn partition_id(&self) -> &str {
        &self.partition_id
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// The lease as this host last wrote or read it.
    pub fn snapshot(&self) -> Lease {
        match self.latest.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub(crate) fn update(&self, lease: Lease) {
        match self.latest.lock() {
            Ok(mut guard) => *guard = lease,
            Err(poisoned) => *poisoned.into_inner() = lease,
        }
    }

    pub fn is_lost(&self) -> bool {
        *self.lost.borrow()
    }

    pub(crate) fn mark_lost(&self) {
        self.lost.send_replace(true);
    }

    /// Flips to true when the lease is lost or released.
    pub fn watch_lost(&self) -> watch::Receiver<bool> {
        self.lost.subscribe()
    }
}
