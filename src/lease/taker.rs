use std::{collections::HashMap, sync::Arc};

use tracing::{debug, info};

use super::{manager::sort_by_preference, Lease, OwnedLease, PartitionLeaseManager};
use crate::{
    error::{ErrorAction, ErrorSink},
    stream::layout::PartitionLayout,
    util::now_ms,
    Error, Result,
};

/// What one rebalance scan should try.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct TakePlan {
    pub(crate) acquire: Vec<String>,
    pub(crate) steal: Option<Lease>,
}

/// Decide which leases `host_name` should go after, given every stored lease.
///
/// The target is an even share, `ceil(total / hosts)`, where hosts are the
/// owners of live leases plus this one. Available leases are taken first; a
/// live lease is stolen only when nothing is available and some host owns at
/// least two more than we do.
pub(crate) fn plan_take(leases: &[Lease], host_name: &str, now_ms: u64) -> TakePlan {
    let total = leases.len();
    if total == 0 {
        return TakePlan::default();
    }

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for lease in leases.iter().filter(|lease| !lease.is_expired(now_ms)) {
        if let Some(owner) = lease.owner.as_deref() {
            *counts.entry(owner).or_insert(0) += 1;
        }
    }
    let mine = counts.get(host_name).copied().unwrap_or(0);
    let hosts = counts.len() + usize::from(!counts.contains_key(host_name));
    let target = (total + hosts - 1) / hosts;
    if mine >= target {
        return TakePlan::default();
    }

    let mut available: Vec<Lease> = leases
        .iter()
        .filter(|lease| lease.is_expired(now_ms))
        .cloned()
        .collect();
    if !available.is_empty() {
        sort_by_preference(&mut available);
        return TakePlan {
            acquire: available
                .into_iter()
                .take(target - mine)
                .map(|lease| lease.partition_id)
                .collect(),
            steal: None,
        };
    }

    let most_loaded = counts
        .iter()
        .filter(|(owner, _)| **owner != host_name)
        .max_by(|(a_owner, a_count), (b_owner, b_count)| {
            a_count.cmp(b_count).then_with(|| b_owner.cmp(a_owner))
        });
    match most_loaded {
        Some((owner, count)) if *count >= mine + 2 => {
            let mut victims: Vec<Lease> = leases
                .iter()
                .filter(|lease| lease.owner.as_deref() == Some(*owner))
                .cloned()
                .collect();
            sort_by_preference(&mut victims);
            TakePlan {
                acquire: Vec::new(),
                steal: victims.into_iter().next(),
            }
        }
        _ => TakePlan::default(),
    }
}

/// Runs one rebalance scan against the store.
pub(crate) struct LeaseTaker {
    manager: Arc<PartitionLeaseManager>,
    layout: Arc<PartitionLayout>,
    errors: ErrorSink,
}

impl LeaseTaker {
    pub(crate) fn new(
        manager: Arc<PartitionLeaseManager>,
        layout: Arc<PartitionLayout>,
        errors: ErrorSink,
    ) -> Self {
        Self {
            manager,
            layout,
            errors,
        }
    }

    /// Every stored lease, creating rows for partitions that have none yet.
    async fn list_all_leases(&self) -> Result<Vec<Lease>> {
        let partition_ids = self.layout.partition_ids().await?;
        let leases = self.manager.store().list().await?;

        let missing: Vec<String> = partition_ids
            .iter()
            .filter(|id| !leases.iter().any(|lease| &lease.partition_id == *id))
            .cloned()
            .collect();
        if missing.is_empty() {
            return Ok(leases);
        }
        self.manager.register(&missing).await?;
        self.manager.store().list().await
    }

    /// Acquire (or steal) towards an even share. Returns the leases gained.
    pub(crate) async fn take_leases(&self) -> Vec<Arc<OwnedLease>> {
        let leases = match self.list_all_leases().await {
            Ok(leases) => leases,
            Err(err) => {
                self.errors.report(None, ErrorAction::Acquire, err);
                return Vec::new();
            }
        };

        let plan = plan_take(&leases, self.manager.host_name(), now_ms());
        if plan == TakePlan::default() {
            debug!(host = %self.manager.host_name(), "No leases to take");
            return Vec::new();
        }

        let mut taken = Vec::new();
        for partition_id in &plan.acquire {
            match self.manager.acquire(partition_id).await {
                Ok(lease) => taken.push(lease),
                Err(err) => self.report_take_failure(partition_id, err),
            }
        }
        if let Some(victim) = &plan.steal {
            match self.manager.steal(victim).await {
                Ok(lease) => taken.push(lease),
                Err(err) => self.report_take_failure(&victim.partition_id, err),
            }
        }

        if !taken.is_empty() {
            info!(
                host = %self.manager.host_name(),
                taken = ?taken.iter().map(|lease| lease.partition_id()).collect::<Vec<_>>(),
                "Took leases"
            );
        }
        taken
    }

    /// Conflicts are not retried here; the next scan sees fresh state.
    fn report_take_failure(&self, partition_id: &str, err: Error) {
        self.errors
            .report(Some(partition_id), ErrorAction::Acquire, err);
    }
}
