use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{
    lease::{taker::LeaseTaker, PartitionLeaseManager},
    pump::{PartitionPump, PumpHandle, PumpResources},
    util::runnable::PeriodicRunnable,
};

/// Live pumps keyed by partition id.
pub(crate) type PumpRegistry = Mutex<HashMap<String, PumpHandle>>;

/// One scan: take leases towards an even share, then line pumps up with the
/// leases this host holds.
pub(crate) struct Rebalancer {
    taker: LeaseTaker,
    manager: Arc<PartitionLeaseManager>,
    pumps: Arc<PumpRegistry>,
    resources: PumpResources,
}

impl Rebalancer {
    pub(crate) fn new(
        taker: LeaseTaker,
        pumps: Arc<PumpRegistry>,
        resources: PumpResources,
    ) -> Self {
        Self {
            taker,
            manager: resources.manager.clone(),
            pumps,
            resources,
        }
    }

    pub(crate) async fn rebalance(&self) {
        self.taker.take_leases().await;
        self.reconcile_pumps().await;
    }

    async fn reconcile_pumps(&self) {
        let owned = self.manager.owned_leases().await;
        let mut pumps = self.pumps.lock().await;

        pumps.retain(|partition_id, pump| {
            let finished = pump.is_finished();
            if finished {
                debug!(partition = %partition_id, epoch = pump.epoch(), "Reaped pump");
            }
            !finished
        });

        for lease in owned {
            match pumps.get(lease.partition_id()) {
                Some(pump) if pump.epoch() == lease.epoch() => {}
                // An older epoch is still tearing down; start once it is reaped.
                Some(pump) => debug!(
                    partition = %lease.partition_id(),
                    old_epoch = pump.epoch(),
                    epoch = lease.epoch(),
                    "Waiting for previous pump to close"
                ),
                None => {
                    info!(
                        partition = %lease.partition_id(),
                        epoch = lease.epoch(),
                        "Starting pump"
                    );
                    let partition_id = lease.partition_id().to_string();
                    let pump = PartitionPump::spawn(lease, self.resources.clone());
                    pumps.insert(partition_id, pump);
                }
            }
        }
    }
}

#[async_trait]
impl PeriodicRunnable for Rebalancer {
    async fn run_once(&self) {
        self.rebalance().await;
    }
}
