//! The event processor host.
//!
//! A host joins a consumer group, balances partition leases with its peers
//! through the shared lease store, and runs one pump per partition it owns.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{sync::watch, sync::Mutex, task::JoinHandle, time::Instant};
use tracing::{debug, info, warn};

use crate::{
    config::{HostConfig, HostOptions},
    error::{ErrorAction, ErrorHandler, ErrorReport, ErrorSink},
    interface::processor::EventProcessorFactory,
    lease::{
        renewer::LeaseRenewer, taker::LeaseTaker, LeaseStore, PartitionLeaseManager,
        ScopedLeaseStore,
    },
    pump::{PumpResources, PumpState},
    stream::{layout::PartitionLayout, PartitionedLog},
    util::{
        runnable::{run_at_fixed_interval, run_with_fixed_delay},
        wait_until_set,
    },
    Error, Result,
};

mod rebalancer;

use rebalancer::{PumpRegistry, Rebalancer};

const PARTITION_CACHE_TTL: Duration = Duration::from_secs(60);

/// Builds an [`EventProcessorHost`].
pub struct EventProcessorHostBuilder {
    config: HostConfig,
    options: HostOptions,
    log: Option<Arc<dyn PartitionedLog>>,
    store: Option<Arc<dyn LeaseStore>>,
    factory: Option<Arc<dyn EventProcessorFactory>>,
    error_handler: Option<ErrorHandler>,
}

impl EventProcessorHostBuilder {
    pub fn new(config: HostConfig) -> Self {
        Self {
            config,
            options: HostOptions::default(),
            log: None,
            store: None,
            factory: None,
            error_handler: None,
        }
    }

    pub fn options(mut self, options: HostOptions) -> Self {
        self.options = options;
        self
    }

    pub fn log(mut self, log: Arc<dyn PartitionedLog>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn lease_store(mut self, store: Arc<dyn LeaseStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn processor_factory<F>(mut self, factory: F) -> Self
    where
        F: EventProcessorFactory + 'static,
    {
        self.factory = Some(Arc::new(factory));
        self
    }

    /// Called for every error the host reports, after it is logged.
    pub fn on_error<H>(mut self, handler: H) -> Self
    where
        H: Fn(&ErrorReport) + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    /// Validates the configuration. Nothing touches the log or the store yet.
    pub fn build(self) -> Result<EventProcessorHost> {
        self.config.validate()?;
        self.options.validate()?;

        let log = self
            .log
            .ok_or_else(|| Error::Configuration("A partitioned log is required".into()))?;
        let store = self
            .store
            .ok_or_else(|| Error::Configuration("A lease store is required".into()))?;
        let factory = self
            .factory
            .ok_or_else(|| Error::Configuration("A processor factory is required".into()))?;

        let options = Arc::new(self.options);
        let errors = ErrorSink::new(self.config.host_name.clone(), self.error_handler);
        let store: Arc<dyn LeaseStore> = Arc::new(ScopedLeaseStore::new(
            store,
            &self.config.event_hub_name,
            &self.config.consumer_group,
        ));
        let manager = Arc::new(PartitionLeaseManager::new(
            store,
            self.config.host_name.clone(),
            options.lease_duration(),
        ));
        let layout = Arc::new(PartitionLayout::new(log.clone(), PARTITION_CACHE_TTL));
        let events_received = Arc::new(AtomicU64::new(0));

        let resources = PumpResources {
            manager: manager.clone(),
            log,
            factory,
            options: options.clone(),
            consumer_group: self.config.consumer_group.clone(),
            errors: errors.clone(),
            events_received: events_received.clone(),
        };
        let pumps: Arc<PumpRegistry> = Arc::new(Mutex::new(HashMap::new()));
        let rebalancer = Arc::new(Rebalancer::new(
            LeaseTaker::new(manager.clone(), layout.clone(), errors.clone()),
            pumps.clone(),
            resources,
        ));
        let renewer = Arc::new(LeaseRenewer::new(manager.clone(), errors.clone()));

        Ok(EventProcessorHost {
            config: self.config,
            options,
            manager,
            layout,
            errors,
            pumps,
            rebalancer,
            renewer,
            events_received,
            background: Mutex::new(None),
        })
    }
}

/// Shutdown switch and join handle of one background loop.
struct BackgroundTask {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl BackgroundTask {
    async fn stop(self, name: &str) {
        self.shutdown.send_replace(true);
        if let Err(err) = self.task.await {
            warn!(task = name, error = %err, "Background task did not exit cleanly");
        }
    }
}

struct Background {
    rebalancer: BackgroundTask,
    renewer: BackgroundTask,
}

pub struct EventProcessorHost {
    config: HostConfig,
    options: Arc<HostOptions>,
    manager: Arc<PartitionLeaseManager>,
    layout: Arc<PartitionLayout>,
    errors: ErrorSink,
    pumps: Arc<PumpRegistry>,
    rebalancer: Arc<Rebalancer>,
    renewer: Arc<LeaseRenewer>,
    events_received: Arc<AtomicU64>,
    background: Mutex<Option<Background>>,
}

impl EventProcessorHost {
    pub fn builder(config: HostConfig) -> EventProcessorHostBuilder {
        EventProcessorHostBuilder::new(config)
    }

    pub fn host_name(&self) -> &str {
        &self.config.host_name
    }

    pub fn consumer_group(&self) -> &str {
        &self.config.consumer_group
    }

    pub fn options(&self) -> &HostOptions {
        &self.options
    }

    /// Registers every partition with the lease store, takes a first share of
    /// leases and starts the rebalance and renewal loops.
    ///
    /// Calling `start` on a running host does nothing.
    pub async fn start(&self) -> Result<()> {
        let mut background = self.background.lock().await;
        if background.is_some() {
            debug!(host = %self.host_name(), "Host already running");
            return Ok(());
        }
        self.config.validate()?;
        self.options.validate()?;

        let partition_ids = self.layout.partition_ids().await?;
        self.manager.register(&partition_ids).await?;
        info!(
            host = %self.host_name(),
            event_hub = %self.config.event_hub_name,
            consumer_group = %self.config.consumer_group,
            partitions = partition_ids.len(),
            "Starting host"
        );

        self.rebalancer.rebalance().await;

        let renewer = {
            let (shutdown, rx) = watch::channel(false);
            let task = tokio::spawn(run_at_fixed_interval(
                self.renewer.clone(),
                self.options.renew_interval(),
                rx,
            ));
            BackgroundTask { shutdown, task }
        };
        let rebalancer = {
            let (shutdown, rx) = watch::channel(false);
            let rebalancer = self.rebalancer.clone();
            let interval = self.options.rebalance_interval();
            let task = tokio::spawn(async move {
                // The first scan already ran above.
                let mut early_exit = rx.clone();
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = wait_until_set(&mut early_exit) => return,
                }
                run_with_fixed_delay(rebalancer, interval, rx).await;
            });
            BackgroundTask { shutdown, task }
        };

        *background = Some(Background {
            rebalancer,
            renewer,
        });
        Ok(())
    }

    /// Closes every pump, then releases every lease this host holds.
    ///
    /// Pumps get `shutdown_grace` in total to close; any still running after
    /// that are aborted and reported with [`Error::ShutdownTimeout`]. The
    /// first release failure is returned after all leases were attempted.
    pub async fn stop(&self) -> Result<()> {
        let mut background = self.background.lock().await;
        let Some(Background {
            rebalancer,
            renewer,
        }) = background.take()
        else {
            debug!(host = %self.host_name(), "Host not running");
            return Ok(());
        };
        info!(host = %self.host_name(), "Stopping host");

        // No new pumps once the loop has exited.
        rebalancer.stop("rebalancer").await;
        self.close_pumps().await;
        renewer.stop("renewer").await;

        let released = self.manager.release_all().await;
        if let Err(err) = &released {
            self.errors
                .report(None, ErrorAction::Release, err.clone());
        }
        info!(
            host = %self.host_name(),
            events_received = self.events_received(),
            "Host stopped"
        );
        released
    }

    async fn close_pumps(&self) {
        let pumps: Vec<_> = self.pumps.lock().await.drain().collect();
        for (_, pump) in &pumps {
            pump.signal_shutdown();
        }

        let grace = self.options.shutdown_grace();
        let deadline = Instant::now() + grace;
        for (partition_id, pump) in pumps {
            let mut task = pump.into_task();
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(reason)) => {
                    debug!(partition = %partition_id, reason = %reason, "Pump closed")
                }
                Ok(Err(err)) => self.errors.report(
                    Some(&partition_id),
                    ErrorAction::Shutdown,
                    Error::processor(partition_id.as_str(), err),
                ),
                Err(_) => {
                    task.abort();
                    self.errors.report(
                        Some(&partition_id),
                        ErrorAction::Shutdown,
                        Error::ShutdownTimeout {
                            partition_id: partition_id.clone(),
                            grace_ms: grace.as_millis() as u64,
                        },
                    );
                }
            }
        }
    }

    pub async fn is_running(&self) -> bool {
        self.background.lock().await.is_some()
    }

    /// Partitions whose lease this host currently holds, in partition order.
    pub async fn owned_partitions(&self) -> Vec<String> {
        self.manager
            .owned_leases()
            .await
            .iter()
            .map(|lease| lease.partition_id().to_string())
            .collect()
    }

    /// State of each pump the host is tracking.
    pub async fn pump_states(&self) -> HashMap<String, PumpState> {
        self.pumps
            .lock()
            .await
            .iter()
            .map(|(partition_id, pump)| (partition_id.clone(), pump.state()))
            .collect()
    }

    /// Records handed to processors since the host was built.
    pub fn events_received(&self) -> u64 {
        self.events_received.load(Ordering::SeqCst)
    }
}
