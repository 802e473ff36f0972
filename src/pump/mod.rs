use std::{
    any::Any,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use futures::FutureExt;
use futures_retry::FutureRetry;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    config::{HostOptions, InitialPosition},
    error::{ErrorAction, ErrorSink},
    interface::{
        processor::{CloseReason, EventProcessor, EventProcessorFactory, PartitionContext},
        record::RecordBatch,
    },
    lease::{OwnedLease, PartitionLeaseManager},
    stream::PartitionedLog,
    util::{retry::ExponentialBackoffStrategy, wait_until_set},
    Error, Result,
};

pub mod checkpointer;

use checkpointer::Checkpointer;

/// Lifecycle of a partition pump. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PumpState {
    Idle,
    Opening,
    Running,
    Closing,
    Closed,
}

/// Everything a pump shares with its host.
#[derive(Clone)]
pub(crate) struct PumpResources {
    pub(crate) manager: Arc<PartitionLeaseManager>,
    pub(crate) log: Arc<dyn PartitionedLog>,
    pub(crate) factory: Arc<dyn EventProcessorFactory>,
    pub(crate) options: Arc<HostOptions>,
    pub(crate) consumer_group: String,
    pub(crate) errors: ErrorSink,
    pub(crate) events_received: Arc<AtomicU64>,
}

/// The host's side of a running pump.
pub(crate) struct PumpHandle {
    lease: Arc<OwnedLease>,
    state: watch::Receiver<PumpState>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<CloseReason>,
}

impl PumpHandle {
    pub(crate) fn epoch(&self) -> u64 {
        self.lease.epoch()
    }

    pub(crate) fn state(&self) -> PumpState {
        *self.state.borrow()
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Ask the pump to close with [`CloseReason::Shutdown`].
    pub(crate) fn signal_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub(crate) fn into_task(self) -> JoinHandle<CloseReason> {
        self.task
    }
}

/// Reads one partition under one lease epoch and feeds a processor.
pub(crate) struct PartitionPump {
    lease: Arc<OwnedLease>,
    resources: PumpResources,
    state: watch::Sender<PumpState>,
    shutdown: watch::Receiver<bool>,
}

impl PartitionPump {
    pub(crate) fn spawn(lease: Arc<OwnedLease>, resources: PumpResources) -> PumpHandle {
        let (state_tx, state_rx) = watch::channel(PumpState::Idle);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let pump = PartitionPump {
            lease: lease.clone(),
            resources,
            state: state_tx,
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(pump.run());

        PumpHandle {
            lease,
            state: state_rx,
            shutdown: shutdown_tx,
            task,
        }
    }

    fn partition_id(&self) -> &str {
        self.lease.partition_id()
    }

    fn set_state(&self, state: PumpState) {
        self.state.send_replace(state);
    }

    fn report(&self, action: ErrorAction, err: Error) {
        self.resources
            .errors
            .report(Some(self.partition_id()), action, err);
    }

    async fn run(self) -> CloseReason {
        self.set_state(PumpState::Opening);

        let snapshot = self.lease.snapshot();
        let starting_offset = match self.starting_offset(snapshot.checkpoint).await {
            Ok(offset) => offset,
            Err(err) => {
                self.report(ErrorAction::Read, err);
                self.set_state(PumpState::Closing);
                self.set_state(PumpState::Closed);
                self.release_after_error().await;
                return CloseReason::Error;
            }
        };

        let checkpointer = Arc::new(Checkpointer::new(
            self.resources.manager.clone(),
            self.lease.clone(),
            snapshot.checkpoint,
        ));
        let context = PartitionContext {
            partition_id: self.partition_id().to_string(),
            owner: self.resources.manager.host_name().to_string(),
            consumer_group: self.resources.consumer_group.clone(),
            epoch: self.lease.epoch(),
            starting_offset,
            checkpointer: checkpointer.clone(),
        };
        let mut processor = self.resources.factory.create(&context);

        info!(
            partition = %context.partition_id,
            epoch = context.epoch,
            starting_offset,
            "Opening partition"
        );
        let reason = match guarded(self.partition_id(), processor.open(&context)).await {
            Ok(()) => {
                self.set_state(PumpState::Running);
                self.pump_records(processor.as_mut(), &context, &checkpointer)
                    .await
            }
            Err(err) => {
                self.report(ErrorAction::Open, err);
                CloseReason::Error
            }
        };

        self.set_state(PumpState::Closing);
        checkpointer.close();
        if let Err(err) = guarded(self.partition_id(), processor.close(&context, reason)).await {
            self.report(ErrorAction::Close, err);
        }
        self.set_state(PumpState::Closed);

        info!(
            partition = %context.partition_id,
            epoch = context.epoch,
            reason = %reason,
            last_delivered = ?checkpointer.last_delivered(),
            last_checkpoint = ?checkpointer.last_persisted(),
            "Closed partition"
        );

        if reason == CloseReason::Error {
            self.release_after_error().await;
        }
        reason
    }

    async fn starting_offset(&self, checkpoint: Option<u64>) -> Result<u64> {
        if let Some(offset) = checkpoint {
            return Ok(offset + 1);
        }
        let log = &self.resources.log;
        match self.resources.options.initial_position {
            InitialPosition::Earliest => log.earliest_offset(self.partition_id()).await,
            InitialPosition::Latest => log.next_offset(self.partition_id()).await,
        }
    }

    async fn pump_records(
        &self,
        processor: &mut dyn EventProcessor,
        context: &PartitionContext,
        checkpointer: &Checkpointer,
    ) -> CloseReason {
        let mut shutdown = self.shutdown.clone();
        let mut lost = self.lease.watch_lost();
        let mut next_offset = context.starting_offset;

        loop {
            if *shutdown.borrow() {
                return CloseReason::Shutdown;
            }
            if self.lease.is_lost() {
                return CloseReason::LeaseLost;
            }

            let read = tokio::select! {
                biased;
                _ = wait_until_set(&mut shutdown) => return CloseReason::Shutdown,
                _ = wait_until_set(&mut lost) => return CloseReason::LeaseLost,
                read = self.read_batch(next_offset) => read,
            };

            let mut batch = match read {
                Ok(batch) => batch,
                Err(err) => {
                    self.report(ErrorAction::Read, err);
                    return CloseReason::Error;
                }
            };
            batch.retain(|record| record.offset >= next_offset);
            let last_offset = match batch.last() {
                Some(record) => record.offset,
                None => continue,
            };

            let count = batch.len();
            checkpointer.mark_delivered(last_offset);
            next_offset = last_offset + 1;
            self.resources
                .events_received
                .fetch_add(count as u64, Ordering::SeqCst);
            debug!(
                partition = %context.partition_id,
                count,
                last_offset,
                "Delivering batch"
            );

            if let Err(err) = guarded(self.partition_id(), processor.process(context, batch)).await {
                let lease_lost = err.is_lease_lost() || self.lease.is_lost();
                self.report(ErrorAction::Process, err);
                return if lease_lost {
                    CloseReason::LeaseLost
                } else {
                    CloseReason::Error
                };
            }
        }
    }

    async fn read_batch(&self, from_offset: u64) -> Result<RecordBatch> {
        let partition_id = self.partition_id();
        let log = &self.resources.log;
        let options = &self.resources.options;

        FutureRetry::new(
            move || {
                log.read_batch(
                    partition_id,
                    from_offset,
                    options.max_batch_size,
                    options.receive_timeout(),
                )
            },
            ExponentialBackoffStrategy::new(&options.retry, partition_id),
        )
        .await
        .map(|(batch, _attempts)| batch)
        .map_err(|(err, attempts)| {
            warn!(
                partition = %partition_id,
                attempts,
                error = %err,
                "Giving up on reading partition"
            );
            err
        })
    }

    /// Hand the partition back so a later scan can restart it under a new epoch.
    async fn release_after_error(&self) {
        if let Err(err) = self.resources.manager.release(&self.lease).await {
            self.report(ErrorAction::Release, err);
            self.resources.manager.abandon(&self.lease).await;
        }
    }
}

/// Runs a processor hook, turning a panic into a processor error.
async fn guarded<F>(partition_id: &str, hook: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    match AssertUnwindSafe(hook).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(Error::processor(
            partition_id,
            format!("processor panicked: {}", panic_message(panic.as_ref())),
        )),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}
