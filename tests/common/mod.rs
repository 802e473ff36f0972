#![allow(dead_code)]

use std::{
    collections::BTreeMap,
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use event_processor_host::{
    config::DEFAULT_CONSUMER_GROUP, CloseReason, Error, ErrorReport, EventProcessor,
    EventProcessorHost, HostConfig, HostOptions, InMemoryLeaseStore, InMemoryLog, LeaseStore,
    PartitionContext, RecordBatch, RetryConfig, ScopedLeaseStore,
};
use tokio::time::Instant;

/// Timings short enough for tests, with the lease still comfortably longer
/// than the renew interval.
pub fn fast_options() -> HostOptions {
    HostOptions {
        lease_duration_ms: 600,
        renew_interval_ms: 150,
        rebalance_interval_ms: 100,
        max_batch_size: 10,
        receive_timeout_ms: 50,
        shutdown_grace_ms: 2_000,
        retry: RetryConfig::new(Duration::from_millis(5), Duration::from_millis(20), 3)
            .without_jitter(),
        ..HostOptions::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Open {
        partition_id: String,
        epoch: u64,
        starting_offset: u64,
    },
    Batch {
        partition_id: String,
        epoch: u64,
        offsets: Vec<u64>,
    },
    /// A checkpoint call that returned `Ok` after the batch ending at `offset`.
    Checkpoint {
        partition_id: String,
        epoch: u64,
        offset: u64,
    },
    Close {
        partition_id: String,
        epoch: u64,
        reason: CloseReason,
    },
}

/// Shared log of every hook call made by [`RecordingProcessor`]s.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<Event>>>,
    errors: Arc<Mutex<Vec<ErrorReport>>>,
}

impl Recorder {
    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<ErrorReport> {
        self.errors.lock().unwrap().clone()
    }

    /// Offsets delivered per partition, in delivery order.
    pub fn offsets_by_partition(&self) -> BTreeMap<String, Vec<u64>> {
        let mut offsets: BTreeMap<String, Vec<u64>> = BTreeMap::new();
        for event in self.events() {
            if let Event::Batch {
                partition_id,
                offsets: batch,
                ..
            } = event
            {
                offsets.entry(partition_id).or_default().extend(batch);
            }
        }
        offsets
    }

    pub fn delivered(&self) -> usize {
        self.offsets_by_partition().values().map(Vec::len).sum()
    }

    /// Offsets delivered for one partition under one epoch.
    pub fn offsets_for(&self, partition_id: &str, epoch: u64) -> Vec<u64> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Batch {
                    partition_id: p,
                    epoch: e,
                    offsets,
                } if p == partition_id && e == epoch => Some(offsets),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn opens(&self) -> Vec<(String, u64, u64)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Open {
                    partition_id,
                    epoch,
                    starting_offset,
                } => Some((partition_id, epoch, starting_offset)),
                _ => None,
            })
            .collect()
    }

    pub fn closes(&self) -> Vec<(String, u64, CloseReason)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Close {
                    partition_id,
                    epoch,
                    reason,
                } => Some((partition_id, epoch, reason)),
                _ => None,
            })
            .collect()
    }

    /// Offset of the last successful checkpoint per partition.
    pub fn last_checkpoints(&self) -> BTreeMap<String, u64> {
        let mut checkpoints = BTreeMap::new();
        for event in self.events() {
            if let Event::Checkpoint {
                partition_id,
                offset,
                ..
            } = event
            {
                let current = checkpoints.entry(partition_id).or_insert(offset);
                *current = (*current).max(offset);
            }
        }
        checkpoints
    }

    pub fn factory(
        &self,
        behavior: Behavior,
    ) -> impl Fn(&PartitionContext) -> Box<dyn EventProcessor> + Send + Sync + 'static {
        let recorder = self.clone();
        move |_context: &PartitionContext| -> Box<dyn EventProcessor> {
            Box::new(RecordingProcessor {
                recorder: recorder.clone(),
                behavior: behavior.clone(),
                batches: 0,
            })
        }
    }

    pub fn error_handler(&self) -> impl Fn(&ErrorReport) + Send + Sync + 'static {
        let errors = self.errors.clone();
        move |report: &ErrorReport| errors.lock().unwrap().push(report.clone())
    }
}

/// How a [`RecordingProcessor`] behaves besides recording.
#[derive(Clone, Default)]
pub struct Behavior {
    /// Checkpoint after every n-th batch; 0 never checkpoints.
    pub checkpoint_every: usize,
    /// Fail `process` once when a batch contains this partition and offset.
    pub fail_once_at: Option<(String, u64)>,
    armed: Arc<AtomicBool>,
    /// Time spent in `process` before returning.
    pub batch_delay: Duration,
}

impl Behavior {
    pub fn checkpointing() -> Self {
        Self::checkpointing_every(1)
    }

    pub fn checkpointing_every(batches: usize) -> Self {
        Self {
            checkpoint_every: batches,
            ..Self::default()
        }
    }

    pub fn failing_once_at(partition_id: &str, offset: u64) -> Self {
        Self {
            checkpoint_every: 1,
            fail_once_at: Some((partition_id.to_string(), offset)),
            armed: Arc::new(AtomicBool::new(true)),
            ..Self::default()
        }
    }

    /// Never returns from `process`.
    pub fn stuck() -> Self {
        Self {
            batch_delay: Duration::from_secs(3_600),
            ..Self::default()
        }
    }

    pub fn with_batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = delay;
        self
    }
}

pub struct RecordingProcessor {
    recorder: Recorder,
    behavior: Behavior,
    batches: usize,
}

#[async_trait]
impl EventProcessor for RecordingProcessor {
    async fn open(&mut self, context: &PartitionContext) -> event_processor_host::Result<()> {
        self.recorder.push(Event::Open {
            partition_id: context.partition_id().to_string(),
            epoch: context.epoch(),
            starting_offset: context.starting_offset(),
        });
        Ok(())
    }

    async fn process(
        &mut self,
        context: &PartitionContext,
        batch: RecordBatch,
    ) -> event_processor_host::Result<()> {
        let offsets: Vec<u64> = batch.iter().map(|record| record.offset).collect();
        let last_offset = offsets.last().copied();
        self.batches += 1;
        self.recorder.push(Event::Batch {
            partition_id: context.partition_id().to_string(),
            epoch: context.epoch(),
            offsets: offsets.clone(),
        });

        if let Some((partition_id, offset)) = &self.behavior.fail_once_at {
            if partition_id == context.partition_id()
                && offsets.contains(offset)
                && self.behavior.armed.swap(false, Ordering::SeqCst)
            {
                return Err(Error::processor(
                    context.partition_id(),
                    format!("refusing offset {offset}"),
                ));
            }
        }
        if !self.behavior.batch_delay.is_zero() {
            tokio::time::sleep(self.behavior.batch_delay).await;
        }
        let every = self.behavior.checkpoint_every;
        if every > 0 && self.batches % every == 0 {
            context.checkpoint().await?;
            if let Some(offset) = last_offset {
                self.recorder.push(Event::Checkpoint {
                    partition_id: context.partition_id().to_string(),
                    epoch: context.epoch(),
                    offset,
                });
            }
        }
        Ok(())
    }

    async fn close(
        &mut self,
        context: &PartitionContext,
        reason: CloseReason,
    ) -> event_processor_host::Result<()> {
        self.recorder.push(Event::Close {
            partition_id: context.partition_id().to_string(),
            epoch: context.epoch(),
            reason,
        });
        Ok(())
    }
}

pub fn build_host(
    name: &str,
    log: &Arc<InMemoryLog>,
    store: &Arc<InMemoryLeaseStore>,
    recorder: &Recorder,
    behavior: Behavior,
) -> EventProcessorHost {
    build_host_with(
        HostConfig::new(name, log.name()),
        fast_options(),
        log,
        store.clone(),
        recorder,
        behavior,
    )
}

pub fn build_host_with(
    config: HostConfig,
    options: HostOptions,
    log: &Arc<InMemoryLog>,
    store: Arc<dyn LeaseStore>,
    recorder: &Recorder,
    behavior: Behavior,
) -> EventProcessorHost {
    EventProcessorHost::builder(config)
        .options(options)
        .log(log.clone())
        .lease_store(store)
        .processor_factory(recorder.factory(behavior))
        .on_error(recorder.error_handler())
        .build()
        .expect("valid host configuration")
}

/// The default consumer group's view of a shared store, as hosts see it.
pub fn scoped(store: &Arc<InMemoryLeaseStore>, hub: &str) -> Arc<ScopedLeaseStore> {
    Arc::new(ScopedLeaseStore::new(
        store.clone(),
        hub,
        DEFAULT_CONSUMER_GROUP,
    ))
}

pub async fn send_records(log: &InMemoryLog, partition_id: &str, count: usize) {
    for i in 0..count {
        log.send_to(partition_id, Bytes::from(format!("record {i}")))
            .await
            .expect("partition exists");
    }
}

/// Polls `check` until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
