//! Consumer-side host for a partitioned event log.
//!
//! Hosts sharing a lease store split the partitions of one event hub between
//! them, run an [`EventProcessor`] per owned partition and persist checkpoints
//! so that a partition picked up by another host resumes where it left off.

pub mod config;
pub mod error;
pub mod host;
pub mod interface;
pub mod lease;
pub mod pump;
pub mod stream;
mod util;

pub use config::{Config, HostConfig, HostOptions, InitialPosition, RetryConfig};
pub use error::{ConflictKind, Error, ErrorAction, ErrorReport, Result, StaleReason};
pub use host::{EventProcessorHost, EventProcessorHostBuilder};
pub use interface::{
    processor::{CloseReason, EventProcessor, EventProcessorFactory, PartitionContext},
    record::{EventRecord, RecordBatch},
};
pub use lease::{
    CasOutcome, CheckpointOutcome, InMemoryLeaseStore, Lease, LeaseStore, OwnedLease,
    PartitionLeaseManager, ScopedLeaseStore,
};
pub use pump::PumpState;
pub use stream::{
    memory::{InMemoryLog, InMemoryNamespace},
    PartitionedLog,
};
pub use util::now_ms;
