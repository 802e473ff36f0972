//! Error types for the event processor host.

use std::{fmt, sync::Arc};

use thiserror::Error;
use tracing::warn;

/// Result type alias for host operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Missing or inconsistent configuration. Raised before any I/O.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Another writer holds or just changed the lease.
    #[error("Lease conflict on partition {partition_id}: {kind}")]
    LeaseConflict {
        partition_id: String,
        kind: ConflictKind,
    },

    /// This host no longer owns the lease it was acting on.
    #[error("Lease lost on partition {partition_id}")]
    LeaseLost { partition_id: String },

    /// A checkpoint that cannot be applied under the current lease.
    #[error("Stale checkpoint at offset {offset} on partition {partition_id}: {reason}")]
    StaleCheckpoint {
        partition_id: String,
        offset: u64,
        reason: StaleReason,
    },

    /// Read failure worth retrying.
    #[error("Transient read error on partition {partition_id}: {message}")]
    TransientRead {
        partition_id: String,
        message: String,
    },

    /// Read failure that will not go away by retrying.
    #[error("Read error on partition {partition_id}: {message}")]
    Read {
        partition_id: String,
        message: String,
    },

    /// Raised by client-supplied processor hooks.
    #[error("Processor error on partition {partition_id}: {message}")]
    Processor {
        partition_id: String,
        message: String,
    },

    /// Lease store failure.
    #[error("Lease store error: {0}")]
    Store(String),

    /// A pump did not reach Closed within the shutdown grace period.
    #[error("Partition {partition_id} did not close within {grace_ms}ms and was aborted")]
    ShutdownTimeout { partition_id: String, grace_ms: u64 },
}

impl Error {
    /// Shorthand for processor implementations.
    pub fn processor(partition_id: impl Into<String>, message: impl fmt::Display) -> Self {
        Error::Processor {
            partition_id: partition_id.into(),
            message: message.to_string(),
        }
    }

    /// Whether the operation that produced this error may succeed if repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::TransientRead { .. } | Error::Store(_) | Error::LeaseConflict { .. }
        )
    }

    /// Whether this error means the caller has been superseded by another owner.
    pub fn is_lease_lost(&self) -> bool {
        matches!(
            self,
            Error::LeaseLost { .. }
                | Error::StaleCheckpoint {
                    reason: StaleReason::LeaseLost,
                    ..
                }
        )
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Configuration(err.to_string())
    }
}

/// Why an acquire or steal did not go through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictKind {
    /// A live lease is held by `owner`.
    AlreadyOwned { owner: String },
    /// The stored lease changed between read and conditional write.
    Contended,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictKind::AlreadyOwned { owner } => write!(f, "already owned by {}", owner),
            ConflictKind::Contended => f.write_str("lease changed concurrently"),
        }
    }
}

/// Why a checkpoint was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    /// The offset is beyond the last record delivered to the processor.
    NotDelivered,
    /// The pump has started closing.
    Closed,
    /// The lease moved to a newer epoch.
    LeaseLost,
}

impl fmt::Display for StaleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StaleReason::NotDelivered => "offset not yet delivered",
            StaleReason::Closed => "pump is closing",
            StaleReason::LeaseLost => "lease lost",
        })
    }
}

/// The host activity an error was raised from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorAction {
    Acquire,
    Renew,
    Release,
    Open,
    Process,
    Close,
    Read,
    Checkpoint,
    Shutdown,
}

impl fmt::Display for ErrorAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// An error surfaced to the host's error handler.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub host_name: String,
    pub partition_id: Option<String>,
    pub action: ErrorAction,
    pub error: Error,
}

/// Callback receiving every error the host encounters.
pub type ErrorHandler = Arc<dyn Fn(&ErrorReport) + Send + Sync>;

/// Logs each error and forwards it to the registered handler, if any.
#[derive(Clone)]
pub(crate) struct ErrorSink {
    host_name: String,
    handler: Option<ErrorHandler>,
}

impl ErrorSink {
    pub(crate) fn new(host_name: impl Into<String>, handler: Option<ErrorHandler>) -> Self {
        Self {
            host_name: host_name.into(),
            handler,
        }
    }

    pub(crate) fn report(&self, partition_id: Option<&str>, action: ErrorAction, error: Error) {
        warn!(
            host = %self.host_name,
            partition = partition_id.unwrap_or("-"),
            action = %action,
            error = %error,
            "Host error"
        );
        if let Some(handler) = &self.handler {
            handler(&ErrorReport {
                host_name: self.host_name.clone(),
                partition_id: partition_id.map(str::to_string),
                action,
                error,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Configuration("event hub name is required".into());
        assert_eq!(
            err.to_string(),
            "Configuration error: event hub name is required"
        );

        let err = Error::LeaseConflict {
            partition_id: "3".into(),
            kind: ConflictKind::AlreadyOwned {
                owner: "host-b".into(),
            },
        };
        assert_eq!(
            err.to_string(),
            "Lease conflict on partition 3: already owned by host-b"
        );
    }

    #[test]
    fn test_retry_classification() {
        assert!(Error::TransientRead {
            partition_id: "0".into(),
            message: "timeout".into()
        }
        .is_retryable());
        assert!(!Error::Read {
            partition_id: "0".into(),
            message: "partition deleted".into()
        }
        .is_retryable());
        assert!(!Error::processor("0", "boom").is_retryable());
    }

    #[test]
    fn test_lease_lost_classification() {
        let stale = Error::StaleCheckpoint {
            partition_id: "1".into(),
            offset: 7,
            reason: StaleReason::LeaseLost,
        };
        assert!(stale.is_lease_lost());

        let not_delivered = Error::StaleCheckpoint {
            partition_id: "1".into(),
            offset: 7,
            reason: StaleReason::NotDelivered,
        };
        assert!(!not_delivered.is_lease_lost());
    }
}
