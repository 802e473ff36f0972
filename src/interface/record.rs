use bytes::Bytes;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub offset: u64,
    pub partition_key: Option<String>,
    pub payload: Bytes,
    /// Wall-clock milliseconds at which the log accepted the record.
    pub enqueued_at_ms: u64,
}

impl EventRecord {
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// Ordered, contiguous records pulled from one partition.
pub type RecordBatch = Vec<EventRecord>;
