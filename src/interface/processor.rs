use std::{fmt, sync::Arc};

use async_trait::async_trait;

use super::record::RecordBatch;
use crate::{pump::checkpointer::Checkpointer, Result};

/// Why a processor is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// The host is stopping and will release the lease.
    Shutdown,
    /// Another host took the lease, or it expired.
    LeaseLost,
    /// A read or processor failure ended the pump.
    Error,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What a processor knows about the partition it is bound to, plus its
/// handle for checkpointing.
///
/// A context lives for exactly one lease epoch.
#[derive(Clone)]
pub struct PartitionContext {
    pub(crate) partition_id: String,
    pub(crate) owner: String,
    pub(crate) consumer_group: String,
    pub(crate) epoch: u64,
    pub(crate) starting_offset: u64,
    pub(crate) checkpointer: Arc<Checkpointer>,
}

impl PartitionContext {
    pub fn partition_id(&self) -> &str {
        &self.partition_id
    }

    /// Name of the host holding the lease.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Offset of the first record this epoch will deliver.
    pub fn starting_offset(&self) -> u64 {
        self.starting_offset
    }

    pub fn last_delivered_offset(&self) -> Option<u64> {
        self.checkpointer.last_delivered()
    }

    pub fn last_checkpoint(&self) -> Option<u64> {
        self.checkpointer.last_persisted()
    }

    /// Checkpoint the last record delivered so far. A no-op before the first
    /// batch.
    pub async fn checkpoint(&self) -> Result<()> {
        match self.checkpointer.last_delivered() {
            Some(offset) => self.checkpointer.checkpoint(offset).await,
            None => Ok(()),
        }
    }

    /// Checkpoint a specific delivered record. Resumption after a hand-off
    /// starts at `offset + 1`.
    pub async fn checkpoint_at(&self, offset: u64) -> Result<()> {
        self.checkpointer.checkpoint(offset).await
    }
}

impl fmt::Debug for PartitionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionContext")
            .field("partition_id", &self.partition_id)
            .field("owner", &self.owner)
            .field("epoch", &self.epoch)
            .field("starting_offset", &self.starting_offset)
            .finish()
    }
}

/// Client logic bound to one partition for one lease epoch.
///
/// `open` runs once before the first `process`, `process` calls never
/// overlap, and `close` runs once at the end. Returning an error from any
/// hook ends the epoch with [`CloseReason::Error`].
#[async_trait]
pub trait EventProcessor: Send {
    async fn open(&mut self, _context: &PartitionContext) -> Result<()> {
        Ok(())
    }

    async fn process(&mut self, context: &PartitionContext, batch: RecordBatch) -> Result<()>;

    async fn close(&mut self, _context: &PartitionContext, _reason: CloseReason) -> Result<()> {
        Ok(())
    }
}

/// Creates a fresh processor for each partition epoch.
pub trait EventProcessorFactory: Send + Sync {
    fn create(&self, context: &PartitionContext) -> Box<dyn EventProcessor>;
}

impl<F> EventProcessorFactory for F
where
    F: Fn(&PartitionContext) -> Box<dyn EventProcessor> + Send + Sync,
{
    fn create(&self, context: &PartitionContext) -> Box<dyn EventProcessor> {
        self(context)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        error::StaleReason,
        lease::{InMemoryLeaseStore, LeaseStore, PartitionLeaseManager},
        Error,
    };

    struct Noop;

    #[async_trait]
    impl EventProcessor for Noop {
        async fn process(&mut self, _context: &PartitionContext, _batch: RecordBatch) -> Result<()> {
            Ok(())
        }
    }

    async fn context(store: &Arc<InMemoryLeaseStore>) -> PartitionContext {
        let manager = Arc::new(PartitionLeaseManager::new(
            store.clone(),
            "host-a",
            Duration::from_secs(60),
        ));
        let lease = manager.acquire("0").await.unwrap();
        PartitionContext {
            partition_id: "0".into(),
            owner: "host-a".into(),
            consumer_group: "$Default".into(),
            epoch: lease.epoch(),
            starting_offset: 0,
            checkpointer: Arc::new(Checkpointer::new(manager, lease, None)),
        }
    }

    #[tokio::test]
    async fn test_checkpoint_before_first_batch_is_a_no_op() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let context = context(&store).await;

        context.checkpoint().await.unwrap();
        assert_eq!(context.last_checkpoint(), None);
        assert_eq!(store.get("0").await.unwrap().unwrap().checkpoint, None);
    }

    #[tokio::test]
    async fn test_checkpoint_at_is_limited_to_delivered_offsets() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let context = context(&store).await;
        context.checkpointer.mark_delivered(6);

        context.checkpoint_at(2).await.unwrap();
        assert_eq!(context.last_checkpoint(), Some(2));
        assert!(matches!(
            context.checkpoint_at(7).await,
            Err(Error::StaleCheckpoint {
                reason: StaleReason::NotDelivered,
                ..
            })
        ));

        context.checkpoint().await.unwrap();
        assert_eq!(context.last_delivered_offset(), Some(6));
        assert_eq!(store.get("0").await.unwrap().unwrap().checkpoint, Some(6));
    }

    #[tokio::test]
    async fn test_closures_are_factories() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let context = context(&store).await;
        let factory = |_: &PartitionContext| -> Box<dyn EventProcessor> { Box::new(Noop) };

        let mut processor = factory.create(&context);
        processor.open(&context).await.unwrap();
        processor.process(&context, Vec::new()).await.unwrap();
        processor
            .close(&context, CloseReason::Shutdown)
            .await
            .unwrap();
    }
}
