use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::RwLock;

use super::{compare_partition_ids, PartitionedLog};
use crate::Result;

struct PartitionCache {
    partition_ids: Arc<Vec<String>>,
    last_cache_update: Option<Instant>,
    cache_ttl: Duration,
}

impl PartitionCache {
    fn new(cache_ttl: Duration) -> Self {
        Self {
            partition_ids: Arc::new(Vec::new()),
            last_cache_update: None,
            cache_ttl,
        }
    }

    fn get_all(&self) -> Option<Arc<Vec<String>>> {
        if self.cache_is_expired() {
            None
        } else {
            Some(Arc::clone(&self.partition_ids))
        }
    }

    fn refresh(&mut self, mut partition_ids: Vec<String>) -> Arc<Vec<String>> {
        partition_ids.sort_by(|a, b| compare_partition_ids(a, b));
        partition_ids.dedup();
        self.partition_ids = Arc::new(partition_ids);
        self.last_cache_update = Some(Instant::now());
        Arc::clone(&self.partition_ids)
    }

    fn cache_is_expired(&self) -> bool {
        if let Some(last_updated_time) = self.last_cache_update {
            last_updated_time + self.cache_ttl < Instant::now()
        } else {
            true
        }
    }
}

/// Sorted partition ids of the log, refreshed after `cache_ttl`.
pub(crate) struct PartitionLayout {
    log: Arc<dyn PartitionedLog>,
    cache: RwLock<PartitionCache>,
}

impl PartitionLayout {
    pub(crate) fn new(log: Arc<dyn PartitionedLog>, cache_ttl: Duration) -> Self {
        Self {
            log,
            cache: RwLock::new(PartitionCache::new(cache_ttl)),
        }
    }

    pub(crate) async fn partition_ids(&self) -> Result<Arc<Vec<String>>> {
        if let Some(ids) = self.cache.read().await.get_all() {
            return Ok(ids);
        }

        let ids = self.log.partition_ids().await?;
        Ok(self.cache.write().await.refresh(ids))
    }
}
