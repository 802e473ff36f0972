use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::PartitionLeaseManager;
use crate::{
    error::{ErrorAction, ErrorSink},
    util::runnable::PeriodicRunnable,
};

/// Keeps every owned lease alive. Leases that fail to renew are dropped by
/// the manager, which signals their pumps.
pub(crate) struct LeaseRenewer {
    manager: Arc<PartitionLeaseManager>,
    errors: ErrorSink,
}

impl LeaseRenewer {
    pub(crate) fn new(manager: Arc<PartitionLeaseManager>, errors: ErrorSink) -> Self {
        Self { manager, errors }
    }
}

#[async_trait]
impl PeriodicRunnable for LeaseRenewer {
    async fn run_once(&self) {
        let leases = self.manager.owned_leases().await;
        let results = futures::future::join_all(
            leases.iter().map(|lease| self.manager.renew(lease)),
        )
        .await;

        for (lease, result) in leases.iter().zip(results) {
            if let Err(err) = result {
                self.errors
                    .report(Some(lease.partition_id()), ErrorAction::Renew, err);
            }
        }
        debug!(
            host = %self.manager.host_name(),
            leases = leases.len(),
            "Renewed leases"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::lease::{InMemoryLeaseStore, LeaseStore};

    #[tokio::test]
    async fn test_renewal_extends_expiry_and_detects_loss() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let a = Arc::new(PartitionLeaseManager::new(
            store.clone(),
            "host-a",
            Duration::from_secs(60),
        ));
        let b = PartitionLeaseManager::new(store.clone(), "host-b", Duration::from_secs(60));
        let renewer = LeaseRenewer::new(a.clone(), ErrorSink::new("host-a", None));

        let kept = a.acquire("0").await.unwrap();
        let stolen = a.acquire("1").await.unwrap();
        let before = kept.snapshot().expires_at_ms;

        b.steal(&store.get("1").await.unwrap().unwrap()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        renewer.run_once().await;

        assert!(kept.snapshot().expires_at_ms > before);
        assert!(!kept.is_lost());
        assert!(stolen.is_lost());
        let owned: Vec<String> = a
            .owned_leases()
            .await
            .iter()
            .map(|lease| lease.partition_id().to_string())
            .collect();
        assert_eq!(owned, vec!["0"]);
    }
}
