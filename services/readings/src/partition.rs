use crate::error::StoreError;
use crate::store::{Item, KeySchema, SharedStore};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Wait applied after partition creation before the partition is used
#[async_trait]
pub trait SettleDelay: Send + Sync {
    async fn settle(&self, duration: Duration);
}

/// Settle by sleeping on the tokio timer
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSettle;

#[async_trait]
impl SettleDelay for TokioSettle {
    async fn settle(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// What `ensure_partition` found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provisioned {
    /// This call created the partition
    Created,
    /// The partition was already there (or another writer created it first)
    AlreadyExisted,
}

/// Creates partitions on demand and owns the settle wait.
///
/// Writers never check for a partition up front. A failed write is followed
/// by `ensure_partition`, which either creates the missing partition or
/// assumes one is still coming up. Both paths end with the settle wait
/// before the caller retries exactly once.
pub struct PartitionProvisioner {
    store: SharedStore,
    settle: Arc<dyn SettleDelay>,
    settle_duration: Duration,
}

impl PartitionProvisioner {
    pub fn new(store: SharedStore, settle: Arc<dyn SettleDelay>, settle_duration: Duration) -> Self {
        Self {
            store,
            settle,
            settle_duration,
        }
    }

    /// Make sure `name` exists, then wait out the settle interval.
    ///
    /// Losing a creation race to another writer counts as success.
    pub async fn ensure_partition(
        &self,
        name: &str,
        schema: KeySchema,
    ) -> Result<Provisioned, StoreError> {
        let outcome = if self.store.partition_exists(name).await? {
            info!(partition = name, "Partition exists, waiting in case it is still being created");
            Provisioned::AlreadyExisted
        } else {
            info!(partition = name, "Partition doesn't exist, creating it");
            match self.store.create_partition(name, schema).await {
                Ok(()) => {
                    metrics::counter!("readings.partitions.created").increment(1);
                    Provisioned::Created
                }
                Err(StoreError::PartitionExists(_)) => {
                    info!(partition = name, "Partition was created concurrently");
                    Provisioned::AlreadyExisted
                }
                Err(e) => return Err(e),
            }
        };

        self.settle.settle(self.settle_duration).await;
        info!(
            partition = name,
            settle_secs = self.settle_duration.as_secs_f64(),
            "Finished waiting, resuming"
        );

        Ok(outcome)
    }

    /// Upsert `item`, provisioning the partition and retrying once on failure
    pub async fn put_with_provisioning(
        &self,
        partition: &str,
        schema: KeySchema,
        item: Item,
    ) -> Result<(), StoreError> {
        let retry = item.clone();
        match self.store.put_item(partition, item).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(partition, error = %e, "Write failed, checking partition");
                self.ensure_partition(partition, schema).await?;
                self.store.put_item(partition, retry).await
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingSettle;
    use super::*;
    use crate::store::{InMemoryStore, ItemKey, MockPartitionStore, PartitionStore};

    fn provisioner(store: SharedStore, settle: Arc<RecordingSettle>) -> PartitionProvisioner {
        PartitionProvisioner::new(store, settle, Duration::from_secs(30))
    }

    #[tokio::test]
    async fn test_creates_missing_partition_and_settles() {
        let store = Arc::new(InMemoryStore::new());
        let settle = Arc::new(RecordingSettle::default());
        let p = provisioner(store.clone(), settle.clone());

        let outcome = p
            .ensure_partition("readings_2024-03", KeySchema::HashRange)
            .await
            .unwrap();

        assert_eq!(outcome, Provisioned::Created);
        assert!(store.partition_exists("readings_2024-03").await.unwrap());
        assert_eq!(settle.calls(), vec![Duration::from_secs(30)]);
    }

    #[tokio::test]
    async fn test_existing_partition_still_settles() {
        let store = Arc::new(InMemoryStore::new());
        store
            .create_partition("readings_2024-03", KeySchema::HashRange)
            .await
            .unwrap();
        let settle = Arc::new(RecordingSettle::default());
        let p = provisioner(store, settle.clone());

        let outcome = p
            .ensure_partition("readings_2024-03", KeySchema::HashRange)
            .await
            .unwrap();

        assert_eq!(outcome, Provisioned::AlreadyExisted);
        assert_eq!(settle.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_lost_creation_race_counts_as_existing() {
        let mut store = MockPartitionStore::new();
        store.expect_partition_exists().times(1).returning(|_| Ok(false));
        store
            .expect_create_partition()
            .times(1)
            .returning(|name, _| Err(StoreError::PartitionExists(name.to_string())));
        let settle = Arc::new(RecordingSettle::default());
        let p = provisioner(Arc::new(store), settle.clone());

        let outcome = p
            .ensure_partition("readings_2024-03", KeySchema::HashRange)
            .await
            .unwrap();

        assert_eq!(outcome, Provisioned::AlreadyExisted);
        assert_eq!(settle.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_put_retries_exactly_once() {
        let mut store = MockPartitionStore::new();
        store
            .expect_put_item()
            .times(2)
            .returning(|_, _| Err(StoreError::Backend("unavailable".to_string())));
        store.expect_partition_exists().times(1).returning(|_| Ok(true));
        let settle = Arc::new(RecordingSettle::default());
        let p = provisioner(Arc::new(store), settle.clone());

        let item = Item::new(ItemKey::hash_range("a:s", 1));
        let err = p
            .put_with_provisioning("readings_2024-03", KeySchema::HashRange, item)
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Backend(_)));
        assert_eq!(settle.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_put_into_new_partition() {
        let store = Arc::new(InMemoryStore::new());
        let settle = Arc::new(RecordingSettle::default());
        let p = provisioner(store.clone(), settle);

        let item = Item::new(ItemKey::hash_range("a:s", 1));
        p.put_with_provisioning("readings_2024-03", KeySchema::HashRange, item)
            .await
            .unwrap();

        assert_eq!(store.item_count("readings_2024-03").await, 1);
    }
}
