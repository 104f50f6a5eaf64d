use super::{Item, ItemKey, KeySchema, PartitionStore, WriteCondition};
use crate::error::StoreError;
use crate::model::{RELAYS_PARTITION, SENSORS_PARTITION};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use tracing::debug;

struct MemPartition {
    schema: KeySchema,
    items: BTreeMap<ItemKey, Item>,
}

impl MemPartition {
    fn new(schema: KeySchema) -> Self {
        Self {
            schema,
            items: BTreeMap::new(),
        }
    }

    fn check_key(&self, key: &ItemKey) -> Result<(), StoreError> {
        match (self.schema, key.timestamp) {
            (KeySchema::Hash, None) | (KeySchema::HashRange, Some(_)) => Ok(()),
            _ => Err(StoreError::Malformed(format!(
                "key {key:?} does not match partition schema {:?}",
                self.schema
            ))),
        }
    }
}

/// Process-local store used for tests and single-node runs.
///
/// Behaves like the remote backends where the pipeline cares: operations
/// against an unknown partition fail with `ResourceNotFound`, and creating
/// a partition twice fails with `PartitionExists`.
pub struct InMemoryStore {
    partitions: RwLock<HashMap<String, MemPartition>>,
}

impl InMemoryStore {
    /// Create a store with the `relays` and `sensors` partitions in place
    pub fn new() -> Self {
        let mut partitions = HashMap::new();
        partitions.insert(RELAYS_PARTITION.to_string(), MemPartition::new(KeySchema::Hash));
        partitions.insert(SENSORS_PARTITION.to_string(), MemPartition::new(KeySchema::Hash));

        Self {
            partitions: RwLock::new(partitions),
        }
    }

    /// Number of items in a partition (0 when it does not exist)
    pub async fn item_count(&self, partition: &str) -> usize {
        self.partitions
            .read()
            .await
            .get(partition)
            .map(|p| p.items.len())
            .unwrap_or(0)
    }

    /// Sorted names of all partitions
    pub async fn partition_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.partitions.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PartitionStore for InMemoryStore {
    async fn get_item(&self, partition: &str, key: &ItemKey) -> Result<Option<Item>, StoreError> {
        let partitions = self.partitions.read().await;
        let part = partitions
            .get(partition)
            .ok_or_else(|| StoreError::ResourceNotFound(partition.to_string()))?;
        part.check_key(key)?;
        Ok(part.items.get(key).cloned())
    }

    async fn put_item(&self, partition: &str, item: Item) -> Result<(), StoreError> {
        let mut partitions = self.partitions.write().await;
        let part = partitions
            .get_mut(partition)
            .ok_or_else(|| StoreError::ResourceNotFound(partition.to_string()))?;
        part.check_key(&item.key)?;
        part.items.insert(item.key.clone(), item);
        Ok(())
    }

    async fn put_item_conditional(
        &self,
        partition: &str,
        item: Item,
        condition: WriteCondition,
    ) -> Result<(), StoreError> {
        let mut partitions = self.partitions.write().await;
        let part = partitions
            .get_mut(partition)
            .ok_or_else(|| StoreError::ResourceNotFound(partition.to_string()))?;
        part.check_key(&item.key)?;

        let holds = match (condition, part.items.get(&item.key)) {
            (WriteCondition::NotExists, existing) => existing.is_none(),
            (WriteCondition::VersionEquals(v), Some(existing)) => existing.version() == v,
            (WriteCondition::VersionEquals(_), None) => false,
        };
        if !holds {
            debug!(partition, key = ?item.key, ?condition, "Conditional write rejected");
            return Err(StoreError::ConditionFailed);
        }

        part.items.insert(item.key.clone(), item);
        Ok(())
    }

    async fn query(
        &self,
        partition: &str,
        id: &str,
        descending: bool,
        limit: usize,
    ) -> Result<Vec<Item>, StoreError> {
        let partitions = self.partitions.read().await;
        let part = partitions
            .get(partition)
            .ok_or_else(|| StoreError::ResourceNotFound(partition.to_string()))?;

        let matching = part
            .items
            .range(ItemKey::hash(id)..=ItemKey::hash_range(id, i64::MAX))
            .map(|(_, item)| item);

        let items = if descending {
            matching.rev().take(limit).cloned().collect()
        } else {
            matching.take(limit).cloned().collect()
        };
        Ok(items)
    }

    async fn partition_exists(&self, name: &str) -> Result<bool, StoreError> {
        let partitions = self.partitions.read().await;
        // Same probe a list-tables API gives: first name >= `name`
        let first = partitions
            .keys()
            .filter(|k| k.as_str() >= name)
            .min();
        Ok(first.map(|k| k == name).unwrap_or(false))
    }

    async fn create_partition(&self, name: &str, schema: KeySchema) -> Result<(), StoreError> {
        let mut partitions = self.partitions.write().await;
        if partitions.contains_key(name) {
            return Err(StoreError::PartitionExists(name.to_string()));
        }
        partitions.insert(name.to_string(), MemPartition::new(schema));
        debug!(partition = name, ?schema, "Created in-memory partition");
        Ok(())
    }
}
