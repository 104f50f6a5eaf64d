pub mod memory;
pub mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PgPartitionStore;

use crate::error::StoreError;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Hash key attribute shared by every partition
pub const HASH_KEY: &str = "id";
/// Range key attribute for time-sharded partitions
pub const RANGE_KEY: &str = "timestamp";
/// Attribute holding the compare-and-swap counter
pub const VERSION_ATTRIBUTE: &str = "version";

/// Shape of a partition's primary key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySchema {
    /// Keyed by `id` only (relays, sensors)
    Hash,
    /// Keyed by `id` and ordered by `timestamp` (readings, aggregates)
    HashRange,
}

/// Primary key of a stored item
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ItemKey {
    pub id: String,
    pub timestamp: Option<i64>,
}

impl ItemKey {
    pub fn hash(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            timestamp: None,
        }
    }

    pub fn hash_range(id: impl Into<String>, timestamp: i64) -> Self {
        Self {
            id: id.into(),
            timestamp: Some(timestamp),
        }
    }
}

/// A stored row: its key plus a bag of attributes
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub key: ItemKey,
    pub attributes: Map<String, Value>,
}

impl Item {
    pub fn new(key: ItemKey) -> Self {
        Self {
            key,
            attributes: Map::new(),
        }
    }

    /// Builder-style attribute setter
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.to_string(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    /// Required string attribute
    pub fn str_attr(&self, name: &str) -> Result<&str, StoreError> {
        self.get(name).and_then(Value::as_str).ok_or_else(|| {
            StoreError::Malformed(format!("{}: missing string attribute {name}", self.key.id))
        })
    }

    pub fn opt_i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Value::as_i64)
    }

    pub fn opt_f64(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(Value::as_f64)
    }

    pub fn opt_bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(Value::as_bool)
    }

    /// Version used for conditional writes; rows written without one count as 0
    pub fn version(&self) -> u64 {
        self.get(VERSION_ATTRIBUTE)
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }
}

/// Precondition for `put_item_conditional`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteCondition {
    /// No row with the item's key may exist
    NotExists,
    /// The existing row must carry this version
    VersionEquals(u64),
}

/// Capability surface the pipeline needs from its store.
///
/// ```text
/// PartitionStore
/// ├── InMemoryStore    partition -> BTreeMap<(id, timestamp), Item>
/// └── PgPartitionStore partition -> table (id, sort_key, item JSONB)
/// ```
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PartitionStore: Send + Sync {
    /// Point lookup by full key
    async fn get_item(&self, partition: &str, key: &ItemKey) -> Result<Option<Item>, StoreError>;

    /// Unconditional upsert
    async fn put_item(&self, partition: &str, item: Item) -> Result<(), StoreError>;

    /// Upsert guarded by `condition`; fails with `ConditionFailed` when it does not hold
    async fn put_item_conditional(
        &self,
        partition: &str,
        item: Item,
        condition: WriteCondition,
    ) -> Result<(), StoreError>;

    /// Items sharing `id`, ordered by timestamp
    async fn query(
        &self,
        partition: &str,
        id: &str,
        descending: bool,
        limit: usize,
    ) -> Result<Vec<Item>, StoreError>;

    /// Probe for a partition by listing partitions starting at `name`
    async fn partition_exists(&self, name: &str) -> Result<bool, StoreError>;

    /// Create a new, empty partition
    async fn create_partition(&self, name: &str, schema: KeySchema) -> Result<(), StoreError>;
}

/// Store handle shared between pipeline components
pub type SharedStore = Arc<dyn PartitionStore>;
