use super::{Item, ItemKey, KeySchema, PartitionStore, WriteCondition, HASH_KEY, RANGE_KEY};
use crate::config::DatabaseConfig;
use crate::error::StoreError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{debug, info, instrument};

/// SQLSTATE for `undefined_table`
const UNDEFINED_TABLE: &str = "42P01";
/// SQLSTATE for `duplicate_table`
const DUPLICATE_TABLE: &str = "42P07";
/// SQLSTATE for `unique_violation`; a concurrent `CREATE TABLE` loses on `pg_type` with this
const UNIQUE_VIOLATION: &str = "23505";

/// PostgreSQL-backed partition store.
///
/// Every partition is a table with the same layout:
///
/// ```text
/// id        TEXT    hash key
/// sort_key  BIGINT  range key (0 for hash-only partitions)
/// item      JSONB   full item document, including id/timestamp
/// ```
pub struct PgPartitionStore {
    pool: PgPool,
}

impl PgPartitionStore {
    /// Create a new store with a connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Create the `relays` and `sensors` tables
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

}

/// Quote a partition name as a table identifier.
///
/// Partition names carry a `-` (`readings_2024-01`) so they always need
/// quoting; anything outside `[a-z0-9_-]` is refused outright.
fn table_ident(name: &str) -> Result<String, StoreError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if !valid {
        return Err(StoreError::Malformed(format!("invalid partition name: {name:?}")));
    }
    Ok(format!("\"{name}\""))
}

/// Which statement raised the error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Statement {
    Item,
    CreateTable,
}

fn classify_sqlstate(code: &str, partition: &str, statement: Statement) -> Option<StoreError> {
    match (code, statement) {
        (UNDEFINED_TABLE, _) => Some(StoreError::ResourceNotFound(partition.to_string())),
        (DUPLICATE_TABLE, _) | (UNIQUE_VIOLATION, Statement::CreateTable) => {
            Some(StoreError::PartitionExists(partition.to_string()))
        }
        _ => None,
    }
}

fn map_db_error(e: sqlx::Error, partition: &str, statement: Statement) -> StoreError {
    if let sqlx::Error::Database(ref db) = e {
        if let Some(mapped) = db
            .code()
            .and_then(|code| classify_sqlstate(&code, partition, statement))
        {
            return mapped;
        }
    }
    StoreError::from(e)
}

fn sort_key(key: &ItemKey) -> i64 {
    key.timestamp.unwrap_or(0)
}

fn to_document(item: &Item) -> Value {
    let mut doc = item.attributes.clone();
    doc.insert(HASH_KEY.to_string(), Value::from(item.key.id.clone()));
    if let Some(ts) = item.key.timestamp {
        doc.insert(RANGE_KEY.to_string(), Value::from(ts));
    }
    Value::Object(doc)
}

fn from_document(doc: Value) -> Result<Item, StoreError> {
    let Value::Object(mut attributes) = doc else {
        return Err(StoreError::Malformed("item document is not an object".to_string()));
    };

    let id = match attributes.remove(HASH_KEY) {
        Some(Value::String(id)) => id,
        _ => return Err(StoreError::Malformed("item document has no id".to_string())),
    };
    let timestamp = attributes.remove(RANGE_KEY).and_then(|v| v.as_i64());

    Ok(Item {
        key: ItemKey { id, timestamp },
        attributes,
    })
}

#[async_trait]
impl PartitionStore for PgPartitionStore {
    async fn get_item(&self, partition: &str, key: &ItemKey) -> Result<Option<Item>, StoreError> {
        let sql = format!(
            "SELECT item FROM {} WHERE id = $1 AND sort_key = $2",
            table_ident(partition)?
        );

        let row: Option<(Value,)> = sqlx::query_as(&sql)
            .bind(&key.id)
            .bind(sort_key(key))
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_db_error(e, partition, Statement::Item))?;

        row.map(|(doc,)| from_document(doc)).transpose()
    }

    async fn put_item(&self, partition: &str, item: Item) -> Result<(), StoreError> {
        let sql = format!(
            r#"
            INSERT INTO {} (id, sort_key, item) VALUES ($1, $2, $3)
            ON CONFLICT (id, sort_key) DO UPDATE SET item = EXCLUDED.item
            "#,
            table_ident(partition)?
        );

        sqlx::query(&sql)
            .bind(&item.key.id)
            .bind(sort_key(&item.key))
            .bind(to_document(&item))
            .execute(&self.pool)
            .await
            .map_err(|e| map_db_error(e, partition, Statement::Item))?;

        Ok(())
    }

    #[instrument(skip(self, item), fields(id = %item.key.id))]
    async fn put_item_conditional(
        &self,
        partition: &str,
        item: Item,
        condition: WriteCondition,
    ) -> Result<(), StoreError> {
        let table = table_ident(partition)?;

        let result = match condition {
            WriteCondition::NotExists => {
                let sql = format!(
                    r#"
                    INSERT INTO {table} (id, sort_key, item) VALUES ($1, $2, $3)
                    ON CONFLICT (id, sort_key) DO NOTHING
                    "#
                );
                sqlx::query(&sql)
                    .bind(&item.key.id)
                    .bind(sort_key(&item.key))
                    .bind(to_document(&item))
                    .execute(&self.pool)
                    .await
            }
            WriteCondition::VersionEquals(version) => {
                let sql = format!(
                    r#"
                    UPDATE {table} SET item = $3
                    WHERE id = $1 AND sort_key = $2
                      AND COALESCE((item->>'version')::bigint, 0) = $4
                    "#
                );
                sqlx::query(&sql)
                    .bind(&item.key.id)
                    .bind(sort_key(&item.key))
                    .bind(to_document(&item))
                    .bind(version as i64)
                    .execute(&self.pool)
                    .await
            }
        }
        .map_err(|e| map_db_error(e, partition, Statement::Item))?;

        if result.rows_affected() == 0 {
            debug!(?condition, "Conditional write matched no row");
            return Err(StoreError::ConditionFailed);
        }
        Ok(())
    }

    async fn query(
        &self,
        partition: &str,
        id: &str,
        descending: bool,
        limit: usize,
    ) -> Result<Vec<Item>, StoreError> {
        let order = if descending { "DESC" } else { "ASC" };
        let sql = format!(
            "SELECT item FROM {} WHERE id = $1 ORDER BY sort_key {order} LIMIT $2",
            table_ident(partition)?
        );

        let rows: Vec<(Value,)> = sqlx::query_as(&sql)
            .bind(id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_db_error(e, partition, Statement::Item))?;

        rows.into_iter().map(|(doc,)| from_document(doc)).collect()
    }

    async fn partition_exists(&self, name: &str) -> Result<bool, StoreError> {
        let first: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT table_name::text FROM information_schema.tables
            WHERE table_schema = current_schema()
              AND table_name::text COLLATE "C" >= $1
            ORDER BY table_name::text COLLATE "C"
            LIMIT 1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(matches!(first, Some((ref found,)) if found == name))
    }

    #[instrument(skip(self))]
    async fn create_partition(&self, name: &str, schema: KeySchema) -> Result<(), StoreError> {
        let sql = format!(
            r#"
            CREATE TABLE {} (
                id TEXT NOT NULL,
                sort_key BIGINT NOT NULL,
                item JSONB NOT NULL,
                PRIMARY KEY (id, sort_key)
            )
            "#,
            table_ident(name)?
        );

        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|e| map_db_error(e, name, Statement::CreateTable))?;

        info!(partition = name, ?schema, "Created partition table");
        Ok(())
    }
}
