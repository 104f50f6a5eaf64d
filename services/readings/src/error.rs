use crate::model::Sensor;
use thiserror::Error;

/// Errors raised by a partition store backend
#[derive(Error, Debug)]
pub enum StoreError {
    /// The target partition does not exist
    #[error("Partition not found: {0}")]
    ResourceNotFound(String),

    /// A partition with this name already exists
    #[error("Partition already exists: {0}")]
    PartitionExists(String),

    /// A conditional write found a different row version
    #[error("Conditional write failed")]
    ConditionFailed,

    /// A stored item is missing a field or has the wrong type
    #[error("Malformed item: {0}")]
    Malformed(String),

    /// Any other backend fault (network, service, driver)
    #[error("Store backend error: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// A reading was rejected before anything was written
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationFailure {
    #[error("No measurements provided in message")]
    EmptyMeasurements,

    #[error("Reading timestamp out of range: {0}")]
    InvalidTimestamp(i64),

    #[error("Relay not found: {0}")]
    RelayNotFound(String),

    #[error("Reporting relay {relay_id} is not active (state: {state})")]
    RelayInactive { relay_id: String, state: String },

    #[error("Sensor and relay use different accounts: sensor account={sensor_account}, relay account={relay_account}")]
    AccountMismatch {
        sensor_account: String,
        relay_account: String,
    },
}

/// A new sensor whose registry write failed.
///
/// Carries the in-memory sensor so the caller can decide whether to keep
/// going without the persisted row.
#[derive(Error, Debug)]
#[error("Failed to persist new sensor {}: {source}", .sensor.id)]
pub struct UnpersistedSensor {
    pub sensor: Sensor,
    #[source]
    pub source: StoreError,
}

/// Errors returned from `ReadingPipeline::write_sensor_reading`
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationFailure),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    SensorNotPersisted(#[from] UnpersistedSensor),

    #[error("Hourly aggregate kept changing underneath us after {attempts} attempts")]
    AggregateConflict { attempts: u32 },
}

impl IngestError {
    /// Whether redelivering the same message could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            IngestError::Validation(_) | IngestError::Serialization(_) => false,
            IngestError::Store(StoreError::Malformed(_)) => false,
            IngestError::Store(_)
            | IngestError::SensorNotPersisted(_)
            | IngestError::AggregateConflict { .. } => true,
        }
    }
}

/// Result alias used across the pipeline
pub type Result<T> = std::result::Result<T, IngestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_failures_are_terminal() {
        let err: IngestError = ValidationFailure::EmptyMeasurements.into();
        assert!(!err.is_retryable());

        let err: IngestError = ValidationFailure::AccountMismatch {
            sensor_account: "a".to_string(),
            relay_account: "b".to_string(),
        }
        .into();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("sensor account=a"));
    }

    #[test]
    fn test_store_faults_are_retryable() {
        let err: IngestError = StoreError::Backend("timeout".to_string()).into();
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "Store backend error: timeout");

        let err = IngestError::AggregateConflict { attempts: 5 };
        assert!(err.is_retryable());
    }

    #[test]
    fn test_malformed_items_are_terminal() {
        let err: IngestError = StoreError::Malformed("missing account_id".to_string()).into();
        assert!(!err.is_retryable());

        let json_err = serde_json::from_str::<Vec<u8>>("not json").unwrap_err();
        let err: IngestError = json_err.into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_unpersisted_sensor_keeps_source() {
        let err = UnpersistedSensor {
            sensor: Sensor::new_default("sensor-1", "acct-1"),
            source: StoreError::Backend("throttled".to_string()),
        };
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("sensor-1"));
    }
}
