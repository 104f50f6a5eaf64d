use crate::aggregate::HourlyAggregateMerger;
use crate::config::{PipelineConfig, SensorCreationPolicy};
use crate::error::{IngestError, ValidationFailure};
use crate::model::{Sensor, SensorReadingMessage};
use crate::partition::{PartitionProvisioner, SettleDelay};
use crate::registry::DeviceRegistry;
use crate::store::SharedStore;
use crate::throttle::ThrottleEvaluator;
use crate::writer::RawReadingWriter;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// How a successfully handled message ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The raw reading was stored
    Recorded {
        /// Whether the hourly rollup had to be rewritten
        aggregate_updated: bool,
    },
    /// Dropped by the sample frequency limit
    Throttled,
}

/// Runs `write_sensor_reading` over a shared store.
///
/// ```text
/// validate ─▶ relay ─▶ sensor ─▶ throttle ─▶ raw reading ─▶ hourly rollup
/// ```
///
/// Validation failures end the message for good. A throttled reading is a
/// normal outcome, not an error.
pub struct ReadingPipeline {
    registry: DeviceRegistry,
    throttle: ThrottleEvaluator,
    writer: RawReadingWriter,
    merger: HourlyAggregateMerger,
    sensor_creation: SensorCreationPolicy,
}

impl ReadingPipeline {
    /// Create a new pipeline; the settle duration is parsed from `config` once here
    pub fn new(store: SharedStore, settle: Arc<dyn SettleDelay>, config: &PipelineConfig) -> Self {
        let provisioner = Arc::new(PartitionProvisioner::new(
            store.clone(),
            settle,
            config.partition_settle(),
        ));

        Self {
            registry: DeviceRegistry::new(store.clone()),
            throttle: ThrottleEvaluator::new(
                store.clone(),
                config.sample_frequency_tolerance_secs,
                config.throttle_fallback,
            ),
            writer: RawReadingWriter::new(provisioner.clone()),
            merger: HourlyAggregateMerger::new(
                store,
                provisioner,
                config.aggregate_conflict_retries,
            ),
            sensor_creation: config.sensor_creation,
        }
    }

    /// Validate, throttle and persist one reading message
    #[instrument(skip_all, fields(relay_id = %message.relay_id, sensor_id = %message.sensor_id))]
    pub async fn write_sensor_reading(
        &self,
        message: &SensorReadingMessage,
    ) -> Result<WriteOutcome, IngestError> {
        let started = Instant::now();
        let result = self.process(message).await;
        metrics::histogram!("readings.pipeline.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        match &result {
            Ok(WriteOutcome::Throttled) => {
                metrics::counter!("readings.messages.throttled").increment(1);
            }
            Ok(WriteOutcome::Recorded { .. }) => {
                metrics::counter!("readings.messages.recorded").increment(1);
            }
            Err(IngestError::Validation(reason)) => {
                info!(reason = %reason, "Rejected sensor reading");
                metrics::counter!("readings.messages.rejected").increment(1);
            }
            Err(_) => {}
        }

        result
    }

    async fn process(&self, message: &SensorReadingMessage) -> Result<WriteOutcome, IngestError> {
        if message.measurements.is_empty() {
            return Err(ValidationFailure::EmptyMeasurements.into());
        }
        let reading_time = message
            .reading_time()
            .ok_or(ValidationFailure::InvalidTimestamp(message.reading_timestamp))?;

        let relay = self.registry.get_relay(&message.relay_id).await?;
        if !relay.is_active() {
            return Err(ValidationFailure::RelayInactive {
                relay_id: relay.id,
                state: relay.state,
            }
            .into());
        }

        let sensor = match self.registry.get_sensor(&message.sensor_id).await? {
            Some(sensor) => sensor,
            None => self.create_sensor(&message.sensor_id, &relay.account_id).await?,
        };
        if sensor.account_id != relay.account_id {
            return Err(ValidationFailure::AccountMismatch {
                sensor_account: sensor.account_id,
                relay_account: relay.account_id,
            }
            .into());
        }

        if !self.throttle.should_evaluate(&reading_time, &sensor).await {
            return Ok(WriteOutcome::Throttled);
        }

        self.writer.record(message, &sensor, &reading_time).await?;
        let aggregate_updated = self.merger.merge_hourly(message, &sensor, &reading_time).await?;

        debug!(aggregate_updated, "Sensor reading stored");
        Ok(WriteOutcome::Recorded { aggregate_updated })
    }

    async fn create_sensor(&self, sensor_id: &str, account_id: &str) -> Result<Sensor, IngestError> {
        match self.registry.create_sensor(sensor_id, account_id).await {
            Ok(sensor) => Ok(sensor),
            Err(e) if self.sensor_creation == SensorCreationPolicy::Proceed => {
                warn!(error = %e.source, "Continuing with unpersisted sensor");
                Ok(e.sensor)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::model::{
        HourlyAggregate, Measurement, Relay, RELAYS_PARTITION, SENSORS_PARTITION,
    };
    use crate::partition::testing::RecordingSettle;
    use crate::store::{
        InMemoryStore, Item, ItemKey, KeySchema, MockPartitionStore, PartitionStore,
        WriteCondition,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    // 2024-01-15T10:00:00Z
    const T0: i64 = 1_705_312_800;

    fn relay(state: &str) -> Relay {
        Relay {
            id: "relay-1".to_string(),
            account_id: "acct-1".to_string(),
            name: "greenhouse".to_string(),
            state: state.to_string(),
        }
    }

    fn message(ts: i64, measurements: Vec<Measurement>) -> SensorReadingMessage {
        SensorReadingMessage {
            relay_id: "relay-1".to_string(),
            sensor_id: "sensor-1".to_string(),
            reading_timestamp: ts,
            reporting_timestamp: ts.saturating_add(2),
            measurements,
        }
    }

    fn temp(value: f64) -> Vec<Measurement> {
        vec![Measurement::new("temperature", value, "C")]
    }

    async fn store_with_relay(state: &str) -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new());
        store.put_item(RELAYS_PARTITION, relay(state).to_item()).await.unwrap();
        store
    }

    fn pipeline(store: SharedStore, settle: Arc<RecordingSettle>) -> ReadingPipeline {
        ReadingPipeline::new(store, settle, &PipelineConfig::default())
    }

    #[tokio::test]
    async fn test_empty_measurements_never_touch_the_store() {
        // No expectations: any store call panics
        let store = MockPartitionStore::new();
        let p = pipeline(Arc::new(store), Arc::new(RecordingSettle::default()));

        let err = assert_err!(p.write_sensor_reading(&message(T0, vec![])).await);
        assert!(matches!(
            err,
            IngestError::Validation(ValidationFailure::EmptyMeasurements)
        ));
    }

    #[tokio::test]
    async fn test_out_of_range_timestamp_is_rejected() {
        let store = MockPartitionStore::new();
        let p = pipeline(Arc::new(store), Arc::new(RecordingSettle::default()));

        let err = assert_err!(p.write_sensor_reading(&message(i64::MAX, temp(1.0))).await);
        assert!(matches!(
            err,
            IngestError::Validation(ValidationFailure::InvalidTimestamp(i64::MAX))
        ));
    }

    #[tokio::test]
    async fn test_unknown_relay_is_rejected() {
        let store = Arc::new(InMemoryStore::new());
        let p = pipeline(store, Arc::new(RecordingSettle::default()));

        let err = assert_err!(p.write_sensor_reading(&message(T0, temp(20.0))).await);
        assert!(!err.is_retryable());
        assert!(matches!(
            err,
            IngestError::Validation(ValidationFailure::RelayNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_inactive_relay_writes_nothing() {
        let store = store_with_relay("disabled").await;
        let p = pipeline(store.clone(), Arc::new(RecordingSettle::default()));

        let err = assert_err!(p.write_sensor_reading(&message(T0, temp(20.0))).await);
        assert!(matches!(
            err,
            IngestError::Validation(ValidationFailure::RelayInactive { ref state, .. }) if state == "disabled"
        ));
        assert_eq!(store.item_count(SENSORS_PARTITION).await, 0);
        assert_eq!(store.partition_names().await, vec!["relays", "sensors"]);
    }

    #[tokio::test]
    async fn test_account_mismatch_records_nothing() {
        let store = store_with_relay("active").await;
        store
            .put_item(
                SENSORS_PARTITION,
                Sensor::new_default("sensor-1", "acct-2").to_item(),
            )
            .await
            .unwrap();
        let p = pipeline(store.clone(), Arc::new(RecordingSettle::default()));

        let err = assert_err!(p.write_sensor_reading(&message(T0, temp(20.0))).await);
        assert!(matches!(
            err,
            IngestError::Validation(ValidationFailure::AccountMismatch { ref sensor_account, ref relay_account })
                if sensor_account == "acct-2" && relay_account == "acct-1"
        ));
        assert_eq!(store.item_count("readings_2024-01").await, 0);
        assert_eq!(store.item_count("hourly_readings_2024-01").await, 0);
    }

    #[tokio::test]
    async fn test_unseen_sensor_is_created_and_recorded() {
        let store = store_with_relay("active").await;
        let settle = Arc::new(RecordingSettle::default());
        let p = pipeline(store.clone(), settle.clone());

        let outcome = assert_ok!(p.write_sensor_reading(&message(T0 + 30, temp(20.0))).await);
        assert_eq!(outcome, WriteOutcome::Recorded { aggregate_updated: true });

        let sensor = store
            .get_item(SENSORS_PARTITION, &ItemKey::hash("sensor-1"))
            .await
            .unwrap()
            .map(|item| Sensor::from_item(&item).unwrap())
            .unwrap();
        assert_eq!(sensor.account_id, "acct-1");
        assert_eq!(sensor.sample_frequency, 60);
        assert_eq!(sensor.state, "active");

        // Both month partitions were provisioned
        assert_eq!(settle.calls(), vec![Duration::from_secs(30); 2]);
        assert_eq!(store.item_count("readings_2024-01").await, 1);
        assert_eq!(store.item_count("hourly_readings_2024-01").await, 1);
    }

    #[tokio::test]
    async fn test_same_message_twice_is_idempotent() {
        let store = store_with_relay("active").await;
        let p = pipeline(store.clone(), Arc::new(RecordingSettle::default()));
        let msg = message(T0 + 30, temp(20.0));

        assert_ok!(p.write_sensor_reading(&msg).await);
        let key = ItemKey::hash_range("acct-1:sensor-1", T0);
        let first = store.get_item("hourly_readings_2024-01", &key).await.unwrap();

        assert_eq!(
            assert_ok!(p.write_sensor_reading(&msg).await),
            WriteOutcome::Recorded { aggregate_updated: false }
        );
        let second = store.get_item("hourly_readings_2024-01", &key).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.item_count("readings_2024-01").await, 1);
        assert_eq!(store.item_count("hourly_readings_2024-01").await, 1);
        assert_eq!(store.item_count(SENSORS_PARTITION).await, 1);
    }

    #[tokio::test]
    async fn test_readings_through_an_hour() {
        let store = store_with_relay("active").await;
        let p = pipeline(store.clone(), Arc::new(RecordingSettle::default()));

        let outcomes = [
            (T0, 20.0, WriteOutcome::Recorded { aggregate_updated: true }),
            (T0 + 56, 30.0, WriteOutcome::Throttled),
            (T0 + 60, 15.0, WriteOutcome::Recorded { aggregate_updated: true }),
            (T0 + 120, 18.0, WriteOutcome::Recorded { aggregate_updated: false }),
        ];
        for (ts, value, expected) in outcomes {
            let outcome = assert_ok!(p.write_sensor_reading(&message(ts, temp(value))).await);
            assert_eq!(outcome, expected, "reading at +{}", ts - T0);
        }

        let item = store
            .get_item(
                "hourly_readings_2024-01",
                &ItemKey::hash_range("acct-1:sensor-1", T0),
            )
            .await
            .unwrap()
            .unwrap();
        let aggregate = HourlyAggregate::from_item(&item).unwrap();
        assert_eq!(aggregate.measurements[0].min.value, 15.0);
        assert_eq!(aggregate.measurements[0].max.value, 20.0);
        assert_eq!(aggregate.version, 2);
        assert_eq!(store.item_count("readings_2024-01").await, 3);
    }

    /// In-memory store whose first `failures` conditional writes time out
    struct FlakyAggregateStore {
        inner: InMemoryStore,
        failures: AtomicU32,
    }

    #[async_trait]
    impl PartitionStore for FlakyAggregateStore {
        async fn get_item(&self, partition: &str, key: &ItemKey) -> Result<Option<Item>, StoreError> {
            self.inner.get_item(partition, key).await
        }

        async fn put_item(&self, partition: &str, item: Item) -> Result<(), StoreError> {
            self.inner.put_item(partition, item).await
        }

        async fn put_item_conditional(
            &self,
            partition: &str,
            item: Item,
            condition: WriteCondition,
        ) -> Result<(), StoreError> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(StoreError::Backend("timeout".to_string()));
            }
            self.inner.put_item_conditional(partition, item, condition).await
        }

        async fn query(
            &self,
            partition: &str,
            id: &str,
            descending: bool,
            limit: usize,
        ) -> Result<Vec<Item>, StoreError> {
            self.inner.query(partition, id, descending, limit).await
        }

        async fn partition_exists(&self, name: &str) -> Result<bool, StoreError> {
            self.inner.partition_exists(name).await
        }

        async fn create_partition(&self, name: &str, schema: KeySchema) -> Result<(), StoreError> {
            self.inner.create_partition(name, schema).await
        }
    }

    #[tokio::test]
    async fn test_redelivery_after_failed_aggregate_completes_rollup() {
        let inner = InMemoryStore::new();
        inner.put_item(RELAYS_PARTITION, relay("active").to_item()).await.unwrap();
        // Initial write plus the retry after provisioning
        let store = Arc::new(FlakyAggregateStore {
            inner,
            failures: AtomicU32::new(2),
        });
        let p = pipeline(store.clone(), Arc::new(RecordingSettle::default()));
        let msg = message(T0 + 30, temp(20.0));

        let err = assert_err!(p.write_sensor_reading(&msg).await);
        assert!(matches!(err, IngestError::Store(StoreError::Backend(_))));
        assert!(err.is_retryable());
        assert_eq!(store.inner.item_count("readings_2024-01").await, 1);
        assert_eq!(store.inner.item_count("hourly_readings_2024-01").await, 0);

        let outcome = assert_ok!(p.write_sensor_reading(&msg).await);
        assert_eq!(outcome, WriteOutcome::Recorded { aggregate_updated: true });
        assert_eq!(store.inner.item_count("readings_2024-01").await, 1);

        let item = store
            .inner
            .get_item(
                "hourly_readings_2024-01",
                &ItemKey::hash_range("acct-1:sensor-1", T0),
            )
            .await
            .unwrap()
            .unwrap();
        let aggregate = HourlyAggregate::from_item(&item).unwrap();
        assert_eq!(aggregate.version, 1);
        assert_eq!(aggregate.measurements[0].max.value, 20.0);
    }

    /// Store whose sensor registration always fails but is otherwise healthy
    fn store_rejecting_sensor_writes() -> MockPartitionStore {
        let mut store = MockPartitionStore::new();
        store.expect_get_item().returning(|partition, _| match partition {
            RELAYS_PARTITION => Ok(Some(relay("active").to_item())),
            _ => Ok(None),
        });
        store.expect_put_item().returning(|partition, _| match partition {
            SENSORS_PARTITION => Err(StoreError::Backend("throughput exceeded".to_string())),
            _ => Ok(()),
        });
        store.expect_query().returning(|_, _, _, _| Ok(vec![]));
        store
            .expect_put_item_conditional()
            .returning(|_, _, _| Ok(()));
        store
    }

    #[tokio::test]
    async fn test_sensor_creation_failure_proceeds_by_default() {
        let p = pipeline(
            Arc::new(store_rejecting_sensor_writes()),
            Arc::new(RecordingSettle::default()),
        );

        let outcome = assert_ok!(p.write_sensor_reading(&message(T0, temp(20.0))).await);
        assert_eq!(outcome, WriteOutcome::Recorded { aggregate_updated: true });
    }

    #[tokio::test]
    async fn test_sensor_creation_failure_aborts_when_configured() {
        let config = PipelineConfig {
            sensor_creation: SensorCreationPolicy::Abort,
            ..PipelineConfig::default()
        };
        let p = ReadingPipeline::new(
            Arc::new(store_rejecting_sensor_writes()),
            Arc::new(RecordingSettle::default()),
            &config,
        );

        let err = assert_err!(p.write_sensor_reading(&message(T0, temp(20.0))).await);
        assert!(err.is_retryable());
        match err {
            IngestError::SensorNotPersisted(e) => assert_eq!(e.sensor.account_id, "acct-1"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
