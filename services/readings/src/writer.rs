use crate::error::IngestError;
use crate::model::{readings_partition, RawReadingRecord, Sensor, SensorReadingMessage};
use crate::partition::PartitionProvisioner;
use crate::store::KeySchema;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Persists full readings into `readings_<YYYY-MM>`
pub struct RawReadingWriter {
    provisioner: Arc<PartitionProvisioner>,
}

impl RawReadingWriter {
    pub fn new(provisioner: Arc<PartitionProvisioner>) -> Self {
        Self { provisioner }
    }

    /// Write the reading, creating the month partition on first use
    #[instrument(skip_all, fields(sensor_id = %sensor.id, reading_timestamp = reading_time.timestamp()))]
    pub async fn record(
        &self,
        message: &SensorReadingMessage,
        sensor: &Sensor,
        reading_time: &DateTime<Utc>,
    ) -> Result<(), IngestError> {
        let partition = readings_partition(reading_time);
        let item = RawReadingRecord::new(message, sensor, reading_time.timestamp()).to_item()?;

        self.provisioner
            .put_with_provisioning(&partition, KeySchema::HashRange, item)
            .await?;

        debug!(partition = %partition, "Recorded sensor reading");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Measurement;
    use crate::partition::testing::RecordingSettle;
    use crate::store::{InMemoryStore, ItemKey, PartitionStore};
    use chrono::TimeZone;
    use std::time::Duration;

    fn message(ts: i64) -> SensorReadingMessage {
        SensorReadingMessage {
            relay_id: "relay-1".to_string(),
            sensor_id: "sensor-1".to_string(),
            reading_timestamp: ts,
            reporting_timestamp: ts + 5,
            measurements: vec![Measurement::new("temperature", 18.25, "C")],
        }
    }

    #[tokio::test]
    async fn test_first_write_of_month_provisions_partition() {
        let store = Arc::new(InMemoryStore::new());
        let settle = Arc::new(RecordingSettle::default());
        let provisioner = Arc::new(PartitionProvisioner::new(
            store.clone(),
            settle.clone(),
            Duration::from_secs(30),
        ));
        let writer = RawReadingWriter::new(provisioner);
        let sensor = Sensor::new_default("sensor-1", "acct-1");

        // 2024-02-29T12:00:00Z, reported after midnight on the 1st
        let msg = SensorReadingMessage {
            reporting_timestamp: 1_709_251_300,
            ..message(1_709_208_000)
        };
        let when = Utc.timestamp_opt(msg.reading_timestamp, 0).unwrap();
        writer.record(&msg, &sensor, &when).await.unwrap();

        assert_eq!(settle.calls(), vec![Duration::from_secs(30)]);
        let stored = store
            .get_item("readings_2024-02", &ItemKey::hash_range("acct-1:sensor-1", 1_709_208_000))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.str_attr("relay_id").unwrap(), "relay-1");
        assert!(stored.get("latitude").is_none());

        // Second write goes straight through
        let next = message(1_709_208_060);
        let when = Utc.timestamp_opt(next.reading_timestamp, 0).unwrap();
        writer.record(&next, &sensor, &when).await.unwrap();
        assert_eq!(settle.calls().len(), 1);
        assert_eq!(store.item_count("readings_2024-02").await, 2);
    }
}
