use crate::config::ThrottleFallback;
use crate::error::StoreError;
use crate::model::{readings_partition, Sensor};
use crate::store::SharedStore;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

/// Soft per-sensor rate limit.
///
/// A reading is dropped when it arrives sooner than the sensor's sample
/// frequency (less a small jitter tolerance) after the last recorded one.
/// Nothing is queued; early readings are simply not recorded.
pub struct ThrottleEvaluator {
    store: SharedStore,
    tolerance_secs: i64,
    fallback: ThrottleFallback,
}

impl ThrottleEvaluator {
    pub fn new(store: SharedStore, tolerance_secs: i64, fallback: ThrottleFallback) -> Self {
        Self {
            store,
            tolerance_secs,
            fallback,
        }
    }

    /// Decide whether a reading taken at `reading_time` should be recorded
    pub async fn should_evaluate(&self, reading_time: &DateTime<Utc>, sensor: &Sensor) -> bool {
        let last = match self.last_reading_timestamp(reading_time, sensor).await {
            Ok(last) => last,
            Err(e) => {
                let proceed = self.fallback == ThrottleFallback::FailOpen;
                warn!(
                    sensor_id = %sensor.id,
                    error = %e,
                    proceed,
                    "Error while looking up timestamp of last reading for sensor"
                );
                return proceed;
            }
        };

        let Some(last) = last else {
            return true;
        };

        // Same reading seen again: the raw row is ours, finish the rest of the write
        if last == reading_time.timestamp() {
            debug!(sensor_id = %sensor.id, "Reading already recorded, replaying");
            return true;
        }

        let elapsed = reading_time.timestamp().saturating_sub(last);
        debug!(sensor_id = %sensor.id, elapsed, "Seconds since last reading was written");

        if is_too_soon(elapsed, sensor.sample_frequency, self.tolerance_secs) {
            info!(
                sensor_id = %sensor.id,
                sample_frequency = sensor.sample_frequency,
                elapsed,
                "Ignoring reading due to sample frequency limit"
            );
            return false;
        }
        true
    }

    /// Timestamp of the newest recorded reading in the reading's month partition
    pub async fn last_reading_timestamp(
        &self,
        reading_time: &DateTime<Utc>,
        sensor: &Sensor,
    ) -> Result<Option<i64>, StoreError> {
        let partition = readings_partition(reading_time);
        let items = self
            .store
            .query(&partition, &sensor.reading_key(), true, 1)
            .await?;

        Ok(items.first().and_then(|item| item.key.timestamp))
    }
}

/// `elapsed < sample_frequency - tolerance`; the boundary itself is allowed through
fn is_too_soon(elapsed: i64, sample_frequency: i64, tolerance: i64) -> bool {
    elapsed < sample_frequency.saturating_sub(tolerance)
}
