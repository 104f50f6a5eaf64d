use crate::error::{IngestError, StoreError};
use crate::model::{
    hour_bucket, hourly_partition, HourlyAggregate, Measurement, MinMaxMeasurement, Sensor,
    SensorReadingMessage,
};
use crate::partition::{PartitionProvisioner, Provisioned};
use crate::store::{Item, ItemKey, KeySchema, SharedStore, WriteCondition};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Result of merging a reading into an hour's extrema
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub measurements: Vec<MinMaxMeasurement>,
    /// Whether the merged set differs from what was stored
    pub dirty: bool,
}

/// Merge `incoming` into the stored extrema.
///
/// Names missing from `incoming` are carried over untouched. Matching names
/// are rebuilt from the incoming name and unit with the widened min/max.
/// New names are seeded with `min = max = value`. With no stored row every
/// incoming measurement is seeded and the result is always dirty.
pub fn merge_min_max(
    existing: Option<&[MinMaxMeasurement]>,
    incoming: &[Measurement],
) -> MergeOutcome {
    let Some(existing) = existing else {
        return MergeOutcome {
            measurements: incoming.iter().map(MinMaxMeasurement::seed).collect(),
            dirty: true,
        };
    };

    let mut merged: Vec<MinMaxMeasurement> = existing
        .iter()
        .filter(|entry| !incoming.iter().any(|m| m.name == entry.name))
        .cloned()
        .collect();
    let mut dirty = false;

    for m in incoming {
        match existing.iter().find(|entry| entry.name == m.name) {
            Some(entry) => {
                let mut min = entry.min.value;
                if m.value < min {
                    min = m.value;
                    dirty = true;
                }
                let mut max = entry.max.value;
                if m.value > max {
                    max = m.value;
                    dirty = true;
                }

                merged.push(MinMaxMeasurement {
                    name: m.name.clone(),
                    min: Measurement::new(m.name.as_str(), min, m.unit.as_str()),
                    max: Measurement::new(m.name.as_str(), max, m.unit.as_str()),
                });
            }
            None => {
                dirty = true;
                merged.push(MinMaxMeasurement::seed(m));
            }
        }
    }

    MergeOutcome {
        measurements: merged,
        dirty,
    }
}

/// Maintains the per-sensor hourly rollup.
///
/// One row per sensor and hour in `hourly_readings_<YYYY-MM>`, rewritten
/// wholesale only when a reading moves an extremum or adds a name. Writes
/// are compare-and-swap on the row's `version`: the loser of a race
/// re-reads, re-merges and tries again, up to the configured retry budget.
pub struct HourlyAggregateMerger {
    store: SharedStore,
    provisioner: Arc<PartitionProvisioner>,
    conflict_retries: u32,
}

impl HourlyAggregateMerger {
    pub fn new(
        store: SharedStore,
        provisioner: Arc<PartitionProvisioner>,
        conflict_retries: u32,
    ) -> Self {
        Self {
            store,
            provisioner,
            conflict_retries,
        }
    }

    /// Fold the message's measurements into the sensor's rollup for the hour
    /// of `reading_time`. Returns whether the row was written.
    #[instrument(skip_all, fields(sensor_id = %sensor.id, reading_timestamp = reading_time.timestamp()))]
    pub async fn merge_hourly(
        &self,
        message: &SensorReadingMessage,
        sensor: &Sensor,
        reading_time: &DateTime<Utc>,
    ) -> Result<bool, IngestError> {
        let partition = hourly_partition(reading_time);
        let bucket = hour_bucket(reading_time);
        let key = ItemKey::hash_range(sensor.reading_key(), bucket);

        let mut attempt = 0;
        loop {
            attempt += 1;

            let existing = self.load(&partition, &key).await?;
            let outcome = merge_min_max(
                existing.as_ref().map(|a| a.measurements.as_slice()),
                &message.measurements,
            );

            if !outcome.dirty {
                debug!(partition = %partition, hour_bucket = bucket, "Hourly aggregate unchanged");
                return Ok(false);
            }

            let (condition, version) = match &existing {
                Some(current) => (WriteCondition::VersionEquals(current.version), current.version + 1),
                None => (WriteCondition::NotExists, 1),
            };
            let item = HourlyAggregate {
                account_id: sensor.account_id.clone(),
                sensor_id: sensor.id.clone(),
                hour_bucket: bucket,
                measurements: outcome.measurements,
                version,
            }
            .to_item()?;

            match self.write(&partition, item, condition).await {
                Ok(()) => {
                    debug!(partition = %partition, hour_bucket = bucket, version, "Hourly aggregate written");
                    metrics::counter!("readings.aggregates.written").increment(1);
                    return Ok(true);
                }
                Err(StoreError::ConditionFailed) => {
                    metrics::counter!("readings.aggregates.conflicts").increment(1);
                    if attempt > self.conflict_retries {
                        return Err(IngestError::AggregateConflict { attempts: attempt });
                    }
                    warn!(
                        partition = %partition,
                        hour_bucket = bucket,
                        attempt,
                        "Hourly aggregate changed concurrently, re-merging"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Read the current rollup; a partition that had to be created is empty
    async fn load(
        &self,
        partition: &str,
        key: &ItemKey,
    ) -> Result<Option<HourlyAggregate>, IngestError> {
        let item = match self.store.get_item(partition, key).await {
            Ok(item) => item,
            Err(e) => {
                warn!(partition, error = %e, "Hourly aggregate lookup failed, checking partition");
                match self
                    .provisioner
                    .ensure_partition(partition, KeySchema::HashRange)
                    .await?
                {
                    Provisioned::Created => return Ok(None),
                    Provisioned::AlreadyExisted => self.store.get_item(partition, key).await?,
                }
            }
        };

        item.map(|item| HourlyAggregate::from_item(&item)).transpose()
    }

    /// Conditional write with one provision-and-retry on store failure
    async fn write(
        &self,
        partition: &str,
        item: Item,
        condition: WriteCondition,
    ) -> Result<(), StoreError> {
        let retry = item.clone();
        match self
            .store
            .put_item_conditional(partition, item, condition)
            .await
        {
            Err(StoreError::ConditionFailed) => Err(StoreError::ConditionFailed),
            Err(e) => {
                warn!(partition, error = %e, "Error while saving hourly aggregate, checking partition");
                self.provisioner
                    .ensure_partition(partition, KeySchema::HashRange)
                    .await?;
                self.store
                    .put_item_conditional(partition, retry, condition)
                    .await
            }
            Ok(()) => Ok(()),
        }
    }
}
