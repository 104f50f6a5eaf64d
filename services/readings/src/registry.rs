use crate::error::{IngestError, StoreError, UnpersistedSensor, ValidationFailure};
use crate::model::{Relay, Sensor, RELAYS_PARTITION, SENSORS_PARTITION};
use crate::store::{ItemKey, SharedStore};
use tracing::{debug, info, instrument, warn};

/// Relay and sensor lookups against the `relays` and `sensors` partitions
pub struct DeviceRegistry {
    store: SharedStore,
}

impl DeviceRegistry {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Look up a relay, failing with `RelayNotFound` if there is none
    #[instrument(skip(self))]
    pub async fn get_relay(&self, relay_id: &str) -> Result<Relay, IngestError> {
        let item = self
            .store
            .get_item(RELAYS_PARTITION, &ItemKey::hash(relay_id))
            .await?
            .ok_or_else(|| ValidationFailure::RelayNotFound(relay_id.to_string()))?;

        Ok(Relay::from_item(&item)?)
    }

    /// Look up a sensor; `None` is the normal first-sighting case
    #[instrument(skip(self))]
    pub async fn get_sensor(&self, sensor_id: &str) -> Result<Option<Sensor>, StoreError> {
        let item = self
            .store
            .get_item(SENSORS_PARTITION, &ItemKey::hash(sensor_id))
            .await?;

        match item {
            Some(item) => Ok(Some(Sensor::from_item(&item)?)),
            None => {
                debug!(sensor_id, "Sensor not registered");
                Ok(None)
            }
        }
    }

    /// Register a sensor with default settings under `account_id`.
    ///
    /// On a failed write the error still carries the sensor so the caller
    /// can choose to carry on with it.
    #[instrument(skip(self))]
    pub async fn create_sensor(
        &self,
        sensor_id: &str,
        account_id: &str,
    ) -> Result<Sensor, UnpersistedSensor> {
        let sensor = Sensor::new_default(sensor_id, account_id);

        match self.store.put_item(SENSORS_PARTITION, sensor.to_item()).await {
            Ok(()) => {
                info!(sensor_id, account_id, "Registered new sensor");
                metrics::counter!("readings.sensors.created").increment(1);
                Ok(sensor)
            }
            Err(source) => {
                warn!(sensor_id, error = %source, "Encountered error adding new sensor");
                Err(UnpersistedSensor { sensor, source })
            }
        }
    }
}
