use crate::error::StoreError;
use crate::store::{Item, ItemKey};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Partition holding one row per relay
pub const RELAYS_PARTITION: &str = "relays";
/// Partition holding one row per sensor
pub const SENSORS_PARTITION: &str = "sensors";

/// State value for relays and sensors allowed to report
pub const ACTIVE_STATE: &str = "active";
/// Sample frequency assumed for new sensors and rows without one
pub const DEFAULT_SAMPLE_FREQUENCY_SECS: i64 = 60;

const SECONDS_PER_HOUR: i64 = 3600;

/// A physical reporting device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relay {
    pub id: String,
    pub account_id: String,
    pub name: String,
    pub state: String,
}

impl Relay {
    pub fn is_active(&self) -> bool {
        self.state == ACTIVE_STATE
    }

    pub fn from_item(item: &Item) -> Result<Self, StoreError> {
        Ok(Self {
            id: item.key.id.clone(),
            account_id: item.str_attr("account_id")?.to_string(),
            name: item.str_attr("name")?.to_string(),
            state: item.str_attr("state")?.to_string(),
        })
    }

    pub fn to_item(&self) -> Item {
        Item::new(ItemKey::hash(&self.id))
            .with("account_id", self.account_id.as_str())
            .with("name", self.name.as_str())
            .with("state", self.state.as_str())
    }
}

/// A measurement source bound to one account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sensor {
    pub id: String,
    pub account_id: String,
    pub name: String,
    pub state: String,
    /// Minimum seconds between recorded readings
    pub sample_frequency: i64,
    pub location_enabled: bool,
    #[serde(default)]
    pub latitude: f64,
    #[serde(default)]
    pub longitude: f64,
}

impl Sensor {
    /// Sensor as registered on first sighting
    pub fn new_default(id: impl Into<String>, account_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            account_id: account_id.into(),
            name: " ".to_string(),
            state: ACTIVE_STATE.to_string(),
            sample_frequency: DEFAULT_SAMPLE_FREQUENCY_SECS,
            location_enabled: false,
            latitude: 0.0,
            longitude: 0.0,
        }
    }

    /// Key shared by this sensor's readings and aggregates: `account_id:sensor_id`
    pub fn reading_key(&self) -> String {
        format!("{}:{}", self.account_id, self.id)
    }

    /// Coordinates to attach to readings, if any.
    ///
    /// A zero latitude or longitude counts as unset.
    pub fn location(&self) -> Option<(f64, f64)> {
        if self.location_enabled && self.latitude != 0.0 && self.longitude != 0.0 {
            Some((self.latitude, self.longitude))
        } else {
            None
        }
    }

    pub fn from_item(item: &Item) -> Result<Self, StoreError> {
        let (latitude, longitude) = match (item.opt_f64("latitude"), item.opt_f64("longitude")) {
            (Some(lat), Some(lon)) => (lat, lon),
            _ => (0.0, 0.0),
        };

        Ok(Self {
            id: item.key.id.clone(),
            account_id: item.str_attr("account_id")?.to_string(),
            name: item.str_attr("name")?.to_string(),
            state: item.str_attr("state")?.to_string(),
            sample_frequency: item
                .opt_i64("sample_frequency")
                .unwrap_or(DEFAULT_SAMPLE_FREQUENCY_SECS),
            location_enabled: item.opt_bool("location_enabled").unwrap_or(false),
            latitude,
            longitude,
        })
    }

    pub fn to_item(&self) -> Item {
        let item = Item::new(ItemKey::hash(&self.id))
            .with("account_id", self.account_id.as_str())
            .with("name", self.name.as_str())
            .with("state", self.state.as_str())
            .with("sample_frequency", self.sample_frequency)
            .with("location_enabled", self.location_enabled);

        match self.location() {
            Some((lat, lon)) => item.with("latitude", lat).with("longitude", lon),
            None => item,
        }
    }
}

/// One named scalar reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub name: String,
    pub value: f64,
    pub unit: String,
}

impl Measurement {
    pub fn new(name: impl Into<String>, value: f64, unit: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value,
            unit: unit.into(),
        }
    }
}

/// Rolling extrema for one measurement name within an hour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinMaxMeasurement {
    pub name: String,
    pub min: Measurement,
    pub max: Measurement,
}

impl MinMaxMeasurement {
    /// Entry whose min and max are both `m`
    pub fn seed(m: &Measurement) -> Self {
        Self {
            name: m.name.clone(),
            min: m.clone(),
            max: m.clone(),
        }
    }
}

/// Sensor reading message as delivered on the queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReadingMessage {
    pub relay_id: String,
    pub sensor_id: String,
    /// When the sensor took the reading (epoch seconds)
    pub reading_timestamp: i64,
    /// When the relay forwarded it (epoch seconds)
    pub reporting_timestamp: i64,
    #[serde(default)]
    pub measurements: Vec<Measurement>,
}

impl SensorReadingMessage {
    /// Reading time as a UTC instant, `None` when out of range
    pub fn reading_time(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.reading_timestamp, 0).single()
    }
}

/// Name of the raw readings partition for the month of `at`
pub fn readings_partition(at: &DateTime<Utc>) -> String {
    format!("readings_{}", at.format("%Y-%m"))
}

/// Name of the hourly aggregates partition for the month of `at`
pub fn hourly_partition(at: &DateTime<Utc>) -> String {
    format!("hourly_readings_{}", at.format("%Y-%m"))
}

/// Start of the hour containing `at`, as epoch seconds
pub fn hour_bucket(at: &DateTime<Utc>) -> i64 {
    let ts = at.timestamp();
    ts - ts.rem_euclid(SECONDS_PER_HOUR)
}

/// Full reading as persisted in `readings_<YYYY-MM>`
#[derive(Debug, Clone, PartialEq)]
pub struct RawReadingRecord {
    pub account_id: String,
    pub sensor_id: String,
    pub relay_id: String,
    pub reading_timestamp: i64,
    pub measurements: Vec<Measurement>,
    pub location: Option<(f64, f64)>,
}

impl RawReadingRecord {
    pub fn new(message: &SensorReadingMessage, sensor: &Sensor, reading_timestamp: i64) -> Self {
        Self {
            account_id: sensor.account_id.clone(),
            sensor_id: sensor.id.clone(),
            relay_id: message.relay_id.clone(),
            reading_timestamp,
            measurements: message.measurements.clone(),
            location: sensor.location(),
        }
    }

    pub fn to_item(&self) -> Result<Item, serde_json::Error> {
        let measurements = serde_json::to_string(&self.measurements)?;
        let item = Item::new(ItemKey::hash_range(
            format!("{}:{}", self.account_id, self.sensor_id),
            self.reading_timestamp,
        ))
        .with("account_id", self.account_id.as_str())
        .with("relay_id", self.relay_id.as_str())
        .with("sensor_id", self.sensor_id.as_str())
        .with("measurements", measurements);

        Ok(match self.location {
            Some((lat, lon)) => item.with("latitude", lat).with("longitude", lon),
            None => item,
        })
    }
}

/// Per-sensor min/max rollup for one hour
#[derive(Debug, Clone, PartialEq)]
pub struct HourlyAggregate {
    pub account_id: String,
    pub sensor_id: String,
    pub hour_bucket: i64,
    pub measurements: Vec<MinMaxMeasurement>,
    /// Write counter used for compare-and-swap
    pub version: u64,
}

impl HourlyAggregate {
    /// Read the rollup back from a stored item
    pub fn from_item(item: &Item) -> Result<Self, crate::error::IngestError> {
        let measurements = serde_json::from_str(item.str_attr("measurements")?)?;
        Ok(Self {
            account_id: item.str_attr("account_id")?.to_string(),
            sensor_id: item.str_attr("sensor_id")?.to_string(),
            hour_bucket: item.key.timestamp.unwrap_or_default(),
            measurements,
            version: item.version(),
        })
    }

    pub fn to_item(&self) -> Result<Item, serde_json::Error> {
        let measurements = serde_json::to_string(&self.measurements)?;
        Ok(Item::new(ItemKey::hash_range(
            format!("{}:{}", self.account_id, self.sensor_id),
            self.hour_bucket,
        ))
        .with("account_id", self.account_id.as_str())
        .with("sensor_id", self.sensor_id.as_str())
        .with("measurements", measurements)
        .with(crate::store::VERSION_ATTRIBUTE, self.version))
    }
}
