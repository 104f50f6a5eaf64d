//! Readings Ingestion Service
//!
//! Ingests periodic sensor readings from Kafka and persists them into a
//! month-sharded partition store. Every reading is checked against the
//! relay and sensor registry, rate limited per sensor, stored in full and
//! folded into an hourly min/max rollup.
//!
//! ## Features
//!
//! - **Registry Validation**: Only active relays may report, and a sensor
//!   must belong to the relay's account. Unseen sensors are registered on
//!   first sighting
//! - **Sample Frequency Throttle**: Readings arriving faster than a
//!   sensor's configured frequency are dropped
//! - **Lazy Partitions**: `readings_<YYYY-MM>` and `hourly_readings_<YYYY-MM>`
//!   are created on first use, followed by a settle wait
//! - **Hourly Rollups**: Idempotent min/max merge, written with
//!   compare-and-swap so concurrent consumers cannot lose an extremum
//!
//! ## Architecture
//!
//! ```text
//! Kafka Topic                                             Partition Store
//! ┌──────────────┐                                       ┌──────────────────┐
//! │ sensor.      │                                       │ relays           │
//! │ readings     │                                       │ sensors          │
//! └──────────────┘                                       │ readings_YYYY-MM │
//!        │                                               │ hourly_readings_ │
//!        ▼                                               │   YYYY-MM        │
//! ┌──────────────┐    ┌──────────────┐                   └──────────────────┘
//! │ Reading      │───▶│ Device       │──────────────────────────▲ ▲ ▲
//! │ Pipeline     │    │ Registry     │                          │ │ │
//! └──────────────┘    └──────────────┘                          │ │ │
//!        │            ┌──────────────┐                          │ │ │
//!        ├───────────▶│ Throttle     │──────────────────────────┘ │ │
//!        │            └──────────────┘                            │ │
//!        │            ┌──────────────┐    ┌──────────────┐        │ │
//!        ├───────────▶│ Raw Reading  │───▶│ Partition    │────────┘ │
//!        │            │ Writer       │    │ Provisioner  │          │
//!        │            └──────────────┘    └──────────────┘          │
//!        │            ┌──────────────┐           ▲                  │
//!        └───────────▶│ Hourly       │───────────┘──────────────────┘
//!                     │ Aggregates   │
//!                     └──────────────┘
//! ```

pub mod aggregate;
pub mod config;
pub mod error;
pub mod kafka_consumer;
pub mod model;
pub mod partition;
pub mod pipeline;
pub mod registry;
pub mod store;
pub mod throttle;
pub mod writer;

pub use aggregate::{merge_min_max, HourlyAggregateMerger, MergeOutcome};
pub use config::Config;
pub use error::{IngestError, StoreError, ValidationFailure};
pub use kafka_consumer::{Disposition, ReadingsKafkaConsumer};
pub use model::{Measurement, MinMaxMeasurement, Relay, Sensor, SensorReadingMessage};
pub use partition::{PartitionProvisioner, SettleDelay, TokioSettle};
pub use pipeline::{ReadingPipeline, WriteOutcome};
pub use store::{InMemoryStore, PartitionStore, PgPartitionStore, SharedStore};
