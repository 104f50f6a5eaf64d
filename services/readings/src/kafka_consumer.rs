use crate::config::KafkaConfig;
use crate::error::IngestError;
use crate::model::SensorReadingMessage;
use crate::pipeline::{ReadingPipeline, WriteOutcome};
use anyhow::{Context, Result};
use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::Offset;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Timeout for seeking back to a failed offset
const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// What to do with a message's offset once it has been handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Done with this message, success or not
    Commit,
    /// Deliver the same message again after a backoff
    Redeliver,
}

impl Disposition {
    /// Commit unless the failure could go away on another attempt
    pub fn for_result(result: &Result<WriteOutcome, IngestError>) -> Self {
        match result {
            Err(e) if e.is_retryable() => Disposition::Redeliver,
            _ => Disposition::Commit,
        }
    }
}

/// Decode a queue payload into a reading message
pub fn decode_message(payload: &[u8]) -> Result<SensorReadingMessage, serde_json::Error> {
    serde_json::from_slice(payload)
}

/// Kafka consumer feeding sensor readings into the pipeline
pub struct ReadingsKafkaConsumer {
    consumer: StreamConsumer,
    pipeline: Arc<ReadingPipeline>,
    retry_backoff: Duration,
}

impl ReadingsKafkaConsumer {
    /// Create a new Kafka consumer for sensor readings
    pub async fn new(config: &KafkaConfig, pipeline: Arc<ReadingPipeline>) -> Result<Self> {
        let mut client_config = ClientConfig::new();

        client_config
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("group.id", &config.consumer_group)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.auto.commit", "false")
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .set("max.poll.interval.ms", config.max_poll_interval_ms.to_string());

        // Configure SSL if enabled
        if config.ssl_enabled {
            client_config.set("security.protocol", "SASL_SSL");
            if let Some(ref ca_location) = config.ssl_ca_location {
                client_config.set("ssl.ca.location", ca_location);
            }
        }

        // Configure SASL if credentials provided
        if let (Some(ref username), Some(ref password)) =
            (&config.sasl_username, &config.sasl_password)
        {
            client_config
                .set("sasl.mechanisms", "PLAIN")
                .set("sasl.username", username)
                .set("sasl.password", password);
        }

        let consumer: StreamConsumer = client_config
            .create()
            .context("Failed to create Kafka consumer")?;

        consumer
            .subscribe(&[&config.readings_topic])
            .context("Failed to subscribe to readings topic")?;

        info!(
            topic = %config.readings_topic,
            group = %config.consumer_group,
            "Subscribed to Kafka topic"
        );

        Ok(Self {
            consumer,
            pipeline,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        })
    }

    /// Consume until `shutdown` is cancelled or the stream ends
    #[instrument(skip_all)]
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!("Starting readings Kafka consumer");

        let mut message_stream = self.consumer.stream();

        loop {
            let message_result = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, stopping consumer");
                    break;
                }
                next = message_stream.next() => match next {
                    Some(result) => result,
                    None => break,
                },
            };

            match message_result {
                Ok(message) => match self.process_message(&message).await {
                    Disposition::Commit => {
                        if let Err(e) = self.consumer.commit_message(&message, CommitMode::Async) {
                            warn!(error = %e, "Failed to commit offset");
                        }
                    }
                    Disposition::Redeliver => {
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(self.retry_backoff) => {}
                        }
                        if let Err(e) = self.consumer.seek(
                            message.topic(),
                            message.partition(),
                            Offset::Offset(message.offset()),
                            SEEK_TIMEOUT,
                        ) {
                            error!(
                                error = %e,
                                partition = message.partition(),
                                offset = message.offset(),
                                "Failed to rewind to failed message"
                            );
                        }
                    }
                },
                Err(e) => {
                    error!(error = %e, "Kafka consumer error");
                    metrics::counter!("readings.kafka.errors").increment(1);
                }
            }
        }

        Ok(())
    }

    /// Process a single Kafka message
    #[instrument(skip(self, message), fields(partition = message.partition(), offset = message.offset()))]
    async fn process_message(&self, message: &BorrowedMessage<'_>) -> Disposition {
        let Some(payload) = message.payload() else {
            warn!("Message has no payload, skipping");
            metrics::counter!("readings.messages.undecodable").increment(1);
            return Disposition::Commit;
        };

        let reading = match decode_message(payload) {
            Ok(reading) => reading,
            Err(e) => {
                warn!(error = %e, "Failed to deserialize sensor reading message, skipping");
                metrics::counter!("readings.messages.undecodable").increment(1);
                return Disposition::Commit;
            }
        };

        debug!(
            relay_id = %reading.relay_id,
            sensor_id = %reading.sensor_id,
            reading_timestamp = reading.reading_timestamp,
            "Received sensor reading"
        );

        let result = self.pipeline.write_sensor_reading(&reading).await;
        let disposition = Disposition::for_result(&result);

        match &result {
            Ok(outcome) => {
                debug!(outcome = ?outcome, "Sensor reading processed");
                metrics::counter!("readings.messages.processed").increment(1);
            }
            Err(e) => {
                error!(
                    error = %e,
                    relay_id = %reading.relay_id,
                    sensor_id = %reading.sensor_id,
                    disposition = ?disposition,
                    "Failed to process sensor reading"
                );
                metrics::counter!("readings.messages.failed").increment(1);
            }
        }

        disposition
    }
}
