use anyhow::{Context, Result};
use readings_service::config::{Config, StoreBackend};
use readings_service::{
    InMemoryStore, PgPartitionStore, ReadingPipeline, ReadingsKafkaConsumer, SharedStore,
    TokioSettle,
};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting Readings Ingestion Service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let store = init_store(&config).await?;

    let pipeline = Arc::new(ReadingPipeline::new(
        store,
        Arc::new(TokioSettle),
        &config.pipeline,
    ));

    // Create Kafka consumer
    let kafka_consumer = ReadingsKafkaConsumer::new(&config.kafka, pipeline)
        .await
        .context("Failed to initialize Kafka consumer")?;

    let shutdown = CancellationToken::new();

    // Spawn Kafka consumer task
    let consumer_shutdown = shutdown.clone();
    let consumer_handle = tokio::spawn(async move {
        if let Err(e) = kafka_consumer.run(consumer_shutdown).await {
            error!(error = %e, "Kafka consumer error");
        }
    });

    info!("Readings service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down readings service");

    shutdown.cancel();
    if let Err(e) = consumer_handle.await {
        error!(error = %e, "Kafka consumer task panicked");
    }

    info!("Readings service stopped");

    Ok(())
}

/// Build the configured partition store
async fn init_store(config: &Config) -> Result<SharedStore> {
    match config.store.backend {
        StoreBackend::Memory => {
            warn!("Using in-memory store, readings will not survive a restart");
            Ok(Arc::new(InMemoryStore::new()))
        }
        StoreBackend::Postgres => {
            let database = config
                .store
                .database
                .as_ref()
                .context("store.database must be set for the postgres backend")?;

            let store = PgPartitionStore::new(database)
                .await
                .context("Failed to initialize partition store")?;

            // Run migrations if enabled
            if database.run_migrations {
                store
                    .run_migrations()
                    .await
                    .context("Failed to run database migrations")?;
            }

            Ok(Arc::new(store))
        }
    }
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
