use std::net::SocketAddr;
use std::sync::Arc;

use event_bus::{EventBus, InMemoryBus, NatsBus};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

use callback_delivery::config::{BusType, Config};
use callback_delivery::error::CallbackError;
use callback_delivery::sender::Sender;
use callback_delivery::store::Store;
use callback_delivery::{health, ingestor, metrics, processor, producer};

/// Logs a fatal startup error and exits non-zero. Diverges, so it can be
/// used anywhere a value of another type is expected.
fn fatal(err: CallbackError) -> ! {
    tracing::error!(error = %err, "fatal startup error");
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env().unwrap_or_else(|e| fatal(e));
    metrics::init();

    tracing::info!("connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .unwrap_or_else(|e| fatal(CallbackError::Fatal(format!("failed to connect to database: {e}"))));

    tracing::info!("running migrations...");
    if let Err(e) = sqlx::migrate!("./db/migrations").run(&pool).await {
        fatal(CallbackError::Fatal(format!("failed to run migrations: {e}")));
    }

    let store = Store::new(pool);

    let bus: Arc<dyn EventBus> = match config.bus_type {
        BusType::InMemory => {
            tracing::info!("using InMemory event bus");
            Arc::new(InMemoryBus::new())
        }
        BusType::Nats => {
            tracing::info!(url = %config.nats_url, "connecting to NATS");
            let client = async_nats::connect(&config.nats_url)
                .await
                .unwrap_or_else(|e| fatal(CallbackError::Fatal(format!("failed to connect to NATS: {e}"))));
            Arc::new(NatsBus::new(client))
        }
    };

    let sender = Sender::new(config.callback_timeout_ms);

    // Shutdown is a single watch channel, cloned into every long-running
    // task before the original is consumed. Ctrl-C flips it once; each
    // task stops accepting new work and drains what it already admitted.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    // Event ingestor (C3): payment-events -> callback_message rows.
    let ingestor_handle = {
        let bus = bus.clone();
        let store = store.clone();
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            ingestor::run(bus, store, shutdown_rx).await;
        })
    };

    // Delivery processor (C5): consumes callback-messages, performs the send.
    let processor_handle = {
        let bus = bus.clone();
        let store = store.clone();
        let sender = sender.clone();
        let shutdown_rx = shutdown_rx.clone();
        let processor_config = processor::ProcessorConfig {
            parallelism: config.parallelism,
            max_delivery_attempts: config.max_delivery_attempts,
            delivery_retry_delay_ms: config.delivery_retry_delay_ms,
        };
        tokio::spawn(async move {
            processor::run(bus, store, sender, processor_config, shutdown_rx).await;
        })
    };

    // Outbox producer (C4): polls due rows, publishes to callback-messages.
    let mut health_shutdown_rx = shutdown_rx.clone();
    let producer_handle = {
        let bus = bus.clone();
        let store = store.clone();
        let producer_config = producer::ProducerConfig {
            polling_interval_ms: config.polling_interval_ms,
            fetch_size: config.fetch_size,
            publish_retry_delay_ms: config.publish_retry_delay_ms,
            max_publish_attempts: config.max_publish_attempts,
        };
        tokio::spawn(async move {
            producer::run(store, bus, producer_config, shutdown_rx).await;
        })
    };

    let app = health::router();
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .unwrap_or_else(|e| fatal(CallbackError::Fatal(format!("invalid HOST/PORT: {e}"))));

    tracing::info!(%addr, "callback-delivery listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .unwrap_or_else(|e| fatal(CallbackError::Fatal(format!("failed to bind {addr}: {e}"))));

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = health_shutdown_rx.changed().await;
            tracing::info!("liveness endpoint shutting down");
        })
        .await
    {
        fatal(CallbackError::Fatal(format!("server failed to start: {e}")));
    }

    // Ctrl-C has already been signaled by the time the liveness server
    // exits; wait for the pipeline tasks to drain their in-flight work
    // before letting the process exit.
    let _ = tokio::join!(ingestor_handle, processor_handle, producer_handle);

    tracing::info!("callback-delivery shut down cleanly");
}
