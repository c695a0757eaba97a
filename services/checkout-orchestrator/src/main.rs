use std::net::SocketAddr;
use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

use common::telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};
use common::Config;
use messaging::{BusPublisher, InMemoryBus, KafkaPublisher};
use pricing::PricingClient;
use saga::{
    InMemorySagaStore, PostgresSagaStore, PublishRetryPolicy, SagaCoordinator, SagaEngine,
    SagaStore,
};

mod consumer_loop;
mod handlers;
mod reaper;
mod routes;
mod state;

use consumer_loop::ConsumerLoop;
use reaper::Reaper;
use state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    let enable_jaeger = std::env::var("ENABLE_JAEGER")
        .unwrap_or_else(|_| "false".to_string())
        .parse()
        .unwrap_or(false);

    let telemetry_config = TelemetryConfig {
        service_name: "checkout-orchestrator".to_string(),
        log_level: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        jaeger_endpoint: std::env::var("JAEGER_ENDPOINT").ok(),
        enable_jaeger,
    };
    init_telemetry(telemetry_config)?;

    info!("Starting checkout orchestrator...");

    // Missing pricing URLs abort startup here, before anything connects.
    let config = Config::from_env()?;

    let store: Arc<dyn SagaStore> = if config.use_in_memory_db {
        info!("Using in-memory saga store");
        Arc::new(InMemorySagaStore::new())
    } else {
        info!("Connecting to PostgreSQL");
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.database_url)
            .await?;
        Arc::new(PostgresSagaStore::new(pool))
    };
    store.bootstrap().await?;

    let publisher: Arc<dyn BusPublisher> = if config.mock_kafka {
        info!("Kafka is mocked, publishing to in-memory bus");
        Arc::new(InMemoryBus::new())
    } else {
        info!("Connecting to Kafka at {}", config.kafka_bootstrap_servers);
        Arc::new(KafkaPublisher::new(&config.kafka_bootstrap_servers)?)
    };

    let pricing = Arc::new(PricingClient::new(
        &config.discount_engine_url,
        &config.tax_engine_url,
    )?);
    let engine = SagaEngine::new(pricing, config.pricing_max_attempts);
    let retry = PublishRetryPolicy {
        max_attempts: config.publish_max_attempts,
        base_backoff: config.publish_base_backoff,
    };
    let coordinator = Arc::new(SagaCoordinator::new(
        store.clone(),
        publisher.clone(),
        engine,
        retry,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers = Vec::new();

    if config.mock_kafka {
        info!("Kafka consumer is mocked, skipping startup");
    } else {
        let consumer = ConsumerLoop::new(
            &config.kafka_bootstrap_servers,
            coordinator.clone(),
            shutdown_rx.clone(),
        )?;
        workers.push(tokio::spawn(consumer.run()));
    }

    let reaper = Reaper::new(
        store.clone(),
        publisher.clone(),
        config.reaper_interval,
        config.stage_timeout,
        shutdown_rx.clone(),
    );
    workers.push(tokio::spawn(reaper.run()));

    let port = config.port;
    let app_state = AppState {
        coordinator,
        config: Arc::new(config),
    };
    let app = routes::build_router(app_state).layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Checkout orchestrator listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    // Stop background workers between messages, then wait for them.
    let _ = shutdown_tx.send(true);
    for worker in workers {
        let _ = worker.await;
    }

    shutdown_telemetry();
    info!("Checkout orchestrator stopped");

    Ok(())
}
