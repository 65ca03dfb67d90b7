//! Reservation service binary.
//!
//! Wires the lease store, the durable shadow, the workflow consumers, and
//! the expiry reconciler; runs until SIGINT/SIGTERM.

use boxoffice::consumers::{CancelHandler, CommandConsumer, ConfirmHandler, ReserveHandler};
use boxoffice::lease::RedisLeaseStore;
use boxoffice::store::{schema, PgReservationStore};
use boxoffice::{Config, ExpiryReconciler, ReservationCoordinator};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "boxoffice=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting reservation service");

    let config = Config::from_env();
    info!(
        postgres_url = %config.postgres.url,
        redis_url = %config.redis.url,
        kafka_brokers = %config.kafka.brokers,
        hold_ttl_secs = config.reservation.hold_ttl_secs,
        "Configuration loaded"
    );

    info!("Connecting to Postgres...");
    let pool = PgPoolOptions::new()
        .max_connections(config.postgres.max_connections)
        .acquire_timeout(Duration::from_secs(config.postgres.connect_timeout))
        .connect(&config.postgres.url)
        .await?;
    schema::ensure_schema(&pool).await?;
    let repository = PgReservationStore::new(Arc::new(pool));
    info!("Durable store ready");

    info!("Connecting to Redis...");
    let lease = RedisLeaseStore::connect(&config.redis.url).await?;
    info!("Lease store ready");

    let coordinator = ReservationCoordinator::new(
        lease.clone(),
        config.reservation.hold_ttl(),
        config.reservation.lock_ttl(),
        config.reservation.lock_wait(),
    );

    let (shutdown_tx, _) = broadcast::channel(16);

    let reconciler = ExpiryReconciler::new(
        lease,
        repository.clone(),
        config.reservation.hold_ttl(),
        config.reservation.sweep_interval(),
    );
    let reconciler_handle = reconciler.spawn(shutdown_tx.subscribe());

    let reserve_consumer = CommandConsumer::new(
        &config.kafka.brokers,
        &config.kafka.consumer_group,
        "reserve",
        config.kafka.reserve_topic.clone(),
        Some(config.kafka.reserve_reply_topic.clone()),
        Arc::new(ReserveHandler::new(coordinator.clone(), repository.clone())),
        shutdown_tx.subscribe(),
    )?;
    let confirm_consumer = CommandConsumer::new(
        &config.kafka.brokers,
        &config.kafka.consumer_group,
        "confirm",
        config.kafka.confirm_topic.clone(),
        None,
        Arc::new(ConfirmHandler::new(coordinator.clone(), repository.clone())),
        shutdown_tx.subscribe(),
    )?;
    let cancel_consumer = CommandConsumer::new(
        &config.kafka.brokers,
        &config.kafka.consumer_group,
        "cancel",
        config.kafka.cancel_topic.clone(),
        None,
        Arc::new(CancelHandler::new(coordinator, repository)),
        shutdown_tx.subscribe(),
    )?;

    let handles = vec![
        reconciler_handle,
        reserve_consumer.spawn(),
        confirm_consumer.spawn(),
        cancel_consumer.spawn(),
    ];
    info!("Reservation service running");

    shutdown_signal().await;
    info!("Shutdown signal received, stopping background tasks");
    let _ = shutdown_tx.send(());

    for handle in handles {
        if let Err(e) = tokio::time::timeout(Duration::from_secs(10), handle).await {
            warn!(error = %e, "Background task did not stop in time");
        }
    }

    info!("Reservation service stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => warn!(error = %e, "Failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
