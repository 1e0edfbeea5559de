//! Application assembly and lifecycle.
//!
//! Wires the stores, service, and background machinery together, runs the
//! boot-time recovery pass, and coordinates graceful shutdown: one broadcast
//! signal fans out to every task, then each is joined with a bounded wait so
//! a wedged task cannot hang the process forever.

use crate::bus::KafkaEventBus;
use crate::config::Config;
use crate::consumer::{EventConsumer, OrderEventHandler, ProductEventHandler};
use crate::coordinator::RedisCoordinator;
use crate::mirror::ProductActivityMirror;
use crate::outbox::{OutboxCleanup, OutboxRelay, PgOutboxStore};
use crate::persistence::{PersistenceWorker, PgReservationStore};
use crate::recovery::RecoveryManager;
use crate::retry::RetryPolicy;
use crate::scanner::ExpirationScanner;
use crate::service::InventoryService;
use anyhow::Context;
use chrono::Duration as ChronoDuration;
use souk_core::environment::{Clock, SystemClock};
use souk_core::event::{TOPIC_ORDER_EVENTS, TOPIC_PRODUCT_EVENTS};
use souk_core::event_bus::EventBus;
use souk_core::stores::{FastStore, OutboxStore, ReservationStore};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// A running inventory engine: the service plus its background tasks.
pub struct Application {
    service: Arc<InventoryService>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_timeout: Duration,
}

impl Application {
    /// Build and start the engine: connect stores, run migrations and the
    /// recovery pass, then spawn the relay, cleanup, persistence worker,
    /// scanner, and inbound consumers.
    ///
    /// # Errors
    ///
    /// Returns an error if any store connection, the migration run, or the
    /// recovery pass fails. Background tasks failing later only log.
    pub async fn start(config: Config) -> anyhow::Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let fast: Arc<dyn FastStore> = Arc::new(
            RedisCoordinator::new(&config.redis.url, clock.clone())
                .await
                .context("connecting to Redis")?,
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.postgres.max_connections)
            .acquire_timeout(Duration::from_secs(config.postgres.connect_timeout))
            .connect(&config.postgres.url)
            .await
            .context("connecting to Postgres")?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("running migrations")?;

        let reservations: Arc<dyn ReservationStore> =
            Arc::new(PgReservationStore::new(pool.clone()));
        let outbox: Arc<dyn OutboxStore> = Arc::new(PgOutboxStore::new(pool));
        let bus: Arc<dyn EventBus> = Arc::new(
            KafkaEventBus::builder()
                .brokers(&config.kafka.brokers)
                .consumer_group(&config.kafka.consumer_group)
                .build()
                .context("connecting to Kafka")?,
        );

        let report = RecoveryManager::new(
            fast.clone(),
            reservations.clone(),
            outbox.clone(),
            clock.clone(),
        )
        .run()
        .await
        .context("recovery pass")?;
        info!(?report, "Boot recovery finished");

        let (shutdown_tx, _) = broadcast::channel(1);
        let mut handles = Vec::new();

        let (queue, worker) = PersistenceWorker::channel(
            reservations.clone(),
            config.persistence.batch_size,
            config.persistence_flush_interval(),
            config.persistence.queue_capacity,
        );
        handles.push(("persistence-worker", worker.spawn(shutdown_tx.subscribe())));

        let mirror = Arc::new(ProductActivityMirror::new());
        let service = Arc::new(InventoryService::new(
            fast,
            reservations.clone(),
            outbox.clone(),
            queue,
            mirror.clone(),
            clock.clone(),
        ));

        let policy = RetryPolicy {
            max_retries: config.outbox.max_retries,
            base_delay: ChronoDuration::seconds(config.outbox.retry_base_delay),
            ..RetryPolicy::default()
        };
        let relay = OutboxRelay::new(
            outbox.clone(),
            bus.clone(),
            clock.clone(),
            policy,
            Duration::from_secs(config.outbox.poll_interval),
            config.outbox.batch_size,
        );
        handles.push(("outbox-relay", relay.spawn(shutdown_tx.subscribe())));

        let cleanup = OutboxCleanup::new(
            outbox,
            clock.clone(),
            ChronoDuration::hours(config.outbox.retention_hours),
            Duration::from_secs(config.outbox.cleanup_interval),
        );
        handles.push(("outbox-cleanup", cleanup.spawn(shutdown_tx.subscribe())));

        let scanner = ExpirationScanner::new(
            service.clone(),
            reservations,
            clock,
            Duration::from_secs(config.scanner.interval),
            ChronoDuration::hours(config.scanner.window_hours),
            config.scanner.batch_size,
        );
        handles.push(("expiration-scanner", scanner.spawn(shutdown_tx.subscribe())));

        let order_consumer = EventConsumer::new(
            "orders",
            vec![TOPIC_ORDER_EVENTS.to_string()],
            bus.clone(),
            Arc::new(OrderEventHandler::new(service.clone())),
        );
        handles.push(("order-consumer", order_consumer.spawn(shutdown_tx.subscribe())));

        let product_consumer = EventConsumer::new(
            "products",
            vec![TOPIC_PRODUCT_EVENTS.to_string()],
            bus,
            Arc::new(ProductEventHandler::new(mirror)),
        );
        handles.push((
            "product-consumer",
            product_consumer.spawn(shutdown_tx.subscribe()),
        ));

        info!(tasks = handles.len(), "Inventory engine started");
        Ok(Self {
            service,
            handles,
            shutdown_tx,
            shutdown_timeout: Duration::from_secs(config.shutdown_timeout),
        })
    }

    /// The operation surface of the running engine.
    #[must_use]
    pub fn service(&self) -> Arc<InventoryService> {
        self.service.clone()
    }

    /// Block until Ctrl+C / SIGTERM, then shut everything down.
    ///
    /// # Errors
    ///
    /// Returns an error if installing the signal handler fails.
    pub async fn run_until_shutdown(self) -> anyhow::Result<()> {
        shutdown_signal().await?;
        info!("Shutdown signal received");
        self.shutdown().await;
        Ok(())
    }

    /// Broadcast shutdown and join every task with a bounded wait.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        for (name, handle) in self.handles {
            match tokio::time::timeout(self.shutdown_timeout, handle).await {
                Ok(Ok(())) => info!(task = name, "Task stopped"),
                Ok(Err(e)) => warn!(task = name, error = %e, "Task ended with error"),
                Err(_) => warn!(task = name, "Task shutdown timed out"),
            }
        }
        info!("Graceful shutdown complete");
    }
}

async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("installing Ctrl+C handler")?,
            _ = sigterm.recv() => {}
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("installing Ctrl+C handler")
    }
}
