//! routerwatch Binary Entry Point
//!
//! Runs the ingestion backend, the collector scheduler, or both, depending on
//! configuration. Core functionality is provided by the `routerwatch` library.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use routerwatch::{
    collector::{Backend, CollectorRegistry, LocalBackend, RemoteBackend, Watchdog},
    config::{AppConfig, parse_duration},
    ingest::{Authenticator, DEFAULT_NOTIFY_CAPACITY, DeviceHealthMonitor, IngestionSink, Notifier},
    server::{self, AppState},
    storage::{StorageBuilder, StorageHandles},
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const RETENTION_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// routerwatch - Tiered RouterOS Telemetry
#[derive(Parser, Debug)]
#[command(name = "routerwatch", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        default_value = "configs/config.yaml",
        env = "ROUTERWATCH_CONFIG"
    )]
    config: String,

    /// Server bind address (overrides config file)
    #[arg(long, env = "ROUTERWATCH_SERVER_BIND")]
    server_bind: Option<String>,

    /// Server port (overrides config file)
    #[arg(long, env = "ROUTERWATCH_SERVER_PORT")]
    server_port: Option<u16>,

    /// Database URL (overrides config file)
    #[arg(long, env = "ROUTERWATCH_DB_URL")]
    db_url: Option<String>,

    /// Collector identity sent to the backend (overrides config file)
    #[arg(long, env = "ROUTERWATCH_COLLECTOR_ID")]
    collector_id: Option<String>,

    /// Watchdog cadence such as `5m` (overrides config file)
    #[arg(long, value_parser = parse_duration)]
    watchdog_interval: Option<Duration>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,routerwatch=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("routerwatch - Tiered RouterOS Telemetry");

    let cli = Cli::parse();

    tracing::info!("Loading configuration from: {}", cli.config);
    let mut config = AppConfig::load(&cli.config)?;

    // CLI > ENV > config file
    if let Some(bind) = cli.server_bind {
        config.server.bind = bind;
    }
    if let Some(port) = cli.server_port {
        config.server.port = port;
    }
    if let Some(url) = cli.db_url {
        config.database.url = url;
    }
    if let Some(id) = cli.collector_id {
        config.collector.collector_id = id;
    }
    if let Some(interval) = cli.watchdog_interval {
        config.collector.watchdog_interval = interval;
    }
    config.validate()?;

    let remote_url = config.collector.backend.url.clone();
    let needs_storage =
        config.server.enabled || (config.collector.enabled && remote_url.is_none());

    let shutdown = CancellationToken::new();
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    // Backend role
    let mut storage: Option<StorageHandles> = None;
    let mut sink: Option<IngestionSink> = None;
    if needs_storage {
        tracing::info!("Initializing storage at: {}", config.database.url);
        let handles = StorageBuilder::new(&config.database.url)
            .channel_capacity(config.database.channel_capacity)
            .batch_size(config.database.batch_size)
            .batch_flush_interval(config.database.batch_flush_interval)
            .build()
            .await?;

        let sync = handles.devices.sync_from_config(&config.devices).await?;
        tracing::info!(
            added = sync.added,
            updated = sync.updated,
            disabled = sync.disabled,
            "Device sync complete"
        );

        let ingestion = IngestionSink::new(&handles, Notifier::new(DEFAULT_NOTIFY_CAPACITY));

        let monitor = DeviceHealthMonitor::new(
            handles.devices.clone(),
            handles.writer.clone(),
            config.health.check_interval,
        );
        tasks.push(monitor.spawn(shutdown.child_token()));
        tasks.push(spawn_retention(
            &handles,
            config.database.points_retention_days,
            config.database.events_retention_days,
            shutdown.child_token(),
        ));

        sink = Some(ingestion);
        storage = Some(handles);
    }

    if config.server.enabled
        && let Some(sink) = sink.clone()
    {
        let auth = Authenticator::new(config.server.collector_secret.clone());
        if !auth.is_enforcing() {
            tracing::warn!("No collector secret configured: ingestion API accepts unauthenticated requests");
        }
        let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
        let token = shutdown.child_token();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = server::serve(addr, AppState { sink, auth }, token).await {
                tracing::error!(error = %e, "Ingestion API failed");
            }
        }));
    }

    // Collector role
    let mut registry: Option<CollectorRegistry> = None;
    if config.collector.enabled {
        let collector_id = config.collector.collector_id.clone();
        let backend: Arc<dyn Backend> = if let Some(url) = &remote_url {
            tracing::info!(url = %url, "Using remote backend");
            Arc::new(RemoteBackend::new(
                url,
                collector_id.clone(),
                config.collector.backend.secret.clone(),
                config.collector.command_timeout,
            )?)
        } else if let Some(sink) = &sink {
            Arc::new(LocalBackend::new(sink.clone()))
        } else {
            return Err("local collector backend requires storage".into());
        };

        let scheduler = CollectorRegistry::from_config(&config.collector);
        if let Err(e) = scheduler.start(Arc::clone(&backend), collector_id.clone()).await {
            // The watchdog retries
            tracing::error!(error = %e, "Collector scheduler failed to start");
        }
        let watchdog = Watchdog::new(
            scheduler.clone(),
            backend,
            collector_id,
            config.collector.watchdog_interval,
        );
        tasks.push(watchdog.spawn(shutdown.child_token()));
        registry = Some(scheduler);
    }

    tracing::info!("Press Ctrl+C to shutdown");
    shutdown_signal().await;
    shutdown.cancel();

    // Background tasks first so the watchdog cannot restart the scheduler
    for task in tasks {
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "Task ended abnormally");
        }
    }
    if let Some(registry) = registry {
        tracing::info!("Shutting down collectors...");
        registry.stop().await;
    }
    if let Some(handles) = storage {
        tracing::info!("Shutting down storage...");
        if let Err(e) = handles.shutdown().await {
            tracing::error!("Failed to shutdown storage: {}", e);
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Purge old points and events once a day.
fn spawn_retention(
    handles: &StorageHandles,
    points_days: u32,
    events_days: u32,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let admin = handles.admin.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(RETENTION_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = admin.cleanup_points(points_days).await {
                        tracing::warn!(error = %e, "Point retention cleanup failed");
                    }
                    if let Err(e) = admin.cleanup_events(events_days).await {
                        tracing::warn!(error = %e, "Event retention cleanup failed");
                    }
                }
            }
        }
    })
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal");
        }
    }
}
