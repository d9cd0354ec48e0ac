use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vantage::cache::MemoryStore;
use vantage::config::ServerConfig;
use vantage::consensus::LocationConsensus;
use vantage::db::Store;
use vantage::diagnostics::{DiagnosticsCollector, DiagnosticsPool, Lookups};
use vantage::heartbeat::{HeartbeatReceiver, HeartbeatWatchdog};
use vantage::incident::{IncidentLifecycle, TargetLocks};
use vantage::notify::{build_adapters, NotificationFanout};
use vantage::probe::ProbeExecutor;
use vantage::scheduler::{Scheduler, SweepConfig, BREACH_NOTIFY_COOLDOWN};
use vantage::web::Server;

const TLS_CACHE_TTL: Duration = Duration::from_secs(6 * 60 * 60);
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(20);
const DIAGNOSTICS_TASK_TIMEOUT: Duration = Duration::from_secs(90);
const DIAGNOSTICS_QUEUE: usize = 64;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("vantage=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting Vantage on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);
    tracing::info!(
        "Vantage points: {}",
        cfg.vantage_points.iter().map(|v| v.id.as_str()).collect::<Vec<_>>().join(", ")
    );

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    let (stop_tx, _) = broadcast::channel::<()>(1);

    // Probing
    let prober = Arc::new(ProbeExecutor::new()?);
    let consensus = Arc::new(LocationConsensus::new(
        prober.clone(),
        cfg.vantage_points.clone(),
        cfg.probe_timeout,
    ));

    // Notifications
    let fanout = Arc::new(NotificationFanout::new(
        build_adapters(&cfg)?,
        cfg.channel_timeout,
        Arc::new(MemoryStore::new(cfg.test_cooldown)),
    ));

    // Diagnostics
    let lookups = Lookups::system(Arc::new(MemoryStore::with_capacity(10_000, TLS_CACHE_TTL)))?;
    let collector = Arc::new(DiagnosticsCollector::new(lookups, store.clone(), LOOKUP_TIMEOUT));
    let (diagnostics, mut workers) = DiagnosticsPool::start(
        collector,
        cfg.diagnostic_workers,
        DIAGNOSTICS_QUEUE,
        DIAGNOSTICS_TASK_TIMEOUT,
        &stop_tx,
    );

    // Incident lifecycle
    let locks = Arc::new(TargetLocks::new());
    let lifecycle = Arc::new(IncidentLifecycle::new(
        store.clone(),
        fanout.clone(),
        Arc::new(diagnostics),
        locks.clone(),
    ));
    let watchdog = Arc::new(HeartbeatWatchdog::new(store.clone(), lifecycle.clone()));
    let receiver = Arc::new(HeartbeatReceiver::new(store.clone(), lifecycle.clone()));

    // Start scheduler
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        consensus,
        lifecycle,
        watchdog,
        fanout.clone(),
        Arc::new(MemoryStore::new(BREACH_NOTIFY_COOLDOWN)),
        SweepConfig::from(&cfg),
    ));
    workers.extend(scheduler.start(&stop_tx));

    // Stop everything on Ctrl-C
    {
        let stop_tx = stop_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutting down");
                let _ = stop_tx.send(());
            }
        });
    }

    // Start web server
    let server = Server::new(cfg, store, receiver, fanout, prober, locks);
    server.start(&stop_tx).await?;

    for handle in workers {
        let _ = handle.await;
    }

    Ok(())
}
