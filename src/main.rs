use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use courtbook::api::auth::StaticSessions;
use courtbook::api::{AppState, create_router};
use courtbook::config::{Config, GatewayKind};
use courtbook::engine::Engine;
use courtbook::gateway::{PaymentGateway, ScriptedGateway, SimulatedGateway};
use courtbook::notify::NotifyHub;
use courtbook::store::Database;

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(10);
const TASK_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    courtbook::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;
    let db = Arc::new(Database::open(&config.wal_path())?);

    let gateway: Arc<dyn PaymentGateway> = match config.gateway {
        GatewayKind::Simulated => Arc::new(SimulatedGateway::new(
            config.approval_rate,
            config.gateway_min_delay,
            config.gateway_max_delay,
        )),
        GatewayKind::Approve => Arc::new(ScriptedGateway::approve()),
        GatewayKind::Decline => Arc::new(ScriptedGateway::decline()),
    };

    let sessions = match &config.sessions_file {
        Some(path) => StaticSessions::from_file(path)?,
        None => StaticSessions::default(),
    };

    let engine = Arc::new(Engine::new(
        db,
        Arc::new(NotifyHub::new()),
        gateway,
        config.engine.clone(),
    ));
    for identity in sessions.identities() {
        engine.register_user(identity.user()).await?;
    }

    tokio::spawn(courtbook::reaper::run_reaper(engine.clone(), config.reaper_interval));
    tokio::spawn(courtbook::reaper::run_compactor(
        engine.clone(),
        config.compact_threshold,
        COMPACT_CHECK_INTERVAL,
    ));
    if let Some(every) = config.audit_interval {
        tokio::spawn(courtbook::reaper::run_auditor(engine.clone(), every));
    }

    let state = AppState {
        engine: engine.clone(),
        sessions: Arc::new(sessions),
    };

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("courtbook listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  payment_mode: {:?}", config.engine.payment_mode);
    info!("  gateway: {:?}", config.gateway);
    info!("  workers: {}", config.engine.worker_pool_size);
    info!(
        "  integrity audit: {}",
        config
            .audit_interval
            .map_or("disabled".to_string(), |d| format!("every {}s", d.as_secs()))
    );
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Settlements already charged at the gateway must reach the log.
    info!("draining background tasks...");
    match engine.tasks.drain(TASK_DRAIN_TIMEOUT).await {
        0 => info!("all background tasks finished"),
        remaining => tracing::warn!("drain timeout, {remaining} background tasks still active"),
    }

    info!("courtbook stopped");
    Ok(())
}

/// Resolves on ctrl-c or SIGTERM. In-flight requests drain before `serve` returns.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("failed to register SIGTERM handler: {e}");
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
    info!("shutdown signal received, draining requests");
}
