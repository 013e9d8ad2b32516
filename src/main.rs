use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use secrecy::SecretString;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use genpool::admin::admin_routes;
use genpool::driver::{HttpDriver, SessionDriver, SimulatedDriver};
use genpool::store::LibSqlBackend;
use genpool::workers::WorkerRegistry;
use genpool::{Engine, EngineConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing()?;

    let config = EngineConfig::from_env();
    config.validate()?;

    let db_path = std::env::var("GENPOOL_DB_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./data/genpool.db"));
    let http_port: u16 = std::env::var("GENPOOL_HTTP_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8000);
    let autostart = std::env::var("GENPOOL_AUTOSTART")
        .map(|v| !matches!(v.trim(), "0" | "false" | "no"))
        .unwrap_or(true);

    eprintln!("genpool v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Workers: {}", config.workers_file.display());
    eprintln!("   Database: {}", db_path.display());
    eprintln!("   Admin API: http://0.0.0.0:{}/api/status", http_port);

    // ── Store ────────────────────────────────────────────────────────────
    let db = Arc::new(
        LibSqlBackend::new_local(&db_path)
            .await
            .context("opening job database")?,
    );

    // ── Workers ──────────────────────────────────────────────────────────
    let (registry, _) = WorkerRegistry::load(config.workers_file.clone())
        .await
        .context("loading worker configuration")?;

    // ── Driver ───────────────────────────────────────────────────────────
    let driver: Arc<dyn SessionDriver> = match std::env::var("GENPOOL_DRIVER_URL") {
        Ok(url) if !url.trim().is_empty() => {
            let token = std::env::var("GENPOOL_DRIVER_TOKEN").ok().map(SecretString::from);
            tracing::info!(url = %url, "Using sidecar session driver");
            Arc::new(HttpDriver::new(url, token))
        }
        _ => {
            tracing::warn!("GENPOOL_DRIVER_URL not set, running with the simulated driver (dry run)");
            Arc::new(SimulatedDriver::default())
        }
    };

    let engine = Engine::new(config, Arc::new(registry), driver, db.clone(), db);

    if autostart {
        if let Err(e) = engine.start().await {
            tracing::warn!(error = %e, "Engine not started; start it from the admin API");
        }
    }

    // ── Admin API ────────────────────────────────────────────────────────
    let app = admin_routes(engine.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], http_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding admin API on {addr}"))?;
    tracing::info!(port = http_port, "Admin API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
        })
        .await
        .context("admin API server")?;

    if engine.is_running() {
        engine.stop().await?;
    }
    Ok(())
}

/// Console logging filtered by `RUST_LOG`, plus a daily-rolling file when
/// `GENPOOL_LOG_DIR` is set. The returned guard flushes the file on drop.
fn init_tracing() -> anyhow::Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = tracing_subscriber::fmt::layer().with_target(false);

    let (file_layer, guard) = match std::env::var("GENPOOL_LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            std::fs::create_dir_all(&dir).with_context(|| format!("creating log directory {dir}"))?;
            let appender = tracing_appender::rolling::daily(&dir, "genpool.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console)
        .with(file_layer)
        .init();
    Ok(guard)
}
