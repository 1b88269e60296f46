use custodian_plugin::builtin::FsStore;
use custodian_plugin::{PluginDir, PluginRegistry};
use custodian_server::clock::SystemClock;
use custodian_server::config::AppConfig;
use custodian_server::db::connection::{close_pool, create_pool};
use custodian_server::db::migrate::migrate;
use custodian_server::routes;
use custodian_server::state::AppState;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Time in-flight tasks get to settle after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .init();

    tracing::info!("Starting custodian server on port {}", config.port);

    std::fs::create_dir_all(&config.data_dir)?;
    std::fs::create_dir_all(&config.plugin_dir)?;

    let pool = create_pool(&config.db_path)?;
    migrate(&pool)?;

    let plugins = PluginRegistry::new()
        .register("fs", Arc::new(FsStore))
        .with_fallback(Arc::new(PluginDir::new(&config.plugin_dir)));
    let state = Arc::new(AppState::new(
        pool,
        config.clone(),
        Arc::new(SystemClock),
        Arc::new(plugins),
    ));

    let resumed = state.engine.recover().await?;
    if !resumed.is_empty() {
        tracing::info!("Resumed {} pending task(s)", resumed.len());
    }

    let cancel = CancellationToken::new();
    let scheduler = tokio::spawn(state.scheduler.clone().run(config.scheduler_tick, cancel.clone()));
    let sweeper = tokio::spawn(state.retention.clone().run(config.retention_sweep, cancel.clone()));

    let app = routes::create_router(state.clone());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    tracing::info!("Shutting down...");
    cancel.cancel();
    let _ = tokio::join!(scheduler, sweeper);
    state.engine.shutdown(SHUTDOWN_GRACE).await;

    close_pool(&state.db);
    tracing::info!("Server stopped");

    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl+c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }

    cancel.cancel();
}
