use anyhow::Result;
use clap::Parser;
use custodian_agent::{api, daemon::shutdown::ShutdownCoordinator, utils, ws, Config};
use custodian_plugin::PluginDir;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Name to register with the server (overrides config)
    #[arg(short, long)]
    name: Option<String>,

    /// Server base URL (overrides config)
    #[arg(short, long)]
    server: Option<String>,

    /// Port for the local health endpoints (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Plugin directory (overrides config)
    #[arg(long, value_name = "DIR")]
    plugin_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

impl Args {
    fn apply(self, mut config: Config) -> Config {
        if let Some(name) = self.name {
            config.agent.name = name;
        }
        if let Some(url) = self.server {
            config.server.url = url;
        }
        if let Some(port) = self.port {
            config.agent.port = port;
        }
        if let Some(dir) = self.plugin_dir {
            config.agent.plugin_dir = dir;
        }
        if let Some(level) = self.log_level {
            config.log.level = level;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;
    let print_config = args.print_config;
    let config = args.apply(config);

    if print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    utils::logger::init(&config.log.level)?;
    tracing::info!(
        "Starting custodian-agent v{} as '{}' (plugins in {})",
        env!("CARGO_PKG_VERSION"),
        config.agent.name,
        config.agent.plugin_dir.display()
    );

    let plugins = PluginDir::new(&config.agent.plugin_dir);
    if plugins.list().is_empty() {
        tracing::warn!("No plugins found in {}", config.agent.plugin_dir.display());
    }
    let state = api::AppState::new(&config.agent.name, plugins, config.agent.max_concurrent_tasks);
    let shutdown = ShutdownCoordinator::new();

    let client = ws::AgentWsClient::new(&config.server.url, state.clone(), config.reconnect_bounds(), shutdown.token());
    let client_handle = tokio::spawn(async move { client.run().await });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.agent.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening on http://{addr}");

    let server_shutdown = shutdown.token();
    let server = tokio::spawn(async move {
        axum::serve(listener, api::create_router(state))
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
    });

    shutdown.wait_for_signal().await;

    let _ = tokio::time::timeout(Duration::from_secs(3), client_handle).await;
    match tokio::time::timeout(Duration::from_secs(5), server).await {
        Ok(Ok(Ok(()))) => tracing::info!("Shutdown complete"),
        Ok(Ok(Err(e))) => tracing::error!("Server error during shutdown: {e}"),
        Ok(Err(e)) => tracing::error!("Server task panicked: {e}"),
        Err(_) => tracing::warn!("Server shutdown timed out"),
    }

    Ok(())
}
