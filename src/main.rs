use std::path::PathBuf;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use z21_gateway::core::{LogFormat, RuntimeEnv};
use z21_gateway::{Config, GatewayServer, Result};

const DEFAULT_CONFIG_PATH: &str = "config.json";

fn init_logging(env: &RuntimeEnv) {
    // RUST_LOG wins over LOG_LEVEL
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&env.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match env.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn config_path(env: &RuntimeEnv) -> PathBuf {
    std::env::args()
        .nth(1)
        .or_else(|| env.config_path.clone())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
        .into()
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let env = RuntimeEnv::from_env()?;
    init_logging(&env);

    let path = config_path(&env);
    info!(path = %path.display(), "Loading configuration");
    let config = Config::load(&path).map_err(|e| {
        error!(error = %e, "Invalid configuration");
        e
    })?;

    let server = GatewayServer::bind(&config, env.heartbeat_interval).await?;
    info!(
        version = z21_gateway::VERSION,
        clients = %server.client_addr(),
        central = %format!("{}:{}", config.z21.host, config.z21.udp_port),
        "Gateway running"
    );

    server.run_until(shutdown_signal()).await?;
    info!("Gateway stopped");
    Ok(())
}
