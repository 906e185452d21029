use std::path::PathBuf;

use clap::Parser;

use http_proxy::config::{load_config, ProxyConfig};
use http_proxy::lifecycle::startup;
use http_proxy::observability::logging::init_logging;

#[derive(Parser)]
#[command(name = "http-proxy")]
#[command(about = "HTTP and WebSocket reverse proxy", long_about = None)]
struct Cli {
    /// Path to a TOML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };

    init_logging(&config.observability)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        bind_address = %config.listener.bind_address,
        routes = config.routes.len(),
        interceptors = config.interceptors.len(),
        "http-proxy starting"
    );

    startup::run(config).await
}
