//! Startup orchestration.
//!
//! # Responsibilities
//! - Start the metrics exporter and sampler
//! - Bind the admin listener when enabled
//! - Bind the proxy listener and serve until a signal arrives
//!
//! # Design Decisions
//! - Fail fast: a listener that cannot bind is fatal
//! - Listeners start last, after the engine is built

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use crate::admin::{serve_admin, AdminState};
use crate::config::ProxyConfig;
use crate::http::HttpServer;
use crate::lifecycle::signals::shutdown_signal;
use crate::lifecycle::Shutdown;
use crate::observability::metrics::{init_metrics, run_sampler};

/// Run the proxy with `config` until SIGTERM or Ctrl-C.
pub async fn run(config: ProxyConfig) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = Shutdown::new();
    let observability = config.observability.clone();
    let admin = config.admin.clone();
    let bind_address = config.listener.bind_address.clone();

    let server = HttpServer::new(config)?;
    let engine = server.engine().clone();

    if observability.metrics_enabled {
        match observability.metrics_address.parse::<SocketAddr>() {
            Ok(addr) => {
                init_metrics(addr);
                tokio::spawn(run_sampler(
                    engine.clone(),
                    Duration::from_millis(observability.metrics_interval_ms),
                    shutdown.subscribe(),
                ));
            }
            Err(e) => tracing::error!(
                metrics_address = %observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let admin_task = if admin.enabled {
        let listener = TcpListener::bind(&admin.bind_address).await?;
        let state = AdminState {
            engine: engine.clone(),
            api_key: Arc::from(admin.api_key.as_str()),
        };
        Some(tokio::spawn(serve_admin(listener, state, shutdown.subscribe())))
    } else {
        None
    };

    let listener = TcpListener::bind(&bind_address).await?;
    let server_task = tokio::spawn(server.run(listener, shutdown.subscribe()));

    shutdown_signal().await;
    shutdown.trigger();

    server_task.await??;
    if let Some(task) = admin_task {
        task.await??;
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
