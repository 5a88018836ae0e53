//! burrow-server: authenticated tunnel server.

use std::path::PathBuf;

use anyhow::Context;
use burrow_server::config::DEFAULT_CONFIG_PATH;
use burrow_server::{Overrides, ServerConfig, TunnelServer};
use clap::Parser;
use tracing::{info, warn};

/// burrow-server — authenticated tunnel server
#[derive(Parser, Debug)]
#[command(name = "burrow-server", version, about = "Authenticated tunnel server")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Listen address for both listeners
    #[arg(long, env = "BURROW_BIND")]
    bind: Option<String>,

    /// WebSocket listener port (0 disables)
    #[arg(long, env = "BURROW_HTTP_PORT")]
    http_port: Option<u16>,

    /// Raw TCP listener port (0 disables)
    #[arg(long, env = "BURROW_TCP_PORT")]
    tcp_port: Option<u16>,

    /// Auth keys as a JSON array of {"kid", "data"}
    #[arg(long, env = "BURROW_AUTH_KEYS", hide_env_values = true)]
    auth_keys: Option<String>,

    /// Allowed destinations as a JSON array of {"host", "port"}
    #[arg(long, env = "BURROW_ALLOWED_PROXY_TARGETS")]
    allowed_targets: Option<String>,

    /// Comma-separated DNS servers (ip or ip:port)
    #[arg(long, env = "BURROW_DNS_SERVERS")]
    dns_servers: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting burrow-server");

    let overrides = Overrides {
        bind: cli.bind,
        http_port: cli.http_port,
        tcp_port: cli.tcp_port,
        auth_keys: cli.auth_keys,
        allowed_targets: cli.allowed_targets,
        dns_servers: cli.dns_servers,
    };
    let config_path = PathBuf::from(&cli.config);
    let config = ServerConfig::load(Some(&config_path), &overrides)
        .with_context(|| format!("failed to load config from {}", cli.config))?;

    let server = TunnelServer::bind(config)
        .await
        .context("failed to start listeners")?;
    server
        .run(shutdown_signal())
        .await
        .context("server error")?;

    info!("burrow-server stopped");
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "unable to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "unable to install SIGTERM handler");
                ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
    }
}
