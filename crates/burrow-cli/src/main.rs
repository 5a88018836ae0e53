//! burrow-tunnel: exposes a destination behind a burrow server on a local port.

mod relay;

use std::sync::Arc;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use burrow_client::Dialer;
use burrow_core::Key;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

/// burrow-tunnel — forward a local port through a burrow server
#[derive(Parser, Debug)]
#[command(name = "burrow-tunnel", version, about = "Forward a local port through a burrow server")]
struct Cli {
    /// Server URL (ws://, wss:// or tcp://)
    #[arg(long)]
    url: String,

    /// Key id
    #[arg(long)]
    kid: u32,

    /// Key secret, standard base64
    #[arg(long)]
    key: String,

    /// Destination as host:port
    #[arg(long)]
    target: String,

    /// Local port to listen on (0 picks one)
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let key = Key::new(cli.kid, decode_secret(&cli.key)?);
    let dialer = Arc::new(Dialer::new(cli.url, key));

    let listener = TcpListener::bind(("localhost", cli.port))
        .await
        .with_context(|| format!("unable to listen on localhost:{}", cli.port))?;
    let local = listener.local_addr()?;
    info!(listen = %local, to = %cli.target, "tunnel ready, connect to the listen address");

    tokio::select! {
        result = relay::serve(listener, dialer, cli.target) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            Ok(())
        }
    }
}

fn decode_secret(encoded: &str) -> Result<Vec<u8>> {
    let secret = STANDARD
        .decode(encoded.trim())
        .context("--key is not valid base64")?;
    anyhow::ensure!(!secret.is_empty(), "--key must not be empty");
    Ok(secret)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_standard_base64() {
        assert_eq!(decode_secret("c2VjcmV0").unwrap(), b"secret");
        assert_eq!(decode_secret(" c2VjcmV0\n").unwrap(), b"secret");
    }

    #[test]
    fn rejects_bad_keys() {
        assert!(decode_secret("not base64!").is_err());
        assert!(decode_secret("").is_err());
    }

    #[test]
    fn cli_parses() {
        let cli = Cli::try_parse_from([
            "burrow-tunnel",
            "--url",
            "wss://gw.example.com/",
            "--kid",
            "7",
            "--key",
            "c2VjcmV0",
            "--target",
            "db.internal:5432",
        ])
        .unwrap();
        assert_eq!(cli.kid, 7);
        assert_eq!(cli.port, 0);
    }
}
