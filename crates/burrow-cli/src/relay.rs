//! Local listener that forwards every accepted connection through a tunnel.

use std::sync::Arc;

use anyhow::{Context, Result};
use burrow_client::Dialer;
use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Accept local connections forever, tunnelling each one to `target`.
///
/// A failed dial or relay only ends that connection.
pub async fn serve(listener: TcpListener, dialer: Arc<Dialer>, target: String) -> Result<()> {
    loop {
        let (local, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(error = %e, "local accept failed");
                continue;
            }
        };
        debug!(peer = %peer, "local connection accepted");

        let dialer = Arc::clone(&dialer);
        let target = target.clone();
        tokio::spawn(async move {
            if let Err(e) = relay_one(local, &dialer, &target).await {
                let detail = format!("{e:#}");
                warn!(peer = %peer, error = %detail, "tunnel connection failed");
            }
        });
    }
}

async fn relay_one(mut local: TcpStream, dialer: &Dialer, target: &str) -> Result<()> {
    let mut remote = dialer
        .connect(target)
        .await
        .with_context(|| format!("unable to dial {target} via {}", dialer.url()))?;
    info!(to = %target, "tunnel open");

    let (sent, received) = copy_bidirectional(&mut local, &mut remote)
        .await
        .context("relay failed")?;
    debug!(sent, received, "tunnel closed");
    Ok(())
}
