//! Core server: binds the listeners and runs one session task per connection.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use burrow_core::error::TunnelResult;
use burrow_core::socks5::Resolver;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::gateway::{ResolverChain, SystemResolver};
use crate::session::{serve_connection, SessionContext};
use crate::transport::{tcp, websocket, Accepted, Listener};

/// A burrow server with its listeners bound.
pub struct TunnelServer {
    ctx: SessionContext,
    ws: Option<Listener>,
    tcp: Option<Listener>,
}

impl TunnelServer {
    /// Validate `config` and bind every enabled listener.
    pub async fn bind(config: ServerConfig) -> TunnelResult<Self> {
        config.validate()?;

        let mut chain = ResolverChain::new(config.dns_servers.iter().copied());
        if config.system_fallback {
            chain = chain.with_fallback(Arc::new(SystemResolver));
        }
        let resolver: Arc<dyn Resolver> = Arc::new(chain);

        let ws = match config.http_addr {
            Some(addr) => Some(websocket::start_listener(addr, config.keepalive).await?),
            None => None,
        };
        let tcp = match config.tcp_addr {
            Some(addr) => Some(tcp::start_listener(addr).await?),
            None => None,
        };

        info!(
            keys = config.keys.len(),
            targets = config.access_list.len(),
            dns_servers = config.dns_servers.len(),
            "loaded tunnel policy"
        );

        Ok(Self {
            ctx: SessionContext {
                keys: Arc::new(config.keys),
                rules: Arc::new(config.access_list),
                resolver,
                connect_timeout: config.connect_timeout,
            },
            ws,
            tcp,
        })
    }

    /// Local address of the WebSocket listener, if enabled.
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.ws.as_ref().map(Listener::local_addr)
    }

    /// Local address of the raw TCP listener, if enabled.
    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp.as_ref().map(Listener::local_addr)
    }

    /// Serve connections until `shutdown` resolves.
    ///
    /// Session failures are logged and never stop the loop. Sessions still
    /// running at shutdown are aborted, which closes their transports.
    pub async fn run<F>(mut self, shutdown: F) -> TunnelResult<()>
    where
        F: Future<Output = ()>,
    {
        info!(
            http = ?self.http_addr(),
            tcp = ?self.tcp_addr(),
            "burrow-server ready"
        );

        let mut sessions = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(active = sessions.len(), "shutting down");
                    break;
                }
                Some(conn) = next_connection(&mut self.ws) => {
                    spawn_session(&mut sessions, conn, self.ctx.clone());
                }
                Some(conn) = next_connection(&mut self.tcp) => {
                    spawn_session(&mut sessions, conn, self.ctx.clone());
                }
                Some(done) = sessions.join_next() => {
                    if let Err(e) = done {
                        warn!(error = %e, "tunnel session task panicked");
                    }
                }
            }
        }

        sessions.shutdown().await;
        Ok(())
    }
}

/// Next connection from `listener`; never resolves when it is disabled.
async fn next_connection(listener: &mut Option<Listener>) -> Option<Accepted> {
    match listener {
        Some(l) => l.accept().await,
        None => std::future::pending().await,
    }
}

fn spawn_session(sessions: &mut JoinSet<()>, conn: Accepted, ctx: SessionContext) {
    sessions.spawn(async move {
        let remote = conn.remote_addr;
        let transport = conn.stream.transport();
        debug!(remote = %remote, transport, "tunnel connection accepted");
        match serve_connection(conn.stream, Some(remote), &ctx).await {
            Ok(()) => debug!(remote = %remote, "tunnel session finished"),
            Err(e) => warn!(remote = %remote, transport, error = %e, "tunnel session failed"),
        }
    });
}
