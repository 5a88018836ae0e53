//! Destination name resolution.
//!
//! [`ResolverChain`] asks each configured DNS server in order, each bounded by
//! [`RESOLVER_TIMEOUT`], and hands over to a fallback resolver once all of
//! them came back empty or failed. The server wires the system resolver
//! ([`SystemResolver`]) in as that fallback.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use burrow_core::error::{TunnelError, TunnelResult};
use burrow_core::session::bounded;
use burrow_core::socks5::Resolver;
use tokio::net::{self, UdpSocket};
use tracing::{debug, warn};

use super::dns::{self, QTYPE_A, QTYPE_AAAA};

/// Bound on one configured server's lookup, both record types included.
pub const RESOLVER_TIMEOUT: Duration = Duration::from_secs(1);

const MAX_RESPONSE_LEN: usize = 4096;

/// Queries a single DNS server over UDP.
#[derive(Debug, Clone)]
pub struct UdpResolver {
    server: SocketAddr,
}

impl UdpResolver {
    pub fn new(server: SocketAddr) -> Self {
        Self { server }
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    /// Look up `name`, asking for A records first and AAAA only when there
    /// were none.
    pub async fn lookup(&self, name: &str) -> TunnelResult<Vec<IpAddr>> {
        let local = if self.server.is_ipv4() {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
        } else {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(self.server).await?;

        let v4 = self.query(&socket, name, QTYPE_A).await?;
        if !v4.is_empty() {
            return Ok(v4);
        }
        self.query(&socket, name, QTYPE_AAAA).await
    }

    async fn query(&self, socket: &UdpSocket, name: &str, qtype: u16) -> TunnelResult<Vec<IpAddr>> {
        let id: u16 = rand::random();
        let query = dns::build_query(id, name, qtype)?;
        socket.send(&query).await?;

        let mut buf = vec![0u8; MAX_RESPONSE_LEN];
        loop {
            let n = socket.recv(&mut buf).await?;
            match dns::parse_response(&buf[..n], id)? {
                Some(addrs) => return Ok(addrs),
                None => debug!(server = %self.server, "ignoring DNS response with unexpected id"),
            }
        }
    }
}

/// Resolves through the host's own resolver via `tokio::net::lookup_host`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, name: &str) -> TunnelResult<IpAddr> {
        // lookup_host wants a host:port pair
        let lookup_addr = format!("{name}:0");
        let mut addrs = net::lookup_host(&lookup_addr)
            .await
            .map_err(|e| TunnelError::Resolution(format!("{name}: {e}")))?;
        match addrs.next() {
            Some(addr) => {
                debug!(name = %name, ip = %addr.ip(), "resolved via system resolver");
                Ok(addr.ip())
            }
            None => Err(TunnelError::Resolution(format!("no address found for {name}"))),
        }
    }
}

/// Ordered DNS servers plus an optional fallback.
///
/// Shared read-only by every session once built.
pub struct ResolverChain {
    servers: Vec<UdpResolver>,
    fallback: Option<Arc<dyn Resolver>>,
    timeout: Duration,
}

impl ResolverChain {
    /// Chain over `servers`, in order, with no fallback.
    pub fn new(servers: impl IntoIterator<Item = SocketAddr>) -> Self {
        Self {
            servers: servers.into_iter().map(UdpResolver::new).collect(),
            fallback: None,
            timeout: RESOLVER_TIMEOUT,
        }
    }

    /// Delegate to `fallback` once every configured server has been tried.
    pub fn with_fallback(mut self, fallback: Arc<dyn Resolver>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Override the per-server bound.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Resolver for ResolverChain {
    async fn resolve(&self, name: &str) -> TunnelResult<IpAddr> {
        if let Ok(ip) = name.parse::<IpAddr>() {
            return Ok(ip);
        }

        let mut last_err = None;
        for resolver in &self.servers {
            let server = resolver.server();
            match bounded(self.timeout, resolver.lookup(name)).await {
                Ok(addrs) => match addrs.first() {
                    Some(ip) => {
                        debug!(name = %name, server = %server, ip = %ip, "resolved");
                        return Ok(*ip);
                    }
                    None => debug!(name = %name, server = %server, "no addresses returned"),
                },
                Err(e) => {
                    warn!(name = %name, server = %server, error = %e, "DNS lookup failed");
                    last_err = Some(match e {
                        TunnelError::Resolution(msg) => {
                            TunnelError::Resolution(format!("{name} via {server}: {msg}"))
                        }
                        other => TunnelError::Resolution(format!("{name} via {server}: {other}")),
                    });
                }
            }
        }

        if let Some(fallback) = &self.fallback {
            return fallback.resolve(name).await;
        }
        Err(last_err
            .unwrap_or_else(|| TunnelError::Resolution(format!("no address found for {name}"))))
    }
}
