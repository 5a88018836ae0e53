//! Raw TCP transport.

use tokio::net::TcpStream;
use tracing::debug;

use burrow_core::error::{TunnelError, TunnelResult};

/// Extract `host:port` from a `tcp://host:port[/...]` URL.
pub fn parse_tcp_url(url: &str) -> TunnelResult<&str> {
    let rest = url
        .get(..6)
        .filter(|scheme| scheme.eq_ignore_ascii_case("tcp://"))
        .map(|_| &url[6..])
        .ok_or_else(|| TunnelError::Transport(format!("invalid TCP URL: {url}")))?;
    let host_port = rest.split('/').next().unwrap_or(rest);
    if !host_port.contains(':') {
        return Err(TunnelError::Transport(format!("missing port in TCP URL: {url}")));
    }
    Ok(host_port)
}

pub async fn connect(url: &str) -> TunnelResult<TcpStream> {
    let addr = parse_tcp_url(url)?;
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| TunnelError::Transport(format!("TCP connect to {addr}: {e}")))?;
    stream.set_nodelay(true)?;
    debug!(server = %addr, "tcp transport connected");
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_host_port() {
        assert_eq!(parse_tcp_url("tcp://example.com:9000").unwrap(), "example.com:9000");
        assert_eq!(parse_tcp_url("TCP://10.0.0.1:1/ignored").unwrap(), "10.0.0.1:1");
    }

    #[test]
    fn reject_missing_port() {
        assert!(parse_tcp_url("tcp://example.com").is_err());
        assert!(parse_tcp_url("ws://example.com:1").is_err());
    }
}
