//! Tunnel dialing.
//!
//! [`Dialer::dial`] opens the transport, validates the connect descriptor,
//! signs its nonce, authenticates over SOCKS5 with the signature as
//! credentials, then issues CONNECT for the destination. Every step is
//! bounded by the handshake timeout; a failed step closes the transport.

use std::time::Duration;

use tracing::{debug, info};

use burrow_core::error::{Step, TunnelError, TunnelResult};
use burrow_core::session::{bounded, SessionState, TunnelSession};
use burrow_core::stream::KEEPALIVE_INTERVAL;
use burrow_core::{auth, handshake, socks5, Key};

use crate::transport::{self, AnyStream};

/// Default bound on each dial step.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone)]
pub struct DialOptions {
    /// Bound on the transport connect and each protocol step.
    pub handshake_timeout: Duration,
    /// WebSocket ping interval; zero disables keep-alive.
    pub keepalive_interval: Duration,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: HANDSHAKE_TIMEOUT,
            keepalive_interval: KEEPALIVE_INTERVAL,
        }
    }
}

/// Dials tunnels through one burrow server with one key.
#[derive(Debug, Clone)]
pub struct Dialer {
    url: String,
    key: Key,
    options: DialOptions,
}

impl Dialer {
    pub fn new(url: impl Into<String>, key: Key) -> Self {
        Self {
            url: url.into(),
            key,
            options: DialOptions::default(),
        }
    }

    pub fn with_options(mut self, options: DialOptions) -> Self {
        self.options = options;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Dial `addr` (`host:port`) through the tunnel.
    ///
    /// Only the `"tcp"` network is supported. The returned stream is the
    /// logical connection to the destination.
    pub async fn dial(&self, network: &str, addr: &str) -> TunnelResult<AnyStream> {
        if network != "tcp" {
            return Err(
                TunnelError::Transport(format!("unsupported network type: {network}"))
                    .at(Step::Transport),
            );
        }
        let limit = self.options.handshake_timeout;

        let io = bounded(limit, transport::connect(&self.url, &self.options))
            .await
            .map_err(|e| e.at(Step::Transport))?;
        let mut session = TunnelSession::new(io);

        let received = bounded(limit, handshake::receive_descriptor(session.io_mut())).await;
        let (descriptor, nonce) = session.settle(Step::Handshake, received).await?;
        session.advance(SessionState::HandshakeExchanged)?;
        debug!(server_version = %descriptor.version, "connect descriptor accepted");

        let signature = auth::sign(&self.key, &nonce);
        session.advance(SessionState::Authenticating)?;
        let authenticated = bounded(
            limit,
            socks5::client::authenticate(session.io_mut(), &signature.date, &signature.blob),
        )
        .await;
        session.settle(Step::Authenticate, authenticated).await?;

        session.advance(SessionState::TargetNegotiation)?;
        let connected = bounded(limit, socks5::client::connect(session.io_mut(), addr)).await;
        session.settle(Step::Connect, connected).await?;
        session.advance(SessionState::Established)?;

        info!(
            server = %self.url,
            to = %addr,
            key_id = self.key.key_id,
            "tunnel established"
        );
        session.into_stream()
    }

    /// Shorthand for `dial("tcp", addr)`.
    pub async fn connect(&self, addr: &str) -> TunnelResult<AnyStream> {
        self.dial("tcp", addr).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_core::codec::write_frame;
    use burrow_core::handshake::{generate_nonce, send_descriptor, ConnectDescriptor};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn key() -> Key {
        Key::new(1, b"secret".to_vec())
    }

    fn fast() -> DialOptions {
        DialOptions {
            handshake_timeout: Duration::from_millis(300),
            keepalive_interval: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn non_tcp_network_rejected() {
        let dialer = Dialer::new("tcp://127.0.0.1:1", key());
        let err = dialer.dial("udp", "127.0.0.1:53").await.unwrap_err();
        assert_eq!(err.step(), Some(Step::Transport));
        assert!(err.to_string().contains("unsupported network type"));
    }

    #[tokio::test]
    async fn unreachable_server_is_transport_step() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let dialer = Dialer::new(format!("tcp://127.0.0.1:{port}"), key()).with_options(fast());
        let err = dialer.connect("example.com:80").await.unwrap_err();
        assert_eq!(err.step(), Some(Step::Transport));
    }

    #[tokio::test]
    async fn version_mismatch_closes_transport() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("tcp://{}", listener.local_addr().unwrap());

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut descriptor = ConnectDescriptor::for_accept(&generate_nonce());
            descriptor.protocol_version = 2;
            write_frame(&mut stream, &descriptor).await.unwrap();
            // the client must hang up without sending anything
            let mut buf = [0u8; 16];
            stream.read(&mut buf).await.unwrap()
        });

        let dialer = Dialer::new(url, key()).with_options(fast());
        let err = dialer.connect("example.com:80").await.unwrap_err();
        assert_eq!(err.step(), Some(Step::Handshake));
        assert!(matches!(err.root(), TunnelError::Handshake(_)));
        assert_eq!(server.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn silent_server_times_out_in_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("tcp://{}", listener.local_addr().unwrap());
        let _server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let dialer = Dialer::new(url, key()).with_options(fast());
        let err = dialer.connect("example.com:80").await.unwrap_err();
        assert_eq!(err.step(), Some(Step::Handshake));
        assert!(matches!(err.root(), TunnelError::Timeout));
    }

    #[tokio::test]
    async fn rejected_credentials_fail_authenticate_step() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("tcp://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            send_descriptor(&mut stream, &generate_nonce()).await.unwrap();
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            stream.write_all(&[0x05, 0x02]).await.unwrap();
            let mut buf = [0u8; 512];
            let _ = stream.read(&mut buf).await;
            stream.write_all(&[0x01, 0x01]).await.unwrap();
        });

        let dialer = Dialer::new(url, key()).with_options(fast());
        let err = dialer.connect("example.com:80").await.unwrap_err();
        assert_eq!(err.step(), Some(Step::Authenticate));
        assert!(err
            .to_string()
            .ends_with("username/password authentication failed"));
    }
}
