//! Accept side of a tunnel session.
//!
//! Runs on its own task for every accepted transport connection: issue the
//! nonce in a connect descriptor, then serve SOCKS5 over the same stream with
//! this connection's authenticator and the shared access list and resolver.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use burrow_core::error::{Step, TunnelResult};
use burrow_core::handshake::{generate_nonce, send_descriptor};
use burrow_core::session::{bounded, SessionState, TunnelSession};
use burrow_core::socks5::server::Socks5Server;
use burrow_core::socks5::{Resolver, RuleSet};
use burrow_core::KeyRing;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::auth::NonceAuthenticator;

/// Bound on sending the connect descriptor.
pub const DESCRIPTOR_TIMEOUT: Duration = Duration::from_secs(10);

/// Read-only state shared by every session of one server.
#[derive(Clone)]
pub struct SessionContext {
    pub keys: Arc<KeyRing>,
    pub rules: Arc<dyn RuleSet>,
    pub resolver: Arc<dyn Resolver>,
    pub connect_timeout: Duration,
}

/// Run the accept algorithm over `io` until the relay finishes.
///
/// Failures come back wrapped with the step that raised them; the transport
/// is closed either way.
pub async fn serve_connection<IO>(
    io: IO,
    remote_addr: Option<SocketAddr>,
    ctx: &SessionContext,
) -> TunnelResult<()>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let mut session = TunnelSession::new(io);
    let nonce = generate_nonce();

    let sent = bounded(DESCRIPTOR_TIMEOUT, send_descriptor(session.io_mut(), &nonce)).await;
    session.settle(Step::Handshake, sent).await?;
    session.advance(SessionState::HandshakeExchanged)?;

    let socks = Socks5Server::new(
        Arc::new(NonceAuthenticator::new(Arc::clone(&ctx.keys), nonce)),
        Arc::clone(&ctx.rules),
        Arc::clone(&ctx.resolver),
    )
    .with_connect_timeout(ctx.connect_timeout);

    let served = socks.serve(session.io_mut(), remote_addr).await;
    session.settle(Step::Serve, served).await?;

    if let Err(e) = session.close().await {
        debug!(error = %e, "error closing tunnel transport");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use burrow_core::error::TunnelError;
    use burrow_core::handshake::receive_descriptor;
    use burrow_core::socks5::client;
    use burrow_core::{auth, Key};
    use std::net::IpAddr;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use crate::gateway::{AccessList, AllowedTarget};

    struct NoDns;

    #[async_trait]
    impl Resolver for NoDns {
        async fn resolve(&self, name: &str) -> TunnelResult<IpAddr> {
            Err(TunnelError::Resolution(format!("no resolver for {name}")))
        }
    }

    async fn echo_target() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 64];
                    let n = stream.read(&mut buf).await.unwrap();
                    stream.write_all(&buf[..n]).await.unwrap();
                });
            }
        });
        addr
    }

    fn context(target: SocketAddr) -> SessionContext {
        SessionContext {
            keys: Arc::new(KeyRing::new([Key::new(3, b"k3y".to_vec())]).unwrap()),
            rules: Arc::new(AccessList::new([AllowedTarget::new(
                target.ip().to_string(),
                target.port(),
            )])),
            resolver: Arc::new(NoDns),
            connect_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn serves_signed_connect() {
        let target = echo_target().await;
        let ctx = context(target);
        let (mut client_io, server_io) = duplex(4096);
        let server = tokio::spawn(async move { serve_connection(server_io, None, &ctx).await });

        let (_, nonce) = receive_descriptor(&mut client_io).await.unwrap();
        let sig = auth::sign(&Key::new(3, b"k3y".to_vec()), &nonce);
        client::authenticate(&mut client_io, &sig.date, &sig.blob)
            .await
            .unwrap();
        client::connect(&mut client_io, &target.to_string())
            .await
            .unwrap();

        client_io.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client_io.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        drop(client_io);
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn wrong_secret_fails_serve_step() {
        let target = echo_target().await;
        let ctx = context(target);
        let (mut client_io, server_io) = duplex(4096);
        let server = tokio::spawn(async move { serve_connection(server_io, None, &ctx).await });

        let (_, nonce) = receive_descriptor(&mut client_io).await.unwrap();
        let sig = auth::sign(&Key::new(3, b"wrong".to_vec()), &nonce);
        let err = client::authenticate(&mut client_io, &sig.date, &sig.blob)
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Auth(_)));

        let err = server.await.unwrap().unwrap_err();
        assert_eq!(err.step(), Some(Step::Serve));
        assert!(matches!(err.root(), TunnelError::Auth(_)));
    }

    #[tokio::test]
    async fn each_connection_gets_a_fresh_nonce() {
        let ctx = context("127.0.0.1:9".parse().unwrap());
        let mut nonces = Vec::new();
        for _ in 0..2 {
            let ctx = ctx.clone();
            let (mut client_io, server_io) = duplex(4096);
            tokio::spawn(async move { serve_connection(server_io, None, &ctx).await });
            let (_, nonce) = receive_descriptor(&mut client_io).await.unwrap();
            nonces.push(nonce);
        }
        assert_ne!(nonces[0], nonces[1]);
    }

    #[tokio::test]
    async fn denied_target_is_not_dialed() {
        let target = echo_target().await;
        let ctx = context(target);
        let (mut client_io, server_io) = duplex(4096);
        let server = tokio::spawn(async move { serve_connection(server_io, None, &ctx).await });

        let (_, nonce) = receive_descriptor(&mut client_io).await.unwrap();
        let sig = auth::sign(&Key::new(3, b"k3y".to_vec()), &nonce);
        client::authenticate(&mut client_io, &sig.date, &sig.blob)
            .await
            .unwrap();
        let other = format!("{}:{}", target.ip(), target.port().wrapping_add(1));
        let err = client::connect(&mut client_io, &other).await.unwrap_err();
        assert!(matches!(err, TunnelError::AccessDenied(_)));

        let err = server.await.unwrap().unwrap_err();
        assert!(matches!(err.root(), TunnelError::AccessDenied(_)));
    }
}
