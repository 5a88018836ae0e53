//! Raw TCP listener.

use std::net::SocketAddr;

use burrow_core::error::{TunnelError, TunnelResult};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{Accepted, Listener, TunnelStream, ACCEPT_QUEUE};

/// Start the raw TCP listener.
///
/// The accept loop stops once the returned [`Listener`] is dropped.
pub async fn start_listener(bind_addr: SocketAddr) -> TunnelResult<Listener> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| TunnelError::Transport(format!("TCP bind {bind_addr} failed: {e}")))?;
    let local_addr = tcp_listener.local_addr()?;

    info!(addr = %local_addr, "TCP listener started");

    let (tx, rx) = mpsc::channel::<Accepted>(ACCEPT_QUEUE);

    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = tx.closed() => break,
                accepted = tcp_listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(remote = %addr, error = %e, "unable to set TCP_NODELAY");
                    }
                    let conn = Accepted {
                        stream: TunnelStream::Tcp(stream),
                        remote_addr: addr,
                    };
                    if tx.send(conn).await.is_err() {
                        warn!("TCP connection channel closed");
                        break;
                    }
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
        debug!(addr = %local_addr, "TCP listener stopped");
    });

    Ok(Listener { local_addr, rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn accepts_raw_connections() {
        let mut listener = start_listener("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr();
        assert_ne!(addr.port(), 0);

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut accepted = listener.accept().await.unwrap();
        assert_eq!(accepted.stream.transport(), "tcp");
        assert_eq!(accepted.remote_addr, client.local_addr().unwrap());

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        accepted.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn dropping_listener_frees_the_port() {
        let listener = start_listener("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr();
        drop(listener);
        // the accept loop only notices the closed channel when polled
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(TcpListener::bind(addr).await.is_ok());
    }
}
