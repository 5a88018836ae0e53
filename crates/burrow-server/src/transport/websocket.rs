//! WebSocket listener using tokio-tungstenite.
//!
//! Each accepted TCP connection is upgraded in its own task so a slow client
//! cannot stall the accept loop, then adapted into a byte stream with
//! [`WsStream`].

use std::net::SocketAddr;
use std::time::Duration;

use burrow_core::error::{TunnelError, TunnelResult};
use burrow_core::stream::{WsConn, WsStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{Accepted, Listener, TunnelStream, ACCEPT_QUEUE};

/// An accepted WebSocket adapted into a byte stream.
pub type ServerWsStream = WsStream<TcpStream>;

/// Bound on the HTTP upgrade of one connection.
const UPGRADE_TIMEOUT: Duration = Duration::from_secs(10);

/// Start the WebSocket listener.
///
/// Accepted connections ping their peer every `keepalive` when set. The
/// accept loop stops once the returned [`Listener`] is dropped.
pub async fn start_listener(
    bind_addr: SocketAddr,
    keepalive: Option<Duration>,
) -> TunnelResult<Listener> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| TunnelError::Transport(format!("WS bind {bind_addr} failed: {e}")))?;
    let local_addr = tcp_listener.local_addr()?;

    info!(addr = %local_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<Accepted>(ACCEPT_QUEUE);
    let interval = keepalive.unwrap_or(Duration::ZERO);

    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = tx.closed() => break,
                accepted = tcp_listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let upgrade = tokio_tungstenite::accept_async(stream);
                        match tokio::time::timeout(UPGRADE_TIMEOUT, upgrade).await {
                            Ok(Ok(ws)) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                let conn = Accepted {
                                    stream: TunnelStream::WebSocket(WsStream::with_keepalive(
                                        WsConn::new(ws),
                                        interval,
                                    )),
                                    remote_addr: addr,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Ok(Err(e)) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                            Err(_) => {
                                warn!(remote = %addr, "WebSocket handshake timed out");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
        debug!(addr = %local_addr, "WebSocket listener stopped");
    });

    Ok(Listener { local_addr, rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_tungstenite::tungstenite::Message;

    #[tokio::test]
    async fn upgrades_and_adapts() {
        let mut listener = start_listener("127.0.0.1:0".parse().unwrap(), None)
            .await
            .unwrap();
        let url = format!("ws://{}/", listener.local_addr());

        let (mut client, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        let mut accepted = listener.accept().await.unwrap();
        assert_eq!(accepted.stream.transport(), "websocket");

        client.send(Message::Binary(b"hello".to_vec())).await.unwrap();
        let mut buf = [0u8; 5];
        accepted.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        accepted.stream.write_all(b"back").await.unwrap();
        match client.next().await.unwrap().unwrap() {
            Message::Binary(data) => assert_eq!(data, b"back"),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_upgrade_does_not_stop_listener() {
        let mut listener = start_listener("127.0.0.1:0".parse().unwrap(), None)
            .await
            .unwrap();
        let addr = listener.local_addr();

        let mut plain = TcpStream::connect(addr).await.unwrap();
        plain.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        drop(plain);

        let url = format!("ws://{addr}/");
        let (_client, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        assert!(listener.accept().await.is_some());
    }
}
