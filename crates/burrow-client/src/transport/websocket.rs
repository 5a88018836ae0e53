//! WebSocket transport.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, MaybeTlsStream};
use tracing::debug;

use burrow_core::error::{TunnelError, TunnelResult};
use burrow_core::stream::{WsConn, WsStream};

/// A client WebSocket adapted into a byte stream.
pub type WebSocketStream = WsStream<MaybeTlsStream<TcpStream>>;

/// Connect to `url` and start a keep-alive task owned by the returned stream.
pub async fn connect(url: &str, keepalive_interval: Duration) -> TunnelResult<WebSocketStream> {
    let (ws, _response) = connect_async(url)
        .await
        .map_err(|e| TunnelError::Transport(format!("WebSocket connect error: {e}")))?;

    debug!(url, "websocket transport connected");

    Ok(WsStream::with_keepalive(WsConn::new(ws), keepalive_interval))
}
