//! Transport selection for burrow.
//!
//! Selects the byte stream the tunnel runs over based on the URL scheme:
//! - `ws://` or `wss://` → WebSocket, adapted into a byte stream
//! - `tcp://host:port` → raw TCP

pub mod tcp;
pub mod websocket;

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

use burrow_core::error::{TunnelError, TunnelResult};

use crate::dialer::DialOptions;

pub use websocket::WebSocketStream;

/// Transport kind, inferred from the server URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    WebSocket,
    Tcp,
}

/// Enum-dispatched tunnel stream.
pub enum AnyStream {
    WebSocket(WebSocketStream),
    Tcp(TcpStream),
}

impl AnyStream {
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::WebSocket(_) => TransportKind::WebSocket,
            Self::Tcp(_) => TransportKind::Tcp,
        }
    }
}

impl fmt::Debug for AnyStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyStream")
            .field("kind", &self.kind())
            .finish_non_exhaustive()
    }
}

impl AsyncRead for AnyStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::WebSocket(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tcp(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for AnyStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::WebSocket(s) => Pin::new(s).poll_write(cx, data),
            Self::Tcp(s) => Pin::new(s).poll_write(cx, data),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::WebSocket(s) => Pin::new(s).poll_flush(cx),
            Self::Tcp(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::WebSocket(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tcp(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Determine the transport kind from a URL string.
pub fn detect_transport(url: &str) -> TunnelResult<TransportKind> {
    let lower = url.to_lowercase();
    if lower.starts_with("ws://") || lower.starts_with("wss://") {
        Ok(TransportKind::WebSocket)
    } else if lower.starts_with("tcp://") {
        Ok(TransportKind::Tcp)
    } else {
        Err(TunnelError::Transport(format!(
            "unsupported URL scheme: {url} (expected ws://, wss://, or tcp://)"
        )))
    }
}

/// Open the transport named by `url`.
pub async fn connect(url: &str, options: &DialOptions) -> TunnelResult<AnyStream> {
    match detect_transport(url)? {
        TransportKind::WebSocket => {
            let stream = websocket::connect(url, options.keepalive_interval).await?;
            Ok(AnyStream::WebSocket(stream))
        }
        TransportKind::Tcp => {
            let stream = tcp::connect(url).await?;
            Ok(AnyStream::Tcp(stream))
        }
    }
}
