//! Listeners for incoming tunnel transports.
//!
//! Both listeners hand accepted connections to the server loop through an
//! `mpsc` channel as [`Accepted`] values wrapping a [`TunnelStream`]:
//! - [`websocket`]: HTTP upgrade, then the WebSocket adapted into a byte stream
//! - [`tcp`]: the raw TCP stream as-is

pub mod tcp;
pub mod websocket;

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

pub use websocket::ServerWsStream;

/// Bound on queued, not yet served connections per listener.
const ACCEPT_QUEUE: usize = 64;

/// Enum-dispatched accepted stream.
pub enum TunnelStream {
    WebSocket(ServerWsStream),
    Tcp(TcpStream),
}

impl TunnelStream {
    pub fn transport(&self) -> &'static str {
        match self {
            Self::WebSocket(_) => "websocket",
            Self::Tcp(_) => "tcp",
        }
    }
}

impl AsyncRead for TunnelStream {
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

impl AsyncWrite for TunnelStream {
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

/// A connection ready for the accept algorithm.
pub struct Accepted {
    pub stream: TunnelStream,
    pub remote_addr: SocketAddr,
}

/// A running listener. Dropping it stops the accept loop.
pub struct Listener {
    local_addr: SocketAddr,
    rx: mpsc::Receiver<Accepted>,
}

impl Listener {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Next accepted connection, `None` once the accept loop has ended.
    pub async fn accept(&mut self) -> Option<Accepted> {
        self.rx.recv().await
    }
}
