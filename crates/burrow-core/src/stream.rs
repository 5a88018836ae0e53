//! Byte-stream adapter over a WebSocket.
//!
//! [`WsConn`] is a cheap-clone handle with `read`/`write`/`close`/`send_ping`
//! and independent read and write deadlines. [`WsStream`] wraps it in
//! `AsyncRead`/`AsyncWrite` so the proxy sub-protocol and relays can run on it
//! like on any socket.
//!
//! Framing rules:
//! - every `write` emits exactly one binary frame
//! - a frame larger than the read buffer is handed out over several reads
//! - reads never merge two frames

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{ready, Context, Poll};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

use crate::error::{TunnelError, TunnelResult};

/// Bound on close notifications and pings.
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);

/// Default interval between keep-alive pings.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

const READ_CHUNK: usize = 16 * 1024;

type Deadline = watch::Sender<Option<Instant>>;

struct Reader<S> {
    source: SplitStream<WebSocketStream<S>>,
    read_buf: Vec<u8>,
    read_offset: usize,
}

impl<S> Reader<S> {
    fn has_remainder(&self) -> bool {
        self.read_offset < self.read_buf.len()
    }

    fn drain(&mut self, buf: &mut [u8]) -> usize {
        let available = self.read_buf.len() - self.read_offset;
        let n = available.min(buf.len());
        buf[..n].copy_from_slice(&self.read_buf[self.read_offset..self.read_offset + n]);
        self.read_offset += n;
        if self.read_offset >= self.read_buf.len() {
            self.read_buf.clear();
            self.read_offset = 0;
        }
        n
    }

    fn take(&mut self, data: Vec<u8>, buf: &mut [u8]) -> usize {
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        if n < data.len() {
            self.read_buf = data;
            self.read_offset = n;
        }
        n
    }
}

struct Shared<S> {
    reader: Mutex<Reader<S>>,
    writer: Mutex<SplitSink<WebSocketStream<S>, Message>>,
    closed: AtomicBool,
    read_deadline: Deadline,
    write_deadline: Deadline,
}

/// Shared handle to one adapted WebSocket connection.
pub struct WsConn<S> {
    shared: Arc<Shared<S>>,
}

impl<S> Clone for WsConn<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S> WsConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(ws: WebSocketStream<S>) -> Self {
        let (sink, source) = ws.split();
        let (read_deadline, _) = watch::channel(None);
        let (write_deadline, _) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                reader: Mutex::new(Reader {
                    source,
                    read_buf: Vec::new(),
                    read_offset: 0,
                }),
                writer: Mutex::new(sink),
                closed: AtomicBool::new(false),
                read_deadline,
                write_deadline,
            }),
        }
    }

    /// Read into `buf`. `Ok(0)` means the peer closed the connection.
    ///
    /// Concurrent readers serialize on an internal lock.
    pub async fn read(&self, buf: &mut [u8]) -> TunnelResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut deadline = self.shared.read_deadline.subscribe();
        tokio::select! {
            biased;
            _ = expired(&mut deadline) => Err(TunnelError::Timeout),
            result = self.read_locked(buf) => result,
        }
    }

    async fn read_locked(&self, buf: &mut [u8]) -> TunnelResult<usize> {
        let mut reader = self.shared.reader.lock().await;
        if reader.has_remainder() {
            return Ok(reader.drain(buf));
        }

        loop {
            let data = match reader.source.next().await {
                Some(Ok(Message::Binary(data))) => data,
                Some(Ok(Message::Text(text))) => text.into_bytes(),
                Some(Ok(Message::Close(_))) | None => return Ok(0),
                Some(Ok(_)) => continue,
                Some(Err(e)) if peer_gone(&e) => return Ok(0),
                Some(Err(e)) => {
                    return Err(TunnelError::Transport(format!("websocket read error: {e}")))
                }
            };
            if data.is_empty() {
                continue;
            }
            return Ok(reader.take(data, buf));
        }
    }

    /// Send `data` as exactly one binary frame.
    pub async fn write(&self, data: &[u8]) -> TunnelResult<usize> {
        if self.is_closed() {
            return Err(TunnelError::Closed);
        }
        let mut deadline = self.shared.write_deadline.subscribe();
        let send = async {
            let mut sink = self.shared.writer.lock().await;
            sink.send(Message::Binary(data.to_vec())).await
        };
        tokio::select! {
            biased;
            _ = expired(&mut deadline) => Err(TunnelError::Timeout),
            result = send => match result {
                Ok(()) => Ok(data.len()),
                Err(e) if peer_gone(&e) => Err(TunnelError::Closed),
                Err(e) => Err(TunnelError::Transport(format!("websocket write error: {e}"))),
            },
        }
    }

    /// Send a normal-closure notification and release the connection.
    ///
    /// Only the first call does anything. A peer that already closed is not
    /// an error.
    pub async fn close(&self) -> TunnelResult<()> {
        if self
            .shared
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        let notify = async {
            let mut sink = self.shared.writer.lock().await;
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            };
            match sink.send(Message::Close(Some(frame))).await {
                Err(e) if !peer_gone(&e) => return Err(e),
                _ => {}
            }
            match sink.close().await {
                Err(e) if !peer_gone(&e) => Err(e),
                _ => Ok(()),
            }
        };

        match tokio::time::timeout(CONTROL_TIMEOUT, notify).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TunnelError::Transport(format!("websocket close error: {e}"))),
            Err(_) => Err(TunnelError::Timeout),
        }
    }

    /// Send a ping. `Err(Closed)` means the peer is already gone.
    pub async fn send_ping(&self) -> TunnelResult<()> {
        if self.is_closed() {
            return Err(TunnelError::Closed);
        }
        let ping = async {
            let mut sink = self.shared.writer.lock().await;
            sink.send(Message::Ping(Vec::new())).await
        };
        match tokio::time::timeout(CONTROL_TIMEOUT, ping).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if peer_gone(&e) => Err(TunnelError::Closed),
            Ok(Err(e)) => Err(TunnelError::Transport(format!("websocket ping error: {e}"))),
            Err(_) => Err(TunnelError::Timeout),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Deadline for pending and future reads. `None` clears it.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.shared.read_deadline.send_replace(deadline);
    }

    /// Deadline for pending and future writes. `None` clears it.
    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.shared.write_deadline.send_replace(deadline);
    }

    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    /// Ping the peer every `interval` until the connection goes away.
    ///
    /// Returns `None` for a zero interval. The task never closes the
    /// connection; it stops on the first failed ping and is aborted when the
    /// returned handle is dropped.
    pub fn spawn_keepalive(&self, interval: Duration) -> Option<KeepAlive> {
        if interval.is_zero() {
            return None;
        }
        let weak: Weak<Shared<S>> = Arc::downgrade(&self.shared);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                let conn = WsConn { shared };
                match conn.send_ping().await {
                    Ok(()) => {}
                    Err(TunnelError::Closed) => {
                        debug!("websocket closed, stopping keep-alive");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "unable to send websocket keep-alive");
                        break;
                    }
                }
            }
        });
        Some(KeepAlive { handle })
    }
}

/// Handle to a running keep-alive task. Dropping it stops the task.
pub struct KeepAlive {
    handle: JoinHandle<()>,
}

impl KeepAlive {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Resolves once the watched deadline has passed, following updates.
async fn expired(rx: &mut watch::Receiver<Option<Instant>>) {
    loop {
        let current = *rx.borrow_and_update();
        match current {
            Some(at) if at <= Instant::now() => return,
            Some(at) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(at) => return,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            std::future::pending::<()>().await;
                        }
                    }
                }
            }
            None => {
                if rx.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        }
    }
}

/// Errors meaning the peer already closed or is closing.
fn peer_gone(e: &WsError) -> bool {
    matches!(
        e,
        WsError::ConnectionClosed
            | WsError::AlreadyClosed
            | WsError::Protocol(ProtocolError::SendAfterClosing)
            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake)
    )
}

type Pending<T> = Pin<Box<dyn Future<Output = TunnelResult<T>> + Send>>;

/// `AsyncRead` + `AsyncWrite` view of a [`WsConn`].
pub struct WsStream<S> {
    conn: WsConn<S>,
    pending_read: Option<Pending<Vec<u8>>>,
    pending_write: Option<Pending<usize>>,
    pending_close: Option<Pending<()>>,
    carry: Vec<u8>,
    carry_offset: usize,
    _keepalive: Option<KeepAlive>,
}

impl<S> WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(conn: WsConn<S>) -> Self {
        Self {
            conn,
            pending_read: None,
            pending_write: None,
            pending_close: None,
            carry: Vec::new(),
            carry_offset: 0,
            _keepalive: None,
        }
    }

    /// Wrap `conn` and tie a keep-alive task to this stream's lifetime.
    pub fn with_keepalive(conn: WsConn<S>, interval: Duration) -> Self {
        let keepalive = conn.spawn_keepalive(interval);
        Self {
            _keepalive: keepalive,
            ..Self::new(conn)
        }
    }
}

impl<S> AsyncRead for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        if this.carry_offset < this.carry.len() {
            let available = &this.carry[this.carry_offset..];
            let n = available.len().min(buf.remaining());
            buf.put_slice(&available[..n]);
            this.carry_offset += n;
            if this.carry_offset >= this.carry.len() {
                this.carry.clear();
                this.carry_offset = 0;
            }
            return Poll::Ready(Ok(()));
        }

        let fut = this.pending_read.get_or_insert_with(|| {
            let conn = this.conn.clone();
            let read: Pending<Vec<u8>> = Box::pin(async move {
                let mut chunk = vec![0u8; READ_CHUNK];
                let n = conn.read(&mut chunk).await?;
                chunk.truncate(n);
                Ok(chunk)
            });
            read
        });
        let result = ready!(fut.as_mut().poll(cx));
        this.pending_read = None;

        let data = result.map_err(io::Error::from)?;
        let n = data.len().min(buf.remaining());
        buf.put_slice(&data[..n]);
        if n < data.len() {
            this.carry = data;
            this.carry_offset = n;
        }
        Poll::Ready(Ok(()))
    }
}

impl<S> AsyncWrite for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let fut = this.pending_write.get_or_insert_with(|| {
            let conn = this.conn.clone();
            let data = data.to_vec();
            let write: Pending<usize> = Box::pin(async move { conn.write(&data).await });
            write
        });
        let result = ready!(fut.as_mut().poll(cx));
        this.pending_write = None;
        Poll::Ready(result.map_err(io::Error::from))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(fut) = this.pending_write.as_mut() {
            let result = ready!(fut.as_mut().poll(cx));
            this.pending_write = None;
            result.map_err(io::Error::from)?;
        }
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(self.as_mut().poll_flush(cx))?;
        let this = self.get_mut();
        let fut = this.pending_close.get_or_insert_with(|| {
            let conn = this.conn.clone();
            let close: Pending<()> = Box::pin(async move { conn.close().await });
            close
        });
        let result = ready!(fut.as_mut().poll(cx));
        this.pending_close = None;
        Poll::Ready(result.map_err(io::Error::from))
    }
}
