//! Per-connection tunnel session state.
//!
//! ```text
//! Connecting -> HandshakeExchanged -> Authenticating -> TargetNegotiation -> Established
//!      \________________\__________________\__________________\_______________\__> Failed | Closed
//! ```

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::{Step, TunnelError, TunnelResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    HandshakeExchanged,
    Authenticating,
    TargetNegotiation,
    Established,
    Failed,
    Closed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Failed | SessionState::Closed)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_advance(self, next: SessionState) -> bool {
        use SessionState::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (_, Failed | Closed)
                | (Connecting, HandshakeExchanged)
                | (HandshakeExchanged, Authenticating)
                | (Authenticating, TargetNegotiation)
                | (TargetNegotiation, Established)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Connecting => "connecting",
            SessionState::HandshakeExchanged => "handshake-exchanged",
            SessionState::Authenticating => "authenticating",
            SessionState::TargetNegotiation => "target-negotiation",
            SessionState::Established => "established",
            SessionState::Failed => "failed",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// One tunnel session, owned by the task handling its connection.
pub struct TunnelSession<IO> {
    io: IO,
    state: SessionState,
}

/// Bound `fut` by `limit`, mapping expiry to [`TunnelError::Timeout`].
pub async fn bounded<T, F>(limit: Duration, fut: F) -> TunnelResult<T>
where
    F: Future<Output = TunnelResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(TunnelError::Timeout),
    }
}

impl<IO> TunnelSession<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(io: IO) -> Self {
        Self {
            io,
            state: SessionState::Connecting,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn io_mut(&mut self) -> &mut IO {
        &mut self.io
    }

    /// Move to `next`, rejecting out-of-order transitions.
    pub fn advance(&mut self, next: SessionState) -> TunnelResult<()> {
        if !self.state.can_advance(next) {
            return Err(TunnelError::Protocol(format!(
                "invalid session transition: {} -> {}",
                self.state, next
            )));
        }
        debug!(from = %self.state, to = %next, "tunnel session state");
        self.state = next;
        Ok(())
    }

    /// Settle the outcome of one establishment step.
    ///
    /// On failure the transport is shut down, the session is marked failed
    /// and the error comes back wrapped with `step`.
    pub async fn settle<T>(&mut self, step: Step, result: TunnelResult<T>) -> TunnelResult<T> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => Err(self.fail(e, step).await),
        }
    }

    /// Shut down the transport, mark the session failed and wrap `err`.
    pub async fn fail(&mut self, err: TunnelError, step: Step) -> TunnelError {
        if let Err(close_err) = self.io.shutdown().await {
            debug!(error = %close_err, "error closing failed session transport");
        }
        if !self.state.is_terminal() {
            self.state = SessionState::Failed;
        }
        err.at(step)
    }

    /// Shut down the transport and mark the session closed.
    pub async fn close(&mut self) -> TunnelResult<()> {
        if self.state.is_terminal() {
            return Ok(());
        }
        self.state = SessionState::Closed;
        self.io.shutdown().await?;
        Ok(())
    }

    /// Hand the stream to the caller once the session is established.
    pub fn into_stream(self) -> TunnelResult<IO> {
        if self.state != SessionState::Established {
            return Err(TunnelError::Protocol(format!(
                "session not established: {}",
                self.state
            )));
        }
        Ok(self.io)
    }
}
