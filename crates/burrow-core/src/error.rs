use std::fmt;
use std::io;

use thiserror::Error;

/// The step of tunnel establishment an error was raised from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Opening the underlying transport connection.
    Transport,
    /// Sending or reading the connect descriptor.
    Handshake,
    /// Username/password exchange carrying the signed challenge.
    Authenticate,
    /// CONNECT request naming the destination.
    Connect,
    /// Serving the proxy sub-protocol on the accepting side.
    Serve,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Step::Transport => "unable to connect on tunnel transport",
            Step::Handshake => "unable to exchange connect message",
            Step::Authenticate => "unable to authenticate tunnel",
            Step::Connect => "unable to connect to destination",
            Step::Serve => "error while serving proxy session",
        };
        f.write_str(s)
    }
}

/// Errors produced by the burrow protocol layer.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("handshake error: {0}")]
    Handshake(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("resolution failed: {0}")]
    Resolution(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("timeout")]
    Timeout,

    #[error("connection closed")]
    Closed,

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("{step}: {source}")]
    Step {
        step: Step,
        #[source]
        source: Box<TunnelError>,
    },
}

impl TunnelError {
    /// Wrap this error with the step that produced it.
    pub fn at(self, step: Step) -> Self {
        TunnelError::Step {
            step,
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping any step wrappers.
    pub fn root(&self) -> &TunnelError {
        let mut err = self;
        while let TunnelError::Step { source, .. } = err {
            err = source;
        }
        err
    }

    /// The outermost step this error was wrapped with, if any.
    pub fn step(&self) -> Option<Step> {
        match self {
            TunnelError::Step { step, .. } => Some(*step),
            _ => None,
        }
    }
}

impl From<ciborium::de::Error<io::Error>> for TunnelError {
    fn from(e: ciborium::de::Error<io::Error>) -> Self {
        TunnelError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<io::Error>> for TunnelError {
    fn from(e: ciborium::ser::Error<io::Error>) -> Self {
        TunnelError::Codec(e.to_string())
    }
}

impl From<TunnelError> for io::Error {
    fn from(e: TunnelError) -> Self {
        match e {
            TunnelError::Io(inner) => inner,
            TunnelError::Timeout => io::Error::new(io::ErrorKind::TimedOut, e),
            TunnelError::Closed => io::Error::new(io::ErrorKind::BrokenPipe, e),
            other => io::Error::other(other),
        }
    }
}

pub type TunnelResult<T> = Result<T, TunnelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_unwraps_nested_steps() {
        let err = TunnelError::Auth("bad signature".into())
            .at(Step::Authenticate)
            .at(Step::Connect);
        assert!(matches!(err.root(), TunnelError::Auth(_)));
        assert_eq!(err.step(), Some(Step::Connect));
    }

    #[test]
    fn step_display_names_failing_step() {
        let err = TunnelError::Handshake("connection nonce was all zeros".into()).at(Step::Handshake);
        let msg = err.to_string();
        assert!(msg.starts_with("unable to exchange connect message"));
        assert!(msg.contains("all zeros"));
    }

    #[test]
    fn timeout_maps_to_timed_out_io() {
        let io_err: io::Error = TunnelError::Timeout.into();
        assert_eq!(io_err.kind(), io::ErrorKind::TimedOut);
    }
}
