//! burrow-client: dials authenticated tunnels through a burrow server.
//!
//! # Quick Start
//!
//! ```no_run
//! use burrow_client::Dialer;
//! use burrow_core::Key;
//! use tokio::io::{AsyncReadExt, AsyncWriteExt};
//!
//! # async fn example() -> burrow_core::TunnelResult<()> {
//! let dialer = Dialer::new("wss://gateway.example.com/", Key::new(1, b"secret".to_vec()));
//! let mut stream = dialer.dial("tcp", "db.internal:5432").await?;
//! stream.write_all(b"hello world").await?;
//!
//! let mut buf = vec![0u8; 4096];
//! let n = stream.read(&mut buf).await?;
//! println!("{}", String::from_utf8_lossy(&buf[..n]));
//! # Ok(())
//! # }
//! ```

pub mod dialer;
pub mod transport;

// Re-export primary public types.
pub use dialer::{DialOptions, Dialer};
pub use transport::{detect_transport, AnyStream, TransportKind};

// Re-export burrow-core error types for convenience.
pub use burrow_core::{TunnelError, TunnelResult};
