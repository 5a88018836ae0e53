//! burrow-core: Shared protocol library for burrow tunnels.
//!
//! Provides the WebSocket byte-stream adapter, the connect-descriptor
//! handshake, pre-shared-key HMAC challenge signatures, tunnel session state,
//! and the SOCKS5 engine the tunnel runs its destination negotiation over.

pub mod auth;
pub mod codec;
pub mod error;
pub mod handshake;
pub mod session;
pub mod socks5;
pub mod stream;

// Re-export commonly used items at crate root.
pub use auth::{sign, validate, Key, KeyRing, Signature};
pub use error::{Step, TunnelError, TunnelResult};
pub use handshake::{ConnectDescriptor, Nonce, NONCE_SIZE, PROTOCOL_VERSION, SOFTWARE_ID};
pub use session::{SessionState, TunnelSession};
pub use socks5::{Authenticator, Command, DestAddr, Request, Resolver, RuleSet};
pub use stream::{KeepAlive, WsConn, WsStream};
