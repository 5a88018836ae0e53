//! burrow-server: accepts tunnels over WebSocket or raw TCP, authenticates
//! them against a pre-shared key ring and proxies to allow-listed
//! destinations.

pub mod auth;
pub mod config;
pub mod gateway;
pub mod server;
pub mod session;
pub mod transport;

pub use config::{Overrides, ServerConfig};
pub use gateway::{AccessList, AllowedTarget};
pub use server::TunnelServer;
