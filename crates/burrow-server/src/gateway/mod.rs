//! Gateway module: what a tunnel may reach and how destination names resolve.
//!
//! # Submodules
//!
//! - **[`policy`]** - The [`AccessList`] of [`AllowedTarget`] entries. It
//!   implements the SOCKS5 engine's `RuleSet` capability and emits one audit
//!   event per decision.
//!
//! - **[`resolver`]** - The [`ResolverChain`], which tries each configured DNS
//!   server for at most one second before handing over to a fallback (the
//!   system resolver in the running server). Implements the `Resolver`
//!   capability.
//!
//! - **[`dns`]** - The DNS wire codec used by the chain's UDP lookups.
//!
//! # Data Flow
//!
//! ```text
//! Socks5Server::serve (burrow-core)
//!   -> ResolverChain::resolve   (FQDN destinations only)
//!   -> AccessList::allow        (command + FQDN + IP + port)
//!   -> TcpStream::connect
//! ```

pub mod dns;
pub mod policy;
pub mod resolver;

pub use policy::{AccessList, AllowedTarget};
pub use resolver::{ResolverChain, SystemResolver, UdpResolver};
