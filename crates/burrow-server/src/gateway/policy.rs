//! Access control: which destinations a tunnel may be opened to.
//!
//! The policy is a plain ordered list of [`AllowedTarget`] entries. There are
//! no deny entries, so evaluation is a logical OR over the list: the first
//! matching entry and any other matching entry give the same answer.

use std::net::IpAddr;

use burrow_core::socks5::{Command, Request, RuleSet};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// One permitted destination.
///
/// `host` is compared as an exact string against either the FQDN the client
/// asked for or the textual form of the destination IP. No wildcards, no
/// suffix matching, no CIDR ranges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedTarget {
    /// Hostname or IP literal (e.g. `"db.internal"`, `"10.0.0.5"`).
    pub host: String,
    /// Destination port. Always required; there is no "any port" entry.
    pub port: u16,
}

impl AllowedTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Whether this entry covers the given destination.
    ///
    /// # Arguments
    ///
    /// * `fqdn` - The domain name from the request, empty when the client
    ///   sent an address literal.
    /// * `ip` - The destination IP, when known (literal or resolved).
    /// * `port` - The destination port.
    pub fn matches(&self, fqdn: &str, ip: Option<IpAddr>, port: u16) -> bool {
        if self.port != port {
            return false;
        }
        if !fqdn.is_empty() && self.host == fqdn {
            return true;
        }
        match ip {
            Some(ip) => self.host == ip.to_string(),
            None => false,
        }
    }
}

/// Ordered list of allowed destinations.
///
/// Built once from configuration and shared read-only by every session, so it
/// needs no locking.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessList {
    targets: Vec<AllowedTarget>,
}

impl AccessList {
    /// Create an access list from the given entries.
    ///
    /// # Arguments
    ///
    /// * `targets` - The allowed destinations, in configuration order.
    pub fn new(targets: impl IntoIterator<Item = AllowedTarget>) -> Self {
        Self {
            targets: targets.into_iter().collect(),
        }
    }

    pub fn targets(&self) -> &[AllowedTarget] {
        &self.targets
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Check a destination against every entry.
    ///
    /// Returns `true` if any entry matches; see [`AllowedTarget::matches`].
    pub fn permits(&self, fqdn: &str, ip: Option<IpAddr>, port: u16) -> bool {
        self.targets.iter().any(|t| t.matches(fqdn, ip, port))
    }
}

impl RuleSet for AccessList {
    /// Authorize one proxy request.
    ///
    /// Only CONNECT is ever allowed; BIND, UDP ASSOCIATE and unknown commands
    /// are denied regardless of destination. Every decision is logged as an
    /// audit event carrying the remote address and the requested host, IP and
    /// port.
    fn allow(&self, request: &Request) -> bool {
        let dest = &request.dest;
        let to_ip = dest.ip.map(|ip| ip.to_string()).unwrap_or_default();
        let remote = request
            .remote_addr
            .map(|addr| addr.to_string())
            .unwrap_or_default();

        let allowed =
            request.command == Command::Connect && self.permits(&dest.fqdn, dest.ip, dest.port);

        if allowed {
            info!(
                remote = %remote,
                to_host = %dest.fqdn,
                to_ip = %to_ip,
                to_port = dest.port,
                "proxy request allowed"
            );
        } else {
            warn!(
                remote = %remote,
                command = %request.command,
                to_host = %dest.fqdn,
                to_ip = %to_ip,
                to_port = dest.port,
                "proxy request denied"
            );
        }
        allowed
    }
}
