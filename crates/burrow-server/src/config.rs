//! Server configuration: TOML file + CLI/environment overrides.
//!
//! The merged result is a [`ServerConfig`] built once at startup and passed
//! to [`crate::server::TunnelServer::bind`]. Nothing below the binary reads
//! process state.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use burrow_core::error::{TunnelError, TunnelResult};
use burrow_core::{Key, KeyRing};
use serde::Deserialize;
use tracing::info;

use crate::gateway::{AccessList, AllowedTarget};

/// Default location of the config file.
pub const DEFAULT_CONFIG_PATH: &str = "~/.burrow/config.toml";

const DEFAULT_DNS_PORT: u16 = 53;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub keys: Vec<Key>,
    #[serde(default)]
    pub allowed_targets: Vec<AllowedTarget>,
    #[serde(default)]
    pub dns: DnsSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// WebSocket listener port, 0 disables it.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Raw TCP listener port, 0 disables it.
    #[serde(default)]
    pub tcp_port: u16,
    /// Seconds allowed for the outbound connect to a destination.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    /// Seconds between server-side WebSocket pings, 0 disables them.
    #[serde(default = "default_keepalive")]
    pub keepalive: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            http_port: default_http_port(),
            tcp_port: 0,
            connect_timeout: default_connect_timeout(),
            keepalive: default_keepalive(),
        }
    }
}

/// `[dns]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct DnsSection {
    /// Resolver addresses, `ip` or `ip:port`.
    #[serde(default)]
    pub servers: Vec<String>,
    /// Fall back to the system resolver after the configured servers.
    #[serde(default = "default_true")]
    pub system_fallback: bool,
}

impl Default for DnsSection {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            system_fallback: true,
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_connect_timeout() -> u64 {
    30
}
fn default_keepalive() -> u64 {
    30
}
fn default_true() -> bool {
    true
}

/// Values that take precedence over the config file.
///
/// List-valued fields hold the raw text of the matching environment
/// variables: JSON for keys and targets, comma-separated for DNS servers.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub bind: Option<String>,
    pub http_port: Option<u16>,
    pub tcp_port: Option<u16>,
    pub auth_keys: Option<String>,
    pub allowed_targets: Option<String>,
    pub dns_servers: Option<String>,
}

/// Resolved server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// WebSocket listener address, `None` when disabled.
    pub http_addr: Option<SocketAddr>,
    /// Raw TCP listener address, `None` when disabled.
    pub tcp_addr: Option<SocketAddr>,
    pub keys: KeyRing,
    pub access_list: AccessList,
    pub dns_servers: Vec<SocketAddr>,
    pub system_fallback: bool,
    pub connect_timeout: Duration,
    /// Interval for server-side WebSocket pings, `None` when disabled.
    pub keepalive: Option<Duration>,
}

impl ServerConfig {
    /// Load config from a TOML file, then apply overrides and validate.
    ///
    /// A missing file is not an error; defaults are used and the overrides
    /// must then supply keys and targets.
    pub fn load(config_path: Option<&Path>, overrides: &Overrides) -> TunnelResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    ConfigFile::parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Self::from_file(file_config, overrides)
    }

    /// Merge `overrides` into a parsed config file and validate the result.
    pub fn from_file(file: ConfigFile, overrides: &Overrides) -> TunnelResult<Self> {
        let bind = overrides.bind.clone().unwrap_or(file.server.bind);
        let bind: IpAddr = bind
            .parse()
            .map_err(|_| TunnelError::Config(format!("invalid bind address: {bind}")))?;
        let http_port = overrides.http_port.unwrap_or(file.server.http_port);
        let tcp_port = overrides.tcp_port.unwrap_or(file.server.tcp_port);

        let keys = match &overrides.auth_keys {
            Some(json) => serde_json::from_str::<Vec<Key>>(json)
                .map_err(|e| TunnelError::Config(format!("invalid auth keys: {e}")))?,
            None => file.keys,
        };
        let targets = match &overrides.allowed_targets {
            Some(json) => serde_json::from_str::<Vec<AllowedTarget>>(json)
                .map_err(|e| TunnelError::Config(format!("invalid allowed targets: {e}")))?,
            None => file.allowed_targets,
        };
        let dns_servers: Vec<String> = match &overrides.dns_servers {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            None => file.dns.servers,
        };

        let config = Self {
            http_addr: (http_port > 0).then(|| SocketAddr::new(bind, http_port)),
            tcp_addr: (tcp_port > 0).then(|| SocketAddr::new(bind, tcp_port)),
            keys: KeyRing::new(keys)?,
            access_list: AccessList::new(targets),
            dns_servers: dns_servers
                .iter()
                .map(|s| parse_dns_server(s))
                .collect::<TunnelResult<_>>()?,
            system_fallback: file.dns.system_fallback,
            connect_timeout: Duration::from_secs(file.server.connect_timeout),
            keepalive: (file.server.keepalive > 0)
                .then(|| Duration::from_secs(file.server.keepalive)),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants every running server relies on.
    pub fn validate(&self) -> TunnelResult<()> {
        if self.keys.is_empty() {
            return Err(TunnelError::Config("no auth keys configured".into()));
        }
        if self.access_list.is_empty() {
            return Err(TunnelError::Config("no allowed proxy targets configured".into()));
        }
        if self.http_addr.is_none() && self.tcp_addr.is_none() {
            return Err(TunnelError::Config(
                "no listener enabled: set http_port or tcp_port".into(),
            ));
        }
        Ok(())
    }
}

impl ConfigFile {
    pub fn parse(content: &str) -> TunnelResult<Self> {
        toml::from_str(content).map_err(|e| TunnelError::Config(format!("config parse error: {e}")))
    }
}

/// Parse a resolver address given as `ip` or `ip:port`.
pub fn parse_dns_server(s: &str) -> TunnelResult<SocketAddr> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(addr);
    }
    s.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, DEFAULT_DNS_PORT))
        .map_err(|_| TunnelError::Config(format!("invalid DNS server address: {s}")))
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
