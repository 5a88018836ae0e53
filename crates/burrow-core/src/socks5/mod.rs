//! SOCKS5 (RFC 1928) with username/password auth (RFC 1929).
//!
//! The tunnel reuses this sub-protocol unmodified: the signed date and blob
//! ride in the username and password fields, and CONNECT names the
//! destination. [`client`] drives the dialing side; [`server`] serves the
//! accepting side through three injected capabilities.

pub mod client;
pub mod server;

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{TunnelError, TunnelResult};

pub(crate) const SOCKS5_VERSION: u8 = 0x05;
pub(crate) const AUTH_VERSION: u8 = 0x01;
pub(crate) const AUTH_SUCCESS: u8 = 0x00;
pub(crate) const AUTH_FAILURE: u8 = 0x01;
pub(crate) const MAX_FIELD_LEN: usize = 255;

pub(crate) const ATYP_IPV4: u8 = 0x01;
pub(crate) const ATYP_DOMAIN: u8 = 0x03;
pub(crate) const ATYP_IPV6: u8 = 0x04;

/// Authentication methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthMethod {
    NoAuth = 0x00,
    UsernamePassword = 0x02,
    NoAcceptable = 0xFF,
}

/// SOCKS5 commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Bind,
    UdpAssociate,
    Unknown(u8),
}

impl Command {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x01 => Command::Connect,
            0x02 => Command::Bind,
            0x03 => Command::UdpAssociate,
            other => Command::Unknown(other),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Connect => f.write_str("CONNECT"),
            Command::Bind => f.write_str("BIND"),
            Command::UdpAssociate => f.write_str("UDP ASSOCIATE"),
            Command::Unknown(b) => write!(f, "unknown(0x{b:02x})"),
        }
    }
}

/// Reply codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyCode {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    NotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl ReplyCode {
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0x00 => ReplyCode::Succeeded,
            0x01 => ReplyCode::GeneralFailure,
            0x02 => ReplyCode::NotAllowed,
            0x03 => ReplyCode::NetworkUnreachable,
            0x04 => ReplyCode::HostUnreachable,
            0x05 => ReplyCode::ConnectionRefused,
            0x06 => ReplyCode::TtlExpired,
            0x07 => ReplyCode::CommandNotSupported,
            0x08 => ReplyCode::AddressTypeNotSupported,
            _ => return None,
        })
    }

    fn describe(self) -> &'static str {
        match self {
            ReplyCode::Succeeded => "succeeded",
            ReplyCode::GeneralFailure => "general failure",
            ReplyCode::NotAllowed => "connection not allowed by ruleset",
            ReplyCode::NetworkUnreachable => "network unreachable",
            ReplyCode::HostUnreachable => "host unreachable",
            ReplyCode::ConnectionRefused => "connection refused",
            ReplyCode::TtlExpired => "TTL expired",
            ReplyCode::CommandNotSupported => "command not supported",
            ReplyCode::AddressTypeNotSupported => "address type not supported",
        }
    }
}

impl fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Destination named in a request.
///
/// `fqdn` is set when the client sent a domain name; `ip` is set when it sent
/// an address literal, or once the server resolved the name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestAddr {
    pub fqdn: String,
    pub ip: Option<IpAddr>,
    pub port: u16,
}

impl DestAddr {
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.ip.map(|ip| SocketAddr::new(ip, self.port))
    }
}

impl fmt::Display for DestAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.fqdn.is_empty(), self.ip) {
            (false, Some(ip)) => write!(f, "{} ({}):{}", self.fqdn, ip, self.port),
            (false, None) => write!(f, "{}:{}", self.fqdn, self.port),
            (true, Some(ip)) => write!(f, "{}", SocketAddr::new(ip, self.port)),
            (true, None) => write!(f, "<unknown>:{}", self.port),
        }
    }
}

/// A parsed request, as handed to the [`RuleSet`].
#[derive(Debug, Clone)]
pub struct Request {
    pub command: Command,
    pub dest: DestAddr,
    pub remote_addr: Option<SocketAddr>,
}

/// Checks username/password credentials.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, username: &str, password: &str) -> TunnelResult<()>;
}

/// Decides whether a request may proceed.
pub trait RuleSet: Send + Sync {
    fn allow(&self, request: &Request) -> bool;
}

/// Resolves destination names.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, name: &str) -> TunnelResult<IpAddr>;
}

/// An address as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WireAddr {
    Ip(IpAddr),
    Domain(String),
}

impl WireAddr {
    /// Parse `host` the way a client names a target: address literals
    /// (bracketed or not) become IPs, anything else a domain.
    pub(crate) fn from_host(host: &str) -> TunnelResult<Self> {
        let bare = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if let Ok(ip) = bare.parse::<IpAddr>() {
            return Ok(WireAddr::Ip(ip));
        }
        if host.is_empty() || host.len() > MAX_FIELD_LEN {
            return Err(TunnelError::Protocol(format!(
                "invalid destination host length: {}",
                host.len()
            )));
        }
        Ok(WireAddr::Domain(host.to_string()))
    }

    pub(crate) fn encode(&self, port: u16, out: &mut Vec<u8>) {
        match self {
            WireAddr::Ip(IpAddr::V4(v4)) => {
                out.push(ATYP_IPV4);
                out.extend_from_slice(&v4.octets());
            }
            WireAddr::Ip(IpAddr::V6(v6)) => {
                out.push(ATYP_IPV6);
                out.extend_from_slice(&v6.octets());
            }
            WireAddr::Domain(name) => {
                out.push(ATYP_DOMAIN);
                out.push(name.len() as u8);
                out.extend_from_slice(name.as_bytes());
            }
        }
        out.extend_from_slice(&port.to_be_bytes());
    }
}

/// Read the address body for `atyp` followed by the port.
pub(crate) async fn read_addr<R>(reader: &mut R, atyp: u8) -> TunnelResult<(WireAddr, u16)>
where
    R: AsyncRead + Unpin,
{
    let addr = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            reader.read_exact(&mut octets).await?;
            WireAddr::Ip(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            reader.read_exact(&mut octets).await?;
            WireAddr::Ip(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        ATYP_DOMAIN => {
            let len = reader.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            reader.read_exact(&mut name).await?;
            let name = String::from_utf8(name)
                .map_err(|_| TunnelError::Protocol("domain name is not valid UTF-8".into()))?;
            WireAddr::Domain(name)
        }
        other => {
            return Err(TunnelError::Protocol(format!(
                "unsupported address type: 0x{other:02x}"
            )))
        }
    };
    let port = reader.read_u16().await?;
    Ok((addr, port))
}

/// Split `host:port`, accepting bracketed IPv6 hosts.
pub(crate) fn split_host_port(target: &str) -> TunnelResult<(&str, u16)> {
    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| TunnelError::Protocol(format!("missing port in address: {target}")))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| TunnelError::Protocol(format!("invalid port in address: {target}")))?;
    Ok((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_parsing() {
        assert_eq!(
            WireAddr::from_host("127.0.0.1").unwrap(),
            WireAddr::Ip("127.0.0.1".parse().unwrap())
        );
        assert_eq!(
            WireAddr::from_host("[::1]").unwrap(),
            WireAddr::Ip("::1".parse().unwrap())
        );
        assert_eq!(
            WireAddr::from_host("example.com").unwrap(),
            WireAddr::Domain("example.com".into())
        );
        assert!(WireAddr::from_host("").is_err());
        assert!(WireAddr::from_host(&"a".repeat(256)).is_err());
    }

    #[test]
    fn host_port_splitting() {
        assert_eq!(split_host_port("example.com:443").unwrap(), ("example.com", 443));
        assert_eq!(split_host_port("[::1]:80").unwrap(), ("[::1]", 80));
        assert!(split_host_port("example.com").is_err());
        assert!(split_host_port("example.com:99999").is_err());
    }

    #[tokio::test]
    async fn encoded_addresses_read_back() {
        for (addr, port) in [
            (WireAddr::Ip("10.1.2.3".parse().unwrap()), 80u16),
            (WireAddr::Ip("2001:db8::1".parse().unwrap()), 8443),
            (WireAddr::Domain("internal.example".into()), 22),
        ] {
            let mut wire = Vec::new();
            addr.encode(port, &mut wire);
            let mut reader = &wire[1..];
            let (got, got_port) = read_addr(&mut reader, wire[0]).await.unwrap();
            assert_eq!(got, addr);
            assert_eq!(got_port, port);
        }
    }

    #[test]
    fn dest_display() {
        let dest = DestAddr {
            fqdn: "db.internal".into(),
            ip: Some("10.0.0.5".parse().unwrap()),
            port: 5432,
        };
        assert_eq!(dest.to_string(), "db.internal (10.0.0.5):5432");
        assert_eq!(dest.socket_addr().unwrap().to_string(), "10.0.0.5:5432");
    }
}
