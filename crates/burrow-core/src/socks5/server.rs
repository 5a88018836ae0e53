//! Accepting half of the SOCKS5 exchange.
//!
//! [`Socks5Server::serve`] runs one session to completion: method
//! negotiation, credential check, request parsing, resolution, rule check,
//! outbound connect, then a bidirectional relay.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use super::{
    read_addr, AuthMethod, Authenticator, Command, DestAddr, ReplyCode, Request, Resolver,
    RuleSet, WireAddr, ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6, AUTH_FAILURE, AUTH_SUCCESS,
    AUTH_VERSION, SOCKS5_VERSION,
};
use crate::error::{TunnelError, TunnelResult};

/// Default bound on the outbound connect.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// A SOCKS5 server bound to one set of capabilities.
#[derive(Clone)]
pub struct Socks5Server {
    authenticator: Arc<dyn Authenticator>,
    rules: Arc<dyn RuleSet>,
    resolver: Arc<dyn Resolver>,
    connect_timeout: Duration,
}

impl Socks5Server {
    pub fn new(
        authenticator: Arc<dyn Authenticator>,
        rules: Arc<dyn RuleSet>,
        resolver: Arc<dyn Resolver>,
    ) -> Self {
        Self {
            authenticator,
            rules,
            resolver,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Serve one client over `io` until the relay finishes.
    pub async fn serve<S>(&self, io: &mut S, remote_addr: Option<SocketAddr>) -> TunnelResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        negotiate_method(io).await?;
        self.authenticate(io).await?;
        let request = read_request(io, remote_addr).await?;
        let mut target = self.establish(io, request).await?;

        let (sent, received) = tokio::io::copy_bidirectional(io, &mut target).await?;
        debug!(sent, received, "proxy relay finished");
        Ok(())
    }

    async fn authenticate<S>(&self, io: &mut S) -> TunnelResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let version = io.read_u8().await?;
        if version != AUTH_VERSION {
            return Err(TunnelError::Protocol(format!(
                "unsupported auth version: 0x{version:02x}"
            )));
        }
        let username = read_field(io).await?;
        let password = read_field(io).await?;

        let verdict = match (String::from_utf8(username), String::from_utf8(password)) {
            (Ok(user), Ok(pass)) => self.authenticator.authenticate(&user, &pass),
            _ => Err(TunnelError::Auth("credentials are not valid UTF-8".into())),
        };

        // The peer only ever learns pass/fail.
        let status = if verdict.is_ok() { AUTH_SUCCESS } else { AUTH_FAILURE };
        io.write_all(&[AUTH_VERSION, status]).await?;
        io.flush().await?;
        verdict
    }

    async fn establish<S>(&self, io: &mut S, mut request: Request) -> TunnelResult<TcpStream>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if request.dest.ip.is_none() {
            match self.resolver.resolve(&request.dest.fqdn).await {
                Ok(ip) => request.dest.ip = Some(ip),
                Err(e) => {
                    send_reply(io, ReplyCode::HostUnreachable, None).await?;
                    return Err(e);
                }
            }
        }

        if !self.rules.allow(&request) {
            send_reply(io, ReplyCode::NotAllowed, None).await?;
            return Err(TunnelError::AccessDenied(format!(
                "{} to {}",
                request.command, request.dest
            )));
        }

        if request.command != Command::Connect {
            send_reply(io, ReplyCode::CommandNotSupported, None).await?;
            return Err(TunnelError::Protocol(format!(
                "unsupported command: {}",
                request.command
            )));
        }

        let Some(addr) = request.dest.socket_addr() else {
            send_reply(io, ReplyCode::HostUnreachable, None).await?;
            return Err(TunnelError::Resolution(format!(
                "no address for {}",
                request.dest
            )));
        };

        let target = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                send_reply(io, connect_failure_reply(e.kind()), None).await?;
                return Err(TunnelError::Transport(format!("connect to {addr}: {e}")));
            }
            Err(_) => {
                send_reply(io, ReplyCode::HostUnreachable, None).await?;
                return Err(TunnelError::Timeout);
            }
        };

        let bound = match target.local_addr() {
            Ok(bound) => bound,
            Err(e) => {
                send_reply(io, ReplyCode::GeneralFailure, None).await?;
                return Err(TunnelError::Transport(format!("connect to {addr}: {e}")));
            }
        };
        send_reply(io, ReplyCode::Succeeded, Some(bound)).await?;
        debug!(to = %request.dest, "proxy connection established");
        Ok(target)
    }
}

/// Reply code for a failed outbound connect.
///
/// Failures on our own side of the connect are a general failure; anything
/// else means the destination could not be reached.
fn connect_failure_reply(kind: io::ErrorKind) -> ReplyCode {
    match kind {
        io::ErrorKind::ConnectionRefused => ReplyCode::ConnectionRefused,
        io::ErrorKind::AddrNotAvailable
        | io::ErrorKind::AddrInUse
        | io::ErrorKind::PermissionDenied
        | io::ErrorKind::InvalidInput
        | io::ErrorKind::OutOfMemory => ReplyCode::GeneralFailure,
        _ => ReplyCode::HostUnreachable,
    }
}

/// Require the username/password method.
async fn negotiate_method<S>(io: &mut S) -> TunnelResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 2];
    io.read_exact(&mut head).await?;
    if head[0] != SOCKS5_VERSION {
        return Err(TunnelError::Protocol(format!(
            "unsupported SOCKS version: 0x{:02x}",
            head[0]
        )));
    }
    let mut methods = vec![0u8; head[1] as usize];
    io.read_exact(&mut methods).await?;

    let wanted = AuthMethod::UsernamePassword as u8;
    if methods.contains(&wanted) {
        io.write_all(&[SOCKS5_VERSION, wanted]).await?;
        io.flush().await?;
        Ok(())
    } else {
        io.write_all(&[SOCKS5_VERSION, AuthMethod::NoAcceptable as u8])
            .await?;
        io.flush().await?;
        Err(TunnelError::Auth("no supported authentication mechanism".into()))
    }
}

async fn read_request<S>(io: &mut S, remote_addr: Option<SocketAddr>) -> TunnelResult<Request>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 4];
    io.read_exact(&mut head).await?;
    if head[0] != SOCKS5_VERSION {
        return Err(TunnelError::Protocol(format!(
            "unsupported SOCKS version: 0x{:02x}",
            head[0]
        )));
    }
    let atyp = head[3];
    if !matches!(atyp, ATYP_IPV4 | ATYP_DOMAIN | ATYP_IPV6) {
        send_reply(io, ReplyCode::AddressTypeNotSupported, None).await?;
        return Err(TunnelError::Protocol(format!(
            "unsupported address type: 0x{atyp:02x}"
        )));
    }

    let (addr, port) = read_addr(io, atyp).await?;
    let dest = match addr {
        WireAddr::Ip(ip) => DestAddr {
            fqdn: String::new(),
            ip: Some(ip),
            port,
        },
        WireAddr::Domain(fqdn) => DestAddr {
            fqdn,
            ip: None,
            port,
        },
    };

    Ok(Request {
        command: Command::from_byte(head[1]),
        dest,
        remote_addr,
    })
}

async fn read_field<S>(io: &mut S) -> TunnelResult<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let len = io.read_u8().await? as usize;
    let mut field = vec![0u8; len];
    io.read_exact(&mut field).await?;
    Ok(field)
}

async fn send_reply<S>(io: &mut S, code: ReplyCode, bound: Option<SocketAddr>) -> TunnelResult<()>
where
    S: AsyncWrite + Unpin,
{
    let bound = bound.unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
    let mut msg = vec![SOCKS5_VERSION, code as u8, 0x00];
    WireAddr::Ip(bound.ip()).encode(bound.port(), &mut msg);
    io.write_all(&msg).await?;
    io.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socks5::client;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::duplex;
    use tokio::net::TcpListener;

    struct FixedCredentials;

    impl Authenticator for FixedCredentials {
        fn authenticate(&self, username: &str, password: &str) -> TunnelResult<()> {
            if username == "date" && password == "blob" {
                Ok(())
            } else {
                Err(TunnelError::Auth(format!("bad password for {username}")))
            }
        }
    }

    struct AllowPort(u16);

    impl RuleSet for AllowPort {
        fn allow(&self, request: &Request) -> bool {
            request.command == Command::Connect && request.dest.port == self.0
        }
    }

    struct StaticResolver;

    #[async_trait]
    impl Resolver for StaticResolver {
        async fn resolve(&self, name: &str) -> TunnelResult<IpAddr> {
            match name {
                "echo.test" => Ok(IpAddr::V4(Ipv4Addr::LOCALHOST)),
                _ => Err(TunnelError::Resolution(format!("no such host: {name}"))),
            }
        }
    }

    fn server(port: u16) -> Socks5Server {
        Socks5Server::new(
            Arc::new(FixedCredentials),
            Arc::new(AllowPort(port)),
            Arc::new(StaticResolver),
        )
    }

    /// An echo target that counts accepted connections.
    async fn echo_target() -> (SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let n = stream.read(&mut buf).await.unwrap_or(0);
                    let _ = stream.write_all(&buf[..n]).await;
                });
            }
        });
        (addr, accepted)
    }

    #[tokio::test]
    async fn connect_and_relay_through_resolved_name() {
        let (target, accepted) = echo_target().await;
        let socks = server(target.port());
        let (mut client_io, mut server_io) = duplex(64 * 1024);

        let serve = tokio::spawn(async move { socks.serve(&mut server_io, None).await });

        client::authenticate(&mut client_io, "date", "blob").await.unwrap();
        client::connect(&mut client_io, &format!("echo.test:{}", target.port()))
            .await
            .unwrap();
        client_io.write_all(b"echo me").await.unwrap();
        let mut buf = [0u8; 7];
        client_io.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"echo me");

        drop(client_io);
        serve.await.unwrap().unwrap();
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn bad_credentials_never_reach_target() {
        let (target, accepted) = echo_target().await;
        let socks = server(target.port());
        let (mut client_io, mut server_io) = duplex(1024);

        let serve = tokio::spawn(async move { socks.serve(&mut server_io, None).await });

        let err = client::authenticate(&mut client_io, "date", "wrong")
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Auth(_)));
        // the detailed reason stays on the server side
        assert!(!err.to_string().contains("bad password"));

        let server_err = serve.await.unwrap().unwrap_err();
        assert!(server_err.to_string().contains("bad password"));
        assert_eq!(accepted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn disallowed_port_is_not_allowed_reply() {
        let (target, accepted) = echo_target().await;
        let socks = server(target.port().wrapping_add(1));
        let (mut client_io, mut server_io) = duplex(1024);

        let serve = tokio::spawn(async move { socks.serve(&mut server_io, None).await });

        client::authenticate(&mut client_io, "date", "blob").await.unwrap();
        let err = client::connect(&mut client_io, &target.to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::AccessDenied(_)));
        assert!(matches!(
            serve.await.unwrap(),
            Err(TunnelError::AccessDenied(_))
        ));
        assert_eq!(accepted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unresolvable_name_is_host_unreachable() {
        let socks = server(80);
        let (mut client_io, mut server_io) = duplex(1024);
        let serve = tokio::spawn(async move { socks.serve(&mut server_io, None).await });

        client::authenticate(&mut client_io, "date", "blob").await.unwrap();
        let err = client::connect(&mut client_io, "nowhere.test:80")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("host unreachable"));
        assert!(matches!(serve.await.unwrap(), Err(TunnelError::Resolution(_))));
    }

    #[tokio::test]
    async fn refused_connect_is_reported() {
        // bind then drop to get a port nothing listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let socks = server(port);
        let (mut client_io, mut server_io) = duplex(1024);
        let serve = tokio::spawn(async move { socks.serve(&mut server_io, None).await });

        client::authenticate(&mut client_io, "date", "blob").await.unwrap();
        let err = client::connect(&mut client_io, &format!("127.0.0.1:{port}"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("connection refused"));
        assert!(serve.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn missing_userpass_method_rejected() {
        let socks = server(80);
        let (mut client_io, mut server_io) = duplex(1024);
        let serve = tokio::spawn(async move { socks.serve(&mut server_io, None).await });

        client_io.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client_io.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0xff]);
        assert!(matches!(serve.await.unwrap(), Err(TunnelError::Auth(_))));
    }

    #[tokio::test]
    async fn bind_command_denied_by_rules() {
        let socks = server(80);
        let (mut client_io, mut server_io) = duplex(1024);
        let serve = tokio::spawn(async move { socks.serve(&mut server_io, None).await });

        client::authenticate(&mut client_io, "date", "blob").await.unwrap();
        client_io
            .write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0, 80])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client_io.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], ReplyCode::NotAllowed as u8);
        assert!(serve.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn unknown_address_type_rejected() {
        let socks = server(80);
        let (mut client_io, mut server_io) = duplex(1024);
        let serve = tokio::spawn(async move { socks.serve(&mut server_io, None).await });

        client::authenticate(&mut client_io, "date", "blob").await.unwrap();
        client_io.write_all(&[0x05, 0x01, 0x00, 0x09]).await.unwrap();
        let mut reply = [0u8; 10];
        client_io.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], ReplyCode::AddressTypeNotSupported as u8);
        assert!(matches!(serve.await.unwrap(), Err(TunnelError::Protocol(_))));
    }

    #[test]
    fn connect_failures_map_to_reply_codes() {
        use std::io::ErrorKind;
        assert_eq!(
            connect_failure_reply(ErrorKind::ConnectionRefused),
            ReplyCode::ConnectionRefused
        );
        for kind in [ErrorKind::AddrNotAvailable, ErrorKind::PermissionDenied] {
            assert_eq!(connect_failure_reply(kind), ReplyCode::GeneralFailure);
        }
        for kind in [ErrorKind::TimedOut, ErrorKind::ConnectionReset, ErrorKind::Other] {
            assert_eq!(connect_failure_reply(kind), ReplyCode::HostUnreachable);
        }
    }
}
