//! Dialing half of the SOCKS5 exchange.

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{
    read_addr, split_host_port, AuthMethod, ReplyCode, WireAddr, AUTH_SUCCESS, AUTH_VERSION,
    MAX_FIELD_LEN, SOCKS5_VERSION,
};
use crate::error::{TunnelError, TunnelResult};

const CMD_CONNECT: u8 = 0x01;

/// Negotiate username/password auth and send the credentials.
///
/// Only method 0x02 is offered.
pub async fn authenticate<S>(io: &mut S, username: &str, password: &str) -> TunnelResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if username.is_empty() || username.len() > MAX_FIELD_LEN {
        return Err(TunnelError::Protocol(format!(
            "username length {} out of range",
            username.len()
        )));
    }
    if password.is_empty() || password.len() > MAX_FIELD_LEN {
        return Err(TunnelError::Protocol(format!(
            "password length {} out of range",
            password.len()
        )));
    }

    io.write_all(&[SOCKS5_VERSION, 1, AuthMethod::UsernamePassword as u8])
        .await?;
    io.flush().await?;

    let mut reply = [0u8; 2];
    io.read_exact(&mut reply).await?;
    if reply[0] != SOCKS5_VERSION {
        return Err(TunnelError::Protocol(format!(
            "unexpected SOCKS version in method reply: 0x{:02x}",
            reply[0]
        )));
    }
    match reply[1] {
        m if m == AuthMethod::UsernamePassword as u8 => {}
        m if m == AuthMethod::NoAcceptable as u8 => {
            return Err(TunnelError::Auth("no acceptable authentication methods".into()))
        }
        other => {
            return Err(TunnelError::Protocol(format!(
                "server selected unsupported method 0x{other:02x}"
            )))
        }
    }

    let mut msg = Vec::with_capacity(3 + username.len() + password.len());
    msg.push(AUTH_VERSION);
    msg.push(username.len() as u8);
    msg.extend_from_slice(username.as_bytes());
    msg.push(password.len() as u8);
    msg.extend_from_slice(password.as_bytes());
    io.write_all(&msg).await?;
    io.flush().await?;

    let mut status = [0u8; 2];
    io.read_exact(&mut status).await?;
    if status[0] != AUTH_VERSION {
        return Err(TunnelError::Protocol(format!(
            "unexpected auth version: 0x{:02x}",
            status[0]
        )));
    }
    if status[1] != AUTH_SUCCESS {
        return Err(TunnelError::Auth(
            "username/password authentication failed".into(),
        ));
    }
    Ok(())
}

/// Issue CONNECT for `target` (`host:port`) and wait for the reply.
///
/// Returns the server's bound address when it reported one as an IP.
pub async fn connect<S>(io: &mut S, target: &str) -> TunnelResult<Option<SocketAddr>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (host, port) = split_host_port(target)?;
    let addr = WireAddr::from_host(host)?;

    let mut msg = vec![SOCKS5_VERSION, CMD_CONNECT, 0x00];
    addr.encode(port, &mut msg);
    io.write_all(&msg).await?;
    io.flush().await?;

    let mut head = [0u8; 4];
    io.read_exact(&mut head).await?;
    if head[0] != SOCKS5_VERSION {
        return Err(TunnelError::Protocol(format!(
            "unexpected SOCKS version in reply: 0x{:02x}",
            head[0]
        )));
    }

    match ReplyCode::from_byte(head[1]) {
        Some(ReplyCode::Succeeded) => {}
        Some(ReplyCode::NotAllowed) => {
            return Err(TunnelError::AccessDenied(format!(
                "{target}: {}",
                ReplyCode::NotAllowed
            )))
        }
        Some(code) => return Err(TunnelError::Protocol(format!("{target}: {code}"))),
        None => {
            return Err(TunnelError::Protocol(format!(
                "{target}: unknown reply code 0x{:02x}",
                head[1]
            )))
        }
    }

    let (bound, bound_port) = read_addr(io, head[3]).await?;
    Ok(match bound {
        WireAddr::Ip(ip) => Some(SocketAddr::new(ip, bound_port)),
        WireAddr::Domain(_) => None,
    })
}
