//! Connect descriptor exchange.
//!
//! The accepting side sends one descriptor as the very first frame of every
//! transport connection:
//! 1. Server generates a fresh 32-byte nonce
//! 2. Server sends CONNECT_DESCRIPTOR (software id, version, protocol version, nonce)
//! 3. Client validates it before doing anything else
//!
//! There is no negotiation. A client that does not speak exactly
//! [`PROTOCOL_VERSION`] aborts.

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::codec::{read_frame, write_frame};
use crate::error::{TunnelError, TunnelResult};

/// Software identifier every burrow server advertises.
pub const SOFTWARE_ID: &str = "burrow-server";

/// Free-text server version.
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// The single protocol version this implementation speaks.
///
/// 1 = SOCKS5 sub-protocol follows the descriptor on the same stream.
pub const PROTOCOL_VERSION: i32 = 1;

/// Length of the per-connection nonce.
pub const NONCE_SIZE: usize = 32;

/// A validated per-connection nonce.
pub type Nonce = [u8; NONCE_SIZE];

/// The one-shot descriptor sent by the accepting side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectDescriptor {
    #[serde(rename = "software")]
    pub software_id: String,
    pub version: String,
    pub protocol_version: i32,
    #[serde(with = "nonce_bytes")]
    pub nonce: Vec<u8>,
}

impl ConnectDescriptor {
    /// Build the descriptor this server sends for a freshly accepted connection.
    pub fn for_accept(nonce: &Nonce) -> Self {
        Self {
            software_id: SOFTWARE_ID.to_string(),
            version: SERVER_VERSION.to_string(),
            protocol_version: PROTOCOL_VERSION,
            nonce: nonce.to_vec(),
        }
    }

    /// Check the descriptor and return its nonce.
    ///
    /// Checks run in order: software id, protocol version (strict equality),
    /// nonce length, nonce not all-zero.
    pub fn validate(&self) -> TunnelResult<Nonce> {
        if self.software_id != SOFTWARE_ID {
            return Err(TunnelError::Handshake(format!(
                "invalid server software: {}",
                self.software_id
            )));
        }
        if self.protocol_version != PROTOCOL_VERSION {
            return Err(TunnelError::Handshake(format!(
                "unsupported protocol version: supports {}, got {}",
                PROTOCOL_VERSION, self.protocol_version
            )));
        }
        let nonce: Nonce = self.nonce.as_slice().try_into().map_err(|_| {
            TunnelError::Handshake(format!("invalid length nonce, length: {}", self.nonce.len()))
        })?;
        if is_all_zero(&nonce) {
            return Err(TunnelError::Handshake("connection nonce was all zeros".into()));
        }
        Ok(nonce)
    }
}

/// Generate a fresh random nonce. Never all-zero.
pub fn generate_nonce() -> Nonce {
    let mut nonce = [0u8; NONCE_SIZE];
    let mut rng = rand::thread_rng();
    loop {
        rng.fill(&mut nonce[..]);
        if !is_all_zero(&nonce) {
            return nonce;
        }
    }
}

/// Accepting side: send the descriptor as the first frame.
pub async fn send_descriptor<W>(writer: &mut W, nonce: &Nonce) -> TunnelResult<()>
where
    W: AsyncWrite + Unpin,
{
    let descriptor = ConnectDescriptor::for_accept(nonce);
    write_frame(writer, &descriptor).await
}

/// Dialing side: read exactly one descriptor frame and validate it.
pub async fn receive_descriptor<R>(reader: &mut R) -> TunnelResult<(ConnectDescriptor, Nonce)>
where
    R: AsyncRead + Unpin,
{
    let descriptor: ConnectDescriptor = read_frame(reader).await.map_err(|e| match e {
        TunnelError::Codec(msg) => TunnelError::Handshake(format!("malformed connect message: {msg}")),
        TunnelError::Timeout | TunnelError::Handshake(_) => e,
        other => TunnelError::Handshake(format!("unable to read connect message: {other}")),
    })?;
    let nonce = descriptor.validate()?;

    debug!(
        server = %descriptor.software_id,
        server_version = %descriptor.version,
        protocol_version = descriptor.protocol_version,
        "connected to tunnel transport layer"
    );

    Ok((descriptor, nonce))
}

fn is_all_zero(bytes: &[u8]) -> bool {
    bytes.iter().all(|b| *b == 0)
}

/// CBOR byte-string encoding for the nonce (serde would otherwise emit an array).
mod nonce_bytes {
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        struct BytesVisitor;

        impl<'de> Visitor<'de> for BytesVisitor {
            type Value = Vec<u8>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a byte string")
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Vec<u8>, E> {
                Ok(v.to_vec())
            }

            fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Vec<u8>, E> {
                Ok(v)
            }

            fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Vec<u8>, A::Error> {
                let mut out = Vec::new();
                while let Some(b) = seq.next_element::<u8>()? {
                    out.push(b);
                }
                Ok(out)
            }
        }

        d.deserialize_bytes(BytesVisitor)
    }
}
