//! Length-prefixed CBOR framing for one-shot protocol messages.
//!
//! Wire format: `[4-byte big-endian length][CBOR payload]`

use crate::error::{TunnelError, TunnelResult};
use std::io::Cursor;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest payload `read_frame` accepts.
pub const MAX_FRAME_LEN: usize = 1024;

/// Encode a serializable value into a length-prefixed CBOR frame.
pub fn frame_encode<T: serde::Serialize>(value: &T) -> TunnelResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(value, &mut payload)?;

    let len = payload.len() as u32;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend(payload);
    Ok(frame)
}

/// Decode a CBOR payload (without length prefix) into a typed value.
pub fn cbor_decode<T: serde::de::DeserializeOwned>(data: &[u8]) -> TunnelResult<T> {
    let cursor = Cursor::new(data);
    let value: T = ciborium::from_reader(cursor)?;
    Ok(value)
}

/// Write a value as a single frame with one write call.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> TunnelResult<()>
where
    W: AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let frame = frame_encode(value)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read exactly one frame and decode its payload.
///
/// Frames declaring more than [`MAX_FRAME_LEN`] bytes are rejected before
/// the payload is read.
pub async fn read_frame<R, T>(reader: &mut R) -> TunnelResult<T>
where
    R: AsyncRead + Unpin,
    T: serde::de::DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len == 0 {
        return Err(TunnelError::Codec("empty frame".into()));
    }
    if len > MAX_FRAME_LEN {
        return Err(TunnelError::Codec(format!(
            "frame too large: {len} bytes (max {MAX_FRAME_LEN})"
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    cbor_decode(&payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TestMsg {
        name: String,
        value: i64,
    }

    #[test]
    fn frame_has_length_prefix() {
        let msg = TestMsg {
            name: "hello".into(),
            value: 42,
        };
        let frame = frame_encode(&msg).unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - 4);
        let decoded: TestMsg = cbor_decode(&frame[4..]).unwrap();
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn read_frame_leaves_trailing_bytes() {
        let msg = TestMsg {
            name: "x".into(),
            value: 7,
        };
        let mut data = frame_encode(&msg).unwrap();
        data.extend_from_slice(b"trailing");

        let mut reader = &data[..];
        let decoded: TestMsg = read_frame(&mut reader).await.unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(reader, b"trailing");
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let mut data = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes().to_vec();
        data.extend(std::iter::repeat(0u8).take(MAX_FRAME_LEN + 1));
        let mut reader = &data[..];
        let result: TunnelResult<TestMsg> = read_frame(&mut reader).await;
        assert!(matches!(result, Err(TunnelError::Codec(_))));
    }

    #[tokio::test]
    async fn truncated_frame_is_io_error() {
        let frame = frame_encode(&TestMsg {
            name: "abc".into(),
            value: 1,
        })
        .unwrap();
        let mut reader = &frame[..frame.len() - 1];
        let result: TunnelResult<TestMsg> = read_frame(&mut reader).await;
        assert!(matches!(result, Err(TunnelError::Io(_))));
    }
}
