//! Gateway ↔ zone link framing.
//!
//! Frames on the TCP link are `len(u32) | type(u8) | payload...`,
//! little-endian, where `len` covers the type byte plus the payload.
//! Frames are capped at 1 MiB; anything larger is a protocol violation.

use anyhow::{bail, Context};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Hard cap on a single frame (type byte + payload).
pub const MAX_FRAME_SIZE: usize = 1 << 20;

/// A decoded link frame. `msg_type` values live in [`crate::messages`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: u8,
    pub payload: Bytes,
}

/// Writes one frame. The caller owns buffering; this issues a single
/// vectored-ish write of header + body.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    w: &mut W,
    msg_type: u8,
    payload: &[u8],
) -> anyhow::Result<()> {
    let len = 1 + payload.len();
    if len > MAX_FRAME_SIZE {
        bail!("frame too large: {len} bytes");
    }
    let mut hdr = [0u8; 5];
    hdr[0..4].copy_from_slice(&(len as u32).to_le_bytes());
    hdr[4] = msg_type;
    w.write_all(&hdr).await.context("link write header")?;
    if !payload.is_empty() {
        w.write_all(payload).await.context("link write payload")?;
    }
    Ok(())
}

/// Reads one frame, failing on EOF, short reads, or oversized lengths.
pub async fn read_frame<R: AsyncReadExt + Unpin>(r: &mut R) -> anyhow::Result<Frame> {
    let mut hdr = [0u8; 4];
    r.read_exact(&mut hdr).await.context("link read len")?;
    let len = u32::from_le_bytes(hdr) as usize;
    if len == 0 || len > MAX_FRAME_SIZE {
        bail!("bad frame length: {len}");
    }
    let msg_type = r.read_u8().await.context("link read type")?;
    let mut payload = vec![0u8; len - 1];
    if !payload.is_empty() {
        r.read_exact(&mut payload).await.context("link read payload")?;
    }
    Ok(Frame {
        msg_type,
        payload: Bytes::from(payload),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_roundtrip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        write_frame(&mut a, 3, b"payload").await.unwrap();
        write_frame(&mut a, 101, b"").await.unwrap();

        let fr = read_frame(&mut b).await.unwrap();
        assert_eq!(fr.msg_type, 3);
        assert_eq!(&fr.payload[..], b"payload");

        let fr = read_frame(&mut b).await.unwrap();
        assert_eq!(fr.msg_type, 101);
        assert!(fr.payload.is_empty());
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut a, _b) = tokio::io::duplex(64);
        let big = vec![0u8; MAX_FRAME_SIZE];
        assert!(write_frame(&mut a, 1, &big).await.is_err());
    }

    #[tokio::test]
    async fn bad_length_prefix_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(0u32).to_le_bytes()).await.unwrap();
        assert!(read_frame(&mut b).await.is_err());
    }
}
