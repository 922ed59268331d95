//! Fixed-header message framing.
//!
//! Each message on the wire is a 64-byte left-justified, space-padded ASCII
//! decimal length, followed by exactly that many bytes of UTF-8 JSON. No
//! trailing delimiter.

use super::NetError;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Bytes in the length header.
pub const HEADER_LENGTH: usize = 64;

/// Upper bound on a frame body; a declared length beyond this is rejected
/// before any allocation.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Serialize `msg` as JSON and write one frame.
pub async fn write_message<W, T>(writer: &mut W, msg: &T) -> Result<(), NetError>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let payload = serde_json::to_vec(msg)?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(NetError::Oversized(payload.len()));
    }
    let header = format!("{:<width$}", payload.len(), width = HEADER_LENGTH);
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame body. `Ok(None)` means the peer closed the connection
/// cleanly before a new header began.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, NetError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LENGTH];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let text = std::str::from_utf8(&header)
        .map_err(|_| NetError::BadHeader(String::from_utf8_lossy(&header).into_owned()))?;
    let len: usize = text
        .trim()
        .parse()
        .map_err(|_| NetError::BadHeader(text.trim().to_string()))?;
    if len > MAX_FRAME_SIZE {
        return Err(NetError::Oversized(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn frames_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let msg = json!({"type": "serve_dump_cache", "args": []});
        write_message(&mut a, &msg).await.unwrap();

        let body = read_frame(&mut b).await.unwrap().unwrap();
        let back: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(back, msg);
    }

    #[tokio::test]
    async fn header_is_exactly_64_padded_bytes() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let msg = json!({"k": 1});
        write_message(&mut a, &msg).await.unwrap();
        drop(a);

        let mut raw = Vec::new();
        b.read_to_end(&mut raw).await.unwrap();
        let body_len = serde_json::to_vec(&msg).unwrap().len();
        assert_eq!(raw.len(), HEADER_LENGTH + body_len);
        let header = std::str::from_utf8(&raw[..HEADER_LENGTH]).unwrap();
        assert!(header.starts_with(&body_len.to_string()));
        assert!(header.ends_with(' '));
    }

    #[tokio::test]
    async fn clean_eof_reads_as_none() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_declared_length_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let header = format!("{:<width$}", MAX_FRAME_SIZE + 1, width = HEADER_LENGTH);
        a.write_all(header.as_bytes()).await.unwrap();
        assert!(matches!(
            read_frame(&mut b).await,
            Err(NetError::Oversized(_))
        ));
    }

    #[tokio::test]
    async fn garbage_header_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        a.write_all(&[b'x'; HEADER_LENGTH]).await.unwrap();
        assert!(matches!(
            read_frame(&mut b).await,
            Err(NetError::BadHeader(_))
        ));
    }
}
