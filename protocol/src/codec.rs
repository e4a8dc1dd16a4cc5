//! Message codec: framing and serialization for the wire protocol.
//!
//! Frame layout:
//!
//! ```text
//! magic: u32 BE | length: u32 BE | checksum: [u8; 4] | body (bincode Message)
//! ```

use meridian_crypto::checksum;
use meridian_messages::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::ProtocolError;

/// Frame header length in bytes.
pub const FRAME_HEADER_LEN: usize = 12;

/// Maximum frame size in bytes, header included.
pub const MAX_MSG_LEN: usize = 30 * 1024 * 1024; // 30 MiB

/// Encode a message into a complete frame.
pub fn encode(magic: u32, message: &Message) -> Result<Vec<u8>, ProtocolError> {
    let body = bincode::serialize(message).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    let size = FRAME_HEADER_LEN + body.len();
    if size > MAX_MSG_LEN {
        return Err(ProtocolError::MessageTooLarge {
            size,
            max: MAX_MSG_LEN,
        });
    }
    let mut frame = Vec::with_capacity(size);
    frame.extend_from_slice(&magic.to_be_bytes());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&checksum(&body));
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode a frame body after its header has been validated.
pub fn decode_body(body: &[u8], expected_checksum: [u8; 4]) -> Result<Message, ProtocolError> {
    if checksum(body) != expected_checksum {
        return Err(ProtocolError::ChecksumMismatch);
    }
    bincode::deserialize(body).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Read one frame. Returns the message and the total frame size in bytes.
pub async fn read_message<R>(reader: &mut R, magic: u32) -> Result<(Message, usize), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    reader.read_exact(&mut header).await.map_err(eof_as_closed)?;

    let got = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    if got != magic {
        return Err(ProtocolError::BadMagic {
            expected: magic,
            got,
        });
    }
    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
    let size = FRAME_HEADER_LEN + len;
    if size > MAX_MSG_LEN {
        return Err(ProtocolError::MessageTooLarge {
            size,
            max: MAX_MSG_LEN,
        });
    }
    let expected = [header[8], header[9], header[10], header[11]];

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(eof_as_closed)?;
    let message = decode_body(&body, expected)?;
    Ok((message, size))
}

/// Write one frame and flush it.
pub async fn write_message<W>(writer: &mut W, magic: u32, message: &Message) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode(magic, message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

fn eof_as_closed(e: std::io::Error) -> ProtocolError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        ProtocolError::ConnectionClosed
    } else {
        ProtocolError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_messages::{DataReq, Message};
    use meridian_types::BlockHash;

    const MAGIC: u32 = 0x0000_0de7;

    #[tokio::test]
    async fn frame_round_trip_reports_size() {
        let msg = Message::GetData(DataReq::Block(BlockHash::new([1; 32])));
        let frame = encode(MAGIC, &msg).unwrap();
        let mut reader = &frame[..];
        let (back, size) = read_message(&mut reader, MAGIC).await.unwrap();
        assert_eq!(back, msg);
        assert_eq!(size, frame.len());
    }

    #[tokio::test]
    async fn rejects_wrong_magic() {
        let frame = encode(MAGIC, &Message::VerAck).unwrap();
        let mut reader = &frame[..];
        let err = read_message(&mut reader, 0x8c77_ab60).await.unwrap_err();
        assert!(matches!(err, ProtocolError::BadMagic { got: MAGIC, .. }));
    }

    #[tokio::test]
    async fn rejects_corrupted_body() {
        let mut frame = encode(MAGIC, &Message::Ping { height: 5 }).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        let mut reader = &frame[..];
        let err = read_message(&mut reader, MAGIC).await.unwrap_err();
        assert!(matches!(err, ProtocolError::ChecksumMismatch));
    }

    #[tokio::test]
    async fn rejects_oversized_length_before_reading_body() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&MAGIC.to_be_bytes());
        frame.extend_from_slice(&(MAX_MSG_LEN as u32).to_be_bytes());
        frame.extend_from_slice(&[0u8; 4]);
        let mut reader = &frame[..];
        let err = read_message(&mut reader, MAGIC).await.unwrap_err();
        assert!(matches!(err, ProtocolError::MessageTooLarge { .. }));
    }

    #[tokio::test]
    async fn truncated_stream_is_connection_closed() {
        let frame = encode(MAGIC, &Message::AddrReq).unwrap();
        let mut reader = &frame[..FRAME_HEADER_LEN - 2];
        let err = read_message(&mut reader, MAGIC).await.unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionClosed));
    }
}
