//! Wire framing: a u32 big-endian length followed by a bincode payload.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::messages::Message;

/// Largest accepted frame. A full range response of maximal blocks fits.
pub const MAX_FRAME_BYTES: usize = 48 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("bincode: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("frame of {size} bytes exceeds {max}")]
    FrameTooLarge { size: usize, max: usize },
}

pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, CodecError> {
    let payload = bincode::serialize(msg)?;
    if payload.len() > MAX_FRAME_BYTES {
        return Err(CodecError::FrameTooLarge {
            size: payload.len(),
            max: MAX_FRAME_BYTES,
        });
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decodes one frame from the front of `buf`. `Ok(None)` means more bytes
/// are needed; on success returns the message and the bytes consumed.
pub fn decode_frame(buf: &[u8]) -> Result<Option<(Message, usize)>, CodecError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(CodecError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_BYTES,
        });
    }
    if buf.len() < 4 + len {
        return Ok(None);
    }
    let msg = bincode::deserialize(&buf[4..4 + len])?;
    Ok(Some((msg, 4 + len)))
}

pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message, CodecError> {
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_BYTES {
        return Err(CodecError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_BYTES,
        });
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(bincode::deserialize(&payload)?)
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, msg: &Message) -> Result<(), CodecError> {
    let frame = encode_frame(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let frame = encode_frame(&Message::GroupHeightAnnounce { height: 7 }).unwrap();
        assert!(decode_frame(&frame[..3]).unwrap().is_none());
        assert!(decode_frame(&frame[..frame.len() - 1]).unwrap().is_none());

        let mut two = frame.clone();
        two.extend_from_slice(&encode_frame(&Message::ChainSliceRequest { begin: 1, end: 4 }).unwrap());
        let (first, used) = decode_frame(&two).unwrap().unwrap();
        assert_eq!(first, Message::GroupHeightAnnounce { height: 7 });
        let (second, _) = decode_frame(&two[used..]).unwrap().unwrap();
        assert_eq!(second, Message::ChainSliceRequest { begin: 1, end: 4 });
    }

    #[test]
    fn oversized_length_is_rejected() {
        let mut buf = ((MAX_FRAME_BYTES + 1) as u32).to_be_bytes().to_vec();
        buf.extend_from_slice(&[0u8; 8]);
        assert!(matches!(decode_frame(&buf), Err(CodecError::FrameTooLarge { .. })));
    }

    #[tokio::test]
    async fn stream_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let msg = Message::Handshake {
            node_id: "node-a".into(),
            version: 1,
        };
        write_frame(&mut a, &msg).await.unwrap();
        assert_eq!(read_frame(&mut b).await.unwrap(), msg);
    }
}
