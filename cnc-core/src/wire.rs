//! Channel payloads and the optional binary chunk framing: 4-byte LE length + bincode body.

use serde::{Deserialize, Serialize};

use crate::protocol::{ApplicationMessage, FileChunk};

const LEN_SIZE: usize = 4;
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// One message as seen by the data channel: text or binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    pub fn len(&self) -> usize {
        match self {
            Payload::Text(s) => s.len(),
            Payload::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// How file chunks are put on the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChunkEncoding {
    /// `file-chunk` JSON with base64 data. Understood by browser peers.
    #[default]
    Base64Json,
    /// Length-prefixed bincode frame with raw bytes.
    Binary,
}

/// Binary body of a chunk frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkFrame {
    pub file_id: String,
    pub index: u64,
    pub last: bool,
    pub data: Vec<u8>,
}

impl From<FileChunk> for ChunkFrame {
    fn from(c: FileChunk) -> Self {
        ChunkFrame {
            file_id: c.file_id,
            index: c.index,
            last: c.last,
            data: c.data,
        }
    }
}

impl From<ChunkFrame> for FileChunk {
    fn from(f: ChunkFrame) -> Self {
        FileChunk {
            file_id: f.file_id,
            index: f.index,
            last: f.last,
            data: f.data,
        }
    }
}

/// Encode a message for sending. Only chunks honour `encoding`; everything else is JSON text.
pub fn encode_message(
    msg: &ApplicationMessage,
    encoding: ChunkEncoding,
) -> Result<Payload, FrameEncodeError> {
    match (msg, encoding) {
        (ApplicationMessage::FileChunk(chunk), ChunkEncoding::Binary) => {
            Ok(Payload::Binary(encode_chunk_frame(&ChunkFrame::from(chunk.clone()))?))
        }
        _ => Ok(Payload::Text(msg.to_json()?)),
    }
}

/// Encode a chunk into a single frame: 4 bytes LE length + bincode body.
pub fn encode_chunk_frame(frame: &ChunkFrame) -> Result<Vec<u8>, FrameEncodeError> {
    let body = bincode::serialize(frame)?;
    let len = body.len() as u32;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + body.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("json encode error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Decode a complete chunk frame. A data channel message is one frame, so
/// trailing or missing bytes are an error rather than a request for more.
pub fn decode_chunk_frame(bytes: &[u8]) -> Result<ChunkFrame, FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::Truncated);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    let len = len as usize;
    if bytes.len() != LEN_SIZE + len {
        return Err(FrameDecodeError::Truncated);
    }
    Ok(bincode::deserialize(&bytes[LEN_SIZE..])?)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("frame length does not match message length")]
    Truncated,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DirectMessage;

    fn sample_chunk() -> FileChunk {
        FileChunk {
            file_id: "f1".into(),
            index: 7,
            last: false,
            data: vec![1, 2, 3, 4, 5],
        }
    }

    #[test]
    fn binary_chunk_frame_decodes() {
        let payload = encode_message(
            &ApplicationMessage::FileChunk(sample_chunk()),
            ChunkEncoding::Binary,
        )
        .unwrap();
        let bytes = match payload {
            Payload::Binary(b) => b,
            other => panic!("expected binary payload, got {other:?}"),
        };
        let frame = decode_chunk_frame(&bytes).unwrap();
        assert_eq!(FileChunk::from(frame), sample_chunk());
    }

    #[test]
    fn chunks_default_to_json_text() {
        let payload = encode_message(
            &ApplicationMessage::FileChunk(sample_chunk()),
            ChunkEncoding::Base64Json,
        )
        .unwrap();
        assert!(matches!(payload, Payload::Text(ref t) if t.contains("\"file-chunk\"")));
    }

    #[test]
    fn non_chunks_are_always_text() {
        let msg = ApplicationMessage::DirectMessage(DirectMessage {
            content: "hi".into(),
            sender: "me".into(),
            timestamp: chrono::Utc::now(),
        });
        assert!(matches!(
            encode_message(&msg, ChunkEncoding::Binary).unwrap(),
            Payload::Text(_)
        ));
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let bytes = encode_chunk_frame(&sample_chunk().into()).unwrap();
        assert!(matches!(
            decode_chunk_frame(&bytes[..bytes.len() - 1]),
            Err(FrameDecodeError::Truncated)
        ));
        assert!(matches!(
            decode_chunk_frame(&bytes[..2]),
            Err(FrameDecodeError::Truncated)
        ));
    }

    #[test]
    fn json_bytes_are_not_a_frame() {
        let json = br#"{"type":"post","id":"1","content":"x","sender":"s","timestamp":"2024-01-01T00:00:00Z"}"#;
        assert!(decode_chunk_frame(json).is_err());
    }
}
