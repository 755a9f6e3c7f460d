//! Frame codec: 1-byte version + 4-byte big-endian header length + JSON header + raw payload.

use crate::constants::{FRAME_PREFIX_LEN, MAX_FRAME_SIZE, MAX_HEADER_SIZE, PROTOCOL_VERSION};
use crate::messages::Message;

/// Errors from frame encoding and decoding.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame too short (need at least {min} bytes)", min = FRAME_PREFIX_LEN)]
    TooShort,

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("header truncated: expected {expected} bytes, got {got}")]
    HeaderTruncated { expected: usize, got: usize },

    #[error("header too large: {0} bytes")]
    HeaderTooLarge(usize),

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("invalid header JSON: {0}")]
    InvalidJson(String),

    #[error("unexpected payload on {kind} message")]
    UnexpectedPayload { kind: &'static str },
}

/// Encodes a message into a single frame.
pub fn encode(msg: &Message) -> Result<Vec<u8>, CodecError> {
    let header_json = serde_json::to_vec(msg).map_err(|e| CodecError::InvalidJson(e.to_string()))?;
    if header_json.len() > MAX_HEADER_SIZE {
        return Err(CodecError::HeaderTooLarge(header_json.len()));
    }

    let payload: &[u8] = match msg {
        Message::DataChunk(chunk) => &chunk.payload,
        _ => &[],
    };

    let total = FRAME_PREFIX_LEN + header_json.len() + payload.len();
    if total > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(total));
    }

    let header_len = header_json.len() as u32;
    let mut buf = Vec::with_capacity(total);
    buf.push(PROTOCOL_VERSION);
    buf.extend_from_slice(&header_len.to_be_bytes());
    buf.extend_from_slice(&header_json);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Decodes a single frame into a message.
pub fn decode(data: &[u8]) -> Result<Message, CodecError> {
    if data.len() < FRAME_PREFIX_LEN {
        return Err(CodecError::TooShort);
    }
    if data.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(data.len()));
    }
    if data[0] != PROTOCOL_VERSION {
        return Err(CodecError::UnsupportedVersion(data[0]));
    }

    let header_len = u32::from_be_bytes([data[1], data[2], data[3], data[4]]) as usize;
    if header_len > MAX_HEADER_SIZE {
        return Err(CodecError::HeaderTooLarge(header_len));
    }
    let body = &data[FRAME_PREFIX_LEN..];
    if body.len() < header_len {
        return Err(CodecError::HeaderTruncated {
            expected: header_len,
            got: body.len(),
        });
    }

    let (header, payload) = body.split_at(header_len);
    let mut msg: Message =
        serde_json::from_slice(header).map_err(|e| CodecError::InvalidJson(e.to_string()))?;

    match &mut msg {
        Message::DataChunk(chunk) => chunk.payload = payload.to_vec(),
        other if !payload.is_empty() => {
            return Err(CodecError::UnexpectedPayload { kind: other.kind() });
        }
        _ => {}
    }
    Ok(msg)
}
