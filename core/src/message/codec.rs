// Message codec — framed wire encoding with CRC32 and optional LZ4
//
// Frame layout (little endian):
// [1 byte]  version
// [1 byte]  flags (0x01 = body is LZ4 compressed)
// [4 bytes] body length
// [N bytes] body (JSON message, possibly compressed)
// [4 bytes] CRC32 over everything before it

use super::types::Message;
use crc32fast::Hasher;
use thiserror::Error;

pub const FRAME_VERSION: u8 = 1;

/// Maximum encoded frame size: 2 MB
pub const MAX_FRAME_SIZE: usize = 2 * 1024 * 1024;

/// Room left in a frame for the envelope: ids, hop records, path, tags
pub const ENVELOPE_HEADROOM: usize = 256 * 1024;

/// JSON escaping can turn one content byte into six (`\u001f`)
pub const JSON_ESCAPE_FACTOR: usize = 6;

/// Largest payload that always fits a frame, whatever its content
pub const MAX_PAYLOAD_SIZE: usize = (MAX_FRAME_SIZE - ENVELOPE_HEADROOM) / JSON_ESCAPE_FACTOR;

const FLAG_COMPRESSED: u8 = 0x01;
const HEADER_LEN: usize = 6;
const FRAME_OVERHEAD: usize = HEADER_LEN + 4;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CodecError {
    #[error("Buffer too short: need {need}, got {got}")]
    BufferTooShort { need: usize, got: usize },
    #[error("Unsupported frame version: {0}")]
    UnsupportedVersion(u8),
    #[error("CRC mismatch")]
    CrcMismatch,
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
    #[error("Decompression failed: {0}")]
    DecompressionFailed(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Serialize a message to its JSON wire representation
pub fn to_json(msg: &Message) -> Result<String, CodecError> {
    serde_json::to_string(msg).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Parse a message from its JSON wire representation
pub fn from_json(json: &str) -> Result<Message, CodecError> {
    serde_json::from_str(json).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Encode a message into a transport frame
pub fn encode_frame(msg: &Message, compress: bool) -> Result<Vec<u8>, CodecError> {
    let json = serde_json::to_vec(msg).map_err(|e| CodecError::Serialization(e.to_string()))?;
    let (flags, body) = if compress {
        (FLAG_COMPRESSED, lz4_flex::compress_prepend_size(&json))
    } else {
        (0, json)
    };

    let total = FRAME_OVERHEAD + body.len();
    if total > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge {
            size: total,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut buf = Vec::with_capacity(total);
    buf.push(FRAME_VERSION);
    buf.push(flags);
    buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buf.extend_from_slice(&body);

    let mut hasher = Hasher::new();
    hasher.update(&buf);
    buf.extend_from_slice(&hasher.finalize().to_le_bytes());

    Ok(buf)
}

/// Decode a transport frame back into a message
pub fn decode_frame(data: &[u8]) -> Result<Message, CodecError> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge {
            size: data.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    if data.len() < FRAME_OVERHEAD {
        return Err(CodecError::BufferTooShort {
            need: FRAME_OVERHEAD,
            got: data.len(),
        });
    }
    if data[0] != FRAME_VERSION {
        return Err(CodecError::UnsupportedVersion(data[0]));
    }

    let body_len = u32::from_le_bytes([data[2], data[3], data[4], data[5]]) as usize;
    let expected = FRAME_OVERHEAD + body_len;
    if data.len() != expected {
        return Err(CodecError::BufferTooShort {
            need: expected,
            got: data.len(),
        });
    }

    let crc_offset = data.len() - 4;
    let received_crc = u32::from_le_bytes([
        data[crc_offset],
        data[crc_offset + 1],
        data[crc_offset + 2],
        data[crc_offset + 3],
    ]);
    let mut hasher = Hasher::new();
    hasher.update(&data[..crc_offset]);
    if hasher.finalize() != received_crc {
        return Err(CodecError::CrcMismatch);
    }

    let body = &data[HEADER_LEN..crc_offset];
    let json = if data[1] & FLAG_COMPRESSED != 0 {
        lz4_flex::decompress_size_prepended(body)
            .map_err(|e| CodecError::DecompressionFailed(e.to_string()))?
    } else {
        body.to_vec()
    };

    serde_json::from_slice(&json).map_err(|e| CodecError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::types::{MessageType, Payload, Priority};

    fn sample() -> Message {
        Message::new(
            "node-a".into(),
            "node-b".into(),
            MessageType::Resource,
            Priority::High,
            Payload::text("need water at shelter 4"),
            5,
            600,
            42,
        )
    }

    #[test]
    fn test_frame_roundtrip() {
        let msg = sample();
        let frame = encode_frame(&msg, false).unwrap();
        assert_eq!(frame[0], FRAME_VERSION);
        assert_eq!(decode_frame(&frame).unwrap(), msg);
    }

    #[test]
    fn test_compressed_frame_roundtrip() {
        let mut msg = sample();
        msg.payload = Payload::text(&"flood level rising ".repeat(200));
        let plain = encode_frame(&msg, false).unwrap();
        let packed = encode_frame(&msg, true).unwrap();

        assert!(packed.len() < plain.len());
        assert_eq!(decode_frame(&packed).unwrap(), msg);
    }

    #[test]
    fn test_detect_corruption() {
        let mut frame = encode_frame(&sample(), false).unwrap();
        frame[10] ^= 0xFF;
        assert_eq!(decode_frame(&frame), Err(CodecError::CrcMismatch));
    }

    #[test]
    fn test_reject_truncated_frame() {
        let frame = encode_frame(&sample(), false).unwrap();
        let result = decode_frame(&frame[..frame.len() - 1]);
        assert!(matches!(result, Err(CodecError::BufferTooShort { .. })));
        assert!(matches!(
            decode_frame(&[1, 0, 0]),
            Err(CodecError::BufferTooShort { .. })
        ));
    }

    #[test]
    fn test_reject_unknown_version() {
        let mut frame = encode_frame(&sample(), false).unwrap();
        frame[0] = 9;
        assert_eq!(decode_frame(&frame), Err(CodecError::UnsupportedVersion(9)));
    }

    #[test]
    fn test_reject_oversized_decode() {
        let big = vec![0u8; MAX_FRAME_SIZE + 1];
        assert!(matches!(
            decode_frame(&big),
            Err(CodecError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_json_roundtrip() {
        let msg = sample();
        let json = to_json(&msg).unwrap();
        assert!(json.contains("\"destinationId\":\"node-b\""));
        assert_eq!(from_json(&json).unwrap(), msg);
    }
}
