//! # frame
//!
//! Length-prefixed, self-describing message framing.
//!
//! Every message on the bus travels as:
//!
//! ```text
//! u32 (big-endian)   frame length, excluding this prefix
//! u8 + bytes         message type string
//! u8 + bytes         schema version string
//! remaining bytes    payload, CBOR encoded
//! ```
//!
//! The type string lets a receiver dispatch without decoding the payload;
//! the version string gates schema evolution. Any request/reply service may
//! substitute a [`Failure`](crate::messages::Failure) frame for its normal
//! reply; clients translate that into a local error.

use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Frames larger than this are rejected outright rather than allocated.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_BYTES} byte maximum")]
    TooLarge(usize),
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("unexpected message type {got:?} (expected {expected:?})")]
    UnexpectedType { expected: String, got: String },
    #[error("cbor: {0}")]
    Cbor(String),
    #[error("invalid message: {0}")]
    Invalid(String),
}

/// A wire message: a serde payload plus its self-describing identity.
pub trait Message: Serialize + DeserializeOwned {
    const MESSAGE_TYPE: &'static str;
    const MESSAGE_VERSION: &'static str = "1.0.0";
}

/// A decoded frame: identity strings plus the still-encoded payload.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub message_type: String,
    pub message_version: String,
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Packs a message into an envelope.
    pub fn pack<M: Message>(message: &M) -> Result<Self, WireError> {
        let mut payload = Vec::new();
        ciborium::ser::into_writer(message, &mut payload)
            .map_err(|e| WireError::Cbor(e.to_string()))?;
        Ok(Self {
            message_type: M::MESSAGE_TYPE.to_string(),
            message_version: M::MESSAGE_VERSION.to_string(),
            payload,
        })
    }

    /// True if this envelope carries the given message type.
    pub fn is<M: Message>(&self) -> bool {
        self.message_type == M::MESSAGE_TYPE
    }

    /// Decodes the payload as `M`, checking the type string first.
    pub fn unpack<M: Message>(&self) -> Result<M, WireError> {
        if !self.is::<M>() {
            return Err(WireError::UnexpectedType {
                expected: M::MESSAGE_TYPE.to_string(),
                got: self.message_type.clone(),
            });
        }
        ciborium::de::from_reader(self.payload.as_slice())
            .map_err(|e| WireError::Cbor(e.to_string()))
    }

    /// Serializes the envelope body (everything after the length prefix).
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        let type_bytes = self.message_type.as_bytes();
        let version_bytes = self.message_version.as_bytes();
        if type_bytes.len() > u8::MAX as usize || version_bytes.len() > u8::MAX as usize {
            return Err(WireError::Malformed(
                "message type or version string too long".to_string(),
            ));
        }
        let mut out =
            Vec::with_capacity(2 + type_bytes.len() + version_bytes.len() + self.payload.len());
        out.push(type_bytes.len() as u8);
        out.extend_from_slice(type_bytes);
        out.push(version_bytes.len() as u8);
        out.extend_from_slice(version_bytes);
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Parses an envelope body (everything after the length prefix).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        let mut cursor = 0usize;
        let read_string = |cursor: &mut usize| -> Result<String, WireError> {
            let len = *bytes
                .get(*cursor)
                .ok_or_else(|| WireError::Malformed("truncated header".to_string()))?
                as usize;
            *cursor += 1;
            let end = *cursor + len;
            let slice = bytes
                .get(*cursor..end)
                .ok_or_else(|| WireError::Malformed("truncated header string".to_string()))?;
            *cursor = end;
            String::from_utf8(slice.to_vec())
                .map_err(|_| WireError::Malformed("header string is not UTF-8".to_string()))
        };
        let message_type = read_string(&mut cursor)?;
        let message_version = read_string(&mut cursor)?;
        Ok(Self {
            message_type,
            message_version,
            payload: bytes[cursor..].to_vec(),
        })
    }
}

/// Encodes a message as a complete frame, length prefix included.
pub fn encode<M: Message>(message: &M) -> Result<Vec<u8>, WireError> {
    let body = Envelope::pack(message)?.to_bytes()?;
    if body.len() > MAX_FRAME_BYTES {
        return Err(WireError::TooLarge(body.len()));
    }
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Writes one frame to a stream.
pub fn write_frame<W: Write>(writer: &mut W, frame: &[u8]) -> Result<(), WireError> {
    writer.write_all(frame)?;
    writer.flush()?;
    Ok(())
}

/// Reads one frame from a stream. Blocks per the stream's timeout settings;
/// the caller maps timeout I/O errors to its own timeout semantics.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Envelope, WireError> {
    let mut prefix = [0u8; 4];
    reader.read_exact(&mut prefix)?;
    let length = u32::from_be_bytes(prefix) as usize;
    if length > MAX_FRAME_BYTES {
        return Err(WireError::TooLarge(length));
    }
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body)?;
    Envelope::from_bytes(&body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Failure;

    #[test]
    fn envelope_survives_byte_round_trip() {
        let failure = Failure {
            details: "replier fell over".to_string(),
        };
        let envelope = Envelope::pack(&failure).unwrap();
        let body = envelope.to_bytes().unwrap();
        let parsed = Envelope::from_bytes(&body).unwrap();
        assert_eq!(parsed.message_type, Failure::MESSAGE_TYPE);
        assert_eq!(parsed.message_version, Failure::MESSAGE_VERSION);
        let decoded: Failure = parsed.unpack().unwrap();
        assert_eq!(decoded.details, failure.details);
    }

    #[test]
    fn frame_round_trips_through_a_stream() {
        let failure = Failure {
            details: "x".to_string(),
        };
        let frame = encode(&failure).unwrap();
        let mut cursor = std::io::Cursor::new(frame);
        let envelope = read_frame(&mut cursor).unwrap();
        assert!(envelope.is::<Failure>());
    }

    #[test]
    fn unpack_rejects_wrong_type() {
        let failure = Failure {
            details: String::new(),
        };
        let envelope = Envelope::pack(&failure).unwrap();
        let err = envelope.unpack::<crate::packet::Packet>().unwrap_err();
        assert!(matches!(err, WireError::UnexpectedType { .. }));
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut body = vec![0u8; 8];
        body[0] = 1;
        body[1] = b'A';
        body[2] = 0;
        let mut stream = Vec::new();
        stream.extend_from_slice(&((MAX_FRAME_BYTES + 1) as u32).to_be_bytes());
        stream.extend_from_slice(&body);
        let mut cursor = std::io::Cursor::new(stream);
        assert!(matches!(
            read_frame(&mut cursor).unwrap_err(),
            WireError::TooLarge(_)
        ));
    }
}
