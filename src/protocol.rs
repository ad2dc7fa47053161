use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Packet too short: need {needed} bytes, have {actual}")]
    PacketTooShort { needed: usize, actual: usize },
    #[error("Length mismatch: header declares {declared} bytes, buffer holds {actual}")]
    LengthMismatch { declared: u64, actual: u64 },
    #[error("Frame too large: {declared} bytes exceeds limit of {limit}")]
    FrameTooLarge { declared: u64, limit: u64 },
    #[error("Metadata too large: {0} bytes")]
    MetadataTooLarge(usize),
    #[error("Invalid metadata: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// Size of the outer payload length prefix.
pub const LENGTH_PREFIX: usize = 8;
/// Size of the metadata length prefix inside the payload.
pub const METADATA_PREFIX: usize = 4;

#[derive(Serialize, Deserialize)]
struct Metadata<'a> {
    #[serde(borrow)]
    description: std::borrow::Cow<'a, str>,
}

/// One gossiped (caption, image) pair.
///
/// Frame layout, all integers big-endian:
/// - payload length P: u64 (8 bytes)
/// - metadata length M: u32 (4 bytes)
/// - metadata: `{"description": ...}` as UTF-8 JSON (M bytes)
/// - image bytes (P - 4 - M bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    description: String,
    image: Bytes,
}

impl Envelope {
    pub fn new(description: impl Into<String>, image: impl Into<Bytes>) -> Self {
        Self {
            description: description.into(),
            image: image.into(),
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn image(&self) -> &Bytes {
        &self.image
    }

    pub fn into_parts(self) -> (String, Bytes) {
        (self.description, self.image)
    }
}

/// Encodes a description and image into a complete frame, outer length included.
pub fn encode(description: &str, image: &[u8]) -> Result<Bytes, ProtocolError> {
    let metadata = serde_json::to_vec(&Metadata {
        description: description.into(),
    })?;
    let metadata_len = u32::try_from(metadata.len())
        .map_err(|_| ProtocolError::MetadataTooLarge(metadata.len()))?;

    let payload_len = METADATA_PREFIX + metadata.len() + image.len();
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX + payload_len);
    buf.put_u64(payload_len as u64);
    buf.put_u32(metadata_len);
    buf.put_slice(&metadata);
    buf.put_slice(image);
    Ok(buf.freeze())
}

/// Decodes a complete frame, outer length prefix included. The prefix must
/// account for exactly the bytes that follow it.
pub fn decode(mut frame: Bytes) -> Result<Envelope, ProtocolError> {
    if frame.remaining() < LENGTH_PREFIX {
        return Err(ProtocolError::PacketTooShort {
            needed: LENGTH_PREFIX,
            actual: frame.remaining(),
        });
    }
    let declared = frame.get_u64();
    if declared != frame.remaining() as u64 {
        return Err(ProtocolError::LengthMismatch {
            declared,
            actual: frame.remaining() as u64,
        });
    }
    decode_payload(frame)
}

/// Decodes the bytes after the outer length prefix.
fn decode_payload(mut payload: Bytes) -> Result<Envelope, ProtocolError> {
    if payload.remaining() < METADATA_PREFIX {
        return Err(ProtocolError::PacketTooShort {
            needed: METADATA_PREFIX,
            actual: payload.remaining(),
        });
    }
    let metadata_len = payload.get_u32() as usize;
    if metadata_len > payload.remaining() {
        return Err(ProtocolError::LengthMismatch {
            declared: metadata_len as u64,
            actual: payload.remaining() as u64,
        });
    }

    let metadata = payload.split_to(metadata_len);
    let parsed: Metadata = serde_json::from_slice(&metadata)?;

    Ok(Envelope::new(parsed.description.into_owned(), payload))
}
