//! Value transcoding between user payloads and wire content.
//!
//! Flags follow the cross-SDK "common flags" convention: the top byte names
//! the format, the low bytes keep legacy type-code compatibility.

use bytes::Bytes;

use crate::error::KvError;

/// Common-flags value for JSON content.
pub const FLAGS_JSON: u32 = 0x0200_0006;
/// Common-flags value for raw binary content.
pub const FLAGS_BINARY: u32 = 0x0300_0000;

/// Datatype bit set when the payload is known-JSON and the feature was
/// negotiated.
pub const DATATYPE_JSON: u8 = 0x01;

/// Wire content plus its transcoder metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Content {
    pub bytes: Bytes,
    pub flags: u32,
    pub datatype: u8,
}

impl Content {
    pub fn new(bytes: impl Into<Bytes>, flags: u32, datatype: u8) -> Self {
        Self {
            bytes: bytes.into(),
            flags,
            datatype,
        }
    }

    /// Format nibble from the common-flags top byte. Zero means a legacy
    /// writer that set no flags.
    pub fn format(&self) -> u32 {
        (self.flags >> 24) & 0x0f
    }

    pub fn is_json(&self) -> bool {
        self.format() == 0x02 || self.format() == 0x00
    }
}

/// Wraps serialised payload bytes with format metadata, and validates the
/// metadata on the way back out.
pub trait Transcoder: Send + Sync {
    fn encode(&self, raw: Vec<u8>) -> Result<Content, KvError>;
    fn decode(&self, content: &Content) -> Result<Bytes, KvError>;
    fn name(&self) -> &'static str;
}

/// Default transcoder: payloads are JSON documents.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonTranscoder;

impl Transcoder for JsonTranscoder {
    fn encode(&self, raw: Vec<u8>) -> Result<Content, KvError> {
        Ok(Content::new(raw, FLAGS_JSON, 0))
    }

    fn decode(&self, content: &Content) -> Result<Bytes, KvError> {
        if !content.is_json() {
            return Err(KvError::Decode {
                reason: format!(
                    "content flagged 0x{:08x} is not JSON; use a matching transcoder",
                    content.flags
                ),
            });
        }
        Ok(content.bytes.clone())
    }

    fn name(&self) -> &'static str {
        "json"
    }
}

/// Pass-through transcoder for opaque binary payloads.
#[derive(Clone, Copy, Debug, Default)]
pub struct RawBinaryTranscoder;

impl Transcoder for RawBinaryTranscoder {
    fn encode(&self, raw: Vec<u8>) -> Result<Content, KvError> {
        Ok(Content::new(raw, FLAGS_BINARY, 0))
    }

    fn decode(&self, content: &Content) -> Result<Bytes, KvError> {
        Ok(content.bytes.clone())
    }

    fn name(&self) -> &'static str {
        "raw-binary"
    }
}
