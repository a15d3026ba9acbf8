//! 24-byte packet headers for the memcached-style binary protocol.
//!
//! All multi-byte fields are big-endian. The alternative request/response
//! magics carry flexible framing extras: the key length shrinks to one byte
//! and the freed byte holds the framing-extras length.

use thiserror::Error;

use super::status::Status;

pub const HEADER_LEN: usize = 24;

pub const MAGIC_REQUEST: u8 = 0x80;
pub const MAGIC_RESPONSE: u8 = 0x81;
pub const MAGIC_ALT_REQUEST: u8 = 0x08;
pub const MAGIC_ALT_RESPONSE: u8 = 0x18;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HeaderError {
    #[error("unexpected magic byte 0x{got:02x}")]
    BadMagic { got: u8 },
    #[error("header lengths inconsistent: framing {framing} + extras {extras} + key {key} exceeds body {body}")]
    LengthMismatch {
        framing: usize,
        extras: usize,
        key: usize,
        body: usize,
    },
    #[error("key length {key} does not fit the alternative header layout")]
    KeyTooLongForAltLayout { key: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestHeader {
    pub opcode: u8,
    pub framing_extras_len: u8,
    pub key_len: u16,
    pub extras_len: u8,
    pub datatype: u8,
    pub vbucket: u16,
    pub total_body_len: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl RequestHeader {
    /// Append the 24 header bytes. The classic magic is used unless framing
    /// extras are present.
    pub fn write_to(&self, buf: &mut Vec<u8>) -> Result<(), HeaderError> {
        if self.framing_extras_len == 0 {
            buf.push(MAGIC_REQUEST);
            buf.push(self.opcode);
            buf.extend_from_slice(&self.key_len.to_be_bytes());
        } else {
            if self.key_len > u16::from(u8::MAX) {
                return Err(HeaderError::KeyTooLongForAltLayout {
                    key: self.key_len as usize,
                });
            }
            buf.push(MAGIC_ALT_REQUEST);
            buf.push(self.opcode);
            buf.push(self.framing_extras_len);
            buf.push(self.key_len as u8);
        }
        buf.push(self.extras_len);
        buf.push(self.datatype);
        buf.extend_from_slice(&self.vbucket.to_be_bytes());
        buf.extend_from_slice(&self.total_body_len.to_be_bytes());
        buf.extend_from_slice(&self.opaque.to_be_bytes());
        buf.extend_from_slice(&self.cas.to_be_bytes());
        Ok(())
    }

    pub fn parse(bytes: &[u8; HEADER_LEN]) -> Result<Self, HeaderError> {
        let (framing_extras_len, key_len) = match bytes[0] {
            MAGIC_REQUEST => (0, u16::from_be_bytes([bytes[2], bytes[3]])),
            MAGIC_ALT_REQUEST => (bytes[2], u16::from(bytes[3])),
            got => return Err(HeaderError::BadMagic { got }),
        };
        let header = Self {
            opcode: bytes[1],
            framing_extras_len,
            key_len,
            extras_len: bytes[4],
            datatype: bytes[5],
            vbucket: u16::from_be_bytes([bytes[6], bytes[7]]),
            total_body_len: u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            opaque: u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
            cas: u64::from_be_bytes([
                bytes[16], bytes[17], bytes[18], bytes[19], bytes[20], bytes[21], bytes[22],
                bytes[23],
            ]),
        };
        header.check_lengths()?;
        Ok(header)
    }

    fn check_lengths(&self) -> Result<(), HeaderError> {
        let fixed = usize::from(self.framing_extras_len)
            + usize::from(self.extras_len)
            + usize::from(self.key_len);
        if fixed > self.total_body_len as usize {
            return Err(HeaderError::LengthMismatch {
                framing: usize::from(self.framing_extras_len),
                extras: usize::from(self.extras_len),
                key: usize::from(self.key_len),
                body: self.total_body_len as usize,
            });
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResponseHeader {
    pub opcode: u8,
    pub framing_extras_len: u8,
    pub key_len: u16,
    pub extras_len: u8,
    pub datatype: u8,
    pub status: Status,
    pub total_body_len: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl ResponseHeader {
    pub fn parse(bytes: &[u8; HEADER_LEN]) -> Result<Self, HeaderError> {
        let (framing_extras_len, key_len) = match bytes[0] {
            MAGIC_RESPONSE => (0, u16::from_be_bytes([bytes[2], bytes[3]])),
            MAGIC_ALT_RESPONSE => (bytes[2], u16::from(bytes[3])),
            got => return Err(HeaderError::BadMagic { got }),
        };
        let header = Self {
            opcode: bytes[1],
            framing_extras_len,
            key_len,
            extras_len: bytes[4],
            datatype: bytes[5],
            status: Status::from_u16(u16::from_be_bytes([bytes[6], bytes[7]])),
            total_body_len: u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            opaque: u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
            cas: u64::from_be_bytes([
                bytes[16], bytes[17], bytes[18], bytes[19], bytes[20], bytes[21], bytes[22],
                bytes[23],
            ]),
        };
        header.check_lengths()?;
        Ok(header)
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) -> Result<(), HeaderError> {
        if self.framing_extras_len == 0 {
            buf.push(MAGIC_RESPONSE);
            buf.push(self.opcode);
            buf.extend_from_slice(&self.key_len.to_be_bytes());
        } else {
            if self.key_len > u16::from(u8::MAX) {
                return Err(HeaderError::KeyTooLongForAltLayout {
                    key: self.key_len as usize,
                });
            }
            buf.push(MAGIC_ALT_RESPONSE);
            buf.push(self.opcode);
            buf.push(self.framing_extras_len);
            buf.push(self.key_len as u8);
        }
        buf.push(self.extras_len);
        buf.push(self.datatype);
        buf.extend_from_slice(&self.status.as_u16().to_be_bytes());
        buf.extend_from_slice(&self.total_body_len.to_be_bytes());
        buf.extend_from_slice(&self.opaque.to_be_bytes());
        buf.extend_from_slice(&self.cas.to_be_bytes());
        Ok(())
    }

    fn check_lengths(&self) -> Result<(), HeaderError> {
        let fixed = usize::from(self.framing_extras_len)
            + usize::from(self.extras_len)
            + usize::from(self.key_len);
        if fixed > self.total_body_len as usize {
            return Err(HeaderError::LengthMismatch {
                framing: usize::from(self.framing_extras_len),
                extras: usize::from(self.extras_len),
                key: usize::from(self.key_len),
                body: self.total_body_len as usize,
            });
        }
        Ok(())
    }

    /// Offset of the value slice within the packet body.
    pub fn value_offset(&self) -> usize {
        usize::from(self.framing_extras_len)
            + usize::from(self.extras_len)
            + usize::from(self.key_len)
    }
}
