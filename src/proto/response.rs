//! Decoded server responses.

use bytes::Bytes;

use crate::error::KvError;
use crate::transcoder::Content;

use super::header::{HEADER_LEN, ResponseHeader};
use super::status::Status;

/// Packet offset of the collection id in a GetCidByName response: the
/// 24-byte header, then a 7-byte manifest stamp, then the 4-byte cid.
const CID_PACKET_OFFSET: usize = 31;

/// A complete response frame as delivered by the read loop.
///
/// The packet holds header plus body; accessors slice extras, key, and
/// value per the already-validated header lengths.
#[derive(Clone, Debug)]
pub struct ServerResponse {
    pub header: ResponseHeader,
    pub packet: Bytes,
}

impl ServerResponse {
    pub fn new(header: ResponseHeader, packet: Bytes) -> Self {
        Self { header, packet }
    }

    pub fn status(&self) -> Status {
        self.header.status
    }

    pub fn cas(&self) -> u64 {
        self.header.cas
    }

    pub fn opaque(&self) -> u32 {
        self.header.opaque
    }

    fn body(&self) -> &[u8] {
        &self.packet[HEADER_LEN..]
    }

    pub fn extras(&self) -> &[u8] {
        let start = usize::from(self.header.framing_extras_len);
        &self.body()[start..start + usize::from(self.header.extras_len)]
    }

    pub fn key(&self) -> &[u8] {
        let start =
            usize::from(self.header.framing_extras_len) + usize::from(self.header.extras_len);
        &self.body()[start..start + usize::from(self.header.key_len)]
    }

    pub fn value(&self) -> Bytes {
        self.packet
            .slice(HEADER_LEN + self.header.value_offset()..)
    }

    /// Transcoder flags, when the extras carry them (get-family responses).
    pub fn flags(&self) -> Option<u32> {
        let extras = self.extras();
        if extras.len() < 4 {
            return None;
        }
        Some(u32::from_be_bytes([extras[0], extras[1], extras[2], extras[3]]))
    }

    /// Value plus transcoder metadata, for get-family responses.
    pub fn content(&self) -> Content {
        Content::new(self.value(), self.flags().unwrap_or(0), self.header.datatype)
    }

    /// Counter responses carry the post-operation value as 8 big-endian
    /// bytes.
    pub fn counter_value(&self) -> Result<u64, KvError> {
        let value = self.value();
        if value.len() < 8 {
            return Err(KvError::Decode {
                reason: format!("counter value is {} bytes, expected 8", value.len()),
            });
        }
        Ok(u64::from_be_bytes(value[..8].try_into().expect("length checked")))
    }

    /// Collection id from a GetCidByName response.
    pub fn collection_id(&self) -> Result<u32, KvError> {
        if self.packet.len() < CID_PACKET_OFFSET + 4 {
            return Err(KvError::Decode {
                reason: format!(
                    "cid response is {} bytes, expected at least {}",
                    self.packet.len(),
                    CID_PACKET_OFFSET + 4
                ),
            });
        }
        let raw = &self.packet[CID_PACKET_OFFSET..CID_PACKET_OFFSET + 4];
        Ok(u32::from_be_bytes(raw.try_into().expect("length checked")))
    }
}
