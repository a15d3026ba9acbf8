//! KV operation objects and their wire encoding.

use bytes::Bytes;

use crate::error::KvError;
use crate::redact::RedactedKey;

use super::header::RequestHeader;
use super::leb128;
use super::opcode::OpCode;

/// Synchronous-replication level requested for a mutation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DurabilityLevel {
    #[default]
    None,
    Majority,
    MajorityAndPersistActive,
    PersistToMajority,
}

impl DurabilityLevel {
    pub fn as_u8(self) -> u8 {
        match self {
            DurabilityLevel::None => 0x00,
            DurabilityLevel::Majority => 0x01,
            DurabilityLevel::MajorityAndPersistActive => 0x02,
            DurabilityLevel::PersistToMajority => 0x03,
        }
    }
}

/// Durability hints carried by a mutation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Durability {
    pub level: DurabilityLevel,
    /// Server-side deadline in milliseconds; the connection default applies
    /// when absent.
    pub timeout_ms: Option<u16>,
}

impl Durability {
    pub fn majority() -> Self {
        Self {
            level: DurabilityLevel::Majority,
            timeout_ms: None,
        }
    }

    fn framing_len(&self) -> u8 {
        match (self.level, self.timeout_ms) {
            (DurabilityLevel::None, _) => 0,
            (_, None) => 2,
            (_, Some(_)) => 4,
        }
    }

    fn write_framing(&self, buf: &mut Vec<u8>) {
        if self.level == DurabilityLevel::None {
            return;
        }
        // Frame id 1 (durability), length in the low nibble.
        let body_len = if self.timeout_ms.is_some() { 3 } else { 1 };
        buf.push((0x01 << 4) | body_len);
        buf.push(self.level.as_u8());
        if let Some(timeout) = self.timeout_ms {
            buf.extend_from_slice(&timeout.to_be_bytes());
        }
    }
}

/// Opcode-specific fixed-layout extras.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestExtras {
    None,
    /// Set/Add/Replace: transcoder flags plus expiry.
    Store { flags: u32, expiry: u32 },
    /// Increment/Decrement.
    Counter { delta: u64, initial: u64, expiry: u32 },
    /// Touch/GetAndTouch.
    Expiry { expiry: u32 },
    /// GetAndLock.
    LockTime { seconds: u32 },
}

impl RequestExtras {
    fn len(&self) -> u8 {
        match self {
            RequestExtras::None => 0,
            RequestExtras::Store { .. } => 8,
            RequestExtras::Counter { .. } => 20,
            RequestExtras::Expiry { .. } | RequestExtras::LockTime { .. } => 4,
        }
    }

    fn write_to(&self, buf: &mut Vec<u8>) {
        match *self {
            RequestExtras::None => {}
            RequestExtras::Store { flags, expiry } => {
                buf.extend_from_slice(&flags.to_be_bytes());
                buf.extend_from_slice(&expiry.to_be_bytes());
            }
            RequestExtras::Counter {
                delta,
                initial,
                expiry,
            } => {
                buf.extend_from_slice(&delta.to_be_bytes());
                buf.extend_from_slice(&initial.to_be_bytes());
                buf.extend_from_slice(&expiry.to_be_bytes());
            }
            RequestExtras::Expiry { expiry } => {
                buf.extend_from_slice(&expiry.to_be_bytes());
            }
            RequestExtras::LockTime { seconds } => {
                buf.extend_from_slice(&seconds.to_be_bytes());
            }
        }
    }
}

/// Collection-qualify a document key: uLEB128 cid prefix, then the UTF-8
/// key bytes. No prefix for the default collection.
pub fn wire_key(key: &str, cid: Option<u32>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(key.len() + 5);
    if let Some(cid) = cid {
        leb128::write_u32(&mut buf, cid);
    }
    buf.extend_from_slice(key.as_bytes());
    buf
}

/// The unit of work: one framed request plus the metadata the dispatcher
/// needs to route, retry, and decode it.
#[derive(Clone, Debug)]
pub struct KvRequest {
    pub opcode: OpCode,
    pub key: String,
    pub cid: Option<u32>,
    pub vbucket: u16,
    pub cas: u64,
    pub datatype: u8,
    pub extras: RequestExtras,
    pub content: Bytes,
    pub durability: Durability,
}

impl KvRequest {
    pub fn new(opcode: OpCode, key: impl Into<String>) -> Self {
        Self {
            opcode,
            key: key.into(),
            cid: None,
            vbucket: 0,
            cas: 0,
            datatype: 0,
            extras: RequestExtras::None,
            content: Bytes::new(),
            durability: Durability::default(),
        }
    }

    pub fn get(key: impl Into<String>) -> Self {
        Self::new(OpCode::Get, key)
    }

    pub fn get_replica(key: impl Into<String>) -> Self {
        Self::new(OpCode::GetReplica, key)
    }

    pub fn store(
        opcode: OpCode,
        key: impl Into<String>,
        content: Bytes,
        flags: u32,
        datatype: u8,
        expiry: u32,
    ) -> Self {
        let mut request = Self::new(opcode, key);
        request.extras = RequestExtras::Store { flags, expiry };
        request.content = content;
        request.datatype = datatype;
        request
    }

    pub fn remove(key: impl Into<String>, cas: u64) -> Self {
        let mut request = Self::new(OpCode::Delete, key);
        request.cas = cas;
        request
    }

    pub fn counter(opcode: OpCode, key: impl Into<String>, delta: u64, initial: u64, expiry: u32) -> Self {
        let mut request = Self::new(opcode, key);
        request.extras = RequestExtras::Counter {
            delta,
            initial,
            expiry,
        };
        request
    }

    pub fn adjoin(opcode: OpCode, key: impl Into<String>, content: Bytes, cas: u64) -> Self {
        let mut request = Self::new(opcode, key);
        request.content = content;
        request.cas = cas;
        request
    }

    pub fn touch(key: impl Into<String>, expiry: u32) -> Self {
        let mut request = Self::new(OpCode::Touch, key);
        request.extras = RequestExtras::Expiry { expiry };
        request
    }

    pub fn get_and_touch(key: impl Into<String>, expiry: u32) -> Self {
        let mut request = Self::new(OpCode::GetAndTouch, key);
        request.extras = RequestExtras::Expiry { expiry };
        request
    }

    pub fn get_and_lock(key: impl Into<String>, lock_seconds: u32) -> Self {
        let mut request = Self::new(OpCode::GetAndLock, key);
        request.extras = RequestExtras::LockTime {
            seconds: lock_seconds,
        };
        request
    }

    pub fn unlock(key: impl Into<String>, cas: u64) -> Self {
        let mut request = Self::new(OpCode::Unlock, key);
        request.cas = cas;
        request
    }

    /// Observe carries its key list in the value, not the key field.
    pub fn observe(vbucket: u16, key: &str, cid: Option<u32>) -> Self {
        let wire = wire_key(key, cid);
        let mut body = Vec::with_capacity(4 + wire.len());
        body.extend_from_slice(&vbucket.to_be_bytes());
        body.extend_from_slice(&(wire.len() as u16).to_be_bytes());
        body.extend_from_slice(&wire);

        let mut request = Self::new(OpCode::Observe, key);
        request.vbucket = vbucket;
        request.content = Bytes::from(body);
        request
    }

    /// Resolve `scope.collection` to a cid; the path travels in the value.
    pub fn get_cid(path: impl Into<String>) -> Self {
        let path = path.into();
        let mut request = Self::new(OpCode::GetCidByName, String::new());
        request.content = Bytes::from(path.into_bytes());
        request
    }

    pub fn subdoc_lookup(key: impl Into<String>, specs: Bytes) -> Self {
        let mut request = Self::new(OpCode::SubDocMultiLookup, key);
        request.content = specs;
        request
    }

    pub fn subdoc_mutate(key: impl Into<String>, specs: Bytes, cas: u64, expiry: u32) -> Self {
        let mut request = Self::new(OpCode::SubDocMultiMutation, key);
        request.content = specs;
        request.cas = cas;
        if expiry != 0 {
            request.extras = RequestExtras::Expiry { expiry };
        }
        request
    }

    pub fn is_idempotent(&self) -> bool {
        self.opcode.is_idempotent()
    }

    pub fn redacted_key(&self) -> RedactedKey {
        RedactedKey::new(self.key.clone())
    }

    /// Produce the complete frame for this request.
    ///
    /// The opaque is assigned by the connection at dispatch time. Frames
    /// larger than the negotiated ceiling are refused with a client error.
    pub fn encode(&self, opaque: u32, max_packet_bytes: usize) -> Result<Bytes, KvError> {
        // Observe and GetCidByName address their target through the value.
        let key_bytes = match self.opcode {
            OpCode::Observe | OpCode::GetCidByName => Vec::new(),
            _ => wire_key(&self.key, self.cid),
        };

        let mut framing = Vec::new();
        self.durability.write_framing(&mut framing);
        debug_assert_eq!(framing.len(), usize::from(self.durability.framing_len()));

        let extras_len = self.extras.len();
        let total_body = framing.len() + usize::from(extras_len) + key_bytes.len() + self.content.len();
        if total_body + super::header::HEADER_LEN > max_packet_bytes {
            return Err(KvError::FrameTooLarge {
                max_bytes: max_packet_bytes,
                got_bytes: total_body + super::header::HEADER_LEN,
            });
        }

        let header = RequestHeader {
            opcode: self.opcode.as_u8(),
            framing_extras_len: framing.len() as u8,
            key_len: key_bytes.len() as u16,
            extras_len,
            datatype: self.datatype,
            vbucket: self.vbucket,
            total_body_len: total_body as u32,
            opaque,
            cas: self.cas,
        };

        let mut frame = Vec::with_capacity(super::header::HEADER_LEN + total_body);
        header.write_to(&mut frame).map_err(|err| KvError::Encode {
            reason: err.to_string(),
        })?;
        frame.extend_from_slice(&framing);
        self.extras.write_to(&mut frame);
        frame.extend_from_slice(&key_bytes);
        frame.extend_from_slice(&self.content);
        Ok(Bytes::from(frame))
    }
}
