//! Sub-document operation composition and response parsing.
//!
//! Multi-lookup and multi-mutation share their framing: each spec is
//! serialised in order into the request value, and the response value is a
//! parallel sequence of per-spec results. Partial failure is per spec; the
//! envelope status says whether the request as a whole was accepted.

use bytes::Bytes;

use crate::error::KvError;

use super::status::Status;

/// Specs per multi operation; more than this falls back to a full fetch.
pub const MAX_SPECS: usize = 16;

pub const PATH_FLAG_CREATE_PATH: u8 = 0x01;
pub const PATH_FLAG_XATTR: u8 = 0x04;
pub const PATH_FLAG_EXPAND_MACROS: u8 = 0x10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SubDocOpCode {
    Get = 0xc5,
    Exists = 0xc6,
    DictAdd = 0xc7,
    DictUpsert = 0xc8,
    Delete = 0xc9,
    Replace = 0xca,
    ArrayPushLast = 0xcb,
    ArrayPushFirst = 0xcc,
    ArrayInsert = 0xcd,
    ArrayAddUnique = 0xce,
    Counter = 0xcf,
    GetCount = 0xd2,
}

impl SubDocOpCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// One path read within a multi-lookup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LookupInSpec {
    pub op: SubDocOpCode,
    pub path: String,
    pub xattr: bool,
}

impl LookupInSpec {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            op: SubDocOpCode::Get,
            path: path.into(),
            xattr: false,
        }
    }

    pub fn exists(path: impl Into<String>) -> Self {
        Self {
            op: SubDocOpCode::Exists,
            path: path.into(),
            xattr: false,
        }
    }

    pub fn count(path: impl Into<String>) -> Self {
        Self {
            op: SubDocOpCode::GetCount,
            path: path.into(),
            xattr: false,
        }
    }

    pub fn xattr(mut self) -> Self {
        self.xattr = true;
        self
    }

    fn flags(&self) -> u8 {
        if self.xattr { PATH_FLAG_XATTR } else { 0 }
    }
}

/// One path write within a multi-mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MutateInSpec {
    pub op: SubDocOpCode,
    pub path: String,
    pub value: Bytes,
    pub create_path: bool,
    pub xattr: bool,
}

impl MutateInSpec {
    fn new(op: SubDocOpCode, path: impl Into<String>, value: Bytes) -> Self {
        Self {
            op,
            path: path.into(),
            value,
            create_path: false,
            xattr: false,
        }
    }

    pub fn upsert(path: impl Into<String>, value: Bytes) -> Self {
        Self::new(SubDocOpCode::DictUpsert, path, value)
    }

    pub fn insert(path: impl Into<String>, value: Bytes) -> Self {
        Self::new(SubDocOpCode::DictAdd, path, value)
    }

    pub fn replace(path: impl Into<String>, value: Bytes) -> Self {
        Self::new(SubDocOpCode::Replace, path, value)
    }

    pub fn remove(path: impl Into<String>) -> Self {
        Self::new(SubDocOpCode::Delete, path, Bytes::new())
    }

    pub fn array_append(path: impl Into<String>, value: Bytes) -> Self {
        Self::new(SubDocOpCode::ArrayPushLast, path, value)
    }

    pub fn array_prepend(path: impl Into<String>, value: Bytes) -> Self {
        Self::new(SubDocOpCode::ArrayPushFirst, path, value)
    }

    pub fn array_add_unique(path: impl Into<String>, value: Bytes) -> Self {
        Self::new(SubDocOpCode::ArrayAddUnique, path, value)
    }

    pub fn counter(path: impl Into<String>, delta: i64) -> Self {
        Self::new(
            SubDocOpCode::Counter,
            path,
            Bytes::from(delta.to_string().into_bytes()),
        )
    }

    pub fn create_path(mut self) -> Self {
        self.create_path = true;
        self
    }

    pub fn xattr(mut self) -> Self {
        self.xattr = true;
        self
    }

    fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.create_path {
            flags |= PATH_FLAG_CREATE_PATH;
        }
        if self.xattr {
            flags |= PATH_FLAG_XATTR;
        }
        flags
    }
}

fn check_spec_count(count: usize) -> Result<(), KvError> {
    if count == 0 {
        return Err(KvError::InvalidArgument {
            reason: "sub-document operation needs at least one spec".into(),
        });
    }
    if count > MAX_SPECS {
        return Err(KvError::InvalidArgument {
            reason: format!("sub-document operation carries {count} specs, maximum is {MAX_SPECS}"),
        });
    }
    Ok(())
}

/// Serialise lookup specs: (op, flags, path length, path) each.
pub fn encode_lookup_specs(specs: &[LookupInSpec]) -> Result<Bytes, KvError> {
    check_spec_count(specs.len())?;
    let mut buf = Vec::new();
    for spec in specs {
        buf.push(spec.op.as_u8());
        buf.push(spec.flags());
        buf.extend_from_slice(&(spec.path.len() as u16).to_be_bytes());
        buf.extend_from_slice(spec.path.as_bytes());
    }
    Ok(Bytes::from(buf))
}

/// Serialise mutation specs: (op, flags, path length, value length, path,
/// value) each.
pub fn encode_mutate_specs(specs: &[MutateInSpec]) -> Result<Bytes, KvError> {
    check_spec_count(specs.len())?;
    let mut buf = Vec::new();
    for spec in specs {
        buf.push(spec.op.as_u8());
        buf.push(spec.flags());
        buf.extend_from_slice(&(spec.path.len() as u16).to_be_bytes());
        buf.extend_from_slice(&(spec.value.len() as u32).to_be_bytes());
        buf.extend_from_slice(spec.path.as_bytes());
        buf.extend_from_slice(&spec.value);
    }
    Ok(Bytes::from(buf))
}

/// One per-spec result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubDocField {
    pub index: u8,
    pub status: Status,
    pub value: Bytes,
}

impl SubDocField {
    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }
}

/// Parse a multi-lookup response value: (status, length, payload) per spec,
/// in request order.
pub fn parse_lookup_results(value: &Bytes) -> Result<Vec<SubDocField>, KvError> {
    let mut fields = Vec::new();
    let mut offset = 0usize;
    let buf = value.as_ref();
    while offset < buf.len() {
        if offset + 6 > buf.len() {
            return Err(KvError::Decode {
                reason: "truncated sub-document lookup result".into(),
            });
        }
        let status = Status::from_u16(u16::from_be_bytes([buf[offset], buf[offset + 1]]));
        let len =
            u32::from_be_bytes(buf[offset + 2..offset + 6].try_into().expect("length checked"))
                as usize;
        offset += 6;
        if offset + len > buf.len() {
            return Err(KvError::Decode {
                reason: "sub-document lookup payload overruns the frame".into(),
            });
        }
        fields.push(SubDocField {
            index: fields.len() as u8,
            status,
            value: value.slice(offset..offset + len),
        });
        offset += len;
    }
    Ok(fields)
}

/// Parse a multi-mutation response value: (index, status[, length, payload])
/// entries. Successful entries appear only when the spec produced a value;
/// a failing envelope carries the first failing spec.
pub fn parse_mutate_results(value: &Bytes) -> Result<Vec<SubDocField>, KvError> {
    let mut fields = Vec::new();
    let mut offset = 0usize;
    let buf = value.as_ref();
    while offset < buf.len() {
        if offset + 3 > buf.len() {
            return Err(KvError::Decode {
                reason: "truncated sub-document mutation result".into(),
            });
        }
        let index = buf[offset];
        let status = Status::from_u16(u16::from_be_bytes([buf[offset + 1], buf[offset + 2]]));
        offset += 3;
        let value_bytes = if status == Status::Success {
            if offset + 4 > buf.len() {
                return Err(KvError::Decode {
                    reason: "truncated sub-document mutation payload length".into(),
                });
            }
            let len = u32::from_be_bytes(
                buf[offset..offset + 4].try_into().expect("length checked"),
            ) as usize;
            offset += 4;
            if offset + len > buf.len() {
                return Err(KvError::Decode {
                    reason: "sub-document mutation payload overruns the frame".into(),
                });
            }
            let slice = value.slice(offset..offset + len);
            offset += len;
            slice
        } else {
            Bytes::new()
        };
        fields.push(SubDocField {
            index,
            status,
            value: value_bytes,
        });
    }
    Ok(fields)
}
