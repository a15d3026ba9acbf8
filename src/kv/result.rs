//! Results returned by the KV API.

use bytes::Bytes;
use serde::de::DeserializeOwned;

use crate::error::KvError;
use crate::proto::{OpCode, Status, SubDocField};
use crate::redact::RedactedKey;
use crate::transcoder::Content;

/// Outcome of a successful mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MutationResult {
    pub cas: u64,
}

/// A fetched document.
#[derive(Clone, Debug)]
pub struct GetResult {
    pub cas: u64,
    pub content: Content,
    /// Unix-epoch expiry, when the caller asked for it.
    pub expiry: Option<u32>,
}

impl GetResult {
    pub fn content_bytes(&self) -> &Bytes {
        &self.content.bytes
    }

    pub fn content_as<T: DeserializeOwned>(&self) -> crate::Result<T> {
        if !self.content.is_json() {
            return Err(KvError::Decode {
                reason: format!(
                    "content flagged 0x{:08x} cannot be decoded as JSON",
                    self.content.flags
                ),
            });
        }
        serde_json::from_slice(&self.content.bytes).map_err(|err| KvError::Decode {
            reason: format!("json: {err}"),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExistsResult {
    pub exists: bool,
    /// CAS of the observed document; zero when it does not exist.
    pub cas: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CounterResult {
    pub cas: u64,
    /// Counter value after the operation applied.
    pub value: u64,
}

/// A read served by the primary or one of its replicas.
#[derive(Clone, Debug)]
pub struct GetReplicaResult {
    pub result: GetResult,
    pub is_replica: bool,
}

/// Per-path outcomes of a multi-lookup. Partial failure lives here, on the
/// result, not in a thrown error.
#[derive(Clone, Debug)]
pub struct LookupInResult {
    pub cas: u64,
    pub fields: Vec<SubDocField>,
    pub(crate) key: RedactedKey,
}

impl LookupInResult {
    pub fn exists(&self, index: usize) -> bool {
        self.fields
            .get(index)
            .is_some_and(|field| field.status == Status::Success)
    }

    pub fn field_status(&self, index: usize) -> Option<Status> {
        self.fields.get(index).map(|field| field.status)
    }

    pub fn content_as<T: DeserializeOwned>(&self, index: usize) -> crate::Result<T> {
        let field = self.fields.get(index).ok_or_else(|| KvError::InvalidArgument {
            reason: format!("lookup result has {} fields, index {index} is out of range", self.fields.len()),
        })?;
        if field.status != Status::Success {
            return Err(KvError::Server {
                status: field.status,
                opcode: OpCode::SubDocMultiLookup,
                key: self.key.clone(),
                error_map: None,
            });
        }
        serde_json::from_slice(&field.value).map_err(|err| KvError::Decode {
            reason: format!("sub-document field {index}: {err}"),
        })
    }
}

/// Per-path outcomes of a multi-mutation.
#[derive(Clone, Debug)]
pub struct MutateInResult {
    pub cas: u64,
    pub fields: Vec<SubDocField>,
}

impl MutateInResult {
    /// Value produced by the spec at `index`, if any (counters).
    pub fn content_as<T: DeserializeOwned>(&self, index: u8) -> crate::Result<Option<T>> {
        let Some(field) = self.fields.iter().find(|field| field.index == index) else {
            return Ok(None);
        };
        serde_json::from_slice(&field.value)
            .map(Some)
            .map_err(|err| KvError::Decode {
                reason: format!("sub-document field {index}: {err}"),
            })
    }
}
