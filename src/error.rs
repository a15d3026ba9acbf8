//! Error taxonomy surfaced by the KV engine.
//!
//! Protocol statuses are grouped into semantic kinds (see
//! [`Status::kind`](crate::proto::Status::kind)); everything the engine can
//! fail with is a [`KvError`]. Errors carry the raw status where one exists,
//! the originating opcode and the (redacted) key, and classify themselves by
//! retryability and side-effect knowledge.

use std::collections::HashMap;

use serde::Deserialize;
use thiserror::Error;

use crate::proto::{OpCode, Status};
use crate::redact::RedactedKey;

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient contention/outage).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// What we know about server-side effects when an error is returned.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Effect {
    /// Definitely no side effects occurred.
    None,
    /// Side effects definitely occurred.
    Some,
    /// We don't know if side effects occurred.
    Unknown,
}

/// Semantic grouping of failures, per the dispatcher's taxonomy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    KeyNotFound,
    KeyExists,
    ValueTooLarge,
    InvalidArgument,
    TemporaryFailure,
    Timeout,
    Locked,
    Durability,
    Auth,
    InternalOrRetryable,
    PathNotFound,
    PathMismatch,
    PathInvalid,
    PathTooBig,
    SubdocGeneric,
    Transport,
    Client,
    Cancelled,
}

/// One entry of the server-published KV error map.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ErrorMapEntry {
    pub name: String,
    #[serde(rename = "desc")]
    pub description: String,
    #[serde(default)]
    pub attrs: Vec<String>,
}

/// The KV error map: status code to descriptive metadata.
///
/// Fetched by a connection initializer when the feature is negotiated;
/// purely additive context on surfaced errors.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ErrorMap {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub revision: u32,
    #[serde(default, deserialize_with = "hex_keyed_entries")]
    errors: HashMap<u16, ErrorMapEntry>,
}

fn hex_keyed_entries<'de, D>(deserializer: D) -> Result<HashMap<u16, ErrorMapEntry>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: HashMap<String, ErrorMapEntry> = HashMap::deserialize(deserializer)?;
    let mut entries = HashMap::with_capacity(raw.len());
    for (code, entry) in raw {
        let code = u16::from_str_radix(&code, 16)
            .map_err(|_| serde::de::Error::custom(format!("bad error map code `{code}`")))?;
        entries.insert(code, entry);
    }
    Ok(entries)
}

impl ErrorMap {
    pub fn from_json(bytes: &[u8]) -> Result<Self, KvError> {
        serde_json::from_slice(bytes).map_err(|err| KvError::Decode {
            reason: format!("error map: {err}"),
        })
    }

    pub fn lookup(&self, status: Status) -> Option<&ErrorMapEntry> {
        self.errors.get(&status.as_u16())
    }
}

#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum KvError {
    #[error("server returned {status} for {opcode} on key {key}")]
    Server {
        status: Status,
        opcode: OpCode,
        key: RedactedKey,
        error_map: Option<ErrorMapEntry>,
    },
    #[error("{opcode} on key {key} timed out after {after_ms} ms")]
    Timeout {
        opcode: OpCode,
        key: RedactedKey,
        after_ms: u64,
    },
    #[error("{opcode} on key {key} was cancelled")]
    Cancelled { opcode: OpCode, key: RedactedKey },
    #[error("transport failure on {endpoint}: {reason}")]
    Transport {
        endpoint: String,
        reason: String,
        /// True when the frame never left the client.
        during_send: bool,
    },
    #[error("malformed response frame: {reason}")]
    Decode { reason: String },
    #[error("value encoding failed: {reason}")]
    Encode { reason: String },
    #[error("request of {got_bytes} bytes exceeds the {max_bytes}-byte frame ceiling")]
    FrameTooLarge { max_bytes: usize, got_bytes: usize },
    #[error("connection pool for {endpoint} is disposed")]
    PoolDisposed { endpoint: String },
    #[error("no topology available to route key {key}")]
    NoTopology { key: RedactedKey },
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },
}

impl KvError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            KvError::Server { status, .. } => status.kind(),
            KvError::Timeout { .. } => ErrorKind::Timeout,
            KvError::Cancelled { .. } => ErrorKind::Cancelled,
            KvError::Transport { .. } | KvError::PoolDisposed { .. } => ErrorKind::Transport,
            KvError::Decode { .. } | KvError::Encode { .. } | KvError::FrameTooLarge { .. } => {
                ErrorKind::Client
            }
            KvError::NoTopology { .. } => ErrorKind::InternalOrRetryable,
            KvError::InvalidArgument { .. } => ErrorKind::InvalidArgument,
        }
    }

    /// Raw status code where one applies; client-synthesised for local
    /// failures.
    pub fn status(&self) -> Option<Status> {
        match self {
            KvError::Server { status, .. } => Some(*status),
            KvError::Timeout { .. } => Some(Status::OperationTimeout),
            KvError::Transport { .. } | KvError::PoolDisposed { .. } => {
                Some(Status::TransportFailure)
            }
            KvError::Decode { .. } | KvError::Encode { .. } | KvError::FrameTooLarge { .. } => {
                Some(Status::ClientFailure)
            }
            KvError::Cancelled { .. } | KvError::NoTopology { .. }
            | KvError::InvalidArgument { .. } => None,
        }
    }

    pub fn transience(&self) -> Transience {
        match self.kind() {
            ErrorKind::TemporaryFailure
            | ErrorKind::Locked
            | ErrorKind::InternalOrRetryable
            | ErrorKind::Transport => Transience::Retryable,
            ErrorKind::Timeout | ErrorKind::Durability | ErrorKind::Cancelled => Transience::Unknown,
            ErrorKind::KeyNotFound
            | ErrorKind::KeyExists
            | ErrorKind::ValueTooLarge
            | ErrorKind::InvalidArgument
            | ErrorKind::Auth
            | ErrorKind::PathNotFound
            | ErrorKind::PathMismatch
            | ErrorKind::PathInvalid
            | ErrorKind::PathTooBig
            | ErrorKind::SubdocGeneric
            | ErrorKind::Client => Transience::Permanent,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            // The frame never reached the wire.
            KvError::Transport {
                during_send: true, ..
            }
            | KvError::PoolDisposed { .. }
            | KvError::Encode { .. }
            | KvError::FrameTooLarge { .. }
            | KvError::NoTopology { .. }
            | KvError::InvalidArgument { .. } => Effect::None,
            // In-flight bytes are not un-sent; the server may still apply.
            KvError::Transport {
                during_send: false, ..
            }
            | KvError::Timeout { .. }
            | KvError::Cancelled { .. }
            | KvError::Decode { .. } => Effect::Unknown,
            KvError::Server { status, opcode, .. } => match status.kind() {
                ErrorKind::Durability if opcode.is_mutation() => Effect::Unknown,
                _ => Effect::None,
            },
        }
    }
}
