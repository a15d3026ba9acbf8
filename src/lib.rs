#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod kv;
pub mod net;
pub mod proto;
pub mod redact;
pub mod transcoder;

pub use error::{Effect, ErrorKind, KvError, Transience};
pub type Result<T> = std::result::Result<T, KvError>;

// Re-export the public surface at the crate root for convenience
pub use crate::config::KvConfig;
pub use crate::kv::{
    Bucket, Collection, Durability, DurabilityLevel, ExistsResult, Expiry, GetOptions, GetResult,
    LookupInResult, MappedKey, MutateInResult, MutationResult, Topology, VBucketMap,
};
pub use crate::net::{CancelToken, Connection, ConnectionPool, Endpoint, SendRequest};
pub use crate::proto::{KvRequest, OpCode, ServerResponse, Status};
pub use crate::transcoder::{Content, JsonTranscoder, RawBinaryTranscoder, Transcoder};
