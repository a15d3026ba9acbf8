//! Per-operation options.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::net::CancelToken;
use crate::proto::Durability;
use crate::transcoder::Transcoder;

/// Relative expiries beyond this are sent as absolute epoch seconds.
pub const RELATIVE_EXPIRY_CEILING_SECS: u64 = 30 * 24 * 60 * 60;

/// Document time-to-live in the memcached convention: zero never expires,
/// small values are relative seconds, anything beyond thirty days is an
/// absolute unix timestamp.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Expiry {
    #[default]
    None,
    Relative(Duration),
    At(SystemTime),
}

impl Expiry {
    pub fn wire_value(self) -> u32 {
        match self {
            Expiry::None => 0,
            Expiry::Relative(ttl) => {
                let secs = ttl.as_secs();
                if secs == 0 {
                    0
                } else if secs <= RELATIVE_EXPIRY_CEILING_SECS {
                    secs as u32
                } else {
                    epoch_secs(SystemTime::now() + ttl)
                }
            }
            Expiry::At(when) => epoch_secs(when),
        }
    }
}

fn epoch_secs(when: SystemTime) -> u32 {
    when.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs().min(u64::from(u32::MAX)) as u32)
        .unwrap_or(0)
}

#[derive(Clone, Default)]
pub struct GetOptions {
    pub timeout: Option<Duration>,
    pub cancel: Option<CancelToken>,
    /// Paths to fetch instead of the whole document.
    pub project: Vec<String>,
    pub include_expiry: bool,
    pub transcoder: Option<Arc<dyn Transcoder>>,
}

#[derive(Clone, Default)]
pub struct UpsertOptions {
    pub timeout: Option<Duration>,
    pub cancel: Option<CancelToken>,
    pub expiry: Expiry,
    pub durability: Durability,
    pub transcoder: Option<Arc<dyn Transcoder>>,
}

#[derive(Clone, Default)]
pub struct InsertOptions {
    pub timeout: Option<Duration>,
    pub cancel: Option<CancelToken>,
    pub expiry: Expiry,
    pub durability: Durability,
    pub transcoder: Option<Arc<dyn Transcoder>>,
}

#[derive(Clone, Default)]
pub struct ReplaceOptions {
    pub timeout: Option<Duration>,
    pub cancel: Option<CancelToken>,
    pub expiry: Expiry,
    pub durability: Durability,
    /// Mutate only if the document still carries this CAS; zero means any.
    pub cas: u64,
    pub transcoder: Option<Arc<dyn Transcoder>>,
}

#[derive(Clone, Default)]
pub struct RemoveOptions {
    pub timeout: Option<Duration>,
    pub cancel: Option<CancelToken>,
    pub cas: u64,
    pub durability: Durability,
}

#[derive(Clone, Default)]
pub struct ExistsOptions {
    pub timeout: Option<Duration>,
    pub cancel: Option<CancelToken>,
}

#[derive(Clone, Default)]
pub struct TouchOptions {
    pub timeout: Option<Duration>,
    pub cancel: Option<CancelToken>,
}

#[derive(Clone, Default)]
pub struct GetAndTouchOptions {
    pub timeout: Option<Duration>,
    pub cancel: Option<CancelToken>,
    pub transcoder: Option<Arc<dyn Transcoder>>,
}

#[derive(Clone, Default)]
pub struct GetAndLockOptions {
    pub timeout: Option<Duration>,
    pub cancel: Option<CancelToken>,
    pub transcoder: Option<Arc<dyn Transcoder>>,
}

#[derive(Clone, Default)]
pub struct UnlockOptions {
    pub timeout: Option<Duration>,
    pub cancel: Option<CancelToken>,
}

#[derive(Clone)]
pub struct CounterOptions {
    pub timeout: Option<Duration>,
    pub cancel: Option<CancelToken>,
    pub delta: u64,
    /// Seeded when the counter does not exist yet.
    pub initial: u64,
    pub expiry: Expiry,
    pub durability: Durability,
}

impl Default for CounterOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            cancel: None,
            delta: 1,
            initial: 0,
            expiry: Expiry::None,
            durability: Durability::default(),
        }
    }
}

/// Options shared by append and prepend.
#[derive(Clone, Default)]
pub struct AdjoinOptions {
    pub timeout: Option<Duration>,
    pub cancel: Option<CancelToken>,
    pub cas: u64,
    pub durability: Durability,
}

#[derive(Clone, Default)]
pub struct LookupInOptions {
    pub timeout: Option<Duration>,
    pub cancel: Option<CancelToken>,
}

#[derive(Clone, Default)]
pub struct MutateInOptions {
    pub timeout: Option<Duration>,
    pub cancel: Option<CancelToken>,
    pub cas: u64,
    pub expiry: Expiry,
    pub durability: Durability,
}

#[derive(Clone, Default)]
pub struct GetReplicaOptions {
    pub timeout: Option<Duration>,
    pub cancel: Option<CancelToken>,
    pub transcoder: Option<Arc<dyn Transcoder>>,
}
