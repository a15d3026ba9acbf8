//! KV dispatch: collection to vBucket to node to pool.

pub mod bucket;
pub mod collection;
pub mod options;
pub mod projection;
pub mod result;

pub use bucket::{
    Bucket, ConfigRefresh, KeyMapper, MappedKey, NodeLocator, NoopRefresh, Topology, VBucketMap,
};
pub use collection::{Collection, DEFAULT_COLLECTION, DEFAULT_SCOPE, ReplicaRead};
pub use options::{
    AdjoinOptions, CounterOptions, ExistsOptions, Expiry, GetAndLockOptions, GetAndTouchOptions,
    GetOptions, GetReplicaOptions, InsertOptions, LookupInOptions, MutateInOptions, RemoveOptions,
    ReplaceOptions, TouchOptions, UnlockOptions, UpsertOptions,
};
pub use result::{
    CounterResult, ExistsResult, GetReplicaResult, GetResult, LookupInResult, MutateInResult,
    MutationResult,
};

// Durability is a wire-level concept but callers meet it through options.
pub use crate::proto::{Durability, DurabilityLevel};
