//! Bucket topology and request routing.
//!
//! The configuration collaborator owns the vBucket map; this module only
//! consumes it. A topology (map plus per-node pools) is swapped in
//! atomically on every map revision.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crc::{CRC_32_ISO_HDLC, Crc};

use crate::config::KvConfig;
use crate::error::{ErrorMap, ErrorMapEntry, KvError};
use crate::net::{CancelToken, CompletionSender, ConnectionPool, SendRequest};
use crate::proto::{KvRequest, Status};
use crate::transcoder::{JsonTranscoder, Transcoder};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Where a key lives: its vBucket and the nodes serving it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MappedKey {
    pub vbucket: u16,
    pub primary: Option<usize>,
    /// Replica indices that currently have a node assigned.
    pub replicas: Vec<usize>,
}

impl MappedKey {
    pub fn has_replicas(&self) -> bool {
        !self.replicas.is_empty()
    }
}

/// Maps a document key to its vBucket and serving nodes.
pub trait KeyMapper: Send + Sync {
    fn map_key(&self, key: &[u8]) -> MappedKey;
}

/// Resolves a vBucket (and optionally a replica) to a node's pool.
pub trait NodeLocator: Send + Sync {
    fn pool_for(&self, vbucket: u16, replica_index: Option<usize>) -> Option<Arc<ConnectionPool>>;
}

/// Hook tripped when the server says the map is stale.
pub trait ConfigRefresh: Send + Sync {
    fn refresh(&self);
}

/// Refresh hook for wiring without a configuration collaborator.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopRefresh;

impl ConfigRefresh for NoopRefresh {
    fn refresh(&self) {}
}

/// One revision of the vBucket map: `entries[vbucket]` is the primary node
/// index followed by replica node indices, `-1` marking an unassigned slot.
#[derive(Clone, Debug)]
pub struct VBucketMap {
    entries: Vec<Vec<i16>>,
}

impl VBucketMap {
    pub fn new(entries: Vec<Vec<i16>>) -> Result<Self, KvError> {
        if entries.is_empty() {
            return Err(KvError::InvalidArgument {
                reason: "vbucket map has no entries".into(),
            });
        }
        if entries.iter().any(Vec::is_empty) {
            return Err(KvError::InvalidArgument {
                reason: "vbucket map entry is missing its primary slot".into(),
            });
        }
        Ok(Self { entries })
    }

    /// Uniform map: `num_vbuckets` entries spread across `num_nodes`
    /// primaries with `num_replicas` replicas each, round-robin.
    pub fn uniform(num_vbuckets: u16, num_nodes: usize, num_replicas: usize) -> Result<Self, KvError> {
        if num_nodes == 0 {
            return Err(KvError::InvalidArgument {
                reason: "vbucket map needs at least one node".into(),
            });
        }
        let entries = (0..num_vbuckets)
            .map(|vb| {
                (0..=num_replicas)
                    .map(|slot| {
                        let node = (vb as usize + slot) % num_nodes;
                        if slot > 0 && num_nodes == 1 {
                            // no distinct node to replicate onto
                            -1
                        } else {
                            node as i16
                        }
                    })
                    .collect()
            })
            .collect();
        Ok(Self { entries })
    }

    pub fn num_vbuckets(&self) -> usize {
        self.entries.len()
    }

    pub fn num_replicas(&self) -> usize {
        self.entries[0].len() - 1
    }

    pub fn vbucket_for_key(&self, key: &[u8]) -> u16 {
        let crc = CRC32.checksum(key);
        (((crc >> 16) & 0x7fff) as usize % self.entries.len()) as u16
    }

    /// Node index serving `vbucket`: the primary, or the given replica.
    pub fn node_for(&self, vbucket: u16, replica_index: Option<usize>) -> Option<usize> {
        let row = self.entries.get(usize::from(vbucket))?;
        let slot = replica_index.map_or(0, |replica| replica + 1);
        row.get(slot)
            .copied()
            .filter(|&node| node >= 0)
            .map(|node| node as usize)
    }
}

impl KeyMapper for VBucketMap {
    fn map_key(&self, key: &[u8]) -> MappedKey {
        let vbucket = self.vbucket_for_key(key);
        let replicas = (0..self.num_replicas())
            .filter(|&replica| self.node_for(vbucket, Some(replica)).is_some())
            .collect();
        MappedKey {
            vbucket,
            primary: self.node_for(vbucket, None),
            replicas,
        }
    }
}

/// A map revision bound to the pools serving it. Immutable; replaced as a
/// whole when the configuration changes.
pub struct Topology {
    map: Arc<VBucketMap>,
    nodes: Vec<Arc<ConnectionPool>>,
}

impl Topology {
    pub fn new(map: Arc<VBucketMap>, nodes: Vec<Arc<ConnectionPool>>) -> Self {
        Self { map, nodes }
    }

    pub fn map(&self) -> &VBucketMap {
        &self.map
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Any node, for requests that are not vBucket-routed.
    pub fn any_pool(&self) -> Option<Arc<ConnectionPool>> {
        self.nodes.first().cloned()
    }

    pub fn dispose(&self) {
        for pool in &self.nodes {
            pool.dispose();
        }
    }
}

impl NodeLocator for Topology {
    fn pool_for(&self, vbucket: u16, replica_index: Option<usize>) -> Option<Arc<ConnectionPool>> {
        let node = self.map.node_for(vbucket, replica_index)?;
        self.nodes.get(node).cloned()
    }
}

pub struct Bucket {
    name: String,
    config: KvConfig,
    topology: RwLock<Option<Arc<Topology>>>,
    cid_cache: Mutex<HashMap<String, u32>>,
    refresh: Arc<dyn ConfigRefresh>,
    error_map: RwLock<Option<Arc<ErrorMap>>>,
    default_transcoder: Arc<dyn Transcoder>,
}

impl Bucket {
    pub fn new(name: impl Into<String>, config: KvConfig) -> Self {
        Self {
            name: name.into(),
            config,
            topology: RwLock::new(None),
            cid_cache: Mutex::new(HashMap::new()),
            refresh: Arc::new(NoopRefresh),
            error_map: RwLock::new(None),
            default_transcoder: Arc::new(JsonTranscoder),
        }
    }

    pub fn with_refresh_hook(mut self, hook: Arc<dyn ConfigRefresh>) -> Self {
        self.refresh = hook;
        self
    }

    pub fn with_transcoder(mut self, transcoder: Arc<dyn Transcoder>) -> Self {
        self.default_transcoder = transcoder;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &KvConfig {
        &self.config
    }

    pub fn default_transcoder(&self) -> Arc<dyn Transcoder> {
        Arc::clone(&self.default_transcoder)
    }

    /// Swap in a new map revision atomically.
    pub fn apply_topology(&self, topology: Arc<Topology>) {
        *self
            .topology
            .write()
            .expect("topology lock poisoned") = Some(topology);
    }

    pub fn topology(&self) -> Option<Arc<Topology>> {
        self.topology
            .read()
            .expect("topology lock poisoned")
            .clone()
    }

    pub fn apply_error_map(&self, map: Arc<ErrorMap>) {
        *self
            .error_map
            .write()
            .expect("error map lock poisoned") = Some(map);
    }

    pub(crate) fn error_map_entry(&self, status: Status) -> Option<ErrorMapEntry> {
        self.error_map
            .read()
            .expect("error map lock poisoned")
            .as_ref()
            .and_then(|map| map.lookup(status).cloned())
    }

    pub(crate) fn request_refresh(&self) {
        self.refresh.refresh();
    }

    pub(crate) fn cached_cid(&self, path: &str) -> Option<u32> {
        self.cid_cache
            .lock()
            .expect("cid cache lock poisoned")
            .get(path)
            .copied()
    }

    /// A freshly resolved cid replaces whatever was cached for the pair.
    pub(crate) fn store_cid(&self, path: String, cid: u32) {
        self.cid_cache
            .lock()
            .expect("cid cache lock poisoned")
            .insert(path, cid);
    }

    pub(crate) fn invalidate_cid(&self, path: &str) {
        self.cid_cache
            .lock()
            .expect("cid cache lock poisoned")
            .remove(path);
    }

    /// Legacy entry point: route an already-built operation by its key and
    /// post it to the owning node's pool.
    pub fn send(
        &self,
        mut request: KvRequest,
        cancel: CancelToken,
        complete: CompletionSender,
    ) -> crate::Result<()> {
        let topology = self.topology().ok_or_else(|| KvError::NoTopology {
            key: request.redacted_key(),
        })?;
        let mapped = topology.map().map_key(request.key.as_bytes());
        request.vbucket = mapped.vbucket;
        let pool = topology
            .pool_for(mapped.vbucket, None)
            .ok_or_else(|| KvError::NoTopology {
                key: request.redacted_key(),
            })?;
        pool.submit(SendRequest::new(request, cancel, complete))
    }

    /// Drop the current topology and dispose its pools.
    pub fn dispose(&self) {
        let topology = self
            .topology
            .write()
            .expect("topology lock poisoned")
            .take();
        if let Some(topology) = topology {
            topology.dispose();
        }
    }
}

impl std::fmt::Debug for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
