//! The KV dispatcher: the public document API.
//!
//! Every call builds an operation, resolves the collection id, routes by
//! vBucket to a node pool, and awaits the completion under a timeout and
//! cancellation guard. Statuses come back as semantic errors; a stale-map
//! status triggers a configuration refresh and at most one retry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{Select, after};
use serde::Serialize;
use serde_json::Value;

use crate::error::KvError;
use crate::net::{CancelToken, CompletionReceiver, SendRequest, completion_channel};
use crate::proto::{
    Durability, DurabilityLevel, KvRequest, LookupInSpec, MutateInSpec, OpCode, ServerResponse,
    Status, subdoc,
};
use crate::redact::RedactedKey;
use crate::transcoder::{Content, FLAGS_JSON, Transcoder};

use super::bucket::{Bucket, KeyMapper, NodeLocator, Topology};
use super::options::{
    AdjoinOptions, CounterOptions, ExistsOptions, GetAndLockOptions, GetAndTouchOptions,
    GetOptions, GetReplicaOptions, InsertOptions, LookupInOptions, MutateInOptions, RemoveOptions,
    ReplaceOptions, TouchOptions, UnlockOptions, UpsertOptions,
};
use super::projection;
use super::result::{
    CounterResult, ExistsResult, GetReplicaResult, GetResult, LookupInResult, MutateInResult,
    MutationResult,
};

pub const DEFAULT_SCOPE: &str = "_default";
pub const DEFAULT_COLLECTION: &str = "_default";

/// Expiry lives in a virtual xattr on the document.
const EXPTIME_XATTR_PATH: &str = "$document.exptime";

// Observe key states.
const KEY_STATE_NOT_FOUND: u8 = 0x80;
const KEY_STATE_LOGICAL_DELETED: u8 = 0x81;

/// An identified set of documents with a resolved collection id.
#[derive(Clone)]
pub struct Collection {
    bucket: Arc<Bucket>,
    scope_name: String,
    name: String,
    transcoder: Arc<dyn Transcoder>,
}

impl Collection {
    pub fn new(bucket: Arc<Bucket>, scope: impl Into<String>, name: impl Into<String>) -> Self {
        let transcoder = bucket.default_transcoder();
        Self {
            bucket,
            scope_name: scope.into(),
            name: name.into(),
            transcoder,
        }
    }

    pub fn default_of(bucket: Arc<Bucket>) -> Self {
        Self::new(bucket, DEFAULT_SCOPE, DEFAULT_COLLECTION)
    }

    pub fn with_transcoder(mut self, transcoder: Arc<dyn Transcoder>) -> Self {
        self.transcoder = transcoder;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scope_name(&self) -> &str {
        &self.scope_name
    }

    fn is_default_collection(&self) -> bool {
        self.scope_name == DEFAULT_SCOPE && self.name == DEFAULT_COLLECTION
    }

    fn cid_path(&self) -> String {
        format!("{}.{}", self.scope_name, self.name)
    }

    // === plumbing ===

    fn topology_for(&self, key: &str) -> crate::Result<Arc<Topology>> {
        self.bucket.topology().ok_or_else(|| KvError::NoTopology {
            key: RedactedKey::new(key),
        })
    }

    fn pick_transcoder(&self, per_call: &Option<Arc<dyn Transcoder>>) -> Arc<dyn Transcoder> {
        per_call
            .as_ref()
            .map_or_else(|| Arc::clone(&self.transcoder), Arc::clone)
    }

    fn effective_durability(&self, requested: Durability) -> Durability {
        if requested.level == DurabilityLevel::None {
            return requested;
        }
        let default_ms = self
            .bucket
            .config()
            .durability_timeout_ms
            .min(u64::from(u16::MAX)) as u16;
        Durability {
            level: requested.level,
            timeout_ms: requested.timeout_ms.or(Some(default_ms)),
        }
    }

    fn server_error(&self, status: Status, opcode: OpCode, key: &str) -> KvError {
        if matches!(
            status,
            Status::UnknownCollection | Status::NoCollectionsManifest
        ) && !self.is_default_collection()
        {
            self.bucket.invalidate_cid(&self.cid_path());
        }
        KvError::Server {
            status,
            opcode,
            key: RedactedKey::new(key),
            error_map: self.bucket.error_map_entry(status),
        }
    }

    fn ensure_success(
        &self,
        response: &ServerResponse,
        opcode: OpCode,
        key: &str,
    ) -> crate::Result<()> {
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(self.server_error(status, opcode, key))
        }
    }

    /// Resolve and cache this collection's id, sharing the caller's
    /// deadline. The default collection needs none.
    fn resolve_cid(
        &self,
        deadline: Instant,
        timeout: Duration,
        cancel: Option<&CancelToken>,
    ) -> crate::Result<Option<u32>> {
        if self.is_default_collection() {
            return Ok(None);
        }
        let path = self.cid_path();
        if let Some(cid) = self.bucket.cached_cid(&path) {
            return Ok(Some(cid));
        }
        let request = KvRequest::get_cid(path.clone());
        let response = self.dispatch_prepared(request, deadline, timeout, cancel)?;
        if !response.status().is_success() {
            return Err(self.server_error(response.status(), OpCode::GetCidByName, &path));
        }
        let cid = response.collection_id()?;
        self.bucket.store_cid(path, cid);
        Ok(Some(cid))
    }

    /// Build-and-route entry used by every public operation.
    fn dispatch(
        &self,
        mut request: KvRequest,
        timeout: Option<Duration>,
        cancel: Option<&CancelToken>,
    ) -> crate::Result<ServerResponse> {
        let timeout = timeout.unwrap_or_else(|| self.bucket.config().default_operation_timeout());
        let deadline = Instant::now() + timeout;
        if request.cid.is_none() && request.opcode != OpCode::GetCidByName {
            request.cid = self.resolve_cid(deadline, timeout, cancel)?;
        }
        self.dispatch_prepared(request, deadline, timeout, cancel)
    }

    fn dispatch_prepared(
        &self,
        request: KvRequest,
        deadline: Instant,
        timeout: Duration,
        cancel: Option<&CancelToken>,
    ) -> crate::Result<ServerResponse> {
        let mut refreshed = false;
        loop {
            let topology = self.topology_for(&request.key)?;
            let mut attempt = request.clone();
            let pool = match attempt.opcode {
                OpCode::GetCidByName => topology.any_pool(),
                // observe pre-routed itself when it framed its body
                OpCode::Observe => topology.pool_for(attempt.vbucket, None),
                _ => {
                    attempt.vbucket = topology.map().vbucket_for_key(attempt.key.as_bytes());
                    topology.pool_for(attempt.vbucket, None)
                }
            }
            .ok_or_else(|| KvError::NoTopology {
                key: request.redacted_key(),
            })?;

            // A call-scoped token: tripping it lets a worker skip the item
            // if it is still queued when we stop waiting.
            let op_cancel = CancelToken::new();
            let (complete, receiver) = completion_channel();
            pool.submit(SendRequest::new(attempt, op_cancel.clone(), complete))?;

            let response = self.await_completion(
                &receiver, &op_cancel, cancel, deadline, timeout, &request,
            )?;

            if response.status() == Status::VBucketBelongsToAnotherServer && !refreshed {
                // The map is stale: ask the configuration collaborator for
                // a fresh one, then retry once.
                self.bucket.request_refresh();
                refreshed = true;
                continue;
            }
            return Ok(response);
        }
    }

    fn await_completion(
        &self,
        receiver: &CompletionReceiver,
        op_cancel: &CancelToken,
        caller_cancel: Option<&CancelToken>,
        deadline: Instant,
        timeout: Duration,
        request: &KvRequest,
    ) -> crate::Result<ServerResponse> {
        let never = CancelToken::new();
        let observer = caller_cancel.unwrap_or(&never).observer();
        let remaining = deadline.saturating_duration_since(Instant::now());

        crossbeam::select! {
            recv(receiver) -> msg => match msg {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(err)) => Err(err),
                Err(_) => Err(KvError::Transport {
                    endpoint: "<pool>".into(),
                    reason: "completion dropped without a result".into(),
                    during_send: false,
                }),
            },
            recv(observer) -> _ => {
                op_cancel.cancel();
                Err(KvError::Cancelled {
                    opcode: request.opcode,
                    key: request.redacted_key(),
                })
            },
            recv(after(remaining)) -> _ => {
                op_cancel.cancel();
                Err(KvError::Timeout {
                    opcode: request.opcode,
                    key: request.redacted_key(),
                    after_ms: timeout.as_millis() as u64,
                })
            },
        }
    }

    // === reads ===

    pub fn get(&self, id: &str, options: &GetOptions) -> crate::Result<GetResult> {
        if !options.project.is_empty() || options.include_expiry {
            return self.get_projected(id, options);
        }
        let response = self.dispatch(KvRequest::get(id), options.timeout, options.cancel.as_ref())?;
        self.ensure_success(&response, OpCode::Get, id)?;
        Ok(GetResult {
            cas: response.cas(),
            content: response.content(),
            expiry: None,
        })
    }

    fn get_projected(&self, id: &str, options: &GetOptions) -> crate::Result<GetResult> {
        if projection::needs_full_fetch(options.project.len(), options.include_expiry) {
            // Too many paths for one multi-lookup: fetch the whole document
            // and filter locally.
            let full = self.get(
                id,
                &GetOptions {
                    timeout: options.timeout,
                    cancel: options.cancel.clone(),
                    project: Vec::new(),
                    include_expiry: false,
                    transcoder: options.transcoder.clone(),
                },
            )?;
            let doc: Value = full.content_as()?;
            let projected = projection::project_document(&doc, &options.project)?;
            let bytes = serde_json::to_vec(&projected).map_err(|err| KvError::Encode {
                reason: format!("projection: {err}"),
            })?;
            return Ok(GetResult {
                cas: full.cas,
                content: Content::new(bytes, FLAGS_JSON, 0),
                expiry: None,
            });
        }

        let mut specs = Vec::new();
        if options.include_expiry {
            specs.push(LookupInSpec::get(EXPTIME_XATTR_PATH).xattr());
        }
        if options.project.is_empty() {
            // whole document alongside the expiry xattr
            specs.push(LookupInSpec::get(""));
        } else {
            for path in &options.project {
                specs.push(LookupInSpec::get(path));
            }
        }

        let body = subdoc::encode_lookup_specs(&specs)?;
        let response = self.dispatch(
            KvRequest::subdoc_lookup(id, body),
            options.timeout,
            options.cancel.as_ref(),
        )?;
        let status = response.status();
        if !status.is_success() && status != Status::SubDocMultiPathFailure {
            return Err(self.server_error(status, OpCode::SubDocMultiLookup, id));
        }

        let mut fields = subdoc::parse_lookup_results(&response.value())?.into_iter();
        let expiry = if options.include_expiry {
            let field = fields.next().ok_or_else(|| KvError::Decode {
                reason: "lookup response is missing the expiry field".into(),
            })?;
            if field.status == Status::Success {
                let raw: Value = serde_json::from_slice(&field.value).map_err(|err| {
                    KvError::Decode {
                        reason: format!("exptime xattr: {err}"),
                    }
                })?;
                raw.as_u64().map(|secs| secs as u32)
            } else {
                None
            }
        } else {
            None
        };

        if options.project.is_empty() {
            let field = fields.next().ok_or_else(|| KvError::Decode {
                reason: "lookup response is missing the document field".into(),
            })?;
            if field.status != Status::Success {
                return Err(self.server_error(field.status, OpCode::SubDocMultiLookup, id));
            }
            return Ok(GetResult {
                cas: response.cas(),
                content: Content::new(field.value.clone(), FLAGS_JSON, 0),
                expiry,
            });
        }

        let mut values = Vec::with_capacity(options.project.len());
        for field in fields {
            if field.status == Status::Success {
                let value = serde_json::from_slice(&field.value).map_err(|err| KvError::Decode {
                    reason: format!("projected field: {err}"),
                })?;
                values.push(Some(value));
            } else {
                values.push(None);
            }
        }
        let assembled = projection::assemble(&options.project, values)?;
        let bytes = serde_json::to_vec(&assembled).map_err(|err| KvError::Encode {
            reason: format!("projection: {err}"),
        })?;
        Ok(GetResult {
            cas: response.cas(),
            content: Content::new(bytes, FLAGS_JSON, 0),
            expiry,
        })
    }

    /// Existence check via Observe; a missing key is a result, not an
    /// error.
    pub fn exists(&self, id: &str, options: &ExistsOptions) -> crate::Result<ExistsResult> {
        let timeout = options
            .timeout
            .unwrap_or_else(|| self.bucket.config().default_operation_timeout());
        let deadline = Instant::now() + timeout;
        let cid = self.resolve_cid(deadline, timeout, options.cancel.as_ref())?;
        let topology = self.topology_for(id)?;
        let vbucket = topology.map().vbucket_for_key(id.as_bytes());
        let request = KvRequest::observe(vbucket, id, cid);

        let response =
            match self.dispatch_prepared(request, deadline, timeout, options.cancel.as_ref()) {
                Ok(response) => response,
                Err(err) if err.kind() == crate::ErrorKind::KeyNotFound => {
                    return Ok(ExistsResult {
                        exists: false,
                        cas: 0,
                    });
                }
                Err(err) => return Err(err),
            };
        if response.status() == Status::KeyNotFound {
            return Ok(ExistsResult {
                exists: false,
                cas: 0,
            });
        }
        self.ensure_success(&response, OpCode::Observe, id)?;

        let (state, cas) = parse_observe(&response)?;
        let exists = !matches!(state, KEY_STATE_NOT_FOUND | KEY_STATE_LOGICAL_DELETED);
        Ok(ExistsResult {
            exists,
            cas: if exists { cas } else { 0 },
        })
    }

    pub fn get_and_touch(
        &self,
        id: &str,
        expiry: super::options::Expiry,
        options: &GetAndTouchOptions,
    ) -> crate::Result<GetResult> {
        let request = KvRequest::get_and_touch(id, expiry.wire_value());
        let response = self.dispatch(request, options.timeout, options.cancel.as_ref())?;
        self.ensure_success(&response, OpCode::GetAndTouch, id)?;
        Ok(GetResult {
            cas: response.cas(),
            content: response.content(),
            expiry: None,
        })
    }

    pub fn get_and_lock(
        &self,
        id: &str,
        lock_time: Duration,
        options: &GetAndLockOptions,
    ) -> crate::Result<GetResult> {
        let request = KvRequest::get_and_lock(id, lock_time.as_secs() as u32);
        let response = self.dispatch(request, options.timeout, options.cancel.as_ref())?;
        self.ensure_success(&response, OpCode::GetAndLock, id)?;
        Ok(GetResult {
            cas: response.cas(),
            content: response.content(),
            expiry: None,
        })
    }

    pub fn unlock(&self, id: &str, cas: u64, options: &UnlockOptions) -> crate::Result<()> {
        let response = self.dispatch(
            KvRequest::unlock(id, cas),
            options.timeout,
            options.cancel.as_ref(),
        )?;
        self.ensure_success(&response, OpCode::Unlock, id)
    }

    // === mutations ===

    fn store_op<T: Serialize>(
        &self,
        opcode: OpCode,
        id: &str,
        content: &T,
        transcoder: &Option<Arc<dyn Transcoder>>,
        expiry: super::options::Expiry,
        durability: Durability,
        cas: u64,
        timeout: Option<Duration>,
        cancel: Option<&CancelToken>,
    ) -> crate::Result<MutationResult> {
        let raw = serde_json::to_vec(content).map_err(|err| KvError::Encode {
            reason: format!("serialize: {err}"),
        })?;
        let encoded = self.pick_transcoder(transcoder).encode(raw)?;
        let mut request = KvRequest::store(
            opcode,
            id,
            encoded.bytes,
            encoded.flags,
            encoded.datatype,
            expiry.wire_value(),
        );
        request.cas = cas;
        request.durability = self.effective_durability(durability);
        let response = self.dispatch(request, timeout, cancel)?;
        self.ensure_success(&response, opcode, id)?;
        Ok(MutationResult {
            cas: response.cas(),
        })
    }

    pub fn upsert<T: Serialize>(
        &self,
        id: &str,
        content: &T,
        options: &UpsertOptions,
    ) -> crate::Result<MutationResult> {
        self.store_op(
            OpCode::Set,
            id,
            content,
            &options.transcoder,
            options.expiry,
            options.durability,
            0,
            options.timeout,
            options.cancel.as_ref(),
        )
    }

    pub fn insert<T: Serialize>(
        &self,
        id: &str,
        content: &T,
        options: &InsertOptions,
    ) -> crate::Result<MutationResult> {
        self.store_op(
            OpCode::Add,
            id,
            content,
            &options.transcoder,
            options.expiry,
            options.durability,
            0,
            options.timeout,
            options.cancel.as_ref(),
        )
    }

    pub fn replace<T: Serialize>(
        &self,
        id: &str,
        content: &T,
        options: &ReplaceOptions,
    ) -> crate::Result<MutationResult> {
        self.store_op(
            OpCode::Replace,
            id,
            content,
            &options.transcoder,
            options.expiry,
            options.durability,
            options.cas,
            options.timeout,
            options.cancel.as_ref(),
        )
    }

    pub fn remove(&self, id: &str, options: &RemoveOptions) -> crate::Result<MutationResult> {
        let mut request = KvRequest::remove(id, options.cas);
        request.durability = self.effective_durability(options.durability);
        let response = self.dispatch(request, options.timeout, options.cancel.as_ref())?;
        self.ensure_success(&response, OpCode::Delete, id)?;
        Ok(MutationResult {
            cas: response.cas(),
        })
    }

    pub fn touch(
        &self,
        id: &str,
        expiry: super::options::Expiry,
        options: &TouchOptions,
    ) -> crate::Result<MutationResult> {
        let response = self.dispatch(
            KvRequest::touch(id, expiry.wire_value()),
            options.timeout,
            options.cancel.as_ref(),
        )?;
        self.ensure_success(&response, OpCode::Touch, id)?;
        Ok(MutationResult {
            cas: response.cas(),
        })
    }

    pub fn increment(&self, id: &str, options: &CounterOptions) -> crate::Result<CounterResult> {
        self.counter_op(OpCode::Increment, id, options)
    }

    pub fn decrement(&self, id: &str, options: &CounterOptions) -> crate::Result<CounterResult> {
        self.counter_op(OpCode::Decrement, id, options)
    }

    fn counter_op(
        &self,
        opcode: OpCode,
        id: &str,
        options: &CounterOptions,
    ) -> crate::Result<CounterResult> {
        let mut request = KvRequest::counter(
            opcode,
            id,
            options.delta,
            options.initial,
            options.expiry.wire_value(),
        );
        request.durability = self.effective_durability(options.durability);
        let response = self.dispatch(request, options.timeout, options.cancel.as_ref())?;
        self.ensure_success(&response, opcode, id)?;
        Ok(CounterResult {
            cas: response.cas(),
            value: response.counter_value()?,
        })
    }

    pub fn append(
        &self,
        id: &str,
        value: Vec<u8>,
        options: &AdjoinOptions,
    ) -> crate::Result<MutationResult> {
        self.adjoin_op(OpCode::Append, id, value, options)
    }

    pub fn prepend(
        &self,
        id: &str,
        value: Vec<u8>,
        options: &AdjoinOptions,
    ) -> crate::Result<MutationResult> {
        self.adjoin_op(OpCode::Prepend, id, value, options)
    }

    fn adjoin_op(
        &self,
        opcode: OpCode,
        id: &str,
        value: Vec<u8>,
        options: &AdjoinOptions,
    ) -> crate::Result<MutationResult> {
        let mut request = KvRequest::adjoin(opcode, id, value.into(), options.cas);
        request.durability = self.effective_durability(options.durability);
        let response = self.dispatch(request, options.timeout, options.cancel.as_ref())?;
        self.ensure_success(&response, opcode, id)?;
        Ok(MutationResult {
            cas: response.cas(),
        })
    }

    // === sub-document ===

    pub fn lookup_in(
        &self,
        id: &str,
        specs: &[LookupInSpec],
        options: &LookupInOptions,
    ) -> crate::Result<LookupInResult> {
        let order = xattrs_first(specs.iter().map(|spec| spec.xattr));
        let wire_specs: Vec<LookupInSpec> =
            order.iter().map(|&original| specs[original].clone()).collect();
        let body = subdoc::encode_lookup_specs(&wire_specs)?;
        let response = self.dispatch(
            KvRequest::subdoc_lookup(id, body),
            options.timeout,
            options.cancel.as_ref(),
        )?;

        let status = response.status();
        if !status.is_success() && status != Status::SubDocMultiPathFailure {
            return Err(self.server_error(status, OpCode::SubDocMultiLookup, id));
        }

        let wire_fields = subdoc::parse_lookup_results(&response.value())?;
        if wire_fields.len() != specs.len() {
            return Err(KvError::Decode {
                reason: format!(
                    "lookup returned {} results for {} specs",
                    wire_fields.len(),
                    specs.len()
                ),
            });
        }
        let mut fields = vec![None; specs.len()];
        for (wire_index, mut field) in wire_fields.into_iter().enumerate() {
            let original = order[wire_index];
            field.index = original as u8;
            fields[original] = Some(field);
        }
        Ok(LookupInResult {
            cas: response.cas(),
            fields: fields.into_iter().map(|field| field.expect("every slot filled")).collect(),
            key: RedactedKey::new(id),
        })
    }

    pub fn mutate_in(
        &self,
        id: &str,
        specs: &[MutateInSpec],
        options: &MutateInOptions,
    ) -> crate::Result<MutateInResult> {
        let order = xattrs_first(specs.iter().map(|spec| spec.xattr));
        let wire_specs: Vec<MutateInSpec> =
            order.iter().map(|&original| specs[original].clone()).collect();
        let body = subdoc::encode_mutate_specs(&wire_specs)?;
        let mut request =
            KvRequest::subdoc_mutate(id, body, options.cas, options.expiry.wire_value());
        request.durability = self.effective_durability(options.durability);
        let response = self.dispatch(request, options.timeout, options.cancel.as_ref())?;

        let status = response.status();
        if status == Status::SubDocMultiPathFailure {
            // The envelope failed: surface the first failing path.
            let fields = subdoc::parse_mutate_results(&response.value())?;
            let status = fields
                .first()
                .map(|field| field.status)
                .unwrap_or(Status::SubDocMultiPathFailure);
            return Err(self.server_error(status, OpCode::SubDocMultiMutation, id));
        }
        self.ensure_success(&response, OpCode::SubDocMultiMutation, id)?;

        let mut fields = subdoc::parse_mutate_results(&response.value())?;
        for field in &mut fields {
            field.index = order[usize::from(field.index)] as u8;
        }
        Ok(MutateInResult {
            cas: response.cas(),
            fields,
        })
    }

    // === replica reads ===

    fn submit_replica_reads(
        &self,
        id: &str,
        cancel: &CancelToken,
        deadline: Instant,
        timeout: Duration,
        caller_cancel: Option<&CancelToken>,
    ) -> crate::Result<Vec<(CompletionReceiver, bool)>> {
        let cid = self.resolve_cid(deadline, timeout, caller_cancel)?;
        let topology = self.topology_for(id)?;
        let mapped = topology.map().map_key(id.as_bytes());

        let mut pending = Vec::new();
        if let Some(pool) = topology.pool_for(mapped.vbucket, None) {
            let mut request = KvRequest::get(id);
            request.cid = cid;
            request.vbucket = mapped.vbucket;
            let (complete, receiver) = completion_channel();
            pool.submit(SendRequest::new(request, cancel.clone(), complete))?;
            pending.push((receiver, false));
        }
        for &replica in &mapped.replicas {
            let Some(pool) = topology.pool_for(mapped.vbucket, Some(replica)) else {
                continue;
            };
            let mut request = KvRequest::get_replica(id);
            request.cid = cid;
            request.vbucket = mapped.vbucket;
            let (complete, receiver) = completion_channel();
            if pool
                .submit(SendRequest::new(request, cancel.clone(), complete))
                .is_ok()
            {
                pending.push((receiver, true));
            }
        }
        if pending.is_empty() {
            return Err(KvError::NoTopology {
                key: RedactedKey::new(id),
            });
        }
        Ok(pending)
    }

    /// Race the primary and every replica; first success wins, the rest
    /// are cancelled.
    pub fn get_any_replica(
        &self,
        id: &str,
        options: &GetReplicaOptions,
    ) -> crate::Result<GetReplicaResult> {
        let timeout = options
            .timeout
            .unwrap_or_else(|| self.bucket.config().default_operation_timeout());
        let deadline = Instant::now() + timeout;
        let op_cancel = CancelToken::new();
        let mut pending = self.submit_replica_reads(
            id,
            &op_cancel,
            deadline,
            timeout,
            options.cancel.as_ref(),
        )?;

        let never = CancelToken::new();
        let caller = options.cancel.as_ref().unwrap_or(&never);
        let mut last_err: Option<KvError> = None;
        while !pending.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let mut select = Select::new();
            for (receiver, _) in &pending {
                select.recv(receiver);
            }
            let cancel_index = select.recv(caller.observer());

            let oper = match select.select_timeout(remaining) {
                Ok(oper) => oper,
                Err(_) => {
                    op_cancel.cancel();
                    return Err(KvError::Timeout {
                        opcode: OpCode::GetReplica,
                        key: RedactedKey::new(id),
                        after_ms: timeout.as_millis() as u64,
                    });
                }
            };
            let index = oper.index();
            if index == cancel_index {
                let _ = oper.recv(caller.observer());
                op_cancel.cancel();
                return Err(KvError::Cancelled {
                    opcode: OpCode::GetReplica,
                    key: RedactedKey::new(id),
                });
            }

            let is_replica = pending[index].1;
            match oper.recv(&pending[index].0) {
                Ok(Ok(response)) if response.status().is_success() => {
                    op_cancel.cancel();
                    return Ok(GetReplicaResult {
                        result: GetResult {
                            cas: response.cas(),
                            content: response.content(),
                            expiry: None,
                        },
                        is_replica,
                    });
                }
                Ok(Ok(response)) => {
                    let opcode = if is_replica { OpCode::GetReplica } else { OpCode::Get };
                    last_err = Some(self.server_error(response.status(), opcode, id));
                }
                Ok(Err(err)) => last_err = Some(err),
                Err(_) => {
                    last_err = Some(KvError::Transport {
                        endpoint: "<pool>".into(),
                        reason: "completion dropped without a result".into(),
                        during_send: false,
                    });
                }
            }
            pending.swap_remove(index);
        }

        op_cancel.cancel();
        Err(last_err.unwrap_or_else(|| KvError::Server {
            status: Status::NoReplicasFound,
            opcode: OpCode::GetReplica,
            key: RedactedKey::new(id),
            error_map: None,
        }))
    }

    /// One handle per target; the caller iterates and awaits each.
    pub fn get_all_replicas(
        &self,
        id: &str,
        options: &GetReplicaOptions,
    ) -> crate::Result<Vec<ReplicaRead>> {
        let timeout = options
            .timeout
            .unwrap_or_else(|| self.bucket.config().default_operation_timeout());
        let deadline = Instant::now() + timeout;
        let cancel = options.cancel.clone().unwrap_or_default();
        let pending =
            self.submit_replica_reads(id, &cancel, deadline, timeout, options.cancel.as_ref())?;

        Ok(pending
            .into_iter()
            .map(|(receiver, is_replica)| ReplicaRead {
                receiver,
                is_replica,
                key: RedactedKey::new(id),
                deadline,
                timeout,
            })
            .collect())
    }

    /// The resolved collection id; `None` for the default collection.
    pub fn collection_id(&self, timeout: Option<Duration>) -> crate::Result<Option<u32>> {
        let timeout =
            timeout.unwrap_or_else(|| self.bucket.config().default_operation_timeout());
        let deadline = Instant::now() + timeout;
        self.resolve_cid(deadline, timeout, None)
    }
}

/// A pending read racing towards one primary or replica.
pub struct ReplicaRead {
    receiver: CompletionReceiver,
    is_replica: bool,
    key: RedactedKey,
    deadline: Instant,
    timeout: Duration,
}

impl ReplicaRead {
    pub fn is_replica(&self) -> bool {
        self.is_replica
    }

    /// Block until this target answers or the shared deadline passes.
    pub fn recv(self) -> crate::Result<GetReplicaResult> {
        let ReplicaRead {
            receiver,
            is_replica,
            key,
            deadline,
            timeout,
        } = self;
        let opcode = if is_replica {
            OpCode::GetReplica
        } else {
            OpCode::Get
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        crossbeam::select! {
            recv(receiver) -> msg => match msg {
                Ok(Ok(response)) if response.status().is_success() => Ok(GetReplicaResult {
                    result: GetResult {
                        cas: response.cas(),
                        content: response.content(),
                        expiry: None,
                    },
                    is_replica,
                }),
                Ok(Ok(response)) => Err(KvError::Server {
                    status: response.status(),
                    opcode,
                    key,
                    error_map: None,
                }),
                Ok(Err(err)) => Err(err),
                Err(_) => Err(KvError::Transport {
                    endpoint: "<pool>".into(),
                    reason: "completion dropped without a result".into(),
                    during_send: false,
                }),
            },
            recv(after(remaining)) -> _ => Err(KvError::Timeout {
                opcode,
                key,
                after_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

/// Stable order with xattr entries first, as the wire format demands.
/// Returns original indices in wire order.
fn xattrs_first(xattr_flags: impl Iterator<Item = bool>) -> Vec<usize> {
    let flags: Vec<bool> = xattr_flags.collect();
    let mut order: Vec<usize> = (0..flags.len()).collect();
    order.sort_by_key(|&index| !flags[index]);
    order
}

fn parse_observe(response: &ServerResponse) -> Result<(u8, u64), KvError> {
    let value = response.value();
    if value.len() < 4 {
        return Err(KvError::Decode {
            reason: "observe response shorter than its fixed prefix".into(),
        });
    }
    let key_len = usize::from(u16::from_be_bytes([value[2], value[3]]));
    let state_offset = 4 + key_len;
    if value.len() < state_offset + 9 {
        return Err(KvError::Decode {
            reason: "observe response truncated".into(),
        });
    }
    let state = value[state_offset];
    let cas = u64::from_be_bytes(
        value[state_offset + 1..state_offset + 9]
            .try_into()
            .expect("length checked"),
    );
    Ok((state, cas))
}
