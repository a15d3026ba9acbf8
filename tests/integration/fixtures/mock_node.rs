//! In-memory KV node speaking the binary protocol over real sockets.
//!
//! Enough server behaviour to exercise the client end to end: CAS
//! semantics, counters, locking, observe, collection-id resolution, and
//! sub-document operations, plus fault injection (stall, kill).

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use serde_json::Value;

use cbkv::proto::{HEADER_LEN, OpCode, RequestHeader, ResponseHeader, Status, SubDocOpCode};

#[derive(Clone, Debug)]
struct Doc {
    value: Vec<u8>,
    flags: u32,
    cas: u64,
    locked: bool,
}

pub struct StoreInner {
    docs: Mutex<HashMap<Vec<u8>, Doc>>,
    collections: Mutex<HashMap<String, u32>>,
    cas_seq: AtomicU64,
}

pub type SharedStore = Arc<StoreInner>;

pub fn shared_store() -> SharedStore {
    Arc::new(StoreInner {
        docs: Mutex::new(HashMap::new()),
        collections: Mutex::new(HashMap::new()),
        cas_seq: AtomicU64::new(1),
    })
}

impl StoreInner {
    fn next_cas(&self) -> u64 {
        self.cas_seq.fetch_add(1, Ordering::SeqCst)
    }
}

pub struct MockNode {
    addr: SocketAddr,
    store: SharedStore,
    stalled: Arc<AtomicBool>,
    conns: Arc<Mutex<Vec<TcpStream>>>,
    accepted: Arc<AtomicUsize>,
    opcodes_seen: Arc<Mutex<Vec<u8>>>,
}

impl MockNode {
    pub fn start() -> Self {
        Self::start_shared(shared_store())
    }

    /// Start a node over an existing store; nodes sharing a store behave
    /// like replicas of one another.
    pub fn start_shared(store: SharedStore) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let stalled = Arc::new(AtomicBool::new(false));
        let conns: Arc<Mutex<Vec<TcpStream>>> = Arc::new(Mutex::new(Vec::new()));
        let accepted = Arc::new(AtomicUsize::new(0));
        let opcodes_seen = Arc::new(Mutex::new(Vec::new()));

        {
            let store = Arc::clone(&store);
            let stalled = Arc::clone(&stalled);
            let conns = Arc::clone(&conns);
            let accepted = Arc::clone(&accepted);
            let opcodes_seen = Arc::clone(&opcodes_seen);
            thread::spawn(move || {
                for stream in listener.incoming() {
                    let Ok(stream) = stream else { return };
                    accepted.fetch_add(1, Ordering::SeqCst);
                    conns
                        .lock()
                        .unwrap()
                        .push(stream.try_clone().expect("clone accepted socket"));
                    let store = Arc::clone(&store);
                    let stalled = Arc::clone(&stalled);
                    let opcodes_seen = Arc::clone(&opcodes_seen);
                    thread::spawn(move || handle_conn(stream, store, stalled, opcodes_seen));
                }
            });
        }

        Self {
            addr,
            store,
            stalled,
            conns,
            accepted,
            opcodes_seen,
        }
    }

    pub fn addr(&self) -> String {
        self.addr.to_string()
    }

    pub fn register_collection(&self, path: &str, cid: u32) {
        self.store
            .collections
            .lock()
            .unwrap()
            .insert(path.to_string(), cid);
    }

    /// Swallow requests without answering.
    pub fn stall(&self, on: bool) {
        self.stalled.store(on, Ordering::SeqCst);
    }

    /// Hard-close every accepted socket.
    pub fn kill_connections(&self) {
        let mut conns = self.conns.lock().unwrap();
        for stream in conns.drain(..) {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn saw_opcode(&self, opcode: OpCode) -> bool {
        self.opcodes_seen
            .lock()
            .unwrap()
            .contains(&opcode.as_u8())
    }
}

fn handle_conn(
    mut stream: TcpStream,
    store: SharedStore,
    stalled: Arc<AtomicBool>,
    opcodes_seen: Arc<Mutex<Vec<u8>>>,
) {
    loop {
        let mut header_bytes = [0u8; HEADER_LEN];
        if stream.read_exact(&mut header_bytes).is_err() {
            return;
        }
        let header = RequestHeader::parse(&header_bytes).expect("well-formed request header");
        let mut body = vec![0u8; header.total_body_len as usize];
        if stream.read_exact(&mut body).is_err() {
            return;
        }
        opcodes_seen.lock().unwrap().push(header.opcode);
        if stalled.load(Ordering::SeqCst) {
            continue;
        }
        let frame = execute(&header, &body, &store);
        if stream.write_all(&frame).is_err() {
            return;
        }
    }
}

struct Packet<'body> {
    extras: &'body [u8],
    key: &'body [u8],
    value: &'body [u8],
}

fn split_body<'body>(header: &RequestHeader, body: &'body [u8]) -> Packet<'body> {
    let framing = usize::from(header.framing_extras_len);
    let extras_end = framing + usize::from(header.extras_len);
    let key_end = extras_end + usize::from(header.key_len);
    Packet {
        extras: &body[framing..extras_end],
        key: &body[extras_end..key_end],
        value: &body[key_end..],
    }
}

fn respond(header: &RequestHeader, status: Status, extras: &[u8], value: &[u8], cas: u64) -> Vec<u8> {
    let response = ResponseHeader {
        opcode: header.opcode,
        framing_extras_len: 0,
        key_len: 0,
        extras_len: extras.len() as u8,
        datatype: 0,
        status,
        total_body_len: (extras.len() + value.len()) as u32,
        opaque: header.opaque,
        cas,
    };
    let mut frame = Vec::with_capacity(HEADER_LEN + extras.len() + value.len());
    response.write_to(&mut frame).unwrap();
    frame.extend_from_slice(extras);
    frame.extend_from_slice(value);
    frame
}

fn status_only(header: &RequestHeader, status: Status) -> Vec<u8> {
    respond(header, status, &[], &[], 0)
}

fn execute(header: &RequestHeader, body: &[u8], store: &StoreInner) -> Vec<u8> {
    let packet = split_body(header, body);
    let Some(opcode) = OpCode::from_u8(header.opcode) else {
        return status_only(header, Status::UnknownCommand);
    };
    match opcode {
        OpCode::Get | OpCode::GetReplica | OpCode::GetAndTouch => get_doc(header, &packet, store),
        OpCode::GetAndLock => get_and_lock(header, &packet, store),
        OpCode::Unlock => unlock(header, &packet, store),
        OpCode::Set | OpCode::Add | OpCode::Replace => store_doc(header, &packet, store, opcode),
        OpCode::Delete => delete_doc(header, &packet, store),
        OpCode::Increment | OpCode::Decrement => counter(header, &packet, store, opcode),
        OpCode::Append | OpCode::Prepend => adjoin(header, &packet, store, opcode),
        OpCode::Touch => touch(header, &packet, store),
        OpCode::Observe => observe(header, &packet, store),
        OpCode::GetCidByName => get_cid(header, &packet, store),
        OpCode::SubDocMultiLookup => subdoc_lookup(header, &packet, store),
        OpCode::SubDocMultiMutation => subdoc_mutate(header, &packet, store),
        _ => status_only(header, Status::NotSupported),
    }
}

fn get_doc(header: &RequestHeader, packet: &Packet<'_>, store: &StoreInner) -> Vec<u8> {
    let docs = store.docs.lock().unwrap();
    match docs.get(packet.key) {
        Some(doc) => respond(
            header,
            Status::Success,
            &doc.flags.to_be_bytes(),
            &doc.value,
            doc.cas,
        ),
        None => status_only(header, Status::KeyNotFound),
    }
}

fn get_and_lock(header: &RequestHeader, packet: &Packet<'_>, store: &StoreInner) -> Vec<u8> {
    let mut docs = store.docs.lock().unwrap();
    match docs.get_mut(packet.key) {
        Some(doc) if doc.locked => status_only(header, Status::Locked),
        Some(doc) => {
            doc.locked = true;
            doc.cas = store.cas_seq.fetch_add(1, Ordering::SeqCst);
            respond(
                header,
                Status::Success,
                &doc.flags.to_be_bytes(),
                &doc.value,
                doc.cas,
            )
        }
        None => status_only(header, Status::KeyNotFound),
    }
}

fn unlock(header: &RequestHeader, packet: &Packet<'_>, store: &StoreInner) -> Vec<u8> {
    let mut docs = store.docs.lock().unwrap();
    match docs.get_mut(packet.key) {
        Some(doc) if doc.locked && doc.cas == header.cas => {
            doc.locked = false;
            status_only(header, Status::Success)
        }
        Some(_) => status_only(header, Status::Locked),
        None => status_only(header, Status::KeyNotFound),
    }
}

fn store_doc(
    header: &RequestHeader,
    packet: &Packet<'_>,
    store: &StoreInner,
    opcode: OpCode,
) -> Vec<u8> {
    let flags = u32::from_be_bytes(packet.extras[0..4].try_into().unwrap());
    let mut docs = store.docs.lock().unwrap();
    let existing = docs.get(packet.key);

    match opcode {
        OpCode::Add if existing.is_some() => return status_only(header, Status::KeyExists),
        OpCode::Replace if existing.is_none() => return status_only(header, Status::KeyNotFound),
        _ => {}
    }
    if let Some(doc) = existing {
        if doc.locked && header.cas != doc.cas {
            return status_only(header, Status::Locked);
        }
        if header.cas != 0 && header.cas != doc.cas {
            return status_only(header, Status::KeyExists);
        }
    } else if header.cas != 0 {
        return status_only(header, Status::KeyNotFound);
    }

    let cas = store.next_cas();
    docs.insert(
        packet.key.to_vec(),
        Doc {
            value: packet.value.to_vec(),
            flags,
            cas,
            locked: false,
        },
    );
    respond(header, Status::Success, &[], &[], cas)
}

fn delete_doc(header: &RequestHeader, packet: &Packet<'_>, store: &StoreInner) -> Vec<u8> {
    let mut docs = store.docs.lock().unwrap();
    let Some(doc) = docs.get(packet.key) else {
        return status_only(header, Status::KeyNotFound);
    };
    if doc.locked && header.cas != doc.cas {
        return status_only(header, Status::Locked);
    }
    if header.cas != 0 && header.cas != doc.cas {
        return status_only(header, Status::KeyExists);
    }
    docs.remove(packet.key);
    respond(header, Status::Success, &[], &[], store.next_cas())
}

fn counter(
    header: &RequestHeader,
    packet: &Packet<'_>,
    store: &StoreInner,
    opcode: OpCode,
) -> Vec<u8> {
    let delta = u64::from_be_bytes(packet.extras[0..8].try_into().unwrap());
    let initial = u64::from_be_bytes(packet.extras[8..16].try_into().unwrap());
    let mut docs = store.docs.lock().unwrap();

    let value = match docs.get(packet.key) {
        Some(doc) => {
            let Ok(text) = std::str::from_utf8(&doc.value) else {
                return status_only(header, Status::DeltaBadval);
            };
            let Ok(current) = text.parse::<u64>() else {
                return status_only(header, Status::DeltaBadval);
            };
            match opcode {
                OpCode::Increment => current.wrapping_add(delta),
                _ => current.saturating_sub(delta),
            }
        }
        None => initial,
    };

    let cas = store.next_cas();
    docs.insert(
        packet.key.to_vec(),
        Doc {
            value: value.to_string().into_bytes(),
            flags: 0,
            cas,
            locked: false,
        },
    );
    respond(header, Status::Success, &[], &value.to_be_bytes(), cas)
}

fn adjoin(
    header: &RequestHeader,
    packet: &Packet<'_>,
    store: &StoreInner,
    opcode: OpCode,
) -> Vec<u8> {
    let mut docs = store.docs.lock().unwrap();
    let Some(doc) = docs.get_mut(packet.key) else {
        return status_only(header, Status::ItemNotStored);
    };
    if header.cas != 0 && header.cas != doc.cas {
        return status_only(header, Status::KeyExists);
    }
    match opcode {
        OpCode::Append => doc.value.extend_from_slice(packet.value),
        _ => {
            let mut joined = packet.value.to_vec();
            joined.extend_from_slice(&doc.value);
            doc.value = joined;
        }
    }
    doc.cas = store.cas_seq.fetch_add(1, Ordering::SeqCst);
    respond(header, Status::Success, &[], &[], doc.cas)
}

fn touch(header: &RequestHeader, packet: &Packet<'_>, store: &StoreInner) -> Vec<u8> {
    let mut docs = store.docs.lock().unwrap();
    match docs.get_mut(packet.key) {
        Some(doc) => {
            doc.cas = store.cas_seq.fetch_add(1, Ordering::SeqCst);
            respond(header, Status::Success, &[], &[], doc.cas)
        }
        None => status_only(header, Status::KeyNotFound),
    }
}

const KEY_STATE_FOUND: u8 = 0x00;
const KEY_STATE_NOT_FOUND: u8 = 0x80;

fn observe(header: &RequestHeader, packet: &Packet<'_>, store: &StoreInner) -> Vec<u8> {
    // value: vbucket(2), key length(2), key
    let value = packet.value;
    let vbucket = &value[0..2];
    let key_len = usize::from(u16::from_be_bytes([value[2], value[3]]));
    let key = &value[4..4 + key_len];

    let docs = store.docs.lock().unwrap();
    let (state, cas) = match docs.get(key) {
        Some(doc) => (KEY_STATE_FOUND, doc.cas),
        None => (KEY_STATE_NOT_FOUND, 0),
    };

    let mut body = Vec::new();
    body.extend_from_slice(vbucket);
    body.extend_from_slice(&(key_len as u16).to_be_bytes());
    body.extend_from_slice(key);
    body.push(state);
    body.extend_from_slice(&cas.to_be_bytes());
    respond(header, Status::Success, &[], &body, 0)
}

fn get_cid(header: &RequestHeader, packet: &Packet<'_>, store: &StoreInner) -> Vec<u8> {
    let Ok(path) = std::str::from_utf8(packet.value) else {
        return status_only(header, Status::InvalidArguments);
    };
    let collections = store.collections.lock().unwrap();
    let Some(&cid) = collections.get(path) else {
        return status_only(header, Status::UnknownCollection);
    };
    // manifest stamp (7 bytes), collection id (4 bytes), reserved (1 byte)
    let mut extras = vec![0u8; 7];
    extras.extend_from_slice(&cid.to_be_bytes());
    extras.push(0);
    respond(header, Status::Success, &extras, &[], 0)
}

// === sub-document ===

fn path_segments(path: &str) -> Vec<String> {
    // dotted paths with [n] indices; indices become "#n" pseudo-segments
    let mut segments = Vec::new();
    for part in path.split('.') {
        if let Some(bracket) = part.find('[') {
            let (name, indices) = part.split_at(bracket);
            if !name.is_empty() {
                segments.push(name.to_string());
            }
            for index in indices.split('[').filter(|s| !s.is_empty()) {
                segments.push(format!("#{}", index.trim_end_matches(']')));
            }
        } else {
            segments.push(part.to_string());
        }
    }
    segments
}

fn path_get<'doc>(doc: &'doc Value, path: &str) -> Option<&'doc Value> {
    if path.is_empty() {
        return Some(doc);
    }
    let mut current = doc;
    for segment in path_segments(path) {
        current = match segment.strip_prefix('#') {
            Some(index) => current.get(index.parse::<usize>().ok()?)?,
            None => current.get(segment.as_str())?,
        };
    }
    Some(current)
}

fn path_set(doc: &mut Value, path: &str, value: Value, create_parents: bool) -> Result<(), Status> {
    let segments = path_segments(path);
    let mut current = doc;
    for (position, segment) in segments.iter().enumerate() {
        let last = position == segments.len() - 1;
        match segment.strip_prefix('#') {
            Some(index) => {
                let index: usize = index.parse().map_err(|_| Status::SubDocPathInvalid)?;
                let array = current
                    .as_array_mut()
                    .ok_or(Status::SubDocPathMismatch)?;
                if index >= array.len() {
                    return Err(Status::SubDocPathNotFound);
                }
                if last {
                    array[index] = value;
                    return Ok(());
                }
                current = &mut array[index];
            }
            None => {
                let object = current
                    .as_object_mut()
                    .ok_or(Status::SubDocPathMismatch)?;
                if last {
                    object.insert(segment.clone(), value);
                    return Ok(());
                }
                if !object.contains_key(segment) {
                    if !create_parents {
                        return Err(Status::SubDocPathNotFound);
                    }
                    object.insert(segment.clone(), Value::Object(serde_json::Map::new()));
                }
                current = object.get_mut(segment).expect("just ensured");
            }
        }
    }
    Ok(())
}

fn path_remove(doc: &mut Value, path: &str) -> Result<(), Status> {
    let segments = path_segments(path);
    let (last, parents) = segments.split_last().ok_or(Status::SubDocPathInvalid)?;
    let mut current = doc;
    for segment in parents {
        current = match segment.strip_prefix('#') {
            Some(index) => {
                let index: usize = index.parse().map_err(|_| Status::SubDocPathInvalid)?;
                current.get_mut(index).ok_or(Status::SubDocPathNotFound)?
            }
            None => current
                .get_mut(segment.as_str())
                .ok_or(Status::SubDocPathNotFound)?,
        };
    }
    match last.strip_prefix('#') {
        Some(index) => {
            let index: usize = index.parse().map_err(|_| Status::SubDocPathInvalid)?;
            let array = current.as_array_mut().ok_or(Status::SubDocPathMismatch)?;
            if index >= array.len() {
                return Err(Status::SubDocPathNotFound);
            }
            array.remove(index);
        }
        None => {
            let object = current.as_object_mut().ok_or(Status::SubDocPathMismatch)?;
            object
                .remove(last.as_str())
                .ok_or(Status::SubDocPathNotFound)?;
        }
    }
    Ok(())
}

struct LookupSpec {
    op: u8,
    path: String,
    xattr: bool,
}

fn parse_lookup_specs(mut value: &[u8]) -> Vec<LookupSpec> {
    let mut specs = Vec::new();
    while !value.is_empty() {
        let op = value[0];
        let flags = value[1];
        let path_len = usize::from(u16::from_be_bytes([value[2], value[3]]));
        let path = String::from_utf8(value[4..4 + path_len].to_vec()).unwrap();
        value = &value[4 + path_len..];
        specs.push(LookupSpec {
            op,
            path,
            xattr: flags & 0x04 != 0,
        });
    }
    specs
}

struct MutateSpec {
    op: u8,
    path: String,
    value: Vec<u8>,
    create_parents: bool,
}

fn parse_mutate_specs(mut value: &[u8]) -> Vec<MutateSpec> {
    let mut specs = Vec::new();
    while !value.is_empty() {
        let op = value[0];
        let flags = value[1];
        let path_len = usize::from(u16::from_be_bytes([value[2], value[3]]));
        let value_len = u32::from_be_bytes(value[4..8].try_into().unwrap()) as usize;
        let path = String::from_utf8(value[8..8 + path_len].to_vec()).unwrap();
        let spec_value = value[8 + path_len..8 + path_len + value_len].to_vec();
        value = &value[8 + path_len + value_len..];
        specs.push(MutateSpec {
            op,
            path,
            value: spec_value,
            create_parents: flags & 0x01 != 0,
        });
    }
    specs
}

fn xattr_lookup(path: &str) -> Option<Value> {
    // only the virtual document xattr is modelled
    match path {
        "$document.exptime" => Some(Value::from(0u32)),
        _ => None,
    }
}

fn subdoc_lookup(header: &RequestHeader, packet: &Packet<'_>, store: &StoreInner) -> Vec<u8> {
    let docs = store.docs.lock().unwrap();
    let Some(doc) = docs.get(packet.key) else {
        return status_only(header, Status::KeyNotFound);
    };
    let Ok(json) = serde_json::from_slice::<Value>(&doc.value) else {
        return status_only(header, Status::SubDocDocNotJson);
    };

    let mut body = Vec::new();
    let mut any_failed = false;
    for spec in parse_lookup_specs(packet.value) {
        let found = if spec.xattr {
            xattr_lookup(&spec.path)
        } else if spec.op == SubDocOpCode::GetCount.as_u8() {
            path_get(&json, &spec.path).map(|value| match value {
                Value::Array(items) => Value::from(items.len()),
                Value::Object(entries) => Value::from(entries.len()),
                _ => Value::from(0u32),
            })
        } else {
            path_get(&json, &spec.path).cloned()
        };

        match (spec.op == SubDocOpCode::Exists.as_u8(), found) {
            (true, Some(_)) => {
                body.extend_from_slice(&Status::Success.as_u16().to_be_bytes());
                body.extend_from_slice(&0u32.to_be_bytes());
            }
            (false, Some(value)) => {
                let payload = serde_json::to_vec(&value).unwrap();
                body.extend_from_slice(&Status::Success.as_u16().to_be_bytes());
                body.extend_from_slice(&(payload.len() as u32).to_be_bytes());
                body.extend_from_slice(&payload);
            }
            (_, None) => {
                any_failed = true;
                body.extend_from_slice(&Status::SubDocPathNotFound.as_u16().to_be_bytes());
                body.extend_from_slice(&0u32.to_be_bytes());
            }
        }
    }

    let status = if any_failed {
        Status::SubDocMultiPathFailure
    } else {
        Status::Success
    };
    respond(header, status, &[], &body, doc.cas)
}

fn subdoc_mutate(header: &RequestHeader, packet: &Packet<'_>, store: &StoreInner) -> Vec<u8> {
    let mut docs = store.docs.lock().unwrap();
    let Some(doc) = docs.get_mut(packet.key) else {
        return status_only(header, Status::KeyNotFound);
    };
    if header.cas != 0 && header.cas != doc.cas {
        return status_only(header, Status::KeyExists);
    }
    let Ok(mut json) = serde_json::from_slice::<Value>(&doc.value) else {
        return status_only(header, Status::SubDocDocNotJson);
    };

    let mut body = Vec::new();
    for (index, spec) in parse_mutate_specs(packet.value).into_iter().enumerate() {
        match apply_mutation(&mut json, &spec) {
            Err(status) => {
                // failing envelope: report the first failing spec
                let mut failure = Vec::new();
                failure.push(index as u8);
                failure.extend_from_slice(&status.as_u16().to_be_bytes());
                return respond(header, Status::SubDocMultiPathFailure, &[], &failure, 0);
            }
            Ok(Some(value)) => {
                let payload = serde_json::to_vec(&value).unwrap();
                body.push(index as u8);
                body.extend_from_slice(&Status::Success.as_u16().to_be_bytes());
                body.extend_from_slice(&(payload.len() as u32).to_be_bytes());
                body.extend_from_slice(&payload);
            }
            Ok(None) => {}
        }
    }

    doc.value = serde_json::to_vec(&json).unwrap();
    doc.cas = store.cas_seq.fetch_add(1, Ordering::SeqCst);
    respond(header, Status::Success, &[], &body, doc.cas)
}

fn apply_mutation(json: &mut Value, spec: &MutateSpec) -> Result<Option<Value>, Status> {
    let parse_value = || -> Result<Value, Status> {
        serde_json::from_slice(&spec.value).map_err(|_| Status::SubDocCannotInsert)
    };

    match spec.op {
        op if op == SubDocOpCode::DictUpsert.as_u8() => {
            path_set(json, &spec.path, parse_value()?, spec.create_parents)?;
            Ok(None)
        }
        op if op == SubDocOpCode::DictAdd.as_u8() => {
            if path_get(json, &spec.path).is_some() {
                return Err(Status::SubDocPathExists);
            }
            path_set(json, &spec.path, parse_value()?, spec.create_parents)?;
            Ok(None)
        }
        op if op == SubDocOpCode::Replace.as_u8() => {
            if path_get(json, &spec.path).is_none() {
                return Err(Status::SubDocPathNotFound);
            }
            path_set(json, &spec.path, parse_value()?, false)?;
            Ok(None)
        }
        op if op == SubDocOpCode::Delete.as_u8() => {
            path_remove(json, &spec.path)?;
            Ok(None)
        }
        op if op == SubDocOpCode::ArrayPushLast.as_u8()
            || op == SubDocOpCode::ArrayPushFirst.as_u8() =>
        {
            let value = parse_value()?;
            let target = path_get(json, &spec.path)
                .cloned()
                .unwrap_or_else(|| Value::Array(Vec::new()));
            let Value::Array(mut items) = target else {
                return Err(Status::SubDocPathMismatch);
            };
            if op == SubDocOpCode::ArrayPushLast.as_u8() {
                items.push(value);
            } else {
                items.insert(0, value);
            }
            path_set(json, &spec.path, Value::Array(items), spec.create_parents)?;
            Ok(None)
        }
        op if op == SubDocOpCode::Counter.as_u8() => {
            let delta: i64 = std::str::from_utf8(&spec.value)
                .ok()
                .and_then(|text| text.parse().ok())
                .ok_or(Status::SubDocDeltaRange)?;
            let current = path_get(json, &spec.path)
                .and_then(Value::as_i64)
                .unwrap_or(0);
            let next = current + delta;
            path_set(json, &spec.path, Value::from(next), spec.create_parents)?;
            Ok(Some(Value::from(next)))
        }
        _ => Err(Status::NotSupported),
    }
}
