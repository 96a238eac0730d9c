//! Shared helpers for integration tests.
//!
//! `FakeNode` is an in-process data node speaking the binary KV protocol
//! over a real socket. Behavior is scriptable per opcode (fail, swallow) so
//! tests can drive retry, fan-out, and durability paths; several nodes can
//! share one document store to model a replicated vbucket.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

use skerry_client::protocol::{self, opcode, RequestPacket, ResponsePacket, ServerCodec, Status};
use skerry_client::{ClusterMapConfig, NodeCapabilities, NodeConfig};

/// Vbucket uuid every fake node reports.
pub const FAKE_VBUUID: u64 = 0xB0B0_CAFE;

/// One stored document.
#[derive(Clone, Debug)]
pub struct Doc {
    pub value: Vec<u8>,
    pub flags: u32,
    pub cas: u64,
    pub datatype: u8,
    pub seqno: u64,
}

/// Cluster-wide document state, shareable between nodes acting as replicas
/// of each other: documents plus the CAS and sequence counters, which the
/// protocol treats as vbucket-scoped rather than node-scoped.
pub struct SharedState {
    docs: Mutex<HashMap<Vec<u8>, Doc>>,
    cas: AtomicU64,
    seq: AtomicU64,
}

pub type SharedStore = Arc<SharedState>;

pub fn new_store() -> SharedStore {
    Arc::new(SharedState {
        docs: Mutex::new(HashMap::new()),
        cas: AtomicU64::new(1000),
        seq: AtomicU64::new(0),
    })
}

#[derive(Default)]
struct Behavior {
    fail: Mutex<HashMap<u8, VecDeque<Status>>>,
    swallow: Mutex<HashMap<u8, u32>>,
    never_persist: AtomicBool,
    mutation_tokens: AtomicBool,
    collections: AtomicBool,
    collection_ids: Mutex<HashMap<String, u32>>,
}

struct NodeInner {
    store: SharedStore,
    behavior: Behavior,
    counters: Mutex<HashMap<u8, u64>>,
    last_keys: Mutex<HashMap<u8, Vec<u8>>>,
    last_frame_extras: Mutex<Vec<u8>>,
}

/// In-process fake data node.
pub struct FakeNode {
    pub addr: SocketAddr,
    inner: Arc<NodeInner>,
}

impl FakeNode {
    pub async fn spawn() -> FakeNode {
        FakeNode::spawn_shared(new_store()).await
    }

    /// Spawn a node serving the given (possibly shared) store.
    pub async fn spawn_shared(store: SharedStore) -> FakeNode {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake node");
        let addr = listener.local_addr().expect("local addr");
        let inner = Arc::new(NodeInner {
            store,
            behavior: Behavior {
                mutation_tokens: AtomicBool::new(true),
                ..Behavior::default()
            },
            counters: Mutex::new(HashMap::new()),
            last_keys: Mutex::new(HashMap::new()),
            last_frame_extras: Mutex::new(Vec::new()),
        });
        let accept_inner = inner.clone();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                let conn_inner = accept_inner.clone();
                tokio::spawn(serve_conn(socket, conn_inner));
            }
        });
        FakeNode { addr, inner }
    }

    /// Respond to the next `times` requests of `op` with `status`.
    pub fn fail_times(&self, op: u8, status: Status, times: usize) {
        let mut fail = self.inner.behavior.fail.lock().unwrap();
        let queue = fail.entry(op).or_default();
        for _ in 0..times {
            queue.push_back(status);
        }
    }

    pub fn fail_next(&self, op: u8, status: Status) {
        self.fail_times(op, status, 1);
    }

    /// Read and ignore the next `times` requests of `op`.
    pub fn swallow_next(&self, op: u8, times: u32) {
        *self.inner.behavior.swallow.lock().unwrap().entry(op).or_insert(0) += times;
    }

    /// Stop acknowledging persistence (observe never reports persisted).
    pub fn set_never_persist(&self, on: bool) {
        self.inner.behavior.never_persist.store(on, Ordering::Relaxed);
    }

    pub fn set_mutation_tokens(&self, on: bool) {
        self.inner.behavior.mutation_tokens.store(on, Ordering::Relaxed);
    }

    /// Expect collection-id prefixes on document keys.
    pub fn enable_collections(&self) {
        self.inner.behavior.collections.store(true, Ordering::Relaxed);
    }

    pub fn set_collection_id(&self, path: &str, cid: u32) {
        self.inner
            .behavior
            .collection_ids
            .lock()
            .unwrap()
            .insert(path.to_string(), cid);
    }

    /// Number of requests received for an opcode.
    pub fn received(&self, op: u8) -> u64 {
        self.inner
            .counters
            .lock()
            .unwrap()
            .get(&op)
            .copied()
            .unwrap_or(0)
    }

    /// Raw wire key of the most recent request for an opcode.
    pub fn last_key(&self, op: u8) -> Option<Vec<u8>> {
        self.inner.last_keys.lock().unwrap().get(&op).cloned()
    }

    /// Frame-extras of the most recent alt request.
    pub fn last_frame_extras(&self) -> Vec<u8> {
        self.inner.last_frame_extras.lock().unwrap().clone()
    }

    /// Direct read of a stored document by logical key.
    pub fn doc(&self, key: &[u8]) -> Option<Doc> {
        self.inner.store.docs.lock().unwrap().get(key).cloned()
    }
}

async fn serve_conn(socket: TcpStream, inner: Arc<NodeInner>) {
    let mut framed = Framed::new(socket, ServerCodec);
    while let Some(Ok(req)) = framed.next().await {
        {
            *inner.counters.lock().unwrap().entry(req.opcode).or_insert(0) += 1;
            inner
                .last_keys
                .lock()
                .unwrap()
                .insert(req.opcode, req.key.to_vec());
            if !req.frame_extras.is_empty() {
                *inner.last_frame_extras.lock().unwrap() = req.frame_extras.to_vec();
            }
        }
        if take_swallow(&inner, req.opcode) {
            continue;
        }
        let resp = match take_failure(&inner, req.opcode) {
            Some(status) => {
                let mut resp = ResponsePacket::new(req.opcode, status);
                resp.opaque = req.opaque;
                resp
            }
            None => handle_request(&inner, &req),
        };
        if framed.send(resp).await.is_err() {
            return;
        }
    }
}

fn take_swallow(inner: &NodeInner, op: u8) -> bool {
    let mut swallow = inner.behavior.swallow.lock().unwrap();
    match swallow.get_mut(&op) {
        Some(count) if *count > 0 => {
            *count -= 1;
            true
        }
        _ => false,
    }
}

fn take_failure(inner: &NodeInner, op: u8) -> Option<Status> {
    inner
        .behavior
        .fail
        .lock()
        .unwrap()
        .get_mut(&op)
        .and_then(VecDeque::pop_front)
}

/// Strip the collection-id prefix when the node runs in collections mode.
fn doc_key(inner: &NodeInner, wire_key: &[u8]) -> Vec<u8> {
    if inner.behavior.collections.load(Ordering::Relaxed) {
        if let Some((_cid, rest)) = protocol::split_collection_id(wire_key) {
            return rest.to_vec();
        }
    }
    wire_key.to_vec()
}

fn token_extras(inner: &NodeInner, seqno: u64) -> Bytes {
    if !inner.behavior.mutation_tokens.load(Ordering::Relaxed) {
        return Bytes::new();
    }
    let mut extras = BytesMut::with_capacity(16);
    extras.put_u64(FAKE_VBUUID);
    extras.put_u64(seqno);
    extras.freeze()
}

fn handle_request(inner: &NodeInner, req: &RequestPacket) -> ResponsePacket {
    let mut resp = match req.opcode {
        opcode::GET | opcode::GET_AND_TOUCH | opcode::GET_LOCKED | opcode::GET_REPLICA => {
            let key = doc_key(inner, &req.key);
            match inner.store.docs.lock().unwrap().get(&key) {
                Some(doc) => {
                    let mut resp = ResponsePacket::new(req.opcode, Status::Success);
                    let mut extras = BytesMut::with_capacity(4);
                    extras.put_u32(doc.flags);
                    resp.extras = extras.freeze();
                    resp.datatype = doc.datatype;
                    resp.cas = doc.cas;
                    resp.value = Bytes::from(doc.value.clone());
                    resp
                }
                None => ResponsePacket::new(req.opcode, Status::KeyNotFound),
            }
        }
        opcode::SET | opcode::ADD | opcode::REPLACE | opcode::APPEND | opcode::PREPEND => {
            handle_store(inner, req)
        }
        opcode::DELETE => {
            let key = doc_key(inner, &req.key);
            let mut docs = inner.store.docs.lock().unwrap();
            match docs.get(&key) {
                None => ResponsePacket::new(req.opcode, Status::KeyNotFound),
                Some(doc) if req.cas != 0 && doc.cas != req.cas => {
                    ResponsePacket::new(req.opcode, Status::KeyExists)
                }
                Some(_) => {
                    docs.remove(&key);
                    let seqno = inner.store.seq.fetch_add(1, Ordering::Relaxed) + 1;
                    let mut resp = ResponsePacket::new(req.opcode, Status::Success);
                    resp.cas = inner.store.cas.fetch_add(1, Ordering::Relaxed) + 1;
                    resp.extras = token_extras(inner, seqno);
                    resp
                }
            }
        }
        opcode::OBSERVE => handle_observe(inner, req),
        opcode::OBSERVE_SEQNO => {
            let seq = inner.store.seq.load(Ordering::Relaxed);
            let persisted = if inner.behavior.never_persist.load(Ordering::Relaxed) {
                0
            } else {
                seq
            };
            let mut value = BytesMut::with_capacity(27);
            value.put_u8(0);
            value.put_u16(req.vbucket);
            value.put_u64(FAKE_VBUUID);
            value.put_u64(persisted);
            value.put_u64(seq);
            let mut resp = ResponsePacket::new(req.opcode, Status::Success);
            resp.value = value.freeze();
            resp
        }
        opcode::GET_COLLECTION_ID => {
            let path = String::from_utf8_lossy(&req.value).to_string();
            match inner.behavior.collection_ids.lock().unwrap().get(&path) {
                Some(cid) => {
                    let mut extras = BytesMut::with_capacity(12);
                    extras.put_u64(1);
                    extras.put_u32(*cid);
                    let mut resp = ResponsePacket::new(req.opcode, Status::Success);
                    resp.extras = extras.freeze();
                    resp
                }
                None => ResponsePacket::new(req.opcode, Status::UnknownCollection),
            }
        }
        opcode::VERSION => {
            let mut resp = ResponsePacket::new(req.opcode, Status::Success);
            resp.value = Bytes::from_static(b"fake-node/1.0");
            resp
        }
        _ => ResponsePacket::new(req.opcode, Status::Invalid),
    };
    resp.opaque = req.opaque;
    resp
}

fn handle_store(inner: &NodeInner, req: &RequestPacket) -> ResponsePacket {
    let key = doc_key(inner, &req.key);
    let mut docs = inner.store.docs.lock().unwrap();
    let existing = docs.get(&key).cloned();
    match req.opcode {
        opcode::ADD if existing.is_some() => {
            return ResponsePacket::new(req.opcode, Status::KeyExists)
        }
        opcode::REPLACE if existing.is_none() => {
            return ResponsePacket::new(req.opcode, Status::KeyNotFound)
        }
        opcode::APPEND | opcode::PREPEND if existing.is_none() => {
            return ResponsePacket::new(req.opcode, Status::NotStored)
        }
        _ => {}
    }
    if req.cas != 0 {
        match &existing {
            Some(doc) if doc.cas != req.cas => {
                return ResponsePacket::new(req.opcode, Status::KeyExists)
            }
            None => return ResponsePacket::new(req.opcode, Status::KeyNotFound),
            _ => {}
        }
    }
    let (flags, datatype, value) = match req.opcode {
        opcode::APPEND => {
            let base = existing.expect("checked above");
            let mut value = base.value.clone();
            value.extend_from_slice(&req.value);
            (base.flags, base.datatype, value)
        }
        opcode::PREPEND => {
            let base = existing.expect("checked above");
            let mut value = req.value.to_vec();
            value.extend_from_slice(&base.value);
            (base.flags, base.datatype, value)
        }
        _ => {
            let flags = if req.extras.len() >= 8 {
                u32::from_be_bytes(req.extras[0..4].try_into().unwrap())
            } else {
                0
            };
            (flags, req.datatype, req.value.to_vec())
        }
    };
    let cas = inner.store.cas.fetch_add(1, Ordering::Relaxed) + 1;
    let seqno = inner.store.seq.fetch_add(1, Ordering::Relaxed) + 1;
    docs.insert(
        key,
        Doc {
            value,
            flags,
            cas,
            datatype,
            seqno,
        },
    );
    let mut resp = ResponsePacket::new(req.opcode, Status::Success);
    resp.cas = cas;
    resp.extras = token_extras(inner, seqno);
    resp
}

fn handle_observe(inner: &NodeInner, req: &RequestPacket) -> ResponsePacket {
    let never_persist = inner.behavior.never_persist.load(Ordering::Relaxed);
    let mut body = &req.value[..];
    let mut out = BytesMut::new();
    while body.remaining() >= 4 {
        let vbucket = body.get_u16();
        let key_len = body.get_u16() as usize;
        if body.remaining() < key_len {
            break;
        }
        let wire_key = body.copy_to_bytes(key_len);
        let key = doc_key(inner, &wire_key);
        let (state, cas) = match inner.store.docs.lock().unwrap().get(&key) {
            Some(doc) if never_persist => (0x00u8, doc.cas),
            Some(doc) => (0x01u8, doc.cas),
            None => (0x80u8, 0),
        };
        out.put_u16(vbucket);
        out.put_u16(wire_key.len() as u16);
        out.extend_from_slice(&wire_key);
        out.put_u8(state);
        out.put_u64(cas);
    }
    let mut resp = ResponsePacket::new(req.opcode, Status::Success);
    resp.value = out.freeze();
    resp
}

/// Build a map document pointing at fake nodes.
pub fn map_config(
    rev: u64,
    nodes: &[&FakeNode],
    vbuckets: Vec<Vec<i32>>,
    capabilities: NodeCapabilities,
) -> ClusterMapConfig {
    ClusterMapConfig {
        rev,
        nodes: nodes
            .iter()
            .map(|node| NodeConfig {
                address: node.addr.to_string(),
                capabilities,
            })
            .collect(),
        vbuckets,
    }
}

/// A map where every vbucket has the same `[master, replicas...]` row.
pub fn uniform_vbuckets(n_vbuckets: usize, row: Vec<i32>) -> Vec<Vec<i32>> {
    vec![row; n_vbuckets]
}
