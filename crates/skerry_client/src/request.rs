//! Per-packet request state and response processing.
//!
//! Every in-flight packet carries a `RequestCtx`: the cloneable command spec
//! (enough to re-encode on retry), the responder channel, and a processor
//! variant. The default processor decodes and delivers; extended processors
//! implement replica fan-out, observe multiplexing, durability hand-off, and
//! collection-id resolution. A context reaches exactly one logical outcome:
//! delivery, timeout, or connection failure.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::cluster_map::NodeCapabilities;
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::instance::CoreMsg;
use crate::ops::{
    CollectionQualifier, DurabilityLevel, GetResponse, MutationToken, ReplicaRead,
    ReplicaStrategy, StoreOperation,
};
use crate::protocol::{
    self, key_with_collection_id, opcode, RequestPacket, ResponsePacket, Status, DATATYPE_JSON,
    DATATYPE_SNAPPY,
};

/// Operation payload of a command spec.
#[derive(Debug, Clone)]
pub(crate) enum RequestKind {
    Get {
        touch: Option<u32>,
        lock: Option<u32>,
    },
    Store {
        operation: StoreOperation,
        value: Bytes,
        flags: u32,
        expiry: u32,
        json: bool,
        precompressed: bool,
        /// Synchronous-replication level and frame-extras timeout (ms).
        sync: Option<(DurabilityLevel, u16)>,
    },
    Remove {
        sync: Option<(DurabilityLevel, u16)>,
    },
    ReplicaGet,
    Observe {
        /// Pre-encoded `(vbucket, key)` entry list.
        entries: Bytes,
    },
    ObserveSeqno {
        vbuuid: u64,
    },
    GetCollectionId {
        path: Bytes,
    },
}

/// Cloneable description of a command; re-encoded on every dispatch.
#[derive(Debug, Clone)]
pub(crate) struct CommandSpec {
    pub kind: RequestKind,
    /// Logical key without any collection-id prefix. Empty for body-addressed
    /// packets (observe, collection-id lookup).
    pub key: Bytes,
    pub collection: CollectionQualifier,
    /// `None` until the resolver has produced an id.
    pub cid: Option<u32>,
    pub cas: u64,
    /// Pinned by routing or by the caller (replica reads, observe).
    pub vbucket: Option<u16>,
    pub server: Option<usize>,
    pub start: Instant,
    pub deadline: Instant,
    pub attempt: u32,
    /// Map revision and server used at the last dispatch.
    pub dispatched_rev: u64,
    pub last_server: Option<usize>,
}

impl CommandSpec {
    pub(crate) fn new(kind: RequestKind, key: Bytes, start: Instant, deadline: Instant) -> Self {
        CommandSpec {
            kind,
            key,
            collection: CollectionQualifier::default(),
            cid: Some(0),
            cas: 0,
            vbucket: None,
            server: None,
            start,
            deadline,
            attempt: 0,
            dispatched_rev: 0,
            last_server: None,
        }
    }

    /// Reads may be re-routed after a connection drops; writes may not.
    pub(crate) fn retryable(&self) -> bool {
        matches!(
            self.kind,
            RequestKind::Get { .. }
                | RequestKind::ReplicaGet
                | RequestKind::Observe { .. }
                | RequestKind::ObserveSeqno { .. }
                | RequestKind::GetCollectionId { .. }
        )
    }

    pub(crate) fn expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

/// Typed payload delivered to the submission side.
#[derive(Debug)]
pub(crate) enum KvResponse {
    Get(GetResponse),
    Store {
        cas: u64,
        token: Option<MutationToken>,
        durability: Option<crate::ops::ObserveReport>,
    },
    Remove {
        cas: u64,
        token: Option<MutationToken>,
    },
    CollectionId {
        manifest: u64,
        cid: u32,
    },
}

/// Channel the single logical outcome is delivered on.
#[derive(Debug)]
pub(crate) enum Responder {
    Kv(oneshot::Sender<Result<KvResponse>>),
    /// Extended processors deliver through their own channels.
    None,
}

impl Responder {
    pub(crate) fn deliver(self, result: Result<KvResponse>) {
        if let Responder::Kv(tx) = self {
            // A dropped receiver is a canceled caller, not an error.
            let _ = tx.send(result);
        }
    }
}

/// Shared state of one replica-read fan-out.
#[derive(Debug)]
pub(crate) struct ReplicaFanout {
    pub strategy: ReplicaStrategy,
    pub vbucket: u16,
    pub tx: mpsc::UnboundedSender<ReplicaRead>,
    /// Outstanding packets (ALL strategy).
    pub remaining: Mutex<u16>,
    /// Replica cursor (FIRST strategy).
    pub cursor: Mutex<u16>,
}

/// One server's contribution to an observe aggregation.
#[derive(Debug)]
pub(crate) struct ObserveOutcome {
    pub server: usize,
    pub is_master: bool,
    pub result: Result<ResponsePacket>,
}

/// Where observe responses are multiplexed to.
#[derive(Debug, Clone)]
pub(crate) enum ObserveSink {
    /// A user-facing observe context's aggregator task.
    Task(mpsc::UnboundedSender<ObserveOutcome>),
    /// A durability poll round owned by the instance core.
    Poll {
        core: mpsc::UnboundedSender<CoreMsg>,
        poll_id: u64,
    },
}

impl ObserveSink {
    fn send(&self, outcome: ObserveOutcome) {
        match self {
            ObserveSink::Task(tx) => {
                let _ = tx.send(outcome);
            }
            ObserveSink::Poll { core, poll_id } => {
                let _ = core.send(CoreMsg::PollObserve {
                    poll_id: *poll_id,
                    outcome,
                });
            }
        }
    }
}

/// Processor table attached to a packet.
#[derive(Debug)]
pub(crate) enum Processor {
    /// Decode and deliver directly to the responder.
    Default,
    /// Hand a successful store off to the durability poller.
    DurableStore {
        persist_to: u16,
        replicate_to: u16,
        seqno: bool,
    },
    ReplicaRead(Arc<ReplicaFanout>),
    Observe {
        sink: ObserveSink,
        is_master: bool,
    },
    /// Resolve the outcome into the collection cache.
    CollectionId,
}

/// A scheduled command: spec + responder + processor.
#[derive(Debug)]
pub(crate) struct RequestCtx {
    pub spec: CommandSpec,
    pub responder: Responder,
    pub processor: Processor,
}

impl RequestCtx {
    pub(crate) fn new(spec: CommandSpec, responder: Responder, processor: Processor) -> Self {
        RequestCtx {
            spec,
            responder,
            processor,
        }
    }
}

/// Why a context is being handed back to the command queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RetryReason {
    /// The server no longer owns the vbucket; wait for a fresher map.
    NotMyVbucket,
    /// Temporary server-side pressure; back off and resend.
    Backoff,
    /// The pipeline drained; re-route immediately.
    Reroute,
}

enum Outcome {
    Deliver,
    Fail(Error),
    RetryNmv,
    RetryBackoff,
}

/// Translate a response status into an error kind, given the operation.
fn map_status(status: Status, kind: &RequestKind) -> Error {
    match status {
        Status::Success => unreachable!("success is not an error"),
        Status::KeyNotFound | Status::NotStored => Error::DocumentNotFound,
        Status::KeyExists => match kind {
            RequestKind::Store {
                operation: StoreOperation::Insert,
                ..
            } => Error::DocumentExists,
            _ => Error::CasMismatch,
        },
        Status::TooBig => Error::InvalidArgument("value too large"),
        Status::Invalid => Error::InvalidArgument("server rejected the request"),
        Status::NotMyVbucket => Error::NoMatchingServer,
        Status::Locked => Error::DocumentLocked,
        Status::OutOfMemory => Error::OutOfMemory,
        Status::Busy | Status::TemporaryFailure => Error::ScheduleFailure,
        Status::UnknownCollection => Error::FeatureUnavailable("unknown collection"),
        Status::Unknown(raw) => Error::Protocol(format!("unexpected status 0x{raw:04x}")),
    }
}

fn classify(status: Status, kind: &RequestKind) -> Outcome {
    match status {
        Status::Success => Outcome::Deliver,
        Status::NotMyVbucket => Outcome::RetryNmv,
        Status::Busy | Status::TemporaryFailure => Outcome::RetryBackoff,
        other => Outcome::Fail(map_status(other, kind)),
    }
}

/// Handle a decoded response for the packet it correlates to.
///
/// Runs on the pipeline task; anything that needs routing state goes back to
/// the core through `core`.
pub(crate) fn process_response(
    ctx: RequestCtx,
    resp: ResponsePacket,
    core: &mpsc::UnboundedSender<CoreMsg>,
    settings: &Settings,
) {
    match &ctx.processor {
        Processor::Observe { sink, is_master } => {
            let outcome = ObserveOutcome {
                server: ctx.spec.server.unwrap_or_default(),
                is_master: *is_master,
                result: match resp.status {
                    Status::Success => Ok(resp),
                    status => Err(map_status(status, &ctx.spec.kind)),
                },
            };
            sink.send(outcome);
        }
        Processor::ReplicaRead(_) => {
            let result = match resp.status {
                Status::Success => decode_get(&resp, settings),
                status => Err(map_status(status, &ctx.spec.kind)),
            };
            replica_result(ctx, result, core);
        }
        _ => match classify(resp.status, &ctx.spec.kind) {
            Outcome::Deliver => {
                let decoded = decode_response(&ctx.spec, &resp, settings);
                deliver(ctx, decoded, core);
            }
            Outcome::Fail(err) => deliver(ctx, Err(err), core),
            Outcome::RetryNmv => requeue_or_timeout(ctx, RetryReason::NotMyVbucket, core),
            Outcome::RetryBackoff => requeue_or_timeout(ctx, RetryReason::Backoff, core),
        },
    }
}

/// Handle a transport-level failure (timeout, connection loss, drain).
///
/// `can_requeue` is set when the pipeline is draining and retryable packets
/// should be re-routed instead of failed.
pub(crate) fn process_failure(
    ctx: RequestCtx,
    error: Error,
    can_requeue: bool,
    core: &mpsc::UnboundedSender<CoreMsg>,
) {
    match &ctx.processor {
        Processor::Observe { sink, is_master } => {
            sink.send(ObserveOutcome {
                server: ctx.spec.server.unwrap_or_default(),
                is_master: *is_master,
                result: Err(error),
            });
        }
        Processor::ReplicaRead(_) => replica_result(ctx, Err(error), core),
        _ => {
            let now = Instant::now();
            if can_requeue
                && error != Error::Timeout
                && ctx.spec.retryable()
                && !ctx.spec.expired(now)
            {
                let _ = core.send(CoreMsg::Requeue {
                    ctx,
                    reason: RetryReason::Reroute,
                });
            } else {
                deliver(ctx, Err(error), core);
            }
        }
    }
}

/// Route a final result through the context's processor.
pub(crate) fn deliver(
    ctx: RequestCtx,
    result: Result<KvResponse>,
    core: &mpsc::UnboundedSender<CoreMsg>,
) {
    match &ctx.processor {
        Processor::Default => ctx.responder.deliver(result),
        &Processor::DurableStore {
            persist_to,
            replicate_to,
            seqno,
        } => match result {
            Ok(KvResponse::Store { cas, token, .. }) => {
                let _ = core.send(CoreMsg::StartPoll(Box::new(
                    crate::durability::PollStart {
                        key: ctx.spec.key.clone(),
                        collection: ctx.spec.collection.clone(),
                        cid: ctx.spec.cid.unwrap_or(0),
                        vbucket: ctx.spec.vbucket.unwrap_or(0),
                        cas,
                        token,
                        // A mutation token upgrades the poll to seqno mode.
                        seqno: seqno || token.is_some(),
                        persist_to,
                        replicate_to,
                        check_removed: false,
                        deadline: None,
                        interval: None,
                        sink: crate::durability::PollSink::Store {
                            responder: ctx.responder,
                            cas,
                            token,
                        },
                    },
                )));
            }
            Ok(other) => {
                warn!(?other, "durable store decoded into a non-store response");
                ctx.responder.deliver(Err(Error::Protocol(
                    "durable store produced an unexpected response".to_string(),
                )));
            }
            Err(err) => ctx.responder.deliver(Err(err)),
        },
        Processor::ReplicaRead(_) => {
            let result = result.and_then(|r| match r {
                KvResponse::Get(resp) => Ok(resp),
                _ => Err(Error::Protocol(
                    "replica read produced an unexpected response".to_string(),
                )),
            });
            replica_result(ctx, result, core);
        }
        Processor::Observe { sink, is_master } => {
            // Scheduling failures reach observe packets here; successes go
            // through the sink in process_response.
            let error = match result {
                Err(err) => err,
                Ok(_) => Error::Protocol("observe delivered out of band".to_string()),
            };
            sink.send(ObserveOutcome {
                server: ctx.spec.server.unwrap_or_default(),
                is_master: *is_master,
                result: Err(error),
            });
        }
        Processor::CollectionId => {
            let mapped = result.and_then(|r| match r {
                KvResponse::CollectionId { manifest, cid } => Ok((manifest, cid)),
                _ => Err(Error::Protocol(
                    "collection lookup produced an unexpected response".to_string(),
                )),
            });
            let _ = core.send(CoreMsg::CidResolved {
                qualifier: ctx.spec.collection.clone(),
                result: mapped,
            });
        }
    }
}

fn requeue_or_timeout(
    ctx: RequestCtx,
    reason: RetryReason,
    core: &mpsc::UnboundedSender<CoreMsg>,
) {
    if ctx.spec.expired(Instant::now()) {
        deliver(ctx, Err(Error::Timeout), core);
    } else {
        let _ = core.send(CoreMsg::Requeue { ctx, reason });
    }
}

/// Emit a replica-read result, advancing the FIRST cursor through the core
/// when this replica failed and others remain.
fn replica_result(
    ctx: RequestCtx,
    result: Result<GetResponse>,
    core: &mpsc::UnboundedSender<CoreMsg>,
) {
    let Processor::ReplicaRead(fanout) = &ctx.processor else {
        unreachable!("replica_result requires a replica processor");
    };
    match fanout.strategy {
        ReplicaStrategy::Select(_) => {
            let _ = fanout.tx.send(ReplicaRead {
                result,
                is_final: true,
            });
        }
        ReplicaStrategy::All => {
            let mut remaining = fanout.remaining.lock().expect("fanout counter poisoned");
            *remaining = remaining.saturating_sub(1);
            let is_final = *remaining == 0;
            drop(remaining);
            let _ = fanout.tx.send(ReplicaRead { result, is_final });
        }
        ReplicaStrategy::First => match result {
            Ok(resp) => {
                let _ = fanout.tx.send(ReplicaRead {
                    result: Ok(resp),
                    is_final: true,
                });
            }
            Err(error) => {
                let _ = core.send(CoreMsg::ReplicaNext { ctx, error });
            }
        },
    }
}

/// Decode a successful response into the typed payload for its kind.
fn decode_response(
    spec: &CommandSpec,
    resp: &ResponsePacket,
    settings: &Settings,
) -> Result<KvResponse> {
    match &spec.kind {
        RequestKind::Get { .. } | RequestKind::ReplicaGet => {
            decode_get(resp, settings).map(KvResponse::Get)
        }
        RequestKind::Store { .. } => Ok(KvResponse::Store {
            cas: resp.cas,
            token: decode_token(spec, resp, settings),
            durability: None,
        }),
        RequestKind::Remove { .. } => Ok(KvResponse::Remove {
            cas: resp.cas,
            token: decode_token(spec, resp, settings),
        }),
        RequestKind::GetCollectionId { .. } => {
            if resp.extras.len() < 12 {
                return Err(Error::Protocol(
                    "collection-id response extras too short".to_string(),
                ));
            }
            let manifest = u64::from_be_bytes(resp.extras[0..8].try_into().expect("8 bytes"));
            let cid = u32::from_be_bytes(resp.extras[8..12].try_into().expect("4 bytes"));
            Ok(KvResponse::CollectionId { manifest, cid })
        }
        RequestKind::Observe { .. } | RequestKind::ObserveSeqno { .. } => {
            unreachable!("observe responses go through the sink")
        }
    }
}

/// Decode a get-family response, inflating snappy values when configured.
pub(crate) fn decode_get(resp: &ResponsePacket, settings: &Settings) -> Result<GetResponse> {
    let flags = if resp.extras.len() >= 4 {
        u32::from_be_bytes(resp.extras[0..4].try_into().expect("4 bytes"))
    } else {
        0
    };
    let mut datatype = resp.datatype;
    let value = if datatype & DATATYPE_SNAPPY != 0 && settings.compression.inbound {
        let raw = snap::raw::Decoder::new()
            .decompress_vec(&resp.value)
            .map_err(|err| Error::Protocol(format!("snappy inflate failed: {err}")))?;
        datatype &= !DATATYPE_SNAPPY;
        Bytes::from(raw)
    } else {
        resp.value.clone()
    };
    Ok(GetResponse {
        cas: resp.cas,
        flags,
        datatype,
        value,
    })
}

fn decode_token(
    spec: &CommandSpec,
    resp: &ResponsePacket,
    settings: &Settings,
) -> Option<MutationToken> {
    if !settings.enable_mutation_tokens || resp.extras.len() < 16 {
        return None;
    }
    let uuid = u64::from_be_bytes(resp.extras[0..8].try_into().expect("8 bytes"));
    let seqno = u64::from_be_bytes(resp.extras[8..16].try_into().expect("8 bytes"));
    Some(MutationToken {
        uuid,
        vbucket: spec.vbucket.unwrap_or(0),
        seqno,
    })
}

/// Frame-extras for synchronous replication: `(id|len, level, timeout_ms)`.
fn sync_frame_extras(level: DurabilityLevel, timeout_ms: u16) -> Bytes {
    let mut fx = BytesMut::with_capacity(4);
    fx.put_u8((0x01 << 4) | 0x03);
    fx.put_u8(level as u8);
    fx.put_u16(timeout_ms);
    fx.freeze()
}

/// Serialize a command spec against the capabilities of its target server.
///
/// The opaque is assigned later by the pipeline; retries re-encode from the
/// spec so a new target's capabilities are honored.
pub(crate) fn encode_packet(
    spec: &CommandSpec,
    caps: &NodeCapabilities,
    settings: &Settings,
) -> RequestPacket {
    let use_cid = settings.use_collections && caps.collections;
    let wire_key = if !spec.key.is_empty() && use_cid {
        key_with_collection_id(spec.cid.unwrap_or(0), &spec.key)
    } else {
        spec.key.clone()
    };
    let vbucket = spec.vbucket.unwrap_or(0);

    match &spec.kind {
        RequestKind::Get { touch, lock } => {
            let (op, extra) = match (lock, touch) {
                (Some(lock_time), _) => (opcode::GET_LOCKED, Some(*lock_time)),
                (None, Some(expiry)) => (opcode::GET_AND_TOUCH, Some(*expiry)),
                (None, None) => (opcode::GET, None),
            };
            let mut pkt = RequestPacket::new(op);
            pkt.vbucket = vbucket;
            pkt.key = wire_key;
            if let Some(extra) = extra {
                let mut extras = BytesMut::with_capacity(4);
                extras.put_u32(extra);
                pkt.extras = extras.freeze();
            }
            pkt
        }
        RequestKind::Store {
            operation,
            value,
            flags,
            expiry,
            json,
            precompressed,
            sync,
        } => {
            let (op, has_extras) = match operation {
                StoreOperation::Upsert => (opcode::SET, true),
                StoreOperation::Insert => (opcode::ADD, true),
                StoreOperation::Replace => (opcode::REPLACE, true),
                StoreOperation::Append => (opcode::APPEND, false),
                StoreOperation::Prepend => (opcode::PREPEND, false),
            };
            let mut pkt = RequestPacket::new(op);
            pkt.vbucket = vbucket;
            pkt.cas = spec.cas;
            pkt.key = wire_key;
            if has_extras {
                let mut extras = BytesMut::with_capacity(8);
                extras.put_u32(*flags);
                extras.put_u32(*expiry);
                pkt.extras = extras.freeze();
            }
            let mut datatype = 0u8;
            let mut out_value = value.clone();
            if *precompressed {
                datatype |= DATATYPE_SNAPPY;
            } else if settings.compression.outbound
                && (caps.snappy || settings.compression.force)
            {
                match snap::raw::Encoder::new().compress_vec(value) {
                    Ok(compressed) if compressed.len() < value.len() => {
                        out_value = Bytes::from(compressed);
                        datatype |= DATATYPE_SNAPPY;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, "snappy compression failed; sending raw value");
                    }
                }
            }
            if *json && caps.json {
                datatype |= DATATYPE_JSON;
            }
            pkt.datatype = datatype;
            pkt.value = out_value;
            if let Some((level, timeout_ms)) = sync {
                pkt.frame_extras = sync_frame_extras(*level, *timeout_ms);
            }
            pkt
        }
        RequestKind::Remove { sync } => {
            let mut pkt = RequestPacket::new(opcode::DELETE);
            pkt.vbucket = vbucket;
            pkt.cas = spec.cas;
            pkt.key = wire_key;
            if let Some((level, timeout_ms)) = sync {
                pkt.frame_extras = sync_frame_extras(*level, *timeout_ms);
            }
            pkt
        }
        RequestKind::ReplicaGet => {
            let mut pkt = RequestPacket::new(opcode::GET_REPLICA);
            pkt.vbucket = vbucket;
            pkt.key = wire_key;
            pkt
        }
        RequestKind::Observe { entries } => {
            let mut pkt = RequestPacket::new(opcode::OBSERVE);
            pkt.value = entries.clone();
            pkt
        }
        RequestKind::ObserveSeqno { vbuuid } => {
            let mut pkt = RequestPacket::new(opcode::OBSERVE_SEQNO);
            pkt.vbucket = vbucket;
            let mut value = BytesMut::with_capacity(8);
            value.put_u64(*vbuuid);
            pkt.value = value.freeze();
            pkt
        }
        RequestKind::GetCollectionId { path } => {
            let mut pkt = RequestPacket::new(opcode::GET_COLLECTION_ID);
            pkt.value = path.clone();
            pkt
        }
    }
}
