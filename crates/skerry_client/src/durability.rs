//! Observe-based durability polling.
//!
//! A poll repeatedly issues observe (or observe-seqno) packets across the
//! master and the online replicas of a key's vbucket until the persistence
//! and replication constraints are met, a conflicting mutation is observed,
//! or the deadline expires. Store commands with poll durability chain into
//! this engine after their acknowledgment; the endure context drives it
//! directly.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::ops::{CollectionQualifier, EndureResponse, MutationToken, ObserveReport};
use crate::queue::CommandQueue;
use crate::request::{
    CommandSpec, KvResponse, ObserveOutcome, ObserveSink, Processor, RequestCtx, RequestKind,
    Responder,
};

/// Observed key not yet persisted on the responding server.
pub(crate) const OBS_FOUND: u8 = 0x00;
/// Observed key persisted on the responding server.
pub(crate) const OBS_PERSISTED: u8 = 0x01;
/// Key unknown to the responding server.
pub(crate) const OBS_NOT_FOUND: u8 = 0x80;
/// Key deleted but the tombstone not yet purged.
pub(crate) const OBS_REMOVED: u8 = 0x81;

/// Per-server observe state for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserveKeyState {
    Found,
    Persisted,
    NotFound,
    Removed,
    Unknown(u8),
}

impl ObserveKeyState {
    pub(crate) fn from_u8(raw: u8) -> ObserveKeyState {
        match raw {
            OBS_FOUND => ObserveKeyState::Found,
            OBS_PERSISTED => ObserveKeyState::Persisted,
            OBS_NOT_FOUND => ObserveKeyState::NotFound,
            OBS_REMOVED => ObserveKeyState::Removed,
            other => ObserveKeyState::Unknown(other),
        }
    }
}

/// Append one `(vbucket, key)` entry to an observe request body.
pub(crate) fn put_observe_entry(dst: &mut BytesMut, vbucket: u16, wire_key: &[u8]) {
    dst.put_u16(vbucket);
    dst.put_u16(wire_key.len() as u16);
    dst.extend_from_slice(wire_key);
}

/// One entry of an observe response body.
#[derive(Debug, Clone)]
pub(crate) struct ObserveEntryResp {
    pub vbucket: u16,
    pub key: Bytes,
    pub state: u8,
    pub cas: u64,
}

/// Parse an observe response body into its entries.
pub(crate) fn decode_observe_value(value: &[u8]) -> Result<Vec<ObserveEntryResp>> {
    let mut buf = value;
    let mut entries = Vec::new();
    while buf.has_remaining() {
        if buf.remaining() < 4 {
            return Err(Error::Protocol("truncated observe entry".to_string()));
        }
        let vbucket = buf.get_u16();
        let key_len = buf.get_u16() as usize;
        if buf.remaining() < key_len + 9 {
            return Err(Error::Protocol("truncated observe entry".to_string()));
        }
        let key = Bytes::copy_from_slice(&buf[..key_len]);
        buf.advance(key_len);
        let state = buf.get_u8();
        let cas = buf.get_u64();
        entries.push(ObserveEntryResp {
            vbucket,
            key,
            state,
            cas,
        });
    }
    Ok(entries)
}

/// Decoded observe-seqno state for one vbucket on one server.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SeqnoState {
    pub vbucket: u16,
    pub vbuuid: u64,
    pub persisted_seqno: u64,
    pub current_seqno: u64,
}

/// Parse an observe-seqno response body (format 0 or the failover format 1).
pub(crate) fn decode_seqno_value(value: &[u8]) -> Result<SeqnoState> {
    if value.len() < 27 {
        return Err(Error::Protocol("truncated observe-seqno body".to_string()));
    }
    let mut buf = value;
    let _format = buf.get_u8();
    let vbucket = buf.get_u16();
    let vbuuid = buf.get_u64();
    let persisted_seqno = buf.get_u64();
    let current_seqno = buf.get_u64();
    Ok(SeqnoState {
        vbucket,
        vbuuid,
        persisted_seqno,
        current_seqno,
    })
}

/// Validate durability constraints against the current topology.
///
/// A negative constraint or `cap_max` clamps to what the topology offers:
/// `(min(replicas + 1, servers), min(replicas, servers - 1))`. Exceeding the
/// topology without `cap_max` is an error, as is requiring nothing at all.
pub(crate) fn validate(
    persist_to: i16,
    replicate_to: i16,
    cap_max: bool,
    n_replicas: u16,
    n_servers: usize,
) -> Result<(u16, u16)> {
    if persist_to == 0 && replicate_to == 0 {
        return Err(Error::InvalidArgument(
            "durability requires a persist or replicate constraint",
        ));
    }
    let persist_max = (n_replicas as usize + 1).min(n_servers) as i32;
    let replicate_max = (n_replicas as usize).min(n_servers.saturating_sub(1)) as i32;
    let mut persist = persist_to as i32;
    let mut replicate = replicate_to as i32;
    if persist < 0 || replicate < 0 {
        if !cap_max {
            return Err(Error::DurabilityTooMany);
        }
        if persist < 0 {
            persist = persist_max;
        }
        if replicate < 0 {
            replicate = replicate_max;
        }
    }
    if persist > persist_max || replicate > replicate_max {
        if !cap_max {
            return Err(Error::DurabilityTooMany);
        }
        persist = persist.min(persist_max);
        replicate = replicate.min(replicate_max);
    }
    Ok((persist as u16, replicate as u16))
}

/// Where a finished poll reports to.
#[derive(Debug)]
pub(crate) enum PollSink {
    /// Merge into the response of the store that requested durability.
    Store {
        responder: Responder,
        cas: u64,
        token: Option<MutationToken>,
    },
    /// Per-key delivery for an endure context.
    Endure {
        tx: mpsc::UnboundedSender<EndureResponse>,
    },
}

/// Everything needed to begin polling one key.
#[derive(Debug)]
pub(crate) struct PollStart {
    pub key: Bytes,
    pub collection: CollectionQualifier,
    pub cid: u32,
    pub vbucket: u16,
    pub cas: u64,
    pub token: Option<MutationToken>,
    /// Poll by sequence number instead of CAS.
    pub seqno: bool,
    pub persist_to: u16,
    pub replicate_to: u16,
    pub check_removed: bool,
    /// `None` lets the instance defaults apply.
    pub deadline: Option<Instant>,
    pub interval: Option<Duration>,
    pub sink: PollSink,
}

/// Aggregation of one observe round.
#[derive(Debug, Default)]
struct Round {
    expected: usize,
    received: usize,
    responses: u16,
    persisted: u16,
    replicated: u16,
    master_exists: bool,
    master_persisted: bool,
    failure: Option<Error>,
}

#[derive(Debug)]
struct Poll {
    start: PollStart,
    deadline: Instant,
    interval: Duration,
    next_round: Instant,
    round: Option<Round>,
    /// Counters of the most recent completed round, for the final report.
    last: Round,
}

/// All active polls of one instance, driven from the core task.
#[derive(Default)]
pub(crate) struct DurabilityEngine {
    polls: HashMap<u64, Poll>,
    next_id: u64,
}

impl DurabilityEngine {
    pub(crate) fn len(&self) -> usize {
        self.polls.len()
    }

    /// Register a poll and issue its first round immediately.
    pub(crate) fn start(
        &mut self,
        start: PollStart,
        deadline: Instant,
        interval: Duration,
        queue: &mut CommandQueue,
        core: &mpsc::UnboundedSender<crate::instance::CoreMsg>,
        settings: &Settings,
    ) {
        // Seqno polling is impossible without the write's token.
        if start.seqno && start.token.is_none() {
            finish_sink(start.sink, Err(Error::DurabilityNoMutationTokens), &Round::default(), start.key);
            return;
        }
        let id = self.next_id;
        self.next_id += 1;
        let mut poll = Poll {
            start,
            deadline,
            interval,
            next_round: Instant::now(),
            round: None,
            last: Round::default(),
        };
        issue_round(id, &mut poll, queue, core, settings);
        self.polls.insert(id, poll);
    }

    /// Earliest instant the engine needs a tick.
    pub(crate) fn next_wakeup(&self) -> Option<Instant> {
        self.polls
            .values()
            .map(|poll| {
                if poll.round.is_some() {
                    poll.deadline
                } else {
                    poll.next_round.min(poll.deadline)
                }
            })
            .min()
    }

    /// Issue due rounds and expire polls past their deadline.
    pub(crate) fn tick(
        &mut self,
        now: Instant,
        queue: &mut CommandQueue,
        core: &mpsc::UnboundedSender<crate::instance::CoreMsg>,
        settings: &Settings,
    ) {
        let due: Vec<u64> = self
            .polls
            .iter()
            .filter(|(_, poll)| poll.round.is_none() && now >= poll.next_round)
            .map(|(id, _)| *id)
            .collect();
        for id in due {
            let expired = self
                .polls
                .get(&id)
                .is_some_and(|poll| now >= poll.deadline);
            if expired {
                continue;
            }
            if let Some(poll) = self.polls.get_mut(&id) {
                issue_round(id, poll, queue, core, settings);
            }
        }
        // Deadline sweep; also catches rounds that lost every packet.
        let stuck: Vec<u64> = self
            .polls
            .iter()
            .filter(|(_, poll)| now >= poll.deadline)
            .map(|(id, _)| *id)
            .collect();
        for id in stuck {
            if let Some(poll) = self.polls.remove(&id) {
                finish(poll, Err(Error::Timeout));
            }
        }
    }

    /// Fold one server's observe outcome into its round.
    pub(crate) fn on_outcome(&mut self, poll_id: u64, outcome: ObserveOutcome) {
        let Some(poll) = self.polls.get_mut(&poll_id) else {
            return;
        };
        let Some(round) = poll.round.as_mut() else {
            return;
        };
        round.received += 1;
        match outcome.result {
            Ok(resp) => {
                round.responses += 1;
                if poll.start.seqno {
                    match decode_seqno_value(&resp.value) {
                        Ok(state) => fold_seqno(round, &poll.start, outcome.is_master, state),
                        Err(err) => round.failure = Some(err),
                    }
                } else {
                    match decode_observe_value(&resp.value) {
                        Ok(entries) => {
                            for entry in entries {
                                if entry.vbucket == poll.start.vbucket {
                                    fold_cas(round, &poll.start, outcome.is_master, &entry);
                                }
                            }
                        }
                        Err(err) => round.failure = Some(err),
                    }
                }
            }
            Err(err) => {
                debug!(poll_id, error = %err, "observe packet failed during durability poll");
            }
        }
        if round.received < round.expected {
            return;
        }
        // Round complete: evaluate and either finish or schedule the next.
        let round = poll.round.take().expect("round present");
        let verdict = evaluate(&poll.start, &round);
        poll.last = round;
        let now = Instant::now();
        match verdict {
            Some(result) => {
                let poll = self.polls.remove(&poll_id).expect("poll present");
                finish(poll, result);
            }
            None if now >= poll.deadline => {
                let poll = self.polls.remove(&poll_id).expect("poll present");
                finish(poll, Err(Error::Timeout));
            }
            None => {
                poll.next_round = now + poll.interval;
            }
        }
    }

    /// Fail every active poll; used at instance shutdown.
    pub(crate) fn abort_all(&mut self, error: Error) {
        for (_, poll) in self.polls.drain() {
            finish(poll, Err(error.clone()));
        }
    }
}

/// Count one CAS-mode observe entry into the round.
fn fold_cas(round: &mut Round, start: &PollStart, is_master: bool, entry: &ObserveEntryResp) {
    let state = ObserveKeyState::from_u8(entry.state);
    if start.check_removed {
        // Verifying a deletion: tombstones and misses are progress.
        match state {
            ObserveKeyState::NotFound => {
                if !is_master {
                    round.replicated += 1;
                }
            }
            ObserveKeyState::Removed => {
                round.persisted += 1;
                if is_master {
                    round.master_persisted = true;
                } else {
                    round.replicated += 1;
                }
            }
            ObserveKeyState::Found | ObserveKeyState::Persisted => {
                if is_master {
                    round.master_exists = true;
                }
            }
            ObserveKeyState::Unknown(_) => {}
        }
        return;
    }
    match state {
        ObserveKeyState::Found | ObserveKeyState::Persisted => {
            if is_master {
                round.master_exists = true;
                if entry.cas != start.cas {
                    // The document moved on; this mutation can never endure.
                    round.failure = Some(Error::DocumentExists);
                    return;
                }
            } else {
                round.replicated += 1;
            }
            if state == ObserveKeyState::Persisted {
                round.persisted += 1;
                if is_master {
                    round.master_persisted = true;
                }
            }
        }
        ObserveKeyState::NotFound | ObserveKeyState::Removed => {
            if is_master {
                round.failure = Some(Error::DocumentNotFound);
            }
        }
        ObserveKeyState::Unknown(_) => {}
    }
}

/// Count one seqno-mode observation into the round.
fn fold_seqno(round: &mut Round, start: &PollStart, is_master: bool, state: SeqnoState) {
    let token = start.token.expect("seqno polling requires a token");
    if state.vbuuid != token.uuid {
        // Failover happened under us; this server's history diverged.
        return;
    }
    let replicated = state.current_seqno >= token.seqno;
    let persisted = state.persisted_seqno >= token.seqno;
    if is_master {
        round.master_exists = replicated;
        round.master_persisted = persisted;
    } else if replicated {
        round.replicated += 1;
    }
    if persisted {
        round.persisted += 1;
    }
}

/// Decide whether a completed round ends the poll.
fn evaluate(start: &PollStart, round: &Round) -> Option<Result<()>> {
    if let Some(err) = &round.failure {
        return Some(Err(err.clone()));
    }
    let master_ok = if start.check_removed {
        !round.master_exists
    } else {
        round.master_exists
    };
    if master_ok
        && round.persisted >= start.persist_to
        && round.replicated >= start.replicate_to
    {
        return Some(Ok(()));
    }
    None
}

fn report(round: &Round) -> ObserveReport {
    ObserveReport {
        store_ok: true,
        num_responses: round.responses,
        num_persisted: round.persisted,
        num_replicated: round.replicated,
        master_exists: round.master_exists,
        master_persisted: round.master_persisted,
    }
}

fn finish(poll: Poll, result: Result<()>) {
    let key = poll.start.key.clone();
    finish_sink(poll.start.sink, result, &poll.last, key);
}

fn finish_sink(sink: PollSink, result: Result<()>, round: &Round, key: Bytes) {
    match sink {
        PollSink::Store {
            responder,
            cas,
            token,
        } => match result {
            Ok(()) => {
                responder.deliver(Ok(KvResponse::Store {
                    cas,
                    token,
                    durability: Some(report(round)),
                }));
            }
            Err(err) => {
                // One outcome per store: the poll failure is the command's
                // status, with the acknowledged write identified by its CAS.
                responder.deliver(Err(Error::DurabilityFailed {
                    kind: Box::new(err),
                    store_ok: true,
                    cas,
                }));
            }
        },
        PollSink::Endure { tx } => {
            let rep = report(round);
            let _ = tx.send(EndureResponse {
                key,
                result,
                num_responses: rep.num_responses,
                num_persisted: rep.num_persisted,
                num_replicated: rep.num_replicated,
                master_exists: rep.master_exists,
                master_persisted: rep.master_persisted,
            });
        }
    }
}

/// Send one round of observe packets to the master and online replicas.
fn issue_round(
    poll_id: u64,
    poll: &mut Poll,
    queue: &mut CommandQueue,
    core: &mpsc::UnboundedSender<crate::instance::CoreMsg>,
    settings: &Settings,
) {
    let Some(map) = queue.map().cloned() else {
        // No topology; leave the round unset and let the deadline fire.
        poll.next_round = poll.deadline;
        return;
    };
    let vbucket = poll.start.vbucket;
    let mut targets: Vec<(usize, bool)> = Vec::new();
    if let Some(master) = map.master(vbucket) {
        targets.push((master, true));
    }
    for replica in 0..map.n_replicas() {
        if let Some(server) = map.replica(vbucket, replica) {
            targets.push((server, false));
        }
    }
    if targets.is_empty() {
        poll.next_round = poll.deadline;
        return;
    }

    let wire_key = if settings.use_collections {
        crate::protocol::key_with_collection_id(poll.start.cid, &poll.start.key)
    } else {
        poll.start.key.clone()
    };
    let mut round = Round::default();
    round.expected = targets.len();
    poll.round = Some(round);

    queue.sched_enter();
    let now = Instant::now();
    for (server, is_master) in targets {
        let kind = if poll.start.seqno {
            RequestKind::ObserveSeqno {
                vbuuid: poll.start.token.expect("token checked at start").uuid,
            }
        } else {
            let mut body = BytesMut::new();
            put_observe_entry(&mut body, vbucket, &wire_key);
            RequestKind::Observe {
                entries: body.freeze(),
            }
        };
        let mut spec = CommandSpec::new(kind, Bytes::new(), now, poll.deadline);
        spec.collection = poll.start.collection.clone();
        spec.cid = Some(poll.start.cid);
        spec.vbucket = Some(vbucket);
        spec.server = Some(server);
        let ctx = RequestCtx::new(
            spec,
            Responder::None,
            Processor::Observe {
                sink: ObserveSink::Poll {
                    core: core.clone(),
                    poll_id,
                },
                is_master,
            },
        );
        queue.dispatch(ctx);
    }
    queue.sched_leave();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_nothing_to_do() {
        assert_eq!(
            validate(0, 0, false, 2, 3),
            Err(Error::InvalidArgument(
                "durability requires a persist or replicate constraint"
            ))
        );
    }

    #[test]
    fn validate_caps_or_rejects_excess() {
        // 2 replicas, 3 servers: persist cap 3, replicate cap 2.
        assert_eq!(validate(3, 2, false, 2, 3), Ok((3, 2)));
        assert_eq!(validate(10, 0, false, 2, 3), Err(Error::DurabilityTooMany));
        assert_eq!(validate(10, 0, true, 2, 3), Ok((3, 0)));
        assert_eq!(validate(-1, -1, true, 2, 3), Ok((3, 2)));
        assert_eq!(validate(-1, -1, false, 2, 3), Err(Error::DurabilityTooMany));
        // A one-node cluster can only persist to the master.
        assert_eq!(validate(-1, -1, true, 0, 1), Ok((1, 0)));
    }

    #[test]
    fn observe_body_round_trip() {
        let mut body = BytesMut::new();
        put_observe_entry(&mut body, 57, b"doc-1");
        // Response entries append state and cas to the request layout.
        let mut resp = BytesMut::new();
        resp.put_u16(57);
        resp.put_u16(5);
        resp.extend_from_slice(b"doc-1");
        resp.put_u8(OBS_PERSISTED);
        resp.put_u64(0xfeed);
        let entries = decode_observe_value(&resp).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].vbucket, 57);
        assert_eq!(&entries[0].key[..], b"doc-1");
        assert_eq!(entries[0].state, OBS_PERSISTED);
        assert_eq!(entries[0].cas, 0xfeed);
        assert!(decode_observe_value(&resp[..7]).is_err());
    }

    #[test]
    fn seqno_body_decodes() {
        let mut body = BytesMut::new();
        body.put_u8(0);
        body.put_u16(12);
        body.put_u64(0xabc);
        body.put_u64(40);
        body.put_u64(41);
        let state = decode_seqno_value(&body).unwrap();
        assert_eq!(state.vbucket, 12);
        assert_eq!(state.vbuuid, 0xabc);
        assert_eq!(state.persisted_seqno, 40);
        assert_eq!(state.current_seqno, 41);
        assert!(decode_seqno_value(&body[..20]).is_err());
    }

    #[test]
    fn cas_mismatch_on_master_fails_the_poll() {
        let start = PollStart {
            key: Bytes::from_static(b"k"),
            collection: CollectionQualifier::default(),
            cid: 0,
            vbucket: 3,
            cas: 100,
            token: None,
            seqno: false,
            persist_to: 1,
            replicate_to: 0,
            check_removed: false,
            deadline: None,
            interval: None,
            sink: PollSink::Endure {
                tx: mpsc::unbounded_channel().0,
            },
        };
        let mut round = Round::default();
        fold_cas(
            &mut round,
            &start,
            true,
            &ObserveEntryResp {
                vbucket: 3,
                key: Bytes::from_static(b"k"),
                state: OBS_PERSISTED,
                cas: 999,
            },
        );
        assert_eq!(evaluate(&start, &round), Some(Err(Error::DocumentExists)));
    }

    #[test]
    fn persisted_master_satisfies_master_only_poll() {
        let start = PollStart {
            key: Bytes::from_static(b"k"),
            collection: CollectionQualifier::default(),
            cid: 0,
            vbucket: 3,
            cas: 100,
            token: None,
            seqno: false,
            persist_to: 1,
            replicate_to: 0,
            check_removed: false,
            deadline: None,
            interval: None,
            sink: PollSink::Endure {
                tx: mpsc::unbounded_channel().0,
            },
        };
        let mut round = Round::default();
        fold_cas(
            &mut round,
            &start,
            true,
            &ObserveEntryResp {
                vbucket: 3,
                key: Bytes::from_static(b"k"),
                state: OBS_PERSISTED,
                cas: 100,
            },
        );
        assert_eq!(evaluate(&start, &round), Some(Ok(())));
        // A found-but-unpersisted master keeps the poll running.
        let mut pending = Round::default();
        fold_cas(
            &mut pending,
            &start,
            true,
            &ObserveEntryResp {
                vbucket: 3,
                key: Bytes::from_static(b"k"),
                state: OBS_FOUND,
                cas: 100,
            },
        );
        assert_eq!(evaluate(&start, &pending), None);
    }
}
