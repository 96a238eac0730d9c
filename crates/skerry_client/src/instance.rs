//! Instance core: the single owner of all scheduling state.
//!
//! One task per instance holds the cluster map, command queue, collection
//! cache, durability polls, and the retry timer queue; every mutation
//! happens on that task. The public `Instance` handle validates commands
//! synchronously, then submits them over a channel; results come back on
//! oneshot or stream channels. Pipelines run as their own tasks and talk
//! back to the core for anything that needs routing state.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use serde_json::json;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time;
use tracing::{debug, warn};

use crate::cluster_map::{ClusterMap, ClusterMapConfig};
use crate::collections::CollectionCache;
use crate::config::Settings;
use crate::durability::{self, DurabilityEngine, ObserveKeyState, PollSink, PollStart};
use crate::error::{Error, Result};
use crate::ops::{
    self, CollectionQualifier, Durability, DurabilityLevel, DurabilityOptions, EndureItem,
    EndureResponse, GetCommand, GetResponse, ObserveCommand, RemoveCommand, RemoveResponse,
    ReplicaGetCommand, ReplicaRead, ReplicaStrategy, StoreCommand, StoreResponse,
};
use crate::protocol;
use crate::queue::CommandQueue;
use crate::request::{
    self, CommandSpec, KvResponse, ObserveOutcome, Processor, ReplicaFanout, RequestCtx,
    RequestKind, Responder, RetryReason,
};

/// One server's view of a key, emitted by an observe context.
#[derive(Debug, Clone)]
pub struct ObserveEvent {
    pub key: Bytes,
    pub server: usize,
    pub is_master: bool,
    pub state: ObserveKeyState,
    pub cas: u64,
}

/// Messages handled by the core task.
pub(crate) enum CoreMsg {
    Submit(Vec<RequestCtx>),
    PublishMap(Arc<ClusterMap>, oneshot::Sender<()>),
    Requeue {
        ctx: RequestCtx,
        reason: RetryReason,
    },
    ReplicaNext {
        ctx: RequestCtx,
        error: Error,
    },
    CidResolved {
        qualifier: CollectionQualifier,
        result: Result<(u64, u32)>,
    },
    StartPoll(Box<PollStart>),
    PollObserve {
        poll_id: u64,
        outcome: ObserveOutcome,
    },
    Diagnostics(oneshot::Sender<serde_json::Value>),
    Shutdown,
}

/// Handle to one client instance.
///
/// Dropping the handle shuts the instance down; outstanding commands fail
/// with `REQUEST_CANCELED`.
pub struct Instance {
    core: mpsc::UnboundedSender<CoreMsg>,
    settings: Arc<Settings>,
    map: Arc<RwLock<Option<Arc<ClusterMap>>>>,
    refresh: watch::Receiver<u64>,
}

impl Instance {
    /// Create an instance and spawn its core task.
    pub fn new(settings: Settings) -> Instance {
        let settings = Arc::new(settings);
        let (tx, rx) = mpsc::unbounded_channel();
        let shared_map = Arc::new(RwLock::new(None));
        let (refresh_tx, refresh_rx) = watch::channel(0u64);
        let core = Core {
            settings: settings.clone(),
            rx,
            tx: tx.clone(),
            queue: CommandQueue::new(settings.clone(), tx.clone()),
            shared_map: shared_map.clone(),
            refresh: refresh_tx,
            collections: CollectionCache::default(),
            durability: DurabilityEngine::default(),
            retries: Vec::new(),
        };
        tokio::spawn(core.run());
        Instance {
            core: tx,
            settings,
            map: shared_map,
            refresh: refresh_rx,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Compile and publish a cluster map document.
    ///
    /// Resolves once the core has swapped the map in; commands submitted
    /// afterwards route against it.
    pub async fn publish_map(&self, config: &ClusterMapConfig) -> Result<()> {
        let map = ClusterMap::compile(config)?;
        let (tx, rx) = oneshot::channel();
        self.core
            .send(CoreMsg::PublishMap(map, tx))
            .map_err(|_| Error::RequestCanceled)?;
        rx.await.map_err(|_| Error::RequestCanceled)
    }

    /// Watch channel bumped every time a command hit NOT_MY_VBUCKET.
    ///
    /// The bootstrap layer observes this to fetch a fresh map.
    pub fn map_refresh_requests(&self) -> watch::Receiver<u64> {
        self.refresh.clone()
    }

    fn current_map(&self) -> Option<Arc<ClusterMap>> {
        self.map.read().ok().and_then(|guard| guard.clone())
    }

    fn initial_cid(&self, collection: &CollectionQualifier) -> Option<u32> {
        if !self.settings.use_collections || collection.is_default() {
            Some(0)
        } else {
            None
        }
    }

    fn submit(&self, ctxs: Vec<RequestCtx>) -> Result<()> {
        self.core
            .send(CoreMsg::Submit(ctxs))
            .map_err(|_| Error::ScheduleFailure)
    }

    async fn submit_unary(
        &self,
        ctx: RequestCtx,
        rx: oneshot::Receiver<Result<KvResponse>>,
    ) -> Result<KvResponse> {
        self.submit(vec![ctx])?;
        rx.await.map_err(|_| Error::RequestCanceled)?
    }

    /// Fetch a document; `expiry`/`lock` select get-and-touch or
    /// get-and-lock.
    pub async fn get(&self, cmd: GetCommand) -> Result<GetResponse> {
        ops::validate_get(&cmd)?;
        ops::validate_collection(&cmd.collection, self.settings.use_collections)?;
        let start = Instant::now();
        let deadline = self.settings.deadline(start, cmd.timeout);
        let mut spec = CommandSpec::new(
            RequestKind::Get {
                touch: cmd.touch,
                lock: cmd.lock,
            },
            cmd.key,
            start,
            deadline,
        );
        spec.collection = cmd.collection;
        spec.cid = self.initial_cid(&spec.collection);
        let (tx, rx) = oneshot::channel();
        let ctx = RequestCtx::new(spec, Responder::Kv(tx), Processor::Default);
        match self.submit_unary(ctx, rx).await? {
            KvResponse::Get(resp) => Ok(resp),
            other => unexpected(other),
        }
    }

    /// Execute a mutation from the store family.
    pub async fn store(&self, cmd: StoreCommand) -> Result<StoreResponse> {
        ops::validate_store(&cmd)?;
        ops::validate_collection(&cmd.collection, self.settings.use_collections)?;
        let start = Instant::now();
        let deadline = self.settings.deadline(start, cmd.timeout);

        let mut sync = None;
        let mut processor = Processor::Default;
        match cmd.durability {
            Durability::None => {}
            Durability::Sync(level) => {
                let map = self.current_map().ok_or(Error::NoConfiguration)?;
                if map
                    .servers()
                    .iter()
                    .any(|slot| slot.capabilities.sync_replication)
                {
                    sync = Some((level, sync_timeout_ms(start, deadline)));
                } else {
                    // Old topology: emulate the level with observe polling.
                    let (persist_to, replicate_to) =
                        level_as_poll(level, map.n_replicas(), map.n_servers())?;
                    processor = Processor::DurableStore {
                        persist_to,
                        replicate_to,
                        seqno: false,
                    };
                }
            }
            Durability::Poll {
                persist_to,
                replicate_to,
            } => {
                let map = self.current_map().ok_or(Error::NoConfiguration)?;
                let cap_max = persist_to < 0 || replicate_to < 0;
                let (persist_to, replicate_to) = durability::validate(
                    persist_to,
                    replicate_to,
                    cap_max,
                    map.n_replicas(),
                    map.n_servers(),
                )?;
                processor = Processor::DurableStore {
                    persist_to,
                    replicate_to,
                    seqno: false,
                };
            }
        }

        let mut spec = CommandSpec::new(
            RequestKind::Store {
                operation: cmd.operation,
                value: cmd.value,
                flags: cmd.flags,
                expiry: cmd.expiry,
                json: cmd.json,
                precompressed: cmd.precompressed,
                sync,
            },
            cmd.key,
            start,
            deadline,
        );
        spec.collection = cmd.collection;
        spec.cid = self.initial_cid(&spec.collection);
        spec.cas = cmd.cas;
        let (tx, rx) = oneshot::channel();
        let ctx = RequestCtx::new(spec, Responder::Kv(tx), processor);
        match self.submit_unary(ctx, rx).await? {
            KvResponse::Store {
                cas,
                token,
                durability,
            } => Ok(StoreResponse {
                cas,
                mutation_token: token,
                durability,
            }),
            other => unexpected(other),
        }
    }

    /// Remove a document.
    pub async fn remove(&self, cmd: RemoveCommand) -> Result<RemoveResponse> {
        ops::validate_key(&cmd.key)?;
        ops::validate_collection(&cmd.collection, self.settings.use_collections)?;
        let start = Instant::now();
        let deadline = self.settings.deadline(start, cmd.timeout);
        let sync = match cmd.durability_level {
            Some(level) => {
                let map = self.current_map().ok_or(Error::NoConfiguration)?;
                if !map
                    .servers()
                    .iter()
                    .any(|slot| slot.capabilities.sync_replication)
                {
                    return Err(Error::FeatureUnavailable(
                        "synchronous replication is not supported by the cluster",
                    ));
                }
                Some((level, sync_timeout_ms(start, deadline)))
            }
            None => None,
        };
        let mut spec = CommandSpec::new(RequestKind::Remove { sync }, cmd.key, start, deadline);
        spec.collection = cmd.collection;
        spec.cid = self.initial_cid(&spec.collection);
        spec.cas = cmd.cas;
        let (tx, rx) = oneshot::channel();
        let ctx = RequestCtx::new(spec, Responder::Kv(tx), Processor::Default);
        match self.submit_unary(ctx, rx).await? {
            KvResponse::Remove { cas, token } => Ok(RemoveResponse {
                cas,
                mutation_token: token,
            }),
            other => unexpected(other),
        }
    }

    /// Read from replicas. Responses stream out with `is_final` marking the
    /// last one; validation failures are returned before anything is sent.
    pub fn replica_get(
        &self,
        cmd: ReplicaGetCommand,
    ) -> Result<mpsc::UnboundedReceiver<ReplicaRead>> {
        ops::validate_key(&cmd.key)?;
        ops::validate_collection(&cmd.collection, self.settings.use_collections)?;
        let map = self.current_map().ok_or(Error::NoConfiguration)?;
        if map.n_replicas() == 0 {
            return Err(Error::NoMatchingServer);
        }
        let (vbucket, _) = map.map_key(&cmd.key);

        // Resolve the target set up front so the fan-out state is only
        // allocated when every required replica is online.
        let mut first_replica = 0u16;
        let targets: Vec<usize> = match cmd.strategy {
            ReplicaStrategy::Select(index) => {
                vec![map.replica(vbucket, index).ok_or(Error::NoMatchingServer)?]
            }
            ReplicaStrategy::All => (0..map.n_replicas())
                .map(|index| map.replica(vbucket, index).ok_or(Error::NoMatchingServer))
                .collect::<Result<_>>()?,
            ReplicaStrategy::First => {
                let found = (0..map.n_replicas())
                    .find_map(|index| map.replica(vbucket, index).map(|server| (index, server)));
                let (index, server) = found.ok_or(Error::NoMatchingServer)?;
                first_replica = index;
                vec![server]
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let fanout = Arc::new(ReplicaFanout {
            strategy: cmd.strategy,
            vbucket,
            tx,
            remaining: Mutex::new(targets.len() as u16),
            cursor: Mutex::new(first_replica),
        });
        let start = Instant::now();
        let deadline = self.settings.deadline(start, cmd.timeout);
        let mut ctxs = Vec::with_capacity(targets.len());
        for server in targets {
            let mut spec =
                CommandSpec::new(RequestKind::ReplicaGet, cmd.key.clone(), start, deadline);
            spec.collection = cmd.collection.clone();
            spec.cid = self.initial_cid(&spec.collection);
            spec.vbucket = Some(vbucket);
            spec.server = Some(server);
            ctxs.push(RequestCtx::new(
                spec,
                Responder::None,
                Processor::ReplicaRead(fanout.clone()),
            ));
        }
        self.submit(ctxs)?;
        Ok(rx)
    }

    /// Observe keys across their master and replicas. The stream yields one
    /// event per `(key, server)` response and closes when every server has
    /// answered.
    pub fn observe(
        &self,
        cmd: ObserveCommand,
    ) -> Result<mpsc::UnboundedReceiver<Result<ObserveEvent>>> {
        if cmd.keys.is_empty() {
            return Err(Error::InvalidArgument("observe requires at least one key"));
        }
        for key in &cmd.keys {
            ops::validate_key(key)?;
        }
        ops::validate_collection(&cmd.collection, self.settings.use_collections)?;
        let map = self.current_map().ok_or(Error::NoConfiguration)?;
        let cid = self.initial_cid(&cmd.collection).unwrap_or(0);

        // One packet per server, carrying every entry that server hosts.
        let mut per_server: BTreeMap<usize, BytesMut> = BTreeMap::new();
        for key in &cmd.keys {
            let vbucket = map.vbucket_for_key(key);
            let wire_key = if self.settings.use_collections {
                protocol::key_with_collection_id(cid, key)
            } else {
                key.clone()
            };
            let mut servers = Vec::new();
            if let Some(master) = map.master(vbucket) {
                servers.push(master);
            }
            for replica in 0..map.n_replicas() {
                if let Some(server) = map.replica(vbucket, replica) {
                    servers.push(server);
                }
            }
            for server in servers {
                durability::put_observe_entry(
                    per_server.entry(server).or_default(),
                    vbucket,
                    &wire_key,
                );
            }
        }
        if per_server.is_empty() {
            return Err(Error::NoMatchingServer);
        }

        let start = Instant::now();
        let deadline = self.settings.deadline(start, cmd.timeout);
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let expected = per_server.len();
        let mut ctxs = Vec::with_capacity(expected);
        for (server, entries) in per_server {
            let mut spec = CommandSpec::new(
                RequestKind::Observe {
                    entries: entries.freeze(),
                },
                Bytes::new(),
                start,
                deadline,
            );
            spec.collection = cmd.collection.clone();
            spec.cid = Some(cid);
            spec.server = Some(server);
            ctxs.push(RequestCtx::new(
                spec,
                Responder::None,
                Processor::Observe {
                    sink: request::ObserveSink::Task(outcome_tx.clone()),
                    is_master: false,
                },
            ));
        }
        tokio::spawn(observe_aggregator(
            map,
            self.settings.clone(),
            expected,
            outcome_rx,
            event_tx,
        ));
        self.submit(ctxs)?;
        Ok(event_rx)
    }

    /// Poll until mutations meet the given durability constraints. One
    /// response per item; the stream closes after the last.
    pub fn endure(
        &self,
        items: Vec<EndureItem>,
        options: DurabilityOptions,
    ) -> Result<mpsc::UnboundedReceiver<EndureResponse>> {
        if items.is_empty() {
            return Err(Error::InvalidArgument("endure requires at least one item"));
        }
        ops::validate_collection(&options.collection, self.settings.use_collections)?;
        let map = self.current_map().ok_or(Error::NoConfiguration)?;
        let cap_max = options.cap_max || options.persist_to < 0 || options.replicate_to < 0;
        let (persist_to, replicate_to) = durability::validate(
            options.persist_to,
            options.replicate_to,
            cap_max,
            map.n_replicas(),
            map.n_servers(),
        )?;
        if options.seqno {
            if !self.settings.enable_mutation_tokens {
                return Err(Error::DurabilityNoMutationTokens);
            }
            if items.iter().any(|item| item.mutation_token.is_none()) {
                return Err(Error::DurabilityNoMutationTokens);
            }
        }
        for item in &items {
            ops::validate_key(&item.key)?;
        }

        let now = Instant::now();
        let deadline = self.settings.durability_deadline(now, options.timeout);
        let interval = options.interval.unwrap_or(self.settings.durability_interval);
        let (tx, rx) = mpsc::unbounded_channel();
        for item in items {
            let vbucket = map.vbucket_for_key(&item.key);
            let start = PollStart {
                key: item.key,
                collection: options.collection.clone(),
                cid: 0,
                vbucket,
                cas: item.cas,
                token: item.mutation_token,
                seqno: options.seqno,
                persist_to,
                replicate_to,
                check_removed: item.check_removed,
                deadline: Some(deadline),
                interval: Some(interval),
                sink: PollSink::Endure { tx: tx.clone() },
            };
            self.core
                .send(CoreMsg::StartPoll(Box::new(start)))
                .map_err(|_| Error::ScheduleFailure)?;
        }
        Ok(rx)
    }

    /// JSON report of the instance's routing and pipeline state.
    pub async fn diagnostics(&self) -> Result<serde_json::Value> {
        let (tx, rx) = oneshot::channel();
        self.core
            .send(CoreMsg::Diagnostics(tx))
            .map_err(|_| Error::RequestCanceled)?;
        rx.await.map_err(|_| Error::RequestCanceled)
    }

    /// Stop the core task; outstanding commands fail as canceled.
    pub fn shutdown(&self) {
        let _ = self.core.send(CoreMsg::Shutdown);
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        let _ = self.core.send(CoreMsg::Shutdown);
    }
}

fn unexpected<T>(other: KvResponse) -> Result<T> {
    warn!(?other, "response variant does not match the command");
    Err(Error::Protocol(
        "response variant does not match the command".to_string(),
    ))
}

/// Frame-extras timeout for synchronous replication: most of the remaining
/// budget, in milliseconds.
fn sync_timeout_ms(start: Instant, deadline: Instant) -> u16 {
    let remaining = deadline.saturating_duration_since(start);
    let ms = remaining.as_millis() * 9 / 10;
    ms.clamp(1, u128::from(u16::MAX)) as u16
}

/// Observe-poll equivalent of a sync-replication level, for clusters that
/// do not speak it.
fn level_as_poll(
    level: DurabilityLevel,
    n_replicas: u16,
    n_servers: usize,
) -> Result<(u16, u16)> {
    let copies = u32::from(n_replicas) + 1;
    let majority = (copies / 2 + 1) as i16;
    let (persist_to, replicate_to) = match level {
        DurabilityLevel::Majority | DurabilityLevel::MajorityAndPersistActive => (1, majority - 1),
        DurabilityLevel::PersistToMajority => (majority, majority - 1),
    };
    durability::validate(persist_to, replicate_to, true, n_replicas, n_servers)
}

/// Convert raw observe outcomes into user events, closing the stream when
/// every server has answered.
async fn observe_aggregator(
    map: Arc<ClusterMap>,
    settings: Arc<Settings>,
    expected: usize,
    mut outcomes: mpsc::UnboundedReceiver<ObserveOutcome>,
    events: mpsc::UnboundedSender<Result<ObserveEvent>>,
) {
    let mut received = 0usize;
    while received < expected {
        let Some(outcome) = outcomes.recv().await else {
            break;
        };
        received += 1;
        match outcome.result {
            Ok(resp) => match durability::decode_observe_value(&resp.value) {
                Ok(entries) => {
                    for entry in entries {
                        let key = if settings.use_collections {
                            match protocol::split_collection_id(&entry.key) {
                                Some((_, rest)) => Bytes::copy_from_slice(rest),
                                None => entry.key.clone(),
                            }
                        } else {
                            entry.key.clone()
                        };
                        let is_master = map.master(entry.vbucket) == Some(outcome.server);
                        let _ = events.send(Ok(ObserveEvent {
                            key,
                            server: outcome.server,
                            is_master,
                            state: ObserveKeyState::from_u8(entry.state),
                            cas: entry.cas,
                        }));
                    }
                }
                Err(err) => {
                    let _ = events.send(Err(err));
                }
            },
            Err(err) => {
                let _ = events.send(Err(err));
            }
        }
    }
}

struct RetryEntry {
    due: Instant,
    reason: RetryReason,
    ctx: RequestCtx,
}

struct Core {
    settings: Arc<Settings>,
    rx: mpsc::UnboundedReceiver<CoreMsg>,
    tx: mpsc::UnboundedSender<CoreMsg>,
    queue: CommandQueue,
    shared_map: Arc<RwLock<Option<Arc<ClusterMap>>>>,
    refresh: watch::Sender<u64>,
    collections: CollectionCache,
    durability: DurabilityEngine,
    retries: Vec<RetryEntry>,
}

impl Core {
    async fn run(mut self) {
        loop {
            let wake = self.next_wakeup();
            tokio::select! {
                msg = self.rx.recv() => {
                    match msg {
                        Some(CoreMsg::Shutdown) | None => break,
                        Some(msg) => self.handle(msg),
                    }
                }
                _ = sleep_until_opt(wake), if wake.is_some() => {
                    self.on_tick();
                }
            }
        }
        self.shutdown();
    }

    fn next_wakeup(&self) -> Option<Instant> {
        let retry = self.retries.iter().map(|entry| entry.due).min();
        let poll = self.durability.next_wakeup();
        match (retry, poll) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn handle(&mut self, msg: CoreMsg) {
        match msg {
            CoreMsg::Submit(ctxs) => {
                self.queue.sched_enter();
                for ctx in ctxs {
                    self.admit(ctx);
                }
                self.queue.sched_leave();
            }
            CoreMsg::PublishMap(map, done) => {
                self.publish(map);
                let _ = done.send(());
            }
            CoreMsg::Requeue { ctx, reason } => self.requeue(ctx, reason),
            CoreMsg::ReplicaNext { ctx, error } => self.replica_next(ctx, error),
            CoreMsg::CidResolved { qualifier, result } => {
                let (resolved, waiters) = self.collections.complete(&qualifier, &result);
                debug!(
                    scope_collection = %qualifier.path(),
                    outcome = ?resolved,
                    waiters = waiters.len(),
                    "collection id resolved"
                );
                self.queue.sched_enter();
                for mut waiter in waiters {
                    match &resolved {
                        Ok(cid) => {
                            waiter.spec.cid = Some(*cid);
                            self.admit(waiter);
                        }
                        Err(err) => request::deliver(waiter, Err(err.clone()), &self.tx),
                    }
                }
                self.queue.sched_leave();
            }
            CoreMsg::StartPoll(mut start) => {
                if self.settings.use_collections && !start.collection.is_default() {
                    match self.collections.lookup(&start.collection) {
                        Some(cid) => start.cid = cid,
                        None => warn!(
                            scope_collection = %start.collection.path(),
                            "durability poll on unresolved collection; using id 0"
                        ),
                    }
                }
                let now = Instant::now();
                let deadline = start
                    .deadline
                    .unwrap_or_else(|| self.settings.durability_deadline(now, None));
                let interval = start.interval.unwrap_or(self.settings.durability_interval);
                self.durability.start(
                    *start,
                    deadline,
                    interval,
                    &mut self.queue,
                    &self.tx,
                    &self.settings,
                );
            }
            CoreMsg::PollObserve { poll_id, outcome } => {
                self.durability.on_outcome(poll_id, outcome);
            }
            CoreMsg::Diagnostics(tx) => {
                let _ = tx.send(self.diagnostics());
            }
            CoreMsg::Shutdown => unreachable!("shutdown handled by the run loop"),
        }
    }

    /// Admit one command: resolve its collection if needed, then dispatch.
    fn admit(&mut self, mut ctx: RequestCtx) {
        let now = Instant::now();
        if ctx.spec.expired(now) {
            request::deliver(ctx, Err(Error::Timeout), &self.tx);
            return;
        }
        if self.settings.use_collections && ctx.spec.cid.is_none() {
            match self.collections.lookup(&ctx.spec.collection) {
                Some(cid) => ctx.spec.cid = Some(cid),
                None => {
                    let qualifier = ctx.spec.collection.clone();
                    let deadline = ctx.spec.deadline;
                    if self.collections.park(qualifier.clone(), ctx) {
                        self.issue_cid_lookup(qualifier, deadline);
                    }
                    return;
                }
            }
        }
        self.queue.dispatch(ctx);
    }

    fn issue_cid_lookup(&mut self, qualifier: CollectionQualifier, deadline: Instant) {
        debug!(scope_collection = %qualifier.path(), "resolving collection id");
        let mut spec = CommandSpec::new(
            RequestKind::GetCollectionId {
                path: Bytes::from(qualifier.path()),
            },
            Bytes::new(),
            Instant::now(),
            deadline,
        );
        spec.collection = qualifier;
        spec.cid = Some(0);
        let ctx = RequestCtx::new(spec, Responder::None, Processor::CollectionId);
        self.queue.dispatch(ctx);
    }

    fn publish(&mut self, map: Arc<ClusterMap>) {
        if !map
            .servers()
            .iter()
            .any(|slot| slot.capabilities.collections)
        {
            // The bucket may have been rebuilt without collections; cached
            // ids are no longer trustworthy.
            self.collections.invalidate();
        }
        self.queue.publish(map.clone());
        if let Ok(mut guard) = self.shared_map.write() {
            *guard = Some(map);
        }
        // Commands parked on NOT_MY_VBUCKET route against the new map now.
        let now = Instant::now();
        self.flush_retries(now, true);
    }

    fn requeue(&mut self, ctx: RequestCtx, reason: RetryReason) {
        let now = Instant::now();
        match reason {
            RetryReason::Reroute => {
                if ctx.spec.attempt >= 3 {
                    // Repeated re-routes mean the target is unreachable, not
                    // merely moved; pace the attempts.
                    self.retries.push(RetryEntry {
                        due: now + self.settings.retry_interval,
                        reason,
                        ctx,
                    });
                    return;
                }
                // The pipeline drained; route against whatever map is
                // current.
                let mut ctx = ctx;
                ctx.spec.server = None;
                self.queue.sched_enter();
                self.queue.dispatch(ctx);
                self.queue.sched_leave();
            }
            RetryReason::NotMyVbucket => {
                self.refresh.send_modify(|count| *count += 1);
                self.retries.push(RetryEntry {
                    due: now + self.settings.retry_interval,
                    reason,
                    ctx,
                });
            }
            RetryReason::Backoff => {
                self.retries.push(RetryEntry {
                    due: now + self.settings.retry_interval,
                    reason,
                    ctx,
                });
            }
        }
    }

    /// Advance a FIRST-strategy replica read to the next online replica.
    fn replica_next(&mut self, mut ctx: RequestCtx, error: Error) {
        let Processor::ReplicaRead(fanout) = &ctx.processor else {
            return;
        };
        let now = Instant::now();
        let final_error = if ctx.spec.expired(now) {
            Some(Error::Timeout)
        } else {
            None
        };
        let next = if final_error.is_none() {
            self.queue.map().and_then(|map| {
                let mut cursor = fanout.cursor.lock().expect("fanout cursor poisoned");
                loop {
                    *cursor += 1;
                    if *cursor >= map.n_replicas() {
                        return None;
                    }
                    if let Some(server) = map.replica(fanout.vbucket, *cursor) {
                        return Some(server);
                    }
                }
            })
        } else {
            None
        };
        match next {
            Some(server) => {
                ctx.spec.server = Some(server);
                self.queue.sched_enter();
                self.queue.dispatch(ctx);
                self.queue.sched_leave();
            }
            None => {
                let _ = fanout.tx.send(ReplicaRead {
                    result: Err(final_error.unwrap_or(error)),
                    is_final: true,
                });
            }
        }
    }

    fn on_tick(&mut self) {
        let now = Instant::now();
        self.flush_retries(now, false);
        self.durability
            .tick(now, &mut self.queue, &self.tx, &self.settings);
    }

    /// Re-dispatch retry entries that are due, or all map-waiters after a
    /// publish.
    fn flush_retries(&mut self, now: Instant, map_published: bool) {
        if self.retries.is_empty() {
            return;
        }
        let entries = std::mem::take(&mut self.retries);
        self.queue.sched_enter();
        for entry in entries {
            let fire = now >= entry.due
                || (map_published && entry.reason == RetryReason::NotMyVbucket);
            if !fire {
                self.retries.push(entry);
                continue;
            }
            let mut ctx = entry.ctx;
            if ctx.spec.expired(now) {
                request::deliver(ctx, Err(Error::Timeout), &self.tx);
                continue;
            }
            match entry.reason {
                RetryReason::NotMyVbucket => {
                    let map_rev = self.queue.map().map(|map| map.rev()).unwrap_or(0);
                    if map_rev == ctx.spec.dispatched_rev && !self.settings.vb_noguess {
                        // Same map as the failed attempt: probe the next
                        // server instead of hammering the one that refused
                        // us.
                        if let (Some(last), n @ 1..) =
                            (ctx.spec.last_server, self.queue.pipelines().len())
                        {
                            ctx.spec.server = Some((last + 1) % n);
                        }
                    } else {
                        ctx.spec.server = None;
                    }
                }
                RetryReason::Reroute => ctx.spec.server = None,
                RetryReason::Backoff => {}
            }
            self.queue.dispatch(ctx);
        }
        self.queue.sched_leave();
    }

    fn diagnostics(&self) -> serde_json::Value {
        let pipelines: Vec<serde_json::Value> = self
            .queue
            .pipelines()
            .iter()
            .enumerate()
            .map(|(index, pipeline)| {
                json!({
                    "index": index,
                    "address": pipeline.address.to_string(),
                    "state": pipeline.stats.state().name(),
                    "pending": pipeline.stats.pending(),
                    "idle_since_ms": pipeline.stats.idle_since_ms(),
                    "dispatched": pipeline.stats.dispatched(),
                    "completed": pipeline.stats.completed(),
                })
            })
            .collect();
        json!({
            "map": self.queue.map().map(|map| json!({
                "rev": map.rev(),
                "vbuckets": map.n_vbuckets(),
                "replicas": map.n_replicas(),
                "servers": map.n_servers(),
            })),
            "pipelines": pipelines,
            "durability_polls": self.durability.len(),
            "pending_retries": self.retries.len(),
            "collections": {
                "cached": self.collections.cached(),
                "pending_lookups": self.collections.pending_lookups(),
            },
        })
    }

    fn shutdown(&mut self) {
        debug!("instance core shutting down");
        self.queue.close_all();
        self.durability.abort_all(Error::RequestCanceled);
        for entry in std::mem::take(&mut self.retries) {
            request::deliver(entry.ctx, Err(Error::RequestCanceled), &self.tx);
        }
        for ctx in self.collections.drain_waiters() {
            request::deliver(ctx, Err(Error::RequestCanceled), &self.tx);
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}
