//! Per-server send pipeline.
//!
//! One task per data node owns the connection and the pending map. Packets
//! queue in a fallback buffer until the connection exists, are written in
//! enqueue order with coalesced flushes, and are correlated to responses by
//! opaque. A single timer per pipeline expires past-deadline packets.
//!
//! Connection state machine: Disconnected → Connecting → Connected →
//! Draining → Closed. A protocol violation (unknown opaque, malformed frame)
//! closes the connection and fails every pending packet with a network
//! error; an orderly drain re-routes retryable packets through the core.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::error::Error;
use crate::instance::CoreMsg;
use crate::protocol::{ClientCodec, RequestPacket};
use crate::request::{self, RequestCtx};

/// Connection state, mirrored into the stats block for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum PipelineState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Draining = 3,
    Closed = 4,
}

impl PipelineState {
    pub(crate) fn name(self) -> &'static str {
        match self {
            PipelineState::Disconnected => "disconnected",
            PipelineState::Connecting => "connecting",
            PipelineState::Connected => "connected",
            PipelineState::Draining => "draining",
            PipelineState::Closed => "closed",
        }
    }

    fn from_u8(raw: u8) -> PipelineState {
        match raw {
            1 => PipelineState::Connecting,
            2 => PipelineState::Connected,
            3 => PipelineState::Draining,
            4 => PipelineState::Closed,
            _ => PipelineState::Disconnected,
        }
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .min(u128::from(u64::MAX)) as u64
}

/// Shared counters read by the diagnostics dump.
#[derive(Debug, Default)]
pub(crate) struct PipelineStats {
    state: AtomicU8,
    pending: AtomicUsize,
    idle_since_ms: AtomicU64,
    dispatched: AtomicU64,
    completed: AtomicU64,
}

impl PipelineStats {
    pub(crate) fn state(&self) -> PipelineState {
        PipelineState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    /// Epoch milliseconds of the moment the pipeline last became idle.
    pub(crate) fn idle_since_ms(&self) -> u64 {
        self.idle_since_ms.load(Ordering::Relaxed)
    }

    pub(crate) fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    pub(crate) fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    fn set_state(&self, state: PipelineState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }
}

/// Work accepted by a pipeline task.
pub(crate) enum PipelineMsg {
    Dispatch {
        packet: RequestPacket,
        ctx: RequestCtx,
    },
    /// Topology change: re-route retryable packets, fail the rest, stop.
    Drain,
    /// Instance shutdown: fail everything as canceled, stop.
    Close,
}

/// Cheap handle held by the command queue.
#[derive(Clone)]
pub(crate) struct PipelineHandle {
    pub address: SocketAddr,
    pub stats: Arc<PipelineStats>,
    tx: mpsc::UnboundedSender<PipelineMsg>,
}

impl PipelineHandle {
    /// Spawn the pipeline task for one server slot.
    pub(crate) fn spawn(
        index: usize,
        address: SocketAddr,
        core: mpsc::UnboundedSender<CoreMsg>,
        settings: Arc<Settings>,
    ) -> PipelineHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(PipelineStats::default());
        stats.idle_since_ms.store(epoch_millis(), Ordering::Relaxed);
        let task = PipelineTask {
            index,
            address,
            settings,
            core,
            rx,
            stats: stats.clone(),
            pending: HashMap::new(),
            fallback: VecDeque::new(),
            next_opaque: 0,
        };
        tokio::spawn(task.run());
        PipelineHandle { address, stats, tx }
    }

    /// Hand a packet to the pipeline; returns the context on a dead pipeline.
    pub(crate) fn dispatch(
        &self,
        packet: RequestPacket,
        ctx: RequestCtx,
    ) -> std::result::Result<(), RequestCtx> {
        self.tx
            .send(PipelineMsg::Dispatch { packet, ctx })
            .map_err(|err| match err.0 {
                PipelineMsg::Dispatch { ctx, .. } => ctx,
                _ => unreachable!("send returns the message it was given"),
            })
    }

    pub(crate) fn drain(&self) {
        let _ = self.tx.send(PipelineMsg::Drain);
    }

    pub(crate) fn close(&self) {
        let _ = self.tx.send(PipelineMsg::Close);
    }
}

struct PipelineTask {
    index: usize,
    address: SocketAddr,
    settings: Arc<Settings>,
    core: mpsc::UnboundedSender<CoreMsg>,
    rx: mpsc::UnboundedReceiver<PipelineMsg>,
    stats: Arc<PipelineStats>,
    pending: HashMap<u32, RequestCtx>,
    fallback: VecDeque<(RequestPacket, RequestCtx)>,
    next_opaque: u32,
}

enum LoopExit {
    /// Connection went away; keep the task alive for a reconnect.
    Reconnect,
    /// Drain or close requested, or the instance dropped the channel.
    Stop,
}

impl PipelineTask {
    async fn run(mut self) {
        self.stats.set_state(PipelineState::Disconnected);
        loop {
            // Disconnected: nothing in flight, wait for work.
            if self.fallback.is_empty() {
                match self.rx.recv().await {
                    Some(PipelineMsg::Dispatch { packet, ctx }) => {
                        self.fallback.push_back((packet, ctx));
                    }
                    Some(PipelineMsg::Drain) | None => {
                        self.shutdown(true);
                        return;
                    }
                    Some(PipelineMsg::Close) => {
                        self.shutdown(false);
                        return;
                    }
                }
            }

            let stream = match self.connect_phase().await {
                Ok(Some(stream)) => stream,
                Ok(None) => continue,
                Err(LoopExit::Reconnect) => continue,
                Err(LoopExit::Stop) => return,
            };

            match self.connected_phase(stream).await {
                LoopExit::Reconnect => {
                    self.stats.set_state(PipelineState::Disconnected);
                }
                LoopExit::Stop => return,
            }
        }
    }

    /// Establish the connection while queueing new work into the fallback.
    async fn connect_phase(&mut self) -> std::result::Result<Option<TcpStream>, LoopExit> {
        self.stats.set_state(PipelineState::Connecting);
        debug!(pipeline = self.index, address = %self.address, "connecting");
        let connect = time::timeout(
            self.settings.connect_timeout,
            TcpStream::connect(self.address),
        );
        tokio::pin!(connect);
        loop {
            let deadline = self.nearest_deadline();
            tokio::select! {
                result = &mut connect => {
                    match result {
                        Ok(Ok(stream)) => {
                            let _ = stream.set_nodelay(true);
                            return Ok(Some(stream));
                        }
                        Ok(Err(err)) => {
                            warn!(pipeline = self.index, address = %self.address, error = %err, "connect failed");
                            self.fail_fallback(Error::Network(format!(
                                "connect to {} failed: {err}",
                                self.address
                            )));
                            self.stats.set_state(PipelineState::Disconnected);
                            return Ok(None);
                        }
                        Err(_) => {
                            warn!(pipeline = self.index, address = %self.address, "connect timed out");
                            self.fail_fallback(Error::Network(format!(
                                "connect to {} timed out",
                                self.address
                            )));
                            self.stats.set_state(PipelineState::Disconnected);
                            return Ok(None);
                        }
                    }
                }
                msg = self.rx.recv() => {
                    match msg {
                        Some(PipelineMsg::Dispatch { packet, ctx }) => {
                            self.fallback.push_back((packet, ctx));
                        }
                        Some(PipelineMsg::Drain) | None => {
                            self.shutdown(true);
                            return Err(LoopExit::Stop);
                        }
                        Some(PipelineMsg::Close) => {
                            self.shutdown(false);
                            return Err(LoopExit::Stop);
                        }
                    }
                }
                _ = sleep_until_opt(deadline), if deadline.is_some() => {
                    self.expire(Instant::now());
                }
            }
        }
    }

    /// Serve the connection until it dies or the pipeline is told to stop.
    async fn connected_phase(&mut self, stream: TcpStream) -> LoopExit {
        self.stats.set_state(PipelineState::Connected);
        self.stats.idle_since_ms.store(epoch_millis(), Ordering::Relaxed);
        debug!(pipeline = self.index, address = %self.address, "connected");
        let mut framed = Framed::new(stream, ClientCodec);

        // Flush the fallback in enqueue order before touching new work.
        while let Some((packet, ctx)) = self.fallback.pop_front() {
            if let Err(exit) = self.write_one(&mut framed, packet, ctx).await {
                return exit;
            }
        }
        if let Err(err) = framed.flush().await {
            return self.connection_lost(format!("flush failed: {err}"));
        }

        loop {
            let deadline = self.nearest_deadline();
            tokio::select! {
                msg = self.rx.recv() => {
                    match msg {
                        Some(PipelineMsg::Dispatch { packet, ctx }) => {
                            if let Err(exit) = self.write_one(&mut framed, packet, ctx).await {
                                return exit;
                            }
                            // Coalesce whatever else is already queued into
                            // one flush.
                            let mut stop = None;
                            while let Ok(extra) = self.rx.try_recv() {
                                match extra {
                                    PipelineMsg::Dispatch { packet, ctx } => {
                                        if let Err(exit) = self.write_one(&mut framed, packet, ctx).await {
                                            return exit;
                                        }
                                    }
                                    other => {
                                        stop = Some(other);
                                        break;
                                    }
                                }
                            }
                            if let Err(err) = framed.flush().await {
                                return self.connection_lost(format!("flush failed: {err}"));
                            }
                            match stop {
                                Some(PipelineMsg::Drain) => {
                                    self.shutdown(true);
                                    return LoopExit::Stop;
                                }
                                Some(PipelineMsg::Close) => {
                                    self.shutdown(false);
                                    return LoopExit::Stop;
                                }
                                _ => {}
                            }
                        }
                        Some(PipelineMsg::Drain) | None => {
                            self.shutdown(true);
                            return LoopExit::Stop;
                        }
                        Some(PipelineMsg::Close) => {
                            self.shutdown(false);
                            return LoopExit::Stop;
                        }
                    }
                }
                frame = framed.next() => {
                    match frame {
                        Some(Ok(resp)) => {
                            let Some(ctx) = self.pending.remove(&resp.opaque) else {
                                // Fatal: the correlation space is corrupt.
                                warn!(
                                    pipeline = self.index,
                                    opaque = resp.opaque,
                                    "response for unknown opaque; dropping connection"
                                );
                                self.fail_all(Error::Network(
                                    "protocol error: unknown opaque".to_string(),
                                ));
                                return LoopExit::Reconnect;
                            };
                            self.note_completion();
                            request::process_response(ctx, resp, &self.core, &self.settings);
                        }
                        Some(Err(err)) => {
                            warn!(pipeline = self.index, error = %err, "malformed frame; dropping connection");
                            self.fail_all(Error::Network(format!("protocol error: {err}")));
                            return LoopExit::Reconnect;
                        }
                        None => {
                            debug!(pipeline = self.index, "connection closed by server");
                            return self.connection_lost("connection closed".to_string());
                        }
                    }
                }
                _ = sleep_until_opt(deadline), if deadline.is_some() => {
                    self.expire(Instant::now());
                }
            }
        }
    }

    /// Assign an opaque, register the context, and feed the frame.
    async fn write_one(
        &mut self,
        framed: &mut Framed<TcpStream, ClientCodec>,
        mut packet: RequestPacket,
        ctx: RequestCtx,
    ) -> std::result::Result<(), LoopExit> {
        // Never reuse an opaque that is still pending.
        loop {
            self.next_opaque = self.next_opaque.wrapping_add(1);
            if !self.pending.contains_key(&self.next_opaque) {
                break;
            }
        }
        packet.opaque = self.next_opaque;
        self.pending.insert(packet.opaque, ctx);
        self.stats.pending.store(self.pending.len(), Ordering::Relaxed);
        self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
        if let Err(err) = framed.feed(packet).await {
            return Err(self.connection_lost(format!("write failed: {err}")));
        }
        Ok(())
    }

    fn note_completion(&mut self) {
        self.stats.pending.store(self.pending.len(), Ordering::Relaxed);
        self.stats.completed.fetch_add(1, Ordering::Relaxed);
        if self.pending.is_empty() {
            self.stats.idle_since_ms.store(epoch_millis(), Ordering::Relaxed);
        }
    }

    /// Connection-level failure: drain semantics, then reconnect.
    fn connection_lost(&mut self, detail: String) -> LoopExit {
        self.stats.set_state(PipelineState::Draining);
        let error = Error::Network(detail);
        for (_, ctx) in self.pending.drain() {
            request::process_failure(ctx, error.clone(), true, &self.core);
        }
        for (_, ctx) in self.fallback.drain(..) {
            request::process_failure(ctx, error.clone(), true, &self.core);
        }
        self.stats.pending.store(0, Ordering::Relaxed);
        LoopExit::Reconnect
    }

    /// Hard failure: every packet fails, nothing is re-routed.
    fn fail_all(&mut self, error: Error) {
        for (_, ctx) in self.pending.drain() {
            request::process_failure(ctx, error.clone(), false, &self.core);
        }
        for (_, ctx) in self.fallback.drain(..) {
            request::process_failure(ctx, error.clone(), false, &self.core);
        }
        self.stats.pending.store(0, Ordering::Relaxed);
    }

    /// Fail packets queued before a connection existed.
    fn fail_fallback(&mut self, error: Error) {
        for (_, ctx) in self.fallback.drain(..) {
            request::process_failure(ctx, error.clone(), true, &self.core);
        }
    }

    /// Drain (`reroute = true`) or cancel everything, then mark closed.
    fn shutdown(&mut self, reroute: bool) {
        self.stats.set_state(if reroute {
            PipelineState::Draining
        } else {
            PipelineState::Closed
        });
        if reroute {
            let error = Error::Network("pipeline drained".to_string());
            for (_, ctx) in self.pending.drain() {
                request::process_failure(ctx, error.clone(), true, &self.core);
            }
            for (_, ctx) in self.fallback.drain(..) {
                request::process_failure(ctx, error.clone(), true, &self.core);
            }
        } else {
            self.fail_all(Error::RequestCanceled);
        }
        self.stats.pending.store(0, Ordering::Relaxed);
        self.stats.set_state(PipelineState::Closed);
    }

    /// Nearest deadline across pending and fallback packets.
    fn nearest_deadline(&self) -> Option<Instant> {
        let pending = self.pending.values().map(|ctx| ctx.spec.deadline).min();
        let queued = self.fallback.iter().map(|(_, ctx)| ctx.spec.deadline).min();
        match (pending, queued) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Expire everything whose deadline has passed.
    fn expire(&mut self, now: Instant) {
        let expired: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, ctx)| ctx.spec.expired(now))
            .map(|(opaque, _)| *opaque)
            .collect();
        for opaque in expired {
            if let Some(ctx) = self.pending.remove(&opaque) {
                self.note_completion();
                request::process_failure(ctx, Error::Timeout, false, &self.core);
            }
        }
        let mut keep = VecDeque::with_capacity(self.fallback.len());
        for (packet, ctx) in self.fallback.drain(..) {
            if ctx.spec.expired(now) {
                request::process_failure(ctx, Error::Timeout, false, &self.core);
            } else {
                keep.push_back((packet, ctx));
            }
        }
        self.fallback = keep;
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}
