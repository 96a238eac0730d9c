//! Instance-wide command queue.
//!
//! Maps a command to its pipeline through the cluster map, serializes it
//! against the target server's capabilities, and hands it over. Commands
//! scheduled between `sched_enter` and `sched_leave` become visible to
//! pipelines together at leave; `sched_fail` discards them.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::cluster_map::{ClusterMap, NodeCapabilities};
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::instance::CoreMsg;
use crate::pipeline::{PipelineHandle, PipelineState};
use crate::protocol::RequestPacket;
use crate::request::{self, RequestCtx, RequestKind};

pub(crate) struct CommandQueue {
    settings: Arc<Settings>,
    core: mpsc::UnboundedSender<CoreMsg>,
    map: Option<Arc<ClusterMap>>,
    pipelines: Vec<PipelineHandle>,
    staged: Vec<(usize, RequestPacket, RequestCtx)>,
    batch_depth: u32,
    rr_cursor: usize,
}

impl CommandQueue {
    pub(crate) fn new(settings: Arc<Settings>, core: mpsc::UnboundedSender<CoreMsg>) -> Self {
        CommandQueue {
            settings,
            core,
            map: None,
            pipelines: Vec::new(),
            staged: Vec::new(),
            batch_depth: 0,
            rr_cursor: 0,
        }
    }

    pub(crate) fn map(&self) -> Option<&Arc<ClusterMap>> {
        self.map.as_ref()
    }

    pub(crate) fn pipelines(&self) -> &[PipelineHandle] {
        &self.pipelines
    }

    /// Swap in a new map, reusing pipelines whose endpoint is unchanged and
    /// draining the rest. Packets already handed to an old pipeline complete
    /// or re-route through it.
    pub(crate) fn publish(&mut self, map: Arc<ClusterMap>) {
        let mut old = std::mem::take(&mut self.pipelines);
        let mut next = Vec::with_capacity(map.n_servers());
        for (index, slot) in map.servers().iter().enumerate() {
            let reused = old
                .iter()
                .position(|pipeline| pipeline.address == slot.address)
                .map(|pos| old.swap_remove(pos));
            match reused {
                Some(pipeline) => next.push(pipeline),
                None => next.push(PipelineHandle::spawn(
                    index,
                    slot.address,
                    self.core.clone(),
                    self.settings.clone(),
                )),
            }
        }
        for stale in old {
            debug!(address = %stale.address, "draining pipeline dropped by new map");
            stale.drain();
        }
        info!(
            rev = map.rev(),
            servers = map.n_servers(),
            vbuckets = map.n_vbuckets(),
            replicas = map.n_replicas(),
            "cluster map published"
        );
        self.map = Some(map);
    }

    /// Begin a scheduling batch. Batches nest; only the outermost flushes.
    pub(crate) fn sched_enter(&mut self) {
        self.batch_depth += 1;
    }

    /// Make the batch visible to pipelines, in enqueue order.
    pub(crate) fn sched_leave(&mut self) {
        debug_assert!(self.batch_depth > 0, "sched_leave without sched_enter");
        self.batch_depth = self.batch_depth.saturating_sub(1);
        if self.batch_depth > 0 {
            return;
        }
        for (server, packet, ctx) in self.staged.drain(..) {
            send_to_pipeline(&self.pipelines, server, packet, ctx, &self.core);
        }
    }

    /// Discard the batch, failing every staged command.
    #[allow(dead_code)]
    pub(crate) fn sched_fail(&mut self) {
        debug_assert!(self.batch_depth > 0, "sched_fail without sched_enter");
        self.batch_depth = self.batch_depth.saturating_sub(1);
        if self.batch_depth > 0 {
            return;
        }
        for (_, _, ctx) in self.staged.drain(..) {
            request::deliver(ctx, Err(Error::ScheduleFailure), &self.core);
        }
    }

    /// Route, serialize, and enqueue one command.
    ///
    /// Routing failures are delivered through the context's processor; the
    /// caller sees every command reach an outcome either way.
    pub(crate) fn dispatch(&mut self, mut ctx: RequestCtx) {
        let (server, caps) = match self.route(&mut ctx) {
            Ok(target) => target,
            Err(err) => {
                request::deliver(ctx, Err(err), &self.core);
                return;
            }
        };
        ctx.spec.attempt += 1;
        ctx.spec.last_server = Some(server);
        ctx.spec.dispatched_rev = self.map.as_ref().map(|m| m.rev()).unwrap_or(0);
        let packet = request::encode_packet(&ctx.spec, &caps, &self.settings);
        if self.batch_depth > 0 {
            self.staged.push((server, packet, ctx));
        } else {
            send_to_pipeline(&self.pipelines, server, packet, ctx, &self.core);
        }
    }

    fn route(&mut self, ctx: &mut RequestCtx) -> Result<(usize, NodeCapabilities)> {
        if let Some(server) = ctx.spec.server {
            if server >= self.pipelines.len() {
                return Err(Error::NoMatchingServer);
            }
            let caps = self
                .map
                .as_ref()
                .and_then(|map| map.server(server))
                .map(|slot| slot.capabilities)
                .unwrap_or_default();
            return Ok((server, caps));
        }
        if matches!(ctx.spec.kind, RequestKind::GetCollectionId { .. }) {
            let server = self.any_live_server().ok_or(Error::NoMatchingServer)?;
            let caps = self
                .map
                .as_ref()
                .and_then(|map| map.server(server))
                .map(|slot| slot.capabilities)
                .unwrap_or_default();
            return Ok((server, caps));
        }
        let map = self.map.as_ref().ok_or(Error::NoConfiguration)?;
        let (vbucket, master) = map.map_key(&ctx.spec.key);
        ctx.spec.vbucket = Some(vbucket);
        let server = master.ok_or(Error::NoMatchingServer)?;
        let caps = map
            .server(server)
            .map(|slot| slot.capabilities)
            .ok_or(Error::NoMatchingServer)?;
        Ok((server, caps))
    }

    /// Round-robin over pipelines, preferring live connections.
    fn any_live_server(&mut self) -> Option<usize> {
        if self.pipelines.is_empty() {
            return None;
        }
        let n = self.pipelines.len();
        for offset in 0..n {
            let candidate = (self.rr_cursor + offset) % n;
            if self.pipelines[candidate].stats.state() == PipelineState::Connected {
                self.rr_cursor = candidate + 1;
                return Some(candidate);
            }
        }
        // Nothing connected yet; pick the next slot and let it dial.
        let candidate = self.rr_cursor % n;
        self.rr_cursor += 1;
        Some(candidate)
    }

    /// Stop every pipeline, canceling whatever is still pending.
    pub(crate) fn close_all(&mut self) {
        for pipeline in &self.pipelines {
            pipeline.close();
        }
        for (_, _, ctx) in self.staged.drain(..) {
            request::deliver(ctx, Err(Error::RequestCanceled), &self.core);
        }
    }
}

fn send_to_pipeline(
    pipelines: &[PipelineHandle],
    server: usize,
    packet: RequestPacket,
    ctx: RequestCtx,
    core: &mpsc::UnboundedSender<CoreMsg>,
) {
    match pipelines.get(server) {
        Some(pipeline) => {
            if let Err(ctx) = pipeline.dispatch(packet, ctx) {
                request::deliver(ctx, Err(Error::ScheduleFailure), core);
            }
        }
        None => request::deliver(ctx, Err(Error::NoMatchingServer), core),
    }
}
