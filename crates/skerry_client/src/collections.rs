//! Collection-id cache with single-flight resolution.
//!
//! Commands addressing a non-default collection park here until the id is
//! known. Concurrent misses on the same qualifier fold into one in-flight
//! lookup; every waiter shares its outcome.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::ops::CollectionQualifier;
use crate::request::RequestCtx;

/// Cache of resolved ids plus per-qualifier waiters.
#[derive(Default)]
pub(crate) struct CollectionCache {
    ids: HashMap<CollectionQualifier, u32>,
    pending: HashMap<CollectionQualifier, Vec<RequestCtx>>,
}

impl CollectionCache {
    /// Resolved id for a qualifier, if cached. The default pair is always 0.
    pub(crate) fn lookup(&self, qualifier: &CollectionQualifier) -> Option<u32> {
        if qualifier.is_default() {
            return Some(0);
        }
        self.ids.get(qualifier).copied()
    }

    /// Park a command until resolution completes.
    ///
    /// Returns true when this is the first waiter and the caller must issue
    /// the lookup packet.
    pub(crate) fn park(&mut self, qualifier: CollectionQualifier, ctx: RequestCtx) -> bool {
        let waiters = self.pending.entry(qualifier).or_default();
        waiters.push(ctx);
        waiters.len() == 1
    }

    /// Record a resolution outcome and return the waiters to re-enter.
    ///
    /// Scheduling failures of the lookup itself surface to waiters as
    /// TIMEOUT.
    pub(crate) fn complete(
        &mut self,
        qualifier: &CollectionQualifier,
        result: &Result<(u64, u32)>,
    ) -> (Result<u32>, Vec<RequestCtx>) {
        let waiters = self.pending.remove(qualifier).unwrap_or_default();
        let mapped = match result {
            Ok((_manifest, cid)) => {
                self.ids.insert(qualifier.clone(), *cid);
                Ok(*cid)
            }
            Err(Error::ScheduleFailure) => Err(Error::Timeout),
            Err(err) => Err(err.clone()),
        };
        (mapped, waiters)
    }

    /// Number of distinct qualifiers with an in-flight lookup.
    pub(crate) fn pending_lookups(&self) -> usize {
        self.pending.len()
    }

    /// Cached id count, for diagnostics.
    pub(crate) fn cached(&self) -> usize {
        self.ids.len()
    }

    /// Take every parked command, for instance shutdown.
    pub(crate) fn drain_waiters(&mut self) -> Vec<RequestCtx> {
        self.pending.drain().flat_map(|(_, waiters)| waiters).collect()
    }

    /// Drop every cached id, forcing fresh lookups.
    ///
    /// Called when a new map arrives without the collections capability, in
    /// case the bucket manifest was rolled back.
    pub(crate) fn invalidate(&mut self) {
        self.ids.clear();
    }
}
