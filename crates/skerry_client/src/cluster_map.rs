//! Versioned vbucket→server cluster map.
//!
//! The bootstrap layer publishes `ClusterMapConfig` documents; the instance
//! compiles them into an immutable `ClusterMap` and swaps a single `Arc`.
//! Lookups never lock: a command that resolved its route before a swap is
//! still dispatched through the pipeline chosen under the old map.

use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Capability flags advertised per data node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeCapabilities {
    pub snappy: bool,
    pub json: bool,
    pub mutation_tokens: bool,
    pub sync_replication: bool,
    pub collections: bool,
}

impl NodeCapabilities {
    /// Everything on, the shape of a current-generation data node.
    pub fn all() -> NodeCapabilities {
        NodeCapabilities {
            snappy: true,
            json: true,
            mutation_tokens: true,
            sync_replication: true,
            collections: true,
        }
    }
}

/// One node entry in a published map document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Data endpoint, `host:port`.
    pub address: String,
    #[serde(default)]
    pub capabilities: NodeCapabilities,
}

/// The published form of a cluster map.
///
/// Each vbucket row is `[master, replica0, replica1, ...]` with `-1` marking
/// an absent copy. Rows may be shorter than `1 + num_replicas`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterMapConfig {
    /// Monotonic map revision.
    pub rev: u64,
    pub nodes: Vec<NodeConfig>,
    pub vbuckets: Vec<Vec<i32>>,
}

/// A resolved server slot.
#[derive(Debug, Clone)]
pub struct ServerSlot {
    pub address: SocketAddr,
    pub capabilities: NodeCapabilities,
}

/// Immutable, compiled cluster map.
#[derive(Debug)]
pub struct ClusterMap {
    rev: u64,
    n_replicas: u16,
    vbuckets: Vec<Vec<i32>>,
    servers: Vec<ServerSlot>,
}

/// Protocol key hash: CRC32 of the raw key, folded to 15 bits.
pub fn key_hash(key: &[u8]) -> u32 {
    (crc32fast::hash(key) >> 16) & 0x7fff
}

impl ClusterMap {
    /// Validate and compile a published map document.
    pub fn compile(config: &ClusterMapConfig) -> Result<Arc<ClusterMap>> {
        if config.nodes.is_empty() || config.vbuckets.is_empty() {
            return Err(Error::InvalidArgument("cluster map has no nodes or vbuckets"));
        }
        let mut servers = Vec::with_capacity(config.nodes.len());
        for node in &config.nodes {
            let address = node
                .address
                .parse::<SocketAddr>()
                .map_err(|_| Error::InvalidArgument("unparseable node address in cluster map"))?;
            servers.push(ServerSlot {
                address,
                capabilities: node.capabilities,
            });
        }
        let mut n_replicas = 0u16;
        for row in &config.vbuckets {
            if row.is_empty() {
                return Err(Error::InvalidArgument("empty vbucket row in cluster map"));
            }
            for &ix in row {
                if ix >= servers.len() as i32 {
                    return Err(Error::InvalidArgument("vbucket row references unknown server"));
                }
            }
            n_replicas = n_replicas.max((row.len() - 1) as u16);
        }
        Ok(Arc::new(ClusterMap {
            rev: config.rev,
            n_replicas,
            vbuckets: config.vbuckets.clone(),
            servers,
        }))
    }

    pub fn rev(&self) -> u64 {
        self.rev
    }

    pub fn n_vbuckets(&self) -> usize {
        self.vbuckets.len()
    }

    pub fn n_replicas(&self) -> u16 {
        self.n_replicas
    }

    pub fn n_servers(&self) -> usize {
        self.servers.len()
    }

    pub fn servers(&self) -> &[ServerSlot] {
        &self.servers
    }

    pub fn server(&self, index: usize) -> Option<&ServerSlot> {
        self.servers.get(index)
    }

    /// Vbucket owning `key`.
    pub fn vbucket_for_key(&self, key: &[u8]) -> u16 {
        (key_hash(key) as usize % self.vbuckets.len()) as u16
    }

    /// Master server index for a vbucket, if one is assigned.
    pub fn master(&self, vbucket: u16) -> Option<usize> {
        let row = self.vbuckets.get(vbucket as usize)?;
        match row.first() {
            Some(&ix) if ix >= 0 => Some(ix as usize),
            _ => None,
        }
    }

    /// Server index of replica `n` (0-based) for a vbucket.
    pub fn replica(&self, vbucket: u16, n: u16) -> Option<usize> {
        let row = self.vbuckets.get(vbucket as usize)?;
        match row.get(1 + n as usize) {
            Some(&ix) if ix >= 0 => Some(ix as usize),
            _ => None,
        }
    }

    /// Route a key: `(vbucket, master)`.
    pub fn map_key(&self, key: &[u8]) -> (u16, Option<usize>) {
        let vb = self.vbucket_for_key(key);
        (vb, self.master(vb))
    }
}
