//! Client library for the Skerry distributed document store.
//!
//! The crate speaks the binary key/value wire protocol to a cluster of data
//! nodes whose shard ownership is dictated by a versioned vbucket map. The
//! heart of it is the KV command pipeline: commands are validated, routed
//! through the current map, serialized into framed binary requests, pushed
//! through per-server send pipelines with opaque correlation, and the
//! asynchronous responses are dispatched back to the caller. On top of that
//! core sit replica reads, observe multiplexing, and observe-based
//! durability polling.
//!
//! ```no_run
//! use skerry_client::{ClusterMapConfig, GetCommand, Instance, Settings, StoreCommand};
//!
//! # async fn example(map: ClusterMapConfig) -> skerry_client::Result<()> {
//! let instance = Instance::new(Settings::default());
//! instance.publish_map(&map).await?;
//! instance.store(StoreCommand::upsert("greeting", "hello")).await?;
//! let doc = instance.get(GetCommand::new("greeting")).await?;
//! assert_eq!(&doc.value[..], b"hello");
//! # Ok(())
//! # }
//! ```

mod cluster_map;
mod collections;
mod config;
mod durability;
mod error;
mod instance;
mod ops;
mod pipeline;
pub mod protocol;
mod queue;
mod request;

pub use cluster_map::{
    key_hash, ClusterMap, ClusterMapConfig, NodeCapabilities, NodeConfig, ServerSlot,
};
pub use config::{CompressionOptions, Settings};
pub use durability::ObserveKeyState;
pub use error::{Error, Result};
pub use instance::{Instance, ObserveEvent};
pub use ops::{
    CollectionQualifier, Durability, DurabilityLevel, DurabilityOptions, EndureItem,
    EndureResponse, GetCommand, GetResponse, MutationToken, ObserveCommand, ObserveReport,
    RemoveCommand, RemoveResponse, ReplicaGetCommand, ReplicaRead, ReplicaStrategy, StoreCommand,
    StoreOperation, StoreResponse,
};
