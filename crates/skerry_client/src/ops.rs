//! Public command builders and their synchronous validation.
//!
//! Commands are plain structs with chainable setters. Validation runs before
//! anything is scheduled: an invalid command is rejected from the submission
//! call itself and never reaches a pipeline.

use std::time::Duration;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::protocol::MAX_KEY_LEN;

/// Scope + collection pair addressing a namespace within the bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionQualifier {
    scope: String,
    collection: String,
}

const DEFAULT_NAME: &str = "_default";

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 251
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b'%')
}

impl Default for CollectionQualifier {
    fn default() -> Self {
        CollectionQualifier {
            scope: DEFAULT_NAME.to_string(),
            collection: DEFAULT_NAME.to_string(),
        }
    }
}

impl CollectionQualifier {
    /// Build a qualifier, validating both names.
    pub fn new(scope: &str, collection: &str) -> Result<CollectionQualifier> {
        if !valid_name(scope) || !valid_name(collection) {
            return Err(Error::InvalidArgument("invalid scope or collection name"));
        }
        Ok(CollectionQualifier {
            scope: scope.to_string(),
            collection: collection.to_string(),
        })
    }

    /// True for the default scope/collection pair, which is always id 0.
    pub fn is_default(&self) -> bool {
        self.scope == DEFAULT_NAME && self.collection == DEFAULT_NAME
    }

    /// Dotted path used by the collection-id lookup.
    pub fn path(&self) -> String {
        format!("{}.{}", self.scope, self.collection)
    }
}

/// Server-enforced durability levels for synchronous replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DurabilityLevel {
    Majority = 0x01,
    MajorityAndPersistActive = 0x02,
    PersistToMajority = 0x03,
}

/// Durability requirement attached to a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Durability {
    #[default]
    None,
    /// Server-side enforcement via the alt-request frame-extras.
    Sync(DurabilityLevel),
    /// Client-side observe polling. `-1` means "as many as the cluster has".
    Poll { persist_to: i16, replicate_to: i16 },
}

/// Store opcode family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOperation {
    Upsert,
    Insert,
    Replace,
    Append,
    Prepend,
}

/// Replica read strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaStrategy {
    /// Query exactly replica `n`.
    Select(u16),
    /// Fan out to every online replica; one response each, final marked.
    All,
    /// Query replica 0, advancing on failure until one succeeds.
    First,
}

/// A get, get-and-touch, or get-and-lock.
#[derive(Debug, Clone)]
pub struct GetCommand {
    pub(crate) key: Bytes,
    pub(crate) collection: CollectionQualifier,
    pub(crate) timeout: Option<Duration>,
    pub(crate) touch: Option<u32>,
    pub(crate) lock: Option<u32>,
}

impl GetCommand {
    pub fn new(key: impl Into<Bytes>) -> GetCommand {
        GetCommand {
            key: key.into(),
            collection: CollectionQualifier::default(),
            timeout: None,
            touch: None,
            lock: None,
        }
    }

    pub fn collection(mut self, collection: CollectionQualifier) -> Self {
        self.collection = collection;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Refresh the document's expiry while reading (get-and-touch).
    pub fn expiry(mut self, seconds: u32) -> Self {
        self.touch = Some(seconds);
        self
    }

    /// Lock the document while reading. Zero requests the server default.
    pub fn lock(mut self, seconds: u32) -> Self {
        self.lock = Some(seconds);
        self
    }
}

/// A mutation in the store family.
#[derive(Debug, Clone)]
pub struct StoreCommand {
    pub(crate) operation: StoreOperation,
    pub(crate) key: Bytes,
    pub(crate) value: Bytes,
    pub(crate) flags: u32,
    pub(crate) expiry: u32,
    pub(crate) cas: u64,
    pub(crate) json: bool,
    pub(crate) precompressed: bool,
    pub(crate) durability: Durability,
    pub(crate) collection: CollectionQualifier,
    pub(crate) timeout: Option<Duration>,
}

impl StoreCommand {
    fn new(operation: StoreOperation, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        StoreCommand {
            operation,
            key: key.into(),
            value: value.into(),
            flags: 0,
            expiry: 0,
            cas: 0,
            json: false,
            precompressed: false,
            durability: Durability::None,
            collection: CollectionQualifier::default(),
            timeout: None,
        }
    }

    pub fn upsert(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self::new(StoreOperation::Upsert, key, value)
    }

    pub fn insert(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self::new(StoreOperation::Insert, key, value)
    }

    pub fn replace(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self::new(StoreOperation::Replace, key, value)
    }

    pub fn append(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self::new(StoreOperation::Append, key, value)
    }

    pub fn prepend(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self::new(StoreOperation::Prepend, key, value)
    }

    pub fn flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn expiry(mut self, seconds: u32) -> Self {
        self.expiry = seconds;
        self
    }

    pub fn cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    /// Mark the value as JSON so capable servers index it as such.
    pub fn json(mut self) -> Self {
        self.json = true;
        self
    }

    /// The value is already snappy-compressed; do not compress again.
    pub fn precompressed(mut self) -> Self {
        self.precompressed = true;
        self
    }

    pub fn durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }

    pub fn collection(mut self, collection: CollectionQualifier) -> Self {
        self.collection = collection;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A document removal.
#[derive(Debug, Clone)]
pub struct RemoveCommand {
    pub(crate) key: Bytes,
    pub(crate) cas: u64,
    pub(crate) durability_level: Option<DurabilityLevel>,
    pub(crate) collection: CollectionQualifier,
    pub(crate) timeout: Option<Duration>,
}

impl RemoveCommand {
    pub fn new(key: impl Into<Bytes>) -> RemoveCommand {
        RemoveCommand {
            key: key.into(),
            cas: 0,
            durability_level: None,
            collection: CollectionQualifier::default(),
            timeout: None,
        }
    }

    pub fn cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    pub fn durability(mut self, level: DurabilityLevel) -> Self {
        self.durability_level = Some(level);
        self
    }

    pub fn collection(mut self, collection: CollectionQualifier) -> Self {
        self.collection = collection;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A read against one or more replicas.
#[derive(Debug, Clone)]
pub struct ReplicaGetCommand {
    pub(crate) key: Bytes,
    pub(crate) strategy: ReplicaStrategy,
    pub(crate) collection: CollectionQualifier,
    pub(crate) timeout: Option<Duration>,
}

impl ReplicaGetCommand {
    pub fn new(key: impl Into<Bytes>, strategy: ReplicaStrategy) -> ReplicaGetCommand {
        ReplicaGetCommand {
            key: key.into(),
            strategy,
            collection: CollectionQualifier::default(),
            timeout: None,
        }
    }

    pub fn collection(mut self, collection: CollectionQualifier) -> Self {
        self.collection = collection;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Keys to observe across the master and replicas.
#[derive(Debug, Clone)]
pub struct ObserveCommand {
    pub(crate) keys: Vec<Bytes>,
    pub(crate) collection: CollectionQualifier,
    pub(crate) timeout: Option<Duration>,
}

impl ObserveCommand {
    pub fn new(keys: Vec<Bytes>) -> ObserveCommand {
        ObserveCommand {
            keys,
            collection: CollectionQualifier::default(),
            timeout: None,
        }
    }

    pub fn collection(mut self, collection: CollectionQualifier) -> Self {
        self.collection = collection;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// One key tracked by an endure context.
#[derive(Debug, Clone)]
pub struct EndureItem {
    pub(crate) key: Bytes,
    pub(crate) cas: u64,
    pub(crate) mutation_token: Option<MutationToken>,
    pub(crate) check_removed: bool,
}

impl EndureItem {
    pub fn new(key: impl Into<Bytes>, cas: u64) -> EndureItem {
        EndureItem {
            key: key.into(),
            cas,
            mutation_token: None,
            check_removed: false,
        }
    }

    /// Supply the write's mutation token for sequence-number polling.
    pub fn mutation_token(mut self, token: MutationToken) -> Self {
        self.mutation_token = Some(token);
        self
    }

    /// Verify a removal instead of a write: tombstones count as success.
    pub fn check_removed(mut self) -> Self {
        self.check_removed = true;
        self
    }
}

/// Options shared by an endure context.
#[derive(Debug, Clone)]
pub struct DurabilityOptions {
    pub persist_to: i16,
    pub replicate_to: i16,
    /// Poll by sequence number instead of CAS; requires mutation tokens.
    pub seqno: bool,
    /// Clamp the constraints to what the topology can satisfy.
    pub cap_max: bool,
    pub timeout: Option<Duration>,
    pub interval: Option<Duration>,
    pub collection: CollectionQualifier,
}

impl DurabilityOptions {
    pub fn new(persist_to: i16, replicate_to: i16) -> DurabilityOptions {
        DurabilityOptions {
            persist_to,
            replicate_to,
            seqno: false,
            cap_max: false,
            timeout: None,
            interval: None,
            collection: CollectionQualifier::default(),
        }
    }
}

/// Version token attached to successful writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MutationToken {
    pub uuid: u64,
    pub vbucket: u16,
    pub seqno: u64,
}

impl MutationToken {
    /// A zero token is the absence of a token.
    pub fn is_valid(&self) -> bool {
        !(self.uuid == 0 && self.seqno == 0 && self.vbucket == 0)
    }
}

/// Response to the get family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetResponse {
    pub cas: u64,
    pub flags: u32,
    pub datatype: u8,
    pub value: Bytes,
}

/// Observe counters from a satisfied durability poll.
///
/// A poll that fails surfaces as `Error::DurabilityFailed` on the command
/// itself; this report only accompanies successful polls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObserveReport {
    /// Whether the underlying store was acknowledged before polling began.
    pub store_ok: bool,
    pub num_responses: u16,
    pub num_persisted: u16,
    pub num_replicated: u16,
    pub master_exists: bool,
    pub master_persisted: bool,
}

/// Response to the store family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreResponse {
    pub cas: u64,
    pub mutation_token: Option<MutationToken>,
    /// Present when the command requested observe-based durability and the
    /// poll succeeded.
    pub durability: Option<ObserveReport>,
}

/// Response to a removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveResponse {
    pub cas: u64,
    pub mutation_token: Option<MutationToken>,
}

/// One replica's answer in a replica read.
#[derive(Debug, Clone)]
pub struct ReplicaRead {
    pub result: Result<GetResponse>,
    /// Set on the last response of the fan-out.
    pub is_final: bool,
}

/// Per-key completion delivered by an endure context.
#[derive(Debug, Clone)]
pub struct EndureResponse {
    pub key: Bytes,
    pub result: Result<()>,
    pub num_responses: u16,
    pub num_persisted: u16,
    pub num_replicated: u16,
    pub master_exists: bool,
    pub master_persisted: bool,
}

/// Reject empty keys and keys beyond the protocol limit.
pub(crate) fn validate_key(key: &[u8]) -> Result<()> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(Error::EmptyKey);
    }
    Ok(())
}

/// Feature gate for non-default collections.
pub(crate) fn validate_collection(
    collection: &CollectionQualifier,
    use_collections: bool,
) -> Result<()> {
    if !use_collections && !collection.is_default() {
        return Err(Error::FeatureUnavailable("collections are not enabled"));
    }
    Ok(())
}

/// Store-family option conflicts, checked before scheduling.
pub(crate) fn validate_store(cmd: &StoreCommand) -> Result<()> {
    validate_key(&cmd.key)?;
    match cmd.operation {
        StoreOperation::Append | StoreOperation::Prepend => {
            if cmd.expiry != 0 || cmd.flags != 0 {
                return Err(Error::OptionsConflict(
                    "append/prepend do not accept expiry or flags",
                ));
            }
        }
        StoreOperation::Insert => {
            if cmd.cas != 0 {
                return Err(Error::OptionsConflict("insert does not accept a CAS"));
            }
        }
        _ => {}
    }
    Ok(())
}

/// Get-family option conflicts.
pub(crate) fn validate_get(cmd: &GetCommand) -> Result<()> {
    validate_key(&cmd.key)?;
    if cmd.touch.is_some() && cmd.lock.is_some() {
        return Err(Error::OptionsConflict("lock and expiry are exclusive"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_limits() {
        assert_eq!(validate_key(b""), Err(Error::EmptyKey));
        assert_eq!(validate_key(&[b'x'; 251]), Err(Error::EmptyKey));
        assert!(validate_key(&[b'x'; 250]).is_ok());
    }

    #[test]
    fn append_rejects_expiry_and_flags() {
        let base = StoreCommand::append("k", "x");
        assert!(validate_store(&base.clone()).is_ok());
        assert!(matches!(
            validate_store(&base.clone().expiry(5)),
            Err(Error::OptionsConflict(_))
        ));
        assert!(matches!(
            validate_store(&base.flags(1)),
            Err(Error::OptionsConflict(_))
        ));
    }

    #[test]
    fn insert_rejects_cas() {
        let cmd = StoreCommand::insert("k", "v").cas(9);
        assert!(matches!(
            validate_store(&cmd),
            Err(Error::OptionsConflict(_))
        ));
    }

    #[test]
    fn get_rejects_lock_with_expiry() {
        let cmd = GetCommand::new("k").lock(0).expiry(10);
        assert!(matches!(validate_get(&cmd), Err(Error::OptionsConflict(_))));
    }

    #[test]
    fn collection_names_are_validated() {
        assert!(CollectionQualifier::new("app", "users").is_ok());
        assert!(CollectionQualifier::new("", "users").is_err());
        assert!(CollectionQualifier::new("app", "has space").is_err());
        assert!(CollectionQualifier::default().is_default());
        assert_eq!(
            CollectionQualifier::new("app", "users").unwrap().path(),
            "app.users"
        );
    }
}
