//! Error taxonomy surfaced by the client.
//!
//! Validation failures are returned directly from the submission call; every
//! other kind is delivered through the operation's response channel once the
//! command has reached its single logical outcome.

use thiserror::Error;

/// Classified failure kinds for client operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// Key is empty or longer than the protocol limit of 250 bytes.
    #[error("key must be non-empty and at most 250 bytes")]
    EmptyKey,
    /// Mutually exclusive command options were combined.
    #[error("conflicting command options: {0}")]
    OptionsConflict(&'static str),
    /// No cluster map has been published to this instance yet.
    #[error("no cluster map has been published")]
    NoConfiguration,
    /// The current map has no server that can satisfy the command.
    #[error("no server can satisfy the command")]
    NoMatchingServer,
    #[error("operation timed out")]
    Timeout,
    #[error("network failure: {0}")]
    Network(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("document not found")]
    DocumentNotFound,
    #[error("document already exists")]
    DocumentExists,
    #[error("CAS mismatch")]
    CasMismatch,
    #[error("document is locked")]
    DocumentLocked,
    /// Durability constraints require more copies than the topology has.
    #[error("durability constraints exceed the cluster topology")]
    DurabilityTooMany,
    /// Sequence-number durability was requested without mutation tokens.
    #[error("mutation tokens are not available for this operation")]
    DurabilityNoMutationTokens,
    /// A store was acknowledged but its durability poll did not succeed.
    ///
    /// The write itself is on the server; `cas` identifies it and `kind`
    /// carries what stopped the poll (timeout, conflicting mutation, or a
    /// vanished document).
    #[error("durability not satisfied: {kind}")]
    DurabilityFailed {
        kind: Box<Error>,
        store_ok: bool,
        cas: u64,
    },
    /// The instance configuration does not enable the required feature.
    #[error("feature unavailable: {0}")]
    FeatureUnavailable(&'static str),
    /// The server reported it is out of memory.
    #[error("server is out of memory")]
    OutOfMemory,
    /// The instance shut down before the command completed.
    #[error("request canceled")]
    RequestCanceled,
    /// The command could not be handed to a pipeline.
    #[error("command could not be scheduled")]
    ScheduleFailure,
}

pub type Result<T> = std::result::Result<T, Error>;
