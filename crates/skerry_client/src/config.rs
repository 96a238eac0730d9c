//! Instance-wide settings.
//!
//! The settings struct is the environment of an instance: timeouts, retry
//! cadence, and feature toggles that every subsystem reads. It is immutable
//! once the instance has been created.

use std::time::{Duration, Instant};

/// Default per-operation timeout.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_micros(2_500_000);
/// Default overall budget for observe-based durability polling.
pub const DEFAULT_DURABILITY_TIMEOUT: Duration = Duration::from_micros(5_000_000);
/// Default pause between durability observe rounds.
pub const DEFAULT_DURABILITY_INTERVAL: Duration = Duration::from_micros(100_000);
/// Default backoff before retrying after NOT_MY_VBUCKET or a temporary failure.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_micros(100_000);
/// Default budget for establishing a data connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_micros(5_000_000);

/// Outbound/inbound snappy compression policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionOptions {
    /// Compress values sent to servers that advertise snappy.
    pub outbound: bool,
    /// Inflate compressed values received from the server.
    pub inbound: bool,
    /// Compress outbound values even when the server does not advertise snappy.
    pub force: bool,
}

impl CompressionOptions {
    /// Compression fully disabled, for pass-through deployments.
    pub const OFF: CompressionOptions = CompressionOptions {
        outbound: false,
        inbound: false,
        force: false,
    };
}

impl Default for CompressionOptions {
    fn default() -> Self {
        CompressionOptions {
            outbound: true,
            inbound: true,
            force: false,
        }
    }
}

/// Immutable per-instance configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Applied when a command does not carry its own timeout.
    pub operation_timeout: Duration,
    /// Overall budget for observe-based durability polling.
    pub durability_timeout: Duration,
    /// Pause between durability observe rounds.
    pub durability_interval: Duration,
    /// Backoff before retrying after NOT_MY_VBUCKET or a temporary failure.
    pub retry_interval: Duration,
    /// Budget for establishing a data connection.
    pub connect_timeout: Duration,
    /// Resolve non-default collections and prefix keys with collection ids.
    pub use_collections: bool,
    /// Snappy policy for values.
    pub compression: CompressionOptions,
    /// Decode mutation tokens from write acknowledgments.
    pub enable_mutation_tokens: bool,
    /// Never guess the next server after NOT_MY_VBUCKET; wait for a new map.
    pub vb_noguess: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            durability_timeout: DEFAULT_DURABILITY_TIMEOUT,
            durability_interval: DEFAULT_DURABILITY_INTERVAL,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            use_collections: false,
            compression: CompressionOptions::default(),
            enable_mutation_tokens: true,
            vb_noguess: false,
        }
    }
}

impl Settings {
    /// Absolute deadline for a command started at `start`.
    ///
    /// An explicit per-command timeout overrides the instance default;
    /// retries never extend the result.
    pub fn deadline(&self, start: Instant, timeout: Option<Duration>) -> Instant {
        start + timeout.unwrap_or(self.operation_timeout)
    }

    /// Absolute deadline for a durability poll started at `start`.
    ///
    /// Unlike command deadlines, an explicit poll timeout always wins so the
    /// caller can shrink the budget below the instance default.
    pub fn durability_deadline(&self, start: Instant, timeout: Option<Duration>) -> Instant {
        start + timeout.unwrap_or(self.durability_timeout)
    }
}
