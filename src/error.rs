//! Crate-level errors.
//!
//! The queue distinguishes three failure classes, and they travel on
//! different paths:
//!
//! - **Transient broker errors** ([`Error::Broker`], [`Error::Timeout`]):
//!   retried with exponential backoff (see [`crate::retry`]); fatal to the
//!   affected task once retries are exhausted.
//! - **Fencing rejections** ([`Error::StaleGeneration`]): not failures at
//!   all. The caller re-fetches the current assignment and resumes under the
//!   new generation.
//! - **Handler failures** ([`HandlerError`]): never propagate through this
//!   enum. A failed handler leaves its entry un-acked, and the claim engine
//!   picks it up after the visibility timeout.

use thiserror::Error as ThisError;

use crate::types::PartitionId;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the queue core and the log client boundary.
#[derive(Debug, ThisError)]
pub enum Error {
    /// The broker is unreachable or returned a connection-level failure.
    /// Transient; retried with backoff.
    #[error("broker unavailable: {0}")]
    Broker(String),

    /// A broker request timed out. Transient; retried with backoff.
    #[error("broker request timed out: {0}")]
    Timeout(String),

    /// An operation was issued under a generation older than the group's
    /// current one and was fenced off by the broker.
    ///
    /// This is control flow, not a fault: the holder of a stale generation
    /// must re-read the assignment before touching any partition again.
    #[error("stale generation: operation issued at {requested}, group is at {current}")]
    StaleGeneration { requested: u64, current: u64 },

    /// The referenced partition does not exist on the broker.
    #[error("unknown partition {0}")]
    UnknownPartition(PartitionId),

    /// A log entry or group metadata record could not be decoded.
    #[error("decode failed: {0}")]
    Decode(#[from] serde_json::Error),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether the operation may succeed if retried after a backoff.
    ///
    /// Only broker connectivity failures qualify. Stale-generation
    /// rejections are excluded on purpose: retrying them without re-reading
    /// the assignment would spin forever.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::Broker(_) | Error::Timeout(_))
    }

    /// Whether this is a fencing rejection.
    pub fn is_stale_generation(&self) -> bool {
        matches!(self, Error::StaleGeneration { .. })
    }
}

/// Failure returned by a job handler.
///
/// Handlers signal failure with a reason; the queue leaves the entry
/// un-acked so the claim engine retries it after the visibility timeout.
/// Coordination-layer errors are never surfaced through this type.
#[derive(Debug, ThisError)]
#[error("job handler failed: {reason}")]
pub struct HandlerError {
    pub reason: String,
}

impl HandlerError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}
