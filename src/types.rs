//! Core identifiers and job data model.
//!
//! Jobs travel through the system in two shapes:
//!
//! - [`JobEnvelope`]: the serialized wire form a producer appends to a
//!   partition log (JSON encoded).
//! - [`Job`]: the decoded form handed to a handler, enriched with the
//!   log-assigned [`EntryId`], the partition it came from, and the current
//!   delivery attempt.
//!
//! Jobs that exhaust their retry budget are wrapped in a [`DeadLetterEntry`]
//! and appended to the group's dead-letter partition, where they are never
//! reclaimed automatically.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a partition within the job stream.
///
/// Data partitions are numbered `0..partition_count`. The reserved
/// [`PartitionId::DEAD_LETTER`] sentinel addresses the dead-letter partition
/// and never overlaps the data range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionId(pub u32);

impl PartitionId {
    /// Reserved partition id for dead-lettered jobs.
    pub const DEAD_LETTER: PartitionId = PartitionId(u32::MAX);
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == PartitionId::DEAD_LETTER {
            write!(f, "dead-letter")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Broker-assigned identifier of an appended entry.
///
/// Entry ids are monotonically increasing within a partition; they double as
/// read cursors (`read entries after id X`).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct EntryId(pub u64);

impl EntryId {
    /// Cursor positioned before the first entry of a partition.
    pub const ZERO: EntryId = EntryId(0);
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    /// Appended to a partition log, not yet delivered.
    Pending,
    /// Delivered to a consumer, awaiting acknowledgement.
    InFlight,
    /// Acknowledged by a handler; the pending record is cleared.
    Acked,
    /// Retry budget exhausted; routed to the dead-letter partition.
    DeadLettered,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::InFlight => write!(f, "in-flight"),
            JobStatus::Acked => write!(f, "acked"),
            JobStatus::DeadLettered => write!(f, "dead-lettered"),
        }
    }
}

/// Serialized wire form of a job.
///
/// This is the JSON document a [`Producer`](crate::producer::Producer) appends
/// to a partition log. Payload contents are opaque to the queue; schema
/// validation belongs to the job handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    /// Producer-assigned unique job id.
    pub job_id: Uuid,

    /// Opaque job payload.
    pub payload: serde_json::Value,

    /// Routing key used for partition selection, if any.
    ///
    /// Jobs sharing a routing key land on the same partition and are
    /// therefore processed in enqueue order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_key: Option<String>,

    /// Wall-clock enqueue time in unix milliseconds.
    pub enqueued_at_ms: u64,
}

impl JobEnvelope {
    /// Create an envelope with a fresh job id stamped at the current time.
    pub fn new(payload: serde_json::Value, routing_key: Option<String>) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            payload,
            routing_key,
            enqueued_at_ms: unix_ms_now(),
        }
    }
}

/// A decoded job as delivered to a [`JobHandler`](crate::consumer::JobHandler).
#[derive(Debug, Clone)]
pub struct Job {
    /// Log-assigned entry id (offset within the partition).
    pub id: EntryId,

    /// Partition the job was read from.
    pub partition: PartitionId,

    /// Decoded envelope.
    pub envelope: JobEnvelope,

    /// Delivery attempt, starting at 1 for the first delivery and
    /// incremented on every reclaim.
    pub attempt: u32,
}

/// Terminal record for a job that exhausted its retry budget.
///
/// Appended (JSON encoded) to the dead-letter partition by the claim engine.
/// The original payload is carried verbatim so operators can inspect or
/// re-enqueue it manually; nothing reclaims these automatically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Partition the job lived on.
    pub partition: PartitionId,

    /// Entry id of the original job.
    pub entry_id: EntryId,

    /// Raw bytes of the original log entry.
    pub payload: Vec<u8>,

    /// Why the job was dead-lettered.
    pub reason: String,

    /// Final attempt count at the time of dead-lettering.
    pub attempts: u32,

    /// Wall-clock dead-letter time in unix milliseconds.
    pub dead_lettered_at_ms: u64,
}

/// Current wall-clock time in unix milliseconds.
///
/// Heartbeats and pending-entry timestamps are stored in this form so every
/// process in the group compares against the same broker-visible scale.
pub fn unix_ms_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
