//! Log client interface to the partition-log broker.
//!
//! The coordination core is broker-agnostic: everything it needs from the
//! underlying append-log store is expressed by the [`LogClient`] trait,
//! namely append, cursor reads, acknowledgement, pending-entry listing,
//! fenced claims, and the group-metadata operations (heartbeats,
//! membership, assignment publication). A Redis-Streams deployment maps these onto
//! stream commands; [`InMemoryLog`] implements them in-process for tests
//! and embedded use.
//!
//! # Fencing
//!
//! `claim` and `publish_assignment` carry the caller's generation and are
//! rejected by the broker when that generation is stale. This is the only
//! cross-process mutual exclusion in the system: no client-side locks
//! guard the pending lists, the broker's generation check does.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::types::{EntryId, PartitionId};

mod memory;

pub use memory::InMemoryLog;

/// An entry delivered from a partition log.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Log-assigned id (offset within the partition).
    pub id: EntryId,

    /// Raw entry payload.
    pub payload: Bytes,

    /// Delivery attempt this entry is on: 1 for the first delivery,
    /// incremented by every claim.
    pub attempt: u32,
}

/// A delivered-but-unacknowledged entry, as reported by `list_pending`.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub id: EntryId,

    /// Consumer the entry is currently assigned to.
    pub owner: String,

    /// When the entry was last delivered or claimed, unix milliseconds.
    pub delivered_at_ms: u64,

    /// Delivery attempts so far.
    pub attempts: u32,
}

/// The published coordination state of a consumer group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupAssignment {
    /// Monotonic generation counter; 0 means nothing published yet.
    pub generation: u64,

    /// Member set the assignment was computed from.
    pub members: BTreeSet<String>,

    /// Partition ownership under this generation.
    pub assignment: HashMap<PartitionId, String>,
}

impl GroupAssignment {
    /// Partitions owned by `consumer` under this assignment, in order.
    pub fn partitions_for(&self, consumer: &str) -> Vec<PartitionId> {
        let mut owned: Vec<PartitionId> = self
            .assignment
            .iter()
            .filter(|(_, owner)| owner.as_str() == consumer)
            .map(|(partition, _)| *partition)
            .collect();
        owned.sort();
        owned
    }
}

/// Interface to the broker's partition logs and group metadata.
///
/// All operations are atomic from the caller's perspective; implementations
/// back them with whatever primitives the broker provides (stream consumer
/// groups, compare-and-swap metadata writes, ...).
#[async_trait]
pub trait LogClient: Send + Sync {
    /// Append a payload to a partition, returning its log-assigned id.
    async fn append(&self, partition: PartitionId, payload: Bytes) -> Result<EntryId>;

    /// Read up to `max_count` entries for `consumer`.
    ///
    /// Reclaimed entries queued for redelivery come first, then entries the
    /// group has never seen beyond both `after` and the group's delivery
    /// watermark. Every returned entry is recorded in the partition's
    /// pending list under `consumer`. Blocks up to `block_timeout` when no
    /// entry is available, then returns empty.
    async fn read(
        &self,
        partition: PartitionId,
        consumer: &str,
        after: EntryId,
        max_count: usize,
        block_timeout: Duration,
    ) -> Result<Vec<LogEntry>>;

    /// Acknowledge an entry, clearing its pending record.
    ///
    /// The log itself is never mutated by acks; only `trim` removes data.
    async fn ack(&self, partition: PartitionId, entry: EntryId) -> Result<()>;

    /// List pending entries idle for at least `older_than`, ordered by id.
    async fn list_pending(
        &self,
        partition: PartitionId,
        older_than: Duration,
    ) -> Result<Vec<PendingEntry>>;

    /// Atomically reassign pending entries to `new_owner`, incrementing
    /// their attempt counts and scheduling them for redelivery.
    ///
    /// Fails with [`Error::StaleGeneration`](crate::error::Error) unless
    /// `generation` matches the group's current generation; a zombie
    /// consumer can therefore never reclaim partitions it no longer owns.
    /// Ids with no pending record are skipped.
    async fn claim(
        &self,
        group: &str,
        partition: PartitionId,
        entries: &[EntryId],
        new_owner: &str,
        generation: u64,
    ) -> Result<Vec<LogEntry>>;

    /// Record a member heartbeat at the given unix-millisecond timestamp.
    async fn write_heartbeat(&self, group: &str, consumer: &str, at_ms: u64) -> Result<()>;

    /// Read the group's member registry: consumer id to last heartbeat.
    async fn read_members(&self, group: &str) -> Result<HashMap<String, u64>>;

    /// Remove a member from the registry (graceful leave, or pruning an
    /// expired member).
    async fn remove_member(&self, group: &str, consumer: &str) -> Result<()>;

    /// Publish a new assignment atomically with its generation.
    ///
    /// Fails with `StaleGeneration` unless `generation` advances past the
    /// currently published one, so concurrent rebalances resolve to a
    /// single winner.
    async fn publish_assignment(
        &self,
        group: &str,
        generation: u64,
        members: &BTreeSet<String>,
        assignment: &HashMap<PartitionId, String>,
    ) -> Result<()>;

    /// Read the currently published assignment (generation 0 when none).
    async fn read_assignment(&self, group: &str) -> Result<GroupAssignment>;

    /// Drop the oldest entries of a partition down to `max_len`.
    async fn trim(&self, partition: PartitionId, max_len: usize) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partitions_for_filters_and_sorts() {
        let mut assignment = HashMap::new();
        assignment.insert(PartitionId(2), "c1".to_string());
        assignment.insert(PartitionId(0), "c1".to_string());
        assignment.insert(PartitionId(1), "c2".to_string());

        let published = GroupAssignment {
            generation: 3,
            members: BTreeSet::from(["c1".to_string(), "c2".to_string()]),
            assignment,
        };

        assert_eq!(
            published.partitions_for("c1"),
            vec![PartitionId(0), PartitionId(2)]
        );
        assert_eq!(published.partitions_for("c2"), vec![PartitionId(1)]);
        assert!(published.partitions_for("c3").is_empty());
    }

    #[test]
    fn test_default_assignment_is_empty_at_generation_zero() {
        let published = GroupAssignment::default();
        assert_eq!(published.generation, 0);
        assert!(published.members.is_empty());
        assert!(published.assignment.is_empty());
    }
}
