//! In-memory broker for tests and embedded use.
//!
//! Implements the full [`LogClient`] contract in-process: per-partition
//! append logs with pending lists and redelivery queues, plus group
//! metadata (members, generation, assignment) with generation fencing on
//! claims and assignment publication. Cheap to clone via `Arc`; every
//! clone shares the same state, so a test can run several consumer
//! processes against one broker.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, Notify};

use crate::error::{Error, Result};
use crate::types::{EntryId, PartitionId, unix_ms_now};

use super::{GroupAssignment, LogClient, LogEntry, PendingEntry};

#[derive(Debug, Default)]
struct PendingState {
    owner: String,
    delivered_at_ms: u64,
    attempts: u32,
}

#[derive(Debug, Default)]
struct PartitionState {
    /// Append log: (id, payload), id strictly increasing.
    entries: Vec<(EntryId, Bytes)>,
    next_id: u64,
    /// Delivered-but-unacked entries.
    pending: HashMap<EntryId, PendingState>,
    /// Claimed entries awaiting redelivery through `read`.
    redeliver: VecDeque<EntryId>,
    /// Highest id ever delivered to the group; `read` never hands out an
    /// entry at or below this twice (acked entries stay consumed after a
    /// partition changes owners).
    delivered_to: EntryId,
}

impl PartitionState {
    fn payload_of(&self, id: EntryId) -> Option<Bytes> {
        self.entries
            .iter()
            .find(|(entry_id, _)| *entry_id == id)
            .map(|(_, payload)| payload.clone())
    }
}

#[derive(Debug, Default)]
struct GroupMeta {
    /// Member id to last heartbeat, unix milliseconds.
    members: HashMap<String, u64>,
    published: GroupAssignment,
}

/// In-process [`LogClient`] implementation.
#[derive(Debug, Default)]
pub struct InMemoryLog {
    partitions: Mutex<HashMap<PartitionId, PartitionState>>,
    groups: Mutex<HashMap<String, GroupMeta>>,
    /// Signalled on append and claim so blocked readers wake up.
    appended: Notify,
}

impl InMemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries in a partition's log (acked entries included).
    pub async fn entry_count(&self, partition: PartitionId) -> usize {
        self.partitions
            .lock()
            .await
            .get(&partition)
            .map(|p| p.entries.len())
            .unwrap_or(0)
    }

    /// Number of delivered-but-unacked entries in a partition.
    pub async fn pending_count(&self, partition: PartitionId) -> usize {
        self.partitions
            .lock()
            .await
            .get(&partition)
            .map(|p| p.pending.len())
            .unwrap_or(0)
    }

    /// Raw contents of a partition's log, oldest first.
    pub async fn entries(&self, partition: PartitionId) -> Vec<(EntryId, Bytes)> {
        self.partitions
            .lock()
            .await
            .get(&partition)
            .map(|p| p.entries.clone())
            .unwrap_or_default()
    }

    fn fence(meta: &GroupMeta, generation: u64) -> Result<()> {
        if generation != meta.published.generation {
            return Err(Error::StaleGeneration {
                requested: generation,
                current: meta.published.generation,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl LogClient for InMemoryLog {
    async fn append(&self, partition: PartitionId, payload: Bytes) -> Result<EntryId> {
        let mut partitions = self.partitions.lock().await;
        let state = partitions.entry(partition).or_default();
        state.next_id += 1;
        let id = EntryId(state.next_id);
        state.entries.push((id, payload));
        drop(partitions);

        self.appended.notify_waiters();
        Ok(id)
    }

    async fn read(
        &self,
        partition: PartitionId,
        consumer: &str,
        after: EntryId,
        max_count: usize,
        block_timeout: Duration,
    ) -> Result<Vec<LogEntry>> {
        let deadline = tokio::time::Instant::now() + block_timeout;

        loop {
            // Register for wakeups before checking state, otherwise an
            // append between the check and the wait is lost.
            let mut notified = std::pin::pin!(self.appended.notified());
            notified.as_mut().enable();

            let mut out = Vec::new();
            {
                let mut partitions = self.partitions.lock().await;
                let state = partitions.entry(partition).or_default();
                let now = unix_ms_now();

                // Redeliveries of claimed entries first.
                while out.len() < max_count {
                    let Some(id) = state.redeliver.pop_front() else {
                        break;
                    };
                    // Acked while queued (e.g. dead-lettered): skip.
                    let Some(payload) = state.payload_of(id) else {
                        continue;
                    };
                    let Some(pending) = state.pending.get_mut(&id) else {
                        continue;
                    };
                    pending.owner = consumer.to_string();
                    pending.delivered_at_ms = now;
                    out.push(LogEntry {
                        id,
                        payload,
                        attempt: pending.attempts,
                    });
                }

                // Then entries the group has never seen.
                let cursor = after.max(state.delivered_to);
                let fresh: Vec<(EntryId, Bytes)> = state
                    .entries
                    .iter()
                    .filter(|(id, _)| *id > cursor)
                    .take(max_count - out.len())
                    .cloned()
                    .collect();
                for (id, payload) in fresh {
                    state.pending.insert(
                        id,
                        PendingState {
                            owner: consumer.to_string(),
                            delivered_at_ms: now,
                            attempts: 1,
                        },
                    );
                    state.delivered_to = state.delivered_to.max(id);
                    out.push(LogEntry {
                        id,
                        payload,
                        attempt: 1,
                    });
                }
            }

            if !out.is_empty() {
                return Ok(out);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, partition: PartitionId, entry: EntryId) -> Result<()> {
        let mut partitions = self.partitions.lock().await;
        let state = partitions
            .get_mut(&partition)
            .ok_or(Error::UnknownPartition(partition))?;
        state.pending.remove(&entry);
        Ok(())
    }

    async fn list_pending(
        &self,
        partition: PartitionId,
        older_than: Duration,
    ) -> Result<Vec<PendingEntry>> {
        let partitions = self.partitions.lock().await;
        let Some(state) = partitions.get(&partition) else {
            return Ok(Vec::new());
        };
        let now = unix_ms_now();
        let threshold = older_than.as_millis() as u64;

        let mut expired: Vec<PendingEntry> = state
            .pending
            .iter()
            .filter(|(_, pending)| now.saturating_sub(pending.delivered_at_ms) >= threshold)
            .map(|(id, pending)| PendingEntry {
                id: *id,
                owner: pending.owner.clone(),
                delivered_at_ms: pending.delivered_at_ms,
                attempts: pending.attempts,
            })
            .collect();
        expired.sort_by_key(|e| e.id);
        Ok(expired)
    }

    async fn claim(
        &self,
        group: &str,
        partition: PartitionId,
        entries: &[EntryId],
        new_owner: &str,
        generation: u64,
    ) -> Result<Vec<LogEntry>> {
        // The fence must still hold while the pending list is mutated, so
        // the groups lock stays held across the mutation. Lock order is
        // groups then partitions; no other path acquires them in reverse.
        let groups = self.groups.lock().await;
        let meta = groups.get(group).ok_or_else(|| Error::StaleGeneration {
            requested: generation,
            current: 0,
        })?;
        Self::fence(meta, generation)?;

        let mut claimed = Vec::new();
        let mut partitions = self.partitions.lock().await;
        let state = partitions
            .get_mut(&partition)
            .ok_or(Error::UnknownPartition(partition))?;
        let now = unix_ms_now();

        for id in entries {
            let Some(payload) = state.payload_of(*id) else {
                continue;
            };
            let Some(pending) = state.pending.get_mut(id) else {
                continue;
            };
            pending.owner = new_owner.to_string();
            pending.delivered_at_ms = now;
            pending.attempts += 1;
            state.redeliver.push_back(*id);
            claimed.push(LogEntry {
                id: *id,
                payload,
                attempt: pending.attempts,
            });
        }
        drop(partitions);
        drop(groups);

        self.appended.notify_waiters();
        Ok(claimed)
    }

    async fn write_heartbeat(&self, group: &str, consumer: &str, at_ms: u64) -> Result<()> {
        let mut groups = self.groups.lock().await;
        let meta = groups.entry(group.to_string()).or_default();
        meta.members.insert(consumer.to_string(), at_ms);
        Ok(())
    }

    async fn read_members(&self, group: &str) -> Result<HashMap<String, u64>> {
        let groups = self.groups.lock().await;
        Ok(groups
            .get(group)
            .map(|meta| meta.members.clone())
            .unwrap_or_default())
    }

    async fn remove_member(&self, group: &str, consumer: &str) -> Result<()> {
        let mut groups = self.groups.lock().await;
        if let Some(meta) = groups.get_mut(group) {
            meta.members.remove(consumer);
        }
        Ok(())
    }

    async fn publish_assignment(
        &self,
        group: &str,
        generation: u64,
        members: &BTreeSet<String>,
        assignment: &HashMap<PartitionId, String>,
    ) -> Result<()> {
        let mut groups = self.groups.lock().await;
        let meta = groups.entry(group.to_string()).or_default();

        if generation <= meta.published.generation {
            return Err(Error::StaleGeneration {
                requested: generation,
                current: meta.published.generation,
            });
        }

        meta.published = GroupAssignment {
            generation,
            members: members.clone(),
            assignment: assignment.clone(),
        };
        Ok(())
    }

    async fn read_assignment(&self, group: &str) -> Result<GroupAssignment> {
        let groups = self.groups.lock().await;
        Ok(groups
            .get(group)
            .map(|meta| meta.published.clone())
            .unwrap_or_default())
    }

    async fn trim(&self, partition: PartitionId, max_len: usize) -> Result<()> {
        let mut partitions = self.partitions.lock().await;
        let Some(state) = partitions.get_mut(&partition) else {
            return Ok(());
        };
        if state.entries.len() > max_len {
            let drop_count = state.entries.len() - max_len;
            // Pending records of trimmed entries can never be redelivered
            // or acked; clear them so list_pending stops reporting them.
            for (id, _) in state.entries.drain(..drop_count) {
                state.pending.remove(&id);
            }
            let pending = &state.pending;
            state.redeliver.retain(|id| pending.contains_key(id));
        }
        Ok(())
    }
}
