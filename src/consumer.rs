//! Job consumption: reading owned partitions, decoding envelopes, and
//! driving the user's [`JobHandler`].
//!
//! The consumer never decides which partitions it owns. It snapshots the
//! coordinator's watch view, reads only the partitions assigned to it
//! under that generation, and re-checks the generation before every batch.
//! When a rebalance lands, in-flight partition loops for the old
//! generation exit on their next check and a fresh set is spawned for the
//! new assignment.
//!
//! Delivery is at-least-once: an entry is acked only after the handler
//! returns `Ok`. A handler error leaves the entry pending so the claim
//! engine can redeliver it after the visibility timeout. A payload that
//! does not decode as a [`JobEnvelope`] counts as a failed attempt on the
//! same path; the claim engine dead-letters it once the retry budget runs
//! out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::error::{HandlerError, Result};
use crate::log::{GroupAssignment, LogClient, LogEntry};
use crate::retry;
use crate::types::{EntryId, Job, JobEnvelope, PartitionId};

/// Pause between retries of a partition loop whose read failed even after
/// the broker retry policy.
const READ_FAILURE_BACKOFF: Duration = Duration::from_millis(100);

/// User-supplied job processing logic.
///
/// Handlers must be idempotent where it matters: redelivery after a crash
/// or visibility timeout means the same job can be handled more than once.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: Job) -> std::result::Result<(), HandlerError>;
}

/// Reads and processes jobs from the partitions this process owns.
pub struct Consumer {
    client: Arc<dyn LogClient>,
    config: QueueConfig,
    handler: Arc<dyn JobHandler>,
    view: watch::Receiver<GroupAssignment>,
    cursors: DashMap<PartitionId, EntryId>,
    in_flight: Arc<Semaphore>,
}

impl Consumer {
    pub fn new(
        client: Arc<dyn LogClient>,
        config: QueueConfig,
        handler: Arc<dyn JobHandler>,
        view: watch::Receiver<GroupAssignment>,
    ) -> Self {
        let in_flight = Arc::new(Semaphore::new(config.max_in_flight));
        Self {
            client,
            config,
            handler,
            view,
            cursors: DashMap::new(),
            in_flight,
        }
    }

    /// Read and process one batch from every owned partition.
    ///
    /// Returns the number of entries handled. Exposed for tests and for
    /// callers that drive their own loop; production code uses [`run`].
    ///
    /// [`run`]: Consumer::run
    pub async fn poll_once(&self) -> Result<usize> {
        let snapshot = self.view.borrow().clone();
        let mut handled = 0;
        for partition in snapshot.partitions_for(&self.config.consumer_id) {
            handled += self.poll_partition(partition, snapshot.generation).await?;
        }
        Ok(handled)
    }

    /// Read one batch from `partition`, fenced on `generation`.
    ///
    /// A generation that no longer matches the coordinator's view means a
    /// rebalance landed since the caller snapshotted the assignment; the
    /// batch is skipped rather than read under stale ownership.
    async fn poll_partition(&self, partition: PartitionId, generation: u64) -> Result<usize> {
        {
            let current = self.view.borrow();
            if current.generation != generation
                || current.assignment.get(&partition) != Some(&self.config.consumer_id)
            {
                debug!(
                    %partition,
                    generation,
                    current_generation = current.generation,
                    "Skipping batch read under stale assignment"
                );
                return Ok(0);
            }
        }

        let cursor = self
            .cursors
            .get(&partition)
            .map(|c| *c)
            .unwrap_or(EntryId::ZERO);

        let entries = retry::with_broker_policy(|| {
            self.client.read(
                partition,
                &self.config.consumer_id,
                cursor,
                self.config.poll_batch_size,
                self.config.poll_block_timeout,
            )
        })
        .await?;

        let mut handled = 0;
        for entry in entries {
            let id = entry.id;
            self.process_entry(partition, entry).await?;
            self.cursors
                .entry(partition)
                .and_modify(|c| *c = (*c).max(id))
                .or_insert(id);
            handled += 1;
        }
        Ok(handled)
    }

    /// Decode one entry and run the handler, under the in-flight limit.
    async fn process_entry(&self, partition: PartitionId, entry: LogEntry) -> Result<()> {
        let _permit = self
            .in_flight
            .acquire()
            .await
            .expect("in-flight semaphore closed");

        let envelope: JobEnvelope = match serde_json::from_slice(&entry.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                // Counts as a failed attempt: left pending for the claim
                // path, dead-lettered there once the budget runs out.
                warn!(
                    %partition,
                    entry_id = %entry.id,
                    attempt = entry.attempt,
                    error = %e,
                    "Undecodable payload, leaving entry pending"
                );
                return Ok(());
            }
        };

        let job = Job {
            id: entry.id,
            partition,
            attempt: entry.attempt,
            envelope,
        };
        let job_id = job.envelope.job_id;
        let entry_id = entry.id;

        match self.handler.handle(job).await {
            Ok(()) => {
                retry::with_broker_policy(|| self.client.ack(partition, entry_id)).await?;
                debug!(%partition, %entry_id, %job_id, "Job handled and acked");
            }
            Err(e) => {
                // Left pending: the claim engine redelivers it after the
                // visibility timeout, or dead-letters it once attempts
                // are exhausted.
                warn!(
                    %partition,
                    %entry_id,
                    %job_id,
                    attempt = entry.attempt,
                    error = %e,
                    "Handler failed, leaving entry pending for redelivery"
                );
            }
        }
        Ok(())
    }

    /// Consume until shutdown, respawning partition loops on rebalance.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut view = self.view.clone();
        let mut tasks: JoinSet<()> = JoinSet::new();

        loop {
            let snapshot = view.borrow_and_update().clone();

            // Old-generation loops must be gone before the new ones start,
            // or two loops could read the same partition.
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}

            let owned = snapshot.partitions_for(&self.config.consumer_id);
            info!(
                consumer_id = %self.config.consumer_id,
                generation = snapshot.generation,
                partitions = ?owned,
                "Starting partition loops"
            );
            for partition in owned {
                let consumer = Arc::clone(&self);
                let generation = snapshot.generation;
                tasks.spawn(async move { consumer.partition_loop(partition, generation).await });
            }

            tokio::select! {
                changed = view.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = shutdown.recv() => break,
            }
        }

        tasks.abort_all();
        debug!(consumer_id = %self.config.consumer_id, "Consumer stopped");
    }

    /// Read `partition` until the generation moves on or the task is
    /// aborted.
    async fn partition_loop(&self, partition: PartitionId, generation: u64) {
        loop {
            match self.poll_partition(partition, generation).await {
                Ok(_) => {
                    if self.view.borrow().generation != generation {
                        return;
                    }
                }
                Err(e) if e.is_stale_generation() => return,
                Err(e) => {
                    error!(%partition, error = %e, "Partition read failed, backing off");
                    tokio::time::sleep(READ_FAILURE_BACKOFF).await;
                }
            }
        }
    }
}
