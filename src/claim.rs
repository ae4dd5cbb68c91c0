//! Reclaiming stalled deliveries and dead-lettering exhausted jobs.
//!
//! Every consumer runs one [`ClaimEngine`] over the partitions it owns.
//! On each scan it lists pending entries idle past the visibility timeout
//! (deliveries whose consumer crashed, stalled, or lost its partitions)
//! and claims them under the current generation. The broker's fencing
//! makes the claim safe: a scan running on a stale view is rejected
//! wholesale instead of stealing entries from the rightful owner.
//!
//! A claim increments the delivery attempt. Entries still within their
//! retry budget go back through the normal read path; entries past it are
//! recorded in the dead-letter partition and acked so they stop consuming
//! delivery capacity. Timed-out deliveries from this consumer itself are
//! reclaimed the same way, which is what makes delivery at-least-once
//! rather than at-most-once.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::error::Result;
use crate::log::{GroupAssignment, LogClient, LogEntry};
use crate::retry;
use crate::types::{unix_ms_now, DeadLetterEntry, EntryId, PartitionId};

/// Outcome of one claim scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClaimStats {
    /// Entries reclaimed and requeued for redelivery.
    pub reclaimed: usize,

    /// Entries moved to the dead-letter partition.
    pub dead_lettered: usize,
}

/// Scans owned partitions for stalled deliveries.
pub struct ClaimEngine {
    client: Arc<dyn LogClient>,
    config: QueueConfig,
    view: watch::Receiver<GroupAssignment>,
}

impl ClaimEngine {
    pub fn new(
        client: Arc<dyn LogClient>,
        config: QueueConfig,
        view: watch::Receiver<GroupAssignment>,
    ) -> Self {
        Self {
            client,
            config,
            view,
        }
    }

    /// Scan every owned partition once.
    ///
    /// A stale-generation rejection is not an error: the batch is dropped
    /// and the next scan runs under the fresher view.
    pub async fn scan_once(&self) -> Result<ClaimStats> {
        let snapshot = self.view.borrow().clone();
        if snapshot.generation == 0 {
            return Ok(ClaimStats::default());
        }

        let mut stats = ClaimStats::default();
        for partition in snapshot.partitions_for(&self.config.consumer_id) {
            match self.scan_partition(partition, snapshot.generation).await {
                Ok(partition_stats) => {
                    stats.reclaimed += partition_stats.reclaimed;
                    stats.dead_lettered += partition_stats.dead_lettered;
                }
                Err(e) if e.is_stale_generation() => {
                    debug!(
                        %partition,
                        generation = snapshot.generation,
                        error = %e,
                        "Claim fenced by newer generation, dropping batch"
                    );
                    return Ok(stats);
                }
                Err(e) => return Err(e),
            }
        }

        if stats != ClaimStats::default() {
            info!(
                consumer_id = %self.config.consumer_id,
                reclaimed = stats.reclaimed,
                dead_lettered = stats.dead_lettered,
                "Claim scan reassigned stalled deliveries"
            );
        }
        Ok(stats)
    }

    async fn scan_partition(&self, partition: PartitionId, generation: u64) -> Result<ClaimStats> {
        let stalled = retry::with_broker_policy(|| {
            self.client
                .list_pending(partition, self.config.visibility_timeout)
        })
        .await?;
        if stalled.is_empty() {
            return Ok(ClaimStats::default());
        }

        let ids: Vec<EntryId> = stalled.iter().map(|pending| pending.id).collect();
        debug!(
            %partition,
            count = ids.len(),
            generation,
            "Claiming entries idle past the visibility timeout"
        );

        // Not routed through the retry policy: a stale-generation error
        // must surface immediately, and a transient failure just waits for
        // the next scan instead of re-running a possibly-stale claim.
        let claimed = self
            .client
            .claim(
                &self.config.group,
                partition,
                &ids,
                &self.config.consumer_id,
                generation,
            )
            .await?;

        let mut stats = ClaimStats::default();
        for entry in claimed {
            if entry.attempt > self.config.max_attempts {
                self.dead_letter(partition, &entry).await?;
                stats.dead_lettered += 1;
            } else {
                stats.reclaimed += 1;
            }
        }
        Ok(stats)
    }

    /// Record an exhausted entry in the dead-letter partition and ack the
    /// original so it never comes back.
    async fn dead_letter(&self, partition: PartitionId, entry: &LogEntry) -> Result<()> {
        warn!(
            %partition,
            entry_id = %entry.id,
            attempts = entry.attempt,
            max_attempts = self.config.max_attempts,
            "Retry budget exhausted, dead-lettering entry"
        );
        let record = DeadLetterEntry {
            partition,
            entry_id: entry.id,
            payload: entry.payload.to_vec(),
            reason: format!(
                "exceeded max delivery attempts ({})",
                self.config.max_attempts
            ),
            attempts: entry.attempt,
            dead_lettered_at_ms: unix_ms_now(),
        };
        let payload = serde_json::to_vec(&record)?;
        let dlq = self.config.dead_letter_partition;
        retry::with_broker_policy(|| self.client.append(dlq, payload.clone().into())).await?;
        retry::with_broker_policy(|| self.client.ack(partition, entry.id)).await?;
        Ok(())
    }

    /// Scan on the configured interval until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut tick = tokio::time::interval(self.config.claim_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.scan_once().await {
                        // Scans are independent; a failed one is retried by
                        // the next tick rather than killing the task.
                        error!(
                            consumer_id = %self.config.consumer_id,
                            error = %e,
                            "Claim scan failed"
                        );
                    }
                }
                _ = shutdown.recv() => {
                    debug!(consumer_id = %self.config.consumer_id, "Claim engine received shutdown signal");
                    return;
                }
            }
        }
    }
}
