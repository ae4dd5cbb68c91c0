//! Job production: partition routing and envelope appends.
//!
//! A producer is group-agnostic. It stamps each payload into a
//! [`JobEnvelope`], routes it to a data partition, and appends the JSON
//! encoding to that partition's log. Routing is deterministic for a given
//! routing key (hash modulo partition count), so jobs sharing a key land
//! on one partition and are processed in enqueue order; keyless jobs
//! spread round-robin.
//!
//! An optional per-partition length cap trims the oldest entries after
//! each append, bounding broker memory on streams whose history nobody
//! replays.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::log::LogClient;
use crate::retry;
use crate::types::{EntryId, JobEnvelope, PartitionId};

/// Appends jobs to the partition logs.
pub struct Producer {
    client: Arc<dyn LogClient>,
    partition_count: AtomicU32,
    dead_letter_partition: PartitionId,
    round_robin: AtomicU32,
    max_partition_len: Option<usize>,
}

impl Producer {
    pub fn new(client: Arc<dyn LogClient>, config: &QueueConfig) -> Result<Self> {
        if config.partitions == 0 {
            return Err(Error::Config(
                "producer requires at least one data partition".to_string(),
            ));
        }
        Ok(Self {
            client,
            partition_count: AtomicU32::new(config.partitions),
            dead_letter_partition: config.dead_letter_partition,
            round_robin: AtomicU32::new(0),
            max_partition_len: None,
        })
    }

    /// Cap each partition's log at `max_len` entries, trimming the oldest
    /// after every append.
    pub fn with_max_partition_len(mut self, max_len: usize) -> Self {
        self.max_partition_len = Some(max_len);
        self
    }

    /// Grow the routable partition range to at least `count`.
    ///
    /// Grow-only: a `count` at or below the current range is a no-op, so
    /// concurrent callers settle on the largest request. Consumer groups
    /// pick up the wider range through their own partition configuration;
    /// jobs with a routing key may map to a different partition after a
    /// grow, which reshuffles ordering between old and new entries of the
    /// same key.
    pub fn ensure_partitions(&self, count: u32) -> Result<()> {
        if count > self.dead_letter_partition.0 {
            return Err(Error::Config(format!(
                "partition count {count} collides with dead-letter partition {}",
                self.dead_letter_partition
            )));
        }
        let previous = self.partition_count.fetch_max(count, Ordering::Relaxed);
        if count > previous {
            tracing::info!(from = previous, to = count, "Grew producer partition range");
        }
        Ok(())
    }

    /// Enqueue one job, returning the partition and entry id it landed on.
    ///
    /// Jobs with the same routing key are appended to the same partition.
    pub async fn enqueue(
        &self,
        payload: serde_json::Value,
        routing_key: Option<String>,
    ) -> Result<(PartitionId, EntryId)> {
        let envelope = JobEnvelope::new(payload, routing_key);
        self.append_envelope(&envelope).await
    }

    /// Enqueue a batch in order, returning where each job landed.
    ///
    /// Jobs are appended one by one; a failure mid-batch leaves the
    /// earlier appends in place, and the error reports nothing about them.
    /// Callers needing exactness should enqueue individually.
    pub async fn enqueue_batch(
        &self,
        jobs: Vec<(serde_json::Value, Option<String>)>,
    ) -> Result<Vec<(PartitionId, EntryId)>> {
        let mut placed = Vec::with_capacity(jobs.len());
        for (payload, routing_key) in jobs {
            placed.push(self.enqueue(payload, routing_key).await?);
        }
        Ok(placed)
    }

    async fn append_envelope(&self, envelope: &JobEnvelope) -> Result<(PartitionId, EntryId)> {
        let partition = self.partition_for(envelope.routing_key.as_deref());
        let payload = serde_json::to_vec(envelope)?;

        let id =
            retry::with_broker_policy(|| self.client.append(partition, payload.clone().into()))
                .await?;
        debug!(
            %partition,
            entry_id = %id,
            job_id = %envelope.job_id,
            "Enqueued job"
        );

        if let Some(max_len) = self.max_partition_len {
            retry::with_broker_policy(|| self.client.trim(partition, max_len)).await?;
        }
        Ok((partition, id))
    }

    fn partition_for(&self, routing_key: Option<&str>) -> PartitionId {
        let count = self.partition_count.load(Ordering::Relaxed) as u64;
        match routing_key {
            Some(key) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                PartitionId((hasher.finish() % count) as u32)
            }
            None => {
                let next = self.round_robin.fetch_add(1, Ordering::Relaxed);
                PartitionId((next as u64 % count) as u32)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::InMemoryLog;
    use std::collections::HashMap;

    fn producer_over(partitions: u32) -> (Arc<InMemoryLog>, Producer) {
        let log = Arc::new(InMemoryLog::new());
        let mut config = QueueConfig::new("orders", "p1");
        config.partitions = partitions;
        let producer = Producer::new(log.clone(), &config).unwrap();
        (log, producer)
    }

    #[tokio::test]
    async fn test_same_routing_key_lands_on_one_partition() {
        let (_, producer) = producer_over(4);

        let mut seen = Vec::new();
        for _ in 0..10 {
            let (partition, _) = producer
                .enqueue(serde_json::json!({"n": 1}), Some("user-42".to_string()))
                .await
                .unwrap();
            seen.push(partition);
        }
        assert!(seen.iter().all(|p| *p == seen[0]));
    }

    #[tokio::test]
    async fn test_keyless_jobs_spread_round_robin() {
        let (_, producer) = producer_over(3);

        let mut counts: HashMap<PartitionId, usize> = HashMap::new();
        for _ in 0..6 {
            let (partition, _) = producer
                .enqueue(serde_json::json!(null), None)
                .await
                .unwrap();
            *counts.entry(partition).or_default() += 1;
        }
        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|&n| n == 2));
    }

    #[tokio::test]
    async fn test_appended_payload_is_a_decodable_envelope() {
        let (log, producer) = producer_over(1);

        let (partition, id) = producer
            .enqueue(
                serde_json::json!({"to": "user@example.com"}),
                Some("user@example.com".to_string()),
            )
            .await
            .unwrap();

        let entries = log.entries(partition).await;
        assert_eq!(entries[0].0, id);
        let envelope: JobEnvelope = serde_json::from_slice(&entries[0].1).unwrap();
        assert_eq!(envelope.payload, serde_json::json!({"to": "user@example.com"}));
        assert_eq!(envelope.routing_key.as_deref(), Some("user@example.com"));
        assert!(envelope.enqueued_at_ms > 0);
    }

    #[tokio::test]
    async fn test_batch_preserves_per_key_order() {
        let (log, producer) = producer_over(2);

        let jobs = (0..4)
            .map(|n| (serde_json::json!({"seq": n}), Some("key".to_string())))
            .collect();
        let placed = producer.enqueue_batch(jobs).await.unwrap();

        assert_eq!(placed.len(), 4);
        let partition = placed[0].0;
        assert!(placed.iter().all(|(p, _)| *p == partition));

        // Entry ids increase in enqueue order within the partition.
        let entries = log.entries(partition).await;
        let seqs: Vec<u64> = entries
            .iter()
            .map(|(_, payload)| {
                let envelope: JobEnvelope = serde_json::from_slice(payload).unwrap();
                envelope.payload["seq"].as_u64().unwrap()
            })
            .collect();
        assert_eq!(seqs, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_max_partition_len_trims_after_append() {
        let (log, producer) = producer_over(1);
        let producer = producer.with_max_partition_len(2);

        for n in 0..5 {
            producer
                .enqueue(serde_json::json!({"n": n}), None)
                .await
                .unwrap();
        }
        assert_eq!(log.entry_count(PartitionId(0)).await, 2);
    }

    #[tokio::test]
    async fn test_ensure_partitions_grows_the_routing_range() {
        let (_, producer) = producer_over(1);
        producer.ensure_partitions(3).unwrap();

        let mut seen: HashMap<PartitionId, usize> = HashMap::new();
        for _ in 0..6 {
            let (partition, _) = producer
                .enqueue(serde_json::json!(null), None)
                .await
                .unwrap();
            *seen.entry(partition).or_default() += 1;
        }
        assert_eq!(seen.len(), 3);
    }

    #[tokio::test]
    async fn test_ensure_partitions_never_shrinks() {
        let (_, producer) = producer_over(4);
        producer.ensure_partitions(2).unwrap();

        let mut seen: HashMap<PartitionId, usize> = HashMap::new();
        for _ in 0..8 {
            let (partition, _) = producer
                .enqueue(serde_json::json!(null), None)
                .await
                .unwrap();
            *seen.entry(partition).or_default() += 1;
        }
        assert_eq!(seen.len(), 4);
    }

    #[tokio::test]
    async fn test_ensure_partitions_rejects_dead_letter_collision() {
        let log = Arc::new(InMemoryLog::new());
        let mut config = QueueConfig::new("orders", "p1");
        config.partitions = 2;
        config.dead_letter_partition = PartitionId(4);
        let producer = Producer::new(log, &config).unwrap();

        assert!(producer.ensure_partitions(5).is_err());
        producer.ensure_partitions(4).unwrap();
    }

    #[tokio::test]
    async fn test_zero_partitions_is_rejected() {
        let log = Arc::new(InMemoryLog::new());
        let mut config = QueueConfig::new("orders", "p1");
        config.partitions = 0;
        assert!(Producer::new(log, &config).is_err());
    }
}
