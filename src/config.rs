//! Queue configuration.
//!
//! One [`QueueConfig`] describes everything a process needs to participate
//! in a consumer group: identity, timing, and retry limits. Defaults are
//! safe for local development; production deployments usually tighten the
//! heartbeat interval and visibility timeout together.
//!
//! ```rust
//! use conveyor::config::QueueConfig;
//!
//! let mut config = QueueConfig::new("email_group", "consumer-1");
//! config.partitions = 4;
//! config.validate().expect("valid config");
//! ```

use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::PartitionId;

/// Configuration for one consumer-group participant.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Consumer group name.
    pub group: String,

    /// This process's consumer id. Must be unique within the group;
    /// membership and partition assignment key off it.
    pub consumer_id: String,

    /// Number of data partitions in the job stream.
    pub partitions: u32,

    /// How often this consumer writes its heartbeat.
    /// Default: 1s
    pub heartbeat_interval: Duration,

    /// How long a member may go without a heartbeat before it is declared
    /// dead and its partitions are reassigned.
    ///
    /// Should be at least 3x the heartbeat interval to tolerate jitter;
    /// [`validate`](QueueConfig::validate) warns below that ratio and
    /// rejects a TTL shorter than the interval outright.
    ///
    /// Default: 5s
    pub heartbeat_ttl: Duration,

    /// How long a delivered entry may sit unacknowledged before it becomes
    /// eligible for reclaim.
    /// Default: 30s
    pub visibility_timeout: Duration,

    /// Delivery attempts before a job is dead-lettered.
    /// Default: 3
    pub max_attempts: u32,

    /// Maximum simultaneous handler invocations per consumer. The read
    /// loop stops issuing reads while this many jobs are outstanding.
    /// Default: 16
    pub max_in_flight: usize,

    /// Maximum entries per batch read.
    /// Default: 10
    pub poll_batch_size: usize,

    /// How long a read blocks waiting for new entries before returning
    /// empty.
    /// Default: 5s
    pub poll_block_timeout: Duration,

    /// How often the claim engine scans pending entries.
    /// Default: 10s
    pub claim_interval: Duration,

    /// Partition receiving jobs that exhausted their retry budget.
    /// Default: [`PartitionId::DEAD_LETTER`]
    pub dead_letter_partition: PartitionId,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            group: "default".to_string(),
            consumer_id: format!("consumer-{}", uuid::Uuid::new_v4()),
            partitions: 1,
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_ttl: Duration::from_secs(5),
            visibility_timeout: Duration::from_secs(30),
            max_attempts: 3,
            max_in_flight: 16,
            poll_batch_size: 10,
            poll_block_timeout: Duration::from_secs(5),
            claim_interval: Duration::from_secs(10),
            dead_letter_partition: PartitionId::DEAD_LETTER,
        }
    }
}

impl QueueConfig {
    /// Create a config with the given group and consumer identity and
    /// default timings.
    pub fn new(group: impl Into<String>, consumer_id: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            consumer_id: consumer_id.into(),
            ..Default::default()
        }
    }

    /// The data partitions of this stream, in order.
    pub fn data_partitions(&self) -> Vec<PartitionId> {
        (0..self.partitions).map(PartitionId).collect()
    }

    /// Validate the configuration.
    ///
    /// Rejects combinations that break the coordination protocol; warns on
    /// combinations that merely reduce its safety margin.
    pub fn validate(&self) -> Result<()> {
        if self.group.is_empty() {
            return Err(Error::Config("group name must not be empty".into()));
        }
        if self.consumer_id.is_empty() {
            return Err(Error::Config("consumer id must not be empty".into()));
        }
        if self.partitions == 0 {
            return Err(Error::Config("partition count must be at least 1".into()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(Error::Config("heartbeat interval must be non-zero".into()));
        }
        if self.heartbeat_ttl < self.heartbeat_interval {
            return Err(Error::Config(format!(
                "heartbeat TTL ({:?}) must be >= heartbeat interval ({:?})",
                self.heartbeat_ttl, self.heartbeat_interval
            )));
        }
        if self.heartbeat_ttl < self.heartbeat_interval * 3 {
            tracing::warn!(
                ttl_ms = self.heartbeat_ttl.as_millis() as u64,
                interval_ms = self.heartbeat_interval.as_millis() as u64,
                "Heartbeat TTL below 3x interval; jitter may cause spurious rebalances"
            );
        }
        if self.max_attempts == 0 {
            return Err(Error::Config("max attempts must be at least 1".into()));
        }
        if self.max_in_flight == 0 {
            return Err(Error::Config("max in-flight must be at least 1".into()));
        }
        if self.poll_batch_size == 0 {
            return Err(Error::Config("poll batch size must be at least 1".into()));
        }
        if self.visibility_timeout.is_zero() {
            return Err(Error::Config("visibility timeout must be non-zero".into()));
        }
        if self.dead_letter_partition.0 < self.partitions {
            return Err(Error::Config(format!(
                "dead-letter partition {} collides with data partitions 0..{}",
                self.dead_letter_partition, self.partitions
            )));
        }
        Ok(())
    }

    /// Load configuration from `CONVEYOR_*` environment variables.
    ///
    /// Unset variables fall back to defaults; unparsable values are
    /// configuration errors. `CONVEYOR_GROUP` is required.
    pub fn from_env() -> Result<Self> {
        let mut config = Self {
            group: std::env::var("CONVEYOR_GROUP")
                .map_err(|_| Error::Config("CONVEYOR_GROUP must be set".into()))?,
            ..Default::default()
        };

        if let Ok(id) = std::env::var("CONVEYOR_CONSUMER_ID") {
            config.consumer_id = id;
        }
        config.partitions = env_parse("CONVEYOR_PARTITIONS", config.partitions)?;
        config.heartbeat_interval =
            env_parse_ms("CONVEYOR_HEARTBEAT_INTERVAL_MS", config.heartbeat_interval)?;
        config.heartbeat_ttl = env_parse_ms("CONVEYOR_HEARTBEAT_TTL_MS", config.heartbeat_ttl)?;
        config.visibility_timeout =
            env_parse_ms("CONVEYOR_VISIBILITY_TIMEOUT_MS", config.visibility_timeout)?;
        config.max_attempts = env_parse("CONVEYOR_MAX_ATTEMPTS", config.max_attempts)?;
        config.max_in_flight = env_parse("CONVEYOR_MAX_IN_FLIGHT", config.max_in_flight)?;
        config.poll_batch_size = env_parse("CONVEYOR_POLL_BATCH_SIZE", config.poll_batch_size)?;
        config.poll_block_timeout =
            env_parse_ms("CONVEYOR_POLL_BLOCK_TIMEOUT_MS", config.poll_block_timeout)?;
        config.claim_interval = env_parse_ms("CONVEYOR_CLAIM_INTERVAL_MS", config.claim_interval)?;
        config.dead_letter_partition = PartitionId(env_parse(
            "CONVEYOR_DEAD_LETTER_PARTITION",
            config.dead_letter_partition.0,
        )?);

        config.validate()?;
        Ok(config)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| Error::Config(format!("invalid value for {name}: {raw}"))),
        Err(_) => Ok(default),
    }
}

fn env_parse_ms(name: &str, default: Duration) -> Result<Duration> {
    Ok(Duration::from_millis(env_parse(
        name,
        default.as_millis() as u64,
    )?))
}
