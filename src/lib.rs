//! # Conveyor
//! Distributed job queue over a partitioned append-log broker.
//!
//! This crate layers consumer-group semantics on top of any broker that
//! exposes partitioned append logs with pending-entry tracking (Redis
//! Streams being the canonical deployment). It gives you competing
//! consumers with exclusive partition ownership, heartbeat-based failure
//! detection, generation-fenced rebalancing, at-least-once delivery with
//! a bounded retry budget, and dead-lettering for jobs that exhaust it.
//!
//! # Goals
//! - Deterministic coordination: partition assignment is a pure function
//!   of the live member set, so every process computes the same answer
//! - Safety through fencing: a monotonic generation counter, checked by
//!   the broker on every claim and assignment publish, keeps zombie
//!   consumers from stealing work
//! - Leverage best in class libraries such as [Tokio](https://tokio.rs/)
//!   and [backon](https://docs.rs/backon/latest/backon/)
//! - Broker-agnostic core: everything above the [`LogClient`](log::LogClient)
//!   trait works against the bundled [`InMemoryLog`](log::InMemoryLog)
//!
//! ## Getting started
//! Implement the [`JobHandler`](consumer::JobHandler) trait and hand it to
//! a [`JobWorker`](worker::JobWorker):
//!
//! ```rust,no_run
//! use conveyor::prelude::*;
//! use async_trait::async_trait;
//! use std::sync::Arc;
//!
//! struct EmailHandler;
//!
//! #[async_trait]
//! impl JobHandler for EmailHandler {
//!     async fn handle(&self, job: Job) -> Result<(), HandlerError> {
//!         println!("sending email: {}", job.envelope.payload);
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> conveyor::error::Result<()> {
//!     conveyor::telemetry::init_logging(conveyor::telemetry::LogFormat::Pretty).ok();
//!
//!     let broker = Arc::new(InMemoryLog::new());
//!     let mut config = QueueConfig::new("email_group", "consumer-1");
//!     config.partitions = 4;
//!
//!     let worker = JobWorker::new(broker.clone(), config.clone(), Arc::new(EmailHandler))?;
//!     worker.start().await?;
//!
//!     let producer = Producer::new(broker, &config)?;
//!     producer
//!         .enqueue(
//!             serde_json::json!({"to": "user@example.com"}),
//!             Some("user@example.com".to_string()),
//!         )
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await.ok();
//!     worker.shutdown().await
//! }
//! ```
//!
//! Jobs sharing a routing key land on the same partition and are handled
//! in enqueue order; everything else runs in parallel across partitions.

#![forbid(unsafe_code)]

pub mod claim;
pub mod config;
pub mod consumer;
pub mod error;
pub mod group;
pub mod log;
pub mod producer;
pub mod retry;
pub mod telemetry;
pub mod types;
pub mod worker;

pub mod prelude {
    //! Main exports for building producers and workers.
    pub use crate::claim::{ClaimEngine, ClaimStats};
    pub use crate::config::QueueConfig;
    pub use crate::consumer::{Consumer, JobHandler};
    pub use crate::error::{Error, HandlerError, Result};
    pub use crate::group::{GroupCoordinator, GroupState};
    pub use crate::log::{GroupAssignment, InMemoryLog, LogClient, LogEntry, PendingEntry};
    pub use crate::producer::Producer;
    pub use crate::types::{
        DeadLetterEntry, EntryId, Job, JobEnvelope, JobStatus, PartitionId,
    };
    pub use crate::worker::JobWorker;

    pub use bytes;
}
