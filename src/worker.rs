//! Worker harness: one call to stand up a full consumer process.
//!
//! [`JobWorker`] wires the three long-running pieces together over a
//! shared shutdown channel:
//!
//! - the [`GroupCoordinator`] heartbeat and membership loop,
//! - the [`Consumer`] partition loops driving the user's handler,
//! - the [`ClaimEngine`] scan loop.
//!
//! Shutdown is graceful: tasks stop first, then the worker leaves the
//! group so its partitions rebalance immediately instead of waiting out
//! the heartbeat TTL. Jobs in flight at shutdown stay pending and are
//! reclaimed by the surviving consumers; at-least-once delivery covers
//! the interruption.

use std::sync::Arc;

use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinSet;
use tracing::info;

use crate::claim::ClaimEngine;
use crate::config::QueueConfig;
use crate::consumer::{Consumer, JobHandler};
use crate::error::Result;
use crate::group::GroupCoordinator;
use crate::log::{GroupAssignment, LogClient};

/// A complete consumer-group participant.
pub struct JobWorker {
    config: QueueConfig,
    coordinator: Arc<GroupCoordinator>,
    consumer: Arc<Consumer>,
    claim: Arc<ClaimEngine>,
    shutdown: broadcast::Sender<()>,
    tasks: Mutex<JoinSet<()>>,
}

impl JobWorker {
    /// Build a worker from a validated config.
    pub fn new(
        client: Arc<dyn LogClient>,
        config: QueueConfig,
        handler: Arc<dyn JobHandler>,
    ) -> Result<Self> {
        config.validate()?;

        let coordinator = Arc::new(GroupCoordinator::new(client.clone(), config.clone()));
        let view = coordinator.subscribe();
        let consumer = Arc::new(Consumer::new(
            client.clone(),
            config.clone(),
            handler,
            view.clone(),
        ));
        let claim = Arc::new(ClaimEngine::new(client, config.clone(), view));
        let (shutdown, _) = broadcast::channel(1);

        Ok(Self {
            config,
            coordinator,
            consumer,
            claim,
            shutdown,
            tasks: Mutex::new(JoinSet::new()),
        })
    }

    /// Join the group and start the background loops.
    pub async fn start(&self) -> Result<()> {
        info!(
            group = %self.config.group,
            consumer_id = %self.config.consumer_id,
            partitions = self.config.partitions,
            "Starting worker"
        );
        self.coordinator.join().await?;

        let mut tasks = self.tasks.lock().await;
        tasks.spawn(Arc::clone(&self.coordinator).run(self.shutdown.subscribe()));
        tasks.spawn(Arc::clone(&self.consumer).run(self.shutdown.subscribe()));
        tasks.spawn(Arc::clone(&self.claim).run(self.shutdown.subscribe()));
        Ok(())
    }

    /// Stop the background loops and leave the group.
    pub async fn shutdown(&self) -> Result<()> {
        info!(
            group = %self.config.group,
            consumer_id = %self.config.consumer_id,
            "Shutting down worker"
        );
        let _ = self.shutdown.send(());

        let mut tasks = self.tasks.lock().await;
        while tasks.join_next().await.is_some() {}
        drop(tasks);

        self.coordinator.leave().await
    }

    /// The latest observed `(generation, assignment)` view.
    pub fn assignment(&self) -> watch::Receiver<GroupAssignment> {
        self.coordinator.subscribe()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }
}
