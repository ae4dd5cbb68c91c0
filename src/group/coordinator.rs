//! Per-process consumer-group coordinator.
//!
//! Every consumer process runs one [`GroupCoordinator`]. It keeps the
//! process's heartbeat fresh, watches the member registry, and when the
//! live set changes it bumps the generation, recomputes the assignment
//! with the pure [`assigner`](super::assigner), and publishes it through
//! the broker. The broker's fencing (a publish must advance the
//! generation) arbitrates when several processes react to the same
//! membership change: exactly one publish wins, the rest re-read and adopt
//! the winner's assignment.
//!
//! The latest published `(generation, assignment)` is exposed on a
//! `tokio::sync::watch` channel. The worker loop and claim engine check it
//! before every batch read / claim scan, so a consumer that missed a
//! rebalance while unreachable discards its stale partitions the moment it
//! observes the newer generation. That conservative handover bound keeps
//! the double-delivery window to a single batch.

use std::sync::Arc;
use std::sync::Mutex;

use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::log::{GroupAssignment, LogClient};
use crate::retry;
use crate::types::unix_ms_now;

use super::assigner;
use super::heartbeat::HeartbeatMonitor;

/// How many generation bumps one `poll_once` races through before giving
/// up and letting the next tick retry.
const MAX_PUBLISH_RACES: usize = 5;

/// Coordinator state for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    /// Membership matches the published assignment.
    Stable,
    /// A membership change is being resolved into a new generation.
    Rebalancing,
}

/// Coordinates one process's view of its consumer group.
pub struct GroupCoordinator {
    client: Arc<dyn LogClient>,
    config: QueueConfig,
    monitor: HeartbeatMonitor,
    view_tx: watch::Sender<GroupAssignment>,
    state: Mutex<GroupState>,
}

impl GroupCoordinator {
    pub fn new(client: Arc<dyn LogClient>, config: QueueConfig) -> Self {
        let monitor = HeartbeatMonitor::new(config.heartbeat_ttl);
        let (view_tx, _) = watch::channel(GroupAssignment::default());
        Self {
            client,
            config,
            monitor,
            view_tx,
            state: Mutex::new(GroupState::Stable),
        }
    }

    /// Subscribe to the latest observed `(generation, assignment)`.
    pub fn subscribe(&self) -> watch::Receiver<GroupAssignment> {
        self.view_tx.subscribe()
    }

    /// Current coordinator state.
    pub fn state(&self) -> GroupState {
        *self.state.lock().expect("state lock poisoned")
    }

    /// Join the group: announce liveness, then resolve membership once.
    ///
    /// Returns once this process has observed an assignment that includes
    /// it (either one it published or one another process raced in).
    pub async fn join(&self) -> Result<()> {
        info!(
            group = %self.config.group,
            consumer_id = %self.config.consumer_id,
            "Joining consumer group"
        );
        self.heartbeat_once().await?;
        self.poll_once().await?;
        Ok(())
    }

    /// Leave the group gracefully, triggering an immediate rebalance
    /// instead of waiting out the heartbeat TTL.
    pub async fn leave(&self) -> Result<()> {
        info!(
            group = %self.config.group,
            consumer_id = %self.config.consumer_id,
            "Leaving consumer group"
        );
        let group = self.config.group.clone();
        let consumer = self.config.consumer_id.clone();
        retry::with_broker_policy(|| self.client.remove_member(&group, &consumer)).await?;
        self.poll_once().await?;
        Ok(())
    }

    /// Write this process's heartbeat.
    pub async fn heartbeat_once(&self) -> Result<()> {
        let group = self.config.group.clone();
        let consumer = self.config.consumer_id.clone();
        retry::with_broker_policy(|| self.client.write_heartbeat(&group, &consumer, unix_ms_now()))
            .await
    }

    /// Re-read the published assignment and adopt it if newer.
    pub async fn refresh(&self) -> Result<GroupAssignment> {
        let group = self.config.group.clone();
        let published =
            retry::with_broker_policy(|| self.client.read_assignment(&group)).await?;
        self.adopt(published.clone());
        Ok(published)
    }

    /// Run one membership scan, rebalancing if the live set changed.
    ///
    /// Returns `true` when this call published a new generation.
    pub async fn poll_once(&self) -> Result<bool> {
        let group = self.config.group.clone();
        let members = retry::with_broker_policy(|| self.client.read_members(&group)).await?;
        let view = self.monitor.partition_members(&members, unix_ms_now());

        for consumer in &view.expired {
            warn!(
                group = %self.config.group,
                consumer_id = %consumer,
                ttl_ms = self.monitor.ttl().as_millis() as u64,
                "Member missed heartbeat TTL, removing from group"
            );
            let consumer = consumer.clone();
            retry::with_broker_policy(|| self.client.remove_member(&group, &consumer)).await?;
        }

        let published = retry::with_broker_policy(|| self.client.read_assignment(&group)).await?;

        // Stable: the live set is exactly what the published assignment was
        // computed from. An empty, never-published group stays untouched.
        if view.live == published.members && (published.generation > 0 || view.live.is_empty()) {
            self.adopt(published);
            self.set_state(GroupState::Stable);
            return Ok(false);
        }

        self.set_state(GroupState::Rebalancing);
        debug!(
            group = %self.config.group,
            live = ?view.live,
            published_members = ?published.members,
            published_generation = published.generation,
            "Membership changed, rebalancing"
        );

        let live: Vec<String> = view.live.iter().cloned().collect();
        let partitions = self.config.data_partitions();
        let mut generation = published.generation;

        for _ in 0..MAX_PUBLISH_RACES {
            generation += 1;
            let assignment = assigner::assign(&partitions, &live);

            match self
                .client
                .publish_assignment(&group, generation, &view.live, &assignment)
                .await
            {
                Ok(()) => {
                    info!(
                        group = %self.config.group,
                        generation,
                        member_count = view.live.len(),
                        "Published new assignment, group is stable"
                    );
                    self.adopt(GroupAssignment {
                        generation,
                        members: view.live.clone(),
                        assignment,
                    });
                    self.set_state(GroupState::Stable);
                    return Ok(true);
                }
                Err(Error::StaleGeneration { current, .. }) => {
                    // Another process published first. If it saw the same
                    // membership we did, its assignment is ours too.
                    let latest =
                        retry::with_broker_policy(|| self.client.read_assignment(&group)).await?;
                    if latest.members == view.live {
                        debug!(
                            group = %self.config.group,
                            generation = latest.generation,
                            "Lost publish race, adopting winning assignment"
                        );
                        self.adopt(latest);
                        self.set_state(GroupState::Stable);
                        return Ok(false);
                    }
                    generation = latest.generation.max(current);
                }
                Err(e) => return Err(e),
            }
        }

        // Heavy churn: leave the group in Rebalancing and let the next
        // tick converge.
        warn!(
            group = %self.config.group,
            "Gave up rebalance after repeated publish races"
        );
        Ok(false)
    }

    /// Heartbeat + membership loop until shutdown.
    ///
    /// Broker errors that survive the retry policy are fatal to this task
    /// and reported at error level; the process operator decides whether
    /// to restart.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut tick = tokio::time::interval(self.config.heartbeat_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.heartbeat_once().await {
                        error!(group = %self.config.group, error = %e, "Heartbeat failed, coordinator stopping");
                        return;
                    }
                    if let Err(e) = self.poll_once().await {
                        error!(group = %self.config.group, error = %e, "Membership poll failed, coordinator stopping");
                        return;
                    }
                }
                _ = shutdown.recv() => {
                    debug!(group = %self.config.group, "Coordinator received shutdown signal");
                    return;
                }
            }
        }
    }

    /// Publish `published` to local subscribers if it advances the
    /// generation. Readers therefore never observe an assignment without
    /// having observed its generation advance.
    fn adopt(&self, published: GroupAssignment) {
        self.view_tx.send_if_modified(|current| {
            if published.generation > current.generation {
                *current = published;
                true
            } else {
                false
            }
        });
    }

    fn set_state(&self, state: GroupState) {
        *self.state.lock().expect("state lock poisoned") = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::InMemoryLog;
    use std::time::Duration;

    fn config(consumer_id: &str) -> QueueConfig {
        let mut config = QueueConfig::new("orders", consumer_id);
        config.partitions = 3;
        config.heartbeat_interval = Duration::from_millis(10);
        config.heartbeat_ttl = Duration::from_millis(50);
        config
    }

    #[tokio::test]
    async fn test_first_join_publishes_generation_one() {
        let log: Arc<InMemoryLog> = Arc::new(InMemoryLog::new());
        let coordinator = GroupCoordinator::new(log.clone(), config("c1"));
        let view = coordinator.subscribe();

        coordinator.join().await.unwrap();

        let published = view.borrow().clone();
        assert_eq!(published.generation, 1);
        assert_eq!(published.assignment.len(), 3);
        assert!(published.assignment.values().all(|owner| owner == "c1"));
        assert_eq!(coordinator.state(), GroupState::Stable);
    }

    #[tokio::test]
    async fn test_second_join_bumps_generation_and_rebalances() {
        let log: Arc<InMemoryLog> = Arc::new(InMemoryLog::new());
        let c1 = GroupCoordinator::new(log.clone(), config("c1"));
        let c2 = GroupCoordinator::new(log.clone(), config("c2"));

        c1.join().await.unwrap();
        c2.join().await.unwrap();

        let published = log.read_assignment("orders").await.unwrap();
        assert_eq!(published.generation, 2);
        assert_eq!(published.members.len(), 2);

        let c1_owned = published.partitions_for("c1");
        let c2_owned = published.partitions_for("c2");
        assert_eq!(c1_owned.len() + c2_owned.len(), 3);
        assert!(!c1_owned.is_empty() && !c2_owned.is_empty());
    }

    #[tokio::test]
    async fn test_stable_membership_does_not_rebalance() {
        let log: Arc<InMemoryLog> = Arc::new(InMemoryLog::new());
        let coordinator = GroupCoordinator::new(log.clone(), config("c1"));

        coordinator.join().await.unwrap();
        coordinator.heartbeat_once().await.unwrap();
        assert!(!coordinator.poll_once().await.unwrap());
        assert!(!coordinator.poll_once().await.unwrap());

        let published = log.read_assignment("orders").await.unwrap();
        assert_eq!(published.generation, 1);
    }

    #[tokio::test]
    async fn test_leave_triggers_immediate_rebalance() {
        let log: Arc<InMemoryLog> = Arc::new(InMemoryLog::new());
        let c1 = GroupCoordinator::new(log.clone(), config("c1"));
        let c2 = GroupCoordinator::new(log.clone(), config("c2"));

        c1.join().await.unwrap();
        c2.join().await.unwrap();
        c1.leave().await.unwrap();

        let published = log.read_assignment("orders").await.unwrap();
        assert_eq!(published.generation, 3);
        assert!(!published.members.contains("c1"));
        assert!(published.assignment.values().all(|owner| owner == "c2"));
    }

    #[tokio::test]
    async fn test_expired_member_is_pruned_and_partitions_reassigned() {
        let log: Arc<InMemoryLog> = Arc::new(InMemoryLog::new());
        let c1 = GroupCoordinator::new(log.clone(), config("c1"));
        let c2 = GroupCoordinator::new(log.clone(), config("c2"));

        c1.join().await.unwrap();
        c2.join().await.unwrap();

        // c1 goes silent past the TTL while c2 stays fresh.
        tokio::time::sleep(Duration::from_millis(60)).await;
        c2.heartbeat_once().await.unwrap();
        assert!(c2.poll_once().await.unwrap());

        let published = log.read_assignment("orders").await.unwrap();
        assert_eq!(published.generation, 3);
        assert!(published.assignment.values().all(|owner| owner == "c2"));
        assert!(!log.read_members("orders").await.unwrap().contains_key("c1"));
    }

    #[tokio::test]
    async fn test_rejoin_after_expiry_is_a_fresh_join() {
        let log: Arc<InMemoryLog> = Arc::new(InMemoryLog::new());
        let c1 = GroupCoordinator::new(log.clone(), config("c1"));
        let c2 = GroupCoordinator::new(log.clone(), config("c2"));

        c1.join().await.unwrap();
        c2.join().await.unwrap();
        let before = log.read_assignment("orders").await.unwrap().generation;

        tokio::time::sleep(Duration::from_millis(60)).await;
        c2.heartbeat_once().await.unwrap();
        c2.poll_once().await.unwrap();

        // c1 comes back: a fresh join under a new generation, not a no-op.
        c1.join().await.unwrap();
        let after = log.read_assignment("orders").await.unwrap();
        assert!(after.generation >= before + 2);
        assert!(after.members.contains("c1"));
    }

    #[tokio::test]
    async fn test_view_generation_is_monotonic() {
        let log: Arc<InMemoryLog> = Arc::new(InMemoryLog::new());
        let coordinator = GroupCoordinator::new(log.clone(), config("c1"));
        let view = coordinator.subscribe();

        coordinator.join().await.unwrap();
        let seen = view.borrow().generation;

        // Adopting an older assignment must not roll the view back.
        coordinator.adopt(GroupAssignment::default());
        assert_eq!(view.borrow().generation, seen);
    }
}
