//! Group membership and rebalancing behavior against the in-memory broker.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use conveyor::prelude::*;

fn config(consumer_id: &str) -> QueueConfig {
    let mut config = QueueConfig::new("rebalance-group", consumer_id);
    config.partitions = 6;
    config.heartbeat_interval = Duration::from_millis(10);
    config.heartbeat_ttl = Duration::from_millis(50);
    config
}

fn coordinator(log: &Arc<InMemoryLog>, consumer_id: &str) -> GroupCoordinator {
    GroupCoordinator::new(log.clone(), config(consumer_id))
}

#[tokio::test]
async fn test_joins_split_partitions_evenly() {
    let log = Arc::new(InMemoryLog::new());
    let c1 = coordinator(&log, "c1");
    let c2 = coordinator(&log, "c2");
    let c3 = coordinator(&log, "c3");

    c1.join().await.unwrap();
    c2.join().await.unwrap();
    c3.join().await.unwrap();

    let published = log.read_assignment("rebalance-group").await.unwrap();
    assert_eq!(published.generation, 3);
    assert_eq!(published.members.len(), 3);
    for member in ["c1", "c2", "c3"] {
        assert_eq!(published.partitions_for(member).len(), 2);
    }
}

#[tokio::test]
async fn test_every_partition_has_exactly_one_owner() {
    let log = Arc::new(InMemoryLog::new());
    let c1 = coordinator(&log, "c1");
    let c2 = coordinator(&log, "c2");

    c1.join().await.unwrap();
    c2.join().await.unwrap();

    let published = log.read_assignment("rebalance-group").await.unwrap();
    let mut owned: HashSet<PartitionId> = HashSet::new();
    for member in &published.members {
        for partition in published.partitions_for(member) {
            // Disjoint: no partition shows up under two owners.
            assert!(owned.insert(partition), "{partition} owned twice");
        }
    }
    assert_eq!(owned.len(), 6);
}

#[tokio::test]
async fn test_expired_member_partitions_fail_over() {
    let log = Arc::new(InMemoryLog::new());
    let c1 = coordinator(&log, "c1");
    let c2 = coordinator(&log, "c2");

    c1.join().await.unwrap();
    c2.join().await.unwrap();

    // c1 stops heartbeating; c2 keeps going and eventually notices.
    tokio::time::sleep(Duration::from_millis(60)).await;
    c2.heartbeat_once().await.unwrap();
    assert!(c2.poll_once().await.unwrap());

    let published = log.read_assignment("rebalance-group").await.unwrap();
    assert_eq!(published.generation, 3);
    assert_eq!(published.partitions_for("c2").len(), 6);
    assert!(published.partitions_for("c1").is_empty());
}

#[tokio::test]
async fn test_graceful_leave_rebalances_without_waiting_for_ttl() {
    let log = Arc::new(InMemoryLog::new());
    let c1 = coordinator(&log, "c1");
    let c2 = coordinator(&log, "c2");

    c1.join().await.unwrap();
    c2.join().await.unwrap();

    // No sleep: the leave itself must trigger the rebalance.
    c1.leave().await.unwrap();

    let published = log.read_assignment("rebalance-group").await.unwrap();
    assert_eq!(published.generation, 3);
    assert_eq!(published.partitions_for("c2").len(), 6);
}

#[tokio::test]
async fn test_rejoin_after_expiry_gets_a_fresh_generation() {
    let log = Arc::new(InMemoryLog::new());
    let c1 = coordinator(&log, "c1");
    let c2 = coordinator(&log, "c2");

    c1.join().await.unwrap();
    c2.join().await.unwrap();

    tokio::time::sleep(Duration::from_millis(60)).await;
    c2.heartbeat_once().await.unwrap();
    c2.poll_once().await.unwrap();
    let after_expiry = log.read_assignment("rebalance-group").await.unwrap();

    c1.join().await.unwrap();
    let after_rejoin = log.read_assignment("rebalance-group").await.unwrap();

    assert!(after_rejoin.generation > after_expiry.generation);
    assert_eq!(after_rejoin.partitions_for("c1").len(), 3);
    assert_eq!(after_rejoin.partitions_for("c2").len(), 3);
}

#[tokio::test]
async fn test_concurrent_rebalances_converge_on_one_generation() {
    let log = Arc::new(InMemoryLog::new());
    let c1 = Arc::new(coordinator(&log, "c1"));
    let c2 = Arc::new(coordinator(&log, "c2"));

    c1.join().await.unwrap();
    // c2 announces itself but has not rebalanced yet; both processes now
    // react to the same membership change at once.
    c2.heartbeat_once().await.unwrap();

    let (r1, r2) = tokio::join!(c1.poll_once(), c2.poll_once());
    r1.unwrap();
    r2.unwrap();

    // Exactly one publish won; the other adopted it.
    let published = log.read_assignment("rebalance-group").await.unwrap();
    assert_eq!(published.generation, 2);
    assert_eq!(published.members.len(), 2);

    // Refresh both in case one raced ahead, then compare views.
    c1.refresh().await.unwrap();
    c2.refresh().await.unwrap();
    assert_eq!(*c1.subscribe().borrow(), published);
    assert_eq!(*c2.subscribe().borrow(), published);
    assert_eq!(c1.state(), GroupState::Stable);
    assert_eq!(c2.state(), GroupState::Stable);
}

#[tokio::test]
async fn test_stable_group_keeps_its_generation() {
    let log = Arc::new(InMemoryLog::new());
    let c1 = coordinator(&log, "c1");
    let c2 = coordinator(&log, "c2");

    c1.join().await.unwrap();
    c2.join().await.unwrap();

    for _ in 0..5 {
        c1.heartbeat_once().await.unwrap();
        c2.heartbeat_once().await.unwrap();
        assert!(!c1.poll_once().await.unwrap());
        assert!(!c2.poll_once().await.unwrap());
    }

    let published = log.read_assignment("rebalance-group").await.unwrap();
    assert_eq!(published.generation, 2);
}
