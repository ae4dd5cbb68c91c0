//! Heartbeat-based liveness detection.
//!
//! Every consumer writes its heartbeat timestamp to the broker at a fixed
//! interval strictly shorter than the declared TTL. The monitor splits the
//! member registry into live and expired sets each coordinator tick; any
//! expired member is pruned and triggers a rebalance.
//!
//! The monitor deliberately treats expire-then-rejoin within one tick as a
//! fresh join (new generation) rather than a no-op: re-fencing is cheap,
//! split-brain is not.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

/// Result of one membership scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipView {
    /// Members with a heartbeat within the TTL, lexicographically ordered
    /// (the order the assigner consumes).
    pub live: BTreeSet<String>,

    /// Members whose heartbeat is older than the TTL; to be pruned from
    /// the registry.
    pub expired: Vec<String>,
}

/// Splits a member registry into live and expired members by heartbeat age.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    ttl: Duration,
}

impl HeartbeatMonitor {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Partition `members` (consumer id -> last heartbeat, unix ms) into
    /// live and expired sets as of `now_ms`.
    ///
    /// A heartbeat exactly at the TTL boundary still counts as live;
    /// expiry requires strictly exceeding it.
    pub fn partition_members(&self, members: &HashMap<String, u64>, now_ms: u64) -> MembershipView {
        let ttl_ms = self.ttl.as_millis() as u64;
        let mut live = BTreeSet::new();
        let mut expired = Vec::new();

        for (consumer, last_heartbeat) in members {
            if now_ms.saturating_sub(*last_heartbeat) > ttl_ms {
                expired.push(consumer.clone());
            } else {
                live.insert(consumer.clone());
            }
        }

        expired.sort();
        MembershipView { live, expired }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members(entries: &[(&str, u64)]) -> HashMap<String, u64> {
        entries
            .iter()
            .map(|(id, at)| (id.to_string(), *at))
            .collect()
    }

    #[test]
    fn test_recent_heartbeats_are_live() {
        let monitor = HeartbeatMonitor::new(Duration::from_millis(100));
        let view = monitor.partition_members(&members(&[("c1", 950), ("c2", 1000)]), 1000);

        assert_eq!(view.live.len(), 2);
        assert!(view.expired.is_empty());
    }

    #[test]
    fn test_stale_heartbeats_expire() {
        let monitor = HeartbeatMonitor::new(Duration::from_millis(100));
        let view = monitor.partition_members(&members(&[("c1", 800), ("c2", 990)]), 1000);

        assert_eq!(view.live, BTreeSet::from(["c2".to_string()]));
        assert_eq!(view.expired, vec!["c1".to_string()]);
    }

    #[test]
    fn test_exact_ttl_boundary_is_still_live() {
        let monitor = HeartbeatMonitor::new(Duration::from_millis(100));

        let view = monitor.partition_members(&members(&[("c1", 900)]), 1000);
        assert!(view.live.contains("c1"));

        let view = monitor.partition_members(&members(&[("c1", 899)]), 1000);
        assert_eq!(view.expired, vec!["c1".to_string()]);
    }

    #[test]
    fn test_heartbeat_from_the_future_is_live() {
        // Clock skew between writer and scanner must not expire a member.
        let monitor = HeartbeatMonitor::new(Duration::from_millis(100));
        let view = monitor.partition_members(&members(&[("c1", 2000)]), 1000);
        assert!(view.live.contains("c1"));
    }

    #[test]
    fn test_live_set_is_lexicographically_ordered() {
        let monitor = HeartbeatMonitor::new(Duration::from_millis(100));
        let view = monitor.partition_members(&members(&[("z", 1000), ("a", 1000), ("m", 1000)]), 1000);

        let ordered: Vec<&String> = view.live.iter().collect();
        assert_eq!(ordered, ["a", "m", "z"]);
    }

    #[test]
    fn test_empty_registry() {
        let monitor = HeartbeatMonitor::new(Duration::from_millis(100));
        let view = monitor.partition_members(&HashMap::new(), 1000);
        assert!(view.live.is_empty());
        assert!(view.expired.is_empty());
    }
}
