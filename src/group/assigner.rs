//! Deterministic partition assignment.
//!
//! Assignment is a pure function of the partition set and the live member
//! set. Consumers sort lexicographically and partitions deal out
//! round-robin from partition 0, so any process can recompute the exact
//! assignment the coordinator published without asking anyone, and the
//! load stays balanced within one partition.

use std::collections::HashMap;

use crate::types::PartitionId;

/// Compute the assignment of `partitions` across `consumers`.
///
/// Deterministic for a given input: consumer ids are sorted
/// lexicographically and partitions are dealt round-robin starting from
/// the lowest partition id, which places remainder partitions on the
/// earliest-sorted consumers.
///
/// Zero live consumers yields an empty map; the partitions stay unowned
/// until someone joins.
pub fn assign(partitions: &[PartitionId], consumers: &[String]) -> HashMap<PartitionId, String> {
    if consumers.is_empty() {
        return HashMap::new();
    }

    let mut sorted_consumers: Vec<&String> = consumers.iter().collect();
    sorted_consumers.sort();
    sorted_consumers.dedup();

    let mut sorted_partitions: Vec<PartitionId> = partitions.to_vec();
    sorted_partitions.sort();
    sorted_partitions.dedup();

    sorted_partitions
        .into_iter()
        .enumerate()
        .map(|(i, partition)| (partition, sorted_consumers[i % sorted_consumers.len()].clone()))
        .collect()
}
