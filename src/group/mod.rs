//! Consumer-group coordination.
//!
//! Three pieces cooperate to keep partition ownership exclusive per
//! generation:
//!
//! - [`assigner`]: the pure, deterministic partition-assignment function.
//!   Every process computes the same assignment from the same member set,
//!   so no central lock is needed.
//! - [`heartbeat`]: liveness bookkeeping. Members that stop heartbeating
//!   past the TTL are expired and trigger a rebalance.
//! - [`coordinator`]: the per-process state machine that watches
//!   membership, bumps the generation, publishes assignments through the
//!   broker (which arbitrates concurrent publishers by fencing), and
//!   exposes the latest `(generation, assignment)` view to the worker
//!   loop and claim engine.

pub mod assigner;
pub mod coordinator;
pub mod heartbeat;

pub use assigner::assign;
pub use coordinator::{GroupCoordinator, GroupState};
pub use heartbeat::{HeartbeatMonitor, MembershipView};
