//! High-availability coordination: leader lease in the shared cache,
//! heartbeat with database sync, split-brain detection with auto-demotion.
//!
//! The cache grants leadership (atomic SET-NX-EX plus scripted CAS renewal);
//! the database records it (instance_metadata heartbeats) so the two views
//! can be cross-checked. When they disagree and the database names someone
//! else, this instance demotes itself: it releases the cache lock FIRST so
//! the compare-and-delete still matches, then clearing the local flag.

mod coordinator;
mod instance_id;
mod lease;
mod metrics;

pub use coordinator::{
    split_brain_verdict, CoordinatorStatus, DbSync, HaCoordinator, PgDbSync, SplitBrainAction,
};
pub use instance_id::InstanceId;
pub use lease::{Lease, RedisLease, LEADER_KEY};
pub use metrics::{HaMetrics, HaMetricsSnapshot};
