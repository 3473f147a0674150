//! Process-local and cluster-wide named locking (spec.md §4.4, §4.5).

mod cluster;
mod named;

pub use cluster::{
    ClusterLock, ClusterLocks, ClusterOperations, CreateOutcome, InMemoryClusterOperations,
    OperationHandle,
};
pub use named::{Cancelled, FriendlyOutcome, Lock, NamedLocks};
