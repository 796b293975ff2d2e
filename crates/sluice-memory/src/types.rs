use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sluice_core::{QueryId, RetryPolicy, TaskId};

/// Reservation held by one task on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMemoryReservation {
    pub task_id: TaskId,
    pub bytes: u64,
}

/// Snapshot of the general memory pool of one worker node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryPoolInfo {
    pub max_bytes: u64,
    pub reserved_bytes: u64,
    pub reserved_revocable_bytes: u64,
    #[serde(default)]
    pub query_memory_reservations: BTreeMap<QueryId, u64>,
    #[serde(default)]
    pub task_memory_reservations: Vec<TaskMemoryReservation>,
}

impl MemoryPoolInfo {
    /// Bytes neither reserved nor revocably reserved. Negative when the pool is
    /// overcommitted.
    pub fn free_bytes(&self) -> i128 {
        i128::from(self.max_bytes)
            - i128::from(self.reserved_bytes)
            - i128::from(self.reserved_revocable_bytes)
    }

    /// A pool is blocked when nothing is free and nothing could be reclaimed by
    /// revoking memory.
    pub fn is_blocked(&self) -> bool {
        self.free_bytes() + i128::from(self.reserved_revocable_bytes) <= 0
    }
}

/// Memory report of a worker node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryInfo {
    pub node_id: String,
    pub total_node_memory_bytes: u64,
    pub pool: MemoryPoolInfo,
}

impl MemoryInfo {
    pub fn is_blocked(&self) -> bool {
        self.pool.is_blocked()
    }
}

/// What the cluster memory manager knows about a running query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningQueryInfo {
    pub query_id: QueryId,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    /// Cluster-wide reservation of the query.
    #[serde(default)]
    pub total_memory_reservation_bytes: u64,
}

impl RunningQueryInfo {
    pub fn new(query_id: impl Into<QueryId>, retry_policy: RetryPolicy) -> Self {
        Self {
            query_id: query_id.into(),
            retry_policy,
            total_memory_reservation_bytes: 0,
        }
    }
}

/// Victim chosen by a [`crate::LowMemoryKiller`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "target")]
pub enum KillTarget {
    WholeQuery(QueryId),
    Tasks(BTreeSet<TaskId>),
}

impl KillTarget {
    pub fn query_id(&self) -> Option<&QueryId> {
        match self {
            KillTarget::WholeQuery(query_id) => Some(query_id),
            KillTarget::Tasks(_) => None,
        }
    }
}
