use serde::{Deserialize, Serialize};
use sluice_core::{QueryId, QueryState, ResourceGroupId};

use crate::policy::SchedulingPolicy;

/// Admission state of a group as reported to monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceGroupState {
    CanRun,
    CanQueue,
    Full,
}

/// Monitoring snapshot of a group. Field names are part of the monitoring
/// contract and must stay stable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceGroupInfo {
    pub id: ResourceGroupId,
    pub state: ResourceGroupState,
    pub scheduling_policy: SchedulingPolicy,
    pub scheduling_weight: u32,
    pub soft_memory_limit_bytes: u64,
    pub memory_usage_bytes: u64,
    pub cpu_usage_millis: u64,
    pub soft_concurrency_limit: usize,
    pub hard_concurrency_limit: usize,
    pub max_queued_queries: usize,
    pub num_queued_queries: usize,
    pub num_running_queries: usize,
    pub num_eligible_sub_groups: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_groups: Option<Vec<ResourceGroupInfo>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running_queries: Option<Vec<QueryStateInfo>>,
}

/// A running query as listed in a full group snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryStateInfo {
    pub query_id: QueryId,
    pub state: QueryState,
    pub resource_group_id: ResourceGroupId,
    pub priority: i32,
    pub memory_reservation_bytes: u64,
    pub cpu_time_millis: u64,
}

/// Counters-only snapshot, cheap enough to poll frequently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceGroupRuntimeInfo {
    pub resource_group_id: ResourceGroupId,
    pub memory_usage_bytes: u64,
    pub cpu_usage_millis: u64,
    pub queued_queries: usize,
    pub descendant_queued_queries: usize,
    pub running_queries: usize,
    pub descendant_running_queries: usize,
    pub sub_groups: Vec<ResourceGroupRuntimeInfo>,
}
