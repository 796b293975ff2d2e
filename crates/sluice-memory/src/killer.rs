use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sluice_core::{QueryId, RetryPolicy, TaskId};

use crate::types::{KillTarget, MemoryInfo, RunningQueryInfo};

/// Strategy picking what to kill when the cluster runs out of memory.
///
/// Implementations are pure functions of the snapshot they are given.
pub trait LowMemoryKiller: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn choose_target_to_kill(
        &self,
        running: &[RunningQueryInfo],
        nodes: &[MemoryInfo],
    ) -> Option<KillTarget>;
}

/// Kills the query holding the most memory on blocked nodes.
///
/// Queries retried per task are skipped: their tasks can be killed
/// individually without losing the whole query.
#[derive(Debug, Default, Clone, Copy)]
pub struct TotalReservationOnBlockedNodesQueryKiller;

impl LowMemoryKiller for TotalReservationOnBlockedNodesQueryKiller {
    fn name(&self) -> &'static str {
        "total-reservation-on-blocked-nodes"
    }

    fn choose_target_to_kill(
        &self,
        running: &[RunningQueryInfo],
        nodes: &[MemoryInfo],
    ) -> Option<KillTarget> {
        let policies = retry_policies(running);
        let mut totals: BTreeMap<&QueryId, u64> = BTreeMap::new();
        for node in nodes.iter().filter(|node| node.is_blocked()) {
            for (query_id, bytes) in &node.pool.query_memory_reservations {
                match policies.get(query_id) {
                    Some(RetryPolicy::Task) | None => continue,
                    Some(_) => {}
                }
                let total = totals.entry(query_id).or_default();
                *total = total.saturating_add(*bytes);
            }
        }

        let (query_id, bytes) = largest(totals)?;
        log_victim(self.name(), query_id, bytes);
        Some(KillTarget::WholeQuery(query_id.clone()))
    }
}

/// Kills the query with the largest cluster-wide reservation.
#[derive(Debug, Default, Clone, Copy)]
pub struct TotalReservationQueryKiller;

impl LowMemoryKiller for TotalReservationQueryKiller {
    fn name(&self) -> &'static str {
        "total-reservation"
    }

    fn choose_target_to_kill(
        &self,
        running: &[RunningQueryInfo],
        _nodes: &[MemoryInfo],
    ) -> Option<KillTarget> {
        let totals = running
            .iter()
            .filter(|query| query.retry_policy != RetryPolicy::Task)
            .map(|query| (&query.query_id, query.total_memory_reservation_bytes));
        let (query_id, bytes) = largest(totals)?;
        log_victim(self.name(), query_id, bytes);
        Some(KillTarget::WholeQuery(query_id.clone()))
    }
}

/// For queries retried per task, kills the largest such task on every blocked node.
#[derive(Debug, Default, Clone, Copy)]
pub struct TotalReservationOnBlockedNodesTaskKiller;

impl LowMemoryKiller for TotalReservationOnBlockedNodesTaskKiller {
    fn name(&self) -> &'static str {
        "total-reservation-on-blocked-nodes-task"
    }

    fn choose_target_to_kill(
        &self,
        running: &[RunningQueryInfo],
        nodes: &[MemoryInfo],
    ) -> Option<KillTarget> {
        let policies = retry_policies(running);
        let mut tasks = BTreeSet::new();
        for node in nodes.iter().filter(|node| node.is_blocked()) {
            let victim = node
                .pool
                .task_memory_reservations
                .iter()
                .filter(|task| {
                    task.bytes > 0
                        && policies.get(&task.task_id.query_id) == Some(&RetryPolicy::Task)
                })
                .max_by(|a, b| a.bytes.cmp(&b.bytes).then_with(|| b.task_id.cmp(&a.task_id)));
            if let Some(task) = victim {
                tracing::debug!(
                    target: "sluice.memory",
                    node_id = %node.node_id,
                    task_id = %task.task_id,
                    reservation_bytes = task.bytes,
                    "selected task on blocked node"
                );
                tasks.insert(task.task_id.clone());
            }
        }

        if tasks.is_empty() {
            return None;
        }
        tracing::info!(
            target: "sluice.memory",
            killer = self.name(),
            tasks = tasks.len(),
            "low memory killer selected tasks"
        );
        Some(KillTarget::Tasks(tasks))
    }
}

/// Never kills anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoneKiller;

impl LowMemoryKiller for NoneKiller {
    fn name(&self) -> &'static str {
        "none"
    }

    fn choose_target_to_kill(
        &self,
        _running: &[RunningQueryInfo],
        _nodes: &[MemoryInfo],
    ) -> Option<KillTarget> {
        None
    }
}

/// Consults strategies in order; the first one that picks a target wins.
#[derive(Debug, Default)]
pub struct ChainedKiller {
    killers: Vec<Box<dyn LowMemoryKiller>>,
}

impl ChainedKiller {
    pub fn new(killers: Vec<Box<dyn LowMemoryKiller>>) -> Self {
        Self { killers }
    }

    pub fn len(&self) -> usize {
        self.killers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.killers.is_empty()
    }
}

impl LowMemoryKiller for ChainedKiller {
    fn name(&self) -> &'static str {
        "chained"
    }

    fn choose_target_to_kill(
        &self,
        running: &[RunningQueryInfo],
        nodes: &[MemoryInfo],
    ) -> Option<KillTarget> {
        self.killers
            .iter()
            .find_map(|killer| killer.choose_target_to_kill(running, nodes))
    }
}

/// Configured query-killing strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LowMemoryKillerPolicy {
    None,
    TotalReservation,
    #[default]
    TotalReservationOnBlockedNodes,
}

impl LowMemoryKillerPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            LowMemoryKillerPolicy::None => "none",
            LowMemoryKillerPolicy::TotalReservation => "total-reservation",
            LowMemoryKillerPolicy::TotalReservationOnBlockedNodes => {
                "total-reservation-on-blocked-nodes"
            }
        }
    }

    /// Builds the killer. With `task_killer` set, per-task victims of
    /// task-retried queries are tried before falling back to whole queries.
    pub fn build(self, task_killer: bool) -> Box<dyn LowMemoryKiller> {
        let query_killer: Option<Box<dyn LowMemoryKiller>> = match self {
            LowMemoryKillerPolicy::None => None,
            LowMemoryKillerPolicy::TotalReservation => Some(Box::new(TotalReservationQueryKiller)),
            LowMemoryKillerPolicy::TotalReservationOnBlockedNodes => {
                Some(Box::new(TotalReservationOnBlockedNodesQueryKiller))
            }
        };

        match (task_killer, query_killer) {
            (false, Some(killer)) => killer,
            (false, None) => Box::new(NoneKiller),
            (true, None) => Box::new(TotalReservationOnBlockedNodesTaskKiller),
            (true, Some(killer)) => Box::new(ChainedKiller::new(vec![
                Box::new(TotalReservationOnBlockedNodesTaskKiller),
                killer,
            ])),
        }
    }
}

impl fmt::Display for LowMemoryKillerPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown low memory killer policy {0:?}")]
pub struct UnknownKillerPolicy(pub String);

impl FromStr for LowMemoryKillerPolicy {
    type Err = UnknownKillerPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "none" => Ok(LowMemoryKillerPolicy::None),
            "total-reservation" => Ok(LowMemoryKillerPolicy::TotalReservation),
            "total-reservation-on-blocked-nodes" => {
                Ok(LowMemoryKillerPolicy::TotalReservationOnBlockedNodes)
            }
            _ => Err(UnknownKillerPolicy(s.to_owned())),
        }
    }
}

fn retry_policies(running: &[RunningQueryInfo]) -> HashMap<&QueryId, RetryPolicy> {
    running
        .iter()
        .map(|query| (&query.query_id, query.retry_policy))
        .collect()
}

/// Largest positive total; ties go to the smallest query id.
fn largest<'a>(totals: impl IntoIterator<Item = (&'a QueryId, u64)>) -> Option<(&'a QueryId, u64)> {
    totals
        .into_iter()
        .filter(|(_, bytes)| *bytes > 0)
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))
}

fn log_victim(killer: &'static str, query_id: &QueryId, bytes: u64) {
    tracing::info!(
        target: "sluice.memory",
        killer,
        query_id = %query_id,
        reservation_bytes = bytes,
        "low memory killer selected query"
    );
}
