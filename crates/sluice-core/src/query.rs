use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ids::QueryId;

/// Admission-facing lifecycle of a query.
///
/// Transitions only move forward: `Queued -> Running -> {Finished, Failed}` or
/// `Queued -> Failed` when admission rejects the query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryState {
    Queued,
    Running,
    Finished,
    Failed,
}

impl QueryState {
    pub fn is_done(self) -> bool {
        matches!(self, QueryState::Finished | QueryState::Failed)
    }

    /// Whether moving from `self` to `next` is a legal forward transition.
    pub fn can_transition_to(self, next: QueryState) -> bool {
        matches!(
            (self, next),
            (QueryState::Queued, QueryState::Running)
                | (QueryState::Queued, QueryState::Failed)
                | (QueryState::Running, QueryState::Finished)
                | (QueryState::Running, QueryState::Failed)
        )
    }
}

impl fmt::Display for QueryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueryState::Queued => "QUEUED",
            QueryState::Running => "RUNNING",
            QueryState::Finished => "FINISHED",
            QueryState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// How the execution engine recovers from failures of a query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetryPolicy {
    #[default]
    None,
    Query,
    Task,
}

/// Classification of a query failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    UserError,
    InternalError,
    InsufficientResources,
    External,
}

/// Error a query is failed with.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct QueryError {
    pub kind: ErrorKind,
    pub message: String,
}

impl QueryError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn insufficient_resources(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InsufficientResources, message)
    }
}

pub type StateChangeListener = Box<dyn Fn(QueryState) + Send + Sync>;

/// A submitted query as seen by admission control.
///
/// Implementations are owned by the query lifecycle layer; resource groups
/// only observe usage, start queued queries and fail rejected ones.
pub trait ManagedQueryExecution: Send + Sync {
    fn query_id(&self) -> &QueryId;

    fn state(&self) -> QueryState;

    /// Scheduling priority; higher values start first under query-priority
    /// scheduling.
    fn priority(&self) -> i32;

    /// Current memory reservation across the cluster.
    fn memory_reservation_bytes(&self) -> u64;

    /// CPU time consumed so far. Expected to be monotonic.
    fn total_cpu_time(&self) -> Duration;

    fn retry_policy(&self) -> RetryPolicy;

    /// Kind of the failure once the query has failed.
    fn error_kind(&self) -> Option<ErrorKind>;

    /// Moves the query out of the admission queue so it starts executing.
    fn start_waiting_for_resources(&self);

    fn fail(&self, error: QueryError);

    /// Registers a callback invoked on every state change. If the query is
    /// already done the callback may be invoked synchronously.
    fn add_state_change_listener(&self, listener: StateChangeListener);
}
