//! Core shared types for Sluice.
//!
//! This crate is intentionally small: identities, query lifecycle states and the
//! [`ManagedQueryExecution`] contract through which the planner hands queries to
//! resource groups.

mod ids;
mod query;

pub use ids::{InvalidGroupName, QueryId, ResourceGroupId, TaskId};
pub use query::{
    ErrorKind, ManagedQueryExecution, QueryError, QueryState, RetryPolicy, StateChangeListener,
};
