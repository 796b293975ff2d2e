use std::cmp::Reverse;
use std::collections::VecDeque;
use std::sync::Arc;

use rand::Rng;
use sluice_core::{ManagedQueryExecution, QueryId};

use crate::policy::{pick_weighted, SchedulingPolicy};

struct QueuedQuery {
    query: Arc<dyn ManagedQueryExecution>,
    priority: i32,
}

/// Queries waiting directly in one group, kept in submission order.
///
/// The active policy is applied when polling, so switching policies re-orders
/// the backlog without rebuilding it.
#[derive(Default)]
pub(crate) struct DirectQueue {
    entries: VecDeque<QueuedQuery>,
}

impl DirectQueue {
    pub(crate) fn push(&mut self, query: Arc<dyn ManagedQueryExecution>) {
        let priority = query.priority();
        self.entries.push_back(QueuedQuery { query, priority });
    }

    /// Removes `query_id` if present. Returns whether it was queued.
    pub(crate) fn remove(&mut self, query_id: &QueryId) -> bool {
        match self
            .entries
            .iter()
            .position(|entry| entry.query.query_id() == query_id)
        {
            Some(idx) => {
                self.entries.remove(idx);
                true
            }
            None => false,
        }
    }

    pub(crate) fn poll<R: Rng + ?Sized>(
        &mut self,
        policy: SchedulingPolicy,
        rng: &mut R,
    ) -> Option<Arc<dyn ManagedQueryExecution>> {
        let idx = match policy {
            SchedulingPolicy::Fair | SchedulingPolicy::WeightedFair => {
                if self.entries.is_empty() {
                    None
                } else {
                    Some(0)
                }
            }
            SchedulingPolicy::QueryPriority => self
                .entries
                .iter()
                .enumerate()
                .min_by_key(|(_, entry)| Reverse(entry.priority))
                .map(|(idx, _)| idx),
            SchedulingPolicy::Weighted => {
                let pool: Vec<usize> = (0..self.entries.len()).collect();
                pick_weighted(&pool, rng, |idx| {
                    u64::try_from(self.entries[idx].priority.max(1)).unwrap_or(1)
                })
            }
        }?;
        self.entries.remove(idx).map(|entry| entry.query)
    }

    pub(crate) fn highest_priority(&self) -> Option<i32> {
        self.entries.iter().map(|entry| entry.priority).max()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
