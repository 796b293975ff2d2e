use std::cmp::Reverse;
use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Virtual time advanced by one service of a unit with weight 1.
///
/// Divisible by every weight up to 16 so common weights advance without
/// rounding.
pub const VIRTUAL_TIME_SCALE: u64 = 720_720_000;

/// Ordering discipline used by a resource group to pick the next unit of work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingPolicy {
    /// FIFO queue; eligible units visited least-recently-serviced first.
    #[default]
    Fair,
    /// Random choice proportional to scheduling weight.
    Weighted,
    /// Start-time fair queuing on per-unit virtual finish times.
    WeightedFair,
    /// Highest query priority first, across the whole subtree.
    QueryPriority,
}

impl SchedulingPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            SchedulingPolicy::Fair => "fair",
            SchedulingPolicy::Weighted => "weighted",
            SchedulingPolicy::WeightedFair => "weighted_fair",
            SchedulingPolicy::QueryPriority => "query_priority",
        }
    }

    /// Picks the index of the next candidate to service.
    ///
    /// Candidates must be supplied in tie-break order: when two candidates are
    /// equally preferred, the one earlier in the slice wins.
    pub fn select<R: Rng + ?Sized>(self, candidates: &[Candidate], rng: &mut R) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }

        match self {
            SchedulingPolicy::Fair => candidates
                .iter()
                .enumerate()
                .min_by_key(|(_, candidate)| candidate.last_serviced)
                .map(|(idx, _)| idx),
            SchedulingPolicy::Weighted => {
                let pool = preferred(candidates);
                pick_weighted(&pool, rng, |idx| u64::from(candidates[idx].weight.max(1)))
            }
            SchedulingPolicy::WeightedFair => preferred(candidates)
                .into_iter()
                .min_by_key(|&idx| candidates[idx].next_virtual_finish),
            SchedulingPolicy::QueryPriority => candidates
                .iter()
                .enumerate()
                .min_by_key(|(_, candidate)| {
                    (Reverse(candidate.priority), candidate.last_serviced)
                })
                .map(|(idx, _)| idx),
        }
    }
}

impl fmt::Display for SchedulingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown scheduling policy {0:?}")]
pub struct UnknownSchedulingPolicy(pub String);

impl FromStr for SchedulingPolicy {
    type Err = UnknownSchedulingPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "fair" => Ok(SchedulingPolicy::Fair),
            "weighted" => Ok(SchedulingPolicy::Weighted),
            "weighted_fair" => Ok(SchedulingPolicy::WeightedFair),
            "query_priority" => Ok(SchedulingPolicy::QueryPriority),
            _ => Err(UnknownSchedulingPolicy(s.to_owned())),
        }
    }
}

/// A schedulable unit inside a group: its own queue or one of its sub-groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Unit {
    Direct,
    SubGroup(usize),
}

/// Snapshot of a unit's scheduling state, consumed by [`SchedulingPolicy::select`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub unit: Unit,
    pub weight: u32,
    /// Tick of the last time this unit was serviced (0 = never).
    pub last_serviced: u64,
    /// Virtual finish time this unit would reach if serviced next.
    pub next_virtual_finish: u64,
    /// Highest priority among its eligible queued queries.
    pub priority: i32,
    pub below_soft_concurrency: bool,
}

/// Per-unit bookkeeping kept by the owning group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceRecord {
    pub last_serviced: u64,
    pub virtual_finish: u64,
    /// Whether the unit was competing for service at the last scheduling pass.
    pub active: bool,
}

impl ServiceRecord {
    /// Marks whether the unit currently competes for service. A unit that
    /// rejoins is moved up to the group's virtual clock so time spent idle
    /// does not turn into credit.
    pub fn set_active(&mut self, active: bool, virtual_clock: u64) {
        if active && !self.active {
            self.virtual_finish = self.virtual_finish.max(virtual_clock);
        }
        self.active = active;
    }

    pub fn next_virtual_finish(&self, weight: u32) -> u64 {
        self.virtual_finish.saturating_add(virtual_step(weight))
    }

    /// Records one service at `tick`, advancing the unit's finish time and the
    /// group's virtual clock to the start tag of this service.
    pub fn record(&mut self, tick: u64, virtual_clock: &mut u64, weight: u32) {
        let start = self.virtual_finish;
        *virtual_clock = (*virtual_clock).max(start);
        self.virtual_finish = start.saturating_add(virtual_step(weight));
        self.last_serviced = tick;
    }
}

fn virtual_step(weight: u32) -> u64 {
    VIRTUAL_TIME_SCALE / u64::from(weight.max(1))
}

/// Candidates below their soft concurrency limit win over those at or above it.
fn preferred(candidates: &[Candidate]) -> Vec<usize> {
    let below: Vec<usize> = candidates
        .iter()
        .enumerate()
        .filter(|(_, candidate)| candidate.below_soft_concurrency)
        .map(|(idx, _)| idx)
        .collect();
    if below.is_empty() {
        (0..candidates.len()).collect()
    } else {
        below
    }
}

/// Draws one element of `pool` with probability proportional to `weight`.
pub(crate) fn pick_weighted<R, F>(pool: &[usize], rng: &mut R, weight: F) -> Option<usize>
where
    R: Rng + ?Sized,
    F: Fn(usize) -> u64,
{
    let total: u64 = pool
        .iter()
        .map(|&idx| weight(idx))
        .fold(0u64, u64::saturating_add);
    if total == 0 {
        return pool.first().copied();
    }

    let mut ticket = rng.random_range(0..total);
    for &idx in pool {
        let w = weight(idx);
        if ticket < w {
            return Some(idx);
        }
        ticket -= w;
    }
    pool.last().copied()
}
