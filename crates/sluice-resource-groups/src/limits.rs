use serde::{Deserialize, Serialize};
use sluice_core::ResourceGroupId;

use crate::error::ResourceGroupError;
use crate::policy::SchedulingPolicy;

/// Quotas and scheduling knobs of a single resource group.
///
/// Defaults are unbounded so a freshly created group admits everything until
/// it is configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupLimits {
    pub scheduling_policy: SchedulingPolicy,
    pub scheduling_weight: u32,
    pub soft_memory_limit_bytes: u64,
    pub hard_concurrency_limit: usize,
    /// `None` tracks `hard_concurrency_limit`.
    pub soft_concurrency_limit: Option<usize>,
    pub max_queued_queries: usize,
    /// `None` tracks `hard_cpu_limit_millis` (no penalty band).
    pub soft_cpu_limit_millis: Option<u64>,
    pub hard_cpu_limit_millis: u64,
    pub cpu_quota_generation_millis_per_second: u64,
}

impl Default for GroupLimits {
    fn default() -> Self {
        Self {
            scheduling_policy: SchedulingPolicy::Fair,
            scheduling_weight: 1,
            soft_memory_limit_bytes: u64::MAX,
            hard_concurrency_limit: usize::MAX,
            soft_concurrency_limit: None,
            max_queued_queries: usize::MAX,
            soft_cpu_limit_millis: None,
            hard_cpu_limit_millis: u64::MAX,
            cpu_quota_generation_millis_per_second: 0,
        }
    }
}

impl GroupLimits {
    pub fn effective_soft_concurrency_limit(&self) -> usize {
        self.soft_concurrency_limit
            .unwrap_or(self.hard_concurrency_limit)
    }

    pub fn effective_soft_cpu_limit_millis(&self) -> u64 {
        self.soft_cpu_limit_millis
            .unwrap_or(self.hard_cpu_limit_millis)
    }

    /// Concurrency limit after applying the soft CPU penalty.
    ///
    /// Between the soft and hard CPU limits the hard concurrency limit shrinks
    /// linearly, always by at least one and never below one running query.
    /// Only usage above the hard CPU limit closes the group entirely.
    pub fn effective_concurrency_limit(&self, cpu_usage_millis: u64) -> usize {
        let hard = self.hard_concurrency_limit;
        let soft_cpu = self.effective_soft_cpu_limit_millis();
        if hard == 0 || cpu_usage_millis < soft_cpu {
            return hard;
        }
        if cpu_usage_millis > self.hard_cpu_limit_millis {
            return 0;
        }
        if soft_cpu >= self.hard_cpu_limit_millis {
            return hard;
        }

        let span = (self.hard_cpu_limit_millis - soft_cpu) as f64;
        let penalty = (cpu_usage_millis - soft_cpu) as f64 / span;
        let scaled = ((hard as f64) * (1.0 - penalty)).floor() as usize;
        scaled.min(hard - 1).max(1)
    }

    /// Checks internal consistency and consistency with the group's current load.
    pub(crate) fn validate(
        &self,
        group: &ResourceGroupId,
        running: usize,
        queued: usize,
    ) -> Result<(), ResourceGroupError> {
        let invalid = |message: String| ResourceGroupError::InvalidConfiguration {
            group: group.clone(),
            message,
        };

        if self.scheduling_weight == 0 {
            return Err(invalid("scheduling weight must be positive".to_owned()));
        }
        if let Some(soft) = self.soft_cpu_limit_millis {
            if soft > self.hard_cpu_limit_millis {
                return Err(invalid(format!(
                    "soft cpu limit ({soft}ms) exceeds hard cpu limit ({}ms)",
                    self.hard_cpu_limit_millis
                )));
            }
        }
        if let Some(soft) = self.soft_concurrency_limit {
            if soft > self.hard_concurrency_limit {
                return Err(invalid(format!(
                    "soft concurrency limit ({soft}) exceeds hard concurrency limit ({})",
                    self.hard_concurrency_limit
                )));
            }
        }
        if self.hard_concurrency_limit < running {
            return Err(invalid(format!(
                "hard concurrency limit ({}) is below the {running} queries currently running",
                self.hard_concurrency_limit
            )));
        }
        if self.max_queued_queries < queued {
            return Err(invalid(format!(
                "max queued queries ({}) is below the {queued} queries currently queued",
                self.max_queued_queries
            )));
        }
        Ok(())
    }
}
