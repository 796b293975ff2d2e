use std::collections::HashSet;

use sluice_core::ResourceGroupId;
use sluice_resource_groups::SchedulingPolicy;

use crate::diagnostics::{ConfigValidationError, ConfigWarning, ValidationDiagnostics};
use crate::{LoggingConfig, ResourceGroupConfig, SluiceConfig};

impl SluiceConfig {
    /// Checks semantic invariants, reporting as many problems as possible in
    /// one pass.
    #[must_use]
    pub fn validate(&self) -> ValidationDiagnostics {
        let mut out = ValidationDiagnostics::default();

        validate_logging(&self.logging, &mut out);
        validate_scheduler(self, &mut out);
        validate_resource_groups(&self.resource_groups, &mut out);

        out
    }
}

fn validate_logging(config: &LoggingConfig, out: &mut ValidationDiagnostics) {
    let normalized = LoggingConfig::normalize_level_directives(&config.level);
    if !config.level.trim().is_empty()
        && tracing_subscriber::EnvFilter::try_new(normalized.clone()).is_err()
    {
        out.warnings.push(ConfigWarning::LoggingLevelInvalid {
            value: config.level.clone(),
            normalized,
        });
    }
}

fn validate_scheduler(config: &SluiceConfig, out: &mut ValidationDiagnostics) {
    if config.scheduler.refresh_interval_ms == 0 {
        out.errors.push(ConfigValidationError::InvalidValue {
            toml_path: "scheduler.refresh_interval_ms".to_owned(),
            message: "must be >= 1".to_owned(),
        });
    }
}

fn validate_resource_groups(roots: &[ResourceGroupConfig], out: &mut ValidationDiagnostics) {
    if roots.len() > 1 {
        out.errors.push(ConfigValidationError::MultipleRootGroups {
            names: roots.iter().map(|root| root.name.clone()).collect(),
        });
    }
    validate_siblings(roots, "resource_groups", None, out);
}

fn validate_siblings(
    groups: &[ResourceGroupConfig],
    table: &str,
    parent_policy: Option<SchedulingPolicy>,
    out: &mut ValidationDiagnostics,
) {
    let mut seen = HashSet::new();
    for (idx, group) in groups.iter().enumerate() {
        let toml_path = format!("{table}[{idx}]");

        if ResourceGroupId::new_root(group.name.as_str()).is_err() {
            out.errors.push(ConfigValidationError::InvalidGroupName {
                toml_path: format!("{toml_path}.name"),
                name: group.name.clone(),
            });
        } else if !seen.insert(group.name.as_str()) {
            out.errors.push(ConfigValidationError::DuplicateGroupName {
                toml_path: format!("{toml_path}.name"),
                name: group.name.clone(),
            });
        }

        validate_group(group, &toml_path, parent_policy, out);
        validate_siblings(
            &group.sub_groups,
            &format!("{toml_path}.sub_groups"),
            Some(group.limits().scheduling_policy),
            out,
        );
    }
}

fn validate_group(
    group: &ResourceGroupConfig,
    toml_path: &str,
    parent_policy: Option<SchedulingPolicy>,
    out: &mut ValidationDiagnostics,
) {
    let invalid = |key: &str, message: String| ConfigValidationError::InvalidValue {
        toml_path: format!("{toml_path}.{key}"),
        message,
    };

    if let Some(weight) = group.scheduling_weight {
        if weight == 0 {
            out.errors
                .push(invalid("scheduling_weight", "must be >= 1".to_owned()));
        } else if let Some(
            policy @ (SchedulingPolicy::Fair | SchedulingPolicy::QueryPriority),
        ) = parent_policy
        {
            out.warnings.push(ConfigWarning::SchedulingWeightIgnored {
                toml_path: format!("{toml_path}.scheduling_weight"),
                parent_policy: policy.as_str(),
            });
        }
    }

    if let (Some(soft), Some(hard)) = (group.soft_concurrency_limit, group.hard_concurrency_limit) {
        if soft > hard {
            out.errors.push(invalid(
                "soft_concurrency_limit",
                format!("must not exceed hard_concurrency_limit ({hard})"),
            ));
        }
    }

    if let (Some(soft), Some(hard)) = (group.soft_cpu_limit_ms, group.hard_cpu_limit_ms) {
        if soft > hard {
            out.errors.push(invalid(
                "soft_cpu_limit_ms",
                format!("must not exceed hard_cpu_limit_ms ({hard})"),
            ));
        }
    }

    let generation = group.cpu_quota_generation_ms_per_second.unwrap_or(0);
    let cpu_limited = group.hard_cpu_limit_ms.is_some() || group.soft_cpu_limit_ms.is_some();
    if cpu_limited && generation == 0 {
        out.warnings.push(ConfigWarning::CpuQuotaNeverRegenerated {
            toml_path: format!("{toml_path}.hard_cpu_limit_ms"),
        });
    }
    if !cpu_limited && generation > 0 {
        out.warnings.push(ConfigWarning::CpuQuotaGenerationUnused {
            toml_path: format!("{toml_path}.cpu_quota_generation_ms_per_second"),
        });
    }
}
