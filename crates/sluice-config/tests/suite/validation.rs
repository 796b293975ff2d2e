use sluice_config::{
    ConfigValidationError, ConfigWarning, LoggingConfig, ResourceGroupConfig, SchedulerConfig,
    SluiceConfig,
};
use sluice_resource_groups::SchedulingPolicy;

fn tree(root: ResourceGroupConfig) -> SluiceConfig {
    SluiceConfig {
        resource_groups: vec![root],
        ..SluiceConfig::default()
    }
}

#[test]
fn structural_errors_are_all_reported() {
    let config = SluiceConfig {
        scheduler: SchedulerConfig {
            refresh_interval_ms: 0,
        },
        resource_groups: vec![
            ResourceGroupConfig {
                sub_groups: vec![
                    ResourceGroupConfig::new("etl"),
                    ResourceGroupConfig::new("etl"),
                    ResourceGroupConfig::new("bad.name"),
                ],
                ..ResourceGroupConfig::new("global")
            },
            ResourceGroupConfig::new("batch"),
        ],
        ..SluiceConfig::default()
    };

    let diagnostics = config.validate();
    assert_eq!(
        diagnostics.errors,
        vec![
            ConfigValidationError::InvalidValue {
                toml_path: "scheduler.refresh_interval_ms".to_owned(),
                message: "must be >= 1".to_owned(),
            },
            ConfigValidationError::MultipleRootGroups {
                names: vec!["global".to_owned(), "batch".to_owned()],
            },
            ConfigValidationError::DuplicateGroupName {
                toml_path: "resource_groups[0].sub_groups[1].name".to_owned(),
                name: "etl".to_owned(),
            },
            ConfigValidationError::InvalidGroupName {
                toml_path: "resource_groups[0].sub_groups[2].name".to_owned(),
                name: "bad.name".to_owned(),
            },
        ]
    );
}

#[test]
fn inconsistent_limits_are_errors() {
    let config = tree(ResourceGroupConfig {
        hard_concurrency_limit: Some(2),
        soft_concurrency_limit: Some(3),
        hard_cpu_limit_ms: Some(1_000),
        soft_cpu_limit_ms: Some(2_000),
        cpu_quota_generation_ms_per_second: Some(100),
        ..ResourceGroupConfig::new("global")
    });

    let diagnostics = config.validate();
    assert!(diagnostics.warnings.is_empty(), "{diagnostics:?}");
    assert_eq!(
        diagnostics.errors,
        vec![
            ConfigValidationError::InvalidValue {
                toml_path: "resource_groups[0].soft_concurrency_limit".to_owned(),
                message: "must not exceed hard_concurrency_limit (2)".to_owned(),
            },
            ConfigValidationError::InvalidValue {
                toml_path: "resource_groups[0].soft_cpu_limit_ms".to_owned(),
                message: "must not exceed hard_cpu_limit_ms (1000)".to_owned(),
            },
        ]
    );
}

#[test]
fn cpu_quota_misconfiguration_warns() {
    let config = tree(ResourceGroupConfig {
        sub_groups: vec![
            ResourceGroupConfig {
                hard_cpu_limit_ms: Some(1_000),
                ..ResourceGroupConfig::new("capped")
            },
            ResourceGroupConfig {
                cpu_quota_generation_ms_per_second: Some(10),
                ..ResourceGroupConfig::new("refilled")
            },
        ],
        ..ResourceGroupConfig::new("global")
    });

    let diagnostics = config.validate();
    assert!(diagnostics.is_ok());
    assert!(!diagnostics.is_empty());
    assert_eq!(
        diagnostics.warnings,
        vec![
            ConfigWarning::CpuQuotaNeverRegenerated {
                toml_path: "resource_groups[0].sub_groups[0].hard_cpu_limit_ms".to_owned(),
            },
            ConfigWarning::CpuQuotaGenerationUnused {
                toml_path: "resource_groups[0].sub_groups[1].cpu_quota_generation_ms_per_second"
                    .to_owned(),
            },
        ]
    );
}

#[test]
fn weights_under_unweighted_parents_warn() {
    let weighted_child = ResourceGroupConfig {
        scheduling_weight: Some(4),
        ..ResourceGroupConfig::new("child")
    };

    let fair = tree(ResourceGroupConfig {
        sub_groups: vec![weighted_child.clone()],
        ..ResourceGroupConfig::new("global")
    });
    assert_eq!(
        fair.validate().warnings,
        vec![ConfigWarning::SchedulingWeightIgnored {
            toml_path: "resource_groups[0].sub_groups[0].scheduling_weight".to_owned(),
            parent_policy: "fair",
        }]
    );

    let weighted = tree(ResourceGroupConfig {
        scheduling_policy: Some(SchedulingPolicy::Weighted),
        sub_groups: vec![weighted_child],
        ..ResourceGroupConfig::new("global")
    });
    assert!(weighted.validate().warnings.is_empty());
}

#[test]
fn invalid_logging_level_warns() {
    let config = SluiceConfig {
        logging: LoggingConfig {
            level: "sluice=notalevel".to_owned(),
            ..LoggingConfig::default()
        },
        ..SluiceConfig::default()
    };
    let diagnostics = config.validate();
    assert!(diagnostics.is_ok());
    assert!(matches!(
        diagnostics.warnings.as_slice(),
        [ConfigWarning::LoggingLevelInvalid { value, .. }] if value == "sluice=notalevel"
    ));
}

#[test]
fn validation_runs_when_loading() {
    let text = r#"
[scheduler]
refresh_interval_ms = 0
"#;
    let (_, diagnostics) = SluiceConfig::load_from_str_with_diagnostics(text).unwrap();
    assert!(!diagnostics.is_ok());
    assert_eq!(diagnostics.errors.len(), 1);
}
