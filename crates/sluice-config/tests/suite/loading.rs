use std::io::Write;

use sluice_config::{ByteSize, ConfigError, SluiceConfig};
use sluice_memory::LowMemoryKillerPolicy;
use sluice_resource_groups::SchedulingPolicy;

use super::SAMPLE;

#[test]
fn sample_config_loads_cleanly() {
    let (config, diagnostics) = SluiceConfig::load_from_str_with_diagnostics(SAMPLE).unwrap();
    assert!(diagnostics.is_empty(), "{diagnostics:?}");

    assert!(config.logging.json);
    assert!(!config.logging.stderr);
    assert_eq!(config.scheduler.refresh_interval_ms, 250);
    assert_eq!(
        config.memory.low_memory_killer,
        LowMemoryKillerPolicy::TotalReservation
    );
    assert!(config.memory.task_killer);

    let root = &config.resource_groups[0];
    assert_eq!(root.name, "global");
    assert_eq!(root.scheduling_policy, Some(SchedulingPolicy::WeightedFair));
    assert_eq!(root.soft_memory_limit, Some(ByteSize(64 << 30)));

    let names: Vec<_> = root.sub_groups.iter().map(|group| group.name.as_str()).collect();
    assert_eq!(names, ["etl", "adhoc"]);
    assert_eq!(root.sub_groups[0].soft_memory_limit, Some(ByteSize(1 << 30)));
    assert_eq!(root.sub_groups[1].sub_groups[0].name, "alice");
}

#[test]
fn empty_config_uses_defaults() {
    let (config, diagnostics) = SluiceConfig::load_from_str_with_diagnostics("").unwrap();
    assert!(diagnostics.is_empty());
    assert_eq!(config, SluiceConfig::default());
    assert_eq!(config.logging.level, "info");
    assert_eq!(config.scheduler.refresh_interval_ms, 100);
    assert_eq!(
        config.memory.low_memory_killer,
        LowMemoryKillerPolicy::TotalReservationOnBlockedNodes
    );
    assert!(config.resource_groups.is_empty());
}

#[test]
fn loads_from_a_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(SAMPLE.as_bytes()).unwrap();

    let config = SluiceConfig::load_from_path(file.path()).unwrap();
    assert_eq!(config.resource_groups.len(), 1);

    let (with_diagnostics, diagnostics) =
        SluiceConfig::load_from_path_with_diagnostics(file.path()).unwrap();
    assert!(diagnostics.is_ok());
    assert_eq!(with_diagnostics, config);
}

#[test]
fn missing_file_reports_the_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sluice.toml");
    let err = SluiceConfig::load_from_path(&path).unwrap_err();
    match err {
        ConfigError::Io { path: reported, .. } => assert_eq!(reported, path.display().to_string()),
        other => panic!("expected an io error, got {other:?}"),
    }
}

#[test]
fn unknown_keys_are_collected_with_full_paths() {
    let text = r#"
[scheduler]
refresh_intervall_ms = 10

[[resource_groups]]
name = "global"

[[resource_groups.sub_groups]]
name = "etl"
max_queud = 3
"#;
    let (config, diagnostics) = SluiceConfig::load_from_str_with_diagnostics(text).unwrap();
    assert_eq!(
        diagnostics.unknown_keys,
        vec![
            "resource_groups[0].sub_groups[0].max_queud".to_owned(),
            "scheduler.refresh_intervall_ms".to_owned(),
        ]
    );
    assert!(diagnostics.is_ok());
    assert_eq!(config.scheduler.refresh_interval_ms, 100);
    assert_eq!(config.resource_groups[0].sub_groups[0].max_queued, None);
}

#[test]
fn bad_byte_sizes_are_rejected_without_echoing_them() {
    let text = r#"
[[resource_groups]]
name = "global"
soft_memory_limit = "12 parsecs"
"#;
    let err = SluiceConfig::load_from_str_with_diagnostics(text).unwrap_err();
    let message = err.to_string();
    assert!(matches!(err, ConfigError::Toml(_)));
    assert!(message.contains("unknown unit in byte size"), "{message}");
    assert!(!message.contains("parsecs"), "{message}");
}

#[test]
fn unknown_policies_are_hard_errors() {
    let text = r#"
[[resource_groups]]
name = "global"
scheduling_policy = "round_robin"
"#;
    let err = SluiceConfig::load_from_str_with_diagnostics(text).unwrap_err();
    assert!(!err.to_string().contains("round_robin"), "{err}");
}
