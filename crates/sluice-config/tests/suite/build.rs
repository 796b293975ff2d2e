use std::time::Duration;

use sluice_config::{build_resource_groups, ResourceGroupConfig, SluiceConfig, DEFAULT_ROOT_GROUP};
use sluice_core::{ManagedQueryExecution, QueryState, ResourceGroupId};
use sluice_memory::{MemoryInfo, RunningQueryInfo};
use sluice_resource_groups::{Admission, GroupLimits, ResourceGroupError, SchedulingPolicy};
use sluice_test_utils::TestQuery;

use super::SAMPLE;

fn id(path: &str) -> ResourceGroupId {
    ResourceGroupId::parse(path).unwrap()
}

fn sample() -> SluiceConfig {
    SluiceConfig::load_from_str_with_diagnostics(SAMPLE).unwrap().0
}

#[test]
fn builds_the_declared_tree() {
    let manager = build_resource_groups(&sample()).unwrap();
    assert_eq!(manager.refresh_interval(), Duration::from_millis(250));
    assert_eq!(manager.root().id(), &id("global"));

    let root = manager.root().limits();
    assert_eq!(root.scheduling_policy, SchedulingPolicy::WeightedFair);
    assert_eq!(root.hard_concurrency_limit, 100);
    assert_eq!(root.max_queued_queries, 1000);
    assert_eq!(root.soft_memory_limit_bytes, 64 << 30);

    let adhoc = manager.group(&id("global.adhoc")).unwrap().limits();
    assert_eq!(
        adhoc,
        GroupLimits {
            scheduling_policy: SchedulingPolicy::Fair,
            scheduling_weight: 1,
            soft_memory_limit_bytes: u64::MAX,
            hard_concurrency_limit: 2,
            soft_concurrency_limit: Some(1),
            max_queued_queries: 5,
            soft_cpu_limit_millis: Some(300_000),
            hard_cpu_limit_millis: 600_000,
            cpu_quota_generation_millis_per_second: 2_000,
        }
    );
    assert_eq!(
        manager.group(&id("global.etl")).unwrap().limits().scheduling_weight,
        3
    );
    assert!(manager.group(&id("global.adhoc.alice")).is_some());

    let info = manager.full_info();
    let children: Vec<_> = info
        .sub_groups
        .unwrap_or_default()
        .into_iter()
        .map(|group| group.id.to_string())
        .collect();
    assert_eq!(children, ["global.etl", "global.adhoc"]);
}

#[test]
fn configured_limits_govern_admission() {
    let manager = build_resource_groups(&sample()).unwrap();
    let alice = id("global.adhoc.alice");

    let first = TestQuery::new("q1");
    let second = TestQuery::new("q2");
    assert_eq!(manager.submit(&alice, first.clone()).unwrap(), Admission::Running);
    assert_eq!(manager.submit(&alice, second.clone()).unwrap(), Admission::Queued);
    assert_eq!(
        manager.submit(&alice, TestQuery::new("q3")).unwrap(),
        Admission::Rejected(ResourceGroupError::QueryQueueFull {
            group: alice.clone()
        })
    );

    first.complete();
    manager.refresh_and_start_queries();
    assert_eq!(second.state(), QueryState::Running);
}

#[test]
fn empty_config_builds_an_unbounded_default_root() {
    let manager = build_resource_groups(&SluiceConfig::default()).unwrap();
    assert_eq!(manager.root().id(), &id(DEFAULT_ROOT_GROUP));
    assert_eq!(manager.root().limits(), GroupLimits::default());
    assert!(manager.root().sub_groups().is_empty());
}

#[test]
fn only_one_root_is_supported() {
    let config = SluiceConfig {
        resource_groups: vec![
            ResourceGroupConfig::new("global"),
            ResourceGroupConfig::new("batch"),
        ],
        ..SluiceConfig::default()
    };
    match build_resource_groups(&config).unwrap_err() {
        ResourceGroupError::InvalidConfiguration { group, .. } => assert_eq!(group, id("batch")),
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn duplicate_siblings_are_rejected() {
    let config = SluiceConfig {
        resource_groups: vec![ResourceGroupConfig {
            sub_groups: vec![ResourceGroupConfig::new("etl"), ResourceGroupConfig::new("etl")],
            ..ResourceGroupConfig::new("global")
        }],
        ..SluiceConfig::default()
    };
    match build_resource_groups(&config).unwrap_err() {
        ResourceGroupError::InvalidConfiguration { group, .. } => {
            assert_eq!(group, id("global.etl"))
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn invalid_limits_and_names_fail_the_build() {
    let inconsistent = SluiceConfig {
        resource_groups: vec![ResourceGroupConfig {
            sub_groups: vec![ResourceGroupConfig {
                hard_concurrency_limit: Some(1),
                soft_concurrency_limit: Some(2),
                ..ResourceGroupConfig::new("etl")
            }],
            ..ResourceGroupConfig::new("global")
        }],
        ..SluiceConfig::default()
    };
    assert!(matches!(
        build_resource_groups(&inconsistent),
        Err(ResourceGroupError::InvalidConfiguration { .. })
    ));

    let dotted = SluiceConfig {
        resource_groups: vec![ResourceGroupConfig::new("global.adhoc")],
        ..SluiceConfig::default()
    };
    assert!(matches!(
        build_resource_groups(&dotted),
        Err(ResourceGroupError::InvalidGroupName(_))
    ));
}

#[test]
fn memory_section_builds_the_killer() {
    let config = sample();
    let killer = config.memory.low_memory_killer();
    assert_eq!(killer.name(), "chained");
    let running = [RunningQueryInfo::new("q1", Default::default())];
    assert_eq!(killer.choose_target_to_kill(&running, &[MemoryInfo::default()]), None);

    let killer = SluiceConfig::default().memory.low_memory_killer();
    assert_eq!(killer.name(), "total-reservation-on-blocked-nodes");
}
