use sluice_core::QueryState;
use sluice_resource_groups::{GroupLimits, ResourceGroupState, SchedulingPolicy};
use sluice_test_utils::TestQuery;

use super::{child_with, concurrency, root_with};

#[test]
fn state_tracks_run_and_queue_capacity() {
    let root = root_with(GroupLimits {
        hard_concurrency_limit: 1,
        max_queued_queries: 1,
        ..GroupLimits::default()
    });
    assert_eq!(root.state(), ResourceGroupState::CanRun);
    root.run(TestQuery::new("a"));
    assert_eq!(root.state(), ResourceGroupState::CanQueue);
    root.run(TestQuery::new("b"));
    assert_eq!(root.state(), ResourceGroupState::Full);
}

#[test]
fn info_snapshots_nest_as_documented() {
    let root = root_with(concurrency(1));
    let a = child_with(&root, "a", GroupLimits::default());
    let leaf = child_with(&a, "leaf", GroupLimits::default());
    let running = TestQuery::builder("running").memory_bytes(64).build();
    leaf.run(running.clone());
    leaf.run(TestQuery::new("waiting"));

    let summary = root.summary_info();
    assert!(summary.sub_groups.is_none());
    assert!(summary.running_queries.is_none());
    assert_eq!(summary.num_running_queries, 1);
    assert_eq!(summary.num_queued_queries, 1);
    assert_eq!(summary.memory_usage_bytes, 64);

    let info = root.info();
    let sub_groups = info.sub_groups.expect("immediate sub-groups");
    assert_eq!(sub_groups.len(), 1);
    assert!(sub_groups[0].sub_groups.is_none());

    let full = root.full_info();
    let a_info = &full.sub_groups.as_ref().unwrap()[0];
    let leaf_info = &a_info.sub_groups.as_ref().unwrap()[0];
    assert_eq!(leaf_info.id.to_string(), "global.a.leaf");
    let queries = leaf_info.running_queries.as_ref().unwrap();
    assert_eq!(queries.len(), 1);
    assert_eq!(queries[0].query_id.as_str(), "running");
    assert_eq!(queries[0].state, QueryState::Running);
    assert_eq!(queries[0].memory_reservation_bytes, 64);
    assert_eq!(queries[0].resource_group_id, *leaf.id());
    assert!(full.running_queries.as_ref().unwrap().is_empty());

    let path: Vec<String> = leaf
        .path_to_root_info()
        .iter()
        .map(|info| info.id.to_string())
        .collect();
    assert_eq!(path, ["global.a.leaf", "global.a", "global"]);
}

#[test]
fn info_serializes_with_stable_field_names() {
    let root = root_with(GroupLimits {
        hard_concurrency_limit: 4,
        scheduling_policy: SchedulingPolicy::WeightedFair,
        ..GroupLimits::default()
    });
    child_with(&root, "adhoc", GroupLimits::default());

    let value = serde_json::to_value(root.info()).unwrap();
    for field in [
        "id",
        "state",
        "schedulingPolicy",
        "schedulingWeight",
        "softMemoryLimitBytes",
        "memoryUsageBytes",
        "cpuUsageMillis",
        "softConcurrencyLimit",
        "hardConcurrencyLimit",
        "maxQueuedQueries",
        "numQueuedQueries",
        "numRunningQueries",
        "numEligibleSubGroups",
        "subGroups",
    ] {
        assert!(value.get(field).is_some(), "missing {field}: {value}");
    }
    assert!(value.get("runningQueries").is_none());
    assert_eq!(value["id"], "global");
    assert_eq!(value["state"], "CAN_RUN");
    assert_eq!(value["schedulingPolicy"], "weighted_fair");
    assert_eq!(value["softConcurrencyLimit"], 4);
    assert_eq!(value["subGroups"][0]["id"], "global.adhoc");
}

#[test]
fn runtime_info_splits_direct_and_descendant_counts() {
    let root = root_with(concurrency(2));
    let child = child_with(&root, "c", GroupLimits::default());
    root.run(TestQuery::new("direct"));
    child.run(TestQuery::new("nested"));
    child.run(TestQuery::new("nested-queued"));

    let runtime = root.runtime_info();
    assert_eq!(runtime.running_queries, 1);
    assert_eq!(runtime.descendant_running_queries, 1);
    assert_eq!(runtime.queued_queries, 0);
    assert_eq!(runtime.descendant_queued_queries, 1);
    assert_eq!(runtime.sub_groups.len(), 1);
    assert_eq!(runtime.sub_groups[0].queued_queries, 1);

    let value = serde_json::to_value(&runtime).unwrap();
    assert_eq!(value["resourceGroupId"], "global");
    assert_eq!(value["descendantRunningQueries"], 1);
}

#[test]
fn eligible_sub_groups_are_counted() {
    let root = root_with(concurrency(1));
    let a = child_with(&root, "a", GroupLimits::default());
    let b = child_with(&root, "b", GroupLimits::default());
    a.run(TestQuery::new("a0"));
    a.run(TestQuery::new("a1"));
    b.run(TestQuery::new("b0"));

    // Both children have queued work and spare local capacity.
    assert_eq!(root.info().num_eligible_sub_groups, 2);
}
