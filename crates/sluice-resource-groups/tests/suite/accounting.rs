use sluice_core::{ErrorKind, ManagedQueryExecution, QueryState};
use sluice_resource_groups::{Admission, GroupLimits};
use sluice_test_utils::TestQuery;

use super::{child_with, root_with};

#[test]
fn exhausted_cpu_quota_queues_until_regenerated() {
    let root = root_with(GroupLimits {
        hard_concurrency_limit: 10,
        hard_cpu_limit_millis: 1_000,
        cpu_quota_generation_millis_per_second: 1_000,
        ..GroupLimits::default()
    });
    let hog = TestQuery::new("hog");
    assert_eq!(root.run(hog.clone()), Admission::Running);
    hog.set_cpu_millis(2_000);
    root.update_groups_and_process_queued_queries();
    assert_eq!(root.cpu_usage_millis(), 2_000);

    let next = TestQuery::new("next");
    assert_eq!(root.run(next.clone()), Admission::Queued);

    assert_eq!(root.generate_cpu_quota(2), 1);
    assert_eq!(root.cpu_usage_millis(), 0);
    assert_eq!(next.state(), QueryState::Running);
}

#[test]
fn partial_regeneration_unblocks_once_usage_reaches_hard_limit() {
    let root = root_with(GroupLimits {
        hard_cpu_limit_millis: 1_000,
        cpu_quota_generation_millis_per_second: 500,
        ..GroupLimits::default()
    });
    let hog = TestQuery::new("hog");
    root.run(hog.clone());
    hog.set_cpu_millis(2_000);
    root.update_groups_and_process_queued_queries();

    let next = TestQuery::new("next");
    assert_eq!(root.run(next.clone()), Admission::Queued);
    assert_eq!(root.generate_cpu_quota(1), 0);
    assert_eq!(root.cpu_usage_millis(), 1_500);
    assert_eq!(next.state(), QueryState::Queued);

    assert_eq!(root.generate_cpu_quota(1), 1);
    assert_eq!(root.cpu_usage_millis(), 1_000);
    assert_eq!(next.state(), QueryState::Running);
}

#[test]
fn usage_exactly_at_hard_cpu_limit_still_admits() {
    let root = root_with(GroupLimits {
        hard_cpu_limit_millis: 1_000,
        ..GroupLimits::default()
    });
    let child = child_with(&root, "etl", GroupLimits::default());
    let hog = TestQuery::new("hog");
    assert_eq!(child.run(hog.clone()), Admission::Running);
    hog.set_cpu_millis(1_000);
    root.update_groups_and_process_queued_queries();
    assert_eq!(root.cpu_usage_millis(), 1_000);

    assert!(root.can_run_more());
    assert_eq!(child.run(TestQuery::new("next")), Admission::Running);

    hog.set_cpu_millis(1_001);
    root.update_groups_and_process_queued_queries();
    assert!(!root.can_run_more());
    assert_eq!(child.run(TestQuery::new("over")), Admission::Queued);
}

#[test]
fn cpu_regeneration_saturates_at_zero() {
    let root = root_with(GroupLimits {
        cpu_quota_generation_millis_per_second: 1_000,
        ..GroupLimits::default()
    });
    let query = TestQuery::new("q");
    root.run(query.clone());
    query.set_cpu_millis(300);
    root.update_groups_and_process_queued_queries();

    root.generate_cpu_quota(u64::MAX);
    assert_eq!(root.cpu_usage_millis(), 0);
}

#[test]
fn cpu_is_charged_to_the_group_and_its_ancestors() {
    let root = root_with(GroupLimits::default());
    let child = child_with(&root, "etl", GroupLimits::default());
    let query = TestQuery::new("q");
    child.run(query.clone());

    query.set_cpu_millis(300);
    root.update_groups_and_process_queued_queries();
    assert_eq!(child.cpu_usage_millis(), 300);
    assert_eq!(root.cpu_usage_millis(), 300);

    // A second refresh with no new usage charges nothing more.
    root.update_groups_and_process_queued_queries();
    assert_eq!(root.cpu_usage_millis(), 300);

    query.add_cpu_millis(200);
    query.complete();
    assert_eq!(child.cpu_usage_millis(), 500);
    assert_eq!(root.cpu_usage_millis(), 500);
}

#[test]
fn remaining_cpu_of_non_user_failures_is_not_charged() {
    let root = root_with(GroupLimits::default());
    let internal = TestQuery::new("internal");
    let user = TestQuery::new("user");
    root.run(internal.clone());
    root.run(user.clone());

    internal.set_cpu_millis(100);
    user.set_cpu_millis(100);
    root.update_groups_and_process_queued_queries();
    assert_eq!(root.cpu_usage_millis(), 200);

    internal.add_cpu_millis(1_000);
    internal.fail_with(ErrorKind::InternalError);
    assert_eq!(root.cpu_usage_millis(), 200);

    user.add_cpu_millis(1_000);
    user.fail_with(ErrorKind::UserError);
    assert_eq!(root.cpu_usage_millis(), 1_200);
}

#[test]
fn soft_cpu_limit_shrinks_concurrency() {
    let root = root_with(GroupLimits {
        hard_concurrency_limit: 10,
        soft_cpu_limit_millis: Some(1_000),
        hard_cpu_limit_millis: 2_000,
        ..GroupLimits::default()
    });
    let first = TestQuery::new("first");
    root.run(first.clone());
    first.set_cpu_millis(1_500);
    root.update_groups_and_process_queued_queries();

    // Halfway between soft and hard: half of the hard concurrency limit.
    for n in 0..4 {
        assert_eq!(
            root.run(TestQuery::new(format!("q{n}"))),
            Admission::Running
        );
    }
    assert_eq!(root.run(TestQuery::new("over")), Admission::Queued);
    assert_eq!(root.running_query_count(), 5);
}

#[test]
fn memory_rolls_up_after_refresh() {
    let root = root_with(GroupLimits::default());
    let a = child_with(&root, "a", GroupLimits::default());
    let b = child_with(&root, "b", GroupLimits::default());
    let leaf = child_with(&b, "leaf", GroupLimits::default());

    let direct = TestQuery::builder("direct").memory_bytes(5).build();
    let qa = TestQuery::builder("qa").memory_bytes(10).build();
    let qb = TestQuery::builder("qb").memory_bytes(20).build();
    let ql = TestQuery::builder("ql").memory_bytes(40).build();
    root.run(direct.clone());
    a.run(qa.clone());
    b.run(qb.clone());
    leaf.run(ql.clone());
    assert_eq!(root.memory_usage_bytes(), 75);

    qa.set_memory_bytes(1);
    ql.set_memory_bytes(400);
    root.update_groups_and_process_queued_queries();
    assert_eq!(a.memory_usage_bytes(), 1);
    assert_eq!(leaf.memory_usage_bytes(), 400);
    assert_eq!(b.memory_usage_bytes(), 420);
    assert_eq!(root.memory_usage_bytes(), 426);

    ql.complete();
    assert_eq!(leaf.memory_usage_bytes(), 0);
    assert_eq!(b.memory_usage_bytes(), 20);
    assert_eq!(root.memory_usage_bytes(), 26);
}

#[test]
fn cpu_time_going_backwards_is_ignored() {
    let root = root_with(GroupLimits::default());
    let query = TestQuery::new("q");
    root.run(query.clone());
    query.set_cpu_millis(500);
    root.update_groups_and_process_queued_queries();

    query.set_cpu_millis(100);
    root.update_groups_and_process_queued_queries();
    assert_eq!(root.cpu_usage_millis(), 500);

    query.set_cpu_millis(700);
    root.update_groups_and_process_queued_queries();
    assert_eq!(root.cpu_usage_millis(), 700);
}
