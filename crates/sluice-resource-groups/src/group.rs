use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::SeedableRng;
use sluice_core::{ErrorKind, ManagedQueryExecution, QueryError, QueryId, ResourceGroupId};

use crate::error::ResourceGroupError;
use crate::info::{QueryStateInfo, ResourceGroupInfo, ResourceGroupRuntimeInfo, ResourceGroupState};
use crate::limits::GroupLimits;
use crate::policy::{Candidate, SchedulingPolicy, ServiceRecord, Unit};
use crate::queue::DirectQueue;

/// Outcome of submitting a query to a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// A running slot was reserved on the group and every ancestor.
    Running,
    /// Waiting in the group's own queue for a later refresh to start it.
    Queued,
    /// The query was failed synchronously.
    Rejected(ResourceGroupError),
    /// The query had already finished before admission was evaluated.
    AlreadyDone,
}

struct RunningQuery {
    query: Arc<dyn ManagedQueryExecution>,
    /// Memory charged to this group and its ancestors for the query.
    memory_bytes: u64,
    cpu_charged_millis: u64,
}

struct SubGroup {
    group: Arc<ResourceGroup>,
    service: ServiceRecord,
}

struct GroupState {
    sub_groups: Vec<SubGroup>,
    running: HashMap<QueryId, RunningQuery>,
    queue: DirectQueue,
    direct_service: ServiceRecord,
    service_tick: u64,
    virtual_clock: u64,
    rng: StdRng,
}

/// A node of the resource-group tree.
///
/// Each group serializes mutation of its own queue and running set behind a
/// private lock. Running/queued counters (which include descendants) and cached
/// usage are published through atomics so that admission checks along the
/// ancestor chain never take more than one lock at a time. Locks are only ever
/// nested parent before child.
pub struct ResourceGroup {
    id: ResourceGroupId,
    parent: Weak<ResourceGroup>,
    limits: RwLock<GroupLimits>,
    running_queries: AtomicUsize,
    queued_queries: AtomicUsize,
    memory_usage_bytes: AtomicU64,
    cpu_usage_millis: AtomicU64,
    state: Mutex<GroupState>,
}

impl ResourceGroup {
    pub fn new_root(
        name: impl Into<String>,
        limits: GroupLimits,
    ) -> Result<Arc<Self>, ResourceGroupError> {
        let id = ResourceGroupId::new_root(name)?;
        limits.validate(&id, 0, 0)?;
        Ok(Arc::new(Self::new(id, Weak::new(), limits)))
    }

    fn new(id: ResourceGroupId, parent: Weak<ResourceGroup>, limits: GroupLimits) -> Self {
        Self {
            id,
            parent,
            limits: RwLock::new(limits),
            running_queries: AtomicUsize::new(0),
            queued_queries: AtomicUsize::new(0),
            memory_usage_bytes: AtomicU64::new(0),
            cpu_usage_millis: AtomicU64::new(0),
            state: Mutex::new(GroupState {
                sub_groups: Vec::new(),
                running: HashMap::new(),
                queue: DirectQueue::default(),
                direct_service: ServiceRecord::default(),
                service_tick: 0,
                virtual_clock: 0,
                rng: StdRng::from_os_rng(),
            }),
        }
    }

    pub fn id(&self) -> &ResourceGroupId {
        &self.id
    }

    pub fn parent(&self) -> Option<Arc<ResourceGroup>> {
        self.parent.upgrade()
    }

    /// Returns the child named `name`, creating it with default limits.
    pub fn get_or_create_sub_group(
        self: &Arc<Self>,
        name: &str,
    ) -> Result<Arc<ResourceGroup>, ResourceGroupError> {
        let mut state = self.state.lock();
        if let Some(existing) = state
            .sub_groups
            .iter()
            .find(|sub_group| sub_group.group.id.name() == name)
        {
            return Ok(existing.group.clone());
        }

        let id = self.id.child(name)?;
        let group = Arc::new(ResourceGroup::new(
            id,
            Arc::downgrade(self),
            GroupLimits::default(),
        ));
        state.sub_groups.push(SubGroup {
            group: group.clone(),
            service: ServiceRecord::default(),
        });
        tracing::debug!(
            target: "sluice.resource_groups",
            group = %group.id,
            "created resource group"
        );
        Ok(group)
    }

    pub fn sub_group(&self, name: &str) -> Option<Arc<ResourceGroup>> {
        self.state
            .lock()
            .sub_groups
            .iter()
            .find(|sub_group| sub_group.group.id.name() == name)
            .map(|sub_group| sub_group.group.clone())
    }

    pub fn sub_groups(&self) -> Vec<Arc<ResourceGroup>> {
        self.state
            .lock()
            .sub_groups
            .iter()
            .map(|sub_group| sub_group.group.clone())
            .collect()
    }

    // --- configuration ---------------------------------------------------

    pub fn limits(&self) -> GroupLimits {
        self.limits.read().clone()
    }

    pub fn scheduling_policy(&self) -> SchedulingPolicy {
        self.limits.read().scheduling_policy
    }

    /// Replaces all limits at once. Rejected without mutation if invalid.
    pub fn apply_limits(&self, limits: GroupLimits) -> Result<(), ResourceGroupError> {
        self.update_limits(|current| *current = limits)
    }

    pub fn set_soft_memory_limit_bytes(&self, bytes: u64) -> Result<(), ResourceGroupError> {
        self.update_limits(|limits| limits.soft_memory_limit_bytes = bytes)
    }

    pub fn set_hard_concurrency_limit(&self, limit: usize) -> Result<(), ResourceGroupError> {
        self.update_limits(|limits| limits.hard_concurrency_limit = limit)
    }

    pub fn set_soft_concurrency_limit(&self, limit: usize) -> Result<(), ResourceGroupError> {
        self.update_limits(|limits| limits.soft_concurrency_limit = Some(limit))
    }

    pub fn set_max_queued_queries(&self, limit: usize) -> Result<(), ResourceGroupError> {
        self.update_limits(|limits| limits.max_queued_queries = limit)
    }

    pub fn set_scheduling_weight(&self, weight: u32) -> Result<(), ResourceGroupError> {
        self.update_limits(|limits| limits.scheduling_weight = weight)
    }

    /// Switches the policy; the existing backlog is polled in the new order.
    pub fn set_scheduling_policy(&self, policy: SchedulingPolicy) -> Result<(), ResourceGroupError> {
        self.update_limits(|limits| limits.scheduling_policy = policy)
    }

    pub fn set_soft_cpu_limit(&self, millis: u64) -> Result<(), ResourceGroupError> {
        self.update_limits(|limits| limits.soft_cpu_limit_millis = Some(millis))
    }

    pub fn set_hard_cpu_limit(&self, millis: u64) -> Result<(), ResourceGroupError> {
        self.update_limits(|limits| limits.hard_cpu_limit_millis = millis)
    }

    pub fn set_cpu_quota_generation_millis_per_second(
        &self,
        rate: u64,
    ) -> Result<(), ResourceGroupError> {
        self.update_limits(|limits| limits.cpu_quota_generation_millis_per_second = rate)
    }

    fn update_limits(&self, f: impl FnOnce(&mut GroupLimits)) -> Result<(), ResourceGroupError> {
        let mut limits = self.limits.write();
        let mut next = limits.clone();
        f(&mut next);
        next.validate(
            &self.id,
            self.running_queries.load(Ordering::Acquire),
            self.queued_queries.load(Ordering::Acquire),
        )?;
        *limits = next;
        Ok(())
    }

    /// Reseeds the generator used by weighted scheduling.
    pub fn reseed(&self, seed: u64) {
        self.state.lock().rng = StdRng::seed_from_u64(seed);
    }

    // --- admission -------------------------------------------------------

    /// Admits `query`: starts it, queues it, or fails it when no queue room is
    /// left in this group or an ancestor.
    pub fn run(self: &Arc<Self>, query: Arc<dyn ManagedQueryExecution>) -> Admission {
        let query_id = query.query_id().clone();
        let group = Arc::downgrade(self);
        let listener_query_id = query_id.clone();
        query.add_state_change_listener(Box::new(move |state| {
            if !state.is_done() {
                return;
            }
            if let Some(group) = group.upgrade() {
                group.query_finished(&listener_query_id);
            }
        }));

        if query.state().is_done() {
            tracing::debug!(
                target: "sluice.resource_groups",
                group = %self.id,
                query_id = %query_id,
                "query finished before admission"
            );
            return Admission::AlreadyDone;
        }

        if self.try_acquire_in_path(
            ResourceGroup::try_acquire_running_slot,
            ResourceGroup::release_running_slot,
        ) {
            self.start_reserved(query);
            return Admission::Running;
        }

        if self.try_acquire_in_path(
            ResourceGroup::try_acquire_queue_slot,
            ResourceGroup::release_queue_slot,
        ) {
            self.state.lock().queue.push(query.clone());
            tracing::debug!(
                target: "sluice.resource_groups",
                group = %self.id,
                query_id = %query_id,
                "query queued"
            );
            if query.state().is_done() {
                self.query_finished(&query_id);
            }
            return Admission::Queued;
        }

        let error = ResourceGroupError::QueryQueueFull {
            group: self.id.clone(),
        };
        tracing::info!(
            target: "sluice.resource_groups",
            group = %self.id,
            query_id = %query_id,
            "rejecting query: queue is full"
        );
        query.fail(QueryError::insufficient_resources(error.to_string()));
        Admission::Rejected(error)
    }

    /// Starts a query whose running slot has already been reserved along the path.
    fn start_reserved(&self, query: Arc<dyn ManagedQueryExecution>) {
        let query_id = query.query_id().clone();
        let memory_bytes = query.memory_reservation_bytes();
        self.state.lock().running.insert(
            query_id.clone(),
            RunningQuery {
                query: query.clone(),
                memory_bytes,
                cpu_charged_millis: 0,
            },
        );
        self.for_each_in_path(|group| add_saturating(&group.memory_usage_bytes, memory_bytes));

        tracing::debug!(
            target: "sluice.resource_groups",
            group = %self.id,
            query_id = %query_id,
            "starting query"
        );
        query.start_waiting_for_resources();

        // Completion may have raced with insertion; removal is idempotent.
        if query.state().is_done() {
            self.query_finished(&query_id);
        }
    }

    // Idempotent: listeners and the admission path may both report the same query.
    fn query_finished(&self, query_id: &QueryId) {
        enum Removed {
            Running(RunningQuery),
            Queued,
        }

        let removed = {
            let mut state = self.state.lock();
            if let Some(entry) = state.running.remove(query_id) {
                Some(Removed::Running(entry))
            } else if state.queue.remove(query_id) {
                Some(Removed::Queued)
            } else {
                None
            }
        };

        match removed {
            Some(Removed::Running(entry)) => {
                // CPU burnt by queries failing through no fault of the tenant is not charged.
                let cpu_charge = match entry.query.error_kind() {
                    None | Some(ErrorKind::UserError) => {
                        cpu_millis(entry.query.as_ref()).saturating_sub(entry.cpu_charged_millis)
                    }
                    Some(_) => 0,
                };
                self.for_each_in_path(|group| {
                    group.release_running_slot();
                    subtract_clamped(
                        &group.memory_usage_bytes,
                        entry.memory_bytes,
                        &group.id,
                        "memory_usage_bytes",
                    );
                    add_saturating(&group.cpu_usage_millis, cpu_charge);
                });
                tracing::debug!(
                    target: "sluice.resource_groups",
                    group = %self.id,
                    query_id = %query_id,
                    cpu_charge_millis = cpu_charge,
                    "running query finished"
                );
            }
            Some(Removed::Queued) => {
                self.for_each_in_path(ResourceGroup::release_queue_slot);
                tracing::debug!(
                    target: "sluice.resource_groups",
                    group = %self.id,
                    query_id = %query_id,
                    "queued query finished"
                );
            }
            None => {}
        }
    }

    // --- periodic maintenance -------------------------------------------

    /// Refreshes cached usage of this subtree, then starts queued queries until
    /// no capacity remains. Returns the number of queries started.
    pub fn update_groups_and_process_queued_queries(&self) -> usize {
        self.refresh_stats();
        self.process_queued_queries()
    }

    /// Starts queued queries beneath this group until a fixed point is reached.
    pub fn process_queued_queries(&self) -> usize {
        let mut started = 0;
        while self.start_next(None) {
            started += 1;
        }
        if started > 0 {
            tracing::debug!(
                target: "sluice.resource_groups",
                group = %self.id,
                started,
                "started queued queries"
            );
        }
        started
    }

    /// Refills the CPU token bucket of every group in this subtree, then starts
    /// queued work that fits under the replenished quotas.
    pub fn generate_cpu_quota(&self, elapsed_seconds: u64) -> usize {
        self.regenerate_cpu_quota(elapsed_seconds);
        self.process_queued_queries()
    }

    fn regenerate_cpu_quota(&self, elapsed_seconds: u64) {
        let rate = self.limits.read().cpu_quota_generation_millis_per_second;
        let quota = elapsed_seconds.saturating_mul(rate);
        if quota > 0 {
            let _ = self
                .cpu_usage_millis
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |usage| {
                    Some(usage.saturating_sub(quota))
                });
        }
        for sub_group in self.sub_groups() {
            sub_group.regenerate_cpu_quota(elapsed_seconds);
        }
    }

    /// Recomputes cached memory of this subtree bottom-up and charges CPU
    /// consumed since the previous refresh. Returns this group's memory usage.
    fn refresh_stats(&self) -> u64 {
        let (running, sub_groups) = {
            let state = self.state.lock();
            let running: Vec<Arc<dyn ManagedQueryExecution>> = state
                .running
                .values()
                .map(|entry| entry.query.clone())
                .collect();
            let sub_groups: Vec<Arc<ResourceGroup>> = state
                .sub_groups
                .iter()
                .map(|sub_group| sub_group.group.clone())
                .collect();
            (running, sub_groups)
        };

        // Sample outside the lock; queries may call back into the group.
        let samples: Vec<(QueryId, u64, u64)> = running
            .iter()
            .map(|query| {
                (
                    query.query_id().clone(),
                    query.memory_reservation_bytes(),
                    cpu_millis(query.as_ref()),
                )
            })
            .collect();

        let mut direct_memory = 0u64;
        let mut cpu_delta = 0u64;
        {
            let mut state = self.state.lock();
            for (query_id, memory_bytes, cpu) in samples {
                let Some(entry) = state.running.get_mut(&query_id) else {
                    continue;
                };
                entry.memory_bytes = memory_bytes;
                direct_memory = direct_memory.saturating_add(memory_bytes);
                if cpu < entry.cpu_charged_millis {
                    tracing::warn!(
                        target: "sluice.resource_groups",
                        group = %self.id,
                        query_id = %query_id,
                        reported = cpu,
                        charged = entry.cpu_charged_millis,
                        "query cpu time went backwards; ignoring"
                    );
                    continue;
                }
                cpu_delta = cpu_delta.saturating_add(cpu - entry.cpu_charged_millis);
                entry.cpu_charged_millis = cpu;
            }
        }

        if cpu_delta > 0 {
            self.for_each_in_path(|group| add_saturating(&group.cpu_usage_millis, cpu_delta));
        }

        let sub_group_memory = sub_groups
            .iter()
            .map(|sub_group| sub_group.refresh_stats())
            .fold(0u64, u64::saturating_add);
        let total = direct_memory.saturating_add(sub_group_memory);
        self.memory_usage_bytes.store(total, Ordering::Release);
        total
    }

    /// Starts at most one queued query beneath this group.
    ///
    /// A QUERY_PRIORITY ancestor passes its policy down so that the whole
    /// subtree is polled by priority, whatever the descendants' own policies.
    fn start_next(&self, inherited: Option<SchedulingPolicy>) -> bool {
        if !self.can_run_more() {
            return false;
        }

        let policy = inherited.unwrap_or_else(|| self.scheduling_policy());
        let handed_down = (policy == SchedulingPolicy::QueryPriority).then_some(policy);
        let mut excluded: Vec<Unit> = Vec::new();
        loop {
            let candidates = self.candidates(policy, &excluded);
            let unit = {
                let mut state = self.state.lock();
                match policy.select(&candidates, &mut state.rng) {
                    Some(idx) => candidates[idx].unit,
                    None => return false,
                }
            };

            let started = match unit {
                Unit::Direct => self.start_direct(policy),
                Unit::SubGroup(idx) => self
                    .sub_group_at(idx)
                    .is_some_and(|sub_group| sub_group.start_next(handed_down)),
            };
            if started {
                self.record_service(unit);
                return true;
            }
            // The unit lost its work or capacity concurrently; try the others.
            excluded.push(unit);
        }
    }

    fn start_direct(&self, policy: SchedulingPolicy) -> bool {
        loop {
            if self.state.lock().queue.is_empty() {
                return false;
            }
            if !self.try_acquire_in_path(
                ResourceGroup::try_acquire_running_slot,
                ResourceGroup::release_running_slot,
            ) {
                return false;
            }

            let polled = {
                let mut state = self.state.lock();
                let GroupState { queue, rng, .. } = &mut *state;
                queue.poll(policy, rng)
            };
            let Some(query) = polled else {
                self.for_each_in_path(ResourceGroup::release_running_slot);
                return false;
            };
            self.for_each_in_path(ResourceGroup::release_queue_slot);

            if query.state().is_done() {
                self.for_each_in_path(ResourceGroup::release_running_slot);
                continue;
            }
            self.start_reserved(query);
            return true;
        }
    }

    fn candidates(&self, policy: SchedulingPolicy, excluded: &[Unit]) -> Vec<Candidate> {
        struct Contender {
            idx: usize,
            group: Arc<ResourceGroup>,
            eligible: bool,
            weight: u32,
            priority: i32,
            below_soft_concurrency: bool,
        }

        let (direct_priority, sub_groups) = {
            let state = self.state.lock();
            let direct_priority = if state.queue.is_empty() {
                None
            } else {
                Some(state.queue.highest_priority().unwrap_or(i32::MIN))
            };
            let sub_groups: Vec<Arc<ResourceGroup>> = state
                .sub_groups
                .iter()
                .map(|sub_group| sub_group.group.clone())
                .collect();
            (direct_priority, sub_groups)
        };

        let mut contenders: Vec<Contender> = sub_groups
            .into_iter()
            .enumerate()
            .filter(|(idx, _)| !excluded.contains(&Unit::SubGroup(*idx)))
            .map(|(idx, group)| {
                let eligible = group.is_eligible();
                let (weight, soft_concurrency) = {
                    let limits = group.limits.read();
                    (
                        limits.scheduling_weight,
                        limits.effective_soft_concurrency_limit(),
                    )
                };
                let priority = if eligible && policy == SchedulingPolicy::QueryPriority {
                    group.highest_eligible_priority().unwrap_or(i32::MIN)
                } else {
                    0
                };
                let below_soft_concurrency =
                    group.running_queries.load(Ordering::Acquire) < soft_concurrency;
                Contender {
                    idx,
                    group,
                    eligible,
                    weight,
                    priority,
                    below_soft_concurrency,
                }
            })
            .collect();
        contenders.sort_by(|a, b| a.group.id.cmp(&b.group.id));

        let mut state = self.state.lock();
        let virtual_clock = state.virtual_clock;
        let GroupState {
            direct_service,
            sub_groups: records,
            ..
        } = &mut *state;

        let mut candidates = Vec::with_capacity(contenders.len() + 1);
        if !excluded.contains(&Unit::Direct) {
            direct_service.set_active(direct_priority.is_some(), virtual_clock);
            if let Some(priority) = direct_priority {
                candidates.push(Candidate {
                    unit: Unit::Direct,
                    weight: 1,
                    last_serviced: direct_service.last_serviced,
                    next_virtual_finish: direct_service.next_virtual_finish(1),
                    priority,
                    below_soft_concurrency: true,
                });
            }
        }

        for contender in contenders {
            let Some(record) = records.get_mut(contender.idx) else {
                continue;
            };
            let service = &mut record.service;
            service.set_active(contender.eligible, virtual_clock);
            if !contender.eligible {
                continue;
            }
            candidates.push(Candidate {
                unit: Unit::SubGroup(contender.idx),
                weight: contender.weight,
                last_serviced: service.last_serviced,
                next_virtual_finish: service.next_virtual_finish(contender.weight),
                priority: contender.priority,
                below_soft_concurrency: contender.below_soft_concurrency,
            });
        }
        candidates
    }

    fn record_service(&self, unit: Unit) {
        let mut state = self.state.lock();
        state.service_tick += 1;
        let tick = state.service_tick;
        let GroupState {
            direct_service,
            sub_groups,
            virtual_clock,
            ..
        } = &mut *state;
        match unit {
            Unit::Direct => direct_service.record(tick, virtual_clock, 1),
            Unit::SubGroup(idx) => {
                if let Some(sub_group) = sub_groups.get_mut(idx) {
                    let weight = sub_group.group.limits.read().scheduling_weight;
                    sub_group.service.record(tick, virtual_clock, weight);
                }
            }
        }
    }

    fn sub_group_at(&self, idx: usize) -> Option<Arc<ResourceGroup>> {
        self.state
            .lock()
            .sub_groups
            .get(idx)
            .map(|sub_group| sub_group.group.clone())
    }

    /// Highest priority among queued queries that could start through this group.
    fn highest_eligible_priority(&self) -> Option<i32> {
        let (own, sub_groups) = {
            let state = self.state.lock();
            let sub_groups: Vec<Arc<ResourceGroup>> = state
                .sub_groups
                .iter()
                .map(|sub_group| sub_group.group.clone())
                .collect();
            (state.queue.highest_priority(), sub_groups)
        };
        sub_groups
            .iter()
            .filter(|sub_group| sub_group.is_eligible())
            .filter_map(|sub_group| sub_group.highest_eligible_priority())
            .chain(own)
            .max()
    }

    // --- capacity checks -------------------------------------------------

    /// Whether this group, considered on its own, may start another query.
    pub fn can_run_more(&self) -> bool {
        let limits = self.limits.read();
        let cpu = self.cpu_usage_millis.load(Ordering::Acquire);
        cpu <= limits.hard_cpu_limit_millis
            && self.memory_usage_bytes.load(Ordering::Acquire) <= limits.soft_memory_limit_bytes
            && self.running_queries.load(Ordering::Acquire)
                < limits.effective_concurrency_limit(cpu)
    }

    pub fn can_queue_more(&self) -> bool {
        self.queued_queries.load(Ordering::Acquire) < self.limits.read().max_queued_queries
    }

    /// Queued work exists beneath this group and it has capacity to start some.
    pub fn is_eligible(&self) -> bool {
        self.queued_queries.load(Ordering::Acquire) > 0 && self.can_run_more()
    }

    fn try_acquire_running_slot(&self) -> bool {
        let limits = self.limits.read();
        let cpu = self.cpu_usage_millis.load(Ordering::Acquire);
        if cpu > limits.hard_cpu_limit_millis
            || self.memory_usage_bytes.load(Ordering::Acquire) > limits.soft_memory_limit_bytes
        {
            return false;
        }
        let limit = limits.effective_concurrency_limit(cpu);
        self.running_queries
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |running| {
                (running < limit).then_some(running + 1)
            })
            .is_ok()
    }

    fn release_running_slot(&self) {
        decrement_clamped(&self.running_queries, &self.id, "running_queries");
    }

    fn try_acquire_queue_slot(&self) -> bool {
        let max_queued = self.limits.read().max_queued_queries;
        self.queued_queries
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |queued| {
                (queued < max_queued).then_some(queued + 1)
            })
            .is_ok()
    }

    fn release_queue_slot(&self) {
        decrement_clamped(&self.queued_queries, &self.id, "queued_queries");
    }

    /// Acquires a slot on this group and every ancestor, or on none of them.
    fn try_acquire_in_path(
        &self,
        acquire: impl Fn(&ResourceGroup) -> bool,
        release: impl Fn(&ResourceGroup),
    ) -> bool {
        if !acquire(self) {
            return false;
        }
        let mut acquired: Vec<Arc<ResourceGroup>> = Vec::new();
        let mut next = self.parent.upgrade();
        while let Some(group) = next {
            if !acquire(&group) {
                release(self);
                for group in &acquired {
                    release(group);
                }
                return false;
            }
            next = group.parent.upgrade();
            acquired.push(group);
        }
        true
    }

    fn for_each_in_path(&self, mut f: impl FnMut(&ResourceGroup)) {
        f(self);
        let mut next = self.parent.upgrade();
        while let Some(group) = next {
            f(&group);
            next = group.parent.upgrade();
        }
    }

    /// Free running slots along the path to the root, given current usage.
    fn headroom(&self) -> usize {
        let limits = self.limits.read();
        let cpu = self.cpu_usage_millis.load(Ordering::Acquire);
        if cpu > limits.hard_cpu_limit_millis
            || self.memory_usage_bytes.load(Ordering::Acquire) > limits.soft_memory_limit_bytes
        {
            return 0;
        }
        limits
            .effective_concurrency_limit(cpu)
            .saturating_sub(self.running_queries.load(Ordering::Acquire))
    }

    // --- monitoring ------------------------------------------------------

    /// Queued queries that would not start even if scheduled right now.
    pub fn waiting_queued_queries(&self) -> usize {
        let mut budget = usize::MAX;
        let mut next = self.parent.upgrade();
        while let Some(group) = next {
            budget = budget.min(group.headroom());
            next = group.parent.upgrade();
        }
        self.waiting_with_budget(budget).0
    }

    /// Returns `(waiting, started)` given `budget` free slots granted from above.
    fn waiting_with_budget(&self, budget: usize) -> (usize, usize) {
        let budget = budget.min(self.headroom());
        let (direct_queued, sub_groups) = {
            let state = self.state.lock();
            let sub_groups: Vec<Arc<ResourceGroup>> = state
                .sub_groups
                .iter()
                .map(|sub_group| sub_group.group.clone())
                .collect();
            (state.queue.len(), sub_groups)
        };

        let start_now = direct_queued.min(budget);
        let mut remaining = budget - start_now;
        let mut waiting = direct_queued - start_now;
        for sub_group in sub_groups {
            let (sub_waiting, sub_started) = sub_group.waiting_with_budget(remaining);
            waiting += sub_waiting;
            remaining = remaining.saturating_sub(sub_started);
        }
        (waiting, budget - remaining)
    }

    pub fn state(&self) -> ResourceGroupState {
        if self.can_run_more() {
            ResourceGroupState::CanRun
        } else if self.can_queue_more() {
            ResourceGroupState::CanQueue
        } else {
            ResourceGroupState::Full
        }
    }

    /// Running queries in this group and all descendants.
    pub fn running_query_count(&self) -> usize {
        self.running_queries.load(Ordering::Acquire)
    }

    /// Queued queries in this group and all descendants.
    pub fn queued_query_count(&self) -> usize {
        self.queued_queries.load(Ordering::Acquire)
    }

    pub fn memory_usage_bytes(&self) -> u64 {
        self.memory_usage_bytes.load(Ordering::Acquire)
    }

    pub fn cpu_usage_millis(&self) -> u64 {
        self.cpu_usage_millis.load(Ordering::Acquire)
    }

    /// Ids of the queries running directly in this group, sorted.
    pub fn direct_running_queries(&self) -> Vec<QueryId> {
        let mut ids: Vec<QueryId> = self.state.lock().running.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn direct_queued_query_count(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn summary_info(&self) -> ResourceGroupInfo {
        self.build_info(None, None)
    }

    /// Snapshot including summaries of the immediate sub-groups.
    pub fn info(&self) -> ResourceGroupInfo {
        let sub_groups = self
            .sub_groups()
            .iter()
            .map(|sub_group| sub_group.summary_info())
            .collect();
        self.build_info(Some(sub_groups), None)
    }

    /// Recursive snapshot of the whole subtree with running queries.
    pub fn full_info(&self) -> ResourceGroupInfo {
        let sub_groups = self
            .sub_groups()
            .iter()
            .map(|sub_group| sub_group.full_info())
            .collect();
        self.build_info(Some(sub_groups), Some(self.running_query_infos()))
    }

    /// Snapshots from this group up to the root.
    pub fn path_to_root_info(&self) -> Vec<ResourceGroupInfo> {
        let mut path = vec![self.info()];
        let mut next = self.parent.upgrade();
        while let Some(group) = next {
            path.push(group.info());
            next = group.parent.upgrade();
        }
        path
    }

    pub fn runtime_info(&self) -> ResourceGroupRuntimeInfo {
        let (direct_running, direct_queued, sub_groups) = {
            let state = self.state.lock();
            let sub_groups: Vec<Arc<ResourceGroup>> = state
                .sub_groups
                .iter()
                .map(|sub_group| sub_group.group.clone())
                .collect();
            (state.running.len(), state.queue.len(), sub_groups)
        };
        let running = self.running_query_count();
        let queued = self.queued_query_count();
        ResourceGroupRuntimeInfo {
            resource_group_id: self.id.clone(),
            memory_usage_bytes: self.memory_usage_bytes(),
            cpu_usage_millis: self.cpu_usage_millis(),
            queued_queries: direct_queued,
            descendant_queued_queries: queued.saturating_sub(direct_queued),
            running_queries: direct_running,
            descendant_running_queries: running.saturating_sub(direct_running),
            sub_groups: sub_groups
                .iter()
                .map(|sub_group| sub_group.runtime_info())
                .collect(),
        }
    }

    fn running_query_infos(&self) -> Vec<QueryStateInfo> {
        let queries: Vec<Arc<dyn ManagedQueryExecution>> = self
            .state
            .lock()
            .running
            .values()
            .map(|entry| entry.query.clone())
            .collect();
        let mut infos: Vec<QueryStateInfo> = queries
            .iter()
            .map(|query| QueryStateInfo {
                query_id: query.query_id().clone(),
                state: query.state(),
                resource_group_id: self.id.clone(),
                priority: query.priority(),
                memory_reservation_bytes: query.memory_reservation_bytes(),
                cpu_time_millis: cpu_millis(query.as_ref()),
            })
            .collect();
        infos.sort_by(|a, b| a.query_id.cmp(&b.query_id));
        infos
    }

    fn build_info(
        &self,
        sub_groups: Option<Vec<ResourceGroupInfo>>,
        running_queries: Option<Vec<QueryStateInfo>>,
    ) -> ResourceGroupInfo {
        let limits = self.limits();
        let num_eligible_sub_groups = self
            .sub_groups()
            .iter()
            .filter(|sub_group| sub_group.is_eligible())
            .count();
        ResourceGroupInfo {
            id: self.id.clone(),
            state: self.state(),
            scheduling_policy: limits.scheduling_policy,
            scheduling_weight: limits.scheduling_weight,
            soft_memory_limit_bytes: limits.soft_memory_limit_bytes,
            memory_usage_bytes: self.memory_usage_bytes(),
            cpu_usage_millis: self.cpu_usage_millis(),
            soft_concurrency_limit: limits.effective_soft_concurrency_limit(),
            hard_concurrency_limit: limits.hard_concurrency_limit,
            max_queued_queries: limits.max_queued_queries,
            num_queued_queries: self.queued_query_count(),
            num_running_queries: self.running_query_count(),
            num_eligible_sub_groups,
            sub_groups,
            running_queries,
        }
    }
}

impl fmt::Debug for ResourceGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceGroup")
            .field("id", &self.id)
            .field("running_queries", &self.running_query_count())
            .field("queued_queries", &self.queued_query_count())
            .field("memory_usage_bytes", &self.memory_usage_bytes())
            .field("cpu_usage_millis", &self.cpu_usage_millis())
            .finish()
    }
}

fn cpu_millis(query: &dyn ManagedQueryExecution) -> u64 {
    u64::try_from(query.total_cpu_time().as_millis()).unwrap_or(u64::MAX)
}

fn add_saturating(counter: &AtomicU64, amount: u64) {
    if amount == 0 {
        return;
    }
    let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |value| {
        Some(value.saturating_add(amount))
    });
}

fn subtract_clamped(counter: &AtomicU64, amount: u64, group: &ResourceGroupId, name: &'static str) {
    let mut clamped = false;
    let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |value| {
        clamped = value < amount;
        Some(value.saturating_sub(amount))
    });
    if clamped {
        tracing::warn!(
            target: "sluice.resource_groups",
            group = %group,
            counter = name,
            amount,
            "accounting underflow clamped to zero"
        );
    }
}

fn decrement_clamped(counter: &AtomicUsize, group: &ResourceGroupId, name: &'static str) {
    if counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |value| {
            value.checked_sub(1)
        })
        .is_err()
    {
        tracing::warn!(
            target: "sluice.resource_groups",
            group = %group,
            counter = name,
            "counter underflow clamped to zero"
        );
    }
}
