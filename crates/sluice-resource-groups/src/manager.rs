use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sluice_core::{ManagedQueryExecution, ResourceGroupId};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::ResourceGroupError;
use crate::group::{Admission, ResourceGroup};
use crate::info::ResourceGroupInfo;

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_millis(100);

/// Owns a resource-group tree and drives its periodic maintenance.
pub struct ResourceGroupManager {
    root: Arc<ResourceGroup>,
    refresh_interval: Duration,
    last_cpu_quota_generation: Mutex<Instant>,
}

impl ResourceGroupManager {
    pub fn new(root: Arc<ResourceGroup>, refresh_interval: Duration) -> Self {
        Self {
            root,
            refresh_interval,
            last_cpu_quota_generation: Mutex::new(Instant::now()),
        }
    }

    pub fn root(&self) -> &Arc<ResourceGroup> {
        &self.root
    }

    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    /// Looks up an existing group by its full path.
    pub fn group(&self, id: &ResourceGroupId) -> Option<Arc<ResourceGroup>> {
        let (root_name, rest) = id.segments().split_first()?;
        if root_name != self.root.id().name() {
            return None;
        }
        rest.iter()
            .try_fold(self.root.clone(), |group, name| group.sub_group(name))
    }

    /// Resolves `id`, creating any missing groups along the path with default limits.
    pub fn get_or_create_group(
        &self,
        id: &ResourceGroupId,
    ) -> Result<Arc<ResourceGroup>, ResourceGroupError> {
        let outside = || ResourceGroupError::OutsideTree {
            group: id.clone(),
            root: self.root.id().clone(),
        };
        let (root_name, rest) = id.segments().split_first().ok_or_else(outside)?;
        if root_name != self.root.id().name() {
            return Err(outside());
        }
        rest.iter().try_fold(self.root.clone(), |group, name| {
            group.get_or_create_sub_group(name)
        })
    }

    /// Submits `query` to the group at `group_id`.
    pub fn submit(
        &self,
        group_id: &ResourceGroupId,
        query: Arc<dyn ManagedQueryExecution>,
    ) -> Result<Admission, ResourceGroupError> {
        let group = self.get_or_create_group(group_id)?;
        Ok(group.run(query))
    }

    pub fn info(&self, id: &ResourceGroupId) -> Option<ResourceGroupInfo> {
        self.group(id).map(|group| group.info())
    }

    pub fn full_info(&self) -> ResourceGroupInfo {
        self.root.full_info()
    }

    /// One maintenance pass. Returns the number of queries started.
    pub fn refresh_and_start_queries(&self) -> usize {
        self.refresh_and_start_queries_at(Instant::now())
    }

    /// Like [`Self::refresh_and_start_queries`] with an explicit clock reading.
    ///
    /// CPU quota is generated for whole elapsed seconds only; the fractional
    /// remainder carries over to the next pass.
    pub fn refresh_and_start_queries_at(&self, now: Instant) -> usize {
        let elapsed_seconds = {
            let mut last = self.last_cpu_quota_generation.lock();
            let elapsed = now.saturating_duration_since(*last).as_secs();
            if elapsed > 0 {
                *last += Duration::from_secs(elapsed);
            }
            elapsed
        };

        let mut started = 0;
        if elapsed_seconds > 0 {
            started += self.root.generate_cpu_quota(elapsed_seconds);
        }
        started + self.root.update_groups_and_process_queued_queries()
    }

    /// Runs maintenance passes on `handle` every refresh interval until `cancel` fires.
    pub fn spawn(
        self: &Arc<Self>,
        handle: &tokio::runtime::Handle,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        handle.spawn(async move {
            let period = manager.refresh_interval.max(Duration::from_millis(1));
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.refresh_and_start_queries();
                    }
                }
            }
            tracing::debug!(
                target: "sluice.resource_groups",
                root = %manager.root.id(),
                "resource group refresh loop stopped"
            );
        })
    }
}

impl std::fmt::Debug for ResourceGroupManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGroupManager")
            .field("root", &self.root.id())
            .field("refresh_interval", &self.refresh_interval)
            .finish()
    }
}
