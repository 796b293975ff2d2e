//! Hierarchical resource groups.
//!
//! A [`ResourceGroup`] tree decides whether a submitted query starts, waits in a
//! queue or is rejected, based on per-group concurrency, queue, memory and CPU
//! quotas. Queued work is promoted by a periodic pass driven by
//! [`ResourceGroupManager`], following each group's [`SchedulingPolicy`].

mod error;
mod group;
mod info;
mod limits;
mod manager;
mod policy;
mod queue;

pub use error::ResourceGroupError;
pub use group::{Admission, ResourceGroup};
pub use info::{QueryStateInfo, ResourceGroupInfo, ResourceGroupRuntimeInfo, ResourceGroupState};
pub use limits::GroupLimits;
pub use manager::{ResourceGroupManager, DEFAULT_REFRESH_INTERVAL};
pub use policy::{
    Candidate, SchedulingPolicy, ServiceRecord, Unit, UnknownSchedulingPolicy, VIRTUAL_TIME_SCALE,
};
