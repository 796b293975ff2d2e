//! Cluster memory snapshots and low-memory killer strategies.
//!
//! The cluster memory manager gathers a [`MemoryInfo`] per worker and the list
//! of running queries, then asks a [`LowMemoryKiller`] which query (or which
//! tasks) to kill when worker pools are exhausted.

mod killer;
mod size;
mod types;

pub use killer::{
    ChainedKiller, LowMemoryKiller, LowMemoryKillerPolicy, NoneKiller,
    TotalReservationOnBlockedNodesQueryKiller, TotalReservationOnBlockedNodesTaskKiller,
    TotalReservationQueryKiller, UnknownKillerPolicy,
};
pub use size::{parse_byte_size, ParseByteSizeError};
pub use types::{KillTarget, MemoryInfo, MemoryPoolInfo, RunningQueryInfo, TaskMemoryReservation};
