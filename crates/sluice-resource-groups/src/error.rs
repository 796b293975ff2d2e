use sluice_core::{InvalidGroupName, ResourceGroupId};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceGroupError {
    /// Admission rejected because the group (or an ancestor) has no queue room.
    #[error("Too many queued queries for \"{group}\"")]
    QueryQueueFull { group: ResourceGroupId },

    #[error("invalid configuration for resource group \"{group}\": {message}")]
    InvalidConfiguration {
        group: ResourceGroupId,
        message: String,
    },

    #[error(transparent)]
    InvalidGroupName(#[from] InvalidGroupName),

    #[error("resource group \"{group}\" is not part of the tree rooted at \"{root}\"")]
    OutsideTree {
        group: ResourceGroupId,
        root: ResourceGroupId,
    },
}
