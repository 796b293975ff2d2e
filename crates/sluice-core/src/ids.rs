use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier of a submitted query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryId(Arc<str>);

impl QueryId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for QueryId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Identifier of a single task attempt of a query stage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskId {
    pub query_id: QueryId,
    pub stage_id: u32,
    pub partition_id: u32,
    pub attempt_id: u32,
}

impl TaskId {
    pub fn new(query_id: QueryId, stage_id: u32, partition_id: u32, attempt_id: u32) -> Self {
        Self {
            query_id,
            stage_id,
            partition_id,
            attempt_id,
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.query_id, self.stage_id, self.partition_id, self.attempt_id
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid resource group name {name:?}: {reason}")]
pub struct InvalidGroupName {
    pub name: String,
    pub reason: &'static str,
}

/// Hierarchical path of a resource group, e.g. `global.adhoc.alice`.
///
/// Ordering compares segment by segment, so a parent always sorts before its
/// children and siblings sort by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceGroupId {
    segments: Vec<String>,
}

impl ResourceGroupId {
    /// Id of a root group.
    pub fn new_root(name: impl Into<String>) -> Result<Self, InvalidGroupName> {
        let name = name.into();
        validate_segment(&name)?;
        Ok(Self {
            segments: vec![name],
        })
    }

    /// Id of a direct child of `self`.
    pub fn child(&self, name: impl Into<String>) -> Result<Self, InvalidGroupName> {
        let name = name.into();
        validate_segment(&name)?;
        let mut segments = self.segments.clone();
        segments.push(name);
        Ok(Self { segments })
    }

    /// Parses a dotted path (`root.sub1.sub2`).
    pub fn parse(path: &str) -> Result<Self, InvalidGroupName> {
        let segments = path
            .split('.')
            .map(|segment| validate_segment(segment).map(|()| segment.to_owned()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Last path segment.
    pub fn name(&self) -> &str {
        self.segments.last().map(String::as_str).unwrap_or_default()
    }

    pub fn parent(&self) -> Option<Self> {
        if self.segments.len() <= 1 {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    pub fn is_root(&self) -> bool {
        self.segments.len() == 1
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// Whether `self` is a strict ancestor of `other`.
    pub fn is_ancestor_of(&self, other: &ResourceGroupId) -> bool {
        other.segments.len() > self.segments.len() && other.segments.starts_with(&self.segments)
    }
}

fn validate_segment(name: &str) -> Result<(), InvalidGroupName> {
    if name.is_empty() {
        return Err(InvalidGroupName {
            name: name.to_owned(),
            reason: "segment must not be empty",
        });
    }
    if name.contains('.') {
        return Err(InvalidGroupName {
            name: name.to_owned(),
            reason: "segment must not contain '.'",
        });
    }
    Ok(())
}

impl fmt::Display for ResourceGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, segment) in self.segments.iter().enumerate() {
            if idx > 0 {
                f.write_str(".")?;
            }
            f.write_str(segment)?;
        }
        Ok(())
    }
}

impl Serialize for ResourceGroupId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ResourceGroupId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        ResourceGroupId::parse(&raw).map_err(serde::de::Error::custom)
    }
}
