//! `sluice.toml` configuration.
//!
//! Loading is split in two steps: TOML deserialization (hard errors, see
//! [`ConfigError`]) followed by best-effort semantic validation that reports
//! [`ConfigDiagnostics`]. A loaded config can then build the resource-group
//! tree ([`build_resource_groups`]) and the low-memory killer.

use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sluice_memory::{LowMemoryKiller, LowMemoryKillerPolicy};
use sluice_resource_groups::{
    GroupLimits, ResourceGroup, ResourceGroupError, ResourceGroupManager, SchedulingPolicy,
    DEFAULT_REFRESH_INTERVAL,
};
use thiserror::Error;

mod diagnostics;
mod logging;
mod schema;
mod validation;

pub use diagnostics::{
    ConfigDiagnostics, ConfigValidationError, ConfigWarning, ValidationDiagnostics,
};
pub use logging::{init_tracing, LoggingConfig};
pub use schema::json_schema;

/// Name of the root group built when no `[[resource_groups]]` are declared.
pub const DEFAULT_ROOT_GROUP: &str = "global";

/// Byte count that deserializes from either an integer or a human-friendly
/// string such as `"4GiB"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteSize(pub u64);

impl Serialize for ByteSize {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Bytes(u64),
            Human(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Bytes(bytes) => Ok(ByteSize(bytes)),
            Repr::Human(text) => sluice_memory::parse_byte_size(&text)
                .map(ByteSize)
                .map_err(serde::de::Error::custom),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[schemars(deny_unknown_fields)]
pub struct SchedulerConfig {
    /// How often group usage is refreshed and queued queries are promoted.
    #[serde(default = "SchedulerConfig::default_refresh_interval_ms")]
    #[schemars(range(min = 1))]
    pub refresh_interval_ms: u64,
}

impl SchedulerConfig {
    fn default_refresh_interval_ms() -> u64 {
        DEFAULT_REFRESH_INTERVAL.as_millis() as u64
    }

    /// Refresh period of the background driver. Never zero.
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms.max(1))
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            refresh_interval_ms: Self::default_refresh_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[schemars(deny_unknown_fields)]
pub struct MemoryConfig {
    /// Strategy used to pick a victim when worker memory pools are exhausted.
    #[serde(default)]
    #[schemars(schema_with = "crate::schema::killer_policy_schema")]
    pub low_memory_killer: LowMemoryKillerPolicy,

    /// Kill individual tasks of task-retried queries before whole queries.
    #[serde(default)]
    pub task_killer: bool,
}

impl MemoryConfig {
    pub fn low_memory_killer(&self) -> Box<dyn LowMemoryKiller> {
        self.low_memory_killer.build(self.task_killer)
    }
}

/// One node of the configured resource-group tree.
///
/// Limits left unset keep the unbounded defaults of a freshly created group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[schemars(deny_unknown_fields)]
pub struct ResourceGroupConfig {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "crate::schema::scheduling_policy_schema")]
    pub scheduling_policy: Option<SchedulingPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(range(min = 1))]
    pub scheduling_weight: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soft_memory_limit: Option<ByteSize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hard_concurrency_limit: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soft_concurrency_limit: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_queued: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soft_cpu_limit_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hard_cpu_limit_ms: Option<u64>,

    /// CPU milliseconds returned to the group's budget per elapsed second.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_quota_generation_ms_per_second: Option<u64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_groups: Vec<ResourceGroupConfig>,
}

impl ResourceGroupConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scheduling_policy: None,
            scheduling_weight: None,
            soft_memory_limit: None,
            hard_concurrency_limit: None,
            soft_concurrency_limit: None,
            max_queued: None,
            soft_cpu_limit_ms: None,
            hard_cpu_limit_ms: None,
            cpu_quota_generation_ms_per_second: None,
            sub_groups: Vec::new(),
        }
    }

    pub fn limits(&self) -> GroupLimits {
        let defaults = GroupLimits::default();
        GroupLimits {
            scheduling_policy: self
                .scheduling_policy
                .unwrap_or(defaults.scheduling_policy),
            scheduling_weight: self
                .scheduling_weight
                .unwrap_or(defaults.scheduling_weight),
            soft_memory_limit_bytes: self
                .soft_memory_limit
                .map_or(defaults.soft_memory_limit_bytes, |size| size.0),
            hard_concurrency_limit: self
                .hard_concurrency_limit
                .unwrap_or(defaults.hard_concurrency_limit),
            soft_concurrency_limit: self.soft_concurrency_limit,
            max_queued_queries: self.max_queued.unwrap_or(defaults.max_queued_queries),
            soft_cpu_limit_millis: self.soft_cpu_limit_ms,
            hard_cpu_limit_millis: self
                .hard_cpu_limit_ms
                .unwrap_or(defaults.hard_cpu_limit_millis),
            cpu_quota_generation_millis_per_second: self
                .cpu_quota_generation_ms_per_second
                .unwrap_or(defaults.cpu_quota_generation_millis_per_second),
        }
    }
}

/// Top-level Sluice configuration loaded from TOML.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[schemars(deny_unknown_fields)]
pub struct SluiceConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub memory: MemoryConfig,

    /// Root of the resource-group tree. At most one root is supported.
    #[serde(default)]
    pub resource_groups: Vec<ResourceGroupConfig>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // `Display` would include a snippet of the input; keep only the message.
        ConfigError::Toml(redact_values(err.message()))
    }
}

/// Strips user-provided values out of a deserialization message.
///
/// Quoted strings are always replaced. Backticked segments are replaced only
/// where serde puts user input in them (unknown fields and variants, the
/// unexpected value of an `invalid type`/`invalid value` error).
fn redact_values(message: &str) -> String {
    static DOUBLE_QUOTED: OnceLock<Option<regex::Regex>> = OnceLock::new();
    static SINGLE_QUOTED: OnceLock<Option<regex::Regex>> = OnceLock::new();
    static BACKTICKED: OnceLock<Option<regex::Regex>> = OnceLock::new();

    let mut out = message.to_owned();
    let double = DOUBLE_QUOTED.get_or_init(|| regex::Regex::new(r#""(?:\\.|[^"\\])*""#).ok());
    if let Some(re) = double {
        out = re.replace_all(&out, r#""<redacted>""#).into_owned();
    }
    let single = SINGLE_QUOTED.get_or_init(|| regex::Regex::new(r"'(?:\\.|[^'\\])*'").ok());
    if let Some(re) = single {
        out = re.replace_all(&out, "'<redacted>'").into_owned();
    }

    let backticked = BACKTICKED.get_or_init(|| {
        regex::Regex::new(r"(unknown field|unknown variant|invalid type: [a-z ]+|invalid value: [a-z ]+) `[^`]*`").ok()
    });
    if let Some(re) = backticked {
        out = re.replace_all(&out, "$1 `<redacted>`").into_owned();
    }
    out
}

impl SluiceConfig {
    /// Loads a config file without semantic validation.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = read_config(path.as_ref())?;
        Ok(toml::from_str(&text)?)
    }

    /// Loads a config file and reports unknown keys and validation findings.
    pub fn load_from_path_with_diagnostics(
        path: impl AsRef<Path>,
    ) -> Result<(Self, ConfigDiagnostics), ConfigError> {
        let text = read_config(path.as_ref())?;
        Self::load_from_str_with_diagnostics(&text)
    }

    pub fn load_from_str_with_diagnostics(
        text: &str,
    ) -> Result<(Self, ConfigDiagnostics), ConfigError> {
        let (config, unknown_keys) =
            diagnostics::deserialize_toml_with_unknown_keys::<SluiceConfig>(text)?;

        let mut diagnostics = ConfigDiagnostics {
            unknown_keys,
            ..ConfigDiagnostics::default()
        };
        diagnostics.extend_validation(config.validate());
        for key in &diagnostics.unknown_keys {
            tracing::warn!(target: "sluice.config", key = %key, "ignoring unknown config key");
        }
        Ok((config, diagnostics))
    }
}

fn read_config(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })
}

/// Builds the configured resource-group tree and a manager driving it.
///
/// With no declared groups the tree is a single unbounded
/// [`DEFAULT_ROOT_GROUP`]. Declaring more than one root, or the same sibling
/// twice, is a configuration error.
pub fn build_resource_groups(
    config: &SluiceConfig,
) -> Result<ResourceGroupManager, ResourceGroupError> {
    let root = match config.resource_groups.as_slice() {
        [] => ResourceGroup::new_root(DEFAULT_ROOT_GROUP, GroupLimits::default())?,
        [root] => {
            let group = ResourceGroup::new_root(root.name.as_str(), root.limits())?;
            add_sub_groups(&group, &root.sub_groups)?;
            group
        }
        [first, second, ..] => {
            return Err(ResourceGroupError::InvalidConfiguration {
                group: sluice_core::ResourceGroupId::new_root(second.name.as_str())?,
                message: format!(
                    "only one root resource group is supported and \"{}\" is already declared",
                    first.name
                ),
            });
        }
    };

    tracing::debug!(
        target: "sluice.config",
        root = %root.id(),
        groups = count_groups(&config.resource_groups),
        "built resource group tree"
    );
    Ok(ResourceGroupManager::new(
        root,
        config.scheduler.refresh_interval(),
    ))
}

fn add_sub_groups(
    parent: &Arc<ResourceGroup>,
    configs: &[ResourceGroupConfig],
) -> Result<(), ResourceGroupError> {
    for config in configs {
        if parent.sub_group(&config.name).is_some() {
            return Err(ResourceGroupError::InvalidConfiguration {
                group: parent.id().child(config.name.as_str())?,
                message: "declared more than once".to_owned(),
            });
        }
        let group = parent.get_or_create_sub_group(&config.name)?;
        group.apply_limits(config.limits())?;
        add_sub_groups(&group, &config.sub_groups)?;
    }
    Ok(())
}

fn count_groups(configs: &[ResourceGroupConfig]) -> usize {
    configs
        .iter()
        .map(|config| 1 + count_groups(&config.sub_groups))
        .sum()
}
