use serde::de::DeserializeOwned;

/// Everything noticed while loading a config that did not prevent loading it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigDiagnostics {
    /// Keys the schema does not know, as full TOML paths (`resource_groups[0].max_queud`).
    pub unknown_keys: Vec<String>,
    pub warnings: Vec<ConfigWarning>,
    /// The config deserialized but cannot be applied as written.
    pub errors: Vec<ConfigValidationError>,
}

impl ConfigDiagnostics {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.unknown_keys.is_empty() && self.warnings.is_empty() && self.errors.is_empty()
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub(crate) fn extend_validation(&mut self, validation: ValidationDiagnostics) {
        self.warnings.extend(validation.warnings);
        self.errors.extend(validation.errors);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationDiagnostics {
    pub warnings: Vec<ConfigWarning>,
    pub errors: Vec<ConfigValidationError>,
}

impl ValidationDiagnostics {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.warnings.is_empty() && self.errors.is_empty()
    }

    /// Warnings alone do not make a config unusable.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    LoggingLevelInvalid {
        value: String,
        normalized: String,
    },
    /// A hard CPU limit without quota generation never recovers once reached.
    CpuQuotaNeverRegenerated {
        toml_path: String,
    },
    /// Quota generation without a hard CPU limit has nothing to refill.
    CpuQuotaGenerationUnused {
        toml_path: String,
    },
    /// The parent's policy does not look at scheduling weights.
    SchedulingWeightIgnored {
        toml_path: String,
        parent_policy: &'static str,
    },
}

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigValidationError {
    InvalidValue {
        toml_path: String,
        message: String,
    },
    InvalidGroupName {
        toml_path: String,
        name: String,
    },
    DuplicateGroupName {
        toml_path: String,
        name: String,
    },
    MultipleRootGroups {
        names: Vec<String>,
    },
}

pub(crate) fn deserialize_toml_with_unknown_keys<T: DeserializeOwned>(
    text: &str,
) -> Result<(T, Vec<String>), toml::de::Error> {
    let mut unknown = Vec::new();
    let deserializer = toml::de::Deserializer::new(text);
    let value = serde_ignored::deserialize(deserializer, |path| {
        unknown.push(toml_path(&path));
    })?;
    unknown.sort();
    unknown.dedup();
    Ok((value, unknown))
}

/// Renders a `serde_ignored` path as `a.b[0].c`.
fn toml_path(path: &serde_ignored::Path<'_>) -> String {
    let raw = path.to_string();
    let mut out = String::new();
    for (idx, segment) in raw.trim_start_matches('.').split('.').enumerate() {
        if idx > 0 && !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit()) {
            out.push('[');
            out.push_str(segment);
            out.push(']');
            continue;
        }
        if !out.is_empty() {
            out.push('.');
        }
        out.push_str(segment);
    }
    out
}
