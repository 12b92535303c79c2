use crate::sensitivity::SensitivityOptions;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read or write analysis config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML analysis config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to serialize analysis config to TOML: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// How a ranking is presented.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReportConfig {
    /// Passed to `SensitivityResult::top_n`; negative values select the tail.
    pub top: Option<i64>,
    /// Restrict the ranking to one group before `top` applies.
    pub group: Option<String>,
    /// Report per-group sums instead of individual entries.
    pub by_group: bool,
}

/// Settings loaded from an optional TOML file such as:
///
/// ```toml
/// [sensitivity]
/// drop_regularization = true
/// drop_groups = ["head"]
///
/// [report]
/// top = -10
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalysisConfig {
    pub sensitivity: SensitivityOptions,
    pub report: ReportConfig,
}

/// Values given on the command line. They are layered over a loaded config.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub drop_regularization: bool,
    pub drop_groups: Vec<String>,
    pub keep_groups: Vec<String>,
    pub top: Option<i64>,
    pub group: Option<String>,
    pub by_group: bool,
}

impl AnalysisConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let text = toml::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(text.as_bytes())?;
        Ok(())
    }

    /// Flags switch options on and add groups; scalar flags replace file values.
    pub fn merge(mut self, overrides: ConfigOverrides) -> Self {
        let options = &mut self.sensitivity;
        options.drop_regularization |= overrides.drop_regularization;
        options.drop_groups.extend(overrides.drop_groups);
        if !overrides.keep_groups.is_empty() {
            options
                .keep_groups
                .get_or_insert_with(Vec::new)
                .extend(overrides.keep_groups);
        }

        let report = &mut self.report;
        if overrides.top.is_some() {
            report.top = overrides.top;
        }
        if overrides.group.is_some() {
            report.group = overrides.group;
        }
        report.by_group |= overrides.by_group;
        self
    }
}
