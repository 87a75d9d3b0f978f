//! Run configuration, read from a TOML file. Every section is optional and
//! falls back to the built-in defaults.
//!
//! ```toml
//! target = "is_covid_death"
//!
//! [segmentation]
//! tolerance_hours = 24
//!
//! [evaluation]
//! n_folds = 20
//! seed = 42
//!
//! [[models]]
//! name = "demographics"
//! formula = "is_covid_death ~ gender + race + age"
//! ```

use crate::evaluate::{DEFAULT_TARGET, EvaluationConfig, ModelSpec};
use crate::segment::SegmentationConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write config file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML config file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize config to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Invalid config value for '{field}': {reason}")]
    InvalidValue {
        field: &'static str,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub target: String,
    pub segmentation: SegmentationConfig,
    pub evaluation: EvaluationConfig,
    pub models: Vec<ModelSpec>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            target: DEFAULT_TARGET.to_string(),
            segmentation: SegmentationConfig::default(),
            evaluation: EvaluationConfig::default(),
            models: default_models(),
        }
    }
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let hours = self.segmentation.tolerance_hours;
        if hours < 0 || chrono::Duration::try_hours(hours).is_none() {
            return Err(ConfigError::InvalidValue {
                field: "segmentation.tolerance_hours",
                reason: format!("{hours} is not a non-negative number of hours a duration can hold"),
            });
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(text.as_bytes())?;
        Ok(())
    }
}

/// The candidate feature sets compared when no models are configured.
pub fn default_models() -> Vec<ModelSpec> {
    [
        ("age", "is_covid_death ~ age"),
        ("demographics", "is_covid_death ~ gender + race + age"),
        ("age_duration", "is_covid_death ~ age + duration"),
        ("age_x_duration", "is_covid_death ~ age*duration"),
        ("gender_x_age", "is_covid_death ~ race + gender*age"),
        ("full", "is_covid_death ~ gender + race + age*duration"),
    ]
    .into_iter()
    .map(|(name, formula)| ModelSpec::new(name, formula))
    .collect()
}
