// Engine configuration.
//
// All tunable classifier and pattern parameters live in `EngineConfig`,
// loaded from JSON. Every field has a default, so a config file only needs
// the values it overrides. Seeds are part of the config: two runs with the
// same config and population train identical models.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Parameters of the perceptron backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkParams {
    /// Units in the single hidden layer.
    pub hidden_units: usize,
    /// Step size of the back-propagation update.
    pub learning_rate: f64,
    /// Fraction of the previous update carried into the next one.
    pub momentum: f64,
    /// Initial weights are drawn from `[-init_range, init_range)`.
    pub init_range: f64,
    /// Hard cap on training epochs.
    pub max_epochs: usize,
    /// Training stops once an epoch's mean squared error falls to this.
    pub max_error: f64,
    pub seed: u64,
}

impl Default for NetworkParams {
    fn default() -> Self {
        Self {
            hidden_units: 24,
            learning_rate: 0.25,
            momentum: 0.2,
            init_range: 0.3,
            max_epochs: 300,
            max_error: 1e-4,
            seed: 0x5eed_0001,
        }
    }
}

/// Parameters of the linear backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinearParams {
    /// Normalised LMS step, stable in (0, 2).
    pub learning_rate: f64,
    pub max_epochs: usize,
    pub max_error: f64,
    /// Seeds the per-epoch sample order.
    pub seed: u64,
}

impl Default for LinearParams {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            max_epochs: 100,
            max_error: 1e-3,
            seed: 0x5eed_0002,
        }
    }
}

/// Pattern engine setup.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternParams {
    /// Pass names in execution order. Later passes see the corrections of
    /// earlier ones.
    pub passes: Vec<String>,
    /// Minimum grade a compound needs to be committed.
    pub min_grade: f64,
}

impl Default for PatternParams {
    fn default() -> Self {
        Self {
            passes: vec!["fermata_dot".into(), "clef_dot".into()],
            min_grade: crate::glyph::grades::NO_MIN_GRADE,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub network: NetworkParams,
    pub linear: LinearParams,
    pub patterns: PatternParams,
}

impl EngineConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let n = &self.network;
        if n.hidden_units == 0 {
            return Err(ConfigError::Invalid("network.hidden_units must be > 0".into()));
        }
        if n.learning_rate.is_nan() || n.learning_rate <= 0.0 {
            return Err(ConfigError::Invalid("network.learning_rate must be > 0".into()));
        }
        if !(0.0..1.0).contains(&n.momentum) {
            return Err(ConfigError::Invalid("network.momentum must be in [0, 1)".into()));
        }
        if n.init_range.is_nan() || n.init_range <= 0.0 {
            return Err(ConfigError::Invalid("network.init_range must be > 0".into()));
        }
        let l = &self.linear;
        if l.learning_rate.is_nan() || l.learning_rate <= 0.0 || l.learning_rate >= 2.0 {
            return Err(ConfigError::Invalid("linear.learning_rate must be in (0, 2)".into()));
        }
        if !(0.0..=crate::glyph::grades::MAX_GRADE).contains(&self.patterns.min_grade) {
            return Err(ConfigError::Invalid("patterns.min_grade must be in [0, 100]".into()));
        }
        Ok(())
    }
}
