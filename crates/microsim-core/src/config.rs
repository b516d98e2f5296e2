//! Configuration loading and typed config structures for the engine.
//!
//! The canonical configuration lives in `microsim-config.yaml` at the
//! project root. Sections the engine does not interpret (the model's own
//! parameters, the synthetic population settings) are left to the binary
//! that owns them.
//!
//! [`ConfigError`] doubles as the engine's setup-validation error: every
//! problem that can be detected before a tick runs (unknown time units,
//! parameter-count mismatches, missing population columns) is reported
//! through it.

use std::path::Path;

use chrono::NaiveDate;
use serde::Deserialize;

use crate::calibration::NelderMeadOptions;
use crate::cluster::Backend;

/// Environment variable that overrides `simulation.seed`.
pub const SEED_ENV_VAR: &str = "MICROSIM_SEED";

/// Errors detected while loading configuration or validating engine setup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },

    /// A clock unit is not one of hour, day, week, month, year.
    #[error("unknown time unit `{unit}`")]
    UnknownTimeUnit {
        /// The unrecognized unit.
        unit: String,
    },

    /// A clock advance amount was negative or not finite.
    #[error("invalid clock advance amount {amount}")]
    InvalidAdvance {
        /// The rejected amount.
        amount: f64,
    },

    /// An event received a parameter vector of the wrong length.
    #[error("event `{event}` expects {expected} parameters, got {actual}")]
    ParameterCount {
        /// Name of the event.
        event: String,
        /// Declared (or minimum required) parameter count.
        expected: usize,
        /// Supplied parameter count.
        actual: usize,
    },

    /// A parameter override or calibration target names no known event.
    #[error("unknown event `{event}`")]
    UnknownEvent {
        /// The unknown name.
        event: String,
    },

    /// Two events share a name.
    #[error("duplicate event name `{event}`")]
    DuplicateEvent {
        /// The repeated name.
        event: String,
    },

    /// An event was placed in the tree of the other kind.
    #[error("{kind} event `{event}` was placed in the {tree} tree")]
    MisplacedEvent {
        /// Name of the event.
        event: String,
        /// The event's kind.
        kind: String,
        /// The tree it was placed in.
        tree: String,
    },

    /// A calibration index points past the end of the parameter vector.
    #[error("calibration index {index} for event `{event}` exceeds parameter vector length {len}")]
    ParameterIndex {
        /// Event the index belongs to.
        event: String,
        /// The out-of-range index.
        index: usize,
        /// Length of the calibration parameter vector.
        len: usize,
    },

    /// A required population column is absent.
    #[error("population is missing required column `{column}`")]
    MissingColumn {
        /// Name of the missing column.
        column: String,
    },

    /// A required population column has the wrong kind or invalid values.
    #[error("population column `{column}` is invalid: {reason}")]
    InvalidColumn {
        /// Name of the column.
        column: String,
        /// Explanation of what is wrong.
        reason: String,
    },

    /// Two individuals share an identity.
    #[error("duplicate individual id {id}")]
    DuplicateId {
        /// The repeated id.
        id: i64,
    },

    /// The seed configuration cannot serve the requested workers.
    #[error("invalid seeds: {reason}")]
    InvalidSeeds {
        /// Explanation of what is wrong.
        reason: String,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Top-level engine configuration.
///
/// Mirrors the structure of `microsim-config.yaml`. All fields have
/// defaults, so an empty file is a valid configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MicrosimConfig {
    /// Run length, seed and worker settings.
    #[serde(default)]
    pub simulation: SimulationConfig,

    /// Clock unit and origin.
    #[serde(default)]
    pub clock: ClockConfig,

    /// Calibration settings.
    #[serde(default)]
    pub calibration: CalibrationConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl MicrosimConfig {
    /// Load configuration from a YAML file at the given path.
    ///
    /// The `MICROSIM_SEED` environment variable overrides
    /// `simulation.seed` when it holds a valid integer.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, or
    /// [`ConfigError::Yaml`] if the content is not valid YAML.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let mut config: Self = if yaml.trim().is_empty() {
            Self::default()
        } else {
            serde_yml::from_str(yaml)?
        };
        config.simulation.apply_env_overrides();
        Ok(config)
    }
}

/// Run length, seed and worker settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SimulationConfig {
    /// Number of ticks to run.
    #[serde(default = "default_ticks")]
    pub ticks: u64,

    /// Base random seed.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Worker count; 0 runs serially without a cluster.
    #[serde(default)]
    pub workers: usize,

    /// Worker pool implementation.
    #[serde(default)]
    pub backend: Backend,
}

impl SimulationConfig {
    /// Override the seed from `MICROSIM_SEED` when set and parseable.
    pub fn apply_env_overrides(&mut self) {
        if let Some(seed) = std::env::var(SEED_ENV_VAR)
            .ok()
            .and_then(|val| val.trim().parse().ok())
        {
            self.seed = seed;
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            ticks: default_ticks(),
            seed: default_seed(),
            workers: 0,
            backend: Backend::default(),
        }
    }
}

/// Clock configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClockConfig {
    /// Native tick unit: hour, day, week, month or year.
    #[serde(default = "default_clock_unit")]
    pub unit: String,

    /// Calendar date of tick 0.
    #[serde(default = "default_origin")]
    pub origin: NaiveDate,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            unit: default_clock_unit(),
            origin: default_origin(),
        }
    }
}

/// Calibration configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CalibrationConfig {
    /// Whether the binary should calibrate before the main run.
    #[serde(default)]
    pub enabled: bool,

    /// Ticks simulated by each calibration trial.
    #[serde(default = "default_calibration_ticks")]
    pub ticks: u64,

    /// Whether winning parameters are committed via `reconfigure`.
    #[serde(default = "default_true")]
    pub auto_commit: bool,

    /// Options passed to the Nelder-Mead minimizer.
    #[serde(default)]
    pub optimizer: NelderMeadOptions,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ticks: default_calibration_ticks(),
            auto_commit: true,
            optimizer: NelderMeadOptions::default(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error). `RUST_LOG` wins.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

const fn default_ticks() -> u64 {
    365
}

const fn default_seed() -> u64 {
    42
}

fn default_clock_unit() -> String {
    "day".to_owned()
}

fn default_origin() -> NaiveDate {
    NaiveDate::from_ymd_opt(2000, 1, 1).unwrap_or(NaiveDate::MIN)
}

const fn default_calibration_ticks() -> u64 {
    365
}

fn default_log_level() -> String {
    "info".to_owned()
}

const fn default_true() -> bool {
    true
}
