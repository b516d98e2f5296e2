//! Top-level error type for engine operations.
//!
//! Setup problems surface as [`SimError::Config`] before any tick runs.
//! Failures inside a tick always carry the offending event's name and the
//! tick index, which is enough to reproduce them by reissuing `configure`
//! with the same seeds and tick count.

use microsim_types::{PopulationError, SchemaError};

use crate::cluster::ClusterError;
use crate::config::ConfigError;

/// Errors returned by the simulation engine.
#[derive(Debug, thiserror::Error)]
pub enum SimError {
    /// Setup or reconfiguration failed validation.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: ConfigError,
    },

    /// The population initializer failed.
    #[error("population initializer failed: {source}")]
    Initializer {
        /// Cause reported by the initializer.
        source: anyhow::Error,
    },

    /// An event's result does not match the population's schema.
    #[error("event `{event}` at tick {tick} broke the population schema: {source}")]
    Schema {
        /// Name of the event.
        event: String,
        /// Tick index at which the violation occurred.
        tick: u64,
        /// The mismatch.
        source: SchemaError,
    },

    /// An event read a bookkeeping column that is missing or mistyped.
    #[error("event `{event}` at tick {tick} left an unreadable population: {source}")]
    Table {
        /// Name of the event.
        event: String,
        /// Tick index at which the failure occurred.
        tick: u64,
        /// The table error.
        source: PopulationError,
    },

    /// An event was invoked with a parameter vector it cannot use.
    #[error("event `{event}` at tick {tick} has invalid parameters: {source}")]
    Parameters {
        /// Name of the event.
        event: String,
        /// Tick index of the invocation.
        tick: u64,
        /// The parameter-count error.
        source: ConfigError,
    },

    /// An event mechanism raised.
    #[error("event `{event}` failed at tick {tick}: {source}")]
    Mechanism {
        /// Name of the event.
        event: String,
        /// Tick index of the failure.
        tick: u64,
        /// Cause reported by the mechanism.
        source: anyhow::Error,
    },

    /// Worker pool acquisition or a parallel tick failed.
    #[error("cluster error: {source}")]
    Cluster {
        /// The underlying cluster error.
        #[from]
        source: ClusterError,
    },

    /// A calibration trial's output or objective function raised.
    #[error("calibration trial {trial} failed: {source}")]
    Calibration {
        /// One-based trial number.
        trial: usize,
        /// Cause reported by the output or objective function.
        source: anyhow::Error,
    },
}

impl SimError {
    /// Name of the event that failed, if the error happened inside a tick.
    pub fn event(&self) -> Option<&str> {
        match self {
            Self::Schema { event, .. }
            | Self::Table { event, .. }
            | Self::Parameters { event, .. }
            | Self::Mechanism { event, .. } => Some(event),
            Self::Cluster {
                source: ClusterError::WorkerFailed { source, .. },
            } => source.event(),
            _ => None,
        }
    }

    /// Tick index of the failure, if the error happened inside a tick.
    pub fn tick(&self) -> Option<u64> {
        match self {
            Self::Schema { tick, .. }
            | Self::Table { tick, .. }
            | Self::Parameters { tick, .. }
            | Self::Mechanism { tick, .. } => Some(*tick),
            Self::Cluster {
                source: ClusterError::WorkerFailed { source, .. },
            } => source.tick(),
            _ => None,
        }
    }
}
