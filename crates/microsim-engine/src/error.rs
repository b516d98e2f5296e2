//! Error types for the microsimulation binary.
//!
//! [`EngineError`] wraps every failure mode of startup, calibration and
//! the main run so `main` can propagate with `?`.

/// Top-level error for the microsimulation binary.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Configuration loading or engine setup validation failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: microsim_core::ConfigError,
    },

    /// Building, calibrating or running the simulation failed.
    #[error("simulation error: {source}")]
    Simulation {
        /// The underlying engine error.
        #[from]
        source: microsim_core::SimError,
    },

    /// A model section of the configuration file is malformed.
    #[error("model config error: {message}")]
    Model {
        /// Description of the problem.
        message: String,
    },

    /// Computing a yearly summary failed.
    #[error("summary error: {source}")]
    Summary {
        /// The underlying cause.
        source: anyhow::Error,
    },
}
