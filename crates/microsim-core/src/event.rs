//! Events: named, parameterized transformations of the population.
//!
//! An [`Event`] pairs an immutable mechanism with a replaceable parameter
//! vector. Mechanisms come in two kinds:
//!
//! - **Manipulation** -- receives the population, the living mask, the
//!   parameters and a random stream, and returns the transformed
//!   population. Row count and schema must be preserved, and rows outside
//!   the living mask are expected to stay untouched unless the mechanism
//!   deliberately targets the dead.
//! - **Accumulation** -- receives the population, the parameters and a
//!   random stream, and returns *new* rows with the population's schema.
//!
//! Mechanisms never see the engine's stored table directly; they borrow a
//! value and hand back a new one, and the engine decides what to keep.

use std::fmt;
use std::sync::Arc;

use microsim_types::{LivingMask, Population};
use rand_chacha::ChaCha8Rng;

use crate::config::ConfigError;

/// Random stream handed to mechanisms.
pub type EventRng = ChaCha8Rng;

/// Signature of a manipulation mechanism.
pub type ManipulationFn = Arc<
    dyn Fn(&Population, &LivingMask, &[f64], &mut EventRng) -> anyhow::Result<Population>
        + Send
        + Sync,
>;

/// Signature of an accumulation mechanism.
pub type AccumulationFn =
    Arc<dyn Fn(&Population, &[f64], &mut EventRng) -> anyhow::Result<Population> + Send + Sync>;

/// A mechanism read a parameter index that the vector does not have.
///
/// Returned by [`param`]; the engine reports it as a parameter-count
/// configuration error naming the event and tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("parameter {index} requested but only {len} supplied")]
pub struct MissingParameter {
    /// The requested index.
    pub index: usize,
    /// Length of the supplied vector.
    pub len: usize,
}

/// Read parameter `index`, failing with [`MissingParameter`] when absent.
pub fn param(params: &[f64], index: usize) -> Result<f64, MissingParameter> {
    params.get(index).copied().ok_or(MissingParameter {
        index,
        len: params.len(),
    })
}

/// The behaviour of an event.
#[derive(Clone)]
pub enum Mechanism {
    /// Mutates existing rows.
    Manipulation(ManipulationFn),
    /// Produces rows to append.
    Accumulation(AccumulationFn),
}

impl fmt::Debug for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Manipulation(_) => f.write_str("Manipulation(..)"),
            Self::Accumulation(_) => f.write_str("Accumulation(..)"),
        }
    }
}

/// A named, described, parameterized population transformation.
#[derive(Debug, Clone)]
pub struct Event {
    name: String,
    description: Option<String>,
    parameters: Vec<f64>,
    arity: Option<usize>,
    mechanism: Mechanism,
}

impl Event {
    /// Create a manipulation event.
    pub fn manipulation<F>(name: impl Into<String>, parameters: Vec<f64>, mechanism: F) -> Self
    where
        F: Fn(&Population, &LivingMask, &[f64], &mut EventRng) -> anyhow::Result<Population>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            description: None,
            parameters,
            arity: None,
            mechanism: Mechanism::Manipulation(Arc::new(mechanism)),
        }
    }

    /// Create an accumulation event.
    pub fn accumulation<F>(name: impl Into<String>, parameters: Vec<f64>, mechanism: F) -> Self
    where
        F: Fn(&Population, &[f64], &mut EventRng) -> anyhow::Result<Population>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            description: None,
            parameters,
            arity: None,
            mechanism: Mechanism::Accumulation(Arc::new(mechanism)),
        }
    }

    /// Attach a human-readable description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Declare the exact parameter count the mechanism expects. Overrides
    /// of any other length are rejected before they are applied.
    #[must_use]
    pub const fn with_arity(mut self, arity: usize) -> Self {
        self.arity = Some(arity);
        self
    }

    /// Unique name of the event within its engine.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Optional description.
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Current parameter vector.
    pub fn parameters(&self) -> &[f64] {
        &self.parameters
    }

    /// Declared parameter count, if any.
    pub const fn arity(&self) -> Option<usize> {
        self.arity
    }

    /// The event's mechanism.
    pub const fn mechanism(&self) -> &Mechanism {
        &self.mechanism
    }

    /// Whether this is a manipulation event.
    pub const fn is_manipulation(&self) -> bool {
        matches!(self.mechanism, Mechanism::Manipulation(_))
    }

    /// Check a candidate parameter vector against the declared arity.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ParameterCount`] on a length mismatch.
    pub fn check_parameters(&self, parameters: &[f64]) -> Result<(), ConfigError> {
        match self.arity {
            Some(expected) if expected != parameters.len() => Err(ConfigError::ParameterCount {
                event: self.name.clone(),
                expected,
                actual: parameters.len(),
            }),
            _ => Ok(()),
        }
    }

    /// Replace the parameter vector after checking it.
    pub(crate) fn set_parameters(&mut self, parameters: Vec<f64>) -> Result<(), ConfigError> {
        self.check_parameters(&parameters)?;
        self.parameters = parameters;
        Ok(())
    }
}
