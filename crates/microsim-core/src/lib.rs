//! Clock, event trees, tick execution and calibration for the
//! microsimulation engine.
//!
//! A [`Simulator`] owns a population, a clock and two event trees. Each
//! tick runs the manipulation tree, then the accumulation tree, appends
//! newly accumulated individuals and advances the clock by one unit.
//! Ticks can be spread across a worker pool in population chunks.
//!
//! # Modules
//!
//! - [`calibration`] -- [`Minimizer`] trait, the [`NelderMead`] minimizer
//!   and [`Simulator::calibrate`].
//! - [`clock`] -- Simulation clock with unit conversion.
//! - [`cluster`] -- [`WorkerPool`] trait, rayon and serial pools, chunk
//!   partitioning and merging.
//! - [`config`] -- Configuration loading from `microsim-config.yaml` and
//!   the setup-validation [`ConfigError`].
//! - [`engine`] -- The [`Simulator`]: `run`, `configure`, `reconfigure`
//!   and cluster lifecycle.
//! - [`error`] -- The top-level [`SimError`].
//! - [`event`] -- [`Event`] and its mechanisms.
//! - [`seeds`] -- Reproducible per-worker, per-tick random streams.
//! - [`store`] -- Bookkeeping of the `id`, `alive` and `last_event`
//!   columns.
//! - [`tree`] -- Event trees and per-tick evaluation.
//!
//! [`Minimizer`]: calibration::Minimizer
//! [`NelderMead`]: calibration::NelderMead
//! [`WorkerPool`]: cluster::WorkerPool
//! [`ConfigError`]: config::ConfigError
//! [`Simulator`]: engine::Simulator
//! [`Simulator::calibrate`]: engine::Simulator::calibrate
//! [`SimError`]: error::SimError
//! [`Event`]: event::Event

pub mod calibration;
pub mod clock;
pub mod cluster;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod seeds;
pub mod store;
pub mod tree;

pub use calibration::{
    CalibrationOutcome, CalibrationSpec, Minimizer, NelderMead, NelderMeadOptions,
};
pub use clock::{Clock, TimeUnit};
pub use cluster::{Backend, ClusterError, ClusterSpec, RayonPool, SerialPool, WorkerPool};
pub use config::{ConfigError, MicrosimConfig};
pub use engine::{ClusterGuard, EventTrees, ParameterOverrides, Simulator};
pub use error::SimError;
pub use event::{Event, EventRng, param};
pub use seeds::Seeds;
pub use tree::{EventGroup, EventNode};
