//! Shared data types for the microsimulation engine.
//!
//! The population is a column-oriented table with one row per individual.
//! The engine only interprets three bookkeeping columns; everything else
//! is opaque status data owned by the model's event mechanisms.
//!
//! # Modules
//!
//! - [`column`] -- Typed column storage ([`Column`]), column kinds and
//!   single-cell [`Value`]s.
//! - [`error`] -- [`PopulationError`] and [`SchemaError`].
//! - [`mask`] -- The [`LivingMask`] derived from the `alive` column.
//! - [`population`] -- The [`Population`] table and its [`Schema`].

pub mod column;
pub mod error;
pub mod mask;
pub mod population;

pub use column::{Column, ColumnKind, Value};
pub use error::{PopulationError, SchemaError};
pub use mask::LivingMask;
pub use population::{ALIVE_COLUMN, ID_COLUMN, LAST_EVENT_COLUMN, Population, Row, Schema};
