//! The population table.
//!
//! A [`Population`] is a set of equally long, named [`Column`]s. Column
//! order is canonical (sorted by name), which makes the [`Schema`] of two
//! tables directly comparable and keeps serialized output stable.
//!
//! The engine interprets three columns:
//!
//! - [`ID_COLUMN`] -- unique integer identity of each individual.
//! - [`ALIVE_COLUMN`] -- flag; dead rows stay in the table forever.
//! - [`LAST_EVENT_COLUMN`] -- name of the most recent event that altered
//!   the row, or empty.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;

use serde::Serialize;

use crate::column::{Column, ColumnKind, Value};
use crate::error::{PopulationError, SchemaError};
use crate::mask::LivingMask;

/// Name of the identity column.
pub const ID_COLUMN: &str = "id";

/// Name of the alive flag column.
pub const ALIVE_COLUMN: &str = "alive";

/// Name of the column recording the last event that touched a row.
pub const LAST_EVENT_COLUMN: &str = "last_event";

/// A single row viewed as `column name -> value`.
pub type Row = BTreeMap<String, Value>;

/// Ordered `(name, kind)` description of a table's columns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Schema(Vec<(String, ColumnKind)>);

impl Schema {
    /// Iterate over `(name, kind)` pairs in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, ColumnKind)> {
        self.0.iter().map(|(name, kind)| (name.as_str(), *kind))
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the schema has no columns.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether a column of this name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|(n, _)| n == name)
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, kind)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}:{kind}")?;
        }
        Ok(())
    }
}

/// Column-oriented table with one row per individual.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Population {
    /// Columns keyed by name.
    columns: BTreeMap<String, Column>,
    /// Shared length of every column.
    rows: usize,
}

impl Population {
    /// Create a table with no columns and no rows.
    pub const fn new() -> Self {
        Self {
            columns: BTreeMap::new(),
            rows: 0,
        }
    }

    /// Build a table from named columns.
    ///
    /// # Errors
    ///
    /// Returns [`PopulationError::DuplicateColumn`] if a name repeats and
    /// [`PopulationError::LengthMismatch`] if the columns differ in length.
    pub fn from_columns<N, I>(columns: I) -> Result<Self, PopulationError>
    where
        N: Into<String>,
        I: IntoIterator<Item = (N, Column)>,
    {
        let mut table = Self::new();
        for (name, column) in columns {
            let name = name.into();
            if table.columns.contains_key(&name) {
                return Err(PopulationError::DuplicateColumn { column: name });
            }
            table.insert_column(name, column)?;
        }
        Ok(table)
    }

    /// Insert or replace a column.
    ///
    /// The first column inserted into an empty table sets the row count.
    ///
    /// # Errors
    ///
    /// Returns [`PopulationError::LengthMismatch`] if the column length
    /// differs from the table's row count.
    pub fn insert_column(
        &mut self,
        name: impl Into<String>,
        column: Column,
    ) -> Result<(), PopulationError> {
        let name = name.into();
        let sole_replacement = self.columns.len() == 1 && self.columns.contains_key(&name);
        if self.columns.is_empty() || sole_replacement {
            self.rows = column.len();
        } else if column.len() != self.rows {
            return Err(PopulationError::LengthMismatch {
                column: name,
                expected: self.rows,
                found: column.len(),
            });
        }
        self.columns.insert(name, column);
        Ok(())
    }

    /// Builder-style [`insert_column`](Self::insert_column).
    pub fn with_column(
        mut self,
        name: impl Into<String>,
        column: Column,
    ) -> Result<Self, PopulationError> {
        self.insert_column(name, column)?;
        Ok(self)
    }

    /// Number of rows (individuals, living or dead).
    pub const fn len(&self) -> usize {
        self.rows
    }

    /// Whether the table has no rows.
    pub const fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// Number of columns.
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// The table's schema in canonical order.
    pub fn schema(&self) -> Schema {
        Schema(
            self.columns
                .iter()
                .map(|(name, column)| (name.clone(), column.kind()))
                .collect(),
        )
    }

    /// Whether a column of this name exists.
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    /// Iterate over `(name, column)` pairs in canonical order.
    pub fn columns(&self) -> impl Iterator<Item = (&str, &Column)> {
        self.columns.iter().map(|(name, column)| (name.as_str(), column))
    }

    /// Borrow a column by name.
    pub fn column(&self, name: &str) -> Result<&Column, PopulationError> {
        self.columns
            .get(name)
            .ok_or_else(|| PopulationError::MissingColumn {
                column: name.to_owned(),
            })
    }

    fn column_mut(&mut self, name: &str) -> Result<&mut Column, PopulationError> {
        self.columns
            .get_mut(name)
            .ok_or_else(|| PopulationError::MissingColumn {
                column: name.to_owned(),
            })
    }

    /// Borrow a float column.
    pub fn floats(&self, name: &str) -> Result<&[f64], PopulationError> {
        match self.column(name)? {
            Column::Float(v) => Ok(v),
            other => Err(wrong_kind(name, ColumnKind::Float, other)),
        }
    }

    /// Mutably borrow a float column. The slice cannot change length.
    pub fn floats_mut(&mut self, name: &str) -> Result<&mut [f64], PopulationError> {
        match self.column_mut(name)? {
            Column::Float(v) => Ok(v),
            other => Err(wrong_kind(name, ColumnKind::Float, other)),
        }
    }

    /// Borrow an integer column.
    pub fn ints(&self, name: &str) -> Result<&[i64], PopulationError> {
        match self.column(name)? {
            Column::Int(v) => Ok(v),
            other => Err(wrong_kind(name, ColumnKind::Int, other)),
        }
    }

    /// Mutably borrow an integer column.
    pub fn ints_mut(&mut self, name: &str) -> Result<&mut [i64], PopulationError> {
        match self.column_mut(name)? {
            Column::Int(v) => Ok(v),
            other => Err(wrong_kind(name, ColumnKind::Int, other)),
        }
    }

    /// Borrow a flag column.
    pub fn bools(&self, name: &str) -> Result<&[bool], PopulationError> {
        match self.column(name)? {
            Column::Bool(v) => Ok(v),
            other => Err(wrong_kind(name, ColumnKind::Bool, other)),
        }
    }

    /// Mutably borrow a flag column.
    pub fn bools_mut(&mut self, name: &str) -> Result<&mut [bool], PopulationError> {
        match self.column_mut(name)? {
            Column::Bool(v) => Ok(v),
            other => Err(wrong_kind(name, ColumnKind::Bool, other)),
        }
    }

    /// Borrow a text column.
    pub fn texts(&self, name: &str) -> Result<&[String], PopulationError> {
        match self.column(name)? {
            Column::Text(v) => Ok(v),
            other => Err(wrong_kind(name, ColumnKind::Text, other)),
        }
    }

    /// Mutably borrow a text column.
    pub fn texts_mut(&mut self, name: &str) -> Result<&mut [String], PopulationError> {
        match self.column_mut(name)? {
            Column::Text(v) => Ok(v),
            other => Err(wrong_kind(name, ColumnKind::Text, other)),
        }
    }

    /// Compute the living mask from the `alive` column.
    pub fn living_mask(&self) -> Result<LivingMask, PopulationError> {
        self.bools(ALIVE_COLUMN).map(LivingMask::from)
    }

    /// Number of rows with `alive` set.
    pub fn alive_count(&self) -> Result<usize, PopulationError> {
        Ok(self.bools(ALIVE_COLUMN)?.iter().filter(|a| **a).count())
    }

    /// Mean of a numeric or flag column; `None` for empty tables.
    pub fn mean(&self, name: &str) -> Result<Option<f64>, PopulationError> {
        let column = self.column(name)?;
        if column.kind() == ColumnKind::Text {
            return Err(wrong_kind(name, ColumnKind::Float, column));
        }
        Ok(column.mean())
    }

    /// Create a table with the same schema and no rows.
    pub fn empty_like(&self) -> Self {
        Self {
            columns: self
                .columns
                .iter()
                .map(|(name, column)| (name.clone(), Column::empty(column.kind())))
                .collect(),
            rows: 0,
        }
    }

    /// Append one row. The row must name every column exactly once with a
    /// value of the column's kind.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::Mismatch`] if the row does not match.
    pub fn push_row(&mut self, row: Row) -> Result<(), PopulationError> {
        let row_schema = Schema(
            row.iter()
                .map(|(name, value)| (name.clone(), value.kind()))
                .collect(),
        );
        let schema = self.schema();
        if row_schema != schema {
            return Err(SchemaError::Mismatch {
                expected: schema,
                found: row_schema,
            }
            .into());
        }
        for (name, value) in row {
            if let Some(column) = self.columns.get_mut(&name) {
                column.push(value);
            }
        }
        self.rows = self.rows.saturating_add(1);
        Ok(())
    }

    /// Copy a contiguous row range into a new table.
    pub fn slice(&self, range: Range<usize>) -> Result<Self, PopulationError> {
        let out_of_range = || PopulationError::RowOutOfRange {
            start: range.start,
            end: range.end,
            len: self.rows,
        };
        if range.start > range.end || range.end > self.rows {
            return Err(out_of_range());
        }
        let mut columns = BTreeMap::new();
        for (name, column) in &self.columns {
            let part = column.slice(range.clone()).ok_or_else(out_of_range)?;
            columns.insert(name.clone(), part);
        }
        Ok(Self {
            columns,
            rows: range.end.saturating_sub(range.start),
        })
    }

    /// Append all rows of `other`.
    ///
    /// A table with no columns adopts `other` wholesale, which lets an
    /// empty accumulator start from [`Population::new`].
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::Mismatch`] if the schemas differ.
    pub fn append(&mut self, other: Self) -> Result<(), SchemaError> {
        if self.columns.is_empty() {
            *self = other;
            return Ok(());
        }
        if other.columns.is_empty() && other.rows == 0 {
            return Ok(());
        }
        let expected = self.schema();
        let found = other.schema();
        if expected != found {
            return Err(SchemaError::Mismatch { expected, found });
        }
        for (name, column) in &mut self.columns {
            if let Some(extra) = other.columns.get(name) {
                column.extend_from(extra);
            }
        }
        self.rows = self.rows.saturating_add(other.rows);
        Ok(())
    }

    /// Concatenate tables in order.
    pub fn concat(parts: impl IntoIterator<Item = Self>) -> Result<Self, SchemaError> {
        let mut merged = Self::new();
        for part in parts {
            merged.append(part)?;
        }
        Ok(merged)
    }

    /// Serialize the table as a JSON object of columns.
    pub fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }
}

fn wrong_kind(name: &str, expected: ColumnKind, found: &Column) -> PopulationError {
    PopulationError::WrongKind {
        column: name.to_owned(),
        expected,
        found: found.kind(),
    }
}
