//! Typed column storage for the population table.
//!
//! A [`Column`] holds every individual's value for one status variable.
//! Columns are homogeneous: a column's [`ColumnKind`] never changes once
//! the column exists, and the engine treats a change of kind as a schema
//! violation.

use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};

/// The storage type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    /// 64-bit floating point values (ages, biomarkers, risk scores).
    Float,
    /// 64-bit signed integers (identifiers, counters, coded categories).
    Int,
    /// Flags (`alive`, disease indicators).
    Bool,
    /// Free text or categorical labels.
    Text,
}

impl fmt::Display for ColumnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Float => "float",
            Self::Int => "int",
            Self::Bool => "bool",
            Self::Text => "text",
        };
        f.write_str(label)
    }
}

/// A single cell value, used for row views and row construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// A floating point cell.
    Float(f64),
    /// An integer cell.
    Int(i64),
    /// A flag cell.
    Bool(bool),
    /// A text cell.
    Text(String),
}

impl Value {
    /// Return the kind of column this value belongs in.
    pub const fn kind(&self) -> ColumnKind {
        match self {
            Self::Float(_) => ColumnKind::Float,
            Self::Int(_) => ColumnKind::Int,
            Self::Bool(_) => ColumnKind::Bool,
            Self::Text(_) => ColumnKind::Text,
        }
    }
}

/// One column of the population table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "values", rename_all = "snake_case")]
pub enum Column {
    /// Floating point values.
    Float(Vec<f64>),
    /// Integer values.
    Int(Vec<i64>),
    /// Flag values.
    Bool(Vec<bool>),
    /// Text values.
    Text(Vec<String>),
}

impl Column {
    /// Create an empty column of the given kind.
    pub const fn empty(kind: ColumnKind) -> Self {
        match kind {
            ColumnKind::Float => Self::Float(Vec::new()),
            ColumnKind::Int => Self::Int(Vec::new()),
            ColumnKind::Bool => Self::Bool(Vec::new()),
            ColumnKind::Text => Self::Text(Vec::new()),
        }
    }

    /// Return the storage kind of this column.
    pub const fn kind(&self) -> ColumnKind {
        match self {
            Self::Float(_) => ColumnKind::Float,
            Self::Int(_) => ColumnKind::Int,
            Self::Bool(_) => ColumnKind::Bool,
            Self::Text(_) => ColumnKind::Text,
        }
    }

    /// Number of rows stored in this column.
    pub fn len(&self) -> usize {
        match self {
            Self::Float(v) => v.len(),
            Self::Int(v) => v.len(),
            Self::Bool(v) => v.len(),
            Self::Text(v) => v.len(),
        }
    }

    /// Whether the column holds no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy a contiguous row range into a new column.
    ///
    /// Returns `None` if the range is out of bounds.
    pub fn slice(&self, range: Range<usize>) -> Option<Self> {
        Some(match self {
            Self::Float(v) => Self::Float(v.get(range)?.to_vec()),
            Self::Int(v) => Self::Int(v.get(range)?.to_vec()),
            Self::Bool(v) => Self::Bool(v.get(range)?.to_vec()),
            Self::Text(v) => Self::Text(v.get(range)?.to_vec()),
        })
    }

    /// Append all rows of `other`. Returns `false` (and appends nothing)
    /// if the kinds differ.
    pub fn extend_from(&mut self, other: &Self) -> bool {
        match (self, other) {
            (Self::Float(a), Self::Float(b)) => a.extend_from_slice(b),
            (Self::Int(a), Self::Int(b)) => a.extend_from_slice(b),
            (Self::Bool(a), Self::Bool(b)) => a.extend_from_slice(b),
            (Self::Text(a), Self::Text(b)) => a.extend_from_slice(b),
            _ => return false,
        }
        true
    }

    /// Append one value. Returns `false` (and appends nothing) if the
    /// value's kind does not match the column.
    pub fn push(&mut self, value: Value) -> bool {
        match (self, value) {
            (Self::Float(a), Value::Float(b)) => a.push(b),
            (Self::Int(a), Value::Int(b)) => a.push(b),
            (Self::Bool(a), Value::Bool(b)) => a.push(b),
            (Self::Text(a), Value::Text(b)) => a.push(b),
            _ => return false,
        }
        true
    }

    /// Whether row `row` holds a different value in `self` than in `other`.
    ///
    /// Floats are compared bitwise so that NaN is equal to itself and the
    /// comparison is exact. Rows missing from either column count as
    /// different, as do columns of different kinds.
    pub fn differs_at(&self, other: &Self, row: usize) -> bool {
        match (self, other) {
            (Self::Float(a), Self::Float(b)) => {
                a.get(row).map(|x| x.to_bits()) != b.get(row).map(|x| x.to_bits())
            }
            (Self::Int(a), Self::Int(b)) => a.get(row) != b.get(row),
            (Self::Bool(a), Self::Bool(b)) => a.get(row) != b.get(row),
            (Self::Text(a), Self::Text(b)) => a.get(row) != b.get(row),
            _ => true,
        }
    }

    /// Arithmetic mean of a numeric or flag column (flags count as 0/1).
    ///
    /// Returns `None` for text columns and for empty columns.
    pub fn mean(&self) -> Option<f64> {
        let n = self.len();
        if n == 0 {
            return None;
        }
        let sum: f64 = match self {
            Self::Float(v) => v.iter().sum(),
            Self::Int(v) => v.iter().map(|x| *x as f64).sum(),
            Self::Bool(v) => v.iter().filter(|x| **x).count() as f64,
            Self::Text(_) => return None,
        };
        Some(sum / n as f64)
    }
}

impl From<Vec<f64>> for Column {
    fn from(values: Vec<f64>) -> Self {
        Self::Float(values)
    }
}

impl From<Vec<i64>> for Column {
    fn from(values: Vec<i64>) -> Self {
        Self::Int(values)
    }
}

impl From<Vec<bool>> for Column {
    fn from(values: Vec<bool>) -> Self {
        Self::Bool(values)
    }
}

impl From<Vec<String>> for Column {
    fn from(values: Vec<String>) -> Self {
        Self::Text(values)
    }
}
