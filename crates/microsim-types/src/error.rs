//! Error types for the `microsim-types` crate.

use crate::column::ColumnKind;
use crate::population::Schema;

/// Errors raised when a table's column set or row count is not what an
/// operation requires.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    /// The column set (names or kinds) differs from the expected schema.
    #[error("schema mismatch: expected [{expected}], found [{found}]")]
    Mismatch {
        /// The schema the operation required.
        expected: Schema,
        /// The schema that was actually supplied.
        found: Schema,
    },

    /// A table that must preserve its row count did not.
    #[error("row count changed: expected {expected}, found {found}")]
    RowCount {
        /// Row count before the operation.
        expected: usize,
        /// Row count after the operation.
        found: usize,
    },
}

/// Errors that can occur when building or reading a [`Population`].
///
/// [`Population`]: crate::Population
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PopulationError {
    /// A column required by the caller does not exist.
    #[error("missing column `{column}`")]
    MissingColumn {
        /// Name of the missing column.
        column: String,
    },

    /// A column exists but has a different storage kind.
    #[error("column `{column}` has kind {found}, expected {expected}")]
    WrongKind {
        /// Name of the column.
        column: String,
        /// Kind the caller asked for.
        expected: ColumnKind,
        /// Kind actually stored.
        found: ColumnKind,
    },

    /// A column's length disagrees with the table's row count.
    #[error("column `{column}` has {found} rows, table has {expected}")]
    LengthMismatch {
        /// Name of the offending column.
        column: String,
        /// The table's row count.
        expected: usize,
        /// The column's row count.
        found: usize,
    },

    /// The same column name was supplied twice.
    #[error("duplicate column `{column}`")]
    DuplicateColumn {
        /// The repeated name.
        column: String,
    },

    /// A row range does not fit inside the table.
    #[error("row range {start}..{end} out of bounds for {len} rows")]
    RowOutOfRange {
        /// First row of the requested range.
        start: usize,
        /// One past the last row of the requested range.
        end: usize,
        /// The table's row count.
        len: usize,
    },

    /// The operation requires matching schemas.
    #[error(transparent)]
    Schema(#[from] SchemaError),
}
