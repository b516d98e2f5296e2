//! Population bookkeeping the engine owns.
//!
//! The initializer supplies status columns; this module enforces the
//! engine's invariants on top of them: a unique integer `id`, a flag
//! `alive`, and a `last_event` column the engine keeps current. It also
//! performs the schema checks run after every event and the identity
//! assignment for newly accumulated rows.

use std::collections::BTreeSet;

use microsim_types::{
    ALIVE_COLUMN, Column, ColumnKind, ID_COLUMN, LAST_EVENT_COLUMN, Population, PopulationError,
    SchemaError,
};

use crate::config::ConfigError;

/// Validate an initial population and attach engine bookkeeping.
///
/// - `id` must exist, be an integer column and be unique.
/// - `alive` must exist as flags, or as integers holding only 0 and 1
///   (normalized to flags).
/// - `last_event` is added (all empty) when absent and must be text
///   when present.
///
/// # Errors
///
/// Returns [`ConfigError`] describing the first violated requirement.
pub fn prepare(mut population: Population) -> Result<Population, ConfigError> {
    let ids = population.ints(ID_COLUMN).map_err(|e| column_error(ID_COLUMN, &e))?;
    let mut seen = BTreeSet::new();
    for &id in ids {
        if !seen.insert(id) {
            return Err(ConfigError::DuplicateId { id });
        }
    }

    let alive = match population.column(ALIVE_COLUMN) {
        Ok(Column::Bool(_)) => None,
        Ok(Column::Int(values)) => Some(normalize_alive(values)?),
        Ok(other) => {
            return Err(ConfigError::InvalidColumn {
                column: ALIVE_COLUMN.to_owned(),
                reason: format!("expected bool or 0/1 int, found {}", other.kind()),
            });
        }
        Err(e) => return Err(column_error(ALIVE_COLUMN, &e)),
    };
    if let Some(flags) = alive {
        population
            .insert_column(ALIVE_COLUMN, Column::Bool(flags))
            .map_err(|e| column_error(ALIVE_COLUMN, &e))?;
    }

    match population.column(LAST_EVENT_COLUMN) {
        Ok(column) if column.kind() == ColumnKind::Text => {}
        Ok(other) => {
            return Err(ConfigError::InvalidColumn {
                column: LAST_EVENT_COLUMN.to_owned(),
                reason: format!("expected text, found {}", other.kind()),
            });
        }
        Err(_) => {
            let blank = vec![String::new(); population.len()];
            population
                .insert_column(LAST_EVENT_COLUMN, Column::Text(blank))
                .map_err(|e| column_error(LAST_EVENT_COLUMN, &e))?;
        }
    }

    Ok(population)
}

fn normalize_alive(values: &[i64]) -> Result<Vec<bool>, ConfigError> {
    values
        .iter()
        .map(|value| match value {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ConfigError::InvalidColumn {
                column: ALIVE_COLUMN.to_owned(),
                reason: format!("value {other} is not 0 or 1"),
            }),
        })
        .collect()
}

fn column_error(column: &str, error: &PopulationError) -> ConfigError {
    match error {
        PopulationError::MissingColumn { .. } => ConfigError::MissingColumn {
            column: column.to_owned(),
        },
        other => ConfigError::InvalidColumn {
            column: column.to_owned(),
            reason: other.to_string(),
        },
    }
}

/// Check that a manipulation kept the row count and the schema.
pub fn check_manipulation(before: &Population, after: &Population) -> Result<(), SchemaError> {
    let expected = before.schema();
    let found = after.schema();
    if expected != found {
        return Err(SchemaError::Mismatch { expected, found });
    }
    if before.len() != after.len() {
        return Err(SchemaError::RowCount {
            expected: before.len(),
            found: after.len(),
        });
    }
    Ok(())
}

/// Check that accumulated rows share the population's schema.
pub fn check_accumulation(population: &Population, rows: &Population) -> Result<(), SchemaError> {
    let expected = population.schema();
    let found = rows.schema();
    if expected == found {
        Ok(())
    } else {
        Err(SchemaError::Mismatch { expected, found })
    }
}

/// Stamp `event` into `last_event` for every row whose status values
/// differ between `before` and `after`.
///
/// Both tables must already share a schema and row count.
pub fn mark_changed(
    before: &Population,
    after: &mut Population,
    event: &str,
) -> Result<usize, PopulationError> {
    let mut changed = vec![false; after.len()];
    for (name, column) in after.columns() {
        if name == LAST_EVENT_COLUMN {
            continue;
        }
        let previous = before.column(name)?;
        for (row, flag) in changed.iter_mut().enumerate() {
            if !*flag && column.differs_at(previous, row) {
                *flag = true;
            }
        }
    }
    let labels = after.texts_mut(LAST_EVENT_COLUMN)?;
    let mut count = 0_usize;
    for (label, flag) in labels.iter_mut().zip(&changed) {
        if *flag {
            event.clone_into(label);
            count = count.saturating_add(1);
        }
    }
    Ok(count)
}

/// Stamp `event` into `last_event` for every row of freshly accumulated
/// rows.
pub fn mark_all(rows: &mut Population, event: &str) -> Result<(), PopulationError> {
    for label in rows.texts_mut(LAST_EVENT_COLUMN)? {
        event.clone_into(label);
    }
    Ok(())
}

/// The smallest id greater than every id in the population (1 when empty).
pub fn next_id(population: &Population) -> Result<i64, PopulationError> {
    Ok(population
        .ints(ID_COLUMN)?
        .iter()
        .copied()
        .max()
        .map_or(1, |max| max.saturating_add(1)))
}

/// Overwrite the ids of accumulated rows with consecutive fresh ids.
pub fn assign_ids(rows: &mut Population, first: i64) -> Result<(), PopulationError> {
    let mut next = first;
    for id in rows.ints_mut(ID_COLUMN)? {
        *id = next;
        next = next.saturating_add(1);
    }
    Ok(())
}
