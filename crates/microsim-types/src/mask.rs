//! The living mask.

use serde::{Deserialize, Serialize};

/// Boolean vector marking rows whose `alive` flag is set.
///
/// The engine recomputes the mask from the population after every
/// manipulation event, so a death produced by one event is visible to
/// every event that runs after it in the same tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivingMask(Vec<bool>);

impl LivingMask {
    /// Wrap a per-row flag vector.
    pub const fn new(flags: Vec<bool>) -> Self {
        Self(flags)
    }

    /// Whether row `row` is alive. Rows past the end are not.
    pub fn is_alive(&self, row: usize) -> bool {
        self.0.get(row).copied().unwrap_or(false)
    }

    /// Number of rows covered by the mask.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the mask covers no rows.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of living rows.
    pub fn count(&self) -> usize {
        self.0.iter().filter(|alive| **alive).count()
    }

    /// Indices of living rows, ascending.
    pub fn living_rows(&self) -> impl Iterator<Item = usize> + '_ {
        self.0
            .iter()
            .enumerate()
            .filter_map(|(row, alive)| alive.then_some(row))
    }
}

impl From<&[bool]> for LivingMask {
    fn from(flags: &[bool]) -> Self {
        Self(flags.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_and_iterates_living_rows() {
        let mask = LivingMask::new(vec![true, false, true, false]);
        assert_eq!(mask.len(), 4);
        assert_eq!(mask.count(), 2);
        assert_eq!(mask.living_rows().collect::<Vec<_>>(), vec![0, 2]);
        assert!(mask.is_alive(2));
        assert!(!mask.is_alive(3));
        assert!(!mask.is_alive(40));
    }
}
