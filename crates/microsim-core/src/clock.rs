//! Simulation clock.
//!
//! The clock counts whole ticks of its native [`TimeUnit`] since a
//! calendar origin. Advances may be expressed in any unit; they are
//! converted through fixed day equivalents (hour = 1/24, day = 1,
//! week = 7, month = 30, year = 365) and accumulated, and the tick
//! counter is the accumulated amount rounded down to the native unit.
//!
//! The tick counter only moves forward, and only through
//! [`Clock::advance`] (or its typed sibling [`Clock::advance_by`]).

use std::fmt;
use std::str::FromStr;

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// Absorbs floating point drift when rounding the accumulator down.
const ROUNDING_SLACK: f64 = 1e-9;

/// Units of simulated time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    /// One twenty-fourth of a day.
    Hour,
    /// One day.
    Day,
    /// Seven days.
    Week,
    /// Thirty days.
    Month,
    /// Three hundred sixty-five days.
    Year,
}

impl TimeUnit {
    /// Day-equivalent of one unit.
    pub const fn days(self) -> f64 {
        match self {
            Self::Hour => 1.0 / 24.0,
            Self::Day => 1.0,
            Self::Week => 7.0,
            Self::Month => 30.0,
            Self::Year => 365.0,
        }
    }
}

impl FromStr for TimeUnit {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "hour" | "hours" => Ok(Self::Hour),
            "day" | "days" => Ok(Self::Day),
            "week" | "weeks" => Ok(Self::Week),
            "month" | "months" => Ok(Self::Month),
            "year" | "years" => Ok(Self::Year),
            _ => Err(ConfigError::UnknownTimeUnit { unit: s.to_owned() }),
        }
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::Year => "year",
        };
        f.write_str(label)
    }
}

/// Simulation clock with a native unit and a calendar origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clock {
    /// Native tick unit.
    unit: TimeUnit,
    /// Calendar date of tick 0.
    origin: NaiveDate,
    /// Whole native ticks since the origin.
    elapsed: u64,
    /// Accumulated time in native units, including any fraction.
    accumulated: f64,
}

impl Clock {
    /// Create a clock from a unit name and an origin date.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownTimeUnit`] if `unit` is not one of
    /// hour, day, week, month or year.
    pub fn new(unit: &str, origin: NaiveDate) -> Result<Self, ConfigError> {
        Ok(Self::with_unit(unit.parse()?, origin))
    }

    /// Create a clock from a typed unit.
    pub const fn with_unit(unit: TimeUnit, origin: NaiveDate) -> Self {
        Self {
            unit,
            origin,
            elapsed: 0,
            accumulated: 0.0,
        }
    }

    /// Day-equivalent factor of one `unit`.
    pub const fn to_days(unit: TimeUnit) -> f64 {
        unit.days()
    }

    /// Advance by `amount` of the named unit.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownTimeUnit`] for an unrecognized unit and
    /// [`ConfigError::InvalidAdvance`] for a negative or non-finite amount.
    pub fn advance(&mut self, amount: f64, unit: &str) -> Result<(), ConfigError> {
        self.advance_by(amount, unit.parse()?)
    }

    /// Advance by `amount` of a typed unit.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidAdvance`] for a negative or non-finite
    /// amount.
    pub fn advance_by(&mut self, amount: f64, unit: TimeUnit) -> Result<(), ConfigError> {
        if !amount.is_finite() || amount < 0.0 {
            return Err(ConfigError::InvalidAdvance { amount });
        }
        self.accumulated += amount * unit.days() / self.unit.days();
        self.elapsed = self.elapsed.max(whole_ticks(self.accumulated));
        Ok(())
    }

    /// Advance by exactly one native tick.
    pub fn step(&mut self) {
        self.accumulated += 1.0;
        self.elapsed = self.elapsed.saturating_add(1);
    }

    /// Whole native ticks since the origin.
    pub const fn elapsed(&self) -> u64 {
        self.elapsed
    }

    /// Accumulated time expressed in days.
    pub fn elapsed_days(&self) -> f64 {
        self.accumulated * self.unit.days()
    }

    /// Native tick unit.
    pub const fn unit(&self) -> TimeUnit {
        self.unit
    }

    /// Calendar date of tick 0.
    pub const fn origin(&self) -> NaiveDate {
        self.origin
    }

    /// Calendar date reached so far (whole days past the origin), or
    /// `None` if it falls outside the representable range.
    pub fn current_date(&self) -> Option<NaiveDate> {
        self.origin
            .checked_add_days(Days::new(whole_ticks(self.elapsed_days())))
    }
}

/// Round a non-negative accumulator down to whole units.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn whole_ticks(value: f64) -> u64 {
    // Non-negative by construction; `as` saturates at u64::MAX.
    (value + ROUNDING_SLACK).floor().max(0.0) as u64
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn origin() -> NaiveDate {
        NaiveDate::from_ymd_opt(2020, 1, 1).unwrap()
    }

    #[test]
    fn clock_starts_at_zero() {
        let clock = Clock::new("day", origin()).unwrap();
        assert_eq!(clock.elapsed(), 0);
        assert_eq!(clock.unit(), TimeUnit::Day);
        assert_eq!(clock.current_date(), Some(origin()));
    }

    #[test]
    fn unknown_unit_is_config_error() {
        let result = Clock::new("fortnight", origin());
        assert!(matches!(result, Err(ConfigError::UnknownTimeUnit { .. })));

        let mut clock = Clock::new("day", origin()).unwrap();
        assert!(clock.advance(1.0, "decade").is_err());
        assert_eq!(clock.elapsed(), 0);
    }

    #[test]
    fn to_days_uses_fixed_table() {
        assert!((Clock::to_days(TimeUnit::Hour) - 1.0 / 24.0).abs() < 1e-12);
        assert!((Clock::to_days(TimeUnit::Day) - 1.0).abs() < 1e-12);
        assert!((Clock::to_days(TimeUnit::Week) - 7.0).abs() < 1e-12);
        assert!((Clock::to_days(TimeUnit::Month) - 30.0).abs() < 1e-12);
        assert!((Clock::to_days(TimeUnit::Year) - 365.0).abs() < 1e-12);
    }

    #[test]
    fn advance_converts_to_native_unit() {
        let mut clock = Clock::new("day", origin()).unwrap();
        clock.advance(2.0, "week").unwrap();
        assert_eq!(clock.elapsed(), 14);
        clock.advance(1.0, "month").unwrap();
        assert_eq!(clock.elapsed(), 44);
    }

    #[test]
    fn fractional_advances_accumulate_and_round_down() {
        let mut clock = Clock::new("day", origin()).unwrap();
        for _ in 0..23 {
            clock.advance(1.0, "hour").unwrap();
        }
        assert_eq!(clock.elapsed(), 0);
        clock.advance(1.0, "hour").unwrap();
        assert_eq!(clock.elapsed(), 1);
    }

    #[test]
    fn coarse_clock_ignores_sub_resolution_advances() {
        let mut clock = Clock::new("year", origin()).unwrap();
        clock.advance(364.0, "day").unwrap();
        assert_eq!(clock.elapsed(), 0);
        clock.advance(1.0, "day").unwrap();
        assert_eq!(clock.elapsed(), 1);
    }

    #[test]
    fn negative_advance_is_rejected() {
        let mut clock = Clock::new("day", origin()).unwrap();
        clock.step();
        assert!(matches!(
            clock.advance(-1.0, "day"),
            Err(ConfigError::InvalidAdvance { .. })
        ));
        assert!(clock.advance(f64::NAN, "day").is_err());
        assert_eq!(clock.elapsed(), 1);
    }

    #[test]
    fn step_moves_one_native_unit_and_date() {
        let mut clock = Clock::new("week", origin()).unwrap();
        clock.step();
        clock.step();
        assert_eq!(clock.elapsed(), 2);
        assert!((clock.elapsed_days() - 14.0).abs() < 1e-9);
        assert_eq!(
            clock.current_date(),
            NaiveDate::from_ymd_opt(2020, 1, 15)
        );
    }
}
