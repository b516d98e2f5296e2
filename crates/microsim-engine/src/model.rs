//! Demonstration cardiovascular cohort model.
//!
//! A synthetic adult cohort with age, sex and a stroke history flag. Per
//! tick the manipulation tree applies, in order:
//!
//! 1. stroke mortality, then stroke onset (an ordered pair, so a stroke
//!    is never fatal in the tick it occurs);
//! 2. background mortality with a Gompertz age gradient;
//! 3. aging of the survivors.
//!
//! The accumulation tree adds newborns at a fixed annual birth rate.
//!
//! Rates in [`ModelConfig`] are annual; mechanisms convert them to
//! per-tick probabilities with the tick length in years.

use microsim_core::{Event, EventGroup, EventNode, EventRng, param};
use microsim_types::{ALIVE_COLUMN, Column, ID_COLUMN, LAST_EVENT_COLUMN, Population, Row, Value};
use rand::{Rng, SeedableRng};
use serde::Deserialize;

/// Age in years.
pub const AGE: &str = "age";
/// Whether the individual is female.
pub const FEMALE: &str = "female";
/// Whether the individual has had a stroke.
pub const STROKE: &str = "stroke";

/// Age around which the age gradients are centred.
const REFERENCE_AGE: f64 = 60.0;

/// Synthetic cohort settings (`population` section).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PopulationConfig {
    /// Number of individuals at tick 0.
    #[serde(default = "default_size")]
    pub size: usize,

    /// Youngest age at tick 0.
    #[serde(default = "default_min_age")]
    pub min_age: f64,

    /// Oldest age at tick 0 (exclusive).
    #[serde(default = "default_max_age")]
    pub max_age: f64,

    /// Share of the cohort with a stroke history at tick 0.
    #[serde(default = "default_stroke_prevalence")]
    pub stroke_prevalence: f64,
}

impl Default for PopulationConfig {
    fn default() -> Self {
        Self {
            size: default_size(),
            min_age: default_min_age(),
            max_age: default_max_age(),
            stroke_prevalence: default_stroke_prevalence(),
        }
    }
}

/// Event parameters (`model` section). All rates are annual.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelConfig {
    /// Stroke incidence at the reference age.
    #[serde(default = "default_stroke_incidence")]
    pub stroke_incidence: f64,

    /// Log-hazard increase of stroke onset per year of age.
    #[serde(default = "default_stroke_age_slope")]
    pub stroke_age_slope: f64,

    /// Annual case fatality among stroke survivors.
    #[serde(default = "default_stroke_fatality")]
    pub stroke_fatality: f64,

    /// Background mortality at the reference age.
    #[serde(default = "default_background_mortality")]
    pub background_mortality: f64,

    /// Gompertz log-hazard increase of background mortality per year.
    #[serde(default = "default_mortality_age_slope")]
    pub mortality_age_slope: f64,

    /// Births per living individual per year.
    #[serde(default = "default_birth_rate")]
    pub birth_rate: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            stroke_incidence: default_stroke_incidence(),
            stroke_age_slope: default_stroke_age_slope(),
            stroke_fatality: default_stroke_fatality(),
            background_mortality: default_background_mortality(),
            mortality_age_slope: default_mortality_age_slope(),
            birth_rate: default_birth_rate(),
        }
    }
}

/// Calibration target (read from the `calibration` section).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CalibrationTarget {
    /// Observed share of the cohort dying per year.
    #[serde(default = "default_target_annual_mortality")]
    pub target_annual_mortality: f64,
}

impl Default for CalibrationTarget {
    fn default() -> Self {
        Self {
            target_annual_mortality: default_target_annual_mortality(),
        }
    }
}

const fn default_size() -> usize {
    10_000
}

const fn default_min_age() -> f64 {
    40.0
}

const fn default_max_age() -> f64 {
    80.0
}

const fn default_stroke_prevalence() -> f64 {
    0.02
}

const fn default_stroke_incidence() -> f64 {
    0.004
}

const fn default_stroke_age_slope() -> f64 {
    0.07
}

const fn default_stroke_fatality() -> f64 {
    0.12
}

const fn default_background_mortality() -> f64 {
    0.008
}

const fn default_mortality_age_slope() -> f64 {
    0.09
}

const fn default_birth_rate() -> f64 {
    0.01
}

const fn default_target_annual_mortality() -> f64 {
    0.015
}

/// Probability of at least one event in `years` under an annual
/// probability `annual`, scaled by `relative_risk`.
pub fn tick_probability(annual: f64, relative_risk: f64, years: f64) -> f64 {
    let annual = annual.clamp(0.0, 1.0);
    if annual >= 1.0 {
        return 1.0;
    }
    let hazard = -(1.0 - annual).ln() * relative_risk.max(0.0);
    (1.0 - (-hazard * years).exp()).clamp(0.0, 1.0)
}

fn age_risk(age: f64, slope: f64) -> f64 {
    (slope * (age - REFERENCE_AGE)).exp()
}

/// Build the synthetic tick-0 cohort.
///
/// # Errors
///
/// Returns an error if the age range is empty or the columns are
/// inconsistent.
pub fn synthetic_population(config: &PopulationConfig, seed: u64) -> anyhow::Result<Population> {
    anyhow::ensure!(
        config.max_age > config.min_age,
        "population.max_age ({}) must exceed population.min_age ({})",
        config.max_age,
        config.min_age
    );
    let mut rng = EventRng::seed_from_u64(seed);
    let prevalence = config.stroke_prevalence.clamp(0.0, 1.0);

    let mut ids = Vec::with_capacity(config.size);
    let mut ages = Vec::with_capacity(config.size);
    let mut female = Vec::with_capacity(config.size);
    let mut stroke = Vec::with_capacity(config.size);
    let mut next_id = 1_i64;
    for _ in 0..config.size {
        ids.push(next_id);
        next_id = next_id.saturating_add(1);
        ages.push(rng.random_range(config.min_age..config.max_age));
        female.push(rng.random_bool(0.5));
        stroke.push(rng.random_bool(prevalence));
    }

    Ok(Population::from_columns([
        (ID_COLUMN, Column::from(ids)),
        (ALIVE_COLUMN, Column::from(vec![true; config.size])),
        (AGE, Column::from(ages)),
        (FEMALE, Column::from(female)),
        (STROKE, Column::from(stroke)),
    ])?)
}

/// Adds one tick to the age of every living individual.
///
/// Parameter: years per tick.
pub fn aging(years_per_tick: f64) -> Event {
    Event::manipulation("aging", vec![years_per_tick], |pop, living, params, _| {
        let step = param(params, 0)?;
        let mut next = pop.clone();
        for (row, age) in next.floats_mut(AGE)?.iter_mut().enumerate() {
            if living.is_alive(row) {
                *age += step;
            }
        }
        Ok(next)
    })
    .with_arity(1)
    .with_description("ages every living individual by one tick")
}

/// Stroke onset among the living without a stroke history.
///
/// Parameter: annual incidence at the reference age.
pub fn get_stroke(incidence: f64, age_slope: f64, years_per_tick: f64) -> Event {
    Event::manipulation(
        "get_stroke",
        vec![incidence],
        move |pop, living, params, rng| {
            let incidence = param(params, 0)?;
            let ages = pop.floats(AGE)?.to_vec();
            let mut next = pop.clone();
            for ((row, stroke), age) in next.bools_mut(STROKE)?.iter_mut().enumerate().zip(ages) {
                if !living.is_alive(row) || *stroke {
                    continue;
                }
                let p = tick_probability(incidence, age_risk(age, age_slope), years_per_tick);
                if rng.random_bool(p) {
                    *stroke = true;
                }
            }
            Ok(next)
        },
    )
    .with_arity(1)
    .with_description("first-ever stroke, age-dependent")
}

/// Death of living individuals with a stroke history.
///
/// Parameter: annual case fatality.
pub fn stroke_mortality(fatality: f64, years_per_tick: f64) -> Event {
    Event::manipulation(
        "stroke_mortality",
        vec![fatality],
        move |pop, living, params, rng| {
            let fatality = param(params, 0)?;
            let p = tick_probability(fatality, 1.0, years_per_tick);
            let strokes = pop.bools(STROKE)?.to_vec();
            let mut next = pop.clone();
            for ((row, alive), stroke) in next
                .bools_mut(ALIVE_COLUMN)?
                .iter_mut()
                .enumerate()
                .zip(strokes)
            {
                if living.is_alive(row) && stroke && rng.random_bool(p) {
                    *alive = false;
                }
            }
            Ok(next)
        },
    )
    .with_arity(1)
    .with_description("death following a stroke")
}

/// Background (non-stroke) mortality with a Gompertz age gradient.
///
/// Parameter: annual mortality at the reference age.
pub fn background_mortality(rate: f64, age_slope: f64, years_per_tick: f64) -> Event {
    Event::manipulation(
        "background_mortality",
        vec![rate],
        move |pop, living, params, rng| {
            let rate = param(params, 0)?;
            let ages = pop.floats(AGE)?.to_vec();
            let mut next = pop.clone();
            for ((row, alive), age) in next
                .bools_mut(ALIVE_COLUMN)?
                .iter_mut()
                .enumerate()
                .zip(ages)
            {
                if !living.is_alive(row) {
                    continue;
                }
                let p = tick_probability(rate, age_risk(age, age_slope), years_per_tick);
                if rng.random_bool(p) {
                    *alive = false;
                }
            }
            Ok(next)
        },
    )
    .with_arity(1)
    .with_description("all-cause mortality other than stroke")
}

/// Newborns in proportion to the living population.
///
/// Parameter: births per living individual per year.
pub fn births(rate: f64, years_per_tick: f64) -> Event {
    Event::accumulation("births", vec![rate], move |pop, params, rng| {
        let rate = param(params, 0)?;
        let p = tick_probability(rate, 1.0, years_per_tick);
        let living = pop.living_mask()?;
        let females = pop.bools(FEMALE)?;
        let mut newborns = pop.empty_like();
        for (row, &female) in females.iter().enumerate() {
            if female && living.is_alive(row) && rng.random_bool(p) {
                newborns.push_row(newborn(rng))?;
            }
        }
        Ok(newborns)
    })
    .with_arity(1)
    .with_description("births to living women")
}

fn newborn(rng: &mut EventRng) -> Row {
    Row::from([
        (ID_COLUMN.to_owned(), Value::Int(0)),
        (ALIVE_COLUMN.to_owned(), Value::Bool(true)),
        (LAST_EVENT_COLUMN.to_owned(), Value::Text(String::new())),
        (AGE.to_owned(), Value::Float(0.0)),
        (FEMALE.to_owned(), Value::Bool(rng.random_bool(0.5))),
        (STROKE.to_owned(), Value::Bool(false)),
    ])
}

/// The manipulation and accumulation trees of the model.
pub fn event_trees(config: &ModelConfig, years_per_tick: f64) -> (EventNode, EventNode) {
    let stroke = EventGroup::ordered([
        stroke_mortality(config.stroke_fatality, years_per_tick),
        get_stroke(
            config.stroke_incidence,
            config.stroke_age_slope,
            years_per_tick,
        ),
    ]);
    let manipulation = EventGroup::ordered([
        EventNode::from(stroke),
        EventNode::from(background_mortality(
            config.background_mortality,
            config.mortality_age_slope,
            years_per_tick,
        )),
        EventNode::from(aging(years_per_tick)),
    ]);

    let accumulation = EventNode::from(births(config.birth_rate, years_per_tick));
    (EventNode::from(manipulation), accumulation)
}

/// Population-level indicators logged after each simulated year.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Summary {
    /// Total rows, living and dead.
    pub rows: usize,
    /// Living individuals.
    pub living: usize,
    /// Mean age of the living.
    pub mean_age: f64,
    /// Share of the living with a stroke history.
    pub stroke_prevalence: f64,
}

impl Summary {
    /// Compute the indicators of `population`.
    ///
    /// # Errors
    ///
    /// Returns an error if a model column is missing.
    pub fn of(population: &Population) -> anyhow::Result<Self> {
        let living = population.living_mask()?;
        let ages = population.floats(AGE)?;
        let strokes = population.bools(STROKE)?;
        let mut age_sum = 0.0;
        let mut stroke_count = 0_usize;
        for row in living.living_rows() {
            age_sum += ages.get(row).copied().unwrap_or_default();
            if strokes.get(row).copied().unwrap_or_default() {
                stroke_count = stroke_count.saturating_add(1);
            }
        }
        let count = living.count();
        let denominator = count.max(1) as f64;
        Ok(Self {
            rows: population.len(),
            living: count,
            mean_age: age_sum / denominator,
            stroke_prevalence: stroke_count as f64 / denominator,
        })
    }
}

/// Share of the tick-0 cohort (ids up to `last_cohort_id`) that has died.
///
/// # Errors
///
/// Returns an error if the bookkeeping columns are missing.
pub fn cohort_death_fraction(population: &Population, last_cohort_id: i64) -> anyhow::Result<f64> {
    let ids = population.ints(ID_COLUMN)?;
    let alive = population.bools(ALIVE_COLUMN)?;
    let mut members = 0_usize;
    let mut deaths = 0_usize;
    for (&id, &is_alive) in ids.iter().zip(alive) {
        if id <= last_cohort_id {
            members = members.saturating_add(1);
            if !is_alive {
                deaths = deaths.saturating_add(1);
            }
        }
    }
    anyhow::ensure!(members > 0, "the tick-0 cohort is empty");
    Ok(deaths as f64 / members as f64)
}

/// Convert a death fraction observed over `years` into an annual one.
pub fn annualize(fraction: f64, years: f64) -> f64 {
    if years <= 0.0 {
        return fraction;
    }
    1.0 - (1.0 - fraction.clamp(0.0, 1.0)).powf(years.recip())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use chrono::NaiveDate;
    use microsim_core::{Clock, Seeds, Simulator};

    use super::*;

    fn small_config() -> PopulationConfig {
        PopulationConfig {
            size: 500,
            ..PopulationConfig::default()
        }
    }

    #[test]
    fn synthetic_population_respects_age_range() {
        let pop = synthetic_population(&small_config(), 1).unwrap();
        assert_eq!(pop.len(), 500);
        assert!(pop.floats(AGE).unwrap().iter().all(|&a| (40.0..80.0).contains(&a)));
        assert_eq!(pop.alive_count().unwrap(), 500);
    }

    #[test]
    fn synthetic_population_rejects_empty_age_range() {
        let config = PopulationConfig {
            min_age: 60.0,
            max_age: 60.0,
            ..PopulationConfig::default()
        };
        assert!(synthetic_population(&config, 1).is_err());
    }

    #[test]
    fn tick_probability_scales_with_tick_length() {
        assert!((tick_probability(0.1, 1.0, 1.0) - 0.1).abs() < 1e-12);
        let daily = tick_probability(0.1, 1.0, 1.0 / 365.0);
        assert!((1.0 - (1.0 - daily).powi(365) - 0.1).abs() < 1e-9);
        assert_eq!(tick_probability(1.0, 1.0, 0.001), 1.0);
        assert_eq!(tick_probability(0.0, 5.0, 1.0), 0.0);
    }

    #[test]
    fn annualize_inverts_compounding() {
        let two_years = 1.0 - 0.9_f64.powi(2);
        assert!((annualize(two_years, 2.0) - 0.1).abs() < 1e-12);
    }

    #[test]
    fn model_runs_and_appends_newborns() {
        let (manipulation, accumulation) = event_trees(&ModelConfig::default(), 1.0);
        let clock = Clock::new("year", NaiveDate::from_ymd_opt(2000, 1, 1).unwrap()).unwrap();
        let mut sim = Simulator::new(
            || synthetic_population(&small_config(), 3),
            manipulation,
            accumulation,
            clock,
            Seeds::Single(3),
        )
        .unwrap();
        sim.run(5).unwrap();
        let pop = sim.get_population();
        assert!(pop.len() > 500);
        let summary = Summary::of(pop).unwrap();
        assert!(summary.living < summary.rows);
        assert!(summary.mean_age > 0.0);
        let deaths = cohort_death_fraction(pop, 500).unwrap();
        assert!(deaths > 0.0 && deaths < 1.0);
    }

    #[test]
    fn birth_rate_override_is_applied() {
        let config = ModelConfig {
            birth_rate: 0.5,
            ..ModelConfig::default()
        };
        let (_, accumulation) = event_trees(&config, 1.0);
        assert_eq!(accumulation.find("births").unwrap().parameters(), &[0.5]);
    }
}
