//! Parameter calibration.
//!
//! [`Simulator::calibrate`] drives a black-box [`Minimizer`] over a flat
//! trial vector. Each trial is split into per-event overrides by the
//! caller-declared index lists, evaluated through
//! [`Simulator::configure`], reduced by an output function and scored by
//! an objective. Trials never touch the engine; only the winning vector
//! is written back, and only when `auto_commit` is set and the minimizer
//! converged.
//!
//! [`NelderMead`] is the bundled derivative-free minimizer.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use microsim_types::Population;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ConfigError;
use crate::engine::{ParameterOverrides, Simulator};
use crate::error::SimError;
use crate::seeds::Seeds;

/// Objective handed to a [`Minimizer`].
pub type Objective<'a> = dyn FnMut(&[f64]) -> Result<f64, SimError> + 'a;

/// Best point found by a [`Minimizer`].
#[derive(Debug, Clone, PartialEq)]
pub struct Minimum {
    /// Location of the minimum.
    pub point: Vec<f64>,
    /// Objective value at `point`.
    pub value: f64,
    /// Whether the stopping tolerance was reached.
    pub converged: bool,
    /// Number of objective evaluations.
    pub evaluations: usize,
}

/// A black-box minimizer.
pub trait Minimizer {
    /// Minimize `objective` starting from `initial`.
    ///
    /// # Errors
    ///
    /// Must stop at and return the first error raised by `objective`.
    fn minimize(&mut self, initial: &[f64], objective: &mut Objective<'_>)
    -> Result<Minimum, SimError>;
}

/// Options for [`NelderMead`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NelderMeadOptions {
    /// Maximum number of simplex iterations.
    pub max_iterations: usize,
    /// Converged once the simplex's objective values span at most this.
    pub tolerance: f64,
    /// Relative size of the initial simplex along each axis.
    pub initial_step: f64,
}

impl Default for NelderMeadOptions {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            tolerance: 1e-8,
            initial_step: 0.05,
        }
    }
}

const REFLECT: f64 = 1.0;
const EXPAND: f64 = 2.0;
const CONTRACT: f64 = 0.5;
const SHRINK: f64 = 0.5;
/// Absolute step used for coordinates that start at zero.
const ZERO_STEP: f64 = 0.000_25;

/// Nelder-Mead downhill simplex.
#[derive(Debug, Clone, Copy, Default)]
pub struct NelderMead {
    options: NelderMeadOptions,
}

#[derive(Debug, Clone)]
struct Vertex {
    point: Vec<f64>,
    value: f64,
}

impl NelderMead {
    /// A minimizer with the given options.
    pub const fn new(options: NelderMeadOptions) -> Self {
        Self { options }
    }

    /// The minimizer's options.
    pub const fn options(&self) -> NelderMeadOptions {
        self.options
    }

    /// Vertices of the starting simplex other than `initial` itself.
    fn offsets(&self, initial: &[f64]) -> Vec<Vec<f64>> {
        let mut points = Vec::with_capacity(initial.len());
        for axis in 0..initial.len() {
            let mut point = initial.to_vec();
            if let Some(x) = point.get_mut(axis) {
                let delta = if x.abs() > f64::EPSILON {
                    *x * self.options.initial_step
                } else {
                    ZERO_STEP
                };
                *x += delta;
            }
            points.push(point);
        }
        points
    }
}

impl Minimizer for NelderMead {
    fn minimize(
        &mut self,
        initial: &[f64],
        objective: &mut Objective<'_>,
    ) -> Result<Minimum, SimError> {
        let mut evaluations = 0_usize;
        let mut evaluate = |point: Vec<f64>| -> Result<Vertex, SimError> {
            evaluations = evaluations.saturating_add(1);
            let value = objective(&point)?;
            Ok(Vertex { point, value })
        };

        let origin = evaluate(initial.to_vec())?;
        let mut simplex = vec![origin.clone()];
        for point in self.offsets(initial) {
            simplex.push(evaluate(point)?);
        }

        let mut converged = false;
        for _ in 0..self.options.max_iterations {
            simplex.sort_by(|a, b| compare_scores(a.value, b.value));
            if spread(&simplex) <= self.options.tolerance {
                converged = true;
                break;
            }

            let (Some(best), Some(worst)) = (simplex.first().cloned(), simplex.last().cloned())
            else {
                break;
            };
            let second_worst = simplex
                .iter()
                .rev()
                .nth(1)
                .map_or(worst.value, |v| v.value);
            let centroid = centroid(simplex.iter().take(initial.len()), initial.len());

            let reflected = evaluate(along(&centroid, &worst.point, -REFLECT))?;
            let replacement = if reflected.value < best.value {
                let expanded = evaluate(along(&centroid, &reflected.point, EXPAND))?;
                Some(if expanded.value < reflected.value {
                    expanded
                } else {
                    reflected
                })
            } else if reflected.value < second_worst {
                Some(reflected)
            } else {
                let outside = reflected.value < worst.value;
                let target = if outside {
                    &reflected.point
                } else {
                    &worst.point
                };
                let contracted = evaluate(along(&centroid, target, CONTRACT))?;
                (contracted.value < reflected.value.min(worst.value)).then_some(contracted)
            };

            match replacement {
                Some(vertex) => {
                    if let Some(last) = simplex.last_mut() {
                        *last = vertex;
                    }
                }
                None => {
                    let mut shrunk = Vec::with_capacity(simplex.len());
                    shrunk.push(best.clone());
                    for vertex in simplex.iter().skip(1) {
                        shrunk.push(evaluate(along(&best.point, &vertex.point, SHRINK))?);
                    }
                    simplex = shrunk;
                }
            }
        }

        simplex.sort_by(|a, b| compare_scores(a.value, b.value));
        converged = converged || spread(&simplex) <= self.options.tolerance;
        let best = simplex.into_iter().next().unwrap_or(origin);
        Ok(Minimum {
            point: best.point,
            value: best.value,
            converged,
            evaluations,
        })
    }
}

fn spread(simplex: &[Vertex]) -> f64 {
    match (simplex.first(), simplex.last()) {
        (Some(best), Some(worst)) => (worst.value - best.value).abs(),
        _ => 0.0,
    }
}

fn centroid<'a>(vertices: impl Iterator<Item = &'a Vertex>, dims: usize) -> Vec<f64> {
    let mut sum = vec![0.0; dims];
    let mut count = 0_usize;
    for vertex in vertices {
        for (acc, x) in sum.iter_mut().zip(&vertex.point) {
            *acc += x;
        }
        count = count.saturating_add(1);
    }
    let count = count.max(1) as f64;
    sum.iter_mut().for_each(|acc| *acc /= count);
    sum
}

/// `from + t * (to - from)`.
fn along(from: &[f64], to: &[f64], t: f64) -> Vec<f64> {
    from.iter()
        .zip(to)
        .map(|(a, b)| t.mul_add(b - a, *a))
        .collect()
}

/// What to calibrate and how.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSpec {
    /// Ticks simulated by each trial.
    pub t_sim: u64,
    /// For each calibrated event, the positions of its parameters in the
    /// trial vector.
    pub events: BTreeMap<String, Vec<usize>>,
    /// Starting trial vector.
    pub initial_parameters: Vec<f64>,
    /// Write the winning parameters back via `reconfigure`. Ignored when
    /// the minimizer stops without converging.
    pub auto_commit: bool,
    /// Seeds for every trial; the engine's own seeds when absent.
    #[serde(default)]
    pub seeds: Option<Seeds>,
}

impl CalibrationSpec {
    /// Split a trial vector into per-event overrides.
    pub fn split(&self, vector: &[f64]) -> ParameterOverrides {
        self.events
            .iter()
            .map(|(name, indices)| {
                let values = indices
                    .iter()
                    .filter_map(|&index| vector.get(index).copied())
                    .collect();
                (name.clone(), values)
            })
            .collect()
    }

    fn validate(&self, simulator: &Simulator) -> Result<(), ConfigError> {
        let len = self.initial_parameters.len();
        for (name, indices) in &self.events {
            if simulator.trees().find(name).is_none() {
                return Err(ConfigError::UnknownEvent {
                    event: name.clone(),
                });
            }
            if let Some(&index) = indices.iter().find(|&&index| index >= len) {
                return Err(ConfigError::ParameterIndex {
                    event: name.clone(),
                    index,
                    len,
                });
            }
        }
        simulator
            .trees()
            .check_overrides(&self.split(&self.initial_parameters))
    }
}

/// Result of [`Simulator::calibrate`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalibrationOutcome {
    /// Winning parameters per calibrated event.
    pub parameters: ParameterOverrides,
    /// Winning trial vector.
    pub vector: Vec<f64>,
    /// Objective value of the winning vector.
    pub score: f64,
    /// Whether the minimizer reported convergence.
    pub converged: bool,
    /// Number of trials evaluated.
    pub evaluations: usize,
    /// Whether the winning parameters were written back.
    pub committed: bool,
}

impl Simulator {
    /// Search for event parameters that minimize `objective(output(pop))`
    /// after `spec.t_sim` ticks.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::Config`] for unknown events or out-of-range
    /// indices before any trial runs, [`SimError::Calibration`] as soon as
    /// `output` or `objective` fails, and any tick failure of a trial.
    pub fn calibrate<O, F, G>(
        &mut self,
        spec: &CalibrationSpec,
        minimizer: &mut dyn Minimizer,
        mut output: F,
        mut objective: G,
    ) -> Result<CalibrationOutcome, SimError>
    where
        F: FnMut(&Population) -> anyhow::Result<O>,
        G: FnMut(&O) -> anyhow::Result<f64>,
    {
        spec.validate(self)?;
        info!(
            events = spec.events.len(),
            dimensions = spec.initial_parameters.len(),
            ticks = spec.t_sim,
            "calibration started"
        );

        let engine = &*self;
        let mut trial = 0_usize;
        let mut score = |vector: &[f64]| -> Result<f64, SimError> {
            trial = trial.saturating_add(1);
            let overrides = spec.split(vector);
            let reduced = engine
                .configure(spec.t_sim, &overrides, spec.seeds.as_ref(), &mut output)?
                .map_err(|source| SimError::Calibration { trial, source })?;
            let value =
                objective(&reduced).map_err(|source| SimError::Calibration { trial, source })?;
            debug!(trial, score = value, ?vector, "calibration trial");
            Ok(value)
        };
        let minimum = minimizer.minimize(&spec.initial_parameters, &mut score)?;

        let outcome = CalibrationOutcome {
            parameters: spec.split(&minimum.point),
            vector: minimum.point,
            score: minimum.value,
            converged: minimum.converged,
            evaluations: minimum.evaluations,
            committed: spec.auto_commit && minimum.converged,
        };
        if outcome.committed {
            self.reconfigure(&outcome.parameters)?;
        } else if spec.auto_commit {
            warn!(
                evaluations = outcome.evaluations,
                score = outcome.score,
                "calibration did not converge; parameters left unchanged"
            );
        }
        info!(
            score = outcome.score,
            converged = outcome.converged,
            evaluations = outcome.evaluations,
            committed = outcome.committed,
            "calibration finished"
        );
        Ok(outcome)
    }
}

/// Order two scores, treating NaN as worse than anything.
fn compare_scores(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.total_cmp(&b),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use chrono::NaiveDate;
    use microsim_types::{ALIVE_COLUMN, Column, ID_COLUMN};

    use super::*;
    use crate::clock::Clock;
    use crate::event::{Event, param};
    use crate::tree::EventNode;

    #[test]
    fn nelder_mead_finds_quadratic_minimum() {
        let mut minimizer = NelderMead::new(NelderMeadOptions {
            max_iterations: 500,
            tolerance: 1e-12,
            initial_step: 0.1,
        });
        let mut quadratic = |x: &[f64]| -> Result<f64, SimError> {
            Ok((x[0] - 3.0).powi(2) + (x[1] + 1.0).powi(2))
        };
        let minimum = minimizer.minimize(&[1.0, 1.0], &mut quadratic).unwrap();
        assert!(minimum.converged);
        assert!((minimum.point[0] - 3.0).abs() < 1e-3);
        assert!((minimum.point[1] + 1.0).abs() < 1e-3);
        assert!(minimum.evaluations > 3);
    }

    #[test]
    fn nelder_mead_reports_non_convergence() {
        let mut minimizer = NelderMead::new(NelderMeadOptions {
            max_iterations: 2,
            tolerance: 0.0,
            initial_step: 0.5,
        });
        let mut linear = |x: &[f64]| -> Result<f64, SimError> { Ok(x[0]) };
        let minimum = minimizer.minimize(&[10.0], &mut linear).unwrap();
        assert!(!minimum.converged);
        assert!(minimum.value < 10.0);
    }

    #[test]
    fn nelder_mead_stops_at_first_objective_error() {
        let mut calls = 0;
        let mut failing = |_: &[f64]| -> Result<f64, SimError> {
            calls += 1;
            Err(SimError::Calibration {
                trial: calls,
                source: anyhow::anyhow!("validation data missing"),
            })
        };
        let err = NelderMead::default()
            .minimize(&[1.0, 2.0], &mut failing)
            .unwrap_err();
        assert!(matches!(err, SimError::Calibration { trial: 1, .. }));
        assert_eq!(calls, 1);
    }

    fn simulator() -> Simulator {
        let population = Population::from_columns([
            (ID_COLUMN, Column::from(vec![1_i64, 2, 3])),
            (ALIVE_COLUMN, Column::from(vec![true; 3])),
            ("age", Column::from(vec![50.0; 3])),
        ])
        .unwrap();
        let aging = Event::manipulation("aging", vec![0.5], |pop, living, params, _| {
            let step = param(params, 0)?;
            let mut next = pop.clone();
            for (row, age) in next.floats_mut("age")?.iter_mut().enumerate() {
                if living.is_alive(row) {
                    *age += step;
                }
            }
            Ok(next)
        })
        .with_arity(1);
        let clock = Clock::new("year", NaiveDate::from_ymd_opt(2000, 1, 1).unwrap()).unwrap();
        Simulator::from_population(population, aging, EventNode::empty(), clock, Seeds::Single(3))
            .unwrap()
    }

    fn spec(auto_commit: bool) -> CalibrationSpec {
        CalibrationSpec {
            t_sim: 5,
            events: BTreeMap::from([("aging".to_owned(), vec![0])]),
            initial_parameters: vec![0.5],
            auto_commit,
            seeds: None,
        }
    }

    fn mean_age(pop: &Population) -> anyhow::Result<f64> {
        pop.mean("age")?
            .ok_or_else(|| anyhow::anyhow!("empty population"))
    }

    #[test]
    fn calibrate_recovers_aging_rate_and_commits() {
        let mut sim = simulator();
        let mut minimizer = NelderMead::new(NelderMeadOptions {
            max_iterations: 500,
            tolerance: 1e-12,
            initial_step: 0.05,
        });
        let outcome = sim
            .calibrate(&spec(true), &mut minimizer, mean_age, |mean| {
                Ok((mean - 55.0).powi(2))
            })
            .unwrap();
        assert!(outcome.converged);
        assert!(outcome.committed);
        assert!((outcome.vector[0] - 1.0).abs() < 1e-3);
        assert!((sim.parameters()["aging"][0] - 1.0).abs() < 1e-3);
        assert_eq!(sim.tick(), 0);
        assert_eq!(sim.get_population().floats("age").unwrap(), &[50.0; 3]);
    }

    #[test]
    fn calibrate_without_commit_leaves_parameters() {
        let mut sim = simulator();
        let outcome = sim
            .calibrate(&spec(false), &mut NelderMead::default(), mean_age, |mean| {
                Ok((mean - 55.0).abs())
            })
            .unwrap();
        assert!(outcome.parameters.contains_key("aging"));
        assert!(!outcome.committed);
        assert_eq!(sim.parameters()["aging"], vec![0.5]);
    }

    #[test]
    fn calibrate_does_not_commit_unconverged_search() {
        let mut sim = simulator();
        let mut minimizer = NelderMead::new(NelderMeadOptions {
            max_iterations: 2,
            tolerance: 0.0,
            initial_step: 0.5,
        });
        let outcome = sim
            .calibrate(&spec(true), &mut minimizer, mean_age, |mean| {
                Ok((mean - 55.0).powi(2))
            })
            .unwrap();
        assert!(!outcome.converged);
        assert!(!outcome.committed);
        assert_ne!(outcome.vector, vec![0.5]);
        assert_eq!(sim.parameters()["aging"], vec![0.5]);
    }

    #[test]
    fn calibrate_fails_fast_on_objective_error() {
        let mut sim = simulator();
        let err = sim
            .calibrate(&spec(true), &mut NelderMead::default(), mean_age, |_| {
                anyhow::bail!("no validation data")
            })
            .unwrap_err();
        assert!(matches!(err, SimError::Calibration { trial: 1, .. }));
        assert_eq!(sim.parameters()["aging"], vec![0.5]);
    }

    #[test]
    fn calibrate_validates_before_first_trial() {
        let mut sim = simulator();
        let mut unknown = spec(true);
        unknown.events = BTreeMap::from([("smoking".to_owned(), vec![0])]);
        let mut out_of_range = spec(true);
        out_of_range.events = BTreeMap::from([("aging".to_owned(), vec![4])]);

        for bad in [unknown, out_of_range] {
            let mut trials = 0;
            let err = sim
                .calibrate(&bad, &mut NelderMead::default(), mean_age, |_| {
                    trials += 1;
                    Ok(0.0)
                })
                .unwrap_err();
            assert!(matches!(err, SimError::Config { .. }));
            assert_eq!(trials, 0);
        }
    }

    #[test]
    fn split_maps_indices_to_events() {
        let spec = CalibrationSpec {
            t_sim: 1,
            events: BTreeMap::from([
                ("a".to_owned(), vec![0, 2]),
                ("b".to_owned(), vec![1]),
            ]),
            initial_parameters: vec![0.1, 0.2, 0.3],
            auto_commit: false,
            seeds: None,
        };
        let overrides = spec.split(&[1.0, 2.0, 3.0]);
        assert_eq!(overrides["a"], vec![1.0, 3.0]);
        assert_eq!(overrides["b"], vec![2.0]);
    }

    #[test]
    fn nan_scores_sort_last() {
        assert_eq!(compare_scores(f64::NAN, 1.0), Ordering::Greater);
        assert_eq!(compare_scores(0.5, 1.0), Ordering::Less);
    }
}
