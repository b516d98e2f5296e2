//! Event trees and per-tick evaluation.
//!
//! An [`EventNode`] is either a single [`Event`] or an [`EventGroup`] of
//! child nodes. Groups carry an `ordered` flag that documents whether the
//! children depend on each other's side effects. Both kinds of group are
//! evaluated strictly in declaration order: the flag never licenses
//! concurrent or reordered evaluation.
//!
//! [`evaluate_tick`] threads a [`TickPass`] through a tree:
//!
//! - a manipulation leaf replaces the population with the mechanism's
//!   result and recomputes the living mask immediately, so later events
//!   in the same tick see deaths caused by earlier ones;
//! - an accumulation leaf stages its new rows; staged rows are appended
//!   by the engine only after the whole tick, so newborns and immigrants
//!   are never touched by events in the tick that created them.

use microsim_types::{LivingMask, Population};
use tracing::trace;

use crate::config::ConfigError;
use crate::error::SimError;
use crate::event::{Event, EventRng, Mechanism, MissingParameter};
use crate::store;

/// A group of event nodes evaluated in declaration order.
#[derive(Debug, Clone, Default)]
pub struct EventGroup {
    ordered: bool,
    children: Vec<EventNode>,
}

impl EventGroup {
    /// A group whose children depend on each other's side effects.
    pub fn ordered(children: impl IntoIterator<Item = impl Into<EventNode>>) -> Self {
        Self {
            ordered: true,
            children: children.into_iter().map(Into::into).collect(),
        }
    }

    /// A group whose children are declared independent.
    pub fn unordered(children: impl IntoIterator<Item = impl Into<EventNode>>) -> Self {
        Self {
            ordered: false,
            children: children.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether the group documents an ordering dependency.
    pub const fn is_ordered(&self) -> bool {
        self.ordered
    }

    /// Child nodes in declaration order.
    pub fn children(&self) -> &[EventNode] {
        &self.children
    }
}

/// A node of an event tree.
#[derive(Debug, Clone)]
pub enum EventNode {
    /// A single event.
    Leaf(Event),
    /// A nested group.
    Group(EventGroup),
}

impl EventNode {
    /// An empty tree.
    pub fn empty() -> Self {
        Self::Group(EventGroup::default())
    }

    /// Leaves in evaluation order.
    pub fn events(&self) -> Vec<&Event> {
        let mut out = Vec::new();
        self.collect_events(&mut out);
        out
    }

    fn collect_events<'a>(&'a self, out: &mut Vec<&'a Event>) {
        match self {
            Self::Leaf(event) => out.push(event),
            Self::Group(group) => {
                for child in &group.children {
                    child.collect_events(out);
                }
            }
        }
    }

    /// Names of all leaves in evaluation order.
    pub fn names(&self) -> Vec<&str> {
        self.events().into_iter().map(Event::name).collect()
    }

    /// Find a leaf by name.
    pub fn find(&self, name: &str) -> Option<&Event> {
        match self {
            Self::Leaf(event) => (event.name() == name).then_some(event),
            Self::Group(group) => group.children.iter().find_map(|child| child.find(name)),
        }
    }

    pub(crate) fn find_mut(&mut self, name: &str) -> Option<&mut Event> {
        match self {
            Self::Leaf(event) => (event.name() == name).then_some(event),
            Self::Group(group) => group
                .children
                .iter_mut()
                .find_map(|child| child.find_mut(name)),
        }
    }
}

impl From<Event> for EventNode {
    fn from(event: Event) -> Self {
        Self::Leaf(event)
    }
}

impl From<EventGroup> for EventNode {
    fn from(group: EventGroup) -> Self {
        Self::Group(group)
    }
}

impl Default for EventNode {
    fn default() -> Self {
        Self::empty()
    }
}

/// State threaded through the events of one tick.
#[derive(Debug, Clone)]
pub struct TickPass {
    /// Current population, including this tick's manipulations so far.
    pub population: Population,
    /// Living mask of `population`.
    pub living: LivingMask,
    /// Rows produced by accumulation events, appended after the tick.
    pub staged: Population,
}

impl TickPass {
    /// Start a pass over `population`.
    pub fn new(population: Population) -> Result<Self, microsim_types::PopulationError> {
        let living = population.living_mask()?;
        let staged = population.empty_like();
        Ok(Self {
            population,
            living,
            staged,
        })
    }
}

/// Evaluate every leaf of `node` once, in declaration order.
///
/// # Errors
///
/// Stops at the first failing event and returns an error naming it and
/// `tick`. The pass is left as it was after the last successful event.
pub fn evaluate_tick(
    node: &EventNode,
    pass: &mut TickPass,
    rng: &mut EventRng,
    tick: u64,
) -> Result<(), SimError> {
    match node {
        EventNode::Leaf(event) => evaluate_event(event, pass, rng, tick),
        EventNode::Group(group) => {
            for child in &group.children {
                evaluate_tick(child, pass, rng, tick)?;
            }
            Ok(())
        }
    }
}

fn evaluate_event(
    event: &Event,
    pass: &mut TickPass,
    rng: &mut EventRng,
    tick: u64,
) -> Result<(), SimError> {
    let name = event.name();
    let params = event.parameters();
    event
        .check_parameters(params)
        .map_err(|source| SimError::Parameters {
            event: name.to_owned(),
            tick,
            source,
        })?;

    match event.mechanism() {
        Mechanism::Manipulation(mechanism) => {
            let mut next = mechanism(&pass.population, &pass.living, params, rng)
                .map_err(|source| mechanism_error(event, tick, source))?;
            store::check_manipulation(&pass.population, &next).map_err(|source| {
                SimError::Schema {
                    event: name.to_owned(),
                    tick,
                    source,
                }
            })?;
            let changed = store::mark_changed(&pass.population, &mut next, name)
                .map_err(|source| table_error(name, tick, source))?;
            pass.living = next
                .living_mask()
                .map_err(|source| table_error(name, tick, source))?;
            pass.population = next;
            trace!(
                tick,
                event = name,
                changed,
                living = pass.living.count(),
                "manipulation applied"
            );
        }
        Mechanism::Accumulation(mechanism) => {
            let mut rows = mechanism(&pass.population, params, rng)
                .map_err(|source| mechanism_error(event, tick, source))?;
            if rows.is_empty() && rows.column_count() == 0 {
                trace!(tick, event = name, "accumulation produced no rows");
                return Ok(());
            }
            store::check_accumulation(&pass.population, &rows).map_err(|source| {
                SimError::Schema {
                    event: name.to_owned(),
                    tick,
                    source,
                }
            })?;
            store::mark_all(&mut rows, name).map_err(|source| table_error(name, tick, source))?;
            let added = rows.len();
            pass.staged.append(rows).map_err(|source| SimError::Schema {
                event: name.to_owned(),
                tick,
                source,
            })?;
            trace!(tick, event = name, added, "accumulation staged");
        }
    }
    Ok(())
}

fn mechanism_error(event: &Event, tick: u64, source: anyhow::Error) -> SimError {
    match source.downcast_ref::<MissingParameter>() {
        Some(missing) => SimError::Parameters {
            event: event.name().to_owned(),
            tick,
            source: ConfigError::ParameterCount {
                event: event.name().to_owned(),
                expected: missing.index.saturating_add(1),
                actual: missing.len,
            },
        },
        None => SimError::Mechanism {
            event: event.name().to_owned(),
            tick,
            source,
        },
    }
}

fn table_error(event: &str, tick: u64, source: microsim_types::PopulationError) -> SimError {
    SimError::Table {
        event: event.to_owned(),
        tick,
        source,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use microsim_types::{ALIVE_COLUMN, Column, ID_COLUMN, LAST_EVENT_COLUMN};
    use rand::SeedableRng;

    use super::*;
    use crate::event::param;

    fn population(n: usize) -> Population {
        let ids: Vec<i64> = (1..=i64::try_from(n).unwrap()).collect();
        store::prepare(
            Population::from_columns([
                (ID_COLUMN, Column::from(ids)),
                (ALIVE_COLUMN, Column::from(vec![true; n])),
                ("age", Column::from(vec![50.0; n])),
            ])
            .unwrap(),
        )
        .unwrap()
    }

    fn kill_all() -> Event {
        Event::manipulation("kill", Vec::new(), |pop, living, _, _| {
            let mut next = pop.clone();
            for (row, alive) in next.bools_mut(ALIVE_COLUMN)?.iter_mut().enumerate() {
                if living.is_alive(row) {
                    *alive = false;
                }
            }
            Ok(next)
        })
    }

    fn age_living() -> Event {
        Event::manipulation("age", vec![1.0], |pop, living, params, _| {
            let step = param(params, 0)?;
            let mut next = pop.clone();
            for (row, age) in next.floats_mut("age")?.iter_mut().enumerate() {
                if living.is_alive(row) {
                    *age += step;
                }
            }
            Ok(next)
        })
    }

    fn run(node: &EventNode, pop: Population) -> Result<TickPass, SimError> {
        let mut pass = TickPass::new(pop).unwrap();
        let mut rng = EventRng::seed_from_u64(1);
        evaluate_tick(node, &mut pass, &mut rng, 0)?;
        Ok(pass)
    }

    #[test]
    fn later_events_see_earlier_deaths() {
        let tree = EventNode::from(EventGroup::ordered([kill_all(), age_living()]));
        let pass = run(&tree, population(3)).unwrap();
        assert_eq!(pass.living.count(), 0);
        assert_eq!(pass.population.floats("age").unwrap(), &[50.0, 50.0, 50.0]);
        assert_eq!(
            pass.population.texts(LAST_EVENT_COLUMN).unwrap(),
            &["kill", "kill", "kill"]
        );
    }

    #[test]
    fn unordered_groups_still_run_in_declaration_order() {
        let tree = EventNode::from(EventGroup::unordered([age_living(), kill_all()]));
        let pass = run(&tree, population(2)).unwrap();
        assert_eq!(pass.population.floats("age").unwrap(), &[51.0, 51.0]);
        assert_eq!(pass.living.count(), 0);
    }

    #[test]
    fn nested_groups_flatten() {
        let inner = EventGroup::ordered([age_living()]);
        let tree = EventNode::from(EventGroup::unordered([
            EventNode::from(inner),
            EventNode::from(kill_all()),
        ]));
        assert_eq!(tree.names(), vec!["age", "kill"]);
        assert!(tree.find("kill").is_some());
        assert!(tree.find("births").is_none());
        let pass = run(&tree, population(1)).unwrap();
        assert_eq!(pass.population.floats("age").unwrap(), &[51.0]);
    }

    #[test]
    fn accumulated_rows_are_staged_not_appended() {
        let births = Event::accumulation("births", Vec::new(), |pop, _, _| {
            let mut rows = pop.slice(0..1)?;
            rows.floats_mut("age")?.fill(0.0);
            Ok(rows)
        });
        let tree = EventNode::from(EventGroup::ordered([births, age_living()]));
        let pass = run(&tree, population(2)).unwrap();
        assert_eq!(pass.population.len(), 2);
        assert_eq!(pass.staged.len(), 1);
        assert_eq!(pass.staged.floats("age").unwrap(), &[0.0]);
        assert_eq!(pass.staged.texts(LAST_EVENT_COLUMN).unwrap(), &["births"]);
    }

    #[test]
    fn schema_change_is_reported_with_event_and_tick() {
        let widen = Event::manipulation("widen", Vec::new(), |pop, _, _, _| {
            Ok(pop.clone().with_column("bmi", Column::from(vec![0.0; pop.len()]))?)
        });
        let err = run(&EventNode::from(widen), population(2)).unwrap_err();
        assert!(matches!(err, SimError::Schema { .. }));
        assert_eq!(err.event(), Some("widen"));
        assert_eq!(err.tick(), Some(0));
    }

    #[test]
    fn missing_parameter_becomes_parameter_error() {
        let mut aging = age_living();
        aging.set_parameters(Vec::new()).unwrap();
        let err = run(&EventNode::from(aging), population(1)).unwrap_err();
        assert!(matches!(
            err,
            SimError::Parameters {
                source: ConfigError::ParameterCount { expected: 1, actual: 0, .. },
                ..
            }
        ));
    }

    #[test]
    fn mechanism_failure_carries_event_name() {
        let broken = Event::manipulation("broken", Vec::new(), |_, _, _, _| {
            Err(anyhow::anyhow!("risk table missing"))
        });
        let err = run(&EventNode::from(broken), population(1)).unwrap_err();
        assert!(matches!(err, SimError::Mechanism { .. }));
        assert!(err.to_string().contains("broken"));
    }
}
