//! Filter engine: selects the agent × task matrix to run.
//!
//! Predicates are `key=value` (equality, `value` may list alternatives
//! separated by commas) or `key!=value` (exclusion). An agent or task is
//! selected when it satisfies every predicate for its kind. An empty
//! selection is valid and means "nothing to run".

use std::str::FromStr;
use std::sync::{Arc, LazyLock};

use regex::Regex;

use crate::core::descriptor::{AgentDescriptor, Difficulty, TaskDescriptor};
use crate::error::FilterError;

pub const AGENT_ATTRIBUTES: &[&str] = &["name", "tag"];
pub const TASK_ATTRIBUTES: &[&str] = &["name", "tag", "difficulty", "non_deterministic"];

static PREDICATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_-]*)\s*(!=|=)\s*(.*?)\s*$")
        .unwrap_or_else(|err| panic!("predicate regex is invalid: {err}"))
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Equals,
    NotEquals,
}

/// One parsed filter predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Predicate {
    pub attribute: String,
    pub comparison: Comparison,
    /// Alternatives; equality matches any of them, exclusion rejects all of them.
    pub values: Vec<String>,
}

impl FromStr for Predicate {
    type Err = FilterError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let caps = PREDICATE_RE
            .captures(raw)
            .ok_or_else(|| FilterError::Malformed(raw.to_string()))?;
        let attribute = caps[1].to_ascii_lowercase().replace('-', "_");
        let comparison = if &caps[2] == "!=" {
            Comparison::NotEquals
        } else {
            Comparison::Equals
        };
        let values: Vec<String> = caps[3]
            .split(',')
            .map(|value| value.trim().to_string())
            .collect();
        if values.iter().any(String::is_empty) {
            return Err(FilterError::Malformed(raw.to_string()));
        }
        Ok(Self {
            attribute,
            comparison,
            values,
        })
    }
}

/// Agent and task predicates supplied by the user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterSet {
    pub agent: Vec<Predicate>,
    pub task: Vec<Predicate>,
}

impl FilterSet {
    /// Parse raw `key=value` strings for both kinds.
    pub fn parse<A, T>(agent: A, task: T) -> Result<Self, FilterError>
    where
        A: IntoIterator,
        A::Item: AsRef<str>,
        T: IntoIterator,
        T::Item: AsRef<str>,
    {
        let agent = agent
            .into_iter()
            .map(|raw| raw.as_ref().parse())
            .collect::<Result<Vec<Predicate>, _>>()?;
        let task = task
            .into_iter()
            .map(|raw| raw.as_ref().parse())
            .collect::<Result<Vec<Predicate>, _>>()?;
        let filters = Self { agent, task };
        filters.validate()?;
        Ok(filters)
    }

    /// Reject unknown attributes and values that can never be valid.
    pub fn validate(&self) -> Result<(), FilterError> {
        for predicate in &self.agent {
            validate_predicate::<AgentDescriptor>(predicate)?;
        }
        for predicate in &self.task {
            validate_predicate::<TaskDescriptor>(predicate)?;
        }
        Ok(())
    }
}

/// Descriptor kinds the filter engine can select on.
pub trait Filterable {
    const KIND: &'static str;
    const ATTRIBUTES: &'static [&'static str];

    /// Check `value` is acceptable for `attribute` (attribute already known).
    fn validate_value(_attribute: &str, _value: &str) -> Result<(), String> {
        Ok(())
    }

    /// Whether this descriptor's `attribute` equals `value`.
    fn attribute_matches(&self, attribute: &str, value: &str) -> bool;
}

impl Filterable for AgentDescriptor {
    const KIND: &'static str = "agent";
    const ATTRIBUTES: &'static [&'static str] = AGENT_ATTRIBUTES;

    fn attribute_matches(&self, attribute: &str, value: &str) -> bool {
        match attribute {
            "name" => self.name == value,
            "tag" => self.tags.iter().any(|tag| tag == value),
            _ => false,
        }
    }
}

impl Filterable for TaskDescriptor {
    const KIND: &'static str = "task";
    const ATTRIBUTES: &'static [&'static str] = TASK_ATTRIBUTES;

    fn validate_value(attribute: &str, value: &str) -> Result<(), String> {
        match attribute {
            "difficulty" => value.parse::<Difficulty>().map(|_| ()),
            "non_deterministic" => parse_bool(value).map(|_| ()),
            _ => Ok(()),
        }
    }

    fn attribute_matches(&self, attribute: &str, value: &str) -> bool {
        match attribute {
            "name" => self.name == value,
            "tag" => self.tags.iter().any(|tag| tag == value),
            "difficulty" => value
                .parse::<Difficulty>()
                .is_ok_and(|difficulty| difficulty == self.difficulty),
            "non_deterministic" => parse_bool(value).is_ok_and(|flag| flag == self.non_deterministic),
            _ => false,
        }
    }
}

fn validate_predicate<D: Filterable>(predicate: &Predicate) -> Result<(), FilterError> {
    if !D::ATTRIBUTES.contains(&predicate.attribute.as_str()) {
        return Err(FilterError::UnknownAttribute {
            kind: D::KIND,
            attribute: predicate.attribute.clone(),
            known: D::ATTRIBUTES.join(", "),
        });
    }
    for value in &predicate.values {
        D::validate_value(&predicate.attribute, value).map_err(|reason| {
            FilterError::InvalidValue {
                attribute: predicate.attribute.clone(),
                value: value.clone(),
                reason,
            }
        })?;
    }
    Ok(())
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        other => Err(format!("expected a boolean, got {other:?}")),
    }
}

/// Whether `descriptor` satisfies all `predicates`.
pub fn matches_all<D: Filterable>(descriptor: &D, predicates: &[Predicate]) -> bool {
    predicates.iter().all(|predicate| {
        let any_equal = predicate
            .values
            .iter()
            .any(|value| descriptor.attribute_matches(&predicate.attribute, value));
        match predicate.comparison {
            Comparison::Equals => any_equal,
            Comparison::NotEquals => !any_equal,
        }
    })
}

/// Select descriptors of one kind, preserving input order.
pub fn select<D: Filterable>(
    descriptors: &[Arc<D>],
    predicates: &[Predicate],
) -> Result<Vec<Arc<D>>, FilterError> {
    for predicate in predicates {
        validate_predicate::<D>(predicate)?;
    }
    Ok(descriptors
        .iter()
        .filter(|descriptor| matches_all::<D>(descriptor, predicates))
        .cloned()
        .collect())
}

/// Cartesian product of the selected agents and tasks (agent-major order).
pub fn select_pairs(
    agents: &[Arc<AgentDescriptor>],
    tasks: &[Arc<TaskDescriptor>],
    filters: &FilterSet,
) -> Result<Vec<(Arc<AgentDescriptor>, Arc<TaskDescriptor>)>, FilterError> {
    let agents = select(agents, &filters.agent)?;
    let tasks = select(tasks, &filters.task)?;
    let mut pairs = Vec::with_capacity(agents.len() * tasks.len());
    for agent in &agents {
        for task in &tasks {
            pairs.push((Arc::clone(agent), Arc::clone(task)));
        }
    }
    Ok(pairs)
}
