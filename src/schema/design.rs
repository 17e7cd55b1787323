//! Designs, evaluated designs and optimizer state.
//!
//! These types double as the checkpoint document format, so their serde
//! representation is part of the public contract:
//!
//! ```text
//! {
//!   "evaluationsCompleted": 12,
//!   "population": [
//!     { "params": { "depth": 1.2 }, "fitness": 0.8, "metricValue": 0.8, "unit": "%" }
//!   ],
//!   "bestDesign": { ... } | null,
//!   "randomSeed": 42
//! }
//! ```
//!
//! A fitness of `-inf` is stored as `null`.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::{ParamValue, ParameterSpec};

/// A point in parameter space: parameter id to concrete value.
///
/// Keys are kept ordered so the canonical serialization is stable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Design {
    values: BTreeMap<String, ParamValue>,
}

impl Design {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a parameter value, returning the design for chaining.
    pub fn with(mut self, id: &str, value: impl Into<ParamValue>) -> Self {
        self.values.insert(id.to_string(), value.into());
        self
    }

    pub fn insert(&mut self, id: &str, value: ParamValue) {
        self.values.insert(id.to_string(), value);
    }

    pub fn get(&self, id: &str) -> Option<&ParamValue> {
        self.values.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Canonical cache and checkpoint identity of this design.
    pub fn key(&self) -> DesignKey {
        // Serializing a BTreeMap of plain values cannot fail.
        DesignKey(serde_json::to_string(&self.values).unwrap_or_default())
    }

    /// Check that this design has exactly one valid value per parameter.
    pub fn conforms_to(&self, specs: &[ParameterSpec]) -> Result<(), StateError> {
        if self.values.len() != specs.len() {
            return Err(StateError::ParameterCount {
                found: self.values.len(),
                expected: specs.len(),
            });
        }
        for spec in specs {
            match self.values.get(&spec.id) {
                None => return Err(StateError::MissingParameter(spec.id.clone())),
                Some(value) if !spec.accepts(value) => {
                    return Err(StateError::OutOfDomain {
                        id: spec.id.clone(),
                        value: value.to_string(),
                    });
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

impl PartialEq for Design {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl fmt::Display for Design {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (id, value) in &self.values {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{}={}", id, value)?;
            first = false;
        }
        Ok(())
    }
}

/// Canonical serialized form of a [`Design`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DesignKey(String);

impl DesignKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DesignKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A design together with its score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluatedDesign {
    /// Parameter values.
    pub params: Design,
    /// Score the optimizer maximizes. `-inf` marks failure or a violated constraint.
    #[serde(with = "fitness_serde")]
    pub fitness: f64,
    /// Raw metric produced by the simulation, before the goal transform.
    #[serde(default)]
    pub metric_value: f64,
    /// Display unit of the raw metric.
    #[serde(default)]
    pub unit: String,
}

impl EvaluatedDesign {
    pub fn new(params: Design, fitness: f64, metric_value: f64, unit: impl Into<String>) -> Self {
        Self {
            params,
            fitness,
            metric_value,
            unit: unit.into(),
        }
    }

    /// Result recorded for a design whose evaluation failed.
    pub fn failed(params: Design) -> Self {
        Self::new(params, f64::NEG_INFINITY, 0.0, "")
    }

    /// Whether the design is feasible (finite fitness).
    pub fn is_feasible(&self) -> bool {
        self.fitness.is_finite()
    }
}

/// Full optimizer state, as persisted by the checkpoint store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizerState {
    /// Number of fitness evaluations consumed so far.
    pub evaluations_completed: usize,
    /// Population sorted by fitness, best first.
    pub population: Vec<EvaluatedDesign>,
    /// Current best design (`population[0]` once bootstrapped).
    pub best_design: Option<EvaluatedDesign>,
    /// Seed from which every random draw of the run is derived.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub random_seed: Option<u64>,
}

/// Restored state that does not fit the run's parameters.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StateError {
    #[error("Design has {found} values for {expected} parameters")]
    ParameterCount { found: usize, expected: usize },
    #[error("Design is missing parameter '{0}'")]
    MissingParameter(String),
    #[error("Value {value} is outside the domain of '{id}'")]
    OutOfDomain { id: String, value: String },
    #[error("{0} evaluations recorded but the population is empty")]
    EmptyPopulation(usize),
}

/// Stores non-finite fitness values as `null`.
mod fitness_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_some(value)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        let value = Option::<f64>::deserialize(deserializer)?;
        Ok(value.unwrap_or(f64::NEG_INFINITY))
    }
}
