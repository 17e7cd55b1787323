//! Parameter domain types for the design-space optimizer.
//!
//! A run optimizes at most [`MAX_PARAMETERS`] dimensions. Each dimension is
//! either a continuous range laid out on a fixed grid, or an ordered set of
//! discrete options. All continuous values pass through [`snap`] so every
//! design produced during a run lies on the same grid.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Maximum number of parameters a single run may optimize.
pub const MAX_PARAMETERS: usize = 3;

/// Tolerance used when checking that a stored value lies inside a range.
const RANGE_TOLERANCE: f64 = 1e-9;

/// A concrete parameter value.
///
/// Continuous parameters always hold [`ParamValue::Number`]. Discrete
/// options are opaque and may be numbers, strings or boolean flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Number(f64),
    Flag(bool),
    Text(String),
}

impl ParamValue {
    /// Numeric view of the value, if it is a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Number(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Number(v) => write!(f, "{}", v),
            ParamValue::Flag(b) => write!(f, "{}", b),
            ParamValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Number(v)
    }
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        ParamValue::Text(s.to_string())
    }
}

/// Kind discriminator used in the parameter constraint list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    Continuous,
    Discrete,
}

/// Raw, orchestration-supplied description of one tunable parameter.
///
/// This is the loosely-typed input form; [`ParameterSpec::from_constraint`]
/// validates it into a [`ParameterSpec`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterConstraint {
    /// Unique parameter name.
    pub name: String,
    /// Continuous or discrete.
    #[serde(rename = "type")]
    pub kind: ParameterType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<ParamValue>>,
    /// JSON pointer into the project configuration where the value is applied.
    /// Defaults to `/<name>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// Validated domain of a single parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterDomain {
    /// Range `[min, max]` on a grid of `step` (clamp only if `step <= 0`).
    Continuous { min: f64, max: f64, step: f64 },
    /// Ordered set of at least two distinct options.
    Discrete { options: Vec<ParamValue> },
}

/// One optimized dimension. Immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSpec {
    /// Key of this parameter inside a design.
    pub id: String,
    /// Valid values.
    pub domain: ParameterDomain,
    /// JSON pointer used when applying the value to a project configuration.
    pub target: String,
}

impl ParameterSpec {
    /// Create a continuous parameter.
    pub fn continuous(id: &str, min: f64, max: f64, step: f64) -> Result<Self, ConfigError> {
        if !min.is_finite() || !max.is_finite() {
            return Err(ConfigError::NonFiniteBounds(id.to_string()));
        }
        if min >= max {
            return Err(ConfigError::InvalidRange {
                name: id.to_string(),
                min,
                max,
            });
        }
        Ok(Self {
            id: id.to_string(),
            domain: ParameterDomain::Continuous {
                min,
                max,
                step: if step.is_finite() { step } else { 0.0 },
            },
            target: default_target(id),
        })
    }

    /// Create a discrete parameter.
    pub fn discrete(id: &str, options: Vec<ParamValue>) -> Result<Self, ConfigError> {
        if options.is_empty() {
            return Err(ConfigError::EmptyOptions(id.to_string()));
        }
        let mut distinct: Vec<&ParamValue> = Vec::with_capacity(options.len());
        for option in &options {
            if let ParamValue::Number(v) = option
                && !v.is_finite()
            {
                return Err(ConfigError::NonFiniteBounds(id.to_string()));
            }
            if !distinct.contains(&option) {
                distinct.push(option);
            }
        }
        if distinct.len() < 2 {
            return Err(ConfigError::TooFewOptions(id.to_string()));
        }
        Ok(Self {
            id: id.to_string(),
            domain: ParameterDomain::Discrete { options },
            target: default_target(id),
        })
    }

    /// Override the JSON pointer the value is applied at.
    pub fn with_target(mut self, target: &str) -> Result<Self, ConfigError> {
        if target.len() < 2 || !target.starts_with('/') {
            return Err(ConfigError::InvalidTarget {
                name: self.id.clone(),
                target: target.to_string(),
            });
        }
        self.target = target.to_string();
        Ok(self)
    }

    /// Validate a raw constraint into a parameter spec.
    pub fn from_constraint(constraint: &ParameterConstraint) -> Result<Self, ConfigError> {
        let name = constraint.name.trim();
        if name.is_empty() {
            return Err(ConfigError::UnnamedParameter);
        }

        let spec = match constraint.kind {
            ParameterType::Continuous => {
                let (Some(min), Some(max)) = (constraint.min, constraint.max) else {
                    return Err(ConfigError::MissingBounds(name.to_string()));
                };
                Self::continuous(name, min, max, constraint.step.unwrap_or(0.0))?
            }
            ParameterType::Discrete => {
                Self::discrete(name, constraint.options.clone().unwrap_or_default())?
            }
        };

        match &constraint.target {
            Some(target) => spec.with_target(target),
            None => Ok(spec),
        }
    }

    /// Validate a full constraint list: 1..=MAX_PARAMETERS entries with unique names.
    pub fn from_constraints(constraints: &[ParameterConstraint]) -> Result<Vec<Self>, ConfigError> {
        if constraints.is_empty() {
            return Err(ConfigError::NoParameters);
        }
        if constraints.len() > MAX_PARAMETERS {
            return Err(ConfigError::TooManyParameters {
                count: constraints.len(),
                max: MAX_PARAMETERS,
            });
        }

        let mut seen = HashSet::new();
        let mut specs = Vec::with_capacity(constraints.len());
        for constraint in constraints {
            let spec = Self::from_constraint(constraint)?;
            if !seen.insert(spec.id.clone()) {
                return Err(ConfigError::DuplicateParameter(spec.id));
            }
            specs.push(spec);
        }
        Ok(specs)
    }

    /// Normalize a raw number onto this parameter's grid.
    ///
    /// Discrete parameters have no grid; the value is returned unchanged.
    pub fn snap(&self, value: f64) -> f64 {
        match &self.domain {
            ParameterDomain::Continuous { min, max, step } => snap(value, *min, *max, *step),
            ParameterDomain::Discrete { .. } => value,
        }
    }

    /// Whether `value` is a member of this parameter's domain.
    pub fn accepts(&self, value: &ParamValue) -> bool {
        match (&self.domain, value) {
            (ParameterDomain::Continuous { min, max, .. }, ParamValue::Number(v)) => {
                v.is_finite() && *v >= min - RANGE_TOLERANCE && *v <= max + RANGE_TOLERANCE
            }
            (ParameterDomain::Continuous { .. }, _) => false,
            (ParameterDomain::Discrete { options }, v) => options.contains(v),
        }
    }
}

fn default_target(id: &str) -> String {
    format!("/{}", id.replace('~', "~0").replace('/', "~1"))
}

/// Snap `value` onto the grid `min + k * step` and clamp it to `[min, max]`.
///
/// With `step <= 0` the value is only clamped.
pub fn snap(value: f64, min: f64, max: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return value.clamp(min, max);
    }
    let snapped = ((value - min) / step).round() * step + min;
    snapped.clamp(min, max)
}
