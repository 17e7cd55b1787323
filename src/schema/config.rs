//! Run configuration: optimizer settings, goal, evaluation and simulation.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{ParameterConstraint, ParameterSpec, ProjectConfig};

/// Top-level description of an optimization run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationConfig {
    /// Parameters to optimize (at most three).
    pub parameters: Vec<ParameterConstraint>,
    /// Metric to optimize and how.
    pub goal: GoalSettings,
    /// Genetic algorithm settings.
    #[serde(default)]
    pub optimizer: OptimizerSettings,
    /// Per-evaluation settings.
    #[serde(default)]
    pub evaluation: EvaluationSettings,
    /// Base project configuration that designs are applied onto.
    #[serde(default)]
    pub project: ProjectConfig,
    /// External simulation command.
    pub simulation: SimulationCommandConfig,
    /// Directory holding the checkpoint document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_dir: Option<PathBuf>,
}

impl OptimizationConfig {
    /// Validate the whole configuration and return the parameter specs.
    pub fn validate(&self) -> Result<Vec<ParameterSpec>, ConfigError> {
        let specs = ParameterSpec::from_constraints(&self.parameters)?;
        self.optimizer.validate()?;
        self.goal.validate()?;
        if self.evaluation.timeout_seconds == 0 {
            return Err(ConfigError::InvalidTimeout);
        }
        if self.simulation.program.trim().is_empty() {
            return Err(ConfigError::MissingProgram);
        }
        Ok(specs)
    }
}

/// Genetic algorithm settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerSettings {
    /// Number of individuals kept in the population.
    #[serde(default = "default_population_size")]
    pub population_size: usize,
    /// Evaluation budget for the whole run, bootstrap included.
    #[serde(default = "default_max_evaluations")]
    pub max_evaluations: usize,
    /// Per-parameter mutation probability (0.0-1.0).
    #[serde(default = "default_mutation_rate")]
    pub mutation_rate: f64,
    /// Random seed for reproducibility.
    #[serde(default)]
    pub random_seed: Option<u64>,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            population_size: default_population_size(),
            max_evaluations: default_max_evaluations(),
            mutation_rate: default_mutation_rate(),
            random_seed: None,
        }
    }
}

fn default_population_size() -> usize {
    10
}
fn default_max_evaluations() -> usize {
    50
}
fn default_mutation_rate() -> f64 {
    0.1
}

impl OptimizerSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.population_size < 2 {
            return Err(ConfigError::PopulationTooSmall);
        }
        if self.max_evaluations < self.population_size {
            return Err(ConfigError::BudgetTooSmall {
                max_evaluations: self.max_evaluations,
                population_size: self.population_size,
            });
        }
        if !(0.0..=1.0).contains(&self.mutation_rate) {
            return Err(ConfigError::InvalidMutationRate(self.mutation_rate));
        }
        Ok(())
    }
}

/// Direction of optimization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GoalType {
    Maximize,
    Minimize,
    /// Drive the metric towards `target_value`.
    SetTarget,
}

/// What to optimize.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoalSettings {
    /// Identifier of the metric produced by the simulation.
    pub goal_id: String,
    pub goal_type: GoalType,
    /// Required for [`GoalType::SetTarget`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_value: Option<f64>,
    /// Optional hard constraint, e.g. `"glare < 0.35"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraint: Option<String>,
}

impl GoalSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.goal_type == GoalType::SetTarget
            && !self.target_value.is_some_and(|t| t.is_finite())
        {
            return Err(ConfigError::MissingTarget);
        }
        self.parsed_constraint()?;
        Ok(())
    }

    /// Parse the constraint expression, if any.
    pub fn parsed_constraint(&self) -> Result<Option<Constraint>, ConfigError> {
        match self.constraint.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(expr) => expr.parse().map(Some),
        }
    }

    /// Map a raw metric to a score where higher is always better.
    pub fn score(&self, value: f64) -> f64 {
        match self.goal_type {
            GoalType::Maximize => value,
            GoalType::Minimize => -value,
            GoalType::SetTarget => -(value - self.target_value.unwrap_or(0.0)).abs(),
        }
    }
}

/// Comparison operator of a constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOp {
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Equal,
}

impl ComparisonOp {
    fn as_str(self) -> &'static str {
        match self {
            ComparisonOp::Less => "<",
            ComparisonOp::LessEqual => "<=",
            ComparisonOp::Greater => ">",
            ComparisonOp::GreaterEqual => ">=",
            ComparisonOp::Equal => "==",
        }
    }

    pub fn holds(self, lhs: f64, rhs: f64) -> bool {
        match self {
            ComparisonOp::Less => lhs < rhs,
            ComparisonOp::LessEqual => lhs <= rhs,
            ComparisonOp::Greater => lhs > rhs,
            ComparisonOp::GreaterEqual => lhs >= rhs,
            ComparisonOp::Equal => (lhs - rhs).abs() <= 1e-9 * rhs.abs().max(1.0),
        }
    }
}

/// Parsed `"<metric> <op> <threshold>"` constraint.
#[derive(Debug, Clone, PartialEq)]
pub struct Constraint {
    /// `value`, the goal id, or an auxiliary metric name.
    pub metric: String,
    pub op: ComparisonOp,
    pub threshold: f64,
}

impl Constraint {
    pub fn is_satisfied_by(&self, value: f64) -> bool {
        value.is_finite() && self.op.holds(value, self.threshold)
    }
}

impl FromStr for Constraint {
    type Err = ConfigError;

    fn from_str(expr: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidConstraint(expr.to_string());

        // Two-character operators first so "<=" is not read as "<".
        let (pos, op) = ["<=", ">=", "==", "<", ">"]
            .iter()
            .find_map(|token| expr.find(token).map(|pos| (pos, *token)))
            .ok_or_else(invalid)?;

        let metric = expr[..pos].trim();
        let threshold = expr[pos + op.len()..].trim();
        if metric.is_empty() || metric.contains(char::is_whitespace) {
            return Err(invalid());
        }
        let threshold: f64 = threshold.parse().map_err(|_| invalid())?;
        if !threshold.is_finite() {
            return Err(invalid());
        }

        let op = match op {
            "<" => ComparisonOp::Less,
            "<=" => ComparisonOp::LessEqual,
            ">" => ComparisonOp::Greater,
            ">=" => ComparisonOp::GreaterEqual,
            _ => ComparisonOp::Equal,
        };

        Ok(Self {
            metric: metric.to_string(),
            op,
            threshold,
        })
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.metric, self.op.as_str(), self.threshold)
    }
}

/// Per-evaluation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationSettings {
    /// Wall-clock limit for one simulation run.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for EvaluationSettings {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

fn default_timeout_seconds() -> u64 {
    600
}

impl EvaluationSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// External program that runs one simulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationCommandConfig {
    /// Executable to run.
    pub program: String,
    /// Arguments; `{config}` is replaced with the applied configuration path.
    #[serde(default)]
    pub args: Vec<String>,
    /// Directory for configuration files and the process working directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("No parameters selected for optimization")]
    NoParameters,
    #[error("{count} parameters selected, at most {max} can be optimized")]
    TooManyParameters { count: usize, max: usize },
    #[error("Parameter name must not be empty")]
    UnnamedParameter,
    #[error("Parameter '{0}' is listed more than once")]
    DuplicateParameter(String),
    #[error("Continuous parameter '{0}' needs both min and max")]
    MissingBounds(String),
    #[error("Parameter '{0}' has non-finite bounds or options")]
    NonFiniteBounds(String),
    #[error("Parameter '{name}': min ({min}) must be less than max ({max})")]
    InvalidRange { name: String, min: f64, max: f64 },
    #[error("Discrete parameter '{0}' has no options")]
    EmptyOptions(String),
    #[error("Discrete parameter '{0}' needs at least two distinct options")]
    TooFewOptions(String),
    #[error("Parameter '{name}': target '{target}' is not a JSON pointer")]
    InvalidTarget { name: String, target: String },
    #[error("Population size must be at least 2")]
    PopulationTooSmall,
    #[error("Evaluation budget ({max_evaluations}) must cover the population ({population_size})")]
    BudgetTooSmall {
        max_evaluations: usize,
        population_size: usize,
    },
    #[error("Mutation rate {0} must be within [0, 1]")]
    InvalidMutationRate(f64),
    #[error("Target-seeking goal needs a finite target value")]
    MissingTarget,
    #[error("Invalid constraint expression: '{0}'")]
    InvalidConstraint(String),
    #[error("Evaluation timeout must be positive")]
    InvalidTimeout,
    #[error("Simulation program must not be empty")]
    MissingProgram,
    #[error("Cannot apply parameter at '{0}': a non-object value is in the way")]
    ApplyFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn goal(goal_type: GoalType, target_value: Option<f64>) -> GoalSettings {
        GoalSettings {
            goal_id: "sDA".to_string(),
            goal_type,
            target_value,
            constraint: None,
        }
    }

    #[test]
    fn test_goal_transform() {
        assert_eq!(goal(GoalType::Maximize, None).score(3.0), 3.0);
        assert_eq!(goal(GoalType::Minimize, None).score(3.0), -3.0);
        assert_eq!(goal(GoalType::SetTarget, Some(5.0)).score(3.0), -2.0);
        assert_eq!(goal(GoalType::SetTarget, Some(5.0)).score(7.0), -2.0);
    }

    #[test]
    fn test_target_required() {
        assert!(matches!(
            goal(GoalType::SetTarget, None).validate(),
            Err(ConfigError::MissingTarget)
        ));
        assert!(goal(GoalType::SetTarget, Some(300.0)).validate().is_ok());
    }

    #[test]
    fn test_constraint_parsing() {
        let c: Constraint = "glare <= 0.35".parse().unwrap();
        assert_eq!(c.metric, "glare");
        assert_eq!(c.op, ComparisonOp::LessEqual);
        assert_eq!(c.threshold, 0.35);
        assert!(c.is_satisfied_by(0.35));
        assert!(!c.is_satisfied_by(0.36));

        let c: Constraint = "value>50".parse().unwrap();
        assert_eq!(c.op, ComparisonOp::Greater);
        assert!(!c.is_satisfied_by(50.0));
        assert!(!c.is_satisfied_by(f64::NAN));

        let c: Constraint = "udi == 1e2".parse().unwrap();
        assert!(c.is_satisfied_by(100.0));
        assert_eq!(c.to_string(), "udi == 100");

        assert!("glare 0.35".parse::<Constraint>().is_err());
        assert!("< 0.35".parse::<Constraint>().is_err());
        assert!("glare < high".parse::<Constraint>().is_err());
        assert!("day light < 3".parse::<Constraint>().is_err());
    }

    #[test]
    fn test_optimizer_settings_validation() {
        let mut settings = OptimizerSettings::default();
        assert!(settings.validate().is_ok());

        settings.population_size = 1;
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::PopulationTooSmall)
        ));

        settings.population_size = 10;
        settings.max_evaluations = 9;
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::BudgetTooSmall { .. })
        ));

        settings.max_evaluations = 10;
        settings.mutation_rate = 1.5;
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::InvalidMutationRate(_))
        ));
    }

    #[test]
    fn test_config_deserialization_defaults() {
        let json = r#"{
            "parameters": [{"name": "depth", "type": "continuous", "min": 0.1, "max": 2.0, "step": 0.1}],
            "goal": {"goal_id": "sDA", "goal_type": "set-target", "target_value": 55.0, "constraint": "glare < 0.4"},
            "simulation": {"program": "run-sim", "args": ["{config}"]}
        }"#;
        let config: OptimizationConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.optimizer.population_size, 10);
        assert_eq!(config.optimizer.max_evaluations, 50);
        assert_eq!(config.evaluation.timeout(), Duration::from_secs(600));
        assert_eq!(config.goal.goal_type, GoalType::SetTarget);

        let specs = config.validate().unwrap();
        assert_eq!(specs[0].id, "depth");
    }
}
