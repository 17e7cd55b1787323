//! External simulation interface.
//!
//! The optimizer never runs lighting or energy engines itself. It hands an
//! applied [`ProjectConfig`] to a [`Simulation`] and receives one raw metric
//! back, plus any auxiliary metrics a constraint may refer to.

mod command;

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::schema::ProjectConfig;

pub use command::CommandSimulation;

/// Parsed result of one simulation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationOutput {
    /// Raw goal metric.
    pub value: f64,
    /// Display unit of `value`.
    #[serde(default)]
    pub unit: String,
    /// Auxiliary metrics by name.
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
}

impl SimulationOutput {
    pub fn new(value: f64, unit: impl Into<String>) -> Self {
        Self {
            value,
            unit: unit.into(),
            metrics: BTreeMap::new(),
        }
    }

    pub fn with_metric(mut self, name: &str, value: f64) -> Self {
        self.metrics.insert(name.to_string(), value);
        self
    }

    /// Look up a metric by name; `value` and the goal id refer to the raw goal metric.
    pub fn metric(&self, name: &str, goal_id: &str) -> Option<f64> {
        if name == "value" || name == goal_id {
            return Some(self.value);
        }
        self.metrics.get(name).copied()
    }
}

/// Failure while producing a raw metric.
#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    #[error("Failed to start simulation '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("Simulation exited with status {status}: {stderr}")]
    Exit { status: String, stderr: String },
    #[error("Simulation produced no output")]
    EmptyOutput,
    #[error("Cannot parse simulation output: {0}")]
    Parse(String),
    #[error("Required file missing: {0}")]
    MissingFile(PathBuf),
    #[error("Simulation I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Runs one simulation for an applied project configuration.
#[async_trait]
pub trait Simulation: Send + Sync {
    async fn simulate(&self, config: &ProjectConfig) -> Result<SimulationOutput, SimulationError>;
}
