//! Fitness evaluation pipeline.
//!
//! Turns a design into a score: apply the design to the project
//! configuration, run the simulation, transform the raw metric according to
//! the goal, apply the constraint penalty, and memoize the result by design.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::OnceCell;

use crate::schema::{
    ConfigError, Constraint, Design, DesignKey, EvaluatedDesign, GoalSettings, ParameterSpec,
    ProjectConfig,
};
use crate::simulation::{Simulation, SimulationError};

use super::StopHandle;

/// Default wall-clock limit for one simulation.
pub const DEFAULT_EVALUATION_TIMEOUT: Duration = Duration::from_secs(600);

/// Asynchronous scoring of a design.
///
/// Implementations should absorb per-design failures into a `-inf` fitness
/// and reserve errors for [`EvaluationError::Cancelled`]. The engine treats
/// any other error the same way, as a failed design.
#[async_trait]
pub trait FitnessFunction: Send + Sync {
    async fn evaluate(&self, design: &Design) -> Result<EvaluatedDesign, EvaluationError>;
}

/// Failure while evaluating a design.
#[derive(Debug, thiserror::Error)]
pub enum EvaluationError {
    #[error("Evaluation cancelled")]
    Cancelled,
    #[error(transparent)]
    Simulation(#[from] SimulationError),
    #[error("Simulation timed out after {0:?}")]
    Timeout(Duration),
    #[error("Simulation returned a non-finite value")]
    NonFinite,
    #[error("Design cannot be applied: {0}")]
    Apply(#[from] ConfigError),
}

impl EvaluationError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EvaluationError::Cancelled)
    }
}

/// Cached outcome of one simulated design.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedFitness {
    /// Goal-transformed score (`-inf` if the constraint failed).
    pub score: f64,
    /// Raw metric.
    pub value: f64,
    pub unit: String,
}

impl CachedFitness {
    fn to_evaluated(&self, design: &Design) -> EvaluatedDesign {
        EvaluatedDesign::new(design.clone(), self.score, self.value, self.unit.clone())
    }
}

/// Hit and miss counters of a [`FitnessCache`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
}

/// Design-keyed memo of simulation results, scoped to one run.
///
/// Each key owns a once-cell, so concurrent evaluations of the same design
/// share a single simulation.
#[derive(Debug, Default)]
pub struct FitnessCache {
    entries: Mutex<HashMap<DesignKey, Arc<OnceCell<CachedFitness>>>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl FitnessCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, key: &DesignKey) -> Arc<OnceCell<CachedFitness>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(entries.entry(key.clone()).or_default())
    }

    /// Remove a design's slot if no result was stored in it.
    fn forget_failed(&self, key: &DesignKey) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.get(key).is_some_and(|cell| !cell.initialized()) {
            entries.remove(key);
        }
    }

    /// Completed result for a design, if any.
    pub fn get(&self, key: &DesignKey) -> Option<CachedFitness> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(key).and_then(|cell| cell.get().cloned())
    }

    /// Number of completed entries.
    pub fn len(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.values().filter(|cell| cell.initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all entries and reset the counters.
    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

/// Scores designs by running a [`Simulation`].
pub struct FitnessPipeline<S> {
    simulation: S,
    specs: Vec<ParameterSpec>,
    project: ProjectConfig,
    goal: GoalSettings,
    constraint: Option<Constraint>,
    timeout: Duration,
    cache: FitnessCache,
    stop: StopHandle,
}

impl<S: Simulation> FitnessPipeline<S> {
    /// Create a pipeline for one run's goal settings.
    pub fn new(
        simulation: S,
        specs: Vec<ParameterSpec>,
        goal: GoalSettings,
        project: ProjectConfig,
    ) -> Result<Self, ConfigError> {
        goal.validate()?;
        let constraint = goal.parsed_constraint()?;
        Ok(Self {
            simulation,
            specs,
            project,
            goal,
            constraint,
            timeout: DEFAULT_EVALUATION_TIMEOUT,
            cache: FitnessCache::new(),
            stop: StopHandle::new(),
        })
    }

    /// Set the per-simulation timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Share the engine's stop flag so evaluations requested after a stop are refused.
    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    pub fn cache(&self) -> &FitnessCache {
        &self.cache
    }

    /// Apply, simulate, transform, and check the constraint.
    async fn compute(&self, design: &Design) -> Result<CachedFitness, EvaluationError> {
        let config = self.project.with_design(design, &self.specs)?;

        let output = tokio::time::timeout(self.timeout, self.simulation.simulate(&config))
            .await
            .map_err(|_| EvaluationError::Timeout(self.timeout))??;

        if !output.value.is_finite() {
            return Err(EvaluationError::NonFinite);
        }

        let mut score = self.goal.score(output.value);

        if let Some(constraint) = &self.constraint {
            match output.metric(&constraint.metric, &self.goal.goal_id) {
                Some(metric) if constraint.is_satisfied_by(metric) => {}
                Some(metric) => {
                    log::debug!(
                        "Design {} violates '{}' ({} = {})",
                        design,
                        constraint,
                        constraint.metric,
                        metric
                    );
                    score = f64::NEG_INFINITY;
                }
                None => {
                    log::warn!(
                        "Simulation did not report '{}' needed by constraint '{}'",
                        constraint.metric,
                        constraint
                    );
                    score = f64::NEG_INFINITY;
                }
            }
        }

        Ok(CachedFitness {
            score,
            value: output.value,
            unit: output.unit,
        })
    }
}

#[async_trait]
impl<S: Simulation> FitnessFunction for FitnessPipeline<S> {
    async fn evaluate(&self, design: &Design) -> Result<EvaluatedDesign, EvaluationError> {
        if self.stop.is_stopped() {
            return Err(EvaluationError::Cancelled);
        }

        let key = design.key();
        let cell = self.cache.cell(&key);
        if let Some(cached) = cell.get() {
            self.cache.hits.fetch_add(1, Ordering::Relaxed);
            log::debug!("Cache hit for {}", design);
            return Ok(cached.to_evaluated(design));
        }

        let simulated = AtomicBool::new(false);
        let result = cell
            .get_or_try_init(|| async {
                simulated.store(true, Ordering::Relaxed);
                self.cache.misses.fetch_add(1, Ordering::Relaxed);
                self.compute(design).await
            })
            .await;

        match result {
            Ok(cached) => {
                if simulated.load(Ordering::Relaxed) {
                    log::info!(
                        "Evaluated {}: {} {} (fitness {})",
                        design,
                        cached.value,
                        cached.unit,
                        cached.score
                    );
                } else {
                    self.cache.hits.fetch_add(1, Ordering::Relaxed);
                }
                Ok(cached.to_evaluated(design))
            }
            Err(e) => {
                log::warn!("Evaluation of {} failed: {}", design, e);
                self.cache.forget_failed(&key);
                Ok(EvaluatedDesign::failed(design.clone()))
            }
        }
    }
}
