//! Steady-state genetic optimizer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::future::join_all;

use crate::schema::{
    ConfigError, Design, EvaluatedDesign, OptimizerSettings, OptimizerState, ParameterSpec,
    StateError,
};

use super::fitness::{EvaluationError, FitnessFunction};
use super::operators::DesignRng;

/// Children produced per steady-state iteration.
pub const CHILDREN_PER_ITERATION: usize = 2;

/// Cooperative cancellation flag shared by the engine and its fitness function.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop; in-flight evaluations are allowed to finish.
    pub fn stop(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub(crate) fn reset(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

/// Progress report handed to a [`ProgressCallback`].
#[derive(Debug, Clone, Copy)]
pub struct OptimizerProgress<'a> {
    /// Evaluations consumed so far.
    pub evaluations_completed: usize,
    /// Evaluation budget of the run.
    pub max_evaluations: usize,
    /// Current best design.
    pub best_design: &'a EvaluatedDesign,
    /// Full state, for checkpointing.
    pub state: &'a OptimizerState,
}

/// Receives progress after bootstrap and after every steady-state iteration.
///
/// The engine awaits each report before continuing, so reports never overlap.
#[async_trait]
pub trait ProgressCallback: Send {
    async fn report(&mut self, progress: &OptimizerProgress<'_>);
}

#[async_trait]
impl<F> ProgressCallback for F
where
    F: for<'a> FnMut(&OptimizerProgress<'a>) + Send,
{
    async fn report(&mut self, progress: &OptimizerProgress<'_>) {
        self(progress)
    }
}

/// Genetic optimizer with elitist steady-state replacement.
///
/// Bootstraps a random population, then repeatedly breeds two children from
/// tournament-selected parents, evaluates them concurrently, and keeps the
/// best `population_size` designs of the merged set.
pub struct GeneticOptimizer {
    settings: OptimizerSettings,
    specs: Vec<ParameterSpec>,
    state: OptimizerState,
    stop: StopHandle,
}

impl GeneticOptimizer {
    /// Create a new optimizer.
    pub fn new(
        settings: OptimizerSettings,
        specs: Vec<ParameterSpec>,
    ) -> Result<Self, ConfigError> {
        settings.validate()?;
        if specs.is_empty() {
            return Err(ConfigError::NoParameters);
        }
        if specs.len() > crate::schema::MAX_PARAMETERS {
            return Err(ConfigError::TooManyParameters {
                count: specs.len(),
                max: crate::schema::MAX_PARAMETERS,
            });
        }

        let state = OptimizerState {
            random_seed: Some(settings.random_seed.unwrap_or_else(rand::random)),
            ..Default::default()
        };

        Ok(Self {
            settings,
            specs,
            state,
            stop: StopHandle::new(),
        })
    }

    /// Get cancellation handle.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Request a cooperative stop.
    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn settings(&self) -> &OptimizerSettings {
        &self.settings
    }

    pub fn parameters(&self) -> &[ParameterSpec] {
        &self.specs
    }

    pub fn evaluations_completed(&self) -> usize {
        self.state.evaluations_completed
    }

    pub fn best_design(&self) -> Option<&EvaluatedDesign> {
        self.state.best_design.as_ref()
    }

    fn run_seed(&self) -> u64 {
        self.state.random_seed.unwrap_or_default()
    }

    /// Discard all progress and start over with a fresh seed (unless one is configured).
    pub fn reset(&mut self) {
        self.state = OptimizerState {
            random_seed: Some(self.settings.random_seed.unwrap_or_else(rand::random)),
            ..Default::default()
        };
        self.stop.reset();
    }

    /// Deep copy of the current state.
    pub fn get_state(&self) -> OptimizerState {
        self.state.clone()
    }

    /// Replace the current state with a restored one.
    ///
    /// Every design must match the parameter domain of this optimizer.
    pub fn load_state(&mut self, state: OptimizerState) -> Result<(), StateError> {
        let mut state = state;
        for entry in state.population.iter().chain(state.best_design.iter()) {
            entry.params.conforms_to(&self.specs)?;
        }
        if state.evaluations_completed > 0 && state.population.is_empty() {
            return Err(StateError::EmptyPopulation(state.evaluations_completed));
        }

        sort_by_fitness(&mut state.population);
        state.population.truncate(self.settings.population_size);
        state.best_design = state.population.first().cloned();
        if state.random_seed.is_none() {
            state.random_seed = Some(rand::random());
        }

        self.state = state;
        Ok(())
    }

    /// Produce `population_size` random designs (not yet evaluated).
    pub fn initialize_population(&self, rng: &mut DesignRng) -> Vec<Design> {
        (0..self.settings.population_size)
            .map(|_| rng.random_design(&self.specs))
            .collect()
    }

    /// Breed one child: `mutate(crossover(a, b))`.
    fn breed(&self, rng: &mut DesignRng, a: &Design, b: &Design) -> Design {
        let child = rng.crossover(a, b, &self.specs);
        rng.mutate(&child, self.settings.mutation_rate, &self.specs)
    }

    /// Evaluate designs concurrently. Returns `None` if any evaluation was cancelled.
    async fn evaluate_all<F>(&self, fitness: &F, designs: &[Design]) -> Option<Vec<EvaluatedDesign>>
    where
        F: FitnessFunction + ?Sized,
    {
        let results = join_all(designs.iter().map(|d| fitness.evaluate(d))).await;

        let mut evaluated = Vec::with_capacity(results.len());
        for (design, result) in designs.iter().zip(results) {
            match result {
                Ok(e) => evaluated.push(e),
                Err(EvaluationError::Cancelled) => return None,
                Err(e) => {
                    log::warn!("Evaluation of {} failed: {}", design, e);
                    evaluated.push(EvaluatedDesign::failed(design.clone()));
                }
            }
        }
        Some(evaluated)
    }

    /// Evaluate a fresh random population.
    async fn bootstrap<F>(&mut self, fitness: &F) -> bool
    where
        F: FitnessFunction + ?Sized,
    {
        let mut rng = DesignRng::for_step(self.run_seed(), 0);
        let designs = self.initialize_population(&mut rng);

        log::info!("Evaluating initial population of {}", designs.len());
        let Some(mut population) = self.evaluate_all(fitness, &designs).await else {
            return false;
        };

        sort_by_fitness(&mut population);
        self.state.best_design = population.first().cloned();
        self.state.population = population;
        self.state.evaluations_completed = self.settings.population_size;
        true
    }

    /// One steady-state iteration: select, breed two children, evaluate, insert-and-cull.
    async fn step<F>(&mut self, fitness: &F) -> bool
    where
        F: FitnessFunction + ?Sized,
    {
        let mut rng = DesignRng::for_step(self.run_seed(), self.state.evaluations_completed);
        let population = &self.state.population;

        // Both pairs come from the same snapshot of the population.
        let (Some(a1), Some(b1), Some(a2), Some(b2)) = (
            rng.select_index(population),
            rng.select_index(population),
            rng.select_index(population),
            rng.select_index(population),
        ) else {
            return false;
        };

        let children = [
            self.breed(&mut rng, &population[a1].params, &population[b1].params),
            self.breed(&mut rng, &population[b2].params, &population[a2].params),
        ];

        let Some(evaluated) = self.evaluate_all(fitness, &children).await else {
            return false;
        };

        let population = &mut self.state.population;
        population.extend(evaluated);
        sort_by_fitness(population);
        population.truncate(self.settings.population_size);

        self.state.best_design = population.first().cloned();
        self.state.evaluations_completed += CHILDREN_PER_ITERATION;
        true
    }

    async fn report<P>(&self, progress: &mut P)
    where
        P: ProgressCallback + ?Sized,
    {
        if let Some(best) = &self.state.best_design {
            progress
                .report(&OptimizerProgress {
                    evaluations_completed: self.state.evaluations_completed,
                    max_evaluations: self.settings.max_evaluations,
                    best_design: best,
                    state: &self.state,
                })
                .await;
        }
    }

    /// Run until the evaluation budget is spent or a stop is requested.
    ///
    /// Resumes from restored state if evaluations were already completed.
    /// Returns the best design found, or `None` if stopped before bootstrap
    /// completed.
    pub async fn run<F, P>(&mut self, fitness: &F, progress: &mut P) -> Option<EvaluatedDesign>
    where
        F: FitnessFunction + ?Sized,
        P: ProgressCallback + ?Sized,
    {
        if self.state.evaluations_completed == 0 {
            if self.stop.is_stopped() || !self.bootstrap(fitness).await {
                log::info!("Stopped before the initial population was evaluated");
                return self.state.best_design.clone();
            }
            self.report(progress).await;
        } else {
            log::info!(
                "Resuming at {}/{} evaluations",
                self.state.evaluations_completed,
                self.settings.max_evaluations
            );
        }

        while self.state.evaluations_completed < self.settings.max_evaluations
            && !self.stop.is_stopped()
        {
            if !self.step(fitness).await {
                break;
            }
            if let Some(best) = &self.state.best_design {
                log::info!(
                    "Evaluations {}/{}: best fitness {} ({})",
                    self.state.evaluations_completed,
                    self.settings.max_evaluations,
                    best.fitness,
                    best.params
                );
            }
            self.report(progress).await;
        }

        self.state.best_design.clone()
    }
}

/// Sort best-first. Stable, so incumbents win ties against newcomers.
fn sort_by_fitness(population: &mut [EvaluatedDesign]) {
    population.sort_by(|a, b| b.fitness.total_cmp(&a.fitness));
}
