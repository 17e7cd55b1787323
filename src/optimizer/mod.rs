//! Design-space optimization.
//!
//! Searches a small mixed continuous/discrete parameter space for the design
//! that best meets a goal, where each evaluation is an external simulation
//! taking seconds to minutes.
//!
//! # Overview
//!
//! - **Operators** (`operators`): Random designs, tournament selection, crossover, mutation
//! - **Engine** (`engine`): Steady-state genetic algorithm with elitist insert-and-cull
//! - **Fitness** (`fitness`): Simulation-backed scoring with goal transform, constraint and cache
//! - **Checkpoint** (`checkpoint`): JSON persistence of optimizer state for resume
//! - **Session** (`session`): One campaign owning engine, cache and checkpoint store
//!
//! # Example
//!
//! ```rust,no_run
//! use daylight_optimizer::optimizer::{
//!     CheckpointStore, OptimizationSession, OptimizerProgress, RunMode,
//! };
//! use daylight_optimizer::schema::OptimizationConfig;
//! use daylight_optimizer::simulation::CommandSimulation;
//!
//! # async fn example(config: OptimizationConfig) -> Result<(), Box<dyn std::error::Error>> {
//! let simulation = CommandSimulation::new(&config.simulation, std::path::Path::new("."));
//! let mut session = OptimizationSession::new(&config, simulation, CheckpointStore::new("."))?;
//!
//! let summary = session
//!     .run(RunMode::Fresh, &mut |p: &OptimizerProgress<'_>| {
//!         let best = p.best_design.fitness;
//!         println!("{}/{}: best {:.3}", p.evaluations_completed, p.max_evaluations, best);
//!     })
//!     .await?;
//! println!("Best: {:?}", summary.best);
//! # Ok(())
//! # }
//! ```

mod checkpoint;
mod engine;
mod fitness;
mod operators;
mod session;

pub use checkpoint::{CHECKPOINT_FILE, CheckpointError, CheckpointStore};
pub use engine::{
    CHILDREN_PER_ITERATION, GeneticOptimizer, OptimizerProgress, ProgressCallback, StopHandle,
};
pub use fitness::{
    CacheStats, CachedFitness, DEFAULT_EVALUATION_TIMEOUT, EvaluationError, FitnessCache,
    FitnessFunction, FitnessPipeline,
};
pub use operators::{DesignRng, TOURNAMENT_SIZE};
pub use session::{
    OptimizationSession, RunGuard, RunMode, RunSlot, RunSummary, SessionError, StopReason,
};
