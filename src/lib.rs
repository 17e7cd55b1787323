//! Daylight Optimizer - Design-space search over simulated building performance.
//!
//! This crate searches up to three design parameters (continuous or discrete)
//! of a building project for the combination that maximizes, minimizes, or
//! hits a target value of a simulated performance metric, using a
//! steady-state genetic algorithm with caching and checkpoint/resume.
//!
//! # Architecture
//!
//! The crate is split into three main modules:
//!
//! - `schema`: Parameter domains, designs, project and run configuration
//! - `simulation`: Interface to the external simulation that scores a design
//! - `optimizer`: Genetic engine, fitness pipeline, checkpoints and sessions
//!
//! # Example
//!
//! ```rust,no_run
//! use daylight_optimizer::{
//!     optimizer::{CheckpointStore, OptimizationSession, OptimizerProgress, RunMode},
//!     schema::OptimizationConfig,
//!     simulation::CommandSimulation,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config: OptimizationConfig =
//!     serde_json::from_str(&std::fs::read_to_string("optimization.json")?)?;
//! let simulation = CommandSimulation::new(&config.simulation, std::path::Path::new("."));
//! let mut session = OptimizationSession::new(&config, simulation, CheckpointStore::new("."))?;
//!
//! let summary = session
//!     .run(RunMode::Fresh, &mut |_: &OptimizerProgress<'_>| {})
//!     .await?;
//! if let Some(best) = summary.best {
//!     println!("Best design: {} (fitness {})", best.params, best.fitness);
//! }
//! # Ok(())
//! # }
//! ```

pub mod optimizer;
pub mod schema;
pub mod simulation;

// Re-export commonly used types
pub use optimizer::{GeneticOptimizer, OptimizationSession, RunMode, RunSummary};
pub use schema::{Design, EvaluatedDesign, OptimizationConfig, OptimizerState, ParameterSpec};
