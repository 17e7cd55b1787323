//! One optimization campaign: engine, fitness cache, and checkpoint store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex, PoisonError};
use std::time::Instant;

use async_trait::async_trait;

use crate::schema::{ConfigError, EvaluatedDesign, OptimizationConfig};
use crate::simulation::Simulation;

use super::checkpoint::{CheckpointError, CheckpointStore};
use super::engine::{GeneticOptimizer, OptimizerProgress, ProgressCallback, StopHandle};
use super::fitness::{CacheStats, FitnessPipeline};

/// Session-level errors surfaced to the caller.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Another optimization run is already in progress")]
    AlreadyRunning,
    #[error("No checkpoint to resume from at {0}")]
    NoCheckpoint(PathBuf),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Process-wide run slots, one per checkpoint location.
static CHECKPOINT_SLOTS: LazyLock<Mutex<HashMap<PathBuf, RunSlot>>> =
    LazyLock::new(Default::default);

/// Shared guard allowing at most one active run among the sessions holding it.
#[derive(Debug, Clone, Default)]
pub struct RunSlot(Arc<AtomicBool>);

impl RunSlot {
    /// A slot of its own, shared only with its clones.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide slot guarding the checkpoint at `path`.
    ///
    /// Every call with the same location returns the same slot.
    pub fn for_checkpoint(path: &Path) -> Self {
        let key = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
        let mut slots = CHECKPOINT_SLOTS
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        slots.entry(key).or_default().clone()
    }

    /// Claim the slot; released when the returned guard is dropped.
    pub fn try_acquire(&self) -> Result<RunGuard, SessionError> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| SessionError::AlreadyRunning)?;
        Ok(RunGuard(Arc::clone(&self.0)))
    }

    pub fn is_busy(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Holds a [`RunSlot`] until dropped.
#[derive(Debug)]
pub struct RunGuard(Arc<AtomicBool>);

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// How a run starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Discard previous progress, the fitness cache, and any stored checkpoint.
    Fresh,
    /// Continue from the stored checkpoint; fails if there is none.
    Resume,
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Budget,
    Cancelled,
}

/// Outcome of one run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub best: Option<EvaluatedDesign>,
    pub evaluations_completed: usize,
    pub stop_reason: StopReason,
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub elapsed_seconds: f64,
}

/// Saves a checkpoint on every progress report, then forwards it.
struct Checkpointing<'a, P: ?Sized> {
    store: &'a CheckpointStore,
    observer: &'a mut P,
}

#[async_trait]
impl<'a, P> ProgressCallback for Checkpointing<'a, P>
where
    P: ProgressCallback + ?Sized,
{
    async fn report(&mut self, progress: &OptimizerProgress<'_>) {
        if let Err(e) = self.store.save(progress.state).await {
            log::warn!("Continuing without checkpoint: {}", e);
        }
        self.observer.report(progress).await;
    }
}

/// Owns everything one optimization campaign needs.
///
/// Sessions sharing a [`RunSlot`] never run concurrently. By default a session
/// uses the process-wide slot of its checkpoint location, so two sessions can
/// never write the same checkpoint at once.
pub struct OptimizationSession<S> {
    engine: GeneticOptimizer,
    fitness: FitnessPipeline<S>,
    store: CheckpointStore,
    slot: RunSlot,
}

impl<S: Simulation> OptimizationSession<S> {
    /// Build a session from a validated configuration.
    pub fn new(
        config: &OptimizationConfig,
        simulation: S,
        store: CheckpointStore,
    ) -> Result<Self, SessionError> {
        let specs = config.validate()?;
        let engine = GeneticOptimizer::new(config.optimizer.clone(), specs.clone())?;
        let fitness = FitnessPipeline::new(
            simulation,
            specs,
            config.goal.clone(),
            config.project.clone(),
        )?
        .with_timeout(config.evaluation.timeout())
        .with_stop_handle(engine.stop_handle());

        Ok(Self {
            engine,
            fitness,
            slot: RunSlot::for_checkpoint(store.path()),
            store,
        })
    }

    /// Replace the default checkpoint slot with an explicitly shared one.
    pub fn with_run_slot(mut self, slot: RunSlot) -> Self {
        self.slot = slot;
        self
    }

    /// Handle for requesting a cooperative stop of the current run.
    pub fn stop_handle(&self) -> StopHandle {
        self.engine.stop_handle()
    }

    pub fn engine(&self) -> &GeneticOptimizer {
        &self.engine
    }

    pub fn checkpoint_store(&self) -> &CheckpointStore {
        &self.store
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.fitness.cache().stats()
    }

    /// Run until the budget is spent or a stop is requested.
    ///
    /// A checkpoint is written after every progress report; failure to write
    /// one is logged and the run continues.
    pub async fn run<P>(
        &mut self,
        mode: RunMode,
        observer: &mut P,
    ) -> Result<RunSummary, SessionError>
    where
        P: ProgressCallback + ?Sized,
    {
        let _guard = self.slot.try_acquire()?;
        let started = Instant::now();

        match mode {
            RunMode::Fresh => {
                self.engine.reset();
                self.fitness.cache().clear();
                if let Err(e) = self.store.clear().await {
                    log::warn!("Could not remove previous checkpoint: {}", e);
                }
            }
            RunMode::Resume => {
                let state = self
                    .store
                    .load_for(self.engine.parameters())
                    .await?
                    .ok_or_else(|| SessionError::NoCheckpoint(self.store.path().to_path_buf()))?;
                self.engine
                    .load_state(state)
                    .map_err(CheckpointError::Incompatible)?;
                self.engine.stop_handle().reset();
                log::info!(
                    "Resuming from {} ({} evaluations completed)",
                    self.store.path().display(),
                    self.engine.evaluations_completed()
                );
            }
        }

        let mut progress = Checkpointing {
            store: &self.store,
            observer,
        };
        let best = self.engine.run(&self.fitness, &mut progress).await;

        let evaluations_completed = self.engine.evaluations_completed();
        let stop_reason = if evaluations_completed >= self.engine.settings().max_evaluations {
            StopReason::Budget
        } else {
            StopReason::Cancelled
        };
        let stats = self.fitness.cache().stats();

        Ok(RunSummary {
            best,
            evaluations_completed,
            stop_reason,
            cache_hits: stats.hits,
            cache_misses: stats.misses,
            elapsed_seconds: started.elapsed().as_secs_f64(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::fitness::tests::DepthSimulation;
    use crate::schema::StateError;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::tempdir;

    fn config(max_evaluations: usize) -> OptimizationConfig {
        serde_json::from_value(json!({
            "parameters": [
                {"name": "depth", "type": "continuous", "min": 0.1, "max": 2.0, "step": 0.1}
            ],
            "goal": {"goal_id": "depth", "goal_type": "maximize"},
            "optimizer": {
                "population_size": 4,
                "max_evaluations": max_evaluations,
                "random_seed": 77
            },
            "simulation": {"program": "unused"}
        }))
        .unwrap()
    }

    fn session(
        max_evaluations: usize,
        store: CheckpointStore,
    ) -> OptimizationSession<DepthSimulation> {
        OptimizationSession::new(&config(max_evaluations), DepthSimulation::default(), store)
            .unwrap()
    }

    fn quiet() -> impl FnMut(&OptimizerProgress<'_>) + Send {
        |_: &OptimizerProgress<'_>| {}
    }

    #[tokio::test]
    async fn test_fresh_run_writes_checkpoint() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let mut session = session(10, store.clone());

        let mut reported = Vec::new();
        let summary = session
            .run(RunMode::Fresh, &mut |p: &OptimizerProgress<'_>| {
                reported.push(p.evaluations_completed)
            })
            .await
            .unwrap();

        assert_eq!(reported, vec![4, 6, 8, 10]);
        assert_eq!(summary.evaluations_completed, 10);
        assert_eq!(summary.stop_reason, StopReason::Budget);
        assert!(summary.cache_misses <= 10);
        assert_eq!(summary.cache_hits + summary.cache_misses, 10);

        let saved = store.load().await.unwrap().unwrap();
        assert_eq!(saved.evaluations_completed, 10);
        assert_eq!(saved.best_design, summary.best);
    }

    #[tokio::test]
    async fn test_resume_without_checkpoint_fails() {
        let dir = tempdir().unwrap();
        let mut session = session(10, CheckpointStore::new(dir.path()));

        assert!(matches!(
            session.run(RunMode::Resume, &mut quiet()).await,
            Err(SessionError::NoCheckpoint(_))
        ));
    }

    #[tokio::test]
    async fn test_resume_with_corrupt_checkpoint_fails() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        std::fs::write(store.path(), "not json").unwrap();
        let mut session = session(10, store);

        assert!(matches!(
            session.run(RunMode::Resume, &mut quiet()).await,
            Err(SessionError::Checkpoint(CheckpointError::Corrupt { .. }))
        ));

        // A fresh run is still possible.
        let summary = session.run(RunMode::Fresh, &mut quiet()).await.unwrap();
        assert_eq!(summary.evaluations_completed, 10);
    }

    #[tokio::test]
    async fn test_stop_then_resume() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let mut first = session(12, store.clone());

        let stop = first.stop_handle();
        let summary = first
            .run(RunMode::Fresh, &mut |_: &OptimizerProgress<'_>| stop.stop())
            .await
            .unwrap();
        assert_eq!(summary.stop_reason, StopReason::Cancelled);
        assert_eq!(summary.evaluations_completed, 4);
        let saved = store.load().await.unwrap().unwrap();
        assert_eq!(saved.evaluations_completed, 4);

        let mut resumed = session(12, store);
        let summary = resumed.run(RunMode::Resume, &mut quiet()).await.unwrap();
        assert_eq!(summary.stop_reason, StopReason::Budget);
        assert_eq!(summary.evaluations_completed, 12);
    }

    #[tokio::test]
    async fn test_resume_matches_uninterrupted_run() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("split"));
        session(10, store.clone()).run(RunMode::Fresh, &mut quiet()).await.unwrap();
        let resumed = session(20, store).run(RunMode::Resume, &mut quiet()).await.unwrap();

        let mut whole = session(20, CheckpointStore::new(dir.path().join("whole")));
        let uninterrupted = whole.run(RunMode::Fresh, &mut quiet()).await.unwrap();

        assert_eq!(
            resumed.best.map(|b| b.fitness),
            uninterrupted.best.map(|b| b.fitness)
        );
    }

    #[tokio::test]
    async fn test_resume_rejects_other_parameters() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        session(6, store.clone()).run(RunMode::Fresh, &mut quiet()).await.unwrap();

        let mut other = config(6);
        other.parameters[0].name = "width".to_string();
        let mut session =
            OptimizationSession::new(&other, DepthSimulation::default(), store).unwrap();
        assert!(matches!(
            session.run(RunMode::Resume, &mut quiet()).await,
            Err(SessionError::Checkpoint(CheckpointError::Incompatible(
                StateError::MissingParameter(_)
            )))
        ));
    }

    #[tokio::test]
    async fn test_checkpoint_failure_is_not_fatal() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x").unwrap();
        let mut session = session(8, CheckpointStore::new(blocker.join("nested")));

        let summary = session.run(RunMode::Fresh, &mut quiet()).await.unwrap();
        assert_eq!(summary.evaluations_completed, 8);
        assert!(summary.best.is_some());
    }

    #[tokio::test]
    async fn test_single_active_run() {
        let dir = tempdir().unwrap();
        let slot = RunSlot::new();
        let mut session = session(6, CheckpointStore::new(dir.path())).with_run_slot(slot.clone());

        let held = slot.try_acquire().unwrap();
        assert!(slot.is_busy());
        assert!(matches!(
            session.run(RunMode::Fresh, &mut quiet()).await,
            Err(SessionError::AlreadyRunning)
        ));

        drop(held);
        assert!(session.run(RunMode::Fresh, &mut quiet()).await.is_ok());
        assert!(!slot.is_busy());
    }

    #[tokio::test]
    async fn test_sessions_sharing_a_checkpoint_never_overlap() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let slow = || DepthSimulation {
            delay: Some(Duration::from_millis(20)),
            ..Default::default()
        };
        let mut a = OptimizationSession::new(&config(6), slow(), store.clone()).unwrap();
        let mut b = OptimizationSession::new(&config(6), slow(), store.clone()).unwrap();

        let (mut quiet_a, mut quiet_b) = (quiet(), quiet());
        let (ra, rb) = tokio::join!(
            a.run(RunMode::Fresh, &mut quiet_a),
            b.run(RunMode::Fresh, &mut quiet_b)
        );

        let rejected = [&ra, &rb]
            .iter()
            .filter(|r| matches!(r, Err(SessionError::AlreadyRunning)))
            .count();
        assert_eq!(rejected, 1);
        assert!(ra.is_ok() || rb.is_ok());

        // The slot is released once the winning run ends.
        assert!(!RunSlot::for_checkpoint(store.path()).is_busy());
        assert!(b.run(RunMode::Resume, &mut quiet()).await.is_ok());
    }

    #[tokio::test]
    async fn test_sessions_with_separate_checkpoints_run_together() {
        let dir = tempdir().unwrap();
        let slow = || DepthSimulation {
            delay: Some(Duration::from_millis(5)),
            ..Default::default()
        };
        let store_a = CheckpointStore::new(dir.path().join("a"));
        let store_b = CheckpointStore::new(dir.path().join("b"));
        let mut a = OptimizationSession::new(&config(6), slow(), store_a).unwrap();
        let mut b = OptimizationSession::new(&config(6), slow(), store_b).unwrap();

        let (mut quiet_a, mut quiet_b) = (quiet(), quiet());
        let (ra, rb) = tokio::join!(
            a.run(RunMode::Fresh, &mut quiet_a),
            b.run(RunMode::Fresh, &mut quiet_b)
        );
        assert!(ra.is_ok() && rb.is_ok());
    }

    #[test]
    fn test_for_checkpoint_returns_shared_slot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(crate::optimizer::CHECKPOINT_FILE);
        let first = RunSlot::for_checkpoint(&path);
        let _guard = first.try_acquire().unwrap();
        assert!(RunSlot::for_checkpoint(&path).is_busy());
        assert!(!RunSlot::for_checkpoint(&dir.path().join("other.json")).is_busy());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let dir = tempdir().unwrap();
        let mut bad = config(10);
        bad.optimizer.population_size = 1;
        let store = CheckpointStore::new(dir.path());
        assert!(matches!(
            OptimizationSession::new(&bad, DepthSimulation::default(), store),
            Err(SessionError::Config(_))
        ));
    }
}
