//! Daylight Optimizer CLI - Run a design-space search from JSON configuration.

use std::fs;
use std::path::{Path, PathBuf};

use daylight_optimizer::{
    optimizer::{CheckpointStore, OptimizationSession, OptimizerProgress, RunMode, StopReason},
    schema::OptimizationConfig,
    simulation::CommandSimulation,
};
use serde_json::json;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: {} <config.json> [--resume | --fresh]", args[0]);
        eprintln!();
        eprintln!("Search a building design space by repeated simulation.");
        eprintln!();
        eprintln!("Arguments:");
        eprintln!("  config.json  Path to optimization configuration file");
        eprintln!("  --resume     Continue from the stored checkpoint (fails if there is none)");
        eprintln!("  --fresh      Discard any stored checkpoint and start over");
        eprintln!();
        eprintln!("Without a flag, a stored checkpoint is resumed if present.");
        eprintln!("Example configuration is generated with --example flag.");
        std::process::exit(1);
    }

    if args[1] == "--example" {
        print_example_config();
        return;
    }

    let config_path = PathBuf::from(&args[1]);
    let flag = args.get(2).map(String::as_str);

    // Load configuration
    let config_str = fs::read_to_string(&config_path).unwrap_or_else(|e| {
        eprintln!("Error reading config file: {}", e);
        std::process::exit(1);
    });

    let config: OptimizationConfig = serde_json::from_str(&config_str).unwrap_or_else(|e| {
        eprintln!("Error parsing config: {}", e);
        std::process::exit(1);
    });

    let base_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .to_path_buf();
    let checkpoint_dir = match &config.checkpoint_dir {
        Some(dir) if dir.is_relative() => base_dir.join(dir),
        Some(dir) => dir.clone(),
        None => base_dir.clone(),
    };
    let store = CheckpointStore::new(&checkpoint_dir);

    let mode = match flag {
        Some("--resume") => RunMode::Resume,
        Some("--fresh") => RunMode::Fresh,
        None if store.exists() => RunMode::Resume,
        None => RunMode::Fresh,
        Some(other) => {
            eprintln!("Unknown option: {}", other);
            std::process::exit(1);
        }
    };

    let simulation = CommandSimulation::new(&config.simulation, &base_dir);
    let mut session = OptimizationSession::new(&config, simulation, store).unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    });

    println!("Daylight Optimizer");
    println!("==================");
    println!(
        "Parameters: {}",
        session
            .engine()
            .parameters()
            .iter()
            .map(|p| p.id.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!("Goal: {:?} {}", config.goal.goal_type, config.goal.goal_id);
    println!(
        "Population: {}, budget: {} evaluations",
        config.optimizer.population_size, config.optimizer.max_evaluations
    );
    println!("Checkpoint: {}", session.checkpoint_store().path().display());
    println!("Mode: {:?}", mode);
    println!();

    let stop = session.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Stop requested, finishing in-flight evaluations...");
            stop.stop();
        }
    });

    let mut report = |p: &OptimizerProgress<'_>| {
        println!(
            "  {}/{}: best fitness {:.4} ({} {}) at {}",
            p.evaluations_completed,
            p.max_evaluations,
            p.best_design.fitness,
            p.best_design.metric_value,
            p.best_design.unit,
            p.best_design.params
        );
    };

    let summary = match session.run(mode, &mut report).await {
        Ok(summary) => summary,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    println!();
    match summary.stop_reason {
        StopReason::Budget => println!("Budget exhausted."),
        StopReason::Cancelled => println!("Stopped; run again with --resume to continue."),
    }
    println!(
        "Evaluations: {} ({} simulated, {} cached)",
        summary.evaluations_completed, summary.cache_misses, summary.cache_hits
    );
    println!("Time: {:.1}s", summary.elapsed_seconds);

    match &summary.best {
        Some(best) if best.is_feasible() => {
            println!("Best design: {}", best.params);
            println!("  {} = {} {}", config.goal.goal_id, best.metric_value, best.unit);
            println!("  fitness = {}", best.fitness);
        }
        Some(_) => println!("No design satisfied the goal's constraint."),
        None => println!("No design was evaluated."),
    }
}

fn print_example_config() {
    let example = json!({
        "parameters": [
            {"name": "overhang_depth", "type": "continuous", "min": 0.0, "max": 2.0, "step": 0.1,
             "target": "/shading/overhang_depth"},
            {"name": "glazing", "type": "discrete", "options": ["clear", "low-e", "tinted"],
             "target": "/envelope/glazing"}
        ],
        "goal": {"goal_id": "sDA", "goal_type": "maximize", "constraint": "ase < 10"},
        "optimizer": {"population_size": 10, "max_evaluations": 50, "mutation_rate": 0.1},
        "evaluation": {"timeout_seconds": 600},
        "project": {"name": "office-south", "shading": {}, "envelope": {"wwr": 0.4}},
        "simulation": {"program": "run-daylight", "args": ["--config", "{config}"]}
    });

    match serde_json::from_value::<OptimizationConfig>(example)
        .and_then(|config| serde_json::to_string_pretty(&config))
    {
        Ok(text) => {
            println!("Example configuration (optimization.json):");
            println!("{}", text);
        }
        Err(e) => {
            eprintln!("Error building example config: {}", e);
            std::process::exit(1);
        }
    }
}
