//! Simulation backed by an external process.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::process::Command;

use crate::schema::{ProjectConfig, SimulationCommandConfig};

use super::{Simulation, SimulationError, SimulationOutput};

/// Placeholder replaced with the applied configuration path.
const CONFIG_PLACEHOLDER: &str = "{config}";

/// Maximum number of stderr characters kept in an error message.
const STDERR_TAIL: usize = 2000;

/// Runs a configured program once per evaluation.
///
/// The applied project configuration is written to a JSON file in the
/// working directory and its path substituted for `{config}` in the
/// arguments. The program reports its result on stdout, either as a bare
/// number or as a JSON object `{"value": .., "unit": .., "metrics": {..}}`.
/// The child process is killed if the evaluation future is dropped, so a
/// pipeline-level timeout also terminates the external run.
pub struct CommandSimulation {
    program: String,
    args: Vec<String>,
    working_dir: PathBuf,
    next_run: AtomicU64,
}

impl CommandSimulation {
    /// Create from configuration; `default_dir` is used when no working
    /// directory is configured.
    pub fn new(config: &SimulationCommandConfig, default_dir: &Path) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            working_dir: config
                .working_dir
                .clone()
                .unwrap_or_else(|| default_dir.to_path_buf()),
            next_run: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl Simulation for CommandSimulation {
    async fn simulate(&self, config: &ProjectConfig) -> Result<SimulationOutput, SimulationError> {
        if !self.working_dir.is_dir() {
            return Err(SimulationError::MissingFile(self.working_dir.clone()));
        }

        let run = self.next_run.fetch_add(1, Ordering::Relaxed);
        let config_path = self
            .working_dir
            .join(format!("optimizer-design-{}-{:05}.json", std::process::id(), run));
        let json = serde_json::to_vec_pretty(config.as_value()).map_err(std::io::Error::from)?;
        tokio::fs::write(&config_path, json).await?;

        let path_str = config_path.to_string_lossy();
        let args: Vec<String> = self
            .args
            .iter()
            .map(|arg| arg.replace(CONFIG_PLACEHOLDER, &path_str))
            .collect();

        log::debug!("Running {} {:?}", self.program, args);
        let result = Command::new(&self.program)
            .args(&args)
            .current_dir(&self.working_dir)
            .kill_on_drop(true)
            .output()
            .await;

        if let Err(e) = tokio::fs::remove_file(&config_path).await {
            log::debug!("Could not remove {}: {}", config_path.display(), e);
        }

        let output = result.map_err(|source| SimulationError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let skip = stderr.chars().count().saturating_sub(STDERR_TAIL);
            return Err(SimulationError::Exit {
                status: output.status.to_string(),
                stderr: stderr.chars().skip(skip).collect::<String>().trim().to_string(),
            });
        }

        parse_output(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Parse simulation stdout.
///
/// Accepts a bare number or a JSON result object. Programs that log before
/// reporting are supported by falling back to the last non-empty line.
pub fn parse_output(stdout: &str) -> Result<SimulationOutput, SimulationError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Err(SimulationError::EmptyOutput);
    }

    let parse = |text: &str| -> Option<SimulationOutput> {
        if let Ok(value) = text.parse::<f64>() {
            return Some(SimulationOutput::new(value, ""));
        }
        serde_json::from_str(text).ok()
    };

    if let Some(output) = parse(trimmed) {
        return Ok(output);
    }

    let last_line = trimmed.lines().rev().map(str::trim).find(|l| !l.is_empty());
    last_line
        .and_then(parse)
        .ok_or_else(|| SimulationError::Parse(last_line.unwrap_or(trimmed).to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_parse_bare_number() {
        let output = parse_output("  42.5\n").unwrap();
        assert_eq!(output.value, 42.5);
        assert_eq!(output.unit, "");
    }

    #[test]
    fn test_parse_json_after_log_lines() {
        let stdout = concat!(
            "loading scene...\n",
            "rendering 4 views\n",
            r#"{"value": 61.0, "unit": "%", "metrics": {"glare": 0.31}}"#,
            "\n",
        );
        let output = parse_output(stdout).unwrap();
        assert_eq!(output.value, 61.0);
        assert_eq!(output.unit, "%");
        assert_eq!(output.metrics["glare"], 0.31);
    }

    #[test]
    fn test_parse_failures() {
        assert!(matches!(parse_output(" \n"), Err(SimulationError::EmptyOutput)));
        assert!(matches!(
            parse_output("done\nno result"),
            Err(SimulationError::Parse(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_reads_applied_config() {
        let dir = tempdir().unwrap();
        let config = SimulationCommandConfig {
            program: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                "grep -q '\"depth\": 1.5' \"$1\" && echo '{\"value\": 1.5, \"unit\": \"m\"}'"
                    .to_string(),
                "sh".to_string(),
                "{config}".to_string(),
            ],
            working_dir: None,
        };
        let sim = CommandSimulation::new(&config, dir.path());

        let output = sim
            .simulate(&ProjectConfig::new(json!({"depth": 1.5})))
            .await
            .unwrap();
        assert_eq!(output.value, 1.5);
        assert_eq!(output.unit, "m");

        // Temporary configuration files are cleaned up.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_nonzero_exit() {
        let dir = tempdir().unwrap();
        let config = SimulationCommandConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "echo boom >&2; exit 3".to_string()],
            working_dir: None,
        };
        let sim = CommandSimulation::new(&config, dir.path());

        match sim.simulate(&ProjectConfig::default()).await {
            Err(SimulationError::Exit { stderr, .. }) => assert_eq!(stderr, "boom"),
            other => panic!("expected exit error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_command_missing_program() {
        let dir = tempdir().unwrap();
        let config = SimulationCommandConfig {
            program: "/nonexistent/daylight-sim".to_string(),
            args: vec![],
            working_dir: None,
        };
        let sim = CommandSimulation::new(&config, dir.path());
        assert!(matches!(
            sim.simulate(&ProjectConfig::default()).await,
            Err(SimulationError::Spawn { .. })
        ));
    }

    #[tokio::test]
    async fn test_command_missing_working_dir() {
        let config = SimulationCommandConfig {
            program: "sh".to_string(),
            args: vec![],
            working_dir: Some(PathBuf::from("/nonexistent/optimizer-work")),
        };
        let sim = CommandSimulation::new(&config, Path::new("."));
        assert!(matches!(
            sim.simulate(&ProjectConfig::default()).await,
            Err(SimulationError::MissingFile(_))
        ));
    }
}
