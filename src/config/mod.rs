mod file_config;

pub use file_config::{ExecutionFileConfig, FileConfig, RunnerConfig};

use crate::queue::OperationType;
use anyhow::{bail, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Limits and pacing applied to queue batches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionConfig {
    /// Concurrent broker jobs for scheduled runs and opt-outs.
    pub concurrent_operations_different_brokers: usize,
    /// Concurrent broker jobs for user-initiated scans.
    pub concurrent_operations_on_manual_scans: usize,
    /// Pause between two operations run for the same broker.
    pub interval_between_same_broker_operations: Duration,
    /// How often the background agent requests a scheduled run.
    pub activity_scheduler_trigger_interval: Duration,
}

impl ExecutionConfig {
    /// Maximum number of broker jobs running at once for the given operation type.
    pub fn concurrent_operations_for(&self, operation_type: OperationType) -> usize {
        match operation_type {
            OperationType::ManualScan => self.concurrent_operations_on_manual_scans,
            OperationType::All
            | OperationType::OptOut
            | OperationType::Scan
            | OperationType::ScheduledScan => self.concurrent_operations_different_brokers,
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            concurrent_operations_different_brokers: 2,
            concurrent_operations_on_manual_scans: 6,
            interval_between_same_broker_operations: Duration::from_secs(2),
            activity_scheduler_trigger_interval: Duration::from_secs(20 * 60), // 20 minutes
        }
    }
}

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_path: Option<PathBuf>,
    pub metrics_port: Option<u16>,
    pub show_web_view: bool,
    pub runner_command: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub db_path: PathBuf,
    pub metrics_port: Option<u16>,
    pub show_web_view: bool,
    pub execution: ExecutionConfig,
    pub runner_command: String,
    pub runner_args: Vec<String>,
}

impl AgentConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_path = file
            .db_path
            .map(PathBuf::from)
            .or_else(|| cli.db_path.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_path must be specified via --db-path or in config file")
            })?;

        if db_path.is_dir() {
            bail!("db_path is a directory: {:?}", db_path);
        }

        let metrics_port = file.metrics_port.or(cli.metrics_port);
        let show_web_view = file.show_web_view.unwrap_or(cli.show_web_view);

        // Execution settings - merge file config with defaults
        let exec_file = file.execution.unwrap_or_default();
        let defaults = ExecutionConfig::default();
        let execution = ExecutionConfig {
            concurrent_operations_different_brokers: exec_file
                .concurrent_operations_different_brokers
                .unwrap_or(defaults.concurrent_operations_different_brokers),
            concurrent_operations_on_manual_scans: exec_file
                .concurrent_operations_on_manual_scans
                .unwrap_or(defaults.concurrent_operations_on_manual_scans),
            interval_between_same_broker_operations: exec_file
                .interval_between_same_broker_operations_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.interval_between_same_broker_operations),
            activity_scheduler_trigger_interval: exec_file
                .activity_scheduler_trigger_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.activity_scheduler_trigger_interval),
        };

        if execution.concurrent_operations_different_brokers == 0
            || execution.concurrent_operations_on_manual_scans == 0
        {
            bail!("Concurrency limits must be greater than zero");
        }
        if execution.activity_scheduler_trigger_interval.is_zero() {
            bail!("activity_scheduler_trigger_interval_secs must be greater than zero");
        }

        let runner = file.runner.unwrap_or_default();
        let runner_command = runner
            .command
            .or_else(|| cli.runner_command.clone())
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "runner command must be specified via --runner-command or [runner] in config file"
                )
            })?;

        Ok(Self {
            db_path,
            metrics_port,
            show_web_view,
            execution,
            runner_command,
            runner_args: runner.args,
        })
    }
}
