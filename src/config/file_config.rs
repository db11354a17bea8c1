use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_path: Option<String>,
    pub metrics_port: Option<u16>,
    pub show_web_view: Option<bool>,

    // Feature configs
    pub execution: Option<ExecutionFileConfig>,
    pub runner: Option<RunnerConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct ExecutionFileConfig {
    pub concurrent_operations_different_brokers: Option<usize>,
    pub concurrent_operations_on_manual_scans: Option<usize>,
    pub interval_between_same_broker_operations_secs: Option<u64>,
    pub activity_scheduler_trigger_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct RunnerConfig {
    /// Program executed once per scan/opt-out item.
    pub command: Option<String>,
    pub args: Vec<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
