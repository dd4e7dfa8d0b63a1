use crate::error::{Result, SweepError};
use crate::grid::GridSpec;
use crate::worker::{default_worker_command, AdapterParams, JobPaths, Mode, RetrievalParams};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SweepConfig {
    pub paths: JobPaths,
    pub retrieval: RetrievalParams,
    pub adapter: AdapterParams,
    pub grid: GridSpec,
    pub modes: Option<Vec<Mode>>,
    pub results_tag: Option<String>,
    pub worker: Vec<String>,
    pub timeout_secs: Option<u64>,
    pub stage_artifacts: bool,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            paths: JobPaths::default(),
            retrieval: RetrievalParams::default(),
            adapter: AdapterParams::default(),
            grid: GridSpec::default(),
            modes: None,
            results_tag: None,
            worker: default_worker_command(),
            timeout_secs: None,
            stage_artifacts: false,
        }
    }
}

impl SweepConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_yaml_str(&raw).map_err(|e| SweepError::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    pub fn from_yaml_str(raw: &str) -> std::result::Result<Self, serde_yaml::Error> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw)
    }

    // The parametric sweep only ever ran the IVF baseline.
    pub fn effective_modes(&self) -> Vec<Mode> {
        match &self.modes {
            Some(modes) => modes.clone(),
            None => match self.grid {
                GridSpec::Fixed => vec![Mode::IvfAdapter, Mode::DualAdapter],
                GridSpec::Parametric { .. } => vec![Mode::IvfAdapter],
            },
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| SweepError::Config {
            path: "<config>".into(),
            message: message.to_string(),
        };
        if self.worker.is_empty() || self.worker[0].trim().is_empty() {
            return Err(invalid("worker command must not be empty"));
        }
        if self.effective_modes().is_empty() {
            return Err(invalid("at least one mode is required"));
        }
        if self.timeout_secs == Some(0) {
            return Err(invalid("timeout_secs must be > 0"));
        }
        Ok(())
    }
}
