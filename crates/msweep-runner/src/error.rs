use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error("no valid m2 values from s2_values '{raw}'; must be a subset of 1,2,4,8,16,32")]
    EmptySweepList { raw: String },

    #[error("invalid m13 {value}; must be one of 1,2,4,8,16,32")]
    InvalidM13 { value: u32 },

    #[error("group {group} has no configs to run (grid size={grid_size})")]
    EmptyGroup { group: usize, grid_size: usize },

    #[error("command failed ({}): {command}", exit_label(.code))]
    WorkerFailed { code: Option<i32>, command: String },

    #[error("command timed out after {secs}s: {command}")]
    WorkerTimedOut { secs: u64, command: String },

    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {message}")]
    Config { path: PathBuf, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SweepError {
    pub fn code(&self) -> &'static str {
        match self {
            SweepError::EmptySweepList { .. } => "empty_sweep_list",
            SweepError::InvalidM13 { .. } => "invalid_m13",
            SweepError::EmptyGroup { .. } => "empty_group",
            SweepError::WorkerFailed { .. } => "worker_failed",
            SweepError::WorkerTimedOut { .. } => "worker_timed_out",
            SweepError::Spawn { .. } => "spawn_failed",
            SweepError::Config { .. } => "invalid_config",
            SweepError::Io(_) => "io_error",
        }
    }

    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            SweepError::EmptySweepList { .. }
                | SweepError::InvalidM13 { .. }
                | SweepError::EmptyGroup { .. }
                | SweepError::Config { .. }
        )
    }
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(c) => c.to_string(),
        None => "signal".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, SweepError>;
