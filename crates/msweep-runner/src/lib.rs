pub mod config;
pub mod error;
pub mod executor;
pub mod grid;
pub mod rundir;
pub mod sweep;
pub mod worker;

pub use config::SweepConfig;
pub use error::{Result, SweepError};
pub use executor::CommandExecutor;
pub use grid::{fixed_grid, parametric_grid, select_group, GridSpec, MsConfig, GROUP_SIZE};
pub use rundir::{resolve_tag, RunDir, RunLog};
pub use sweep::{PlannedRun, SweepJob, SweepOutcome};
pub use worker::{
    format_float, AdapterParams, JobPaths, Mode, RetrievalParams, WorkerCommand, WorkerEnv,
    WorkerTemplate,
};
