use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use msweep_runner::{GridSpec, Mode, SweepConfig, SweepError, SweepJob};
use serde_json::{json, Value};
use std::io::Write;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "msweep", version, about = "Grouped m1/m2/m3 sweeps over an external worker")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    #[value(name = "ivf_fp32_adapter", alias = "ivf_adapter")]
    IvfAdapter,
    #[value(name = "dbam_dual_adapter", alias = "dual_adapter")]
    DualAdapter,
}

impl From<ModeArg> for Mode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::IvfAdapter => Mode::IvfAdapter,
            ModeArg::DualAdapter => Mode::DualAdapter,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run this group's configurations, skipping finished ones.
    Run {
        #[command(flatten)]
        sweep: SweepArgs,
        #[arg(long)]
        json: bool,
    },
    /// Show what `run` would do without spawning anything.
    Plan {
        #[command(flatten)]
        sweep: SweepArgs,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug)]
struct SweepArgs {
    /// YAML file with defaults; flags given here override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// 0-based group index; each group runs up to 4 (m1,m2,m3) configs.
    #[arg(long)]
    group: usize,

    #[arg(long)]
    dataset: Option<String>,
    #[arg(long, alias = "work_dir")]
    work_dir: Option<PathBuf>,
    #[arg(long, alias = "data_root")]
    data_root: Option<PathBuf>,
    #[arg(long, alias = "run_root")]
    run_root: Option<PathBuf>,

    #[arg(long, alias = "bits_sq")]
    bits_sq: Option<u32>,
    #[arg(long)]
    nlist: Option<u32>,
    #[arg(long, alias = "select_nprobe")]
    select_nprobe: Option<u32>,
    #[arg(long, alias = "k2_fixed")]
    k2_fixed: Option<u32>,
    /// Final-k cutoffs; pass the flag with no values to omit them.
    #[arg(long, value_delimiter = ',', num_args = 0..)]
    kfinal: Option<Vec<u32>>,
    #[arg(long)]
    alphas: Option<String>,

    #[arg(long)]
    tau: Option<f64>,
    #[arg(long)]
    beta: Option<f64>,
    #[arg(long)]
    cands: Option<u32>,
    #[arg(long)]
    teacher: Option<String>,
    #[arg(long)]
    lr: Option<f64>,
    #[arg(long)]
    epochs: Option<u32>,
    #[arg(long)]
    subset: Option<u32>,
    #[arg(long, alias = "q_batch")]
    q_batch: Option<u32>,
    /// Adapter slug; `auto` derives one from the hyperparameters.
    #[arg(long)]
    slug: Option<String>,

    /// Shared m for stages 1 and 3; selects the parametric grid.
    #[arg(long)]
    m13: Option<u32>,
    /// Comma-separated m2 values to sweep (subset of 1,2,4,8,16,32).
    #[arg(long, alias = "s2_values")]
    s2_values: Option<String>,
    /// Custom tag for this job's results directory.
    #[arg(long, alias = "results_tag")]
    results_tag: Option<String>,
    #[arg(long, value_enum, value_delimiter = ',')]
    modes: Option<Vec<ModeArg>>,
    /// Worker command line, split on whitespace.
    #[arg(long)]
    worker: Option<String>,
    /// Kill a worker that runs longer than this and fail the job.
    #[arg(long)]
    timeout_secs: Option<u64>,
    /// Let the worker write `<csv>.partial` and rename it on success.
    #[arg(long)]
    stage_artifacts: bool,
}

impl SweepArgs {
    fn resolve(self) -> Result<(SweepConfig, usize)> {
        let mut cfg = match &self.config {
            Some(path) => SweepConfig::load(path)?,
            None => SweepConfig::default(),
        };

        if let Some(v) = self.dataset {
            cfg.paths.dataset = v;
        }
        if let Some(v) = self.work_dir {
            cfg.paths.work_dir = v;
        }
        if let Some(v) = self.data_root {
            cfg.paths.data_root = v;
        }
        if let Some(v) = self.run_root {
            cfg.paths.run_root = v;
        }

        if let Some(v) = self.bits_sq {
            cfg.retrieval.bits_sq = v;
        }
        if let Some(v) = self.nlist {
            cfg.retrieval.nlist = v;
        }
        if let Some(v) = self.select_nprobe {
            cfg.retrieval.select_nprobe = v;
        }
        if let Some(v) = self.k2_fixed {
            cfg.retrieval.k2_fixed = v;
        }
        if let Some(v) = self.kfinal {
            cfg.retrieval.kfinal = v;
        }
        if let Some(v) = self.alphas {
            cfg.retrieval.alphas = v;
        }

        if let Some(v) = self.tau {
            cfg.adapter.tau = v;
        }
        if let Some(v) = self.beta {
            cfg.adapter.beta = v;
        }
        if let Some(v) = self.cands {
            cfg.adapter.cands = v;
        }
        if let Some(v) = self.teacher {
            cfg.adapter.teacher = v;
        }
        if let Some(v) = self.lr {
            cfg.adapter.lr = v;
        }
        if let Some(v) = self.epochs {
            cfg.adapter.epochs = v;
        }
        if let Some(v) = self.subset {
            cfg.adapter.subset = v;
        }
        if let Some(v) = self.q_batch {
            cfg.adapter.q_batch = v;
        }
        if let Some(v) = self.slug {
            cfg.adapter.slug = v;
        }

        cfg.grid = merge_grid(cfg.grid, self.m13, self.s2_values)?;

        if let Some(v) = self.results_tag {
            cfg.results_tag = Some(v);
        }
        if let Some(v) = self.modes {
            cfg.modes = Some(v.into_iter().map(Mode::from).collect());
        }
        if let Some(v) = self.worker {
            cfg.worker = v.split_whitespace().map(str::to_string).collect();
        }
        if let Some(v) = self.timeout_secs {
            cfg.timeout_secs = Some(v);
        }
        if self.stage_artifacts {
            cfg.stage_artifacts = true;
        }

        Ok((cfg, self.group))
    }
}

fn merge_grid(current: GridSpec, m13: Option<u32>, s2_values: Option<String>) -> Result<GridSpec> {
    match (current, m13, s2_values) {
        (GridSpec::Parametric { s2_values, .. }, Some(m13), None) => {
            Ok(GridSpec::Parametric { m13, s2_values })
        }
        (GridSpec::Fixed, Some(m13), None) => Ok(GridSpec::Parametric {
            m13,
            s2_values: msweep_runner::grid::DEFAULT_S2_VALUES.to_string(),
        }),
        (_, Some(m13), Some(s2_values)) => Ok(GridSpec::Parametric { m13, s2_values }),
        (GridSpec::Parametric { m13, .. }, None, Some(s2_values)) => {
            Ok(GridSpec::Parametric { m13, s2_values })
        }
        (GridSpec::Fixed, None, Some(_)) => Err(anyhow!("--s2-values requires --m13")),
        (grid, None, None) => Ok(grid),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                let code = err
                    .downcast_ref::<SweepError>()
                    .map(SweepError::code)
                    .unwrap_or("command_failed");
                emit_json(&json_error(code, err.to_string(), error_details(&err)));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run { sweep, json } => {
            let (config, group) = sweep.resolve()?;
            tracing::debug!(?config, group, "resolved sweep config");
            let job = SweepJob::from_ambient(&config, group)?;
            // Worker output keeps stdout free for the JSON payload.
            let outcome = if json {
                job.run(&mut std::io::stderr().lock())?
            } else {
                job.run(&mut std::io::stdout().lock())?
            };
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "summary": job_to_json(&job),
                    "outcome": serde_json::to_value(&outcome)?,
                })));
            }
            println!("executed: {}", outcome.executed);
            println!("skipped: {}", outcome.skipped);
            println!("results_dir: {}", outcome.results_dir.display());
            println!("log: {}", outcome.log_path.display());
        }
        Commands::Plan { sweep, json } => {
            let (config, group) = sweep.resolve()?;
            tracing::debug!(?config, group, "resolved sweep config");
            let job = SweepJob::from_ambient(&config, group)?;
            let plan = job.plan();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "plan",
                    "summary": job_to_json(&job),
                    "runs": serde_json::to_value(&plan)?,
                })));
            }
            print_summary(&job);
            let mut out = std::io::stdout().lock();
            for run in &plan {
                writeln!(
                    out,
                    "{} {} {} -> {}",
                    if run.skip { "skip" } else { "run " },
                    run.mode.worker_id(),
                    run.tag,
                    run.artifact.display()
                )?;
            }
        }
    }
    Ok(None)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn error_details(err: &anyhow::Error) -> Value {
    match err.downcast_ref::<SweepError>() {
        Some(SweepError::WorkerFailed { code, command }) => {
            json!({ "exit_code": code, "command": command })
        }
        Some(SweepError::WorkerTimedOut { secs, command }) => {
            json!({ "timeout_secs": secs, "command": command })
        }
        Some(SweepError::EmptyGroup { group, grid_size }) => {
            json!({ "group": group, "grid_size": grid_size })
        }
        Some(SweepError::EmptySweepList { raw }) => json!({ "s2_values": raw }),
        _ => json!({}),
    }
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. } | Commands::Plan { json, .. } => *json,
    }
}

fn job_to_json(job: &SweepJob) -> Value {
    json!({
        "grid": job.grid,
        "group": job.group,
        "configs": job.configs.iter().map(|c| c.tag()).collect::<Vec<_>>(),
        "modes": job.modes,
        "tag": job.run_dir.tag,
        "results_dir": job.run_dir.results_dir.display().to_string(),
        "log": job.run_dir.log_path().display().to_string(),
        "slug": job.slug(),
    })
}

fn print_summary(job: &SweepJob) {
    println!("grid: {}", job.grid.label());
    if let GridSpec::Parametric { m13, s2_values } = &job.grid {
        println!("m13: {}", m13);
        println!("s2_values: {}", s2_values);
    }
    println!("group: {}", job.group);
    println!(
        "configs: {}",
        job.configs
            .iter()
            .map(|c| c.tag())
            .collect::<Vec<_>>()
            .join(" ")
    );
    println!(
        "modes: {}",
        job.modes
            .iter()
            .map(|m| m.worker_id())
            .collect::<Vec<_>>()
            .join(" ")
    );
    println!("slug: {}", job.slug());
    println!("results_dir: {}", job.run_dir.results_dir.display());
}
