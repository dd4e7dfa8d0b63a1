use crate::grid::MsConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const AUTO_SLUG: &str = "auto";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    #[serde(rename = "ivf_fp32_adapter")]
    IvfAdapter,
    #[serde(rename = "dbam_dual_adapter")]
    DualAdapter,
}

impl Mode {
    pub const ALL: [Mode; 2] = [Mode::IvfAdapter, Mode::DualAdapter];

    pub fn worker_id(&self) -> &'static str {
        match self {
            Mode::IvfAdapter => "ivf_fp32_adapter",
            Mode::DualAdapter => "dbam_dual_adapter",
        }
    }

    pub fn artifact_prefix(&self) -> &'static str {
        match self {
            Mode::IvfAdapter => "ivf_adapter",
            Mode::DualAdapter => "dual_adapter",
        }
    }

    pub fn parse(raw: &str) -> Option<Mode> {
        Mode::ALL
            .into_iter()
            .find(|m| m.worker_id() == raw || m.artifact_prefix() == raw)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrievalParams {
    pub bits_sq: u32,
    pub nlist: u32,
    pub select_nprobe: u32,
    pub k2_fixed: u32,
    pub kfinal: Vec<u32>,
    pub alphas: String,
}

impl Default for RetrievalParams {
    fn default() -> Self {
        Self {
            bits_sq: 4,
            nlist: 1024,
            select_nprobe: 64,
            k2_fixed: 1000,
            kfinal: vec![10, 25, 50, 100],
            alphas: "2,2,2".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdapterParams {
    pub tau: f64,
    pub beta: f64,
    pub cands: u32,
    pub teacher: String,
    pub lr: f64,
    pub epochs: u32,
    pub subset: u32,
    pub q_batch: u32,
    pub slug: String,
}

impl Default for AdapterParams {
    fn default() -> Self {
        Self {
            tau: 0.5,
            beta: 6.0,
            cands: 2048,
            teacher: "cos".to_string(),
            lr: 5e-4,
            epochs: 5,
            subset: 50000,
            q_batch: 64,
            slug: AUTO_SLUG.to_string(),
        }
    }
}

impl AdapterParams {
    pub fn resolved_slug(&self) -> String {
        if self.slug != AUTO_SLUG {
            return self.slug.clone();
        }
        format!(
            "tau{}_b{}_c{}_{}_lr{}_e{}_s{}",
            format_float(self.tau),
            format_float(self.beta),
            self.cands,
            self.teacher,
            format_float(self.lr),
            self.epochs,
            self.subset
        )
        .replace('.', "")
    }
}

/// Renders a float the way the worker's own CLI prints it: shortest
/// round-trip digits, a trailing `.0` on integral values, and exponent form
/// with a signed two-digit exponent outside `[1e-4, 1e16)`.
pub fn format_float(value: f64) -> String {
    if !value.is_finite() {
        return if value.is_nan() {
            "nan".to_string()
        } else if value > 0.0 {
            "inf".to_string()
        } else {
            "-inf".to_string()
        };
    }
    let magnitude = value.abs();
    if magnitude != 0.0 && !(1e-4..1e16).contains(&magnitude) {
        let sci = format!("{:e}", value);
        let (mantissa, exp) = sci.split_once('e').unwrap_or((sci.as_str(), "0"));
        let (sign, digits) = match exp.strip_prefix('-') {
            Some(d) => ('-', d),
            None => ('+', exp),
        };
        return format!("{}e{}{:0>2}", mantissa, sign, digits);
    }
    let plain = format!("{}", value);
    if plain.contains('.') {
        plain
    } else {
        format!("{}.0", plain)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JobPaths {
    pub dataset: String,
    pub work_dir: PathBuf,
    pub data_root: PathBuf,
    pub run_root: PathBuf,
}

impl Default for JobPaths {
    fn default() -> Self {
        Self {
            dataset: "beir_nq".to_string(),
            work_dir: PathBuf::from("/mnt/work"),
            data_root: PathBuf::from("/mnt/work/datasets"),
            run_root: PathBuf::from("/mnt/work/runs/m_sweep"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn flag(self, name: &str, value: impl ToString) -> Self {
        self.arg(format!("--{}", name)).arg(value.to_string())
    }

    pub fn display(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|p| shell_quote(p))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:,=+".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerEnv {
    vars: BTreeMap<String, String>,
}

impl WorkerEnv {
    pub fn from_ambient(paths: &JobPaths) -> Self {
        Self::from_vars(std::env::vars(), paths)
    }

    pub fn from_vars(vars: impl IntoIterator<Item = (String, String)>, paths: &JobPaths) -> Self {
        let mut vars: BTreeMap<String, String> = vars.into_iter().collect();
        let mut set_default = |key: &str, value: String| {
            vars.entry(key.to_string()).or_insert(value);
        };
        set_default("WORK_DIR", paths.work_dir.display().to_string());
        set_default("DATA_ROOT", paths.data_root.display().to_string());
        set_default("RUN_ROOT", paths.run_root.display().to_string());
        set_default("OMP_NUM_THREADS", "8".to_string());
        set_default("MKL_NUM_THREADS", "8".to_string());
        vars.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());
        Self { vars }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }
}

#[derive(Debug, Clone)]
pub struct WorkerTemplate {
    pub command: Vec<String>,
    pub paths: JobPaths,
    pub retrieval: RetrievalParams,
    pub adapter: AdapterParams,
    pub env: WorkerEnv,
}

impl WorkerTemplate {
    pub fn build(&self, config: &MsConfig, mode: Mode, out_csv: &Path) -> WorkerCommand {
        let (program, base_args) = match self.command.split_first() {
            Some((program, rest)) => (program.clone(), rest.to_vec()),
            None => (String::new(), Vec::new()),
        };
        let mut cmd = WorkerCommand::new(program);
        cmd.args = base_args;
        cmd.env = self.env.vars().clone();

        let r = &self.retrieval;
        let a = &self.adapter;
        let mut cmd = cmd
            .flag("dataset", &self.paths.dataset)
            .flag("work_dir", self.paths.work_dir.display())
            .flag("data_root", self.paths.data_root.display())
            .flag("run_root", self.paths.run_root.display())
            .flag("bits_sq", r.bits_sq)
            .flag("nlist", r.nlist)
            .flag("select_nprobe", r.select_nprobe)
            .flag("k2_fixed", r.k2_fixed);
        if !r.kfinal.is_empty() {
            cmd = cmd.arg("--kfinal");
            for k in &r.kfinal {
                cmd = cmd.arg(k.to_string());
            }
        }
        cmd.flag("ms_infer", config.ms_infer())
            .flag("alphas", &r.alphas)
            .flag("tau", format_float(a.tau))
            .flag("beta", format_float(a.beta))
            .flag("cands", a.cands)
            .flag("teacher", &a.teacher)
            .flag("lr", format_float(a.lr))
            .flag("epochs", a.epochs)
            .flag("subset", a.subset)
            .flag("q_batch", a.q_batch)
            .flag("slug", a.resolved_slug())
            .flag("mode", mode.worker_id())
            .flag("out_csv", out_csv.display())
    }
}

pub fn default_worker_command() -> Vec<String> {
    vec!["python".to_string(), "-u".to_string(), "nq_cli.py".to_string()]
}
