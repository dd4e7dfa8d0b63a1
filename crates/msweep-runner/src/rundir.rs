use crate::error::Result;
use crate::grid::{GridSpec, MsConfig};
use crate::worker::Mode;
use chrono::{DateTime, Local};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

pub fn resolve_tag(
    override_tag: Option<&str>,
    grid: &GridSpec,
    group: usize,
    now: DateTime<Local>,
) -> String {
    if let Some(tag) = override_tag.map(str::trim).filter(|t| !t.is_empty()) {
        return tag.to_string();
    }
    let ts = now.format(TIMESTAMP_FORMAT);
    match grid {
        GridSpec::Fixed => format!("g{}_{}", group, ts),
        GridSpec::Parametric { m13, .. } => format!("m13{}_g{}_{}", m13, group, ts),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDir {
    pub run_root: PathBuf,
    pub tag: String,
    pub results_dir: PathBuf,
}

impl RunDir {
    pub fn layout(run_root: &Path, tag: &str) -> Self {
        Self {
            run_root: run_root.to_path_buf(),
            tag: tag.to_string(),
            results_dir: run_root.join("results").join(tag),
        }
    }

    pub fn create(run_root: &Path, tag: &str) -> Result<Self> {
        let dir = Self::layout(run_root, tag);
        fs::create_dir_all(&dir.run_root)?;
        fs::create_dir_all(&dir.results_dir)?;
        tracing::debug!(results_dir = %dir.results_dir.display(), "results dir ready");
        Ok(dir)
    }

    pub fn log_path(&self) -> PathBuf {
        self.results_dir.join(format!("m_sweep_{}.log", self.tag))
    }

    pub fn artifact_path(&self, mode: Mode, config: &MsConfig) -> PathBuf {
        self.results_dir
            .join(format!("{}_{}.csv", mode.artifact_prefix(), config.tag()))
    }

    pub fn open_log(&self) -> Result<RunLog> {
        RunLog::open(&self.log_path(), &self.tag)
    }
}

/// Append-only job log. Every write is flushed so the file can be tailed
/// while a worker is running.
#[derive(Debug)]
pub struct RunLog {
    path: PathBuf,
    file: File,
}

impl RunLog {
    pub fn open(path: &Path, tag: &str) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut log = Self {
            path: path.to_path_buf(),
            file,
        };
        writeln!(log, "# M-sweep {}", tag)?;
        log.flush()?;
        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn note(&mut self, text: &str) -> io::Result<()> {
        self.file.write_all(text.as_bytes())?;
        self.file.flush()
    }
}

impl Write for RunLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}
