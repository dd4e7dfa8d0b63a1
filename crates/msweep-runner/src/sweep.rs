use crate::config::SweepConfig;
use crate::error::Result;
use crate::executor::CommandExecutor;
use crate::grid::{select_group, GridSpec, MsConfig, GROUP_SIZE};
use crate::rundir::{resolve_tag, RunDir, RunLog};
use crate::worker::{Mode, WorkerEnv, WorkerTemplate};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedRun {
    pub config: MsConfig,
    pub tag: String,
    pub mode: Mode,
    pub artifact: PathBuf,
    pub skip: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepOutcome {
    pub tag: String,
    pub results_dir: PathBuf,
    pub log_path: PathBuf,
    pub executed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone)]
pub struct SweepJob {
    pub group: usize,
    pub grid: GridSpec,
    pub configs: Vec<MsConfig>,
    pub modes: Vec<Mode>,
    pub run_dir: RunDir,
    template: WorkerTemplate,
    executor: CommandExecutor,
    stage_artifacts: bool,
}

impl SweepJob {
    pub fn resolve(
        config: &SweepConfig,
        group: usize,
        now: DateTime<Local>,
        env: WorkerEnv,
    ) -> Result<Self> {
        config.validate()?;
        let full_grid = config.grid.build()?;
        let configs = select_group(&full_grid, group, GROUP_SIZE)?.to_vec();
        let tag = resolve_tag(config.results_tag.as_deref(), &config.grid, group, now);
        let run_dir = RunDir::layout(&config.paths.run_root, &tag);
        let template = WorkerTemplate {
            command: config.worker.clone(),
            paths: config.paths.clone(),
            retrieval: config.retrieval.clone(),
            adapter: config.adapter.clone(),
            env,
        };
        Ok(Self {
            group,
            grid: config.grid.clone(),
            configs,
            modes: config.effective_modes(),
            run_dir,
            template,
            executor: CommandExecutor::new().with_timeout(config.timeout()),
            stage_artifacts: config.stage_artifacts,
        })
    }

    pub fn from_ambient(config: &SweepConfig, group: usize) -> Result<Self> {
        let env = WorkerEnv::from_ambient(&config.paths);
        Self::resolve(config, group, Local::now(), env)
    }

    pub fn slug(&self) -> String {
        self.template.adapter.resolved_slug()
    }

    pub fn plan(&self) -> Vec<PlannedRun> {
        self.configs
            .iter()
            .flat_map(|config| {
                self.modes.iter().map(move |&mode| {
                    let artifact = self.run_dir.artifact_path(mode, config);
                    PlannedRun {
                        config: *config,
                        tag: config.tag(),
                        mode,
                        skip: artifact.exists(),
                        artifact,
                    }
                })
            })
            .collect()
    }

    pub fn run(&self, console: &mut dyn Write) -> Result<SweepOutcome> {
        let run_dir = RunDir::create(&self.run_dir.run_root, &self.run_dir.tag)?;
        let mut log = run_dir.open_log()?;
        writeln!(console, "Logging to {}", log.path().display())?;
        console.flush()?;
        tracing::info!(
            group = self.group,
            grid = self.grid.label(),
            configs = self.configs.len(),
            modes = self.modes.len(),
            tag = %run_dir.tag,
            "sweep job started"
        );

        let mut outcome = SweepOutcome {
            tag: run_dir.tag.clone(),
            results_dir: run_dir.results_dir.clone(),
            log_path: log.path().to_path_buf(),
            executed: 0,
            skipped: 0,
        };

        for config in &self.configs {
            let tag = config.tag();
            emit(
                console,
                &mut log,
                &format!("\n==== MS = {} ({}) ====\n", config.ms_infer(), tag),
            )?;

            for &mode in &self.modes {
                let artifact = run_dir.artifact_path(mode, config);
                if artifact.exists() {
                    emit(
                        console,
                        &mut log,
                        &format!("[skip] {} exists\n", artifact.display()),
                    )?;
                    tracing::info!(mode = mode.worker_id(), config = %tag, "artifact exists, skipping");
                    outcome.skipped += 1;
                    continue;
                }
                self.run_pair(config, mode, &artifact, console, &mut log)?;
                outcome.executed += 1;
            }
        }

        emit(
            console,
            &mut log,
            &format!(
                "\nm-sweep group complete.\nResults in: {}\n",
                run_dir.results_dir.display()
            ),
        )?;
        tracing::info!(
            executed = outcome.executed,
            skipped = outcome.skipped,
            "sweep job finished"
        );
        Ok(outcome)
    }

    fn run_pair(
        &self,
        config: &MsConfig,
        mode: Mode,
        artifact: &Path,
        console: &mut dyn Write,
        log: &mut RunLog,
    ) -> Result<()> {
        if !self.stage_artifacts {
            let cmd = self.template.build(config, mode, artifact);
            return self.executor.execute(&cmd, console, Some(log as &mut dyn Write));
        }

        let partial = partial_path(artifact);
        if partial.exists() {
            tracing::warn!(path = %partial.display(), "removing stale partial artifact");
            fs::remove_file(&partial)?;
        }
        let cmd = self.template.build(config, mode, &partial);
        if let Err(err) = self.executor.execute(&cmd, console, Some(&mut *log)) {
            let _ = fs::remove_file(&partial);
            return Err(err);
        }
        if partial.exists() {
            fs::rename(&partial, artifact)?;
            tracing::debug!(path = %artifact.display(), "artifact promoted");
        } else {
            tracing::warn!(
                mode = mode.worker_id(),
                config = %config.tag(),
                "worker succeeded without writing its output"
            );
        }
        Ok(())
    }
}

fn partial_path(artifact: &Path) -> PathBuf {
    let mut name = artifact.as_os_str().to_os_string();
    name.push(".partial");
    PathBuf::from(name)
}

fn emit(console: &mut dyn Write, log: &mut RunLog, text: &str) -> io::Result<()> {
    console.write_all(text.as_bytes())?;
    console.flush()?;
    log.note(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SweepError;
    use crate::worker::JobPaths;
    use tempfile::TempDir;

    const FAKE_WORKER: &str = r#"
out=""; mode=""; ms=""
while [ $# -gt 0 ]; do
  case "$1" in
    --out_csv) out="$2"; shift ;;
    --mode) mode="$2"; shift ;;
    --ms_infer) ms="$2"; shift ;;
  esac
  shift
done
echo "$mode $ms $out" >> "$CALLS"
echo "evaluating $mode $ms"
if [ "$mode $ms" = "$FAIL_ON" ]; then
  if [ -n "$WRITE_BEFORE_FAIL" ]; then echo "partial" > "$out"; fi
  echo "boom" 1>&2
  exit 1
fi
echo "metric,value" > "$out"
"#;

    struct Fixture {
        tmp: TempDir,
        config: SweepConfig,
        write_before_fail: bool,
    }

    impl Fixture {
        fn new(grid: GridSpec) -> Self {
            let tmp = tempfile::tempdir().expect("tempdir");
            let config = SweepConfig {
                paths: JobPaths {
                    run_root: tmp.path().join("runs"),
                    ..JobPaths::default()
                },
                grid,
                results_tag: Some("fixture".to_string()),
                worker: vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    FAKE_WORKER.to_string(),
                    "fake-worker".to_string(),
                ],
                ..SweepConfig::default()
            };
            Self {
                tmp,
                config,
                write_before_fail: false,
            }
        }

        fn calls_path(&self) -> PathBuf {
            self.tmp.path().join("calls.txt")
        }

        fn job(&self, group: usize, fail_on: &str) -> SweepJob {
            let env = WorkerEnv::from_vars(
                vec![
                    ("CALLS".to_string(), self.calls_path().display().to_string()),
                    ("FAIL_ON".to_string(), fail_on.to_string()),
                    (
                        "WRITE_BEFORE_FAIL".to_string(),
                        if self.write_before_fail { "1" } else { "" }.to_string(),
                    ),
                ],
                &self.config.paths,
            );
            SweepJob::resolve(&self.config, group, Local::now(), env).expect("resolve")
        }

        fn calls(&self) -> Vec<String> {
            fs::read_to_string(self.calls_path())
                .unwrap_or_default()
                .lines()
                .map(|l| {
                    let mut parts = l.splitn(3, ' ');
                    format!(
                        "{} {}",
                        parts.next().unwrap_or_default(),
                        parts.next().unwrap_or_default()
                    )
                })
                .collect()
        }
    }

    #[test]
    fn fixed_group_zero_runs_both_modes_in_order() {
        let fx = Fixture::new(GridSpec::Fixed);
        let job = fx.job(0, "");
        let mut console: Vec<u8> = Vec::new();
        let outcome = job.run(&mut console).expect("run");

        assert_eq!(outcome.executed, 8);
        assert_eq!(outcome.skipped, 0);
        assert_eq!(
            fx.calls(),
            vec![
                "ivf_fp32_adapter 1,1,1",
                "dbam_dual_adapter 1,1,1",
                "ivf_fp32_adapter 1,2,1",
                "dbam_dual_adapter 1,2,1",
                "ivf_fp32_adapter 1,4,1",
                "dbam_dual_adapter 1,4,1",
                "ivf_fp32_adapter 1,8,1",
                "dbam_dual_adapter 1,8,1",
            ]
        );
        for plan in job.plan() {
            assert!(plan.skip, "{} should exist", plan.artifact.display());
        }

        let log = fs::read_to_string(&outcome.log_path).expect("log");
        assert!(log.starts_with("# M-sweep fixture\n"), "{log}");
        assert!(log.contains("==== MS = 1,4,1 (m1-4-1) ===="));
        assert!(log.contains("evaluating dbam_dual_adapter 1,8,1"));
        let console = String::from_utf8_lossy(&console);
        assert!(console.contains("\n==== MS = 1,4,1 (m1-4-1) ====\n"), "{console}");
        assert!(console.contains("m-sweep group complete."));
        assert!(!log.contains("## Config"));
    }

    #[test]
    fn second_run_with_same_tag_skips_everything() {
        let fx = Fixture::new(GridSpec::Fixed);
        fx.job(1, "").run(&mut io::sink()).expect("first run");
        let calls_after_first = fx.calls().len();
        assert_eq!(calls_after_first, 8);

        let mut console: Vec<u8> = Vec::new();
        let outcome = fx.job(1, "").run(&mut console).expect("second run");
        assert_eq!(outcome.executed, 0);
        assert_eq!(outcome.skipped, 8);
        assert_eq!(fx.calls().len(), calls_after_first);

        let console = String::from_utf8_lossy(&console);
        assert_eq!(console.matches("[skip] ").count(), 8);
        let log = fs::read_to_string(&outcome.log_path).expect("log");
        assert_eq!(log.matches("[skip] ").count(), 8);
        assert_eq!(log.matches("# M-sweep fixture").count(), 2);
    }

    #[test]
    fn worker_failure_aborts_before_next_pair() {
        let fx = Fixture::new(GridSpec::Fixed);
        let job = fx.job(0, "dbam_dual_adapter 1,2,1");
        let err = job.run(&mut io::sink()).expect_err("should fail");
        match &err {
            SweepError::WorkerFailed { code, command } => {
                assert_eq!(*code, Some(1));
                assert!(command.contains("--ms_infer 1,2,1"), "{command}");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(
            fx.calls(),
            vec![
                "ivf_fp32_adapter 1,1,1",
                "dbam_dual_adapter 1,1,1",
                "ivf_fp32_adapter 1,2,1",
                "dbam_dual_adapter 1,2,1",
            ]
        );
        let skips: Vec<bool> = job.plan().iter().map(|p| p.skip).collect();
        assert_eq!(skips, vec![true, true, true, false, false, false, false, false]);
    }

    #[test]
    fn staged_artifacts_are_promoted_only_on_success() {
        let mut fx = Fixture::new(GridSpec::Fixed);
        fx.config.stage_artifacts = true;
        fx.write_before_fail = true;
        let job = fx.job(0, "dbam_dual_adapter 1,2,1");
        job.run(&mut io::sink()).expect_err("should fail");

        let plan = job.plan();
        let skips: Vec<bool> = plan.iter().map(|p| p.skip).collect();
        assert_eq!(skips, vec![true, true, true, false, false, false, false, false]);
        let failed = &plan[3];
        assert!(!partial_path(&failed.artifact).exists());

        let recorded = fs::read_to_string(fx.calls_path()).expect("calls");
        assert!(recorded
            .lines()
            .all(|l| l.ends_with(".csv.partial")), "{recorded}");
    }

    #[test]
    fn parametric_grid_defaults_to_baseline_mode_only() {
        let fx = Fixture::new(GridSpec::Parametric {
            m13: 4,
            s2_values: "1,4,8,99,abc,16,32".to_string(),
        });
        let outcome = fx.job(1, "").run(&mut io::sink()).expect("run");
        assert_eq!(outcome.executed, 1);
        assert_eq!(fx.calls(), vec!["ivf_fp32_adapter 4,32,4"]);
        assert!(outcome
            .results_dir
            .join("ivf_adapter_m4-32-4.csv")
            .exists());
    }

    #[test]
    fn out_of_range_group_fails_before_creating_anything() {
        let fx = Fixture::new(GridSpec::Fixed);
        let env = WorkerEnv::from_vars(Vec::new(), &fx.config.paths);
        let err = SweepJob::resolve(&fx.config, 4, Local::now(), env).expect_err("should fail");
        assert!(err.is_configuration_error());
        assert!(err.to_string().contains("group 4"));
        assert!(!fx.config.paths.run_root.exists());
    }

    #[test]
    fn plan_marks_only_existing_artifacts() {
        let fx = Fixture::new(GridSpec::Fixed);
        let job = fx.job(2, "");
        fs::create_dir_all(&job.run_dir.results_dir).expect("mkdir");
        let done = job.run_dir.artifact_path(Mode::DualAdapter, &MsConfig::new(4, 2, 4));
        fs::write(&done, "x").expect("write");

        let plan = job.plan();
        assert_eq!(plan.len(), 8);
        let skipped: Vec<_> = plan.iter().filter(|p| p.skip).collect();
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].artifact, done);
        assert_eq!(plan[0].tag, "m4-1-4");
        assert_eq!(plan[0].mode, Mode::IvfAdapter);

        let outcome = job.run(&mut io::sink()).expect("run");
        assert_eq!(outcome.executed, 7);
        assert_eq!(outcome.skipped, 1);
    }
}
