use crate::error::{Result, SweepError};
use crate::worker::WorkerCommand;
use std::io::{self, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const READ_CHUNK: usize = 8192;

#[derive(Debug, Clone, Default)]
pub struct CommandExecutor {
    timeout: Option<Duration>,
}

impl CommandExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn execute(
        &self,
        cmd: &WorkerCommand,
        console: &mut dyn Write,
        mut log: Option<&mut dyn Write>,
    ) -> Result<()> {
        let command_line = cmd.display();
        let banner = format!("\n$ {}\n\n", command_line);
        console.write_all(banner.as_bytes())?;
        console.flush()?;
        if let Some(log) = log.as_deref_mut() {
            log.write_all(banner.as_bytes())?;
            log.flush()?;
        }

        // One pipe for stdout and stderr. `command` owns the parent's write
        // ends and must be dropped before reading, or EOF never arrives.
        let (output, output_writer) = io::pipe()?;
        let mut child = {
            let mut command = Command::new(&cmd.program);
            command
                .args(&cmd.args)
                .envs(&cmd.env)
                .stdin(Stdio::null())
                .stdout(output_writer.try_clone()?)
                .stderr(output_writer);
            command.spawn().map_err(|source| SweepError::Spawn {
                program: cmd.program.clone(),
                source,
            })?
        };
        tracing::debug!(pid = child.id(), command = %command_line, "worker started");

        let (tx, rx) = mpsc::channel::<String>();
        spawn_line_reader(output, tx);

        let deadline = self.timeout.map(|t| Instant::now() + t);
        let pumped = pump_lines(&rx, deadline, console, log);
        let status = match pumped {
            Ok(()) => wait_with_deadline(&mut child, deadline)?,
            Err(PumpError::TimedOut) => None,
            Err(PumpError::Io(e)) => {
                kill_quietly(&mut child);
                return Err(e.into());
            }
        };
        let Some(status) = status else {
            kill_quietly(&mut child);
            let secs = self.timeout.map(|t| t.as_secs()).unwrap_or_default();
            tracing::warn!(secs, command = %command_line, "worker timed out, killed");
            return Err(SweepError::WorkerTimedOut {
                secs,
                command: command_line,
            });
        };
        tracing::info!(code = ?status.code(), "worker exited");
        if !status.success() {
            return Err(SweepError::WorkerFailed {
                code: status.code(),
                command: command_line,
            });
        }
        Ok(())
    }
}

enum PumpError {
    TimedOut,
    Io(std::io::Error),
}

impl From<std::io::Error> for PumpError {
    fn from(e: std::io::Error) -> Self {
        PumpError::Io(e)
    }
}

fn pump_lines(
    rx: &Receiver<String>,
    deadline: Option<Instant>,
    console: &mut dyn Write,
    mut log: Option<&mut dyn Write>,
) -> std::result::Result<(), PumpError> {
    loop {
        let line = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match rx.recv_timeout(remaining) {
                    Ok(line) => line,
                    Err(RecvTimeoutError::Timeout) => return Err(PumpError::TimedOut),
                    Err(RecvTimeoutError::Disconnected) => return Ok(()),
                }
            }
            None => match rx.recv() {
                Ok(line) => line,
                Err(_) => return Ok(()),
            },
        };
        console.write_all(line.as_bytes())?;
        console.flush()?;
        if let Some(log) = log.as_deref_mut() {
            log.write_all(line.as_bytes())?;
            log.flush()?;
        }
    }
}

fn spawn_line_reader<R: Read + Send + 'static>(mut pipe: R, tx: Sender<String>) {
    thread::spawn(move || {
        let mut splitter = LineSplitter::default();
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let n = match pipe.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            };
            for line in splitter.feed(&chunk[..n]) {
                if tx.send(line).is_err() {
                    return;
                }
            }
        }
        if let Some(rest) = splitter.finish() {
            let _ = tx.send(rest);
        }
    });
}

// A bare `\r` ends a line like `\n`; `\r\n` counts once. Emitted lines end
// in `\n` except a trailing remainder at EOF.
#[derive(Debug, Default)]
struct LineSplitter {
    pending: Vec<u8>,
    after_cr: bool,
}

impl LineSplitter {
    fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in bytes {
            if std::mem::take(&mut self.after_cr) && b == b'\n' {
                continue;
            }
            match b {
                b'\n' | b'\r' => {
                    self.after_cr = b == b'\r';
                    self.pending.push(b'\n');
                    lines.push(String::from_utf8_lossy(&self.pending).into_owned());
                    self.pending.clear();
                }
                _ => self.pending.push(b),
            }
        }
        lines
    }

    fn finish(self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&self.pending).into_owned())
        }
    }
}

fn wait_with_deadline(child: &mut Child, deadline: Option<Instant>) -> Result<Option<ExitStatus>> {
    let Some(deadline) = deadline else {
        return Ok(Some(child.wait()?));
    };
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(EXIT_POLL_INTERVAL);
    }
}

fn kill_quietly(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}
