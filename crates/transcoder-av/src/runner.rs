//! Supervised ffmpeg execution.
//!
//! The runner spawns the codec process, follows its `-progress` output on a
//! reader thread, keeps the tail of stderr for error reports, and kills the
//! process once the configured timeout elapses.

use crate::command::FfmpegCommand;
use crate::progress::{FfmpegProgress, ProgressParser};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{BufRead, BufReader};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const STDERR_TAIL_LINES: usize = 20;
const DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

/// Event delivered to the caller while the process runs.
#[derive(Debug)]
pub enum RunEvent<'a> {
    /// ffmpeg closed a progress block.
    Progress(&'a FfmpegProgress),
    /// A poll interval elapsed without new progress.
    Tick,
}

/// Runs [`FfmpegCommand`]s with a timeout.
#[derive(Debug, Clone)]
pub struct FfmpegRunner {
    program: PathBuf,
    timeout: Option<Duration>,
    poll_interval: Duration,
}

impl FfmpegRunner {
    /// Create a runner for the ffmpeg executable at `program`.
    pub fn new(program: impl AsRef<Path>) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            timeout: None,
            poll_interval: Duration::from_millis(250),
        }
    }

    /// Kill the process once it has run for `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// How often [`RunEvent::Tick`] fires while no progress arrives.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(10));
        self
    }

    fn tool_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }

    /// Run `cmd` to completion, calling `on_event` for progress and ticks.
    ///
    /// Returning [`ControlFlow::Break`] from `on_event` kills the process.
    ///
    /// # Errors
    ///
    /// [`Error::ToolNotFound`] if the executable is missing,
    /// [`Error::ToolFailed`] on a non-zero exit (with the stderr tail),
    /// [`Error::Timeout`] if the process was killed for running too long,
    /// [`Error::Aborted`] if `on_event` stopped the run.
    pub fn run<F>(&self, cmd: &FfmpegCommand, mut on_event: F) -> Result<()>
    where
        F: FnMut(RunEvent<'_>) -> ControlFlow<String>,
    {
        let tool = self.tool_name();
        let args = cmd.build_args();

        #[cfg(feature = "tracing")]
        tracing::debug!(program = %self.program.display(), ?args, "spawning codec process");

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::tool_not_found(self.program.display().to_string())
                } else {
                    Error::Io(e)
                }
            })?;

        let (tx, rx) = mpsc::channel::<FfmpegProgress>();
        if let Some(stdout) = child.stdout.take() {
            thread::spawn(move || {
                let mut parser = ProgressParser::new();
                for line in BufReader::new(stdout).lines().map_while(|l| l.ok()) {
                    if let Some(progress) = parser.feed(&line) {
                        if tx.send(progress).is_err() {
                            break;
                        }
                    }
                }
            });
        }

        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let (stderr_done_tx, stderr_done_rx) = mpsc::channel::<()>();
        if let Some(stderr) = child.stderr.take() {
            let tail = Arc::clone(&stderr_tail);
            thread::spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(|l| l.ok()) {
                    let mut tail = tail.lock();
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                let _ = stderr_done_tx.send(());
            });
        }

        let started = Instant::now();
        let mut stdout_open = true;

        loop {
            let flow = if stdout_open {
                match rx.recv_timeout(self.poll_interval) {
                    Ok(progress) => on_event(RunEvent::Progress(&progress)),
                    Err(RecvTimeoutError::Timeout) => on_event(RunEvent::Tick),
                    Err(RecvTimeoutError::Disconnected) => {
                        stdout_open = false;
                        ControlFlow::Continue(())
                    }
                }
            } else {
                thread::sleep(self.poll_interval);
                on_event(RunEvent::Tick)
            };

            if let ControlFlow::Break(reason) = flow {
                #[cfg(feature = "tracing")]
                tracing::warn!(program = %self.program.display(), %reason, "codec run aborted, killing");
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::Aborted { tool, reason });
            }

            if let Some(status) = child.try_wait()? {
                while let Ok(progress) = rx.recv_timeout(DRAIN_TIMEOUT) {
                    if let ControlFlow::Break(reason) = on_event(RunEvent::Progress(&progress)) {
                        return Err(Error::Aborted { tool, reason });
                    }
                }

                if status.success() {
                    return Ok(());
                }

                let _ = stderr_done_rx.recv_timeout(DRAIN_TIMEOUT);
                let tail: Vec<String> = stderr_tail.lock().iter().cloned().collect();
                let message = if tail.is_empty() {
                    format!("exited with {}", status)
                } else {
                    format!("exited with {}: {}", status, tail.join(" | "))
                };
                return Err(Error::tool_failed(tool, message));
            }

            if let Some(timeout) = self.timeout {
                let elapsed = started.elapsed();
                if elapsed >= timeout {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        program = %self.program.display(),
                        elapsed_secs = elapsed.as_secs(),
                        "codec process exceeded its timeout, killing"
                    );
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(Error::Timeout { tool, elapsed });
                }
            }
        }
    }
}
