//! Supervision of one external pipeline process.
//!
//! [`ProcessSupervisor::spawn`] starts the pipeline in its own process group
//! and hands back a [`ConversionProcess`]: a lazy stream of parsed protocol
//! events followed by a single [`ProcessExit`]. The process and the job's temp
//! artifacts are released together on every path out, including drop.

use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use encodeforge_common::{Error, JobId, Result};
use encodeforge_protocol::{ProtocolEvent, ProtocolParser};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::cleanup::TempArtifacts;
use crate::state::Job;

/// How often the group is polled while waiting for stragglers to exit.
const GROUP_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Longest output line kept. The rest of an overlong line is discarded.
pub(crate) const MAX_LINE_BYTES: usize = 64 * 1024;

/// How to launch the pipeline.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Executable to run.
    pub program: PathBuf,
    /// Arguments placed before the source and output paths.
    pub leading_args: Vec<String>,
    /// Exported to the pipeline as `TEMP_DIR`.
    pub temp_dir: PathBuf,
    /// Exported to the pipeline as `PATH`. Nothing else is inherited.
    pub path_env: String,
    /// Additional environment for the pipeline.
    pub extra_env: Vec<(String, String)>,
    /// How long the pipeline gets to clean up after SIGTERM.
    pub termination_grace: Duration,
    /// Most stderr bytes kept (the tail is kept).
    pub stderr_limit: usize,
}

/// How a pipeline run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    Succeeded,
    Failed { message: String },
    Cancelled,
}

/// Final result of a supervised run.
#[derive(Debug, Clone)]
pub struct ProcessExit {
    pub outcome: ExitOutcome,
    pub exit_code: Option<i32>,
    /// Tail of what the pipeline wrote to stderr.
    pub stderr: String,
}

/// Starts pipeline processes.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    config: Arc<SupervisorConfig>,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Start the pipeline for `job`. `cancel` is the job's stop request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Tool`] if the process cannot be started.
    pub fn spawn(&self, job: &Job, cancel: CancellationToken) -> Result<ConversionProcess> {
        let config = &self.config;
        let program = program_name(&config.program);

        let mut cmd = Command::new(&config.program);
        cmd.args(&config.leading_args)
            .arg(&job.source_path)
            .arg(&job.output_path)
            .args(job.settings.pipeline_args())
            .env_clear()
            .env("TEMP_DIR", &config.temp_dir)
            .env("PATH", &config.path_env)
            .envs(config.extra_env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group, so a stop reaches the encoder children too.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::tool(&program, format!("failed to start: {e}")))?;

        let pid = child.id();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("pipeline stdout was not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Internal("pipeline stderr was not captured".into()))?;

        tracing::info!(
            job_id = %job.id,
            pid = ?pid,
            program = %program,
            source = %job.source_path.display(),
            "Pipeline started"
        );

        Ok(ConversionProcess {
            job_id: job.id,
            program,
            child,
            pid: pid.and_then(|p| i32::try_from(p).ok()),
            output: LineReader::new(stdout),
            exit_status: None,
            drain_deadline: None,
            parser: ProtocolParser::new(),
            stderr_task: Some(tokio::spawn(collect_stderr(stderr, config.stderr_limit))),
            cancel,
            grace: config.termination_grace,
            artifacts: TempArtifacts::new(&job.output_path),
            stream_done: false,
            saw_complete: false,
            error: None,
            settled: false,
        })
    }
}

/// A running pipeline.
#[derive(Debug)]
pub struct ConversionProcess {
    job_id: JobId,
    program: String,
    child: Child,
    /// Also the process group id.
    pid: Option<i32>,
    output: LineReader,
    /// Set once the pipeline process itself has been reaped.
    exit_status: Option<io::Result<ExitStatus>>,
    /// Output left after the pipeline exited is only read until then.
    drain_deadline: Option<Instant>,
    parser: ProtocolParser,
    stderr_task: Option<JoinHandle<String>>,
    cancel: CancellationToken,
    grace: Duration,
    artifacts: TempArtifacts,
    stream_done: bool,
    saw_complete: bool,
    error: Option<String>,
    settled: bool,
}

impl ConversionProcess {
    pub fn pid(&self) -> Option<i32> {
        self.pid
    }

    /// Next parsed event. `None` once output has ended, after an `ERROR:`
    /// line, or when a stop was requested; then call [`wait`](Self::wait).
    pub async fn next_event(&mut self) -> Option<ProtocolEvent> {
        if self.stream_done {
            return None;
        }
        let cancel = self.cancel.clone();
        loop {
            let line = tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                line = self.read_output() => line,
            };

            let Some(line) = line else {
                self.stream_done = true;
                return self.parser.finish();
            };
            let Some(event) = self.parser.feed(&line) else {
                continue;
            };
            match &event {
                ProtocolEvent::Stage(stage) if stage.is_complete() => {
                    self.saw_complete = true;
                }
                ProtocolEvent::Error(message) => {
                    self.error = Some(message.clone());
                    self.stream_done = true;
                }
                _ => {}
            }
            return Some(event);
        }
    }

    /// Wait for the process to exit, stopping it first if a stop was
    /// requested, and clean up temp artifacts unless it succeeded.
    pub async fn wait(mut self) -> ProcessExit {
        let cancel = self.cancel.clone();
        let exited = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            status = self.drain_and_reap() => Some(status),
        };

        let status = match exited {
            Some(status) => status,
            None => self.terminate().await,
        };
        self.sweep_group().await;

        let stderr = match self.stderr_task.take() {
            Some(mut task) => {
                let limit = self.grace.max(Duration::from_secs(1));
                match tokio::time::timeout(limit, &mut task).await {
                    Ok(joined) => joined.unwrap_or_default(),
                    Err(_) => {
                        tracing::debug!(job_id = %self.job_id, "Pipeline stderr still open, giving up on it");
                        task.abort();
                        String::new()
                    }
                }
            }
            None => String::new(),
        };

        let exit_code = status.as_ref().ok().and_then(|s| s.code());
        let outcome = self.classify(status);
        self.settled = true;

        match &outcome {
            ExitOutcome::Succeeded => self.artifacts.keep(),
            _ => {
                let removed = self.artifacts.cleanup();
                if removed > 0 {
                    tracing::info!(job_id = %self.job_id, removed, "Removed partial output");
                }
            }
        }

        tracing::info!(job_id = %self.job_id, outcome = ?outcome, exit_code = ?exit_code, "Pipeline exited");
        ProcessExit {
            outcome,
            exit_code,
            stderr,
        }
    }

    /// Next line of output, or `None` at its end.
    ///
    /// The pipeline is reaped as soon as it exits, whether or not its output
    /// has closed. Anything left in its group is then stopped, and what is
    /// still buffered is read until the drain deadline.
    async fn read_output(&mut self) -> Option<String> {
        loop {
            let deadline = self.drain_deadline;
            let step = tokio::select! {
                biased;
                status = self.child.wait(), if self.exit_status.is_none() => Step::Exited(status),
                read = read_before(&mut self.output, deadline) => Step::Read(read),
            };

            match step {
                Step::Exited(status) => {
                    tracing::debug!(job_id = %self.job_id, status = ?status, "Pipeline process exited");
                    self.exit_status = Some(status);
                    self.sweep_group().await;
                    self.drain_deadline = Some(Instant::now() + self.grace);
                }
                Step::Read(Ok(line)) => return line,
                Step::Read(Err(e)) => {
                    tracing::warn!(job_id = %self.job_id, error = %e, "Failed to read pipeline output");
                    return None;
                }
            }
        }
    }

    /// Read whatever output is left so the child never blocks on a full
    /// pipe, then reap it.
    async fn drain_and_reap(&mut self) -> io::Result<ExitStatus> {
        while let Some(line) = self.read_output().await {
            tracing::trace!(line = %line, "Ignoring pipeline output after end of protocol stream");
        }
        match self.exit_status.take() {
            Some(status) => status,
            None => self.child.wait().await,
        }
    }

    fn classify(&mut self, status: io::Result<ExitStatus>) -> ExitOutcome {
        if self.cancel.is_cancelled() {
            return ExitOutcome::Cancelled;
        }
        let status = match status {
            Ok(status) => status,
            Err(e) => {
                return ExitOutcome::Failed {
                    message: format!("failed to wait for {}: {e}", self.program),
                }
            }
        };
        if let Some(message) = self.error.take() {
            return ExitOutcome::Failed { message };
        }
        if status.success() {
            if !self.saw_complete {
                tracing::warn!(job_id = %self.job_id, "Pipeline exited cleanly without reporting completion");
            }
            return ExitOutcome::Succeeded;
        }
        let message = match status.code() {
            Some(code) => format!("process exited with code {code}"),
            None => format!("process terminated by {status}"),
        };
        ExitOutcome::Failed { message }
    }

    /// SIGTERM the group, give it the grace period, then SIGKILL.
    async fn terminate(&mut self) -> io::Result<ExitStatus> {
        tracing::info!(job_id = %self.job_id, pid = ?self.pid, "Stopping pipeline");
        if !self.signal_group(GroupSignal::Terminate) {
            let _ = self.child.start_kill();
        }

        match tokio::time::timeout(self.grace, self.child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                tracing::warn!(
                    job_id = %self.job_id,
                    grace_ms = self.grace.as_millis() as u64,
                    "Pipeline ignored SIGTERM, killing"
                );
                self.signal_group(GroupSignal::Kill);
                let _ = self.child.start_kill();
                self.child.wait().await
            }
        }
    }

    /// Make sure nothing from the group outlives the pipeline itself.
    async fn sweep_group(&mut self) {
        if !self.group_alive() {
            return;
        }
        self.signal_group(GroupSignal::Terminate);
        let deadline = tokio::time::Instant::now() + self.grace;
        while self.group_alive() {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(job_id = %self.job_id, "Killing leftover pipeline children");
                self.signal_group(GroupSignal::Kill);
                break;
            }
            tokio::time::sleep(GROUP_POLL_INTERVAL).await;
        }
    }

    #[cfg(unix)]
    fn signal_group(&self, signal: GroupSignal) -> bool {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let Some(pgid) = self.pid else {
            return false;
        };
        let signal = match signal {
            GroupSignal::Terminate => Signal::SIGTERM,
            GroupSignal::Kill => Signal::SIGKILL,
        };
        match killpg(Pid::from_raw(pgid), signal) {
            Ok(()) => true,
            Err(nix::errno::Errno::ESRCH) => false,
            Err(e) => {
                tracing::warn!(job_id = %self.job_id, pgid, error = %e, "Failed to signal process group");
                false
            }
        }
    }

    #[cfg(not(unix))]
    fn signal_group(&self, _signal: GroupSignal) -> bool {
        false
    }

    #[cfg(unix)]
    fn group_alive(&self) -> bool {
        use nix::sys::signal::killpg;
        use nix::unistd::Pid;

        self.pid
            .is_some_and(|pgid| killpg(Pid::from_raw(pgid), None).is_ok())
    }

    #[cfg(not(unix))]
    fn group_alive(&self) -> bool {
        false
    }
}

impl Drop for ConversionProcess {
    fn drop(&mut self) {
        if !self.settled {
            tracing::warn!(job_id = %self.job_id, "Pipeline dropped while running, killing");
            self.signal_group(GroupSignal::Kill);
            let _ = self.child.start_kill();
        }
    }
}

#[derive(Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}

fn program_name(program: &std::path::Path) -> String {
    program
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| program.to_string_lossy().to_string())
}

enum Step {
    Exited(io::Result<ExitStatus>),
    Read(io::Result<Option<String>>),
}

/// Read a line, giving up at `deadline` if one is set.
async fn read_before(
    output: &mut LineReader,
    deadline: Option<Instant>,
) -> io::Result<Option<String>> {
    let Some(deadline) = deadline else {
        return output.next_line().await;
    };
    tokio::time::timeout_at(deadline, output.next_line())
        .await
        .unwrap_or_else(|_| {
            Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "output still open after the pipeline exited",
            ))
        })
}

/// Newline-delimited reader over the pipeline's stdout.
///
/// Lines are decoded lossily and capped at [`MAX_LINE_BYTES`]. A partly read
/// line survives a dropped `next_line` call, so it can sit in a `select!`.
#[derive(Debug)]
struct LineReader {
    reader: BufReader<ChildStdout>,
    line: Vec<u8>,
    truncated: bool,
}

impl LineReader {
    fn new(stdout: ChildStdout) -> Self {
        Self {
            reader: BufReader::new(stdout),
            line: Vec::new(),
            truncated: false,
        }
    }

    /// One line without its terminator. `None` at end of stream.
    async fn next_line(&mut self) -> io::Result<Option<String>> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                if self.line.is_empty() && !self.truncated {
                    return Ok(None);
                }
                return Ok(Some(self.take_line()));
            }

            let (end, complete) = match available.iter().position(|&b| b == b'\n') {
                Some(newline) => (newline + 1, true),
                None => (available.len(), false),
            };
            let room = MAX_LINE_BYTES.saturating_sub(self.line.len());
            let keep = end.min(room);
            self.line.extend_from_slice(&available[..keep]);
            if keep < end {
                self.truncated = true;
            }
            self.reader.consume(end);

            if complete {
                return Ok(Some(self.take_line()));
            }
        }
    }

    fn take_line(&mut self) -> String {
        if self.truncated {
            tracing::warn!(limit = MAX_LINE_BYTES, "Truncated overlong pipeline output line");
        }
        let text = String::from_utf8_lossy(&self.line)
            .trim_end_matches(['\r', '\n'])
            .to_string();
        self.line.clear();
        self.truncated = false;
        text
    }
}

async fn collect_stderr(stderr: ChildStderr, limit: usize) -> String {
    let mut reader = BufReader::new(stderr);
    let mut kept: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                kept.extend_from_slice(&chunk[..n]);
                if kept.len() > limit {
                    let excess = kept.len() - limit;
                    kept.drain(..excess);
                }
            }
        }
    }
    String::from_utf8_lossy(&kept).trim().to_string()
}
