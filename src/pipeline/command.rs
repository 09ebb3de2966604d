//! Builder for running ffmpeg and ffprobe from the pipeline.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use encodeforge_common::{Error, Result};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

/// Output captured from a tool execution.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub status: ExitStatus,
    /// Captured standard output (lossy UTF-8). Empty when streamed.
    pub stdout: String,
    /// Captured standard error (lossy UTF-8). Empty when sent to a file.
    pub stderr: String,
}

/// A builder for one external tool invocation.
///
/// Children are killed if the future driving them is dropped, so an
/// interrupted pipeline never leaves an encoder behind.
#[derive(Debug)]
pub struct ToolCommand {
    program: PathBuf,
    args: Vec<String>,
    timeout: Option<Duration>,
    stderr_file: Option<File>,
}

impl ToolCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: None,
            stderr_file: None,
        }
    }

    /// Append a single argument.
    pub fn arg(&mut self, s: impl Into<String>) -> &mut Self {
        self.args.push(s.into());
        self
    }

    /// Append a path argument.
    pub fn path_arg(&mut self, path: &Path) -> &mut Self {
        self.args.push(path.to_string_lossy().into_owned());
        self
    }

    /// Append multiple arguments.
    pub fn args(&mut self, iter: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.args.extend(iter.into_iter().map(Into::into));
        self
    }

    /// Fail if the tool runs longer than `d`. Unlimited by default.
    pub fn timeout(&mut self, d: Duration) -> &mut Self {
        self.timeout = Some(d);
        self
    }

    /// Write the tool's stderr into `file` instead of capturing it.
    pub fn stderr_to(&mut self, file: File) -> &mut Self {
        self.stderr_file = Some(file);
        self
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    /// The invocation as a shell-quoted string.
    pub fn display(&self) -> String {
        std::iter::once(self.program.to_string_lossy().into_owned())
            .chain(self.args.iter().cloned())
            .map(|a| shell_quote(&a))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.to_string_lossy().to_string())
    }

    fn spawn(&mut self) -> Result<tokio::process::Child> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true);

        match self.stderr_file.take() {
            Some(file) => cmd.stderr(Stdio::from(file)),
            None => cmd.stderr(Stdio::piped()),
        };

        tracing::debug!(command = %self.display(), "Running tool");
        cmd.spawn()
            .map_err(|e| Error::tool(self.program_name(), format!("failed to spawn: {e}")))
    }

    /// Run to completion, capturing stdout and stderr.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Tool`] if the process cannot be spawned, times out or
    /// exits non-zero (the message then includes the end of stderr).
    pub async fn execute(&mut self) -> Result<ToolOutput> {
        let program = self.program_name();
        let child = self.spawn()?;

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| Error::tool(&program, format!("timed out after {:?}", limit)))?,
            None => child.wait_with_output().await,
        }
        .map_err(|e| Error::tool(&program, format!("I/O error waiting for process: {e}")))?;

        let tool_output = ToolOutput {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };
        check_status(&program, &tool_output)?;
        Ok(tool_output)
    }

    /// Run to completion, handing each stdout line to `on_line` as it
    /// arrives. Stderr is still captured.
    pub async fn stream(&mut self, mut on_line: impl FnMut(&str)) -> Result<ToolOutput> {
        let program = self.program_name();
        let mut child = self.spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::tool(&program, "stdout was not captured"))?;
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf).await;
                String::from_utf8_lossy(&buf).to_string()
            })
        });

        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| Error::tool(&program, format!("failed to read output: {e}")))?
        {
            on_line(&line);
        }

        let status = child
            .wait()
            .await
            .map_err(|e| Error::tool(&program, format!("I/O error waiting for process: {e}")))?;
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        let tool_output = ToolOutput {
            status,
            stdout: String::new(),
            stderr,
        };
        check_status(&program, &tool_output)?;
        Ok(tool_output)
    }
}

fn check_status(program: &str, output: &ToolOutput) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }
    let stderr = output.stderr.trim();
    let tail = stderr.lines().last().unwrap_or_default();
    Err(Error::tool(
        program,
        format!("exited with status {}: {}", output.status, tail),
    ))
}

/// Quote `arg` for a POSIX shell when it needs it.
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_./:=,+@%".contains(&b));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn execute_echo() {
        let output = ToolCommand::new("echo").arg("hello").execute().await;

        match output {
            Ok(out) => {
                assert!(out.status.success());
                assert!(out.stdout.trim().contains("hello"));
            }
            Err(_) => {
                // On some minimal environments echo may not exist; skip.
            }
        }
    }

    #[tokio::test]
    async fn execute_nonexistent_tool() {
        let result = ToolCommand::new("nonexistent_tool_xyz_12345").execute().await;
        assert!(matches!(result, Err(Error::Tool { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_fires() {
        let result = ToolCommand::new("sleep")
            .arg("10")
            .timeout(Duration::from_millis(100))
            .execute()
            .await;
        let err = result.unwrap_err().to_string();
        assert!(err.contains("timed out"), "unexpected error: {err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stream_yields_lines_in_order() {
        let mut seen = Vec::new();
        ToolCommand::new("sh")
            .args(["-c", "echo frame=1; echo progress=continue"])
            .stream(|line| seen.push(line.to_string()))
            .await
            .unwrap();
        assert_eq!(seen, vec!["frame=1", "progress=continue"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_reports_stderr_tail() {
        let err = ToolCommand::new("sh")
            .args(["-c", "echo first >&2; echo 'Invalid data' >&2; exit 2"])
            .execute()
            .await
            .unwrap_err();
        assert!(err.to_string().ends_with("Invalid data"), "{err}");
    }

    #[test]
    fn display_quotes_only_when_needed() {
        let mut cmd = ToolCommand::new("ffmpeg");
        cmd.args(["-i", "/v/My Movie.mkv", "-svtav1-params", "tune=0:film-grain=8"])
            .arg("it's");
        assert_eq!(
            cmd.display(),
            r"ffmpeg -i '/v/My Movie.mkv' -svtav1-params tune=0:film-grain=8 'it'\''s'"
        );
    }
}
