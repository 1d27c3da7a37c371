//! Centralized command execution with consistent error handling.
//!
//! All external tools the pipeline touches (strip, bzip2, lzop, ldd) run
//! through this wrapper so stderr is always captured and timeouts are
//! enforced uniformly.

use anyhow::{bail, Context, Result};
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use crate::error::BuildError;

/// Result of a command execution.
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Exit status of the command.
    pub status: ExitStatus,
    /// Captured stdout. Binary-safe: compression tools stream archives here.
    pub stdout: Vec<u8>,
    /// Captured stderr as a string.
    pub stderr: String,
}

impl CommandResult {
    /// Returns true if the command exited successfully.
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Get the exit code, or -1 if terminated by signal.
    pub fn code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }

    /// Get stdout decoded as text.
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Get stderr, trimmed of whitespace.
    pub fn stderr_trimmed(&self) -> &str {
        self.stderr.trim()
    }
}

/// Builder for configuring command execution.
pub struct Cmd {
    program: String,
    args: Vec<String>,
    stdin_bytes: Option<Vec<u8>>,
    timeout: Option<Duration>,
    /// If true, don't fail on non-zero exit.
    allow_fail: bool,
    /// Custom error message prefix.
    error_prefix: Option<String>,
}

impl Cmd {
    /// Create a new command builder.
    pub fn new(program: impl AsRef<str>) -> Self {
        Self {
            program: program.as_ref().to_string(),
            args: Vec::new(),
            stdin_bytes: None,
            timeout: None,
            allow_fail: false,
            error_prefix: None,
        }
    }

    /// Add a single argument.
    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

    /// Add multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for arg in args {
            self.args.push(arg.as_ref().to_string());
        }
        self
    }

    /// Add a path as an argument.
    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.to_string_lossy().into_owned());
        self
    }

    /// Feed bytes to the child's stdin.
    pub fn stdin_bytes(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stdin_bytes = Some(bytes.into());
        self
    }

    /// Kill the child and fail the build if it runs longer than this.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Allow non-zero exit codes without failing.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// Set a custom error message prefix.
    pub fn error_msg(mut self, msg: impl AsRef<str>) -> Self {
        self.error_prefix = Some(msg.as_ref().to_string());
        self
    }

    /// Run the command and capture output.
    pub fn run(self) -> Result<CommandResult> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.stdin(if self.stdin_bytes.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to execute '{}'. Is it installed?", self.program))?;

        // Writer and readers run on their own threads so a child producing
        // more than a pipe buffer of output cannot deadlock against us.
        let stdin_thread = self.stdin_bytes.map(|bytes| {
            let mut stdin = child.stdin.take().expect("stdin was requested piped");
            std::thread::spawn(move || {
                // A child that exits early closes the pipe; that is not our error.
                let _ = stdin.write_all(&bytes);
            })
        });

        let stdout_pipe = child.stdout.take().expect("stdout was requested piped");
        let stderr_pipe = child.stderr.take().expect("stderr was requested piped");
        let stdout_thread = std::thread::spawn(move || read_all(stdout_pipe));
        let stderr_thread = std::thread::spawn(move || read_all(stderr_pipe));

        let status = wait_with_timeout(&mut child, self.timeout, &self.program)?;

        if let Some(t) = stdin_thread {
            let _ = t.join();
        }
        let stdout = stdout_thread.join().unwrap_or_default();
        let stderr = String::from_utf8_lossy(&stderr_thread.join().unwrap_or_default()).into_owned();

        let result = CommandResult {
            status,
            stdout,
            stderr,
        };

        if !self.allow_fail && !result.success() {
            let prefix = self
                .error_prefix
                .unwrap_or_else(|| format!("'{}' failed", self.program));

            let stderr = result.stderr_trimmed();
            if stderr.is_empty() {
                bail!("{} (exit code {})", prefix, result.code());
            } else {
                bail!("{} (exit code {}):\n{}", prefix, result.code(), stderr);
            }
        }

        Ok(result)
    }
}

fn read_all(mut pipe: impl Read) -> Vec<u8> {
    let mut buf = Vec::new();
    let _ = pipe.read_to_end(&mut buf);
    buf
}

/// Poll the child until it exits or the deadline passes.
fn wait_with_timeout(
    child: &mut Child,
    timeout: Option<Duration>,
    program: &str,
) -> Result<ExitStatus> {
    let Some(timeout) = timeout else {
        return Ok(child.wait()?);
    };

    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(BuildError::ToolTimeout {
                tool: program.to_string(),
                seconds: timeout.as_secs(),
            }
            .into());
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_captures_stdout() {
        let result = Cmd::new("echo").arg("hello").run().unwrap();
        assert!(result.success());
        assert_eq!(result.stdout_text().trim(), "hello");
    }

    #[test]
    fn test_run_fails_on_nonzero_exit() {
        let result = Cmd::new("false").run();
        assert!(result.is_err());
    }

    #[test]
    fn test_allow_fail_suppresses_error() {
        let result = Cmd::new("false").allow_fail().run().unwrap();
        assert!(!result.success());
    }

    #[test]
    fn test_stdin_bytes_reach_child() {
        let result = Cmd::new("cat").stdin_bytes(&b"piped"[..]).run().unwrap();
        assert_eq!(result.stdout, b"piped");
    }

    #[test]
    fn test_timeout_kills_slow_child() {
        let err = Cmd::new("sleep")
            .arg("5")
            .timeout(Duration::from_millis(100))
            .run()
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::ToolTimeout { .. })
        ));
    }
}
