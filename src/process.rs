// SPDX-License-Identifier: AGPL-3.0-or-later
//! External command execution
//!
//! The `aws`, `gh` and `terraform` binaries are all driven through the
//! [`CommandRunner`] seam so that workflows can be exercised without them.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::credentials::Secret;
use crate::error::{PaveError, Result};

/// A fully described subprocess invocation
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub env_remove: Vec<String>,
    /// Fed to the child's stdin, never logged
    pub stdin: Option<Secret>,
    pub timeout: Duration,
    /// Let the child inherit the terminal instead of capturing output
    pub inherit_output: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            env_remove: Vec::new(),
            stdin: None,
            timeout: Duration::from_secs(300),
            inherit_output: false,
        }
    }

    /// Build from an argv vector; `None` when it is empty
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, rest) = argv.split_first()?;
        Some(Self::new(program.clone()).args(rest.iter().cloned()))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn env_remove(mut self, key: impl Into<String>) -> Self {
        self.env_remove.push(key.into());
        self
    }

    pub fn stdin(mut self, data: Secret) -> Self {
        self.stdin = Some(data);
        self
    }

    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = duration;
        self
    }

    pub fn inherit_output(mut self, inherit: bool) -> Self {
        self.inherit_output = inherit;
        self
    }

    /// Program and arguments as a single display string
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Exit code; `None` when killed by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Something that can run a [`CommandSpec`]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion. A non-zero exit is an `Ok` output; only failures
    /// to spawn or wait are errors.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;
}

/// Runs commands as real child processes
#[derive(Debug, Default, Clone)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        debug!(command = %spec.display(), "Executing command");

        let mut command = Command::new(&spec.program);
        command.args(&spec.args);

        if let Some(dir) = &spec.cwd {
            command.current_dir(dir);
        }
        for key in &spec.env_remove {
            command.env_remove(key);
        }
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        command.stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        if spec.inherit_output {
            command.stdout(Stdio::inherit());
            command.stderr(Stdio::inherit());
        } else {
            command.stdout(Stdio::piped());
            command.stderr(Stdio::piped());
        }
        command.kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PaveError::NotFound {
                    what: format!("executable '{}'", spec.program),
                }
            } else {
                PaveError::CommandFailed {
                    command: spec.display(),
                    message: format!("Failed to start: {e}"),
                }
            }
        })?;

        if let (Some(data), Some(mut stdin)) = (&spec.stdin, child.stdin.take()) {
            stdin.write_all(data.expose().as_bytes()).await?;
            stdin.shutdown().await?;
        }

        match timeout(spec.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(CommandOutput {
                status: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            }),
            Ok(Err(e)) => Err(PaveError::CommandFailed {
                command: spec.display(),
                message: format!("Failed to execute command: {e}"),
            }),
            Err(_) => Err(PaveError::CommandFailed {
                command: spec.display(),
                message: format!("Command timed out after {} seconds", spec.timeout.as_secs()),
            }),
        }
    }
}

/// Canned runner that records every invocation.
///
/// Rules are matched in insertion order against [`CommandSpec::display`] by
/// prefix; unmatched commands succeed with empty output.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<(String, CommandOutput)>>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands starting with `prefix` with `output`
    pub fn on(self, prefix: impl Into<String>, output: CommandOutput) -> Self {
        self.rules
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((prefix.into(), output));
        self
    }

    /// Every command run so far
    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Display strings of every command run so far
    pub fn call_lines(&self) -> Vec<String> {
        self.calls().iter().map(CommandSpec::display).collect()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let line = spec.display();
        info!(command = %line, "Scripted command");
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(spec.clone());
        let rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
        Ok(rules
            .iter()
            .find(|(prefix, _)| line.starts_with(prefix.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_else(|| CommandOutput::ok("")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_process_runner_captures_stdout() {
        let spec = CommandSpec::new("sh").args(["-c", "echo 'test output'"]);
        let output = ProcessRunner.run(&spec).await.unwrap();
        assert!(output.success());
        assert!(output.stdout.contains("test output"));
    }

    #[tokio::test]
    async fn test_process_runner_reports_exit_code() {
        let spec = CommandSpec::new("sh").args(["-c", "echo boom >&2; exit 3"]);
        let output = ProcessRunner.run(&spec).await.unwrap();
        assert_eq!(output.status, Some(3));
        assert!(output.stderr.contains("boom"));
    }

    #[tokio::test]
    async fn test_process_runner_feeds_stdin_and_env() {
        let spec = CommandSpec::new("sh")
            .args(["-c", "read line; echo \"$line-$PAVE_TEST_VAR\""])
            .env("PAVE_TEST_VAR", "env")
            .stdin(Secret::new("piped\n"));
        let output = ProcessRunner.run(&spec).await.unwrap();
        assert_eq!(output.stdout.trim(), "piped-env");
    }

    #[tokio::test]
    async fn test_process_runner_removes_env() {
        let spec = CommandSpec::new("sh")
            .args(["-c", "echo \"[${HOME:-unset}]\""])
            .env_remove("HOME");
        let output = ProcessRunner.run(&spec).await.unwrap();
        assert_eq!(output.stdout.trim(), "[unset]");
    }

    #[tokio::test]
    async fn test_process_runner_missing_binary() {
        let spec = CommandSpec::new("pave-definitely-not-installed");
        let err = ProcessRunner.run(&spec).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_process_runner_timeout() {
        let spec = CommandSpec::new("sleep")
            .arg("5")
            .timeout(Duration::from_millis(100));
        let err = ProcessRunner.run(&spec).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_scripted_runner_matches_prefix() {
        let runner = ScriptedRunner::new().on("tflint", CommandOutput::failed(2, "lint errors"));
        let lint = runner.run(&CommandSpec::new("tflint")).await.unwrap();
        assert_eq!(lint.status, Some(2));
        let other = runner.run(&CommandSpec::new("terraform").arg("plan")).await.unwrap();
        assert!(other.success());
        assert_eq!(runner.call_lines(), vec!["tflint", "terraform plan"]);
    }

    #[test]
    fn test_from_argv() {
        assert!(CommandSpec::from_argv(&[]).is_none());
        let spec = CommandSpec::from_argv(&["checkov".into(), "-d".into(), ".".into()]).unwrap();
        assert_eq!(spec.display(), "checkov -d .");
    }
}
