//! External command execution
//!
//! Steps may run shell commands before applying resources, and assertion
//! blocks may run commands on every polling sweep. Commands see the step's
//! namespace as `$NAMESPACE` and the cluster's kubeconfig as `$KUBECONFIG`.
//! Background commands keep running while the step proceeds and are killed
//! when the run ends.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::cancel::{CancelError, RunContext};

/// Errors from running commands
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("command not found: {0}")]
    CommandNotFound(String),

    #[error("failed to execute command: {0}")]
    ExecutionFailed(String),

    #[error("command '{command}' failed with exit code {exit_code}: {stderr}")]
    Failed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("command '{command}' timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("command must set exactly one of command or script")]
    Invalid,

    #[error("{0}")]
    Context(#[from] CancelError),
}

/// Captured output of a finished command
#[derive(Debug, Clone)]
pub struct RunResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RunResult {
    pub fn passed(&self) -> bool {
        self.exit_code == 0
    }
}

/// Run a program to completion, capturing its output
pub async fn run(program: &str, args: &[&str]) -> Result<RunResult, RunnerError> {
    run_with_env(program, args, &HashMap::new()).await
}

/// Run a program with extra environment variables
pub async fn run_with_env(
    program: &str,
    args: &[&str],
    env: &HashMap<String, String>,
) -> Result<RunResult, RunnerError> {
    let output = tokio::process::Command::new(program)
        .args(args)
        .envs(env)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| spawn_error(program, e))?;

    Ok(RunResult {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

fn spawn_error(program: &str, err: std::io::Error) -> RunnerError {
    if err.kind() == std::io::ErrorKind::NotFound {
        RunnerError::CommandNotFound(program.to_string())
    } else {
        RunnerError::ExecutionFailed(format!("{program}: {err}"))
    }
}

/// A command declared in a step or assertion block
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Command {
    /// Single command line; `namespaced` appends `--namespace`
    pub command: Option<String>,
    /// Multi-line shell script
    pub script: Option<String>,
    pub namespaced: bool,
    pub ignore_failure: bool,
    pub background: bool,
    /// Seconds; falls back to the step timeout
    #[serde(rename = "timeout")]
    pub timeout_secs: Option<u64>,
    pub skip_log_output: bool,
}

impl Command {
    /// Command running `line` in the foreground
    #[must_use]
    pub fn line(line: impl Into<String>) -> Self {
        Self {
            command: Some(line.into()),
            ..Self::default()
        }
    }

    /// Command running a shell script in the foreground
    #[must_use]
    pub fn script(script: impl Into<String>) -> Self {
        Self {
            script: Some(script.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn background(mut self) -> Self {
        self.background = true;
        self
    }

    #[must_use]
    pub fn ignore_failure(mut self) -> Self {
        self.ignore_failure = true;
        self
    }

    #[must_use]
    pub fn namespaced(mut self) -> Self {
        self.namespaced = true;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// Shell text to hand to `sh -c`
    fn shell_text(&self, namespace: &str) -> Result<String, RunnerError> {
        match (&self.command, &self.script) {
            (Some(line), None) => {
                if self.namespaced && !namespace.is_empty() {
                    Ok(format!("{line} --namespace {namespace}"))
                } else {
                    Ok(line.clone())
                }
            }
            (None, Some(script)) => Ok(script.clone()),
            _ => Err(RunnerError::Invalid),
        }
    }

    /// Short label for logs and errors
    pub fn describe(&self) -> String {
        match (&self.command, &self.script) {
            (Some(line), _) => line.clone(),
            (None, Some(script)) => {
                let first = script.lines().next().unwrap_or_default();
                format!("script: {first}")
            }
            (None, None) => "<empty>".to_string(),
        }
    }
}

/// Where commands run and what they see
#[derive(Debug, Clone, Default)]
pub struct CommandEnv {
    pub namespace: String,
    pub kubeconfig: String,
    pub work_dir: Option<PathBuf>,
}

struct BackgroundProcess {
    command: String,
    child: tokio::process::Child,
}

/// Background processes started during a run, killed at its end
#[derive(Clone, Default)]
pub struct BackgroundProcesses {
    inner: Arc<Mutex<Vec<BackgroundProcess>>>,
}

impl std::fmt::Debug for BackgroundProcesses {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundProcesses")
            .field("count", &self.len())
            .finish()
    }
}

impl BackgroundProcesses {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, command: String, child: tokio::process::Child) {
        self.lock().push(BackgroundProcess { command, child });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<BackgroundProcess>> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Kill every tracked process and wait for it to exit
    pub async fn kill_all(&self) {
        let processes: Vec<BackgroundProcess> = self.lock().drain(..).collect();
        for mut process in processes {
            match process.child.kill().await {
                Ok(()) => debug!(command = %process.command, "Killed background process"),
                Err(e) => warn!(command = %process.command, error = %e, "Failed to kill background process"),
            }
        }
    }
}

/// Run one declared command
///
/// Returns `None` for background commands, which are handed to `background`
/// instead of awaited. A non-zero exit is an error unless the command ignores
/// failures.
pub async fn run_command(
    ctx: &RunContext,
    cmd: &Command,
    env: &CommandEnv,
    background: &BackgroundProcesses,
) -> Result<Option<RunResult>, RunnerError> {
    let text = cmd.shell_text(&env.namespace)?;
    let label = cmd.describe();

    let mut process = tokio::process::Command::new("sh");
    process
        .arg("-c")
        .arg(&text)
        .env("NAMESPACE", &env.namespace)
        .stdin(Stdio::null())
        .kill_on_drop(true);
    if !env.kubeconfig.is_empty() {
        process.env("KUBECONFIG", &env.kubeconfig);
    }
    if let Some(dir) = &env.work_dir {
        process.current_dir(dir);
    }

    info!(namespace = %env.namespace, command = %label, background = cmd.background, "Running command");

    if cmd.background {
        let child = process
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| spawn_error("sh", e))?;
        background.push(label, child);
        return Ok(None);
    }

    let child = process
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| spawn_error("sh", e))?;

    let wait = child.wait_with_output();
    let output = match cmd.timeout() {
        Some(timeout) => match ctx.run(tokio::time::timeout(timeout, wait)).await? {
            Ok(output) => output,
            Err(_) => {
                return Err(RunnerError::Timeout {
                    command: label,
                    timeout,
                })
            }
        },
        None => ctx.run(wait).await?,
    }
    .map_err(|e| RunnerError::ExecutionFailed(format!("{label}: {e}")))?;

    let result = RunResult {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    };

    if !cmd.skip_log_output {
        for line in result.stdout.lines().chain(result.stderr.lines()) {
            info!(command = %label, "{line}");
        }
    }

    if !result.passed() {
        if cmd.ignore_failure {
            warn!(command = %label, exit_code = result.exit_code, "Command failed, ignoring");
        } else {
            return Err(RunnerError::Failed {
                command: label,
                exit_code: result.exit_code,
                stderr: result.stderr.trim().to_string(),
            });
        }
    }

    Ok(Some(result))
}
