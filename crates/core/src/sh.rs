//! Retrying shell command execution, locally or over SSH.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{FleetError, Result};
use crate::retry::{RetryPolicy, with_retry};

/// Connection details for a remote host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub key_file: PathBuf,
}

impl fmt::Display for SshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Local,
    Remote(SshTarget),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Local => f.write_str("localhost"),
            Target::Remote(ssh) => ssh.fmt(f),
        }
    }
}

struct AttemptFailure {
    exit_code: Option<i32>,
    detail: String,
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.exit_code {
            Some(code) => write!(f, "exit code {code}: {}", self.detail),
            None => write!(f, "{}", self.detail),
        }
    }
}

/// Runs shell commands and copies files onto cluster hosts.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `command` on `target` and return its non-empty stdout lines.
    async fn run(&self, command: &str, target: &Target) -> Result<Vec<String>>;

    /// Copy local files or directories into `remote_dir` on `target`.
    async fn push(&self, sources: &[PathBuf], target: &SshTarget, remote_dir: &str) -> Result<()>;
}

/// [`CommandRunner`] backed by `sh`, `ssh` and `rsync` child processes.
///
/// Non-zero exits are retried per the executor's [`RetryPolicy`]; once the
/// budget is spent the result is [`FleetError::CommandFailed`].
#[derive(Debug, Clone, Default)]
pub struct Executor {
    retry: RetryPolicy,
}

#[async_trait]
impl CommandRunner for Executor {
    async fn run(&self, command: &str, target: &Target) -> Result<Vec<String>> {
        let (program, args) = command_line(command, target);
        self.run_program(command, &target.to_string(), &program, &args).await
    }

    async fn push(&self, sources: &[PathBuf], target: &SshTarget, remote_dir: &str) -> Result<()> {
        if sources.is_empty() {
            return Ok(());
        }
        let args = rsync_args(sources, target, remote_dir);
        let description = format!("rsync {} -> {}", display_paths(sources), remote_dir);
        self.run_program(&description, &target.to_string(), "rsync", &args)
            .await
            .map(|_| ())
    }
}

impl Executor {
    pub fn new(retry: RetryPolicy) -> Self {
        Self { retry }
    }

    async fn run_program(
        &self,
        description: &str,
        target: &str,
        program: &str,
        args: &[String],
    ) -> Result<Vec<String>> {
        let attempts = self.retry.attempts();
        let result = with_retry(self.retry, |attempt| async move {
            debug!(target_host = %target, command = %description, attempt, "Running command");
            let output = match Command::new(program)
                .args(args)
                .stdin(Stdio::null())
                .output()
                .await
            {
                Ok(output) => output,
                Err(e) => {
                    return Err(AttemptFailure {
                        exit_code: None,
                        detail: format!("failed to spawn {program}: {e}"),
                    });
                }
            };

            if output.status.success() {
                return Ok(String::from_utf8_lossy(&output.stdout)
                    .lines()
                    .map(str::trim_end)
                    .filter(|line| !line.trim().is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>());
            }

            let failure = AttemptFailure {
                exit_code: output.status.code(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            };
            warn!(
                target_host = %target,
                command = %description,
                attempt,
                max_tries = attempts,
                error = %failure,
                "Command failed"
            );
            Err(failure)
        })
        .await;

        match result {
            Ok(lines) => {
                info!(target_host = %target, command = %description, "Command succeeded");
                Ok(lines)
            }
            Err(failure) => Err(FleetError::CommandFailed {
                command: description.to_string(),
                target: target.to_string(),
                attempts,
                exit_code: failure.exit_code,
            }),
        }
    }
}

fn ssh_transport(target: &SshTarget) -> Vec<String> {
    vec![
        "-i".to_string(),
        target.key_file.display().to_string(),
        "-p".to_string(),
        target.port.to_string(),
        "-o".to_string(),
        "BatchMode=yes".to_string(),
    ]
}

fn command_line(command: &str, target: &Target) -> (String, Vec<String>) {
    match target {
        Target::Local => ("sh".to_string(), vec!["-c".to_string(), command.to_string()]),
        Target::Remote(ssh) => {
            let mut args = ssh_transport(ssh);
            args.push(format!("{}@{}", ssh.user, ssh.host));
            args.push(command.to_string());
            ("ssh".to_string(), args)
        }
    }
}

fn rsync_args(sources: &[PathBuf], target: &SshTarget, remote_dir: &str) -> Vec<String> {
    let mut args = vec![
        "-q".to_string(),
        "-r".to_string(),
        "-e".to_string(),
        format!(
            "ssh {}",
            ssh_transport(target)
                .iter()
                .map(|arg| shell_quote(arg))
                .collect::<Vec<_>>()
                .join(" ")
        ),
    ];
    args.extend(sources.iter().map(|p| p.display().to_string()));
    args.push(format!("{}@{}:{}", target.user, target.host, remote_dir));
    args
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Quote `value` for safe interpolation into a POSIX shell command.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,~".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}
