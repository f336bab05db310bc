//! Command execution on a cluster node.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::{OperationError, Result};
use crate::types::CmdOutput;

/// Runs a program with arguments on some node and captures its output.
///
/// A non-zero exit is not an error here: the caller decides from the
/// captured streams. `Err` means the program could not be run at all.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String], input: Option<&str>) -> Result<CmdOutput>;

    /// Human readable target for log lines.
    fn target(&self) -> String;
}

/// Runs commands on the local host.
#[derive(Debug, Clone, Default)]
pub struct LocalRunner;

impl LocalRunner {
    /// Create a new local runner.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for LocalRunner {
    async fn run(&self, program: &str, args: &[String], input: Option<&str>) -> Result<CmdOutput> {
        execute(program, args, input).await
    }

    fn target(&self) -> String {
        "localhost".to_string()
    }
}

/// Runs commands on a remote node over SSH, as root via `sudo`.
#[derive(Debug, Clone)]
pub struct SshRunner {
    host: String,
    user: String,
    ssh_path: String,
}

impl SshRunner {
    /// Create a new SSH runner for `user@host`.
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            ssh_path: "ssh".to_string(),
        }
    }

    /// Use a custom ssh binary.
    pub fn with_ssh_path(mut self, ssh_path: impl Into<String>) -> Self {
        self.ssh_path = ssh_path.into();
        self
    }

    fn ssh_args(&self, program: &str, args: &[String]) -> Vec<String> {
        let remote = std::iter::once(program.to_string())
            .chain(args.iter().map(|a| shell_quote(a)))
            .collect::<Vec<_>>()
            .join(" ");
        vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            format!("{}@{}", self.user, self.host),
            format!("sudo {}", remote),
        ]
    }
}

#[async_trait]
impl CommandRunner for SshRunner {
    async fn run(&self, program: &str, args: &[String], input: Option<&str>) -> Result<CmdOutput> {
        let ssh_args = self.ssh_args(program, args);
        execute(&self.ssh_path, &ssh_args, input).await
    }

    fn target(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

/// Quote a single argument for a POSIX shell.
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r#"'\''"#))
    }
}

async fn execute(program: &str, args: &[String], input: Option<&str>) -> Result<CmdOutput> {
    debug!(command = %program, args = ?args, "Executing command");

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command
        .spawn()
        .map_err(|e| OperationError::Internal(format!("Failed to execute {}: {}", program, e)))?;

    if let (Some(input), Some(mut stdin)) = (input, child.stdin.take()) {
        stdin
            .write_all(input.as_bytes())
            .await
            .map_err(|e| OperationError::Internal(format!("Failed to write stdin of {}: {}", program, e)))?;
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| OperationError::Internal(format!("Failed to wait for {}: {}", program, e)))?;

    Ok(CmdOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        status: output.status.code(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("rbd/image@snap"), "rbd/image@snap");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r#"'it'\''s'"#);
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_ssh_args_wrap_in_sudo() {
        let runner = SshRunner::new("node1", "cephuser");
        let args = runner.ssh_args("rbd", &["snap".into(), "create".into(), "p/i@s 1".into()]);
        assert_eq!(args[4], "cephuser@node1");
        assert_eq!(args[5], "sudo rbd snap create 'p/i@s 1'");
        assert_eq!(runner.target(), "cephuser@node1");
    }

    #[tokio::test]
    async fn test_local_runner_captures_streams() {
        let runner = LocalRunner::new();
        let out = runner
            .run("sh", &["-c".into(), "cat; echo oops >&2; exit 3".into()], Some("hello"))
            .await
            .unwrap();
        assert_eq!(out.stdout, "hello");
        assert_eq!(out.stderr.trim(), "oops");
        assert_eq!(out.status, Some(3));
    }

    #[tokio::test]
    async fn test_local_runner_missing_program() {
        let runner = LocalRunner::new();
        let result = runner.run("/nonexistent/rbd", &[], None).await;
        assert!(matches!(result, Err(OperationError::Internal(_))));
    }
}
