use crate::error::{Result, RuntimeError};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Output from a command execution
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Execute a command and fail on non-zero exit code
pub async fn exec(program: &str, args: &[&str], limit: Duration) -> Result<CommandOutput> {
    check(program, args, exec_unchecked(program, args, limit).await?)
}

/// Execute a command feeding `input` on stdin, failing on non-zero exit code
pub async fn exec_with_stdin(
    program: &str,
    args: &[&str],
    input: &[u8],
    limit: Duration,
) -> Result<CommandOutput> {
    check(program, args, run(program, args, Some(input), limit).await?)
}

/// Execute a command and return output regardless of exit code
pub async fn exec_unchecked(program: &str, args: &[&str], limit: Duration) -> Result<CommandOutput> {
    run(program, args, None, limit).await
}

fn check(program: &str, args: &[&str], output: CommandOutput) -> Result<CommandOutput> {
    if !output.success() {
        return Err(RuntimeError::command_failed(
            format!("{} {}", program, args.join(" ")),
            output.exit_code,
            output.stderr.trim(),
        ));
    }
    Ok(output)
}

async fn run(
    program: &str,
    args: &[&str],
    input: Option<&[u8]>,
    limit: Duration,
) -> Result<CommandOutput> {
    let command_line = format!("{} {}", program, args.join(" "));
    debug!("Executing: {}", command_line);

    let mut child = tokio::process::Command::new(program)
        .args(args)
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| RuntimeError::command_failed(&command_line, -1, e.to_string()))?;

    if let (Some(input), Some(mut stdin)) = (input, child.stdin.take()) {
        stdin
            .write_all(input)
            .await
            .map_err(|e| RuntimeError::command_failed(&command_line, -1, e.to_string()))?;
        // Close stdin so the child sees EOF
        drop(stdin);
    }

    // The child is killed when the timed-out future drops it
    let output = tokio::time::timeout(limit, child.wait_with_output())
        .await
        .map_err(|_| RuntimeError::timeout(&command_line, limit.as_secs()))?
        .map_err(|e| RuntimeError::command_failed(&command_line, -1, e.to_string()))?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let exit_code = output.status.code().unwrap_or(-1);

    debug!("Command exited with code {}: {}", exit_code, command_line);

    Ok(CommandOutput {
        stdout,
        stderr,
        exit_code,
    })
}

/// Bound an external call by `limit`, surfacing expiry as `Timeout`
pub async fn bounded<T, F>(operation: &str, limit: Duration, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| RuntimeError::timeout(operation, limit.as_secs()))?
}
