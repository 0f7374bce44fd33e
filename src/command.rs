use crate::errors::{SessionError, SessionResult};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;
use which::which;

/// Runs an external command to completion.
///
/// Implementations return the combined stdout/stderr text on success and a
/// [`SessionError::CommandFailed`] carrying the exit status and the same text
/// otherwise. Callers pattern-match that text, so it must not be rewritten.
#[async_trait]
pub trait CommandRunner: Send + Sync + 'static {
    async fn run(&self, program: &str, args: &[&str]) -> SessionResult<String>;
}

/// Executes commands on the host with `tokio::process`.
#[derive(Clone, Copy, Debug, Default)]
pub struct HostCommandRunner;

#[async_trait]
impl CommandRunner for HostCommandRunner {
    async fn run(&self, program: &str, args: &[&str]) -> SessionResult<String> {
        if program.is_empty() {
            return Err(SessionError::InvalidRequest("no command provided".into()));
        }

        let output = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await?;

        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        let command = format_command(program, args);
        if output.status.success() {
            debug!(%command, "command succeeded");
            return Ok(combined);
        }

        Err(SessionError::CommandFailed {
            command,
            message: format!("{}, output: {}", output.status, combined.trim_end()),
        })
    }
}

pub fn format_command(program: &str, args: &[&str]) -> String {
    if args.is_empty() {
        return program.to_string();
    }
    format!("{program} {}", args.join(" "))
}

pub fn find_binary(name: &str) -> SessionResult<String> {
    let binary_path = which(name)
        .map_err(|_| SessionError::MissingBinary(name.to_owned()))?
        .to_string_lossy()
        .to_string();
    Ok(binary_path)
}
