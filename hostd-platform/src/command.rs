use hostd_core::{HostdError, Result};
use std::ffi::OsStr;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::debug;

/// Captured result of an external tool invocation.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Run `tool` and capture its output without judging the exit status.
pub async fn run_tool_status<I, S>(tool: &str, args: I) -> Result<ToolOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let args: Vec<_> = args.into_iter().map(|a| a.as_ref().to_owned()).collect();
    debug!("Exec {} {:?}", tool, args);

    let output = Command::new(tool)
        .args(&args)
        .output()
        .await
        .map_err(|e| HostdError::tool(tool, "spawn", e.to_string()))?;

    Ok(ToolOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Run `tool`, failing with `ToolFailed` carrying `operation` and stderr on a
/// non-zero exit. Returns stdout.
pub async fn run_tool<I, S>(tool: &str, args: I, operation: &str) -> Result<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_tool_status(tool, args).await?;
    if !output.success() {
        let message = if output.stderr.trim().is_empty() {
            format!("exit status {:?}: {}", output.code, output.stdout.trim())
        } else {
            output.stderr.trim().to_string()
        };
        return Err(HostdError::tool(tool, operation, message));
    }
    Ok(output.stdout)
}

pub fn tool_path(tool: &str) -> Option<PathBuf> {
    which::which(tool).ok()
}
