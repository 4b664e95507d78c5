//! Timeout-bounded execution of external tools (`security`, `xcodebuild`, `xcrun`)

use crate::error::{ReleaseError, Result};
use std::ffi::OsStr;
use std::path::Path;
use std::process::Output;
use std::time::Duration;

/// Run `program` with `args`, killing it if it outlives `timeout`.
///
/// A missing executable maps to [`ReleaseError::MissingDependency`]; an
/// elapsed timeout maps to [`ReleaseError::Timeout`]. A non-zero exit status
/// is returned as-is for the caller to interpret.
pub async fn run_tool<I, S>(
    program: &str,
    args: I,
    timeout: Duration,
    cwd: Option<&Path>,
    envs: &[(&str, &OsStr)],
) -> Result<Output>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut command = tokio::process::Command::new(program);
    command.args(args).kill_on_drop(true);
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }
    for (key, value) in envs {
        command.env(key, value);
    }

    let child = command.output();
    match tokio::time::timeout(timeout, child).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(ReleaseError::MissingDependency(format!(
                "'{program}' command not found in PATH"
            )))
        }
        Ok(Err(e)) => Err(ReleaseError::CommandExecution(format!(
            "Failed to execute {program}: {e}"
        ))),
        Err(_) => Err(ReleaseError::Timeout {
            operation: program.to_string(),
            seconds: timeout.as_secs(),
        }),
    }
}

/// Lossy stderr, falling back to stdout when stderr is empty.
#[must_use]
pub fn failure_text(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.trim().is_empty() {
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    } else {
        stderr.trim().to_string()
    }
}
