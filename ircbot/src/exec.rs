//! Helpers for handlers that shell out or do blocking work.

use anyhow::{Context, Result};
use tokio::process::Command;

use crate::connection::BotHandle;

/// Run `command` through `sh -c` and return its output lines.
///
/// stderr is merged after stdout. A non-zero exit status is not an error;
/// whatever the command printed is returned.
pub async fn check_output_lines(command: &str) -> Result<Vec<String>> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .output()
        .await
        .with_context(|| format!("Failed to execute {command:?}"))?;

    if !output.status.success() {
        tracing::debug!(%command, status = %output.status, "Command exited unsuccessfully");
    }

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(text.split('\n').map(str::to_string).collect())
}

/// Run `command` and send each output line to `channel`, or to every
/// configured channel when `None`. Empty lines are skipped by the send path.
pub async fn execute_command(bot: &BotHandle, command: &str, channel: Option<&str>) -> Result<()> {
    for line in check_output_lines(command).await? {
        bot.say(&line, channel).await?;
    }
    Ok(())
}

/// Run blocking work on the blocking thread pool so the receive loop and
/// other handlers keep running.
pub async fn run_blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .context("Blocking task panicked or was cancelled")
}
