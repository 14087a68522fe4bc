use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::ReaperError;

/// Platform-specific process control.
#[async_trait]
pub trait ProcessController: Send + Sync {
    /// Pids owning `port`. Tool failures yield an empty list.
    async fn find_pids_by_port(&self, port: u16) -> Vec<u32>;

    /// Terminates `pid` and its children, escalating after `force_delay`.
    /// A process that is already gone is not an error.
    async fn kill_tree(&self, pid: u32, force_delay: Duration) -> Result<(), ReaperError>;

    /// Liveness probe. A process we may not signal still counts as alive.
    async fn is_alive(&self, pid: u32) -> bool;
}

/// The controller for the platform this binary was built for.
pub fn default_controller() -> Arc<dyn ProcessController> {
    #[cfg(windows)]
    {
        Arc::new(crate::windows::WindowsController::new())
    }
    #[cfg(unix)]
    {
        Arc::new(crate::posix::PosixController::new())
    }
}

/// Runs a discovery tool, returning stdout only when it exits successfully.
pub(crate) async fn run_tool(program: &str, args: &[&str]) -> Option<String> {
    let output = tokio::time::timeout(
        Duration::from_secs(5),
        tokio::process::Command::new(program)
            .args(args)
            .stdin(std::process::Stdio::null())
            .output(),
    )
    .await;

    match output {
        Ok(Ok(output)) if output.status.success() => {
            Some(String::from_utf8_lossy(&output.stdout).into_owned())
        }
        Ok(Ok(output)) => {
            tracing::trace!(program, status = ?output.status, "tool exited unsuccessfully");
            None
        }
        Ok(Err(err)) => {
            tracing::debug!(program, error = %err, "tool unavailable");
            None
        }
        Err(_) => {
            tracing::debug!(program, "tool timed out");
            None
        }
    }
}

/// Parses whitespace separated pids as printed by `lsof -t` or `fuser`.
/// `fuser` may suffix pids with access letters, which are dropped.
pub fn parse_pid_list(output: &str) -> Vec<u32> {
    let mut pids: Vec<u32> = output
        .split_whitespace()
        .filter_map(|token| {
            let digits_end = token
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(token.len());
            let (digits, suffix) = token.split_at(digits_end);
            if !suffix.chars().all(|c| c.is_ascii_alphabetic()) {
                return None;
            }
            digits.parse::<u32>().ok()
        })
        .filter(|pid| *pid > 0)
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}
