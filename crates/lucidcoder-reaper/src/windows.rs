use std::time::Duration;

use async_trait::async_trait;

use crate::controller::{run_tool, ProcessController};
use crate::ReaperError;

/// `netstat`/`taskkill`/`tasklist` based control for Windows hosts.
#[derive(Debug, Default, Clone)]
pub struct WindowsController;

impl WindowsController {
    pub fn new() -> Self {
        Self
    }
}

/// Pids from `netstat -ano` output whose local address ends in `:port`.
pub fn parse_netstat(output: &str, port: u16) -> Vec<u32> {
    let suffix = format!(":{port}");
    let mut pids: Vec<u32> = output
        .lines()
        .filter_map(|line| {
            let columns: Vec<&str> = line.split_whitespace().collect();
            if columns.len() < 4 || !columns[0].eq_ignore_ascii_case("tcp") {
                return None;
            }
            if !columns[1].ends_with(&suffix) {
                return None;
            }
            columns.last()?.parse::<u32>().ok()
        })
        .filter(|pid| *pid > 0)
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

fn is_not_found(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("not found") || lower.contains("no running instance")
}

#[async_trait]
impl ProcessController for WindowsController {
    async fn find_pids_by_port(&self, port: u16) -> Vec<u32> {
        match run_tool("netstat", &["-ano"]).await {
            Some(output) => parse_netstat(&output, port),
            None => Vec::new(),
        }
    }

    async fn kill_tree(&self, pid: u32, _force_delay: Duration) -> Result<(), ReaperError> {
        let pid_arg = pid.to_string();
        let output = tokio::process::Command::new("taskkill")
            .args(["/PID", &pid_arg, "/T", "/F"])
            .output()
            .await?;
        if output.status.success() {
            return Ok(());
        }
        let message = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        if is_not_found(&message) {
            tracing::debug!(pid, "process already gone");
            return Ok(());
        }
        Err(ReaperError::CommandFailed {
            command: "taskkill".into(),
            message: message.trim().to_string(),
        })
    }

    async fn is_alive(&self, pid: u32) -> bool {
        let filter = format!("PID eq {pid}");
        let Some(output) = run_tool("tasklist", &["/FI", &filter, "/NH"]).await else {
            return false;
        };
        let needle = pid.to_string();
        output
            .lines()
            .any(|line| line.split_whitespace().nth(1) == Some(needle.as_str()))
    }
}
