use std::time::Duration;

use async_trait::async_trait;

use crate::controller::{parse_pid_list, run_tool, ProcessController};
use crate::ReaperError;

/// Signals via `kill(2)`, discovery via `lsof` with a `fuser` fallback.
#[derive(Debug, Default, Clone)]
pub struct PosixController;

impl PosixController {
    pub fn new() -> Self {
        Self
    }
}

/// Sends `signal` to the process group led by `pid`, falling back to the pid
/// itself. Returns `Ok(false)` when there was nothing left to signal.
fn signal_tree(pid: u32, signal: libc::c_int) -> Result<bool, ReaperError> {
    // 0 and 1 would address our own group or every process.
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return Ok(false);
    };
    if raw <= 1 {
        return Ok(false);
    }

    // SAFETY: kill(2) has no memory-safety preconditions.
    if unsafe { libc::kill(-raw, signal) } == 0 {
        return Ok(true);
    }
    if unsafe { libc::kill(raw, signal) } == 0 {
        return Ok(true);
    }

    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ESRCH) => Ok(false),
        Some(libc::EPERM) => Err(ReaperError::PermissionDenied { pid }),
        _ => Err(ReaperError::Io(err)),
    }
}

pub(crate) fn probe(pid: u32) -> bool {
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    // SAFETY: signal 0 only performs the existence and permission checks.
    if unsafe { libc::kill(raw, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[async_trait]
impl ProcessController for PosixController {
    async fn find_pids_by_port(&self, port: u16) -> Vec<u32> {
        let spec = format!("tcp:{port}");
        if let Some(output) = run_tool("lsof", &["-ti", &spec]).await {
            return parse_pid_list(&output);
        }
        let port = port.to_string();
        if let Some(output) = run_tool("fuser", &["-n", "tcp", &port]).await {
            return parse_pid_list(&output);
        }
        Vec::new()
    }

    async fn kill_tree(&self, pid: u32, force_delay: Duration) -> Result<(), ReaperError> {
        if !signal_tree(pid, libc::SIGTERM)? {
            tracing::debug!(pid, "process already gone");
            return Ok(());
        }
        tokio::time::sleep(force_delay).await;
        match signal_tree(pid, libc::SIGKILL) {
            Ok(true) => tracing::debug!(pid, "escalated to SIGKILL"),
            Ok(false) => {}
            Err(err) if !probe(pid) => {
                tracing::debug!(pid, error = %err, "SIGKILL failed but process is gone");
            }
            Err(err) => return Err(err),
        }
        Ok(())
    }

    async fn is_alive(&self, pid: u32) -> bool {
        probe(pid)
    }
}
