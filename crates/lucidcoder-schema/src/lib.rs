pub mod logs;
pub mod ports;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use logs::{LogEntry, LogRing, LogStream, MAX_EXPOSED_LOG_ENTRIES};

/// Lifecycle status of a single spawned dev-server process.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    #[default]
    Starting,
    Running,
    Exited,
}

/// Which half of a project a handle belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProcessTarget {
    Frontend,
    Backend,
}

impl ProcessTarget {
    pub const ALL: [ProcessTarget; 2] = [ProcessTarget::Frontend, ProcessTarget::Backend];

    pub fn sibling(self) -> Self {
        match self {
            ProcessTarget::Frontend => ProcessTarget::Backend,
            ProcessTarget::Backend => ProcessTarget::Frontend,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProcessTarget::Frontend => "frontend",
            ProcessTarget::Backend => "backend",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "frontend" => Some(ProcessTarget::Frontend),
            "backend" => Some(ProcessTarget::Backend),
            _ => None,
        }
    }
}

impl fmt::Display for ProcessTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One spawned dev-server process.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessHandle {
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub status: ProcessStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_heartbeat: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub signal: Option<String>,
    #[serde(default)]
    pub logs: LogRing,
}

impl ProcessHandle {
    pub fn new(pid: Option<u32>, port: Option<u16>) -> Self {
        let now = Utc::now();
        Self {
            pid,
            port,
            status: ProcessStatus::Starting,
            started_at: Some(now),
            last_heartbeat: Some(now),
            ..Self::default()
        }
    }

    pub fn is_exited(&self) -> bool {
        self.status == ProcessStatus::Exited
    }

    pub fn mark_exited(&mut self, exit_code: Option<i32>, signal: Option<String>) {
        self.status = ProcessStatus::Exited;
        self.ended_at = Some(Utc::now());
        if exit_code.is_some() {
            self.exit_code = exit_code;
        }
        if signal.is_some() {
            self.signal = signal;
        }
    }
}

/// The frontend/backend pair of handles for one project.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ProcessMap {
    #[serde(default)]
    pub frontend: Option<ProcessHandle>,
    #[serde(default)]
    pub backend: Option<ProcessHandle>,
}

impl ProcessMap {
    pub fn is_empty(&self) -> bool {
        self.frontend.is_none() && self.backend.is_none()
    }

    pub fn get(&self, target: ProcessTarget) -> Option<&ProcessHandle> {
        match target {
            ProcessTarget::Frontend => self.frontend.as_ref(),
            ProcessTarget::Backend => self.backend.as_ref(),
        }
    }

    pub fn get_mut(&mut self, target: ProcessTarget) -> Option<&mut ProcessHandle> {
        match target {
            ProcessTarget::Frontend => self.frontend.as_mut(),
            ProcessTarget::Backend => self.backend.as_mut(),
        }
    }

    pub fn slot(&mut self, target: ProcessTarget) -> &mut Option<ProcessHandle> {
        match target {
            ProcessTarget::Frontend => &mut self.frontend,
            ProcessTarget::Backend => &mut self.backend,
        }
    }

    pub fn take(&mut self, target: ProcessTarget) -> Option<ProcessHandle> {
        self.slot(target).take()
    }

    pub fn port(&self, target: ProcessTarget) -> Option<u16> {
        self.get(target).and_then(|h| h.port)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    #[default]
    Idle,
    Running,
    Stopped,
}

impl RecordState {
    /// Parses a stored state label. Anything unrecognised is treated as stopped.
    pub fn from_label(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "running" => RecordState::Running,
            "idle" => RecordState::Idle,
            _ => RecordState::Stopped,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RecordState::Idle => "idle",
            RecordState::Running => "running",
            RecordState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for RecordState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who started the processes: a user action or the gateway's self-heal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LaunchType {
    #[default]
    Manual,
    Auto,
}

/// Canonical per-project process record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRecord {
    pub processes: ProcessMap,
    pub state: RecordState,
    pub updated_at: DateTime<Utc>,
    pub last_state_change: DateTime<Utc>,
    #[serde(default)]
    pub last_terminated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub snapshot_visible: bool,
    #[serde(default)]
    pub launch_type: LaunchType,
}

impl ProcessRecord {
    pub fn is_active(&self) -> bool {
        self.state == RecordState::Running && !self.processes.is_empty()
    }
}

/// Read-side view of a record handed to callers.
#[derive(Debug, Clone, Serialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSnapshot {
    pub processes: ProcessMap,
    pub state: RecordState,
    pub snapshot_visible: bool,
    pub launch_type: LaunchType,
}

impl ProcessSnapshot {
    pub fn is_active(&self) -> bool {
        self.state == RecordState::Running && !self.processes.is_empty()
    }
}

impl From<&ProcessRecord> for ProcessSnapshot {
    fn from(record: &ProcessRecord) -> Self {
        Self {
            processes: record.processes.clone(),
            state: record.state,
            snapshot_visible: record.snapshot_visible,
            launch_type: record.launch_type,
        }
    }
}

/// Project metadata as exposed by the project store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ProjectInfo {
    pub id: String,
    pub path: String,
    #[serde(default)]
    pub frontend_port: Option<u16>,
    #[serde(default)]
    pub backend_port: Option<u16>,
    #[serde(default)]
    pub frontend_framework: Option<String>,
    #[serde(default)]
    pub backend_framework: Option<String>,
}

impl ProjectInfo {
    pub fn stored_port(&self, target: ProcessTarget) -> Option<u16> {
        match target {
            ProcessTarget::Frontend => self.frontend_port,
            ProcessTarget::Backend => self.backend_port,
        }
    }

    pub fn framework(&self, target: ProcessTarget) -> Option<&str> {
        match target {
            ProcessTarget::Frontend => self.frontend_framework.as_deref(),
            ProcessTarget::Backend => self.backend_framework.as_deref(),
        }
    }

    /// Stored port for `target`, else the framework default.
    pub fn port_hint(&self, target: ProcessTarget) -> Option<u16> {
        self.stored_port(target)
            .or_else(|| ports::default_port_for_framework(target, self.framework(target)))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ProjectPorts {
    pub frontend: Option<u16>,
    pub backend: Option<u16>,
}

impl ProjectPorts {
    pub fn from_processes(processes: &ProcessMap) -> Self {
        Self {
            frontend: processes.port(ProcessTarget::Frontend),
            backend: processes.port(ProcessTarget::Backend),
        }
    }
}

/// Options accepted by a process launcher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct StartOptions {
    #[serde(default)]
    pub frontend_port: Option<u16>,
    #[serde(default)]
    pub backend_port: Option<u16>,
    #[serde(default)]
    pub frontend_port_base: Option<u16>,
    #[serde(default)]
    pub backend_port_base: Option<u16>,
    /// Registry key that spawned processes stream their output into.
    #[serde(default)]
    pub log_key: Option<String>,
    /// Launch only this half of the project.
    #[serde(default)]
    pub target: Option<ProcessTarget>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StartResult {
    pub success: bool,
    #[serde(default)]
    pub processes: ProcessMap,
    #[serde(default)]
    pub error: Option<String>,
}

impl StartResult {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            processes: ProcessMap::default(),
            error: Some(error.into()),
        }
    }
}
