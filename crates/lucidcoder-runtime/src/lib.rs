//! Collaborators the orchestrator drives: project metadata and process launch.

pub mod launcher;
pub mod store;

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use lucidcoder_schema::{ProjectInfo, ProjectPorts, StartOptions, StartResult};

pub use launcher::{CommandLauncher, LauncherConfig};
pub use store::YamlProjectStore;

#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn get_project(&self, id: &str) -> Result<Option<ProjectInfo>>;

    /// Persists the ports a project's processes were last started on.
    async fn update_project_ports(&self, id: &str, ports: ProjectPorts) -> Result<()>;
}

#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Starts a project's dev servers. Launch failures are reported through
    /// `StartResult::error`; `Err` is reserved for unexpected I/O.
    async fn start_project(&self, path: &Path, options: StartOptions) -> Result<StartResult>;

    async fn install_dependencies(&self, path: &Path) -> Result<()>;
}
