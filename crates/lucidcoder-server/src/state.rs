use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use lucidcoder_gateway::PreviewGateway;
use lucidcoder_reaper::{default_controller, ProcessTerminator, Reaper};
use lucidcoder_registry::ProcessRegistry;
use lucidcoder_runtime::{CommandLauncher, ProcessLauncher, ProjectStore, YamlProjectStore};

use crate::config::LucidcoderConfig;

/// Shared application state accessible from all route handlers.
#[derive(Clone)]
pub struct AppState {
    /// Root directory holding config/, logs/ and projects.yaml
    pub root: PathBuf,
    pub registry: ProcessRegistry,
    pub projects: Arc<dyn ProjectStore>,
    pub launcher: Arc<dyn ProcessLauncher>,
    pub terminator: Arc<dyn ProcessTerminator>,
    pub gateway: PreviewGateway,
    pub debug_routes: bool,
}

impl AppState {
    /// Wires the real collaborators: OS process control, the YAML project
    /// store under `root`, and the command launcher.
    pub fn build(root: PathBuf, mut config: LucidcoderConfig) -> Result<Self> {
        let listen = config.listen_addr()?;
        config.reaper.host_ports.insert(listen.port());

        let registry = ProcessRegistry::new();
        let projects: Arc<dyn ProjectStore> = Arc::new(YamlProjectStore::in_root(&root));
        let launcher: Arc<dyn ProcessLauncher> =
            Arc::new(CommandLauncher::new(registry.clone(), config.launcher.clone()));
        let terminator: Arc<dyn ProcessTerminator> = Arc::new(Reaper::new(
            default_controller(),
            registry.clone(),
            config.reaper.clone(),
        ));

        Self::from_parts(
            root,
            registry,
            projects,
            launcher,
            terminator,
            &config,
        )
    }

    pub fn from_parts(
        root: PathBuf,
        registry: ProcessRegistry,
        projects: Arc<dyn ProjectStore>,
        launcher: Arc<dyn ProcessLauncher>,
        terminator: Arc<dyn ProcessTerminator>,
        config: &LucidcoderConfig,
    ) -> Result<Self> {
        let gateway = PreviewGateway::new(
            registry.clone(),
            projects.clone(),
            launcher.clone(),
            terminator.clone(),
            config.gateway.clone(),
        )?;
        Ok(Self {
            root,
            registry,
            projects,
            launcher,
            terminator,
            gateway,
            debug_routes: config.server.debug_routes,
        })
    }
}
