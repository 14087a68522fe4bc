use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use lucidcoder_gateway::GatewayConfig;
use lucidcoder_reaper::ReaperConfig;
use lucidcoder_runtime::LauncherConfig;
use serde::{Deserialize, Serialize};

fn default_listen() -> String {
    "127.0.0.1:5000".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Exposes `/__debug/running-processes`.
    #[serde(default)]
    pub debug_routes: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            debug_routes: false,
        }
    }
}

/// Contents of `<root>/config/main.yaml`. Every section is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LucidcoderConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub reaper: ReaperConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub launcher: LauncherConfig,
}

impl LucidcoderConfig {
    pub fn apply_env(&mut self) {
        self.apply_env_from(|name| std::env::var(name).ok());
    }

    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        self.reaper.apply_env_from(&lookup);
        self.gateway.apply_env_from(&lookup);
        self.launcher.apply_env_from(&lookup);
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.server
            .listen
            .parse()
            .with_context(|| format!("invalid server.listen address: {}", self.server.listen))
    }
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join("config").join("main.yaml")
}

/// Reads `main.yaml` if present, applies environment overrides and validates.
pub fn load_config(root: &Path) -> Result<LucidcoderConfig> {
    let path = config_path(root);
    let mut config = if path.exists() {
        read_yaml_file(&path)?
    } else {
        tracing::debug!(path = %path.display(), "no config file, using defaults");
        LucidcoderConfig::default()
    };
    config.apply_env();
    validate_config(&config)?;
    Ok(config)
}

pub fn validate_config(config: &LucidcoderConfig) -> Result<()> {
    config.listen_addr()?;

    if config.gateway.failure_threshold == 0 {
        return Err(anyhow!("gateway.failure_threshold must be at least 1"));
    }
    if config.reaper.port_wait_interval_ms == 0 {
        return Err(anyhow!("reaper.port_wait_interval_ms must be positive"));
    }
    if config.launcher.frontend_command.is_empty() {
        return Err(anyhow!("launcher.frontend_command must not be empty"));
    }
    if config.launcher.backend_command.is_empty() {
        return Err(anyhow!("launcher.backend_command must not be empty"));
    }
    if config.launcher.port_search_span == 0 {
        return Err(anyhow!("launcher.port_search_span must be positive"));
    }

    Ok(())
}

fn read_yaml_file(path: &Path) -> Result<LucidcoderConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    if content.trim().is_empty() {
        return Ok(LucidcoderConfig::default());
    }
    serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse yaml file: {}", path.display()))
}
