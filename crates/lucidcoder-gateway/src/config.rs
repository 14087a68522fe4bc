use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_failure_window_ms() -> u64 {
    10_000
}

fn default_failure_threshold() -> u32 {
    2
}

fn default_restart_cooldown_ms() -> u64 {
    30_000
}

fn default_bad_port_ttl_ms() -> u64 {
    5_000
}

fn default_retry_delay_ms() -> u64 {
    1_500
}

fn default_connect_timeout_ms() -> u64 {
    3_000
}

fn default_request_timeout_ms() -> u64 {
    60_000
}

fn default_max_request_body_bytes() -> usize {
    64 * 1024 * 1024
}

/// The `gateway` section of `main.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayConfig {
    /// Fixed upstream host. Unset means "derive from the request".
    #[serde(default)]
    pub upstream_host: Option<String>,
    #[serde(default = "default_failure_window_ms")]
    pub failure_window_ms: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_restart_cooldown_ms")]
    pub restart_cooldown_ms: u64,
    #[serde(default = "default_bad_port_ttl_ms")]
    pub bad_port_ttl_ms: u64,
    /// Reload delay of the retry page shown to iframe navigations.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Bounds the wait for response headers and the buffering of HTML.
    /// Streamed bodies are not cut off.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_max_request_body_bytes")]
    pub max_request_body_bytes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            upstream_host: None,
            failure_window_ms: default_failure_window_ms(),
            failure_threshold: default_failure_threshold(),
            restart_cooldown_ms: default_restart_cooldown_ms(),
            bad_port_ttl_ms: default_bad_port_ttl_ms(),
            retry_delay_ms: default_retry_delay_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            max_request_body_bytes: default_max_request_body_bytes(),
        }
    }
}

impl GatewayConfig {
    pub fn apply_env(&mut self) {
        self.apply_env_from(|name| std::env::var(name).ok());
    }

    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("LUCIDCODER_PREVIEW_UPSTREAM_HOST") {
            let host = host.trim();
            if !host.is_empty() {
                self.upstream_host = Some(host.to_string());
            }
        }
    }

    pub fn failure_window(&self) -> Duration {
        Duration::from_millis(self.failure_window_ms)
    }

    pub fn restart_cooldown(&self) -> Duration {
        Duration::from_millis(self.restart_cooldown_ms)
    }

    pub fn bad_port_ttl(&self) -> Duration {
        Duration::from_millis(self.bad_port_ttl_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
