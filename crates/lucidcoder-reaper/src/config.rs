use std::collections::BTreeSet;
use std::time::Duration;

use lucidcoder_schema::ports::parse_list;
use serde::{Deserialize, Serialize};

fn default_force_delay_ms() -> u64 {
    1000
}

fn default_port_force_delay_ms() -> u64 {
    250
}

fn default_release_delay_wait_ms() -> u64 {
    2000
}

fn default_release_delay_quick_ms() -> u64 {
    500
}

fn default_port_wait_timeout_ms() -> u64 {
    5000
}

fn default_port_wait_interval_ms() -> u64 {
    250
}

/// The `reaper` section of `main.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReaperConfig {
    #[serde(default)]
    pub protected_pids: BTreeSet<u32>,
    #[serde(default)]
    pub host_ports: BTreeSet<u16>,
    #[serde(default = "default_force_delay_ms")]
    pub force_delay_ms: u64,
    #[serde(default = "default_port_force_delay_ms")]
    pub port_force_delay_ms: u64,
    #[serde(default = "default_release_delay_wait_ms")]
    pub release_delay_wait_ms: u64,
    #[serde(default = "default_release_delay_quick_ms")]
    pub release_delay_quick_ms: u64,
    #[serde(default = "default_port_wait_timeout_ms")]
    pub port_wait_timeout_ms: u64,
    #[serde(default = "default_port_wait_interval_ms")]
    pub port_wait_interval_ms: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            protected_pids: BTreeSet::new(),
            host_ports: BTreeSet::new(),
            force_delay_ms: default_force_delay_ms(),
            port_force_delay_ms: default_port_force_delay_ms(),
            release_delay_wait_ms: default_release_delay_wait_ms(),
            release_delay_quick_ms: default_release_delay_quick_ms(),
            port_wait_timeout_ms: default_port_wait_timeout_ms(),
            port_wait_interval_ms: default_port_wait_interval_ms(),
        }
    }
}

impl ReaperConfig {
    /// Merges `LUCIDCODER_PROTECTED_PIDS`, `LUCIDCODER_HOST_PORTS` and
    /// `VITE_PORT` from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|name| std::env::var(name).ok());
    }

    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(raw) = lookup("LUCIDCODER_PROTECTED_PIDS") {
            self.protected_pids.extend(parse_list::<u32>(&raw));
        }
        if let Some(raw) = lookup("LUCIDCODER_HOST_PORTS") {
            self.host_ports.extend(parse_list::<u16>(&raw));
        }
        if let Some(raw) = lookup("VITE_PORT") {
            self.host_ports.extend(parse_list::<u16>(&raw));
        }
    }

    pub fn force_delay(&self) -> Duration {
        Duration::from_millis(self.force_delay_ms)
    }

    pub fn port_force_delay(&self) -> Duration {
        Duration::from_millis(self.port_force_delay_ms)
    }

    pub fn release_delay(&self, wait_for_release: bool) -> Duration {
        if wait_for_release {
            Duration::from_millis(self.release_delay_wait_ms)
        } else {
            Duration::from_millis(self.release_delay_quick_ms)
        }
    }

    pub fn port_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.port_wait_timeout_ms)
    }

    pub fn port_wait_interval(&self) -> Duration {
        Duration::from_millis(self.port_wait_interval_ms)
    }
}
