//! Bookkeeping for self-healing: remembered bad ports and auto-restart state.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use lucidcoder_registry::ProjectKey;

use crate::config::GatewayConfig;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Copy)]
struct RememberedBadPort {
    port: u16,
    recorded_at: Instant,
}

/// Ports that just refused a connection, per project, for a short TTL.
#[derive(Debug)]
pub struct BadPortCache {
    ttl: Duration,
    entries: Mutex<HashMap<ProjectKey, RememberedBadPort>>,
}

impl BadPortCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn remember(&self, key: &ProjectKey, port: u16) {
        self.remember_at(key, port, Instant::now());
    }

    pub fn remember_at(&self, key: &ProjectKey, port: u16, now: Instant) {
        lock(&self.entries).insert(
            key.clone(),
            RememberedBadPort {
                port,
                recorded_at: now,
            },
        );
    }

    pub fn get(&self, key: &ProjectKey) -> Option<u16> {
        self.get_at(key, Instant::now())
    }

    pub fn get_at(&self, key: &ProjectKey, now: Instant) -> Option<u16> {
        let mut entries = lock(&self.entries);
        let entry = *entries.get(key)?;
        if now.saturating_duration_since(entry.recorded_at) >= self.ttl {
            entries.remove(key);
            return None;
        }
        Some(entry.port)
    }

    pub fn forget(&self, key: &ProjectKey) {
        lock(&self.entries).remove(key);
    }
}

#[derive(Debug, Clone, Copy)]
struct AutoRestartState {
    first_failure_at: Instant,
    last_failure_at: Instant,
    failure_count: u32,
    last_restart_at: Option<Instant>,
    /// `last_restart_at` before the in-flight restart was scheduled.
    previous_restart_at: Option<Instant>,
    in_flight: bool,
}

impl AutoRestartState {
    fn new(now: Instant) -> Self {
        Self {
            first_failure_at: now,
            last_failure_at: now,
            failure_count: 0,
            last_restart_at: None,
            previous_restart_at: None,
            in_flight: false,
        }
    }
}

/// Decides when repeated connection failures warrant a restart.
#[derive(Debug)]
pub struct RestartTracker {
    window: Duration,
    threshold: u32,
    cooldown: Duration,
    states: Mutex<HashMap<ProjectKey, AutoRestartState>>,
}

impl RestartTracker {
    pub fn new(window: Duration, threshold: u32, cooldown: Duration) -> Self {
        Self {
            window,
            threshold: threshold.max(1),
            cooldown,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(
            config.failure_window(),
            config.failure_threshold,
            config.restart_cooldown(),
        )
    }

    /// Records a failure. Returns `true` when the caller now owns the
    /// project's single in-flight restart.
    pub fn record_failure(&self, key: &ProjectKey) -> bool {
        self.record_failure_at(key, Instant::now())
    }

    pub fn record_failure_at(&self, key: &ProjectKey, now: Instant) -> bool {
        let mut states = lock(&self.states);
        let state = states
            .entry(key.clone())
            .or_insert_with(|| AutoRestartState::new(now));

        if now.saturating_duration_since(state.last_failure_at) > self.window {
            state.first_failure_at = now;
            state.failure_count = 0;
        }
        state.failure_count += 1;
        state.last_failure_at = now;

        if state.in_flight || state.failure_count < self.threshold {
            return false;
        }
        let cooling_down = state
            .last_restart_at
            .is_some_and(|at| now.saturating_duration_since(at) < self.cooldown);
        if cooling_down {
            tracing::debug!(project_id = %key, "restart suppressed during cooldown");
            return false;
        }

        tracing::info!(
            project_id = %key,
            failures = state.failure_count,
            since_ms = now.saturating_duration_since(state.first_failure_at).as_millis() as u64,
            "scheduling preview restart"
        );
        state.in_flight = true;
        state.previous_restart_at = state.last_restart_at;
        state.last_restart_at = Some(now);
        state.failure_count = 0;
        state.first_failure_at = now;
        true
    }

    /// Releases the in-flight slot. A restart that did not succeed does not
    /// start a cooldown, so the next failures can try again.
    pub fn finish(&self, key: &ProjectKey, succeeded: bool) {
        if let Some(state) = lock(&self.states).get_mut(key) {
            state.in_flight = false;
            if !succeeded {
                state.last_restart_at = state.previous_restart_at;
            }
        }
    }

    pub fn in_flight(&self, key: &ProjectKey) -> bool {
        lock(&self.states)
            .get(key)
            .is_some_and(|state| state.in_flight)
    }
}
