//! In-memory registry of the last-known dev-server processes per project.
//!
//! The registry owns its map behind a single mutex. Callers read snapshots
//! and write through [`ProcessRegistry::store`] or the narrow mutators below;
//! a returned snapshot is a copy and mutating it has no effect until stored.

mod key;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use lucidcoder_schema::{
    LaunchType, LogStream, ProcessHandle, ProcessMap, ProcessRecord, ProcessSnapshot,
    ProcessStatus, ProcessTarget, RecordState,
};
use serde::{Deserialize, Serialize};

pub use key::ProjectKey;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("invalid project key: {0:?}")]
    InvalidKey(String),
    #[error("malformed registry entry: {0}")]
    MalformedEntry(#[from] serde_json::Error),
}

/// Options for [`ProcessRegistry::store`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreOptions {
    pub expose_snapshot: Option<bool>,
    pub launch_type: Option<LaunchType>,
}

impl StoreOptions {
    pub fn exposed(expose: bool) -> Self {
        Self {
            expose_snapshot: Some(expose),
            launch_type: None,
        }
    }

    pub fn launched(launch_type: LaunchType) -> Self {
        Self {
            expose_snapshot: None,
            launch_type: Some(launch_type),
        }
    }
}

/// Older shapes the map may still hold (imported dumps, earlier writers).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum StoredEntry {
    Record(ProcessRecord),
    Legacy(LegacyEntry),
    Bare(ProcessMap),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LegacyEntry {
    #[serde(default)]
    processes: Option<ProcessMap>,
    state: String,
}

impl StoredEntry {
    fn normalize(&self, now: DateTime<Utc>) -> ProcessRecord {
        let mut record = match self {
            StoredEntry::Record(record) => record.clone(),
            StoredEntry::Legacy(legacy) => {
                let processes = legacy.processes.clone().unwrap_or_default();
                ProcessRecord {
                    snapshot_visible: !processes.is_empty(),
                    processes,
                    state: RecordState::from_label(&legacy.state),
                    updated_at: now,
                    last_state_change: now,
                    last_terminated_at: None,
                    launch_type: LaunchType::Manual,
                }
            }
            StoredEntry::Bare(processes) => {
                let state = if processes.is_empty() {
                    RecordState::Idle
                } else {
                    RecordState::Running
                };
                ProcessRecord {
                    processes: processes.clone(),
                    state,
                    updated_at: now,
                    last_state_change: now,
                    last_terminated_at: None,
                    snapshot_visible: !processes.is_empty(),
                    launch_type: LaunchType::Manual,
                }
            }
        };
        if record.state == RecordState::Running && record.processes.is_empty() {
            record.state = RecordState::Stopped;
            record.last_state_change = now;
        }
        record
    }
}

/// Shared handle to the process registry. Cloning shares the same map.
#[derive(Debug, Clone, Default)]
pub struct ProcessRegistry {
    entries: Arc<Mutex<HashMap<ProjectKey, StoredEntry>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ProjectKey, StoredEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Normalizes the entry for `key` in place and returns the canonical record.
    fn normalized(
        entries: &mut HashMap<ProjectKey, StoredEntry>,
        key: &ProjectKey,
        now: DateTime<Utc>,
    ) -> Option<ProcessRecord> {
        let entry = entries.get_mut(key)?;
        let record = entry.normalize(now);
        let unchanged = matches!(entry, StoredEntry::Record(existing) if *existing == record);
        if !unchanged {
            *entry = StoredEntry::Record(record.clone());
        }
        Some(record)
    }

    /// Current snapshot for `key`; unknown keys read as idle with no handles.
    pub fn get(&self, key: &ProjectKey) -> ProcessSnapshot {
        self.record(key)
            .map(|record| ProcessSnapshot::from(&record))
            .unwrap_or_default()
    }

    /// Full canonical record including timestamps.
    pub fn record(&self, key: &ProjectKey) -> Option<ProcessRecord> {
        let mut entries = self.lock();
        Self::normalized(&mut entries, key, Utc::now())
    }

    pub fn contains(&self, key: &ProjectKey) -> bool {
        self.lock().contains_key(key)
    }

    /// Records the processes for `key`.
    ///
    /// Only [`RecordState::Running`] is kept as running; every other state is
    /// stored as stopped. A running record without any handle is stored as
    /// stopped as well.
    pub fn store(
        &self,
        key: &ProjectKey,
        processes: ProcessMap,
        state: RecordState,
        options: StoreOptions,
    ) -> ProcessSnapshot {
        let now = Utc::now();
        let mut entries = self.lock();
        let previous = Self::normalized(&mut entries, key, now);

        let next_state = if state == RecordState::Running && !processes.is_empty() {
            RecordState::Running
        } else {
            RecordState::Stopped
        };

        let snapshot_visible = if next_state == RecordState::Running {
            true
        } else {
            options
                .expose_snapshot
                .or(previous.as_ref().map(|p| p.snapshot_visible))
                .unwrap_or(!processes.is_empty())
        };

        let previous_launch = previous.as_ref().map(|p| p.launch_type).unwrap_or_default();
        let launch_type = if next_state == RecordState::Running {
            options.launch_type.unwrap_or(LaunchType::Manual)
        } else {
            previous_launch
        };

        let previous_state = previous.as_ref().map(|p| p.state);
        let last_state_change = match &previous {
            Some(p) if p.state == next_state => p.last_state_change,
            _ => now,
        };
        let last_terminated_at = if previous_state == Some(RecordState::Running)
            && next_state != RecordState::Running
        {
            Some(now)
        } else {
            previous.as_ref().and_then(|p| p.last_terminated_at)
        };

        let record = ProcessRecord {
            processes,
            state: next_state,
            updated_at: now,
            last_state_change,
            last_terminated_at,
            snapshot_visible,
            launch_type,
        };
        tracing::debug!(
            project_id = %key,
            state = %record.state,
            snapshot_visible = record.snapshot_visible,
            "process registry updated"
        );
        let snapshot = ProcessSnapshot::from(&record);
        entries.insert(key.clone(), StoredEntry::Record(record));
        snapshot
    }

    /// Ingests a raw entry, which may use a legacy shape. It is normalized on
    /// the next read.
    pub fn import(&self, key: &ProjectKey, raw: serde_json::Value) -> Result<(), RegistryError> {
        let entry: StoredEntry = serde_json::from_value(raw)?;
        self.lock().insert(key.clone(), entry);
        Ok(())
    }

    pub fn remove(&self, key: &ProjectKey) -> Option<ProcessRecord> {
        let mut entries = self.lock();
        let record = Self::normalized(&mut entries, key, Utc::now());
        entries.remove(key);
        record
    }

    /// Stops exposing the last-known handles of a non-running record.
    pub fn hide_snapshot(&self, key: &ProjectKey) {
        let mut entries = self.lock();
        if let Some(mut record) = Self::normalized(&mut entries, key, Utc::now()) {
            if record.state != RecordState::Running {
                record.snapshot_visible = false;
                record.updated_at = Utc::now();
                entries.insert(key.clone(), StoredEntry::Record(record));
            }
        }
    }

    /// Drops one handle. The record stays running only while the sibling
    /// handle is still recorded and has not exited.
    pub fn clear_handle(&self, key: &ProjectKey, target: ProcessTarget) -> Option<ProcessHandle> {
        let now = Utc::now();
        let mut entries = self.lock();
        let mut record = Self::normalized(&mut entries, key, now)?;
        let removed = record.processes.take(target)?;

        let sibling_live = record
            .processes
            .get(target.sibling())
            .is_some_and(|h| !h.is_exited());
        let next_state = if record.state == RecordState::Running && sibling_live {
            RecordState::Running
        } else if record.state == RecordState::Idle && record.processes.is_empty() {
            RecordState::Idle
        } else {
            RecordState::Stopped
        };
        if next_state != record.state {
            if record.state == RecordState::Running {
                record.last_terminated_at = Some(now);
            }
            record.state = next_state;
            record.last_state_change = now;
        }
        record.updated_at = now;
        tracing::info!(
            project_id = %key,
            target = %target,
            state = %record.state,
            "cleared process handle"
        );
        entries.insert(key.clone(), StoredEntry::Record(record));
        Some(removed)
    }

    fn with_handle<F>(&self, key: &ProjectKey, target: ProcessTarget, f: F) -> bool
    where
        F: FnOnce(&mut ProcessRecord, ProcessTarget, DateTime<Utc>),
    {
        let now = Utc::now();
        let mut entries = self.lock();
        let Some(mut record) = Self::normalized(&mut entries, key, now) else {
            return false;
        };
        if record.processes.get(target).is_none() {
            return false;
        }
        f(&mut record, target, now);
        entries.insert(key.clone(), StoredEntry::Record(record));
        true
    }

    pub fn append_log(
        &self,
        key: &ProjectKey,
        target: ProcessTarget,
        stream: LogStream,
        line: impl Into<String>,
    ) -> bool {
        let line = line.into();
        self.with_handle(key, target, |record, target, _| {
            if let Some(handle) = record.processes.get_mut(target) {
                handle.logs.push(stream, line);
            }
        })
    }

    /// Refreshes the heartbeat and promotes a starting handle to running.
    pub fn heartbeat(&self, key: &ProjectKey, target: ProcessTarget) -> bool {
        self.with_handle(key, target, |record, target, now| {
            if let Some(handle) = record.processes.get_mut(target) {
                handle.last_heartbeat = Some(now);
                if handle.status == ProcessStatus::Starting {
                    handle.status = ProcessStatus::Running;
                }
            }
        })
    }

    /// Marks a handle exited. A running record with no live handle left
    /// becomes stopped and keeps its snapshot visible.
    pub fn mark_exited(
        &self,
        key: &ProjectKey,
        target: ProcessTarget,
        exit_code: Option<i32>,
        signal: Option<String>,
    ) -> bool {
        self.with_handle(key, target, |record, target, now| {
            if let Some(handle) = record.processes.get_mut(target) {
                handle.mark_exited(exit_code, signal);
            }
            let any_live = ProcessTarget::ALL
                .iter()
                .filter_map(|t| record.processes.get(*t))
                .any(|h| !h.is_exited());
            if record.state == RecordState::Running && !any_live {
                record.state = RecordState::Stopped;
                record.last_state_change = now;
                record.last_terminated_at = Some(now);
                record.snapshot_visible = true;
            }
            record.updated_at = now;
        })
    }

    /// Every record, normalized, keyed by project id.
    pub fn dump(&self) -> BTreeMap<String, ProcessRecord> {
        let now = Utc::now();
        let mut entries = self.lock();
        let keys: Vec<ProjectKey> = entries.keys().cloned().collect();
        keys.into_iter()
            .filter_map(|key| {
                Self::normalized(&mut entries, &key, now).map(|r| (key.to_string(), r))
            })
            .collect()
    }

    pub fn keys(&self) -> Vec<ProjectKey> {
        let mut keys: Vec<ProjectKey> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
