//! Cross-platform process and port reclamation.
//!
//! [`Reaper`] combines a platform [`ProcessController`] with the process
//! registry. Termination is best-effort: only programmer errors surface,
//! everything else is logged.

pub mod config;
pub mod controller;
#[cfg(unix)]
pub mod posix;
pub mod windows;

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lucidcoder_registry::{ProcessRegistry, ProjectKey, StoreOptions};
use lucidcoder_schema::ports::default_port_for_framework;
use lucidcoder_schema::{
    ProcessHandle, ProcessMap, ProcessTarget, ProjectInfo, RecordState,
};
use serde::Serialize;

pub use config::ReaperConfig;
pub use controller::{default_controller, ProcessController};

#[derive(Debug, thiserror::Error)]
pub enum ReaperError {
    #[error("permission denied signalling pid {pid}")]
    PermissionDenied { pid: u32 },
    #[error("{command} failed: {message}")]
    CommandFailed { command: String, message: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Options for [`Reaper::terminate_running_processes`].
#[derive(Debug, Clone, Default)]
pub struct TerminateOptions {
    pub project: Option<ProjectInfo>,
    pub target: Option<ProcessTarget>,
    pub wait_for_release: bool,
    pub release_delay: Option<Duration>,
    pub drop_entry: bool,
    pub force_ports: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminationOutcome {
    pub was_running: bool,
    pub freed_ports: Vec<u16>,
}

/// Project-level termination, the seam the preview gateway restarts through.
#[async_trait]
pub trait ProcessTerminator: Send + Sync {
    async fn terminate_running_processes(
        &self,
        key: &ProjectKey,
        options: TerminateOptions,
    ) -> TerminationOutcome;
}

#[derive(Clone)]
pub struct Reaper {
    controller: Arc<dyn ProcessController>,
    registry: ProcessRegistry,
    config: Arc<ReaperConfig>,
    protected: Arc<HashSet<u32>>,
}

impl Reaper {
    pub fn new(
        controller: Arc<dyn ProcessController>,
        registry: ProcessRegistry,
        config: ReaperConfig,
    ) -> Self {
        let mut protected: HashSet<u32> = config.protected_pids.iter().copied().collect();
        protected.insert(std::process::id());
        #[cfg(unix)]
        protected.insert(std::os::unix::process::parent_id());
        Self {
            controller,
            registry,
            config: Arc::new(config),
            protected: Arc::new(protected),
        }
    }

    pub fn config(&self) -> &ReaperConfig {
        &self.config
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    /// The host's own pid, its parent, operator-listed pids, and 0.
    pub fn is_protected(&self, pid: u32) -> bool {
        pid == 0 || self.protected.contains(&pid)
    }

    /// Ports the host UI itself listens on.
    pub fn is_reserved_port(&self, port: u16) -> bool {
        self.config.host_ports.contains(&port)
    }

    pub async fn find_pids_by_port(&self, port: u16) -> Vec<u32> {
        self.controller.find_pids_by_port(port).await
    }

    pub async fn is_alive(&self, pid: u32) -> bool {
        self.controller.is_alive(pid).await
    }

    async fn eligible_pids(&self, port: u16) -> Vec<u32> {
        self.find_pids_by_port(port)
            .await
            .into_iter()
            .filter(|pid| !self.is_protected(*pid))
            .collect()
    }

    pub async fn kill_process_tree(&self, pid: u32, force_delay: Duration) -> Result<(), ReaperError> {
        if self.is_protected(pid) {
            tracing::warn!(pid, "refusing to kill protected pid");
            return Ok(());
        }
        tracing::info!(pid, force_delay_ms = force_delay.as_millis() as u64, "killing process tree");
        self.controller.kill_tree(pid, force_delay).await
    }

    /// Polls until `pid` is gone. Returns `false` on timeout.
    pub async fn wait_for_pid_exit(&self, pid: u32, timeout: Duration, interval: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.controller.is_alive(pid).await {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Kills every eligible pid holding `port`. Returns the pids signalled.
    pub async fn kill_processes_on_port(&self, port: u16) -> Vec<u32> {
        let pids = self.eligible_pids(port).await;
        let mut killed = Vec::with_capacity(pids.len());
        for pid in pids {
            match self.kill_process_tree(pid, self.config.port_force_delay()).await {
                Ok(()) => killed.push(pid),
                Err(err) => tracing::warn!(pid, port, error = %err, "failed to kill process on port"),
            }
        }
        if !killed.is_empty() {
            tracing::info!(port, pids = ?killed, "reclaimed port");
        }
        killed
    }

    /// Frees every non-reserved port in `ports`.
    pub async fn ensure_ports_freed(&self, ports: &[u16]) -> Vec<u32> {
        let mut killed = Vec::new();
        for port in ports {
            if self.is_reserved_port(*port) {
                tracing::debug!(port, "skipping reserved host port");
                continue;
            }
            killed.extend(self.kill_processes_on_port(*port).await);
        }
        killed
    }

    /// Repeats kill attempts until no port in `ports` is held by an eligible
    /// pid. Returns `false` if that does not happen within `timeout`.
    pub async fn wait_for_ports_to_free(
        &self,
        ports: &[u16],
        timeout: Duration,
        interval: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let mut all_free = true;
            for port in ports {
                if self.is_reserved_port(*port) {
                    continue;
                }
                let pids = self.eligible_pids(*port).await;
                if pids.is_empty() {
                    continue;
                }
                all_free = false;
                for pid in pids {
                    if let Err(err) = self
                        .kill_process_tree(pid, self.config.port_force_delay())
                        .await
                    {
                        tracing::warn!(pid, port, error = %err, "retrying port reclamation failed");
                    }
                }
            }
            if all_free {
                return true;
            }
            if Instant::now() >= deadline {
                tracing::warn!(ports = ?ports, "ports still busy after timeout");
                return false;
            }
            tokio::time::sleep(interval).await;
        }
    }

    async fn handle_alive(&self, handle: &ProcessHandle) -> bool {
        if handle.is_exited() {
            return false;
        }
        match handle.pid {
            Some(pid) => self.controller.is_alive(pid).await,
            None => true,
        }
    }

    /// Ports a termination is allowed to reclaim.
    ///
    /// A targeted termination only ever frees that target's own port and
    /// never the sibling's last-known port.
    pub fn ports_to_free(
        &self,
        processes: &ProcessMap,
        project: Option<&ProjectInfo>,
        target: Option<ProcessTarget>,
    ) -> Vec<u16> {
        let last_known = |t: ProcessTarget| {
            processes
                .port(t)
                .or_else(|| project.and_then(|p| p.stored_port(t)))
        };

        let mut ports = BTreeSet::new();
        match target {
            Some(target) => {
                let sibling = target.sibling();
                let sibling_ports: BTreeSet<u16> = [
                    processes.port(sibling),
                    project.and_then(|p| p.stored_port(sibling)),
                ]
                .into_iter()
                .flatten()
                .collect();
                if let Some(port) = last_known(target) {
                    if !sibling_ports.contains(&port) {
                        ports.insert(port);
                    }
                }
            }
            None => {
                for t in ProcessTarget::ALL {
                    ports.extend(processes.port(t));
                    ports.extend(project.and_then(|p| p.stored_port(t)));
                }
                if ports.is_empty() {
                    if let Some(project) = project {
                        for t in ProcessTarget::ALL {
                            ports.extend(default_port_for_framework(t, project.framework(t)));
                        }
                    }
                }
            }
        }
        ports
            .into_iter()
            .filter(|port| !self.is_reserved_port(*port))
            .collect()
    }

    /// Stops a project's processes and reclaims their ports.
    pub async fn terminate_running_processes(
        &self,
        key: &ProjectKey,
        options: TerminateOptions,
    ) -> TerminationOutcome {
        let snapshot = self.registry.get(key);
        let targets: Vec<ProcessTarget> = match options.target {
            Some(target) => vec![target],
            None => ProcessTarget::ALL.to_vec(),
        };
        let active = snapshot.is_active();
        let mut was_running = false;

        if active {
            for target in &targets {
                let Some(handle) = snapshot.processes.get(*target) else {
                    continue;
                };
                was_running = true;
                let Some(pid) = handle.pid else {
                    continue;
                };
                if handle.is_exited() || !self.controller.is_alive(pid).await {
                    tracing::debug!(project_id = %key, target = %target, pid, "process already exited");
                    continue;
                }
                if let Err(err) = self
                    .kill_process_tree(pid, self.config.force_delay())
                    .await
                {
                    tracing::warn!(
                        project_id = %key,
                        target = %target,
                        pid,
                        error = %err,
                        "failed to terminate process"
                    );
                }
            }

            if was_running {
                let delay = options.release_delay.unwrap_or_else(|| {
                    self.config.release_delay(options.wait_for_release)
                });
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }

        if options.drop_entry {
            self.registry.remove(key);
        } else if active {
            let mut processes = snapshot.processes.clone();
            match options.target {
                Some(target) => {
                    processes.take(target);
                    let sibling_alive = match processes.get(target.sibling()) {
                        Some(handle) => self.handle_alive(handle).await,
                        None => false,
                    };
                    let state = if sibling_alive {
                        RecordState::Running
                    } else {
                        RecordState::Stopped
                    };
                    self.registry.store(
                        key,
                        processes,
                        state,
                        StoreOptions {
                            expose_snapshot: Some(true),
                            launch_type: Some(snapshot.launch_type),
                        },
                    );
                }
                None => {
                    for target in ProcessTarget::ALL {
                        if let Some(handle) = processes.get_mut(target) {
                            if !handle.is_exited() {
                                handle.mark_exited(None, Some("SIGTERM".into()));
                            }
                        }
                    }
                    self.registry.store(
                        key,
                        processes,
                        RecordState::Stopped,
                        StoreOptions::exposed(true),
                    );
                }
            }
        }

        if !(active || options.force_ports) {
            return TerminationOutcome {
                was_running,
                freed_ports: Vec::new(),
            };
        }

        let ports = self.ports_to_free(&snapshot.processes, options.project.as_ref(), options.target);
        if !ports.is_empty() {
            if options.wait_for_release {
                let released = self
                    .wait_for_ports_to_free(
                        &ports,
                        self.config.port_wait_timeout(),
                        self.config.port_wait_interval(),
                    )
                    .await;
                if !released {
                    tracing::warn!(project_id = %key, ports = ?ports, "ports were not released in time");
                }
            } else {
                let reaper = self.clone();
                let background = ports.clone();
                tokio::spawn(async move {
                    reaper.ensure_ports_freed(&background).await;
                });
            }
        }

        tracing::info!(
            project_id = %key,
            target = ?options.target,
            was_running,
            freed_ports = ?ports,
            "terminated project processes"
        );
        TerminationOutcome {
            was_running,
            freed_ports: ports,
        }
    }
}

#[async_trait]
impl ProcessTerminator for Reaper {
    async fn terminate_running_processes(
        &self,
        key: &ProjectKey,
        options: TerminateOptions,
    ) -> TerminationOutcome {
        Reaper::terminate_running_processes(self, key, options).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;
    use lucidcoder_schema::ProcessStatus;

    /// In-memory process table: killing a pid removes it from every port.
    #[derive(Default)]
    struct FakeController {
        alive: Mutex<HashSet<u32>>,
        ports: Mutex<HashMap<u16, Vec<u32>>>,
        kills: Mutex<Vec<u32>>,
        stubborn: bool,
    }

    impl FakeController {
        fn with_listener(self, port: u16, pid: u32) -> Self {
            self.alive.lock().unwrap().insert(pid);
            self.ports.lock().unwrap().entry(port).or_default().push(pid);
            self
        }

        fn with_alive(self, pid: u32) -> Self {
            self.alive.lock().unwrap().insert(pid);
            self
        }

        fn kills(&self) -> Vec<u32> {
            self.kills.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ProcessController for FakeController {
        async fn find_pids_by_port(&self, port: u16) -> Vec<u32> {
            let alive = self.alive.lock().unwrap();
            self.ports
                .lock()
                .unwrap()
                .get(&port)
                .map(|pids| pids.iter().copied().filter(|p| alive.contains(p)).collect())
                .unwrap_or_default()
        }

        async fn kill_tree(&self, pid: u32, _force_delay: Duration) -> Result<(), ReaperError> {
            self.kills.lock().unwrap().push(pid);
            if !self.stubborn {
                self.alive.lock().unwrap().remove(&pid);
            }
            Ok(())
        }

        async fn is_alive(&self, pid: u32) -> bool {
            self.alive.lock().unwrap().contains(&pid)
        }
    }

    fn reaper_with(controller: Arc<FakeController>, config: ReaperConfig) -> (Reaper, ProcessRegistry) {
        let registry = ProcessRegistry::new();
        let reaper = Reaper::new(controller, registry.clone(), config);
        (reaper, registry)
    }

    fn quick_config() -> ReaperConfig {
        ReaperConfig {
            force_delay_ms: 1,
            port_force_delay_ms: 1,
            release_delay_wait_ms: 0,
            release_delay_quick_ms: 0,
            port_wait_timeout_ms: 200,
            port_wait_interval_ms: 10,
            ..ReaperConfig::default()
        }
    }

    fn handle(pid: u32, port: u16) -> ProcessHandle {
        ProcessHandle::new(Some(pid), Some(port))
    }

    #[tokio::test]
    async fn never_signals_protected_pids() {
        let own = std::process::id();
        let controller = Arc::new(FakeController::default().with_alive(own).with_alive(4242));
        let config = ReaperConfig {
            protected_pids: [4242].into_iter().collect(),
            ..quick_config()
        };
        let (reaper, _) = reaper_with(controller.clone(), config);

        reaper.kill_process_tree(own, Duration::ZERO).await.unwrap();
        reaper.kill_process_tree(4242, Duration::ZERO).await.unwrap();
        reaper.kill_process_tree(0, Duration::ZERO).await.unwrap();
        assert!(controller.kills().is_empty());
    }

    #[tokio::test]
    async fn kill_processes_on_port_filters_protected() {
        let own = std::process::id();
        let controller = Arc::new(
            FakeController::default()
                .with_listener(5173, own)
                .with_listener(5173, 900),
        );
        let (reaper, _) = reaper_with(controller.clone(), quick_config());
        let killed = reaper.kill_processes_on_port(5173).await;
        assert_eq!(killed, vec![900]);
        assert_eq!(controller.kills(), vec![900]);
    }

    #[tokio::test]
    async fn ensure_ports_freed_skips_reserved_host_ports() {
        let controller = Arc::new(
            FakeController::default()
                .with_listener(5000, 11)
                .with_listener(5173, 12),
        );
        let config = ReaperConfig {
            host_ports: [5000].into_iter().collect(),
            ..quick_config()
        };
        let (reaper, _) = reaper_with(controller.clone(), config);
        reaper.ensure_ports_freed(&[5000, 5173]).await;
        assert_eq!(controller.kills(), vec![12]);
    }

    #[tokio::test]
    async fn wait_for_ports_converges() {
        let controller = Arc::new(
            FakeController::default()
                .with_listener(5173, 21)
                .with_listener(3000, 22),
        );
        let (reaper, _) = reaper_with(controller.clone(), quick_config());
        let freed = reaper
            .wait_for_ports_to_free(&[5173, 3000], Duration::from_millis(200), Duration::from_millis(5))
            .await;
        assert!(freed);
        assert!(reaper.find_pids_by_port(5173).await.is_empty());
        assert!(reaper.find_pids_by_port(3000).await.is_empty());
    }

    #[tokio::test]
    async fn wait_for_ports_times_out_when_pid_survives() {
        let controller = Arc::new(FakeController {
            stubborn: true,
            ..FakeController::default()
        }
        .with_listener(5173, 31));
        let (reaper, _) = reaper_with(controller.clone(), quick_config());
        let freed = reaper
            .wait_for_ports_to_free(&[5173], Duration::from_millis(40), Duration::from_millis(5))
            .await;
        assert!(!freed);
        assert!(!reaper.find_pids_by_port(5173).await.is_empty());
        assert!(controller.kills().len() > 1);
    }

    #[tokio::test]
    async fn wait_for_ports_ignores_protected_holders() {
        let own = std::process::id();
        let controller = Arc::new(FakeController::default().with_listener(5173, own));
        let (reaper, _) = reaper_with(controller.clone(), quick_config());
        assert!(
            reaper
                .wait_for_ports_to_free(&[5173], Duration::from_millis(20), Duration::from_millis(5))
                .await
        );
        assert!(controller.kills().is_empty());
    }

    #[tokio::test]
    async fn wait_for_pid_exit_reports_liveness() {
        let controller = Arc::new(FakeController::default().with_alive(55));
        let (reaper, _) = reaper_with(controller, quick_config());
        assert!(!reaper
            .wait_for_pid_exit(55, Duration::from_millis(20), Duration::from_millis(5))
            .await);
        assert!(reaper
            .wait_for_pid_exit(56, Duration::from_millis(20), Duration::from_millis(5))
            .await);
    }

    #[tokio::test]
    async fn targeted_frontend_termination_frees_only_its_port() {
        let controller = Arc::new(FakeController::default().with_listener(5173, 100));
        let (reaper, registry) = reaper_with(controller.clone(), quick_config());
        let key = ProjectKey::from(12u64);
        registry.store(
            &key,
            ProcessMap {
                frontend: Some(handle(100, 5173)),
                backend: None,
            },
            RecordState::Running,
            StoreOptions::default(),
        );

        let outcome = reaper
            .terminate_running_processes(
                &key,
                TerminateOptions {
                    target: Some(ProcessTarget::Frontend),
                    ..TerminateOptions::default()
                },
            )
            .await;

        assert!(outcome.was_running);
        assert_eq!(outcome.freed_ports, vec![5173]);
        let snapshot = registry.get(&key);
        assert!(snapshot.processes.frontend.is_none());
        assert_eq!(snapshot.state, RecordState::Stopped);
        assert_eq!(controller.kills(), vec![100]);
    }

    #[tokio::test]
    async fn targeted_backend_never_frees_frontend_port() {
        let controller = Arc::new(
            FakeController::default()
                .with_listener(5173, 100)
                .with_listener(3000, 200),
        );
        let (reaper, registry) = reaper_with(controller.clone(), quick_config());
        let key = ProjectKey::from(7u64);
        registry.store(
            &key,
            ProcessMap {
                frontend: Some(handle(100, 5173)),
                backend: Some(handle(200, 3000)),
            },
            RecordState::Running,
            StoreOptions::default(),
        );
        let project = ProjectInfo {
            id: "7".into(),
            path: "/tmp/p7".into(),
            frontend_port: Some(5173),
            backend_port: Some(3000),
            ..ProjectInfo::default()
        };

        let outcome = reaper
            .terminate_running_processes(
                &key,
                TerminateOptions {
                    project: Some(project),
                    target: Some(ProcessTarget::Backend),
                    wait_for_release: true,
                    ..TerminateOptions::default()
                },
            )
            .await;

        assert_eq!(outcome.freed_ports, vec![3000]);
        assert!(!outcome.freed_ports.contains(&5173));
        assert_eq!(controller.kills(), vec![200]);
        let snapshot = registry.get(&key);
        assert_eq!(snapshot.state, RecordState::Running);
        assert!(snapshot.processes.backend.is_none());
        assert_eq!(snapshot.processes.port(ProcessTarget::Frontend), Some(5173));
    }

    #[tokio::test]
    async fn targeted_termination_skips_port_shared_with_sibling() {
        let controller = Arc::new(FakeController::default().with_alive(1).with_alive(2));
        let (reaper, registry) = reaper_with(controller, quick_config());
        let key = ProjectKey::from(8u64);
        registry.store(
            &key,
            ProcessMap {
                frontend: Some(handle(1, 5173)),
                backend: Some(handle(2, 5173)),
            },
            RecordState::Running,
            StoreOptions::default(),
        );
        let outcome = reaper
            .terminate_running_processes(
                &key,
                TerminateOptions {
                    target: Some(ProcessTarget::Frontend),
                    ..TerminateOptions::default()
                },
            )
            .await;
        assert!(outcome.freed_ports.is_empty());
    }

    #[tokio::test]
    async fn full_termination_keeps_exited_snapshot() {
        let controller = Arc::new(
            FakeController::default()
                .with_listener(5173, 100)
                .with_listener(3000, 200),
        );
        let (reaper, registry) = reaper_with(controller.clone(), quick_config());
        let key = ProjectKey::from(3u64);
        registry.store(
            &key,
            ProcessMap {
                frontend: Some(handle(100, 5173)),
                backend: Some(handle(200, 3000)),
            },
            RecordState::Running,
            StoreOptions::default(),
        );

        let outcome = reaper
            .terminate_running_processes(
                &key,
                TerminateOptions {
                    wait_for_release: true,
                    ..TerminateOptions::default()
                },
            )
            .await;

        assert!(outcome.was_running);
        assert_eq!(outcome.freed_ports, vec![3000, 5173]);
        let snapshot = registry.get(&key);
        assert_eq!(snapshot.state, RecordState::Stopped);
        assert!(snapshot.snapshot_visible);
        assert_eq!(
            snapshot.processes.frontend.as_ref().map(|h| h.status),
            Some(ProcessStatus::Exited)
        );
    }

    #[tokio::test]
    async fn drop_entry_removes_record() {
        let controller = Arc::new(FakeController::default().with_alive(100));
        let (reaper, registry) = reaper_with(controller, quick_config());
        let key = ProjectKey::from(4u64);
        registry.store(
            &key,
            ProcessMap {
                frontend: Some(handle(100, 5173)),
                backend: None,
            },
            RecordState::Running,
            StoreOptions::default(),
        );
        reaper
            .terminate_running_processes(
                &key,
                TerminateOptions {
                    drop_entry: true,
                    ..TerminateOptions::default()
                },
            )
            .await;
        assert!(!registry.contains(&key));
    }

    #[tokio::test]
    async fn idle_project_only_frees_ports_when_forced() {
        let controller = Arc::new(FakeController::default().with_listener(5173, 300));
        let (reaper, _) = reaper_with(controller.clone(), quick_config());
        let key = ProjectKey::from(5u64);
        let project = ProjectInfo {
            id: "5".into(),
            path: "/tmp/p5".into(),
            frontend_framework: Some("vite".into()),
            ..ProjectInfo::default()
        };

        let outcome = reaper
            .terminate_running_processes(
                &key,
                TerminateOptions {
                    project: Some(project.clone()),
                    ..TerminateOptions::default()
                },
            )
            .await;
        assert!(!outcome.was_running);
        assert!(outcome.freed_ports.is_empty());

        let outcome = reaper
            .terminate_running_processes(
                &key,
                TerminateOptions {
                    project: Some(project),
                    force_ports: true,
                    wait_for_release: true,
                    ..TerminateOptions::default()
                },
            )
            .await;
        assert_eq!(outcome.freed_ports, vec![5173]);
        assert_eq!(controller.kills(), vec![300]);
    }

    #[test]
    fn ports_to_free_excludes_reserved_host_ports() {
        let controller = Arc::new(FakeController::default());
        let config = ReaperConfig {
            host_ports: [5173].into_iter().collect(),
            ..quick_config()
        };
        let (reaper, _) = reaper_with(controller, config);
        let processes = ProcessMap {
            frontend: Some(handle(1, 5173)),
            backend: Some(handle(2, 3000)),
        };
        assert_eq!(reaper.ports_to_free(&processes, None, None), vec![3000]);
        assert!(reaper
            .ports_to_free(&processes, None, Some(ProcessTarget::Frontend))
            .is_empty());
    }
}
