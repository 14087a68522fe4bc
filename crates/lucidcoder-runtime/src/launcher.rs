use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use lucidcoder_registry::{ProcessRegistry, ProjectKey};
use lucidcoder_schema::ports::{DEFAULT_BACKEND_PORT_BASE, DEFAULT_FRONTEND_PORT_BASE};
use lucidcoder_schema::{
    LogStream, ProcessHandle, ProcessMap, ProcessTarget, StartOptions, StartResult,
};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

use crate::ProcessLauncher;

const PORT_PLACEHOLDER: &str = "{port}";

fn default_frontend_port_base() -> u16 {
    DEFAULT_FRONTEND_PORT_BASE
}

fn default_backend_port_base() -> u16 {
    DEFAULT_BACKEND_PORT_BASE
}

fn default_port_search_span() -> u16 {
    100
}

fn default_frontend_command() -> Vec<String> {
    ["npm", "run", "dev", "--", "--port", PORT_PLACEHOLDER]
        .map(String::from)
        .to_vec()
}

fn default_backend_command() -> Vec<String> {
    ["npm", "run", "dev"].map(String::from).to_vec()
}

fn default_install_command() -> Vec<String> {
    ["npm", "install"].map(String::from).to_vec()
}

/// The `launcher` section of `main.yaml`. `{port}` in a command is replaced
/// by the allocated port; `PORT` is always exported as well.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LauncherConfig {
    #[serde(default = "default_frontend_port_base")]
    pub frontend_port_base: u16,
    #[serde(default = "default_backend_port_base")]
    pub backend_port_base: u16,
    #[serde(default = "default_port_search_span")]
    pub port_search_span: u16,
    #[serde(default = "default_frontend_command")]
    pub frontend_command: Vec<String>,
    #[serde(default = "default_backend_command")]
    pub backend_command: Vec<String>,
    #[serde(default = "default_install_command")]
    pub install_command: Vec<String>,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            frontend_port_base: default_frontend_port_base(),
            backend_port_base: default_backend_port_base(),
            port_search_span: default_port_search_span(),
            frontend_command: default_frontend_command(),
            backend_command: default_backend_command(),
            install_command: default_install_command(),
        }
    }
}

impl LauncherConfig {
    pub fn apply_env(&mut self) {
        self.apply_env_from(|name| std::env::var(name).ok());
    }

    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let parse = |name: &str| lookup(name).and_then(|raw| raw.trim().parse::<u16>().ok());
        if let Some(base) = parse("LUCIDCODER_PROJECT_FRONTEND_PORT_BASE") {
            self.frontend_port_base = base;
        }
        if let Some(base) = parse("LUCIDCODER_PROJECT_BACKEND_PORT_BASE") {
            self.backend_port_base = base;
        }
    }

    fn command(&self, target: ProcessTarget) -> &[String] {
        match target {
            ProcessTarget::Frontend => &self.frontend_command,
            ProcessTarget::Backend => &self.backend_command,
        }
    }

    fn port_base(&self, target: ProcessTarget, options: &StartOptions) -> u16 {
        match target {
            ProcessTarget::Frontend => options.frontend_port_base.unwrap_or(self.frontend_port_base),
            ProcessTarget::Backend => options.backend_port_base.unwrap_or(self.backend_port_base),
        }
    }
}

/// Directories holding a runnable `package.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectLayout {
    pub frontend: Option<PathBuf>,
    pub backend: Option<PathBuf>,
}

impl ProjectLayout {
    pub fn detect(root: &Path) -> Self {
        let has_manifest = |dir: &Path| dir.join("package.json").is_file();
        let frontend_dir = root.join("frontend");
        let backend_dir = root.join("backend");
        let frontend = if has_manifest(&frontend_dir) {
            Some(frontend_dir)
        } else if has_manifest(root) {
            Some(root.to_path_buf())
        } else {
            None
        };
        let backend = has_manifest(&backend_dir).then_some(backend_dir);
        Self { frontend, backend }
    }

    fn targets(&self) -> Vec<(ProcessTarget, PathBuf)> {
        let mut targets = Vec::new();
        if let Some(dir) = &self.frontend {
            targets.push((ProcessTarget::Frontend, dir.clone()));
        }
        if let Some(dir) = &self.backend {
            targets.push((ProcessTarget::Backend, dir.clone()));
        }
        targets
    }
}

async fn port_is_free(port: u16) -> bool {
    tokio::net::TcpListener::bind(("127.0.0.1", port)).await.is_ok()
}

/// First bindable port: `preferred`, then `base..base + span`.
pub async fn pick_port(preferred: Option<u16>, base: u16, span: u16, taken: &[u16]) -> Option<u16> {
    let scan = (0..span).filter_map(|offset| base.checked_add(offset));
    for port in preferred.into_iter().chain(scan) {
        if port == 0 || taken.contains(&port) {
            continue;
        }
        if port_is_free(port).await {
            return Some(port);
        }
    }
    None
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;

    status.signal().map(|signal| match signal {
        1 => "SIGHUP".to_string(),
        2 => "SIGINT".to_string(),
        9 => "SIGKILL".to_string(),
        15 => "SIGTERM".to_string(),
        other => format!("SIG{other}"),
    })
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<String> {
    None
}

/// Spawns project dev servers as child process groups.
#[derive(Clone)]
pub struct CommandLauncher {
    registry: ProcessRegistry,
    config: LauncherConfig,
}

struct Spawned {
    target: ProcessTarget,
    port: u16,
    child: Child,
}

impl CommandLauncher {
    pub fn new(registry: ProcessRegistry, config: LauncherConfig) -> Self {
        Self { registry, config }
    }

    pub fn config(&self) -> &LauncherConfig {
        &self.config
    }

    fn spawn_target(
        &self,
        target: ProcessTarget,
        dir: &Path,
        port: u16,
        capture: bool,
    ) -> Result<Child> {
        let port_arg = port.to_string();
        let Some((program, args)) = self.config.command(target).split_first() else {
            bail!("no {target} command configured");
        };
        let mut command = Command::new(program);
        command
            .args(args.iter().map(|arg| arg.replace(PORT_PLACEHOLDER, &port_arg)))
            .current_dir(dir)
            .env("PORT", &port_arg)
            .stdin(Stdio::null());
        if capture {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }
        #[cfg(unix)]
        command.process_group(0);

        command
            .spawn()
            .with_context(|| format!("failed to spawn {target} `{program}` in {}", dir.display()))
    }

    fn pump_lines<R>(&self, reader: R, key: ProjectKey, target: ProcessTarget, stream: LogStream)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let registry = self.registry.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                registry.heartbeat(&key, target);
                registry.append_log(&key, target, stream, line);
            }
        });
    }

    fn watch_exit(&self, mut child: Child, key: Option<ProjectKey>, target: ProcessTarget) {
        let registry = self.registry.clone();
        let pid = child.id();
        tokio::spawn(async move {
            let (exit_code, signal) = match child.wait().await {
                Ok(status) => (status.code(), exit_signal(&status)),
                Err(err) => {
                    tracing::warn!(pid, target = %target, error = %err, "failed to wait for child");
                    (None, None)
                }
            };
            tracing::info!(pid, target = %target, exit_code, signal = signal.as_deref(), "dev server exited");
            let Some(key) = key else {
                return;
            };
            // A restart may already have recorded a newer process.
            let current = registry
                .get(&key)
                .processes
                .get(target)
                .and_then(|handle| handle.pid);
            if current.is_some() && current == pid {
                registry.mark_exited(&key, target, exit_code, signal);
            }
        });
    }
}

#[async_trait]
impl ProcessLauncher for CommandLauncher {
    async fn start_project(&self, path: &Path, options: StartOptions) -> Result<StartResult> {
        let layout = ProjectLayout::detect(path);
        let mut targets = layout.targets();
        if let Some(only) = options.target {
            targets.retain(|(target, _)| *target == only);
        }
        if targets.is_empty() {
            return Ok(StartResult::failed(format!(
                "no package.json found in {}",
                path.display()
            )));
        }
        let key = options
            .log_key
            .as_deref()
            .and_then(|raw| ProjectKey::parse(raw).ok());

        let mut spawned: Vec<Spawned> = Vec::new();
        let mut taken = Vec::new();
        let mut failure = None;
        for (target, dir) in targets {
            let preferred = match target {
                ProcessTarget::Frontend => options.frontend_port,
                ProcessTarget::Backend => options.backend_port,
            };
            let base = self.config.port_base(target, &options);
            let Some(port) = pick_port(preferred, base, self.config.port_search_span, &taken).await
            else {
                failure = Some(format!("no free {target} port near {base}"));
                break;
            };
            match self.spawn_target(target, &dir, port, key.is_some()) {
                Ok(child) => {
                    taken.push(port);
                    spawned.push(Spawned { target, port, child });
                }
                Err(err) => {
                    failure = Some(format!("{err:#}"));
                    break;
                }
            }
        }

        if let Some(error) = failure {
            for mut started in spawned {
                if let Err(err) = started.child.start_kill() {
                    tracing::warn!(target = %started.target, error = %err, "failed to stop partial launch");
                }
            }
            tracing::warn!(path = %path.display(), error = %error, "project launch failed");
            return Ok(StartResult::failed(error));
        }

        let mut processes = ProcessMap::default();
        for Spawned {
            target,
            port,
            mut child,
        } in spawned
        {
            let pid = child.id();
            if let Some(key) = &key {
                if let Some(stdout) = child.stdout.take() {
                    self.pump_lines(stdout, key.clone(), target, LogStream::Stdout);
                }
                if let Some(stderr) = child.stderr.take() {
                    self.pump_lines(stderr, key.clone(), target, LogStream::Stderr);
                }
            }
            tracing::info!(pid, port, target = %target, path = %path.display(), "dev server started");
            *processes.slot(target) = Some(ProcessHandle::new(pid, Some(port)));
            self.watch_exit(child, key.clone(), target);
        }

        Ok(StartResult {
            success: true,
            processes,
            error: None,
        })
    }

    async fn install_dependencies(&self, path: &Path) -> Result<()> {
        let Some((program, args)) = self.config.install_command.split_first() else {
            bail!("no install command configured");
        };
        for (target, dir) in ProjectLayout::detect(path).targets() {
            tracing::info!(target = %target, dir = %dir.display(), "installing dependencies");
            let output = Command::new(program)
                .args(args)
                .current_dir(&dir)
                .stdin(Stdio::null())
                .output()
                .await
                .with_context(|| format!("failed to run `{program}` in {}", dir.display()))?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                bail!(
                    "`{program}` failed for {target} ({}): {}",
                    output.status,
                    stderr.trim()
                );
            }
        }
        Ok(())
    }
}
