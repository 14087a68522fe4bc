//! Preview gateway: routes browser traffic for `/preview/<id>/...` (and the
//! asset, HMR and iframe requests that follow it) into whichever dev server
//! a project currently owns, and restarts that server when it dies.

pub mod bridge;
pub mod config;
pub mod healing;
pub mod host;
pub mod proxy;
pub mod resolve;
pub mod uploads;
pub mod ws;

use std::path::Path;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use lucidcoder_reaper::{ProcessTerminator, TerminateOptions};
use lucidcoder_registry::{ProcessRegistry, ProjectKey, StoreOptions};
use lucidcoder_runtime::{ProcessLauncher, ProjectStore};
use lucidcoder_schema::{
    LaunchType, ProcessStatus, ProcessTarget, ProjectInfo, ProjectPorts, RecordState,
    StartOptions,
};

pub use config::GatewayConfig;
pub use proxy::ProxyFailure;
pub use resolve::{Resolution, PREVIEW_COOKIE};

use healing::{BadPortCache, RestartTracker};
use resolve::RequestView;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("failed to build upstream client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Where a project's preview traffic should go right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamTarget {
    Port(u16),
    /// Every known port was just proven dead.
    RememberedBad(u16),
    Unknown,
}

struct Inner {
    registry: ProcessRegistry,
    projects: Arc<dyn ProjectStore>,
    launcher: Arc<dyn ProcessLauncher>,
    terminator: Arc<dyn ProcessTerminator>,
    config: GatewayConfig,
    client: reqwest::Client,
    bad_ports: BadPortCache,
    restarts: RestartTracker,
}

#[derive(Clone)]
pub struct PreviewGateway {
    inner: Arc<Inner>,
}

impl PreviewGateway {
    pub fn new(
        registry: ProcessRegistry,
        projects: Arc<dyn ProjectStore>,
        launcher: Arc<dyn ProcessLauncher>,
        terminator: Arc<dyn ProcessTerminator>,
        config: GatewayConfig,
    ) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(config.connect_timeout())
            .build()?;
        Ok(Self {
            inner: Arc::new(Inner {
                registry,
                projects,
                launcher,
                terminator,
                bad_ports: BadPortCache::new(config.bad_port_ttl()),
                restarts: RestartTracker::from_config(&config),
                config,
                client,
            }),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    pub(crate) fn client(&self) -> &reqwest::Client {
        &self.inner.client
    }

    pub fn restart_in_flight(&self, key: &ProjectKey) -> bool {
        self.inner.restarts.in_flight(key)
    }

    pub(crate) async fn project(&self, key: &ProjectKey) -> Option<ProjectInfo> {
        match self.inner.projects.get_project(key.as_str()).await {
            Ok(project) => project,
            Err(err) => {
                tracing::warn!(project_id = %key, error = %err, "project lookup failed");
                None
            }
        }
    }

    pub(crate) fn upstream_url(
        &self,
        scheme: &str,
        headers: &HeaderMap,
        port: u16,
        forward_path: &str,
    ) -> String {
        let host = host::resolve_upstream_host(self.inner.config.upstream_host.as_deref(), headers);
        format!("{scheme}://{host}:{port}{forward_path}")
    }

    pub(crate) fn degraded(&self, request_headers: &HeaderMap, starting: bool) -> Response {
        proxy::degraded_response(request_headers, starting, self.inner.config.retry_delay_ms)
    }

    /// Live frontend handle first, then the stored port, then the framework
    /// default, skipping a port that just refused connections.
    pub async fn resolve_target(&self, key: &ProjectKey) -> UpstreamTarget {
        let bad = self.inner.bad_ports.get(key);
        let snapshot = self.inner.registry.get(key);
        let live = if snapshot.state == RecordState::Running {
            snapshot
                .processes
                .frontend
                .as_ref()
                .filter(|handle| !handle.is_exited())
                .and_then(|handle| handle.port)
        } else {
            None
        };

        if let Some(port) = live.filter(|port| Some(*port) != bad) {
            return UpstreamTarget::Port(port);
        }

        let hinted = self
            .project(key)
            .await
            .and_then(|project| project.port_hint(ProcessTarget::Frontend));
        let candidates: Vec<u16> = live.into_iter().chain(hinted).collect();
        match candidates.iter().find(|port| Some(**port) != bad) {
            Some(port) => UpstreamTarget::Port(*port),
            None => match candidates.first() {
                Some(port) => UpstreamTarget::RememberedBad(*port),
                None => UpstreamTarget::Unknown,
            },
        }
    }

    /// Records an upstream failure. Returns whether the frontend is still
    /// starting, which callers report as 503 rather than 502.
    pub async fn note_failure(
        &self,
        key: &ProjectKey,
        port: Option<u16>,
        failure: ProxyFailure,
    ) -> bool {
        let snapshot = self.inner.registry.get(key);
        let frontend = snapshot
            .processes
            .frontend
            .as_ref()
            .filter(|handle| snapshot.is_active() && !handle.is_exited());
        let starting = frontend.is_some_and(|handle| handle.status == ProcessStatus::Starting);

        if !failure.is_connection_failure() || starting {
            return starting;
        }

        if frontend.is_some() {
            self.inner.registry.clear_handle(key, ProcessTarget::Frontend);
            tracing::info!(project_id = %key, port, "cleared unreachable frontend handle");
        }
        if let Some(port) = port {
            self.inner.bad_ports.remember(key, port);
        }
        if self.inner.restarts.record_failure(key) {
            self.spawn_restart(key.clone());
        }
        false
    }

    fn spawn_restart(&self, key: ProjectKey) {
        let gateway = self.clone();
        tokio::spawn(async move {
            let succeeded = gateway.restart_project(&key).await;
            gateway.inner.restarts.finish(&key, succeeded);
        });
    }

    /// Stops and relaunches the project. Returns whether the relaunch
    /// succeeded; on failure the registry and stored ports are left alone.
    async fn restart_project(&self, key: &ProjectKey) -> bool {
        let Some(project) = self.project(key).await else {
            tracing::warn!(project_id = %key, "cannot restart unknown project");
            return false;
        };

        let outcome = self
            .inner
            .terminator
            .terminate_running_processes(
                key,
                TerminateOptions {
                    project: Some(project.clone()),
                    wait_for_release: true,
                    force_ports: true,
                    ..TerminateOptions::default()
                },
            )
            .await;
        tracing::debug!(project_id = %key, freed_ports = ?outcome.freed_ports, "cleared project before restart");

        let options = StartOptions {
            frontend_port: project.port_hint(ProcessTarget::Frontend),
            backend_port: project.port_hint(ProcessTarget::Backend),
            log_key: Some(key.to_string()),
            ..StartOptions::default()
        };
        let result = match self
            .inner
            .launcher
            .start_project(Path::new(&project.path), options)
            .await
        {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!(project_id = %key, error = %err, "preview restart failed");
                return false;
            }
        };
        if !result.success {
            tracing::warn!(
                project_id = %key,
                error = result.error.as_deref().unwrap_or("unknown error"),
                "preview restart did not succeed"
            );
            return false;
        }

        let ports = ProjectPorts::from_processes(&result.processes);
        self.inner.registry.store(
            key,
            result.processes,
            RecordState::Running,
            StoreOptions::launched(LaunchType::Auto),
        );
        self.inner.bad_ports.forget(key);
        if let Err(err) = self
            .inner
            .projects
            .update_project_ports(key.as_str(), ports)
            .await
        {
            tracing::warn!(project_id = %key, error = %err, "failed to persist restarted ports");
        }
        tracing::info!(project_id = %key, ?ports, "preview restarted");
        true
    }

    async fn handle(&self, resolution: Resolution, has_cookie: bool, request: Request) -> Response {
        let key = match ProjectKey::parse(&resolution.project_id) {
            Ok(key) => key,
            Err(err) => return (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
        };

        if resolve::is_websocket_upgrade(request.headers()) {
            return ws::proxy_websocket(self, &key, &resolution, request).await;
        }

        let readable = matches!(*request.method(), Method::GET | Method::HEAD);
        if has_cookie && readable && resolution.forward_path.starts_with("/uploads/") {
            if let Some(response) = uploads::serve_upload(self, &key, &resolution.forward_path).await {
                return response;
            }
        }

        proxy::forward_http(self, &key, &resolution, request).await
    }
}

/// Axum middleware: proxies preview traffic, passes everything else on.
pub async fn preview_middleware(
    State(gateway): State<PreviewGateway>,
    request: Request,
    next: Next,
) -> Response {
    let cookie_project = resolve::preview_cookie(request.headers());
    let resolution = resolve::resolve(&RequestView {
        path: request.uri().path(),
        query: request.uri().query(),
        headers: request.headers(),
        cookie_project: cookie_project.as_deref(),
    });
    let Some(resolution) = resolution else {
        return next.run(request).await;
    };

    let cookie = resolution
        .sets_cookie()
        .then(|| resolve::preview_cookie_header(&resolution.project_id))
        .flatten();
    let mut response = gateway
        .handle(resolution, cookie_project.is_some(), request)
        .await;
    if let Some(cookie) = cookie {
        response.headers_mut().append(header::SET_COOKIE, cookie);
    }
    response
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::HeaderValue;
    use axum::routing::get;
    use axum::Router;
    use futures_util::{SinkExt, StreamExt};
    use lucidcoder_reaper::TerminationOutcome;
    use lucidcoder_schema::{ProcessHandle, ProcessMap, StartResult};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::handshake::server::{
        ErrorResponse, Request as WsRequest, Response as WsResponse,
    };
    use tokio_tungstenite::tungstenite::{Error as WsError, Message};
    use tower::ServiceExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[derive(Default)]
    struct FakeStore {
        projects: Mutex<HashMap<String, ProjectInfo>>,
        updates: Mutex<Vec<(String, ProjectPorts)>>,
    }

    impl FakeStore {
        fn with(projects: Vec<ProjectInfo>) -> Arc<Self> {
            let store = Self::default();
            for project in projects {
                store.projects.lock().unwrap().insert(project.id.clone(), project);
            }
            Arc::new(store)
        }
    }

    #[async_trait]
    impl ProjectStore for FakeStore {
        async fn get_project(&self, id: &str) -> anyhow::Result<Option<ProjectInfo>> {
            Ok(self.projects.lock().unwrap().get(id).cloned())
        }

        async fn update_project_ports(&self, id: &str, ports: ProjectPorts) -> anyhow::Result<()> {
            self.updates.lock().unwrap().push((id.to_string(), ports));
            Ok(())
        }
    }

    struct FakeLauncher {
        calls: AtomicUsize,
        delay: Duration,
        result: StartResult,
        last_options: Mutex<Option<StartOptions>>,
    }

    impl FakeLauncher {
        fn succeeding(port: u16, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
                result: StartResult {
                    success: true,
                    processes: ProcessMap {
                        frontend: Some(ProcessHandle::new(None, Some(port))),
                        backend: None,
                    },
                    error: None,
                },
                last_options: Mutex::new(None),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                result: StartResult::failed("npm exploded"),
                last_options: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl ProcessLauncher for FakeLauncher {
        async fn start_project(&self, _path: &Path, options: StartOptions) -> anyhow::Result<StartResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_options.lock().unwrap() = Some(options);
            tokio::time::sleep(self.delay).await;
            Ok(self.result.clone())
        }

        async fn install_dependencies(&self, _path: &Path) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeTerminator {
        calls: Mutex<Vec<(ProjectKey, bool, bool)>>,
    }

    #[async_trait]
    impl ProcessTerminator for FakeTerminator {
        async fn terminate_running_processes(
            &self,
            key: &ProjectKey,
            options: TerminateOptions,
        ) -> TerminationOutcome {
            self.calls
                .lock()
                .unwrap()
                .push((key.clone(), options.force_ports, options.wait_for_release));
            TerminationOutcome::default()
        }
    }

    struct Harness {
        gateway: PreviewGateway,
        registry: ProcessRegistry,
        store: Arc<FakeStore>,
        launcher: Arc<FakeLauncher>,
        terminator: Arc<FakeTerminator>,
    }

    fn harness(projects: Vec<ProjectInfo>, launcher: Arc<FakeLauncher>) -> Harness {
        harness_with(projects, launcher, GatewayConfig::default())
    }

    fn harness_with(
        projects: Vec<ProjectInfo>,
        launcher: Arc<FakeLauncher>,
        config: GatewayConfig,
    ) -> Harness {
        let registry = ProcessRegistry::new();
        let store = FakeStore::with(projects);
        let terminator = Arc::new(FakeTerminator::default());
        let config = GatewayConfig {
            upstream_host: Some("127.0.0.1".into()),
            ..config
        };
        let gateway = PreviewGateway::new(
            registry.clone(),
            store.clone(),
            launcher.clone(),
            terminator.clone(),
            config,
        )
        .unwrap();
        Harness {
            gateway,
            registry,
            store,
            launcher,
            terminator,
        }
    }

    fn app(gateway: &PreviewGateway) -> Router {
        Router::new()
            .route("/api/ping", get(|| async { "pong" }))
            .layer(axum::middleware::from_fn_with_state(
                gateway.clone(),
                preview_middleware,
            ))
    }

    fn running_frontend(registry: &ProcessRegistry, id: u64, port: u16, status: ProcessStatus) {
        let mut handle = ProcessHandle::new(Some(4000 + id as u32), Some(port));
        handle.status = status;
        registry.store(
            &ProjectKey::from(id),
            ProcessMap {
                frontend: Some(handle),
                backend: None,
            },
            RecordState::Running,
            StoreOptions::default(),
        );
    }

    fn dead_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn project(id: &str, path: &str, frontend_port: Option<u16>) -> ProjectInfo {
        ProjectInfo {
            id: id.into(),
            path: path.into(),
            frontend_port,
            ..ProjectInfo::default()
        }
    }

    async fn body_string(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn api_requests_fall_through() {
        let h = harness(Vec::new(), FakeLauncher::failing());
        let response = app(&h.gateway)
            .oneshot(
                Request::builder()
                    .uri("/api/ping")
                    .header(header::COOKIE, "lucidcoder_preview_project=12")
                    .header(header::REFERER, "http://localhost:5000/preview/12/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "pong");
    }

    #[tokio::test]
    async fn html_gets_bridge_and_loses_csp() {
        let upstream = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-security-policy", "default-src 'none'")
                    .set_body_raw("<html><head></head><body>ok</body></html>", "text/html"),
            )
            .mount(&upstream)
            .await;

        let h = harness(Vec::new(), FakeLauncher::failing());
        running_frontend(&h.registry, 12, upstream.address().port(), ProcessStatus::Running);

        let response = app(&h.gateway)
            .oneshot(
                Request::builder()
                    .uri("/preview/12/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("content-security-policy").is_none());
        let cookie = response.headers()[header::SET_COOKIE].to_str().unwrap().to_string();
        assert!(cookie.starts_with("lucidcoder_preview_project=12;"));
        let body = body_string(response).await;
        assert!(body.contains(bridge::BRIDGE_MARKER));
        assert!(body.contains("/preview/12"));
        assert!(body.ends_with("<body>ok</body></html>"));
    }

    #[tokio::test]
    async fn assets_stream_through_unchanged() {
        let upstream = MockServer::start().await;
        let script = "export const answer = 42;\n";
        Mock::given(method("GET"))
            .and(path("/src/main.ts"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(script, "application/javascript"))
            .mount(&upstream)
            .await;

        let h = harness(Vec::new(), FakeLauncher::failing());
        running_frontend(&h.registry, 12, upstream.address().port(), ProcessStatus::Running);

        let response = app(&h.gateway)
            .oneshot(
                Request::builder()
                    .uri("/src/main.ts")
                    .header(header::COOKIE, "lucidcoder_preview_project=12")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(header::SET_COOKIE).is_none());
        assert_eq!(body_string(response).await, script);
    }

    #[tokio::test]
    async fn refused_connection_clears_handle_and_serves_retry_page() {
        let h = harness(Vec::new(), FakeLauncher::failing());
        let port = dead_port();
        running_frontend(&h.registry, 12, port, ProcessStatus::Running);

        let response = app(&h.gateway)
            .oneshot(
                Request::builder()
                    .uri("/preview/12/")
                    .header(header::ACCEPT, "text/html")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(body_string(response).await.contains("window.location.reload()"));
        let snapshot = h.registry.get(&ProjectKey::from(12u64));
        assert!(snapshot.processes.frontend.is_none());
        assert_eq!(snapshot.state, RecordState::Stopped);
        assert_eq!(h.gateway.resolve_target(&ProjectKey::from(12u64)).await, UpstreamTarget::Unknown);
    }

    #[tokio::test]
    async fn starting_frontend_reports_503() {
        let h = harness(Vec::new(), FakeLauncher::failing());
        running_frontend(&h.registry, 12, dead_port(), ProcessStatus::Starting);

        let response = app(&h.gateway)
            .oneshot(
                Request::builder()
                    .uri("/preview/12/index.js")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_string(response).await, "Preview is starting");
        assert!(h
            .registry
            .get(&ProjectKey::from(12u64))
            .processes
            .frontend
            .is_some());
    }

    #[tokio::test]
    async fn repeated_refusals_restart_project_once() {
        let launcher = FakeLauncher::succeeding(5173, Duration::ZERO);
        let port = dead_port();
        let h = harness(vec![project("99", "/tmp/p99", Some(port))], launcher);

        for _ in 0..2 {
            let response = app(&h.gateway)
                .oneshot(
                    Request::builder()
                        .uri("/preview/99/")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        }

        let key = ProjectKey::from(99u64);
        assert!(wait_until(|| h.store.updates.lock().unwrap().len() == 1).await);
        assert!(wait_until(|| !h.gateway.restart_in_flight(&key)).await);

        let terminations = h.terminator.calls.lock().unwrap().clone();
        assert_eq!(terminations, vec![(key.clone(), true, true)]);
        assert_eq!(h.launcher.calls.load(Ordering::SeqCst), 1);
        let options = h.launcher.last_options.lock().unwrap().clone().unwrap();
        assert_eq!(options.frontend_port, Some(port));

        let updates = h.store.updates.lock().unwrap().clone();
        assert_eq!(updates[0].0, "99");
        assert_eq!(updates[0].1.frontend, Some(5173));

        let snapshot = h.registry.get(&key);
        assert_eq!(snapshot.state, RecordState::Running);
        assert_eq!(snapshot.launch_type, LaunchType::Auto);
        assert_eq!(h.gateway.resolve_target(&key).await, UpstreamTarget::Port(5173));
    }

    #[tokio::test]
    async fn concurrent_failures_share_one_restart() {
        let launcher = FakeLauncher::succeeding(5173, Duration::from_millis(100));
        let h = harness(vec![project("7", "/tmp/p7", Some(dead_port()))], launcher);
        let key = ProjectKey::from(7u64);

        let failures = (0..8).map(|_| {
            let gateway = h.gateway.clone();
            let key = key.clone();
            tokio::spawn(async move {
                gateway
                    .note_failure(&key, Some(1), ProxyFailure::ConnectionRefused)
                    .await
            })
        });
        for failure in failures.collect::<Vec<_>>() {
            failure.await.unwrap();
        }

        assert!(wait_until(|| !h.gateway.restart_in_flight(&key)
            && h.launcher.calls.load(Ordering::SeqCst) > 0)
        .await);
        assert_eq!(h.launcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.terminator.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_restart_leaves_state_untouched() {
        let h = harness(vec![project("5", "/tmp/p5", Some(dead_port()))], FakeLauncher::failing());
        let key = ProjectKey::from(5u64);

        h.gateway
            .note_failure(&key, Some(1), ProxyFailure::ConnectionReset)
            .await;
        h.gateway
            .note_failure(&key, Some(1), ProxyFailure::ConnectionReset)
            .await;

        assert!(wait_until(|| h.launcher.calls.load(Ordering::SeqCst) == 1).await);
        assert!(wait_until(|| !h.gateway.restart_in_flight(&key)).await);
        assert!(h.store.updates.lock().unwrap().is_empty());
        assert!(!h.registry.contains(&key));
    }

    #[tokio::test]
    async fn failed_restart_allows_another_attempt() {
        let h = harness(vec![project("5", "/tmp/p5", Some(dead_port()))], FakeLauncher::failing());
        let key = ProjectKey::from(5u64);

        for _ in 0..2 {
            h.gateway
                .note_failure(&key, Some(1), ProxyFailure::ConnectionRefused)
                .await;
        }
        assert!(wait_until(|| h.launcher.calls.load(Ordering::SeqCst) == 1).await);
        assert!(wait_until(|| !h.gateway.restart_in_flight(&key)).await);

        for _ in 0..2 {
            h.gateway
                .note_failure(&key, Some(1), ProxyFailure::ConnectionRefused)
                .await;
        }
        assert!(wait_until(|| h.launcher.calls.load(Ordering::SeqCst) == 2).await);
        assert!(wait_until(|| !h.gateway.restart_in_flight(&key)).await);
        assert_eq!(h.terminator.calls.lock().unwrap().len(), 2);
    }

    /// Serves one `text/event-stream` response that trickles out events.
    async fn slow_event_stream(events: usize, gap: Duration) -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf).await;
            stream
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n")
                .await
                .unwrap();
            for n in 0..events {
                tokio::time::sleep(gap).await;
                stream
                    .write_all(format!("data: {n}\n\n").as_bytes())
                    .await
                    .unwrap();
            }
        });
        port
    }

    #[tokio::test]
    async fn long_streams_outlive_request_timeout() {
        let h = harness_with(
            Vec::new(),
            FakeLauncher::failing(),
            GatewayConfig {
                request_timeout_ms: 400,
                ..GatewayConfig::default()
            },
        );
        let port = slow_event_stream(5, Duration::from_millis(150)).await;
        running_frontend(&h.registry, 12, port, ProcessStatus::Running);

        let response = app(&h.gateway)
            .oneshot(
                Request::builder()
                    .uri("/preview/12/events")
                    .header(header::ACCEPT, "text/event-stream")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        assert!(body.starts_with("data: 0\n\n"));
        assert!(body.ends_with("data: 4\n\n"));
    }

    #[tokio::test]
    async fn not_modified_html_is_passed_through_empty() {
        let upstream = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(304).insert_header("content-type", "text/html"))
            .mount(&upstream)
            .await;

        let h = harness(Vec::new(), FakeLauncher::failing());
        running_frontend(&h.registry, 12, upstream.address().port(), ProcessStatus::Running);

        let response = app(&h.gateway)
            .oneshot(
                Request::builder()
                    .uri("/preview/12/")
                    .header(header::IF_NONE_MATCH, "\"abc\"")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
        assert!(body_string(response).await.is_empty());
    }

    fn first_offered_protocol(
        request: &WsRequest,
        mut response: WsResponse,
    ) -> Result<WsResponse, ErrorResponse> {
        let offered = request
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(|value| value.trim().to_string());
        if let Some(protocol) = offered {
            response.headers_mut().insert(
                header::SEC_WEBSOCKET_PROTOCOL,
                HeaderValue::from_str(&protocol).unwrap(),
            );
        }
        Ok(response)
    }

    /// A dev-server stand-in that echoes text and binary frames.
    async fn echo_upstream() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let Ok(mut socket) =
                        tokio_tungstenite::accept_hdr_async(stream, first_offered_protocol).await
                    else {
                        return;
                    };
                    while let Some(Ok(message)) = socket.next().await {
                        if message.is_text() || message.is_binary() {
                            let _ = socket.send(message).await;
                        }
                    }
                });
            }
        });
        port
    }

    /// Serves the gateway in front of the fallback router on a real socket.
    async fn serve_gateway(gateway: &PreviewGateway) -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let router = app(gateway);
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        port
    }

    fn hmr_request(gateway_port: u16) -> axum::http::Request<()> {
        let mut request = format!("ws://127.0.0.1:{gateway_port}/?token=abc")
            .into_client_request()
            .unwrap();
        let headers = request.headers_mut();
        headers.insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("vite-hmr"));
        headers.insert(header::COOKIE, HeaderValue::from_static("lucidcoder_preview_project=12"));
        request
    }

    #[tokio::test]
    async fn hmr_socket_is_proxied_with_protocol() {
        let h = harness(Vec::new(), FakeLauncher::failing());
        running_frontend(&h.registry, 12, echo_upstream().await, ProcessStatus::Running);
        let gateway_port = serve_gateway(&h.gateway).await;

        let (mut socket, response) = tokio_tungstenite::connect_async(hmr_request(gateway_port))
            .await
            .unwrap();
        assert_eq!(response.headers()[header::SEC_WEBSOCKET_PROTOCOL], "vite-hmr");

        socket.send(Message::text("{\"type\":\"ping\"}")).await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(reply, Message::text("{\"type\":\"ping\"}"));
        socket.close(None).await.unwrap();
    }

    #[tokio::test]
    async fn hmr_socket_to_dead_port_fails_and_clears_handle() {
        let h = harness(Vec::new(), FakeLauncher::failing());
        running_frontend(&h.registry, 12, dead_port(), ProcessStatus::Running);
        let gateway_port = serve_gateway(&h.gateway).await;

        let err = tokio_tungstenite::connect_async(hmr_request(gateway_port))
            .await
            .unwrap_err();
        match err {
            WsError::Http(response) => assert_eq!(response.status(), StatusCode::BAD_GATEWAY),
            other => panic!("unexpected error: {other:?}"),
        }

        let snapshot = h.registry.get(&ProjectKey::from(12u64));
        assert!(snapshot.processes.frontend.is_none());
        assert_eq!(snapshot.state, RecordState::Stopped);
    }

    #[tokio::test]
    async fn timeouts_do_not_count_towards_restart() {
        let h = harness(vec![project("6", "/tmp/p6", Some(3000))], FakeLauncher::failing());
        let key = ProjectKey::from(6u64);
        for _ in 0..3 {
            h.gateway.note_failure(&key, Some(3000), ProxyFailure::Timeout).await;
        }
        assert!(!h.gateway.restart_in_flight(&key));
        assert_eq!(h.gateway.resolve_target(&key).await, UpstreamTarget::Port(3000));
    }

    #[tokio::test]
    async fn uploads_are_served_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("uploads")).unwrap();
        std::fs::write(dir.path().join("uploads/logo.svg"), "<svg/>").unwrap();
        let h = harness(
            vec![project("3", dir.path().to_str().unwrap(), None)],
            FakeLauncher::failing(),
        );

        let response = app(&h.gateway)
            .oneshot(
                Request::builder()
                    .uri("/uploads/logo.svg")
                    .header(header::COOKIE, "lucidcoder_preview_project=3")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/svg+xml");
        assert_eq!(body_string(response).await, "<svg/>");
    }

    #[tokio::test]
    async fn stored_port_used_without_live_handle() {
        let h = harness(
            vec![ProjectInfo {
                id: "8".into(),
                path: "/tmp/p8".into(),
                frontend_framework: Some("vite".into()),
                ..ProjectInfo::default()
            }],
            FakeLauncher::failing(),
        );
        assert_eq!(
            h.gateway.resolve_target(&ProjectKey::from(8u64)).await,
            UpstreamTarget::Port(5173)
        );
        assert_eq!(
            h.gateway.resolve_target(&ProjectKey::from(404u64)).await,
            UpstreamTarget::Unknown
        );
    }
}
