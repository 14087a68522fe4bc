use std::path::Path as FsPath;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use lucidcoder_reaper::{TerminateOptions, TerminationOutcome};
use lucidcoder_registry::{ProjectKey, StoreOptions};
use lucidcoder_schema::{
    LaunchType, ProcessMap, ProcessSnapshot, ProcessTarget, ProjectInfo, ProjectPorts, RecordState,
    StartOptions,
};
use serde::{Deserialize, Serialize};

use crate::state::AppState;

type ApiError = (StatusCode, String);

#[derive(Debug, Deserialize)]
pub struct TargetParams {
    pub target: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessesResponse {
    pub project_id: String,
    #[serde(flatten)]
    pub snapshot: ProcessSnapshot,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopResponse {
    pub project_id: String,
    #[serde(flatten)]
    pub outcome: TerminationOutcome,
    #[serde(flatten)]
    pub snapshot: ProcessSnapshot,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{id}/processes", get(get_processes))
        .route("/{id}/start", post(start_project))
        .route("/{id}/stop", post(stop_project))
        .route("/{id}/restart", post(restart_project))
}

pub async fn get_processes(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ProcessesResponse>, ApiError> {
    let key = parse_key(&id)?;
    Ok(Json(processes_response(&state, &key)))
}

pub async fn start_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ProcessesResponse>, ApiError> {
    let key = parse_key(&id)?;
    let project = require_project(&state, &key).await?;

    if state.registry.get(&key).is_active() {
        tracing::debug!(project_id = %key, "start requested for running project");
        return Ok(Json(processes_response(&state, &key)));
    }

    launch(&state, &key, &project, None).await?;
    Ok(Json(processes_response(&state, &key)))
}

pub async fn stop_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<TargetParams>,
) -> Result<Json<StopResponse>, ApiError> {
    let key = parse_key(&id)?;
    let target = parse_target(params.target.as_deref())?;
    let project = find_project(&state, &key).await?;
    if project.is_none() && !state.registry.contains(&key) {
        return Err((StatusCode::NOT_FOUND, format!("unknown project: {key}")));
    }

    let outcome = state
        .terminator
        .terminate_running_processes(
            &key,
            TerminateOptions {
                project,
                target,
                wait_for_release: false,
                ..TerminateOptions::default()
            },
        )
        .await;
    tracing::info!(project_id = %key, target = ?target, was_running = outcome.was_running, "project stopped");

    Ok(Json(StopResponse {
        project_id: key.to_string(),
        outcome,
        snapshot: visible_snapshot(state.registry.get(&key)),
    }))
}

pub async fn restart_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<TargetParams>,
) -> Result<Json<ProcessesResponse>, ApiError> {
    let key = parse_key(&id)?;
    let target = parse_target(params.target.as_deref())?;
    let project = require_project(&state, &key).await?;

    state
        .terminator
        .terminate_running_processes(
            &key,
            TerminateOptions {
                project: Some(project.clone()),
                target,
                wait_for_release: true,
                ..TerminateOptions::default()
            },
        )
        .await;

    launch(&state, &key, &project, target).await?;
    Ok(Json(processes_response(&state, &key)))
}

/// Starts the project (or one half of it) and records the new handles.
/// A single-target launch keeps the sibling's handle as it is.
async fn launch(
    state: &AppState,
    key: &ProjectKey,
    project: &ProjectInfo,
    target: Option<ProcessTarget>,
) -> Result<(), ApiError> {
    let options = StartOptions {
        frontend_port: project.port_hint(ProcessTarget::Frontend),
        backend_port: project.port_hint(ProcessTarget::Backend),
        log_key: Some(key.to_string()),
        target,
        ..StartOptions::default()
    };
    let result = state
        .launcher
        .start_project(FsPath::new(&project.path), options)
        .await
        .map_err(internal)?;
    if !result.success {
        let error = result.error.unwrap_or_else(|| "launch failed".to_string());
        tracing::warn!(project_id = %key, error = %error, "project launch failed");
        return Err((StatusCode::UNPROCESSABLE_ENTITY, error));
    }

    let processes = match target {
        Some(target) => {
            let mut processes = state.registry.get(key).processes;
            *processes.slot(target) = result.processes.get(target).cloned();
            processes
        }
        None => result.processes,
    };
    let ports = ProjectPorts::from_processes(&processes);
    state.registry.store(
        key,
        processes,
        RecordState::Running,
        StoreOptions::launched(LaunchType::Manual),
    );
    if let Err(err) = state.projects.update_project_ports(key.as_str(), ports).await {
        tracing::warn!(project_id = %key, error = %err, "failed to persist project ports");
    }
    tracing::info!(project_id = %key, ?ports, "project launched");
    Ok(())
}

/// A stopped project whose snapshot was hidden reports no handles.
fn visible_snapshot(mut snapshot: ProcessSnapshot) -> ProcessSnapshot {
    if snapshot.state != RecordState::Running && !snapshot.snapshot_visible {
        snapshot.processes = ProcessMap::default();
    }
    snapshot
}

fn processes_response(state: &AppState, key: &ProjectKey) -> ProcessesResponse {
    ProcessesResponse {
        project_id: key.to_string(),
        snapshot: visible_snapshot(state.registry.get(key)),
    }
}

fn parse_key(raw: &str) -> Result<ProjectKey, ApiError> {
    ProjectKey::parse(raw).map_err(|err| (StatusCode::BAD_REQUEST, err.to_string()))
}

fn parse_target(raw: Option<&str>) -> Result<Option<ProcessTarget>, ApiError> {
    match raw.map(str::trim).filter(|raw| !raw.is_empty()) {
        None => Ok(None),
        Some(raw) => ProcessTarget::parse(raw)
            .map(Some)
            .ok_or_else(|| (StatusCode::BAD_REQUEST, format!("unknown target: {raw}"))),
    }
}

async fn find_project(state: &AppState, key: &ProjectKey) -> Result<Option<ProjectInfo>, ApiError> {
    state
        .projects
        .get_project(key.as_str())
        .await
        .map_err(internal)
}

async fn require_project(state: &AppState, key: &ProjectKey) -> Result<ProjectInfo, ApiError> {
    find_project(state, key)
        .await?
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("unknown project: {key}")))
}

fn internal(err: anyhow::Error) -> ApiError {
    tracing::error!(error = %format!("{err:#}"), "project route failed");
    (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
}
