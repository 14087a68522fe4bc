//! Diagnostics mounted under `/__debug` when `server.debug_routes` is on.

use std::collections::BTreeMap;

use axum::{extract::State, routing::get, Json, Router};
use lucidcoder_schema::ProcessRecord;
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningProcessesDump {
    pub count: usize,
    pub projects: BTreeMap<String, ProcessRecord>,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/running-processes", get(running_processes))
}

pub async fn running_processes(State(state): State<AppState>) -> Json<RunningProcessesDump> {
    let projects = state.registry.dump();
    Json(RunningProcessesDump {
        count: projects.len(),
        projects,
    })
}
