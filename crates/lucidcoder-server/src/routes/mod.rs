pub mod debug;
pub mod projects;

use axum::Router;

use crate::state::AppState;

pub fn api_router() -> Router<AppState> {
    Router::new().nest("/projects", projects::router())
}
