pub mod config;
pub mod routes;
pub mod state;

use anyhow::Result;
use axum::http::StatusCode;
use axum::middleware;
use axum::Router;
use lucidcoder_gateway::preview_middleware;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mut router = Router::new().nest("/api", routes::api_router());
    if state.debug_routes {
        router = router.nest("/__debug", routes::debug::router());
    }

    // The preview middleware runs before routing so it also sees paths
    // that would otherwise hit the fallback.
    router
        .fallback(|| async { StatusCode::NOT_FOUND })
        .layer(middleware::from_fn_with_state(
            state.gateway.clone(),
            preview_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: AppState, addr: &str) -> Result<()> {
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("lucidcoder-server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}
