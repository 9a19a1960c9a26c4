mod health;
mod tools;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppContext;

pub fn router(context: AppContext) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/tool", post(tools::call_tool))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(context)
}
