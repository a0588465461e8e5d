//! API route definitions.

use axum::{
    Router,
    routing::{any, get, post},
};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::handlers;
use super::proxy;
use super::state::AppState;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    Router::new()
        .route("/", get(handlers::login_page))
        .route("/login", post(handlers::login))
        .route("/session/{session_id}", get(handlers::session_page))
        .route(
            "/ping/{session_id}",
            get(handlers::ping).post(handlers::ping),
        )
        .route("/logout/{session_id}", get(handlers::logout))
        .route("/health", get(handlers::health))
        // Desktop traffic
        .route("/proxy", any(handlers::malformed_proxy_path))
        .route("/proxy/", any(handlers::malformed_proxy_path))
        .route("/proxy/{session_id}", any(handlers::malformed_proxy_path))
        .route("/proxy/{session_id}/", any(proxy::proxy_root))
        .route("/proxy/{session_id}/{*path}", any(proxy::proxy_path))
        .layer(trace_layer)
        .with_state(state)
}
