//! Page, login and session control handlers.

use axum::{
    Form, Json,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{Html, IntoResponse, Response},
};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::error::{ApiError, ApiResult};
use super::state::AppState;

#[derive(Debug, Deserialize)]
pub struct LoginForm {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub sessions: usize,
}

/// `302 Found` to `location`.
fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}

pub async fn login_page(State(state): State<AppState>) -> Html<String> {
    Html(state.pages.login().to_string())
}

/// Authenticate, provision a desktop and redirect to its page.
pub async fn login(
    State(state): State<AppState>,
    Form(form): Form<LoginForm>,
) -> ApiResult<Response> {
    let session = state
        .sessions
        .start_session(&form.username, &form.password)
        .await?;

    info!("User '{}' logged in to session {}", session.owner, session.id);
    Ok(found(&format!("/session/{}", session.id)))
}

/// Desktop wrapper page. Opening it counts as activity.
pub async fn session_page(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Html<String>> {
    let session = state
        .sessions
        .touch(&session_id)
        .await
        .ok_or_else(|| ApiError::not_found(session_id.clone()))?;

    Ok(Html(state.pages.session(&session.id)))
}

/// Heartbeat. Always succeeds; unknown ids are ignored.
pub async fn ping(State(state): State<AppState>, Path(session_id): Path<String>) -> StatusCode {
    if state.sessions.touch(&session_id).await.is_none() {
        debug!("Ping for unknown session {}", session_id);
    }
    StatusCode::OK
}

/// Tear down a session and return to the login page.
pub async fn logout(State(state): State<AppState>, Path(session_id): Path<String>) -> Response {
    if state.sessions.stop_session(&session_id).await {
        info!("Session {} logged out", session_id);
    }
    found("/")
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        sessions: state.sessions.session_count().await,
    })
}

/// Proxy paths without a session id and sub-path.
pub async fn malformed_proxy_path() -> ApiError {
    ApiError::bad_request("expected /proxy/{session_id}/{path}")
}
