//! Application state shared across handlers.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;

use crate::pages::Pages;
use crate::session::SessionService;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionService>,
    pub pages: Arc<Pages>,
    /// HTTP client for proxying requests to desktop backends.
    pub http_client: Client<HttpConnector, Body>,
    pub max_proxy_body_bytes: usize,
    /// Window after container start in which connection errors are retried.
    pub backend_startup_grace: Duration,
}

impl AppState {
    pub fn new(
        sessions: Arc<SessionService>,
        pages: Pages,
        max_proxy_body_bytes: usize,
        backend_startup_grace: Duration,
    ) -> Self {
        let http_client = Client::builder(TokioExecutor::new()).build_http();

        Self {
            sessions,
            pages: Arc::new(pages),
            http_client,
            max_proxy_body_bytes,
            backend_startup_grace,
        }
    }
}
