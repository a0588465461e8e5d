//! Shared helpers for gateway integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, Bytes},
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    http::{Method, Request, Response, Uri, header},
    response::IntoResponse,
    routing::{any, get},
};
use futures::{SinkExt, StreamExt};
use lookingglass::api::{AppState, create_router};
use lookingglass::auth::{FileCredentialStore, hash_password};
use lookingglass::container::{
    ContainerConfig, ContainerError, ContainerResult, ContainerRuntimeApi, DesktopOrchestrator,
    DesktopSettings,
};
use lookingglass::overlay::{Mounter, OverlayManager, OverlayResult};
use lookingglass::pages::Pages;
use lookingglass::session::{PortAllocator, SessionService};
use tokio::task::JoinHandle;
use tower::ServiceExt;

pub const MAX_BODY: usize = 4096;

/// Each test draws its own backend port window so parallel tests never
/// hand out the same port.
static NEXT_PORT_WINDOW: AtomicU16 = AtomicU16::new(0);

fn port_window() -> (u16, u16) {
    let n = NEXT_PORT_WINDOW.fetch_add(1, Ordering::SeqCst);
    let start = 42000 + n * 16;
    (start, start + 16)
}

/// Container runtime that serves a tiny desktop backend on the published
/// loopback port instead of launching a container.
#[derive(Default)]
pub struct FakeDesktopRuntime {
    backends: Mutex<HashMap<String, JoinHandle<()>>>,
    removed: Mutex<Vec<String>>,
    pub fail_run: AtomicBool,
}

impl FakeDesktopRuntime {
    pub fn running(&self) -> HashSet<String> {
        self.backends.lock().unwrap().keys().cloned().collect()
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }

    /// Stop serving a backend without telling the gateway.
    pub fn kill_backend(&self, name: &str) {
        if let Some(handle) = self.backends.lock().unwrap().remove(name) {
            handle.abort();
        }
    }
}

#[async_trait]
impl ContainerRuntimeApi for FakeDesktopRuntime {
    async fn run_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        config.validate()?;
        if self.fail_run.load(Ordering::SeqCst) {
            return Err(ContainerError::CommandFailed {
                command: "run".to_string(),
                message: "Unable to find image 'ubuntu-xfce-novnc:latest' locally".to_string(),
            });
        }

        let mapping = config
            .ports
            .first()
            .ok_or_else(|| ContainerError::InvalidInput("no published port".to_string()))?;
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", mapping.host_port))
            .await
            .map_err(ContainerError::Io)?;

        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, desktop_backend()).await;
        });
        self.backends
            .lock()
            .unwrap()
            .insert(config.name.clone(), handle);
        Ok(format!("fake-{}", config.name))
    }

    async fn remove_container(&self, name: &str) -> ContainerResult<()> {
        self.removed.lock().unwrap().push(name.to_string());
        if let Some(handle) = self.backends.lock().unwrap().remove(name) {
            handle.abort();
        }
        Ok(())
    }

    async fn list_container_names(
        &self,
        prefix: &str,
        label: &str,
    ) -> ContainerResult<Vec<String>> {
        // Every container this runtime starts carries the session label.
        assert_eq!(label, lookingglass::container::SESSION_LABEL);
        Ok(self
            .running()
            .into_iter()
            .filter(|name| name.starts_with(prefix))
            .collect())
    }
}

/// Stand-in for the in-container desktop web server.
fn desktop_backend() -> Router {
    Router::new()
        .route("/vnc.html", get(|| async { "<title>noVNC</title>" }))
        .route("/websockify", get(websockify))
        .route("/echo/{*rest}", any(echo))
}

async fn echo(method: Method, uri: Uri, headers: axum::http::HeaderMap, body: Bytes) -> String {
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    format!(
        "{} {} host={} body={}",
        method,
        uri,
        host,
        String::from_utf8_lossy(&body)
    )
}

async fn websockify(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.protocols(["binary"]).on_upgrade(echo_socket)
}

async fn echo_socket(socket: WebSocket) {
    let (mut tx, mut rx) = socket.split();
    while let Some(Ok(msg)) = rx.next().await {
        match msg {
            Message::Text(_) | Message::Binary(_) => {
                if tx.send(msg).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
}

/// Records mounts instead of calling mount(8).
#[derive(Default)]
pub struct FakeMounter {
    mounted: Mutex<HashSet<PathBuf>>,
}

impl FakeMounter {
    pub fn is_mounted(&self, path: &Path) -> bool {
        self.mounted.lock().unwrap().contains(path)
    }

    pub fn mount_count(&self) -> usize {
        self.mounted.lock().unwrap().len()
    }
}

#[async_trait]
impl Mounter for FakeMounter {
    async fn mount_overlay(
        &self,
        _lower: &Path,
        _upper: &Path,
        _work: &Path,
        merged: &Path,
    ) -> OverlayResult<()> {
        self.mounted.lock().unwrap().insert(merged.to_path_buf());
        Ok(())
    }

    async fn unmount_lazy(&self, target: &Path) -> OverlayResult<bool> {
        Ok(self.mounted.lock().unwrap().remove(target))
    }
}

pub struct TestApp {
    pub router: Router,
    pub sessions: Arc<SessionService>,
    pub runtime: Arc<FakeDesktopRuntime>,
    pub mounter: Arc<FakeMounter>,
    pub storage_root: PathBuf,
    _dir: tempfile::TempDir,
}

impl TestApp {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let storage_root = dir.path().join("overlays");
        let base = storage_root.join("base");
        std::fs::create_dir_all(&base).unwrap();

        let users = dir.path().join("users");
        std::fs::create_dir_all(&users).unwrap();
        write_user(&users, "alice", "wonderland", "storage = \"persistent\"\n");
        write_user(&users, "guest", "guest", "storage = \"ephemeral\"\n");

        let runtime = Arc::new(FakeDesktopRuntime::default());
        let mounter = Arc::new(FakeMounter::default());
        let (start, end) = port_window();

        let sessions = Arc::new(SessionService::new(
            Arc::new(FileCredentialStore::new(&users)),
            OverlayManager::new(&storage_root, base, "guest-", mounter.clone()),
            DesktopOrchestrator::new(runtime.clone(), DesktopSettings::default()),
            PortAllocator::new(start, end),
        ));

        let state = AppState::new(sessions.clone(), Pages::default(), MAX_BODY, Duration::ZERO);

        Self {
            router: create_router(state),
            sessions,
            runtime,
            mounter,
            storage_root,
            _dir: dir,
        }
    }

    pub async fn request(&self, req: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(req).await.unwrap()
    }

    pub async fn get(&self, uri: &str) -> Response<Body> {
        self.request(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
    }

    pub async fn login(&self, username: &str, password: &str) -> Response<Body> {
        let form = format!("username={}&password={}", username, password);
        self.request(
            Request::builder()
                .method(Method::POST)
                .uri("/login")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from(form))
                .unwrap(),
        )
        .await
    }

    /// Log in and return the new session id.
    pub async fn login_ok(&self, username: &str, password: &str) -> String {
        let response = self.login(username, password).await;
        assert_eq!(response.status(), axum::http::StatusCode::FOUND);
        let location = response.headers()[header::LOCATION].to_str().unwrap();
        location
            .strip_prefix("/session/")
            .expect("redirect to session page")
            .to_string()
    }
}

pub fn write_user(dir: &Path, name: &str, password: &str, extra: &str) {
    let hash = hash_password(password, 4).unwrap();
    std::fs::write(
        dir.join(format!("{}.toml", name)),
        format!("password_hash = \"{}\"\n{}", hash, extra),
    )
    .unwrap();
}

pub async fn body_string(response: Response<Body>) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_str(&body_string(response).await).unwrap()
}
