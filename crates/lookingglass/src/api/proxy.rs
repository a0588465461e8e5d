//! HTTP and WebSocket proxy into desktop containers.
//!
//! `/proxy/{id}/{rest}` is forwarded to `127.0.0.1:<port>/{rest}` of the
//! session's backend. Every forwarded request refreshes the session.

use std::time::Duration;

use axum::{
    body::Body,
    extract::{FromRequestParts, Path, State, WebSocketUpgrade},
    http::{HeaderMap, HeaderName, HeaderValue, Request, Uri, header},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use http_body_util::LengthLimitError;
use log::{debug, error, warn};
use tokio::time::Instant;
use tokio_tungstenite::connect_async;

use super::error::{ApiError, ApiResult};
use super::state::AppState;
use crate::session::Session;

/// Minimum spacing of activity touches from a WebSocket relay.
const WS_TOUCH_INTERVAL: Duration = Duration::from_secs(10);
/// How often a websocket relay checks that its session still exists.
const SESSION_WATCH_INTERVAL: Duration = Duration::from_secs(2);

/// Headers that only apply to a single transport hop.
const HOP_BY_HOP: [&str; 7] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// `/proxy/{id}/`
pub async fn proxy_root(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    req: Request<Body>,
) -> ApiResult<Response> {
    forward(state, session_id, req).await
}

/// `/proxy/{id}/{*rest}`
pub async fn proxy_path(
    State(state): State<AppState>,
    Path((session_id, _rest)): Path<(String, String)>,
    req: Request<Body>,
) -> ApiResult<Response> {
    forward(state, session_id, req).await
}

async fn forward(state: AppState, session_id: String, req: Request<Body>) -> ApiResult<Response> {
    let session = state
        .sessions
        .touch(&session_id)
        .await
        .ok_or_else(|| ApiError::not_found(session_id.clone()))?;

    // The captured path is percent-decoded; forward the bytes the client sent.
    let rest = raw_backend_path(req.uri().path())
        .ok_or_else(|| ApiError::bad_request(format!("malformed proxy path: {}", req.uri())))?
        .to_string();

    if is_websocket_upgrade(req.headers()) {
        return relay_websocket(state, session, rest, req).await;
    }

    proxy_request(&state, &session, &rest, req).await
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// Strip `/proxy/{id}/` from a raw request path, leaving the rest encoded.
fn raw_backend_path(path: &str) -> Option<&str> {
    let (_, rest) = path.strip_prefix("/proxy/")?.split_once('/')?;
    Some(rest)
}

/// Build the backend URI for `rest`, keeping the query string.
fn backend_uri(scheme: &str, session: &Session, rest: &str, original: &Uri) -> ApiResult<Uri> {
    let mut target = format!("{}://{}/{}", scheme, session.backend_authority(), rest);
    if let Some(query) = original.query() {
        target.push('?');
        target.push_str(query);
    }
    target.parse().map_err(|e| {
        error!("Invalid target URI {}: {:?}", target, e);
        ApiError::bad_request(format!("invalid proxy path: {}", rest))
    })
}

/// Drop hop-by-hop headers, including any named in `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

fn within_startup_grace(state: &AppState, session: &Session) -> bool {
    match session.age(Utc::now()).to_std() {
        Ok(age) => age < state.backend_startup_grace,
        // Clock skew; treat as just started.
        Err(_) => true,
    }
}

fn is_length_limit(err: &axum::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(current) = source {
        if current.is::<LengthLimitError>() {
            return true;
        }
        source = current.source();
    }
    false
}

/// Forward a plain HTTP request.
///
/// The body is buffered so the request can be replayed while a freshly
/// started desktop server is not yet listening.
async fn proxy_request(
    state: &AppState,
    session: &Session,
    rest: &str,
    req: Request<Body>,
) -> ApiResult<Response> {
    let uri = backend_uri("http", session, rest, req.uri())?;
    let (mut parts, body) = req.into_parts();

    let body = axum::body::to_bytes(body, state.max_proxy_body_bytes)
        .await
        .map_err(|e| {
            if is_length_limit(&e) {
                ApiError::PayloadTooLarge(format!("limit is {} bytes", state.max_proxy_body_bytes))
            } else {
                ApiError::bad_request(format!("failed to read request body: {}", e))
            }
        })?;

    strip_hop_by_hop(&mut parts.headers);
    let host = HeaderValue::from_str(&session.backend_authority())
        .map_err(|e| ApiError::internal(format!("invalid backend authority: {}", e)))?;
    parts.headers.insert(header::HOST, host);

    debug!("Proxying {} {} to {}", parts.method, rest, uri);

    let mut attempts: u32 = 0;
    let response = loop {
        attempts += 1;
        let mut outbound = Request::builder()
            .method(parts.method.clone())
            .uri(uri.clone())
            .body(Body::from(body.clone()))
            .map_err(|e| ApiError::internal(format!("building proxy request: {}", e)))?;
        *outbound.headers_mut() = parts.headers.clone();

        match state.http_client.request(outbound).await {
            Ok(response) => break response,
            Err(e) if e.is_connect() && within_startup_grace(state, session) => {
                let backoff = Duration::from_millis(u64::from(attempts.min(10)) * 100);
                debug!(
                    "Backend for session {} not ready (attempt {}): {}; retrying in {:?}",
                    session.id, attempts, e, backoff
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) => {
                error!("Proxy request to session {} failed: {:?}", session.id, e);
                return Err(ApiError::bad_gateway(format!(
                    "desktop for session {} is unreachable",
                    session.id
                )));
            }
        }
    };

    let (mut parts, body) = response.into_parts();
    strip_hop_by_hop(&mut parts.headers);
    Ok(Response::from_parts(parts, Body::new(body)))
}

/// Upgrade the client connection and relay frames to the backend.
///
/// The backend connection is made first so the subprotocol it picks can
/// be returned to the client.
async fn relay_websocket(
    state: AppState,
    session: Session,
    rest: String,
    req: Request<Body>,
) -> ApiResult<Response> {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    let uri = backend_uri("ws", &session, &rest, req.uri())?;
    let requested_protocols = req
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .cloned();

    let (mut parts, _body) = req.into_parts();
    let ws = match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
        Ok(ws) => ws,
        Err(rejection) => return Ok(rejection.into_response()),
    };

    let mut attempts: u32 = 0;
    let (backend, backend_response) = loop {
        attempts += 1;
        let mut request = uri
            .to_string()
            .into_client_request()
            .map_err(|e| ApiError::internal(format!("building backend request: {}", e)))?;
        if let Some(protocols) = &requested_protocols {
            request
                .headers_mut()
                .insert(header::SEC_WEBSOCKET_PROTOCOL, protocols.clone());
        }

        match connect_async(request).await {
            Ok(connected) => break connected,
            Err(e) if within_startup_grace(&state, &session) => {
                let backoff = Duration::from_millis(u64::from(attempts.min(10)) * 100);
                debug!(
                    "Desktop websocket for session {} not ready (attempt {}): {}; retrying in {:?}",
                    session.id, attempts, e, backoff
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) => {
                error!("Websocket connect to session {} failed: {:?}", session.id, e);
                return Err(ApiError::bad_gateway(format!(
                    "desktop for session {} is unreachable",
                    session.id
                )));
            }
        }
    };

    let chosen = backend_response
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let ws = match chosen {
        Some(protocol) => ws.protocols([protocol]),
        None => ws,
    };

    debug!("Relaying websocket for session {} to {}", session.id, uri);
    Ok(ws.on_upgrade(move |socket| async move {
        if let Err(e) = handle_websocket_relay(socket, backend, state, session.id.clone()).await {
            warn!("Websocket relay for session {} ended: {:?}", session.id, e);
        }
    }))
}

async fn handle_websocket_relay(
    client_socket: axum::extract::ws::WebSocket,
    backend_socket: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    state: AppState,
    session_id: String,
) -> anyhow::Result<()> {
    use axum::extract::ws::{CloseFrame as AxumCloseFrame, Message as AxumMessage};
    use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame as TungsteniteCloseFrame;

    let (mut backend_write, mut backend_read) = backend_socket.split();
    let (mut client_write, mut client_read) = client_socket.split();

    // Forward client -> backend, refreshing the session as frames arrive.
    let client_to_backend = async {
        let mut last_touch = Instant::now();
        while let Some(msg) = client_read.next().await {
            if last_touch.elapsed() >= WS_TOUCH_INTERVAL {
                if state.sessions.touch(&session_id).await.is_none() {
                    break;
                }
                last_touch = Instant::now();
            }

            let forwarded = match msg {
                Ok(AxumMessage::Text(text)) => TungsteniteMessage::Text(text.to_string().into()),
                Ok(AxumMessage::Binary(data)) => TungsteniteMessage::Binary(data),
                Ok(AxumMessage::Ping(data)) => TungsteniteMessage::Ping(data),
                Ok(AxumMessage::Pong(data)) => TungsteniteMessage::Pong(data),
                Ok(AxumMessage::Close(frame)) => {
                    let frame = frame.map(|f| TungsteniteCloseFrame {
                        code: f.code.into(),
                        reason: f.reason.to_string().into(),
                    });
                    let _ = backend_write.send(TungsteniteMessage::Close(frame)).await;
                    break;
                }
                Err(_) => break,
            };
            if backend_write.send(forwarded).await.is_err() {
                break;
            }
        }
    };

    // Forward backend -> client
    let backend_to_client = async {
        while let Some(msg) = backend_read.next().await {
            let forwarded = match msg {
                Ok(TungsteniteMessage::Text(text)) => AxumMessage::Text(text.to_string().into()),
                Ok(TungsteniteMessage::Binary(data)) => AxumMessage::Binary(data),
                Ok(TungsteniteMessage::Ping(data)) => AxumMessage::Ping(data),
                Ok(TungsteniteMessage::Pong(data)) => AxumMessage::Pong(data),
                Ok(TungsteniteMessage::Close(frame)) => {
                    let frame = frame.map(|f| AxumCloseFrame {
                        code: f.code.into(),
                        reason: f.reason.to_string().into(),
                    });
                    let _ = client_write.send(AxumMessage::Close(frame)).await;
                    break;
                }
                Ok(TungsteniteMessage::Frame(_)) => continue,
                Err(_) => break,
            };
            if client_write.send(forwarded).await.is_err() {
                break;
            }
        }
    };

    // Ends the relay once the session has been torn down.
    let session_gone = async {
        let mut interval = tokio::time::interval(SESSION_WATCH_INTERVAL);
        loop {
            interval.tick().await;
            if state.sessions.get(&session_id).await.is_none() {
                debug!("Session {} is gone, closing websocket relay", session_id);
                break;
            }
        }
    };

    tokio::select! {
        _ = client_to_backend => {}
        _ = backend_to_client => {}
        _ = session_gone => {}
    }

    Ok(())
}
