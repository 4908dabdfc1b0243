//! WebDriver reverse proxy: one local endpoint multiplexing many driver
//! processes.
//!
//! New-session requests acquire the driver for the requested browser from
//! the pool, forward the session-creation body, and absorb the common race
//! where a driver announces readiness slightly before its HTTP listener
//! accepts connections. All other traffic is routed by the session id
//! embedded in the path and relayed verbatim.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Bytes,
    extract::{Request, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::pool::{DriverPool, ProcessRef};

#[derive(Clone)]
struct SessionEntry {
    process: ProcessRef,
    /// The driver's session-creation response, served by `GET /sessions`.
    payload: Value,
}

struct ProxyShared {
    pool: Arc<DriverPool>,
    sessions: RwLock<HashMap<String, SessionEntry>>,
    client: reqwest::Client,
    prefix: String,
    max_connect_attempts: u32,
    retry_delay: Duration,
}

#[derive(Clone)]
pub struct ProxyState {
    inner: Arc<ProxyShared>,
}

impl ProxyState {
    pub fn new(pool: Arc<DriverPool>, config: &Config) -> Self {
        Self {
            inner: Arc::new(ProxyShared {
                pool,
                sessions: RwLock::new(HashMap::new()),
                client: reqwest::Client::new(),
                prefix: config.path_prefix.clone(),
                max_connect_attempts: config.max_connect_attempts,
                retry_delay: Duration::from_millis(250),
            }),
        }
    }

    pub fn pool(&self) -> &Arc<DriverPool> {
        &self.inner.pool
    }

    /// Best-effort shutdown: ask every process owning a mapped session to
    /// stop, without waiting on the individual stops.
    pub async fn shutdown(&self) {
        let owners: Vec<String> = {
            let mut sessions = self.inner.sessions.write().await;
            let browsers = sessions
                .values()
                .map(|e| e.process.browser.clone())
                .collect::<std::collections::HashSet<_>>();
            sessions.clear();
            browsers.into_iter().collect()
        };
        for browser in owners {
            let pool = Arc::clone(&self.inner.pool);
            tokio::spawn(async move {
                if let Err(e) = pool.stop_browser(&browser).await {
                    warn!("Failed to stop {} during shutdown: {}", browser, e);
                }
            });
        }
    }
}

pub fn router(state: ProxyState) -> Router {
    let prefix = &state.inner.prefix;
    Router::new()
        .route(&format!("{prefix}/session"), post(create_session))
        .route(&format!("{prefix}/sessions"), get(list_sessions))
        .fallback(forward_session_request)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind the proxy and serve until Ctrl+C, then stop the session owners and
/// the rest of the pool under a timeout.
pub async fn serve(state: ProxyState, bind: &str) -> Result<()> {
    let app = router(state.clone());
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(
        "WebDriver hub listening on http://{}{} (Ctrl+C to stop)",
        bind, state.inner.prefix
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received shutdown signal, stopping driver processes...");
            let cleanup = async {
                state.shutdown().await;
                state.inner.pool.release_all().await;
            };
            match tokio::time::timeout(Duration::from_secs(8), cleanup).await {
                Ok(()) => info!("Driver cleanup completed"),
                Err(_) => warn!("Driver cleanup timed out; some processes may still be running"),
            }
        })
        .await?;
    Ok(())
}

/// `{value: {error, message}}` per the WebDriver error shape; transport
/// problems are never leaked to clients as raw errors.
fn webdriver_error(status: StatusCode, error: &str, message: &str) -> Response {
    let body = json!({
        "value": {
            "error": error,
            "message": message,
        }
    });
    (status, axum::Json(body)).into_response()
}

fn session_not_created(message: &str) -> Response {
    webdriver_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        "session not created",
        message,
    )
}

/// `browserName` from W3C capabilities or legacy desiredCapabilities.
fn extract_browser_name(payload: &Value) -> Option<String> {
    let candidates = [
        &payload["capabilities"]["alwaysMatch"]["browserName"],
        &payload["capabilities"]["firstMatch"][0]["browserName"],
        &payload["desiredCapabilities"]["browserName"],
    ];
    candidates
        .iter()
        .find_map(|v| v.as_str())
        .map(|s| s.to_string())
}

/// Session id from a driver response, recursively unwrapped from
/// `{id|sessionId|value}`.
fn extract_session_id(value: &Value) -> Option<String> {
    let obj = value.as_object()?;
    for key in ["sessionId", "id"] {
        if let Some(sid) = obj.get(key).and_then(|v| v.as_str()) {
            return Some(sid.to_string());
        }
    }
    obj.get("value").and_then(extract_session_id)
}

/// A structured driver error: an `error` field and no session id.
fn driver_error_message(value: &Value) -> Option<String> {
    let body = if value.get("value").is_some() {
        &value["value"]
    } else {
        value
    };
    let error = body.get("error")?.as_str()?;
    let message = body.get("message").and_then(|m| m.as_str()).unwrap_or("");
    if message.is_empty() {
        Some(error.to_string())
    } else {
        Some(format!("{error}: {message}"))
    }
}

async fn create_session(State(state): State<ProxyState>, body: Bytes) -> Response {
    let shared = &state.inner;
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => return session_not_created(&format!("invalid session request payload: {e}")),
    };
    let Some(browser) = extract_browser_name(&payload) else {
        return session_not_created("could not determine browserName from capabilities");
    };

    let process = match shared.pool.acquire(&browser).await {
        Ok(process) => process,
        Err(e) => return session_not_created(&e.to_string()),
    };
    let upstream = format!("{}/session", process.url);

    // Retries stay pinned to the process acquired above: the retry absorbs
    // a driver whose listener lags its ready signal, not a broken spawn.
    let mut last_error = String::new();
    for attempt in 1..=shared.max_connect_attempts {
        let sent = shared
            .client
            .post(&upstream)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body.clone())
            .send()
            .await;
        let response = match sent {
            Ok(response) => response,
            Err(e) => {
                last_error = format!("could not connect to {browser} driver: {e}");
                debug!(
                    "Session creation attempt {}/{} failed: {}",
                    attempt, shared.max_connect_attempts, last_error
                );
                tokio::time::sleep(shared.retry_delay).await;
                continue;
            }
        };

        let status = status_of(&response);
        let response_body = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                last_error = format!("error reading {browser} driver response: {e}");
                tokio::time::sleep(shared.retry_delay).await;
                continue;
            }
        };
        let value: Value = serde_json::from_slice(&response_body).unwrap_or(Value::Null);

        if let Some(session_id) = extract_session_id(&value) {
            info!("Created session {} on {} driver", session_id, browser);
            shared.sessions.write().await.insert(
                session_id,
                SessionEntry {
                    process: process.clone(),
                    payload: value,
                },
            );
            return relay(status, &response_body);
        }

        if let Some(message) = driver_error_message(&value) {
            let failures = shared.pool.record_failure(&browser).await;
            last_error = format!("{browser} driver rejected session creation: {message}");
            debug!(
                "Attempt {}/{} rejected ({} recorded failures): {}",
                attempt, shared.max_connect_attempts, failures, last_error
            );
            tokio::time::sleep(shared.retry_delay).await;
            continue;
        }

        // Neither a session nor a structured error; pass through verbatim.
        return relay(status, &response_body);
    }

    warn!(
        "Session creation for {} exhausted {} attempts; stopping its driver",
        browser, shared.max_connect_attempts
    );
    if let Err(e) = shared.pool.stop_browser(&browser).await {
        warn!("Failed to stop {} driver: {}", browser, e);
    }
    session_not_created(&last_error)
}

async fn list_sessions(State(state): State<ProxyState>) -> Response {
    let sessions = state.inner.sessions.read().await;
    let entries: Vec<Value> = sessions
        .iter()
        .map(|(sid, entry)| {
            json!({
                "id": sid,
                "capabilities": entry.payload.get("value").cloned().unwrap_or(Value::Null),
            })
        })
        .collect();
    (StatusCode::OK, axum::Json(json!({ "value": entries }))).into_response()
}

/// The path segment following `session/`, if any.
fn session_id_from_path(rest: &str) -> Option<&str> {
    let mut segments = rest.split('/').filter(|s| !s.is_empty());
    while let Some(segment) = segments.next() {
        if segment == "session" {
            return segments.next();
        }
    }
    None
}

async fn forward_session_request(State(state): State<ProxyState>, req: Request) -> Response {
    let shared = &state.inner;
    let path = req.uri().path().to_string();
    let Some(rest) = path.strip_prefix(shared.prefix.as_str()) else {
        return webdriver_error(
            StatusCode::NOT_FOUND,
            "unknown command",
            &format!("path {path} is outside the hub prefix {}", shared.prefix),
        );
    };
    let Some(session_id) = session_id_from_path(rest) else {
        return webdriver_error(
            StatusCode::NOT_FOUND,
            "unknown command",
            &format!("no session id in path {path}"),
        );
    };
    let session_id = session_id.to_string();

    let Some(entry) = shared.sessions.read().await.get(&session_id).cloned() else {
        return webdriver_error(
            StatusCode::NOT_FOUND,
            "invalid session id",
            &format!("session {session_id} is not mapped to any driver"),
        );
    };

    // Session deletion drops the mapping; the driver process stays up for
    // reuse by later sessions of the same browser kind.
    if req.method() == Method::DELETE && rest.trim_end_matches('/') == format!("/session/{session_id}")
    {
        shared.sessions.write().await.remove(&session_id);
        debug!("Cleared session {}", session_id);
    }

    let mut upstream = format!("{}{}", entry.process.url, rest);
    if let Some(query) = req.uri().query() {
        upstream.push('?');
        upstream.push_str(query);
    }

    let method = req.method().clone();
    let headers = req.headers().clone();
    let body = match axum::body::to_bytes(req.into_body(), 16 * 1024 * 1024).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return webdriver_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "unknown error",
                &format!("failed to read request body: {e}"),
            );
        }
    };

    let mut builder = shared.client.request(method, &upstream);
    for (name, value) in forwardable_headers(&headers) {
        builder = builder.header(name, value);
    }
    if !body.is_empty() {
        builder = builder.body(body);
    }

    match builder.send().await {
        Ok(response) => {
            let status = status_of(&response);
            let response_headers = response.headers().clone();
            match response.bytes().await {
                Ok(bytes) => relay_with_headers(status, &response_headers, &bytes),
                Err(e) => webdriver_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "unknown error",
                    &format!("error reading driver response: {e}"),
                ),
            }
        }
        Err(e) => webdriver_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "unknown error",
            &format!("error forwarding to driver at {upstream}: {e}"),
        ),
    }
}

fn status_of(response: &reqwest::Response) -> StatusCode {
    StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

/// Hop-by-hop headers and lengths are recomputed, everything else passes.
fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name,
        "connection" | "keep-alive" | "transfer-encoding" | "content-length" | "host" | "upgrade"
    )
}

fn forwardable_headers(headers: &HeaderMap) -> Vec<(header::HeaderName, HeaderValue)> {
    headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

fn relay(status: StatusCode, body: &[u8]) -> Response {
    let mut response = Response::new(axum::body::Body::from(body.to_vec()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json; charset=utf-8"),
    );
    response
}

fn relay_with_headers(status: StatusCode, headers: &HeaderMap, body: &[u8]) -> Response {
    let mut response = Response::new(axum::body::Body::from(body.to_vec()));
    *response.status_mut() = status;
    for (name, value) in headers {
        if !is_hop_by_hop(name.as_str()) {
            response.headers_mut().insert(name.clone(), value.clone());
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn browser_name_from_w3c_always_match() {
        let payload = json!({
            "capabilities": { "alwaysMatch": { "browserName": "firefox" } }
        });
        assert_eq!(extract_browser_name(&payload).as_deref(), Some("firefox"));
    }

    #[test]
    fn browser_name_from_first_match() {
        let payload = json!({
            "capabilities": { "firstMatch": [{ "browserName": "edge" }] }
        });
        assert_eq!(extract_browser_name(&payload).as_deref(), Some("edge"));
    }

    #[test]
    fn browser_name_from_legacy_capabilities() {
        let payload = json!({ "desiredCapabilities": { "browserName": "chrome" } });
        assert_eq!(extract_browser_name(&payload).as_deref(), Some("chrome"));
    }

    #[test]
    fn browser_name_missing_yields_none() {
        assert_eq!(extract_browser_name(&json!({"capabilities": {}})), None);
    }

    #[test]
    fn session_id_unwraps_nested_value() {
        assert_eq!(
            extract_session_id(&json!({"sessionId": "abc"})).as_deref(),
            Some("abc")
        );
        assert_eq!(
            extract_session_id(&json!({"value": {"sessionId": "def"}})).as_deref(),
            Some("def")
        );
        assert_eq!(
            extract_session_id(&json!({"value": {"value": {"id": "ghi"}}})).as_deref(),
            Some("ghi")
        );
        assert_eq!(extract_session_id(&json!({"value": {"error": "x"}})), None);
    }

    #[test]
    fn driver_error_message_reads_nested_error() {
        let value = json!({"value": {"error": "session not created", "message": "boom"}});
        assert_eq!(
            driver_error_message(&value).as_deref(),
            Some("session not created: boom")
        );
        assert_eq!(driver_error_message(&json!({"value": {}})), None);
    }

    #[test]
    fn session_id_is_found_in_path() {
        assert_eq!(session_id_from_path("/session/abc123/url"), Some("abc123"));
        assert_eq!(session_id_from_path("/session/abc123"), Some("abc123"));
        assert_eq!(session_id_from_path("/status"), None);
    }
}
