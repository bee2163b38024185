// mock_upstream: A mock media-automation upstream for testing sync/dispatch.
//
// Serves the /api/v3 surface the orchestrator consumes, validates the
// X-Api-Key header, and records posted search commands so tests can
// assert on dispatch behavior.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use arr_api::models::{EpisodeResource, MovieResource, SeriesResource};
use axum::Router;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use tokio::net::TcpListener;

/// A mock upstream instance for integration testing.
///
/// Binds to port 0 (random) and exposes the bound address. Each test can
/// spin up its own isolated instance and seed it with library state.
///
/// # Behavior
///
/// - Every `/api/v3/*` route checks `X-Api-Key` against the configured
///   key and returns `401` on mismatch.
/// - `set_fail_status(Some(code))` makes every route return that status,
///   for scripting auth/server/rate-limit failures.
/// - `POST /api/v3/command` records the body and returns `201` with a
///   fresh upstream command id.
pub struct MockUpstream {
    addr: SocketAddr,
    state: Arc<MockState>,
    /// Handle to the background serve loop; dropped when the mock is dropped.
    _task: tokio::task::JoinHandle<()>,
}

struct MockState {
    api_key: String,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    series: Vec<SeriesResource>,
    episodes: HashMap<i64, Vec<EpisodeResource>>,
    movies: Vec<MovieResource>,
    fail_status: Option<u16>,
    commands: Vec<serde_json::Value>,
    next_command_id: i64,
}

impl MockUpstream {
    /// Start the mock upstream, binding to a random available port.
    pub async fn start(api_key: &str) -> Self {
        let state = Arc::new(MockState {
            api_key: api_key.to_owned(),
            inner: Mutex::new(Inner {
                next_command_id: 1000,
                ..Inner::default()
            }),
        });

        let router = Router::new()
            .route("/api/v3/system/status", get(system_status))
            .route("/api/v3/series", get(list_series))
            .route("/api/v3/episode", get(list_episodes))
            .route("/api/v3/movie", get(list_movies))
            .route("/api/v3/command", post(post_command))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock upstream");
        let addr = listener.local_addr().expect("local addr");

        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        MockUpstream {
            addr,
            state,
            _task: task,
        }
    }

    /// Base URL of the mock, e.g. `http://127.0.0.1:49152`.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    // -----------------------------------------------------------------------
    // Seeding and scripting
    // -----------------------------------------------------------------------

    pub fn seed_series(&self, series: Vec<SeriesResource>) {
        self.state.inner.lock().unwrap().series = series;
    }

    pub fn seed_episodes(&self, series_id: i64, episodes: Vec<EpisodeResource>) {
        self.state
            .inner
            .lock()
            .unwrap()
            .episodes
            .insert(series_id, episodes);
    }

    pub fn seed_movies(&self, movies: Vec<MovieResource>) {
        self.state.inner.lock().unwrap().movies = movies;
    }

    /// Force every route to return `code` (e.g. 401, 429, 503); `None`
    /// restores normal behavior.
    pub fn set_fail_status(&self, code: Option<u16>) {
        self.state.inner.lock().unwrap().fail_status = code;
    }

    /// All command bodies posted so far, oldest first.
    pub fn commands(&self) -> Vec<serde_json::Value> {
        self.state.inner.lock().unwrap().commands.clone()
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

fn gate(state: &MockState, headers: &HeaderMap) -> Result<(), Response> {
    let inner = state.inner.lock().unwrap();
    if let Some(code) = inner.fail_status {
        let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return Err((status, "scripted failure").into_response());
    }
    drop(inner);
    let presented = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if presented != state.api_key {
        return Err((StatusCode::UNAUTHORIZED, "invalid api key").into_response());
    }
    Ok(())
}

async fn system_status(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = gate(&state, &headers) {
        return resp;
    }
    axum::Json(serde_json::json!({ "version": "4.0.0.0" })).into_response()
}

async fn list_series(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = gate(&state, &headers) {
        return resp;
    }
    let series = state.inner.lock().unwrap().series.clone();
    axum::Json(series).into_response()
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct EpisodeQuery {
    series_id: i64,
}

async fn list_episodes(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Query(query): Query<EpisodeQuery>,
) -> Response {
    if let Err(resp) = gate(&state, &headers) {
        return resp;
    }
    let episodes = state
        .inner
        .lock()
        .unwrap()
        .episodes
        .get(&query.series_id)
        .cloned()
        .unwrap_or_default();
    axum::Json(episodes).into_response()
}

async fn list_movies(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = gate(&state, &headers) {
        return resp;
    }
    let movies = state.inner.lock().unwrap().movies.clone();
    axum::Json(movies).into_response()
}

async fn post_command(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    axum::Json(body): axum::Json<serde_json::Value>,
) -> Response {
    if let Err(resp) = gate(&state, &headers) {
        return resp;
    }
    let mut inner = state.inner.lock().unwrap();
    let id = inner.next_command_id;
    inner.next_command_id += 1;
    let name = body["name"].as_str().unwrap_or_default().to_owned();
    inner.commands.push(body);
    (
        StatusCode::CREATED,
        axum::Json(serde_json::json!({ "id": id, "name": name, "status": "queued" })),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Raw loopback HTTP helpers (assertion-side; no client dependency)
// ---------------------------------------------------------------------------

/// Minimal HTTP/1.1 GET against a mock URL; returns (status, JSON body).
pub async fn raw_get(url: &str, api_key: &str) -> (u16, serde_json::Value) {
    raw_request("GET", url, api_key, None).await
}

/// Minimal HTTP/1.1 POST against a mock URL; returns (status, JSON body).
pub async fn raw_post(url: &str, api_key: &str, body: serde_json::Value) -> (u16, serde_json::Value) {
    raw_request("POST", url, api_key, Some(body)).await
}

async fn raw_request(
    method: &str,
    url: &str,
    api_key: &str,
    body: Option<serde_json::Value>,
) -> (u16, serde_json::Value) {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let rest = url.strip_prefix("http://").expect("http url");
    let (host, path) = rest.split_once('/').map_or((rest, ""), |(h, p)| (h, p));
    let path = format!("/{path}");

    let mut stream = tokio::net::TcpStream::connect(host).await.expect("connect");
    let payload = body.map(|b| b.to_string()).unwrap_or_default();
    let request = format!(
        "{method} {path} HTTP/1.1\r\nHost: {host}\r\nX-Api-Key: {api_key}\r\n\
         Content-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{payload}",
        payload.len(),
    );
    stream.write_all(request.as_bytes()).await.expect("write");

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.expect("read");
    let text = String::from_utf8_lossy(&raw);

    let status: u16 = text
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("status line");
    let body_text = text
        .split_once("\r\n\r\n")
        .map(|(_, b)| b)
        .unwrap_or_default();
    let json = serde_json::from_str(body_text).unwrap_or(serde_json::Value::Null);
    (status, json)
}
