//! Administrative HTTP API for the orchestrator.
//!
//! Consumed by a separate UI layer; JSON in/out, no HTML here.
//! Routes:
//!   GET    /healthz                              - always 200
//!   GET    /readyz                               - 200 when the store answers
//!   GET    /api/v1/connectors                    - list (?enabled=true)
//!   POST   /api/v1/connectors                    - create (encrypts api key)
//!   GET    /api/v1/connectors/{id}               - detail
//!   PUT    /api/v1/connectors/{id}               - partial update
//!   DELETE /api/v1/connectors/{id}               - cascade delete
//!   GET    /api/v1/connectors/{id}/statistics    - gaps/upgrades/queue depth
//!   POST   /api/v1/connectors/{id}/sync          - manual incremental (202)
//!   POST   /api/v1/connectors/{id}/reconcile     - manual reconcile (202)
//!   POST   /api/v1/connectors/{id}/queue/pause   - pause dispatch
//!   POST   /api/v1/connectors/{id}/queue/resume  - resume dispatch
//!   POST   /api/v1/connectors/{id}/queue/clear   - drop queued work + pause
//!   POST   /api/v1/connectors/{id}/searches/clear-failed - reset failed entries
//!   GET    /api/v1/profiles                      - throttle profiles
//!   POST   /api/v1/profiles                      - create
//!   PUT    /api/v1/profiles/{id}                 - update
//!   DELETE /api/v1/profiles/{id}                 - delete (409 while referenced)
//!   GET    /api/v1/content                       - mirror listing (paged)
//!   GET    /api/v1/searches                      - registry listing (paged)
//!   POST   /api/v1/searches/bulk                 - queue|priority|exhaust|clear
//!   GET    /api/v1/history                       - recent outcomes (paged)
//!
//! # Security
//! API keys are write-only: accepted in create/update bodies, never
//! echoed in any response or log line.

use std::sync::Arc;

use arr_api::models::Dialect;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::OrchestratorConfig;
use crate::discovery::{DiscoveryEngine, DiscoveryOptions};
use crate::outcome::OutcomeReconciler;
use crate::store::connectors::{Connector, ConnectorUpdate, Health, NewConnector};
use crate::store::content::ContentKind;
use crate::store::registry::SearchState;
use crate::store::throttles::NewThrottleProfile;
use crate::store::{Store, StoreError};
use crate::sync::{SyncEngine, SyncOptions};
use crate::vault::Vault;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub struct AppState {
    pub store: Arc<Mutex<Store>>,
    pub vault: Arc<Vault>,
    pub sync: Arc<SyncEngine>,
    pub discovery: Arc<DiscoveryEngine>,
    pub reconciler: Arc<OutcomeReconciler>,
    pub config: OrchestratorConfig,
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(serde_json::json!({ "error": self.1 }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match &e {
            StoreError::NotFound(_) => ApiError(StatusCode::NOT_FOUND, e.to_string()),
            StoreError::Conflict(_) => ApiError(StatusCode::CONFLICT, e.to_string()),
            StoreError::InvalidValue(_) => ApiError(StatusCode::BAD_REQUEST, e.to_string()),
            _ => {
                error!(error = %e, "store failure");
                ApiError(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal storage error".to_owned(),
                )
            }
        }
    }
}

fn bad_request(msg: impl Into<String>) -> ApiError {
    ApiError(StatusCode::BAD_REQUEST, msg.into())
}

type ApiResult<T> = Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Views (api key is never serialized)
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ConnectorView {
    id: i64,
    dialect: Dialect,
    name: String,
    base_url: String,
    enabled: bool,
    health: String,
    throttle_profile_id: Option<i64>,
    queue_paused: bool,
    created_at: String,
    updated_at: String,
    last_sync_at: Option<String>,
}

impl From<Connector> for ConnectorView {
    fn from(c: Connector) -> Self {
        ConnectorView {
            id: c.id,
            dialect: c.dialect,
            name: c.name,
            base_url: c.base_url,
            enabled: c.enabled,
            health: c.health.as_str().to_owned(),
            throttle_profile_id: c.throttle_profile_id,
            queue_paused: c.queue_paused,
            created_at: c.created_at,
            updated_at: c.updated_at,
            last_sync_at: c.last_sync_at,
        }
    }
}

#[derive(Debug, Serialize)]
struct RegistryView {
    id: i64,
    connector_id: i64,
    kind: String,
    content_id: i64,
    state: String,
    search_type: String,
    priority: i64,
    attempt_count: i64,
    failure_category: Option<String>,
    next_eligible_at: Option<String>,
    season_pack_failed: bool,
    last_searched_at: Option<String>,
    created_at: String,
}

// ---------------------------------------------------------------------------
// Router builder
// ---------------------------------------------------------------------------

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/api/v1/connectors", get(list_connectors).post(create_connector))
        .route(
            "/api/v1/connectors/{id}",
            get(get_connector).put(update_connector).delete(delete_connector),
        )
        .route("/api/v1/connectors/{id}/statistics", get(connector_statistics))
        .route("/api/v1/connectors/{id}/sync", post(trigger_sync))
        .route("/api/v1/connectors/{id}/reconcile", post(trigger_reconcile))
        .route("/api/v1/connectors/{id}/queue/pause", post(queue_pause))
        .route("/api/v1/connectors/{id}/queue/resume", post(queue_resume))
        .route("/api/v1/connectors/{id}/queue/clear", post(queue_clear))
        .route(
            "/api/v1/connectors/{id}/searches/clear-failed",
            post(clear_failed_searches),
        )
        .route("/api/v1/profiles", get(list_profiles).post(create_profile))
        .route(
            "/api/v1/profiles/{id}",
            axum::routing::put(update_profile).delete(delete_profile),
        )
        .route("/api/v1/content", get(list_content))
        .route("/api/v1/searches", get(list_searches))
        .route("/api/v1/searches/bulk", post(bulk_searches))
        .route("/api/v1/history", get(list_history))
        .with_state(state)
}

/// Bind and serve until the process exits.
pub async fn serve(state: Arc<AppState>, bind: &str) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(bind = %listener.local_addr()?, "admin API listening");
    axum::serve(listener, build_router(state)).await
}

// ---------------------------------------------------------------------------
// Health endpoints
// ---------------------------------------------------------------------------

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(state): State<Arc<AppState>>) -> Response {
    let store = state.store.lock().await;
    match store.list_connectors() {
        Ok(_) => (StatusCode::OK, "ready").into_response(),
        Err(e) => {
            error!(error = %e, "readiness probe failed");
            (StatusCode::SERVICE_UNAVAILABLE, "store unavailable").into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Connectors
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ListConnectorsQuery {
    enabled: Option<bool>,
}

async fn list_connectors(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListConnectorsQuery>,
) -> ApiResult<Json<Vec<ConnectorView>>> {
    let store = state.store.lock().await;
    let connectors = match query.enabled {
        Some(true) => store.list_enabled_connectors()?,
        _ => store.list_connectors()?,
    };
    Ok(Json(connectors.into_iter().map(ConnectorView::from).collect()))
}

#[derive(Debug, Deserialize)]
struct CreateConnectorBody {
    dialect: Dialect,
    name: String,
    base_url: String,
    api_key: String,
    #[serde(default = "default_true")]
    enabled: bool,
    throttle_profile_id: Option<i64>,
}

fn default_true() -> bool {
    true
}

async fn create_connector(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateConnectorBody>,
) -> ApiResult<(StatusCode, Json<ConnectorView>)> {
    if body.api_key.trim().is_empty() {
        return Err(bad_request("api_key must not be empty"));
    }
    let api_key_enc = state
        .vault
        .encrypt(&body.api_key)
        .map_err(|e| bad_request(format!("api key encryption failed: {e}")))?;
    let mut store = state.store.lock().await;
    let connector = store.create_connector(
        &NewConnector {
            dialect: body.dialect,
            name: body.name,
            base_url: body.base_url,
            api_key_enc,
            enabled: body.enabled,
            throttle_profile_id: body.throttle_profile_id,
        },
        Utc::now(),
    )?;
    info!(connector = %connector.name, dialect = %connector.dialect, "connector created");
    Ok((StatusCode::CREATED, Json(connector.into())))
}

async fn get_connector(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<ConnectorView>> {
    let store = state.store.lock().await;
    Ok(Json(store.connector(id)?.into()))
}

#[derive(Debug, Deserialize)]
struct UpdateConnectorBody {
    name: Option<String>,
    base_url: Option<String>,
    api_key: Option<String>,
    enabled: Option<bool>,
    health: Option<String>,
    #[serde(default, with = "double_option")]
    throttle_profile_id: Option<Option<i64>>,
}

/// Distinguishes an absent field from an explicit null for the profile
/// reference (null detaches the profile; absent leaves it unchanged).
mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(de: D) -> Result<Option<Option<i64>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<i64>::deserialize(de).map(Some)
    }
}

async fn update_connector(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<UpdateConnectorBody>,
) -> ApiResult<Json<ConnectorView>> {
    let api_key_enc = match &body.api_key {
        Some(key) if !key.trim().is_empty() => Some(
            state
                .vault
                .encrypt(key)
                .map_err(|e| bad_request(format!("api key encryption failed: {e}")))?,
        ),
        Some(_) => return Err(bad_request("api_key must not be empty")),
        None => None,
    };

    let mut store = state.store.lock().await;
    let connector = store.update_connector(
        id,
        &ConnectorUpdate {
            name: body.name.clone(),
            base_url: body.base_url.clone(),
            api_key_enc,
            enabled: body.enabled,
            throttle_profile_id: body.throttle_profile_id,
        },
        Utc::now(),
    )?;
    if let Some(health_str) = &body.health {
        let health = Health::parse(health_str)
            .ok_or_else(|| bad_request(format!("unknown health state '{health_str}'")))?;
        store.update_connector_health(id, health, Utc::now())?;
    }
    let connector = if body.health.is_some() {
        store.connector(connector.id)?
    } else {
        connector
    };
    Ok(Json(connector.into()))
}

async fn delete_connector(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    let mut store = state.store.lock().await;
    store.delete_connector(id)?;
    info!(connector = id, "connector deleted");
    Ok(StatusCode::NO_CONTENT)
}

async fn connector_statistics(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    let store = state.store.lock().await;
    store.connector(id)?;
    let stats = store.connector_statistics(id)?;
    Ok(Json(serde_json::json!({
        "gaps": stats.gaps,
        "upgrade_candidates": stats.upgrade_candidates,
        "queue_depth": stats.queue_depth,
    })))
}

// ---------------------------------------------------------------------------
// Manual sweeps (202: work happens in a spawned task)
// ---------------------------------------------------------------------------

async fn trigger_sync(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    run_manual_sweep(state, id, false).await
}

async fn trigger_reconcile(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    run_manual_sweep(state, id, true).await
}

async fn run_manual_sweep(
    state: Arc<AppState>,
    connector_id: i64,
    reconcile: bool,
) -> ApiResult<StatusCode> {
    {
        let store = state.store.lock().await;
        store.connector(connector_id)?;
    }
    let opts = SyncOptions {
        concurrency: state.config.sync.concurrency,
        request_delay_ms: state.config.sync.request_delay_ms,
        skip_retry: false,
    };
    let discovery_opts = DiscoveryOptions {
        batch_size: state.config.discovery.batch_size,
    };
    tokio::spawn(async move {
        let outcome = if reconcile {
            state.sync.run_reconcile(connector_id, &opts).await
        } else {
            state.sync.run_incremental(connector_id, &opts).await
        };
        if let Err(e) = state.reconciler.reconcile_acquisitions(&outcome.acquired).await {
            warn!(connector = connector_id, error = %e, "manual sweep reconcile failed");
        }
        if outcome.error.is_none() {
            let _ = state.discovery.run_discover_gaps(connector_id, discovery_opts).await;
            let _ = state
                .discovery
                .run_discover_upgrades(connector_id, discovery_opts)
                .await;
        }
    });
    Ok(StatusCode::ACCEPTED)
}

// ---------------------------------------------------------------------------
// Queue control
// ---------------------------------------------------------------------------

async fn queue_pause(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    let mut store = state.store.lock().await;
    store.set_queue_paused(id, true, Utc::now())?;
    Ok(StatusCode::NO_CONTENT)
}

async fn queue_resume(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    let mut store = state.store.lock().await;
    store.set_queue_paused(id, false, Utc::now())?;
    store.clear_throttle_pause(id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn queue_clear(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    let mut store = state.store.lock().await;
    store.connector(id)?;
    let removed = store.clear_connector_queue(id)?;
    store.clear_throttle_pause(id)?;
    info!(connector = id, removed, "queue cleared");
    Ok(Json(serde_json::json!({ "removed": removed })))
}

async fn clear_failed_searches(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    let mut store = state.store.lock().await;
    store.connector(id)?;
    let cleared = store.clear_failed(id, Utc::now())?;
    Ok(Json(serde_json::json!({ "cleared": cleared })))
}

// ---------------------------------------------------------------------------
// Throttle profiles
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ProfileBody {
    name: String,
    requests_per_minute: u32,
    daily_budget: Option<u32>,
    batch_size: u32,
    batch_cooldown_secs: u32,
    rate_limit_pause_secs: u32,
    #[serde(default)]
    is_default: bool,
}

impl ProfileBody {
    fn into_new(self) -> NewThrottleProfile {
        NewThrottleProfile {
            name: self.name,
            requests_per_minute: self.requests_per_minute,
            daily_budget: self.daily_budget,
            batch_size: self.batch_size,
            batch_cooldown_secs: self.batch_cooldown_secs,
            rate_limit_pause_secs: self.rate_limit_pause_secs,
            is_default: self.is_default,
        }
    }
}

async fn list_profiles(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<serde_json::Value>> {
    let store = state.store.lock().await;
    let profiles = store.list_throttle_profiles()?;
    Ok(Json(serde_json::json!(profiles)))
}

async fn create_profile(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ProfileBody>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let mut store = state.store.lock().await;
    let profile = store.create_throttle_profile(&body.into_new())?;
    Ok((StatusCode::CREATED, Json(serde_json::json!(profile))))
}

async fn update_profile(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<ProfileBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let mut store = state.store.lock().await;
    let profile = store.update_throttle_profile(id, &body.into_new())?;
    Ok(Json(serde_json::json!(profile)))
}

async fn delete_profile(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    let mut store = state.store.lock().await;
    store.delete_throttle_profile(id)?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Content and registry listings
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PageQuery {
    connector_id: Option<i64>,
    kind: Option<String>,
    state: Option<String>,
    #[serde(default)]
    page: u32,
    per_page: Option<u32>,
}

impl PageQuery {
    fn limits(&self) -> (i64, i64) {
        let per_page = i64::from(self.per_page.unwrap_or(100).clamp(1, 1000));
        let offset = i64::from(self.page) * per_page;
        (offset, per_page)
    }
}

async fn list_content(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let kind = match query.kind.as_deref() {
        None => None,
        Some(s) => Some(
            ContentKind::parse(s).ok_or_else(|| bad_request(format!("unknown kind '{s}'")))?,
        ),
    };
    let (offset, limit) = query.limits();
    let store = state.store.lock().await;
    let items = store.list_content(query.connector_id, kind, offset, limit)?;
    Ok(Json(serde_json::json!({ "items": items, "page": query.page })))
}

async fn list_searches(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let search_state = match query.state.as_deref() {
        None => None,
        Some(s) => Some(
            SearchState::parse(s).ok_or_else(|| bad_request(format!("unknown state '{s}'")))?,
        ),
    };
    let (offset, limit) = query.limits();
    let store = state.store.lock().await;
    let rows = store.list_registry(query.connector_id, search_state, offset, limit)?;
    let views: Vec<RegistryView> = rows
        .into_iter()
        .map(|r| RegistryView {
            id: r.id,
            connector_id: r.connector_id,
            kind: r.kind.as_str().to_owned(),
            content_id: r.content_id,
            state: r.state.as_str().to_owned(),
            search_type: r.search_type.as_str().to_owned(),
            priority: r.priority,
            attempt_count: r.attempt_count,
            failure_category: r.failure_category,
            next_eligible_at: r.next_eligible_at,
            season_pack_failed: r.season_pack_failed,
            last_searched_at: r.last_searched_at,
            created_at: r.created_at,
        })
        .collect();
    Ok(Json(serde_json::json!({ "items": views, "page": query.page })))
}

// ---------------------------------------------------------------------------
// Bulk registry operations
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum BulkAction {
    Queue,
    Priority,
    Exhaust,
    Clear,
}

#[derive(Debug, Deserialize)]
struct BulkBody {
    action: BulkAction,
    ids: Vec<i64>,
    priority: Option<i64>,
}

async fn bulk_searches(
    State(state): State<Arc<AppState>>,
    Json(body): Json<BulkBody>,
) -> ApiResult<Json<serde_json::Value>> {
    if body.ids.is_empty() {
        return Err(bad_request("ids must not be empty"));
    }
    let now = Utc::now();
    let mut store = state.store.lock().await;
    let result = match body.action {
        BulkAction::Queue => store.bulk_queue_now(&body.ids, now)?,
        BulkAction::Priority => {
            let priority = body
                .priority
                .ok_or_else(|| bad_request("priority is required for action=priority"))?;
            if !(0..=100).contains(&priority) {
                return Err(bad_request("priority must be within 0..=100"));
            }
            store.bulk_set_priority(&body.ids, priority, now)?
        }
        BulkAction::Exhaust => store.bulk_exhaust(&body.ids, now)?,
        BulkAction::Clear => store.bulk_clear(&body.ids)?,
    };
    Ok(Json(serde_json::json!(result)))
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

async fn list_history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let (offset, limit) = query.limits();
    let store = state.store.lock().await;
    let rows = store.list_history(query.connector_id, offset, limit)?;
    Ok(Json(serde_json::json!({ "items": rows, "page": query.page })))
}
