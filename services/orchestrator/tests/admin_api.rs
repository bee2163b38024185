// Admin API surface: connector CRUD over HTTP, secret hygiene, profile
// validation, and bulk operation plumbing.

mod common;

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, watch};

use orchestrator::admin::{AppState, build_router};
use orchestrator::clients::HttpClientFactory;
use orchestrator::config;
use orchestrator::discovery::DiscoveryEngine;
use orchestrator::outcome::OutcomeReconciler;
use orchestrator::store::Store;
use orchestrator::sync::SyncEngine;
use orchestrator::vault::Vault;

async fn serve_app() -> (String, Arc<Mutex<Store>>) {
    // A minimal config: only the sections the handlers read.
    let dir = tempfile::tempdir().unwrap();
    let key_path = dir.path().join("secret.key");
    std::fs::write(&key_path, "9a".repeat(32)).unwrap();
    let toml_str = format!(
        "schema_version = 1\n[vault]\nsecret_key_file = \"{}\"\n",
        key_path.display()
    );
    let cfg = config::load_config_from_str(&toml_str).unwrap();

    let vault = Arc::new(Vault::from_hex_key(&cfg.secret_key_hex).unwrap());
    let store = Arc::new(Mutex::new(Store::open_in_memory().unwrap()));
    {
        let mut guard = store.lock().await;
        guard.ensure_default_profile().unwrap();
    }

    let (_tx, shutdown_rx) = watch::channel(false);
    let clients = Arc::new(HttpClientFactory::new(vault.clone()));
    let sync = Arc::new(SyncEngine::new(
        store.clone(),
        clients,
        cfg.sync.clone(),
        shutdown_rx,
    ));
    let state = Arc::new(AppState {
        store: store.clone(),
        vault,
        sync,
        discovery: Arc::new(DiscoveryEngine::new(store.clone())),
        reconciler: Arc::new(OutcomeReconciler::new(store.clone(), cfg.dispatch.clone())),
        config: cfg,
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, build_router(state)).await;
    });
    (format!("http://{addr}"), store)
}

#[tokio::test]
async fn connector_crud_round_trip_never_echoes_the_api_key() {
    let (base, _store) = serve_app().await;
    let http = reqwest::Client::new();

    let created: serde_json::Value = http
        .post(format!("{base}/api/v1/connectors"))
        .json(&serde_json::json!({
            "dialect": "movie-radarr",
            "name": "radarr-main",
            "base_url": "https://r.lan/",
            "api_key": "super-secret"
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(created["name"], "radarr-main");
    assert_eq!(created["base_url"], "https://r.lan");
    assert_eq!(created["health"], "unknown");
    let body_text = created.to_string();
    assert!(!body_text.contains("super-secret"), "api key leaked: {body_text}");

    let id = created["id"].as_i64().unwrap();
    let fetched: serde_json::Value = http
        .get(format!("{base}/api/v1/connectors/{id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(fetched["id"], id);
    assert!(!fetched.to_string().contains("super-secret"));

    // Duplicate name conflicts.
    let dup = http
        .post(format!("{base}/api/v1/connectors"))
        .json(&serde_json::json!({
            "dialect": "movie-radarr",
            "name": "radarr-main",
            "base_url": "https://other.lan",
            "api_key": "k"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(dup.status().as_u16(), 409);

    // Update flips enabled; delete removes.
    let updated: serde_json::Value = http
        .put(format!("{base}/api/v1/connectors/{id}"))
        .json(&serde_json::json!({ "enabled": false }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(updated["enabled"], false);

    let deleted = http
        .delete(format!("{base}/api/v1/connectors/{id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status().as_u16(), 204);

    let missing = http
        .get(format!("{base}/api/v1/connectors/{id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status().as_u16(), 404);
}

#[tokio::test]
async fn profile_validation_maps_to_400_and_referenced_delete_to_409() {
    let (base, _store) = serve_app().await;
    let http = reqwest::Client::new();

    let bad = http
        .post(format!("{base}/api/v1/profiles"))
        .json(&serde_json::json!({
            "name": "too-fast",
            "requests_per_minute": 61,
            "batch_size": 10,
            "batch_cooldown_secs": 60,
            "rate_limit_pause_secs": 600
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(bad.status().as_u16(), 400);

    let profile: serde_json::Value = http
        .post(format!("{base}/api/v1/profiles"))
        .json(&serde_json::json!({
            "name": "steady",
            "requests_per_minute": 10,
            "batch_size": 10,
            "batch_cooldown_secs": 60,
            "rate_limit_pause_secs": 600
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let profile_id = profile["id"].as_i64().unwrap();

    let connector: serde_json::Value = http
        .post(format!("{base}/api/v1/connectors"))
        .json(&serde_json::json!({
            "dialect": "tv-sonarr",
            "name": "tv",
            "base_url": "http://tv.lan",
            "api_key": "k",
            "throttle_profile_id": profile_id
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(connector["throttle_profile_id"], profile_id);

    let refused = http
        .delete(format!("{base}/api/v1/profiles/{profile_id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(refused.status().as_u16(), 409);
}

#[tokio::test]
async fn queue_pause_resume_and_statistics() {
    let (base, store) = serve_app().await;
    let http = reqwest::Client::new();

    let created: serde_json::Value = http
        .post(format!("{base}/api/v1/connectors"))
        .json(&serde_json::json!({
            "dialect": "movie-radarr",
            "name": "radarr",
            "base_url": "http://r.lan",
            "api_key": "k"
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = created["id"].as_i64().unwrap();

    {
        let mut guard = store.lock().await;
        guard
            .upsert_movies(
                id,
                &[common::movie(1, true, false, false), common::movie(2, true, true, true)],
                Utc::now(),
            )
            .unwrap();
    }

    let stats: serde_json::Value = http
        .get(format!("{base}/api/v1/connectors/{id}/statistics"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["gaps"], 1);
    assert_eq!(stats["upgrade_candidates"], 1);
    assert_eq!(stats["queue_depth"], 0);

    let paused = http
        .post(format!("{base}/api/v1/connectors/{id}/queue/pause"))
        .send()
        .await
        .unwrap();
    assert_eq!(paused.status().as_u16(), 204);
    {
        let guard = store.lock().await;
        assert!(guard.connector(id).unwrap().queue_paused);
    }

    let resumed = http
        .post(format!("{base}/api/v1/connectors/{id}/queue/resume"))
        .send()
        .await
        .unwrap();
    assert_eq!(resumed.status().as_u16(), 204);
    {
        let guard = store.lock().await;
        assert!(!guard.connector(id).unwrap().queue_paused);
    }
}

#[tokio::test]
async fn bulk_requires_ids_and_priority_bounds() {
    let (base, _store) = serve_app().await;
    let http = reqwest::Client::new();

    let empty = http
        .post(format!("{base}/api/v1/searches/bulk"))
        .json(&serde_json::json!({ "action": "exhaust", "ids": [] }))
        .send()
        .await
        .unwrap();
    assert_eq!(empty.status().as_u16(), 400);

    let out_of_range = http
        .post(format!("{base}/api/v1/searches/bulk"))
        .json(&serde_json::json!({ "action": "priority", "ids": [1], "priority": 101 }))
        .send()
        .await
        .unwrap();
    assert_eq!(out_of_range.status().as_u16(), 400);

    let ok: serde_json::Value = http
        .post(format!("{base}/api/v1/searches/bulk"))
        .json(&serde_json::json!({ "action": "clear", "ids": [12345] }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    // Unknown ids delete nothing.
    assert_eq!(ok["affected"], 0);
}

#[tokio::test]
async fn health_endpoints_answer() {
    let (base, _store) = serve_app().await;
    let http = reqwest::Client::new();
    assert_eq!(
        http.get(format!("{base}/healthz")).send().await.unwrap().status().as_u16(),
        200
    );
    assert_eq!(
        http.get(format!("{base}/readyz")).send().await.unwrap().status().as_u16(),
        200
    );
}
