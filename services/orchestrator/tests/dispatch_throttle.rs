// Dispatcher drain behavior under throttle limits, rejection handling,
// and the season-pack fallback.

mod common;

use std::sync::Arc;

use arr_api::models::{Dialect, EpisodeResource, SeasonResource, SeriesResource};
use arr_api::{SearchCommand, UpstreamError};
use chrono::Utc;
use orchestrator::config::DispatchConfig;
use orchestrator::discovery::{DiscoveryEngine, DiscoveryOptions};
use orchestrator::dispatch::Dispatcher;
use orchestrator::store::connectors::{Health, NewConnector};
use orchestrator::store::registry::SearchState;
use orchestrator::store;

use common::{ScriptedClient, ScriptedFactory};

async fn discover_gaps(store: &Arc<tokio::sync::Mutex<store::Store>>, connector_id: i64) {
    DiscoveryEngine::new(store.clone())
        .run_discover_gaps(connector_id, DiscoveryOptions::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn burst_beyond_rpm_dispatches_exactly_the_budget_and_parks_the_rest() {
    let store = common::test_store();
    let connector = common::movie_connector_with_rpm(&store, "radarr", 5).await;
    common::seed_gap_movies(&store, connector.id, 10).await;
    discover_gaps(&store, connector.id).await;

    let client = ScriptedClient::new();
    let dispatcher = Dispatcher::new(
        store.clone(),
        Arc::new(ScriptedFactory(client.clone())),
        common::dispatch_config(),
    );

    let stats = dispatcher.drain_connector(connector.id).await.unwrap();
    assert_eq!(stats.dispatched, 5);
    assert_eq!(stats.deferred, 5);

    let guard = store.lock().await;
    let searching = guard
        .count_registry_by_state(connector.id, SearchState::Searching)
        .unwrap();
    let pending = guard
        .count_registry_by_state(connector.id, SearchState::Pending)
        .unwrap();
    assert_eq!(searching, 5);
    assert_eq!(pending, 5);

    // Every parked entry carries a schedule at (or past) the window roll.
    let now_ts = store::fmt_ts(Utc::now());
    for row in guard.list_registry(Some(connector.id), Some(SearchState::Pending), 0, 10).unwrap() {
        let scheduled = row.scheduled_at.expect("parked entries carry scheduled_at");
        assert!(scheduled > now_ts, "{scheduled} should be in the future");
    }

    // Counter state reflects the budget spend.
    let state = guard.throttle_state(connector.id).unwrap();
    assert_eq!(state.requests_this_minute, 5);
    assert_eq!(client.commands().len(), 5);
    drop(guard);

    // A second drain inside the same window dispatches nothing.
    let stats = dispatcher.drain_connector(connector.id).await.unwrap();
    assert_eq!(stats.dispatched, 0);
    assert_eq!(stats.deferred, 0);
}

#[tokio::test]
async fn searching_entries_have_queue_rows_and_pending_commands() {
    let store = common::test_store();
    let connector = common::movie_connector_with_rpm(&store, "radarr", 10).await;
    common::seed_gap_movies(&store, connector.id, 2).await;
    discover_gaps(&store, connector.id).await;

    let client = ScriptedClient::new();
    let dispatcher = Dispatcher::new(
        store.clone(),
        Arc::new(ScriptedFactory(client.clone())),
        common::dispatch_config(),
    );
    let stats = dispatcher.drain_connector(connector.id).await.unwrap();
    assert_eq!(stats.dispatched, 2);

    let guard = store.lock().await;
    for row in guard.list_registry(Some(connector.id), None, 0, 10).unwrap() {
        assert_eq!(row.state, SearchState::Searching);
        assert!(guard.has_queue_row(row.id).unwrap());
        assert!(
            guard
                .oldest_searching_command(row.kind, row.content_id)
                .unwrap()
                .is_some()
        );
    }
}

#[tokio::test]
async fn rate_limited_rejection_pauses_the_connector() {
    let store = common::test_store();
    let connector = common::movie_connector_with_rpm(&store, "radarr", 10).await;
    common::seed_gap_movies(&store, connector.id, 2).await;
    discover_gaps(&store, connector.id).await;

    let client = ScriptedClient::new();
    client.set_fail(Some(UpstreamError::RateLimited("429".to_owned())));
    let dispatcher = Dispatcher::new(
        store.clone(),
        Arc::new(ScriptedFactory(client.clone())),
        common::dispatch_config(),
    );
    dispatcher.drain_connector(connector.id).await.unwrap();

    let guard = store.lock().await;
    let state = guard.throttle_state(connector.id).unwrap();
    assert!(state.paused_until.is_some());
    assert_eq!(state.pause_reason.as_deref(), Some("rate-limited"));

    let cooled = guard
        .count_registry_by_state(connector.id, SearchState::Cooldown)
        .unwrap();
    assert!(cooled >= 1, "rate-limited entry moves to cooldown");
}

#[tokio::test]
async fn non_retryable_rejection_exhausts_with_history() {
    let store = common::test_store();
    let connector = common::movie_connector_with_rpm(&store, "radarr", 10).await;
    common::seed_gap_movies(&store, connector.id, 1).await;
    discover_gaps(&store, connector.id).await;

    let client = ScriptedClient::new();
    client.set_fail(Some(UpstreamError::Validation("bad id".to_owned())));
    let dispatcher = Dispatcher::new(
        store.clone(),
        Arc::new(ScriptedFactory(client.clone())),
        common::dispatch_config(),
    );
    let stats = dispatcher.drain_connector(connector.id).await.unwrap();
    assert_eq!(stats.exhausted, 1);

    let guard = store.lock().await;
    let rows = guard.list_registry(Some(connector.id), None, 0, 10).unwrap();
    assert_eq!(rows[0].state, SearchState::Exhausted);
    assert_eq!(rows[0].failure_category.as_deref(), Some("validation"));
    assert!(rows[0].next_eligible_at.is_none());

    let history = guard.list_history(Some(connector.id), 0, 10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].outcome, "failed");
}

#[tokio::test]
async fn attempt_ceiling_exhausts_retryable_failures() {
    let store = common::test_store();
    let connector = common::movie_connector_with_rpm(&store, "radarr", 10).await;
    common::seed_gap_movies(&store, connector.id, 1).await;
    discover_gaps(&store, connector.id).await;

    let client = ScriptedClient::new();
    client.set_fail(Some(UpstreamError::Server("500".to_owned())));
    let dispatcher = Dispatcher::new(
        store.clone(),
        Arc::new(ScriptedFactory(client.clone())),
        DispatchConfig {
            attempt_ceiling: 2,
            ..common::dispatch_config()
        },
    );

    // First attempt: retryable, cools down.
    let stats = dispatcher.drain_connector(connector.id).await.unwrap();
    assert_eq!(stats.cooled, 1);
    let entry_id = {
        let mut guard = store.lock().await;
        let rows = guard.list_registry(Some(connector.id), None, 0, 10).unwrap();
        assert_eq!(rows[0].state, SearchState::Cooldown);
        assert_eq!(rows[0].attempt_count, 1);
        // Operator forces it back into the queue early.
        guard.bulk_queue_now(&[rows[0].id], Utc::now()).unwrap();
        rows[0].id
    };

    // Second attempt hits the ceiling and turns terminal.
    let stats = dispatcher.drain_connector(connector.id).await.unwrap();
    assert_eq!(stats.exhausted, 1);
    let guard = store.lock().await;
    let row = guard.registry_row(entry_id).unwrap().unwrap();
    assert_eq!(row.state, SearchState::Exhausted);
    let history = guard.list_history(Some(connector.id), 0, 10).unwrap();
    assert_eq!(history[0].outcome, "exhausted");
}

#[tokio::test]
async fn season_pack_failure_falls_back_to_episode_search() {
    let store = common::test_store();
    let connector = {
        let mut guard = store.lock().await;
        let c = guard
            .create_connector(
                &NewConnector {
                    dialect: Dialect::TvSonarr,
                    name: "sonarr".to_owned(),
                    base_url: "http://tv.lan".to_owned(),
                    api_key_enc: vec![1],
                    enabled: true,
                    throttle_profile_id: None,
                },
                Utc::now(),
            )
            .unwrap();
        guard.ensure_default_profile().unwrap();
        guard.update_connector_health(c.id, Health::Healthy, Utc::now()).unwrap();
        let series_id = guard
            .upsert_series(
                c.id,
                &SeriesResource {
                    id: 4,
                    title: "Show".to_owned(),
                    monitored: true,
                    seasons: vec![SeasonResource { season_number: 1, monitored: true }],
                },
            )
            .unwrap();
        guard
            .upsert_episodes(
                c.id,
                series_id,
                &[EpisodeResource {
                    id: 41,
                    series_id: 4,
                    season_number: 1,
                    title: "e1".to_owned(),
                    monitored: true,
                    has_file: false,
                    quality_cutoff_not_met: false,
                    episode_file: None,
                }],
                Utc::now(),
            )
            .unwrap();
        guard.connector(c.id).unwrap()
    };
    discover_gaps(&store, connector.id).await;

    let client = ScriptedClient::new();
    client.set_fail(Some(UpstreamError::Server("500".to_owned())));
    let dispatcher = Dispatcher::new(
        store.clone(),
        Arc::new(ScriptedFactory(client.clone())),
        common::dispatch_config(),
    );

    // Season pack attempt fails; the flag flips.
    dispatcher.drain_connector(connector.id).await.unwrap();
    {
        let mut guard = store.lock().await;
        let rows = guard.list_registry(Some(connector.id), None, 0, 10).unwrap();
        assert!(rows[0].season_pack_failed);
        guard.bulk_queue_now(&[rows[0].id], Utc::now()).unwrap();
    }

    // Next attempt goes per-episode.
    client.set_fail(None);
    dispatcher.drain_connector(connector.id).await.unwrap();
    let commands = client.commands();
    assert_eq!(commands.len(), 1, "only the successful dispatch is recorded");
    assert_eq!(commands[0], SearchCommand::EpisodeSearch { episode_ids: vec![41] });
}

#[tokio::test]
async fn paused_queue_defers_everything() {
    let store = common::test_store();
    let connector = common::movie_connector_with_rpm(&store, "radarr", 10).await;
    common::seed_gap_movies(&store, connector.id, 3).await;
    discover_gaps(&store, connector.id).await;
    {
        let mut guard = store.lock().await;
        guard.set_queue_paused(connector.id, true, Utc::now()).unwrap();
    }

    let client = ScriptedClient::new();
    let dispatcher = Dispatcher::new(
        store.clone(),
        Arc::new(ScriptedFactory(client.clone())),
        common::dispatch_config(),
    );
    let stats = dispatcher.drain_connector(connector.id).await.unwrap();
    assert_eq!(stats.dispatched, 0);
    assert_eq!(stats.deferred, 3);
    assert!(client.commands().is_empty());
}
