#![allow(dead_code)]

// Shared fixtures for the orchestrator integration suites.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use arr_api::models::{CommandResource, Dialect, MovieResource, SystemStatusResource};
use arr_api::{SearchCommand, UpstreamClient, UpstreamError};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use orchestrator::clients::ClientFactory;
use orchestrator::config::DispatchConfig;
use orchestrator::store::Store;
use orchestrator::store::connectors::{Connector, Health, NewConnector};
use orchestrator::store::throttles::NewThrottleProfile;

/// An in-process `UpstreamClient` with a scriptable failure and a log of
/// issued commands.
pub struct ScriptedClient {
    fail: std::sync::Mutex<Option<UpstreamError>>,
    commands: std::sync::Mutex<Vec<SearchCommand>>,
    next_command_id: AtomicI64,
}

impl ScriptedClient {
    pub fn new() -> Arc<Self> {
        Arc::new(ScriptedClient {
            fail: std::sync::Mutex::new(None),
            commands: std::sync::Mutex::new(Vec::new()),
            next_command_id: AtomicI64::new(9000),
        })
    }

    /// Make every subsequent call fail with `error`; `None` restores
    /// normal behavior.
    pub fn set_fail(&self, error: Option<UpstreamError>) {
        *self.fail.lock().unwrap() = error;
    }

    pub fn commands(&self) -> Vec<SearchCommand> {
        self.commands.lock().unwrap().clone()
    }

    fn check_fail(&self) -> Result<(), UpstreamError> {
        match self.fail.lock().unwrap().clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl UpstreamClient for ScriptedClient {
    async fn system_status(&self) -> Result<SystemStatusResource, UpstreamError> {
        self.check_fail()?;
        Ok(SystemStatusResource {
            version: "4.0.0.0".to_owned(),
        })
    }

    async fn list_series(&self) -> Result<Vec<arr_api::SeriesResource>, UpstreamError> {
        self.check_fail()?;
        Ok(vec![])
    }

    async fn list_episodes(
        &self,
        _series_id: i64,
    ) -> Result<Vec<arr_api::EpisodeResource>, UpstreamError> {
        self.check_fail()?;
        Ok(vec![])
    }

    async fn list_movies(&self) -> Result<Vec<MovieResource>, UpstreamError> {
        self.check_fail()?;
        Ok(vec![])
    }

    async fn issue_search(
        &self,
        command: SearchCommand,
    ) -> Result<CommandResource, UpstreamError> {
        self.check_fail()?;
        let name = command.name().to_owned();
        self.commands.lock().unwrap().push(command);
        Ok(CommandResource {
            id: self.next_command_id.fetch_add(1, Ordering::SeqCst),
            name,
            status: "queued".to_owned(),
        })
    }
}

/// Factory that always hands out the same scripted client.
pub struct ScriptedFactory(pub Arc<ScriptedClient>);

impl ClientFactory for ScriptedFactory {
    fn client_for(
        &self,
        _connector: &Connector,
        _timeout: Duration,
    ) -> Result<Arc<dyn UpstreamClient>, UpstreamError> {
        Ok(self.0.clone())
    }
}

pub fn test_store() -> Arc<Mutex<Store>> {
    Arc::new(Mutex::new(Store::open_in_memory().unwrap()))
}

pub fn dispatch_config() -> DispatchConfig {
    DispatchConfig {
        tick_secs: 1,
        attempt_ceiling: 6,
        backoff_base_secs: 300,
        backoff_cap_secs: 21_600,
        command_timeout_hours: 24,
    }
}

/// Create an enabled, healthy movie connector with an rpm-limited profile.
pub async fn movie_connector_with_rpm(
    store: &Arc<Mutex<Store>>,
    name: &str,
    rpm: u32,
) -> Connector {
    let mut guard = store.lock().await;
    let profile = guard
        .create_throttle_profile(&NewThrottleProfile {
            name: format!("{name}-profile"),
            requests_per_minute: rpm,
            daily_budget: None,
            batch_size: 50,
            batch_cooldown_secs: 3600,
            rate_limit_pause_secs: 600,
            is_default: false,
        })
        .unwrap();
    let connector = guard
        .create_connector(
            &NewConnector {
                dialect: Dialect::MovieRadarr,
                name: name.to_owned(),
                base_url: "http://r.lan".to_owned(),
                api_key_enc: vec![1],
                enabled: true,
                throttle_profile_id: Some(profile.id),
            },
            Utc::now(),
        )
        .unwrap();
    guard
        .update_connector_health(connector.id, Health::Healthy, Utc::now())
        .unwrap();
    guard.connector(connector.id).unwrap()
}

pub fn movie(id: i64, monitored: bool, has_file: bool, cutoff_not_met: bool) -> MovieResource {
    MovieResource {
        id,
        title: format!("movie-{id}"),
        monitored,
        has_file,
        quality_cutoff_not_met: cutoff_not_met,
        movie_file: None,
    }
}

/// Seed `n` monitored, file-less movies into the mirror.
pub async fn seed_gap_movies(store: &Arc<Mutex<Store>>, connector_id: i64, n: i64) {
    let movies: Vec<MovieResource> = (1..=n).map(|i| movie(i, true, false, false)).collect();
    let mut guard = store.lock().await;
    guard.upsert_movies(connector_id, &movies, Utc::now()).unwrap();
}
