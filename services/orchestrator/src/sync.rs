//! Sync engine: pulls upstream library state into the content mirror.
//!
//! Two modes behind one contract:
//! - **Incremental**: fetch the full upstream listing and upsert; never
//!   deletes. Rows whose file just appeared are returned to the caller
//!   so the outcome reconciler can settle in-flight commands.
//! - **Reconcile**: additionally computes the set difference against the
//!   mirror and deletes rows the upstream no longer reports, cascading
//!   by hand into the search registry per content kind.
//!
//! TV episode fetches run through a bounded worker pool with per-start
//! pacing. A failed series fetch skips that series and attributes a
//! retryable error to the sync as a whole.
//!
//! The retry wrapper re-runs the whole operation on retryable failures
//! with exponential back-off; auth, validation, not-found, and TLS
//! failures short-circuit. After every terminal attempt the connector
//! health is recomputed.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use arr_api::{UpstreamClient, UpstreamError};
use chrono::Utc;
use tokio::sync::{Mutex, Semaphore, watch};
use tracing::{debug, info, warn};

use crate::clients::ClientFactory;
use crate::config::SyncConfig;
use crate::store::connectors::{Connector, Health};
use crate::store::content::{AcquiredContent, ContentKind};
use crate::store::{Store, StoreError};

/// Consecutive failures after which a retryable-failure connector is
/// marked unhealthy rather than degraded.
pub const UNHEALTHY_THRESHOLD: u32 = 5;

const INCREMENTAL_TIMEOUT: StdDuration = StdDuration::from_secs(60);
const RECONCILE_TIMEOUT: StdDuration = StdDuration::from_secs(120);

// ---------------------------------------------------------------------------
// Options and outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Incremental,
    Reconcile,
}

impl SyncMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncMode::Incremental => "incremental",
            SyncMode::Reconcile => "reconcile",
        }
    }
}

/// Per-invocation overrides; defaults mirror the config defaults.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub concurrency: usize,
    pub request_delay_ms: u64,
    pub skip_retry: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        SyncOptions {
            concurrency: 5,
            request_delay_ms: 100,
            skip_retry: false,
        }
    }
}

/// Result of one sync invocation (all attempts included).
#[derive(Debug)]
pub struct SyncOutcome {
    pub mode: SyncMode,
    pub fetched: usize,
    pub upserted: usize,
    pub deleted: usize,
    pub acquired: Vec<AcquiredContent>,
    pub attempts: u32,
    pub health: Health,
    pub duration_ms: i64,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
struct AttemptCounts {
    fetched: usize,
    upserted: usize,
    deleted: usize,
    acquired: Vec<AcquiredContent>,
}

/// Health after a failed sync attempt, per the connector health state
/// machine: auth is immediately unhealthy, transport unreachability is
/// offline, everything else degrades until the failure threshold.
pub fn health_after_failure(error: &UpstreamError, consecutive_failures: u32) -> Health {
    match error {
        UpstreamError::Auth(_) => Health::Unhealthy,
        UpstreamError::Transport(_) => Health::Offline,
        _ if consecutive_failures >= UNHEALTHY_THRESHOLD => Health::Unhealthy,
        _ => Health::Degraded,
    }
}

// ---------------------------------------------------------------------------
// SyncEngine
// ---------------------------------------------------------------------------

pub struct SyncEngine {
    store: Arc<Mutex<Store>>,
    clients: Arc<dyn ClientFactory>,
    config: SyncConfig,
    shutdown: watch::Receiver<bool>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<Mutex<Store>>,
        clients: Arc<dyn ClientFactory>,
        config: SyncConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        SyncEngine {
            store,
            clients,
            config,
            shutdown,
        }
    }

    pub async fn run_incremental(&self, connector_id: i64, opts: &SyncOptions) -> SyncOutcome {
        self.run(connector_id, SyncMode::Incremental, opts).await
    }

    pub async fn run_reconcile(&self, connector_id: i64, opts: &SyncOptions) -> SyncOutcome {
        self.run(connector_id, SyncMode::Reconcile, opts).await
    }

    async fn run(&self, connector_id: i64, mode: SyncMode, opts: &SyncOptions) -> SyncOutcome {
        let started = std::time::Instant::now();
        let mut outcome = SyncOutcome {
            mode,
            fetched: 0,
            upserted: 0,
            deleted: 0,
            acquired: Vec::new(),
            attempts: 0,
            health: Health::Unknown,
            duration_ms: 0,
            error: None,
        };

        let connector = match self.load_connector(connector_id).await {
            Ok(c) => c,
            Err(e) => {
                outcome.error = Some(e.to_string());
                outcome.duration_ms = started.elapsed().as_millis() as i64;
                return outcome;
            }
        };

        let max_attempts = if opts.skip_retry {
            1
        } else {
            self.config.max_retries.max(1)
        };

        loop {
            outcome.attempts += 1;
            match self.sync_once(&connector, mode, opts).await {
                Ok(counts) => {
                    outcome.fetched += counts.fetched;
                    outcome.upserted += counts.upserted;
                    outcome.deleted += counts.deleted;
                    outcome.acquired.extend(counts.acquired);
                    outcome.health = Health::Healthy;
                    outcome.error = None;

                    let now = Utc::now();
                    let mut store = self.store.lock().await;
                    let _ = store.record_sync_success(
                        connector.id,
                        mode == SyncMode::Reconcile,
                        now,
                    );
                    let _ = store.update_connector_last_sync(connector.id, now);
                    let _ = store.update_connector_health(connector.id, Health::Healthy, now);
                    drop(store);

                    info!(
                        connector = %connector.name,
                        mode = mode.as_str(),
                        fetched = outcome.fetched,
                        upserted = outcome.upserted,
                        deleted = outcome.deleted,
                        acquired = outcome.acquired.len(),
                        attempts = outcome.attempts,
                        "sync complete"
                    );
                    break;
                }
                Err((counts, error)) => {
                    outcome.fetched += counts.fetched;
                    outcome.upserted += counts.upserted;
                    outcome.deleted += counts.deleted;
                    outcome.acquired.extend(counts.acquired);
                    outcome.error = Some(error.to_string());

                    let now = Utc::now();
                    let mut store = self.store.lock().await;
                    let failures = store.record_sync_failure(connector.id).unwrap_or(1);
                    let health = health_after_failure(&error, failures);
                    let _ = store.update_connector_health(connector.id, health, now);
                    drop(store);
                    outcome.health = health;

                    warn!(
                        connector = %connector.name,
                        mode = mode.as_str(),
                        category = error.category(),
                        attempt = outcome.attempts,
                        failures,
                        health = health.as_str(),
                        "sync attempt failed"
                    );

                    if !error.is_retryable() || outcome.attempts >= max_attempts {
                        break;
                    }
                    let backoff = retry_backoff(
                        self.config.retry_base_secs,
                        self.config.retry_cap_secs,
                        outcome.attempts,
                    );
                    let mut shutdown = self.shutdown.clone();
                    tokio::select! {
                        biased;
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                        () = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }

        outcome.duration_ms = started.elapsed().as_millis() as i64;
        outcome
    }

    async fn load_connector(&self, connector_id: i64) -> Result<Connector, StoreError> {
        let store = self.store.lock().await;
        store.connector(connector_id)
    }

    async fn sync_once(
        &self,
        connector: &Connector,
        mode: SyncMode,
        opts: &SyncOptions,
    ) -> Result<AttemptCounts, (AttemptCounts, UpstreamError)> {
        let timeout = match mode {
            SyncMode::Incremental => INCREMENTAL_TIMEOUT,
            SyncMode::Reconcile => RECONCILE_TIMEOUT,
        };
        let client = self
            .clients
            .client_for(connector, timeout)
            .map_err(|e| (AttemptCounts::default(), e))?;

        if connector.dialect.is_tv() {
            self.sync_tv(connector, client, mode, opts).await
        } else {
            self.sync_movies(connector, client, mode).await
        }
    }

    // -----------------------------------------------------------------------
    // Movie dialect
    // -----------------------------------------------------------------------

    async fn sync_movies(
        &self,
        connector: &Connector,
        client: Arc<dyn UpstreamClient>,
        mode: SyncMode,
    ) -> Result<AttemptCounts, (AttemptCounts, UpstreamError)> {
        let mut counts = AttemptCounts::default();
        let movies = client
            .list_movies()
            .await
            .map_err(|e| (AttemptCounts::default(), e))?;
        counts.fetched = movies.len();

        let now = Utc::now();
        let mut store = self.store.lock().await;
        let stats = match store.upsert_movies(connector.id, &movies, now) {
            Ok(stats) => stats,
            Err(e) => return Err(store_failure_owned(counts, e)),
        };
        counts.upserted = stats.upserted;
        counts.acquired = stats.acquired;

        if mode == SyncMode::Reconcile {
            let present: HashSet<i64> = movies.iter().map(|m| m.id).collect();
            let mirror = store
                .movie_upstream_ids(connector.id)
                .unwrap_or_default();
            let stale: Vec<i64> = mirror
                .into_iter()
                .filter(|(_, upstream)| !present.contains(upstream))
                .map(|(local, _)| local)
                .collect();
            if !stale.is_empty() {
                let _ = store.delete_registry_for_content(ContentKind::Movie, &stale);
                counts.deleted = store
                    .delete_content_rows(ContentKind::Movie, &stale)
                    .unwrap_or(0);
            }
        }
        Ok(counts)
    }

    // -----------------------------------------------------------------------
    // TV dialects
    // -----------------------------------------------------------------------

    async fn sync_tv(
        &self,
        connector: &Connector,
        client: Arc<dyn UpstreamClient>,
        mode: SyncMode,
        opts: &SyncOptions,
    ) -> Result<AttemptCounts, (AttemptCounts, UpstreamError)> {
        let mut counts = AttemptCounts::default();
        let series = client
            .list_series()
            .await
            .map_err(|e| (AttemptCounts::default(), e))?;
        counts.fetched = series.len();

        // Upsert the series level first so episode rows can link to it.
        let mut series_ids: Vec<(i64, i64)> = Vec::with_capacity(series.len());
        {
            let mut store = self.store.lock().await;
            for s in &series {
                match store.upsert_series(connector.id, s) {
                    Ok(local_id) => series_ids.push((local_id, s.id)),
                    Err(e) => return Err(store_failure_owned(counts, e)),
                }
            }
        }

        // Bounded worker pool over per-series episode fetches.
        let semaphore = Arc::new(Semaphore::new(opts.concurrency.max(1)));
        let mut handles = Vec::with_capacity(series_ids.len());
        for &(local_id, upstream_id) in &series_ids {
            if *self.shutdown.borrow() {
                break;
            }
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            tokio::time::sleep(StdDuration::from_millis(opts.request_delay_ms)).await;
            let client = client.clone();
            handles.push((
                local_id,
                tokio::spawn(async move {
                    let result = client.list_episodes(upstream_id).await;
                    drop(permit);
                    result
                }),
            ));
        }

        let mut first_error: Option<UpstreamError> = None;
        let mut fetched_series: Vec<(i64, Vec<arr_api::EpisodeResource>)> = Vec::new();
        for (local_id, handle) in handles {
            match handle.await {
                Ok(Ok(episodes)) => fetched_series.push((local_id, episodes)),
                Ok(Err(e)) => {
                    debug!(series = local_id, category = e.category(), "episode fetch failed");
                    // One failed series does not abort the rest, but the
                    // sync as a whole reports a retryable failure.
                    let error = if e.is_retryable() {
                        e
                    } else {
                        UpstreamError::Server(format!("episode fetch: {e}"))
                    };
                    first_error.get_or_insert(error);
                }
                Err(join_error) => {
                    first_error
                        .get_or_insert(UpstreamError::Server(format!("worker: {join_error}")));
                }
            }
        }

        let now = Utc::now();
        {
            let mut store = self.store.lock().await;
            for (local_id, episodes) in &fetched_series {
                counts.fetched += episodes.len();
                match store.upsert_episodes(connector.id, *local_id, episodes, now) {
                    Ok(stats) => {
                        counts.upserted += stats.upserted;
                        counts.acquired.extend(stats.acquired);
                    }
                    Err(e) => return Err(store_failure_owned(counts, e)),
                }
            }

            if mode == SyncMode::Reconcile {
                // Series no longer reported upstream.
                let present: HashSet<i64> = series.iter().map(|s| s.id).collect();
                let mirror = store.series_upstream_ids(connector.id).unwrap_or_default();
                let stale_series: Vec<i64> = mirror
                    .into_iter()
                    .filter(|(_, upstream)| !present.contains(upstream))
                    .map(|(local, _)| local)
                    .collect();
                if !stale_series.is_empty() {
                    if let Ok(episode_ids) = store.delete_series_cascade(&stale_series) {
                        let _ = store
                            .delete_registry_for_content(ContentKind::Episode, &episode_ids);
                        counts.deleted += episode_ids.len() + stale_series.len();
                    }
                }

                // Episodes gone from series we fetched successfully; series
                // with a failed fetch are skipped (no upstream set to diff).
                for (local_id, episodes) in &fetched_series {
                    let present: HashSet<i64> = episodes.iter().map(|e| e.id).collect();
                    let mirror = store.episode_upstream_ids(*local_id).unwrap_or_default();
                    let stale: Vec<i64> = mirror
                        .into_iter()
                        .filter(|(_, upstream)| !present.contains(upstream))
                        .map(|(local, _)| local)
                        .collect();
                    if !stale.is_empty() {
                        let _ = store.delete_registry_for_content(ContentKind::Episode, &stale);
                        counts.deleted += store
                            .delete_content_rows(ContentKind::Episode, &stale)
                            .unwrap_or(0);
                    }
                }
            }
        }

        match first_error {
            Some(error) => Err((counts, error)),
            None => Ok(counts),
        }
    }
}

fn retry_backoff(base_secs: u64, cap_secs: u64, attempt: u32) -> StdDuration {
    let exp = attempt.saturating_sub(1).min(16);
    let secs = base_secs.saturating_mul(1u64 << exp).min(cap_secs.max(base_secs));
    StdDuration::from_secs(secs)
}

fn store_failure_owned(
    counts: AttemptCounts,
    error: StoreError,
) -> (AttemptCounts, UpstreamError) {
    (counts, UpstreamError::Server(format!("store: {error}")))
}
