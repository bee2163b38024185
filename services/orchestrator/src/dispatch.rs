//! Throttled dispatcher: one cooperative drain loop per connector.
//!
//! Each tick releases due cooldowns, then drains the pending queue:
//! pop (pending → queued, queue row created), gate against the throttle,
//! and either dispatch (queued → searching, pending command recorded) or
//! defer (queued → pending with `scheduled_at` parked at the gate's
//! deny-until). Deferral keeps draining, so a burst beyond the budget
//! leaves every over-limit entry parked rather than spinning.
//!
//! TV gap entries try a season-pack search first; a rejected season
//! search flips `season_pack_failed` and later attempts fall back to a
//! per-episode search. Upgrades always target the single episode.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use arr_api::{SearchCommand, UpstreamClient, UpstreamError};
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use crate::clients::ClientFactory;
use crate::config::DispatchConfig;
use crate::store::connectors::{Connector, Health};
use crate::store::content::ContentKind;
use crate::store::registry::{RegistryRow, SearchType};
use crate::store::{Store, StoreResult};
use crate::throttle::{self, GateDecision};

const COMMAND_TIMEOUT: StdDuration = StdDuration::from_secs(30);

/// Counters from one drain pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainStats {
    pub dispatched: usize,
    pub deferred: usize,
    pub cooled: usize,
    pub exhausted: usize,
}

pub struct Dispatcher {
    store: Arc<Mutex<Store>>,
    clients: Arc<dyn ClientFactory>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        store: Arc<Mutex<Store>>,
        clients: Arc<dyn ClientFactory>,
        config: DispatchConfig,
    ) -> Self {
        Dispatcher {
            store,
            clients,
            config,
        }
    }

    /// Tick loop for one connector; owned by the scheduler.
    pub async fn run_loop(&self, connector_id: i64, mut shutdown: watch::Receiver<bool>) {
        let tick = StdDuration::from_secs(self.config.tick_secs.max(1));
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                () = tokio::time::sleep(tick) => {}
            }
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.drain_connector(connector_id).await {
                warn!(connector = connector_id, error = %e, "drain failed");
            }
        }
        debug!(connector = connector_id, "dispatcher stopped");
    }

    /// One drain pass: release cooldowns, then pop/gate/dispatch until the
    /// pending queue is empty or everything left is parked.
    pub async fn drain_connector(&self, connector_id: i64) -> StoreResult<DrainStats> {
        let mut stats = DrainStats::default();

        let connector = {
            let mut store = self.store.lock().await;
            let connector = store.connector(connector_id)?;
            store.release_cooldowns(connector_id, Utc::now())?;
            connector
        };
        if !connector.enabled
            || !matches!(connector.health, Health::Healthy | Health::Degraded)
        {
            return Ok(stats);
        }

        let client = match self.clients.client_for(&connector, COMMAND_TIMEOUT) {
            Ok(client) => client,
            Err(e) => {
                warn!(connector = %connector.name, error = %e, "client unavailable");
                return Ok(stats);
            }
        };

        loop {
            let now = Utc::now();
            // Pop + gate under one lock so the queued transition and its
            // rollback cannot interleave with other store writers.
            let entry = {
                let mut store = self.store.lock().await;
                let Some(entry) = store.pop_next_pending(connector_id, now)? else {
                    break;
                };
                match throttle::gate(&store, &connector, now)? {
                    GateDecision::Deny { until, reason } => {
                        debug!(
                            connector = %connector.name,
                            registry = entry.id,
                            reason = reason.as_str(),
                            until = %until,
                            "dispatch deferred"
                        );
                        store.defer_entry(entry.id, until, now)?;
                        stats.deferred += 1;
                        continue;
                    }
                    GateDecision::Allow => {
                        throttle::record_dispatch(&mut store, connector_id, now)?;
                        store.mark_searching(entry.id, now)?;
                        entry
                    }
                }
            };

            self.dispatch_entry(&connector, client.as_ref(), &entry, &mut stats)
                .await?;
        }
        Ok(stats)
    }

    async fn dispatch_entry(
        &self,
        connector: &Connector,
        client: &dyn UpstreamClient,
        entry: &RegistryRow,
        stats: &mut DrainStats,
    ) -> StoreResult<()> {
        let command = {
            let store = self.store.lock().await;
            build_command(&store, entry)?
        };
        let Some((command, season_pack)) = command else {
            // Content row vanished between discovery and dispatch.
            let mut store = self.store.lock().await;
            store.delete_registry_row(entry.id)?;
            return Ok(());
        };

        let result = client.issue_search(command).await;
        let now = Utc::now();
        let mut store = self.store.lock().await;
        match result {
            Ok(accepted) => {
                store.insert_pending_command(
                    connector.id,
                    entry.id,
                    entry.kind,
                    entry.content_id,
                    accepted.id,
                    now,
                )?;
                stats.dispatched += 1;
                info!(
                    connector = %connector.name,
                    registry = entry.id,
                    command = accepted.id,
                    "search dispatched"
                );
            }
            Err(error) => {
                if season_pack {
                    // Fall back to per-episode search on the next attempt.
                    store.set_season_pack_failed(entry.id, now)?;
                }
                self.handle_rejection(&mut store, connector, entry, &error, now)?;
                match error {
                    UpstreamError::RateLimited(_) => stats.cooled += 1,
                    e if e.is_retryable() => stats.cooled += 1,
                    _ => stats.exhausted += 1,
                }
            }
        }
        Ok(())
    }

    fn handle_rejection(
        &self,
        store: &mut Store,
        connector: &Connector,
        entry: &RegistryRow,
        error: &UpstreamError,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let attempts_after = entry.attempt_count + 1;
        let ceiling = i64::from(self.config.attempt_ceiling.max(1));

        if let UpstreamError::RateLimited(_) = error {
            let until = throttle::record_rate_limit_pause(store, connector.id, now)?;
            store.mark_cooldown(entry.id, until, Some(error.category()), now)?;
            warn!(
                connector = %connector.name,
                registry = entry.id,
                until = %until,
                "upstream rate limit; connector paused"
            );
            return Ok(());
        }

        if error.is_retryable() && attempts_after < ceiling {
            let next_eligible = now + self.rejection_backoff(entry.attempt_count);
            store.mark_cooldown(entry.id, next_eligible, Some(error.category()), now)?;
            debug!(
                connector = %connector.name,
                registry = entry.id,
                category = error.category(),
                next_eligible = %next_eligible,
                "search rejected; cooling down"
            );
        } else {
            let outcome = if error.is_retryable() { "exhausted" } else { "failed" };
            store.mark_exhausted(entry.id, Some(error.category()), now)?;
            store.record_history(
                connector.id,
                entry.kind,
                entry.content_id,
                entry.search_type,
                outcome,
                Some(error.category()),
                attempts_after,
                now,
            )?;
            warn!(
                connector = %connector.name,
                registry = entry.id,
                category = error.category(),
                outcome,
                "search terminal"
            );
        }
        Ok(())
    }

    /// Exponential in the attempt count, capped, with ±20 % jitter.
    fn rejection_backoff(&self, attempt_count: i64) -> Duration {
        let exp = attempt_count.clamp(0, 16) as u32;
        let base = self
            .config
            .backoff_base_secs
            .saturating_mul(1u64 << exp)
            .min(self.config.backoff_cap_secs.max(self.config.backoff_base_secs));
        let jitter = rand::thread_rng().gen_range(0.8..1.2);
        let secs = (base as f64 * jitter).round().max(1.0) as i64;
        Duration::seconds(secs)
    }
}

/// Translate a registry entry into the upstream command to issue.
///
/// Returns `None` when the content row no longer exists. The bool marks
/// a season-pack command, so the caller can record its failure.
fn build_command(
    store: &Store,
    entry: &RegistryRow,
) -> StoreResult<Option<(SearchCommand, bool)>> {
    match entry.kind {
        ContentKind::Movie => {
            let Some(movie) = store.movie(entry.content_id)? else {
                return Ok(None);
            };
            Ok(Some((
                SearchCommand::MoviesSearch {
                    movie_ids: vec![movie.upstream_id],
                },
                false,
            )))
        }
        ContentKind::Episode => {
            let Some((episode_upstream, series_upstream, season_number)) =
                store.episode_dispatch_keys(entry.content_id)?
            else {
                return Ok(None);
            };
            let use_season_pack =
                entry.search_type == SearchType::Gap && !entry.season_pack_failed;
            if use_season_pack {
                Ok(Some((
                    SearchCommand::SeasonSearch {
                        series_id: series_upstream,
                        season_number,
                    },
                    true,
                )))
            } else {
                Ok(Some((
                    SearchCommand::EpisodeSearch {
                        episode_ids: vec![episode_upstream],
                    },
                    false,
                )))
            }
        }
    }
}
