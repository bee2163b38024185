//! Discovery engine: derives search candidates from the content mirror.
//!
//! Each run is two passes over one (connector, search type):
//! 1. Resolved sweep — registry rows whose candidate condition no longer
//!    holds are deleted (gap rows once the file exists; upgrade rows once
//!    the cutoff is met, gated on a prior search).
//! 2. Anti-join insert — every mirror row matching the predicate with no
//!    registry row yet gets a pending entry, in conflict-ignored batches
//!    so a concurrent sync cannot trip the unique index.
//!
//! Both passes are idempotent: running discovery twice against an
//! unchanged mirror is a no-op the second time.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::info;

use crate::store::content::ContentKind;
use crate::store::registry::SearchType;
use crate::store::{Store, StoreResult};

/// Per-invocation overrides.
#[derive(Debug, Clone, Copy)]
pub struct DiscoveryOptions {
    pub batch_size: usize,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        DiscoveryOptions { batch_size: 1000 }
    }
}

/// Counts from one discovery run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct DiscoveryOutcome {
    /// Registry rows deleted because their condition resolved.
    pub resolved: usize,
    /// New pending registry rows created.
    pub created: usize,
    /// Candidates that already had a registry row.
    pub skipped: usize,
}

pub struct DiscoveryEngine {
    store: Arc<Mutex<Store>>,
}

impl DiscoveryEngine {
    pub fn new(store: Arc<Mutex<Store>>) -> Self {
        DiscoveryEngine { store }
    }

    /// Gap discovery: monitored content with no file.
    pub async fn run_discover_gaps(
        &self,
        connector_id: i64,
        opts: DiscoveryOptions,
    ) -> StoreResult<DiscoveryOutcome> {
        self.run(connector_id, SearchType::Gap, opts).await
    }

    /// Upgrade discovery: monitored content below its quality cutoff.
    pub async fn run_discover_upgrades(
        &self,
        connector_id: i64,
        opts: DiscoveryOptions,
    ) -> StoreResult<DiscoveryOutcome> {
        self.run(connector_id, SearchType::Upgrade, opts).await
    }

    async fn run(
        &self,
        connector_id: i64,
        search_type: SearchType,
        opts: DiscoveryOptions,
    ) -> StoreResult<DiscoveryOutcome> {
        let mut store = self.store.lock().await;
        let connector = store.connector(connector_id)?;
        let kind = if connector.dialect.is_tv() {
            ContentKind::Episode
        } else {
            ContentKind::Movie
        };

        let resolved = store.delete_resolved(connector_id, kind, search_type)?;
        let candidates = store.count_candidates(connector_id, kind, search_type)?;
        let created = store.insert_candidates(
            connector_id,
            kind,
            search_type,
            opts.batch_size.max(1),
            Utc::now(),
        )?;
        drop(store);

        let outcome = DiscoveryOutcome {
            resolved,
            created,
            skipped: candidates.saturating_sub(created),
        };
        info!(
            connector = %connector.name,
            search_type = search_type.as_str(),
            resolved = outcome.resolved,
            created = outcome.created,
            skipped = outcome.skipped,
            "discovery complete"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::connectors::NewConnector;
    use arr_api::models::{Dialect, MovieResource};
    use chrono::TimeZone;

    fn movie(id: i64, has_file: bool, cutoff_not_met: bool) -> MovieResource {
        MovieResource {
            id,
            title: format!("movie-{id}"),
            monitored: true,
            has_file,
            quality_cutoff_not_met: cutoff_not_met,
            movie_file: None,
        }
    }

    async fn engine_with_movies(movies: &[MovieResource]) -> (DiscoveryEngine, i64) {
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
        let mut store = Store::open_in_memory().unwrap();
        let c = store
            .create_connector(
                &NewConnector {
                    dialect: Dialect::MovieRadarr,
                    name: "radarr".to_owned(),
                    base_url: "http://r.lan".to_owned(),
                    api_key_enc: vec![0],
                    enabled: true,
                    throttle_profile_id: None,
                },
                now,
            )
            .unwrap();
        store.upsert_movies(c.id, movies, now).unwrap();
        (DiscoveryEngine::new(Arc::new(Mutex::new(store))), c.id)
    }

    #[tokio::test]
    async fn discovery_counts_created_then_skipped_on_rerun() {
        let (engine, connector_id) = engine_with_movies(&[
            movie(1, false, false),
            movie(2, false, false),
            movie(3, false, false),
        ])
        .await;

        let first = engine
            .run_discover_gaps(connector_id, DiscoveryOptions::default())
            .await
            .unwrap();
        assert_eq!(first, DiscoveryOutcome { resolved: 0, created: 3, skipped: 0 });

        let second = engine
            .run_discover_gaps(connector_id, DiscoveryOptions::default())
            .await
            .unwrap();
        assert_eq!(second, DiscoveryOutcome { resolved: 0, created: 0, skipped: 3 });
    }

    #[tokio::test]
    async fn upgrade_discovery_selects_only_cutoff_not_met() {
        let (engine, connector_id) = engine_with_movies(&[
            movie(1, true, true),
            movie(2, true, false),
            movie(3, false, false),
        ])
        .await;

        let outcome = engine
            .run_discover_upgrades(connector_id, DiscoveryOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.created, 1);
    }
}
