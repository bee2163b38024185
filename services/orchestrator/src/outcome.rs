//! Outcome reconciler: closes the loop between dispatched commands and
//! later mirror observations.
//!
//! The system never asks an upstream "did you find it?". After every
//! incremental sync, rows whose file appeared are matched against the
//! oldest in-flight command for that content; the match becomes a
//! success history row and the registry entry ceases to exist. Commands
//! that outlive the timeout are swept to `not-found` and their registry
//! entries cool down for another attempt.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::DispatchConfig;
use crate::store::content::AcquiredContent;
use crate::store::{Store, StoreResult};

pub struct OutcomeReconciler {
    store: Arc<Mutex<Store>>,
    config: DispatchConfig,
}

impl OutcomeReconciler {
    pub fn new(store: Arc<Mutex<Store>>, config: DispatchConfig) -> Self {
        OutcomeReconciler { store, config }
    }

    /// Settle in-flight commands for content whose file just appeared.
    ///
    /// Returns the number of commands closed as successes. Acquisitions
    /// with no matching command (manual grabs, imports) are ignored.
    pub async fn reconcile_acquisitions(
        &self,
        acquired: &[AcquiredContent],
    ) -> StoreResult<usize> {
        if acquired.is_empty() {
            return Ok(0);
        }
        let now = Utc::now();
        let mut successes = 0;
        let mut store = self.store.lock().await;
        for item in acquired {
            let Some(command) = store.oldest_searching_command(item.kind, item.content_id)? else {
                debug!(
                    kind = item.kind.as_str(),
                    content = item.content_id,
                    "acquisition with no in-flight command"
                );
                continue;
            };
            let elapsed_ms = store.record_search_success(&command, now)?;
            successes += 1;
            info!(
                kind = item.kind.as_str(),
                content = item.content_id,
                command = command.upstream_command_id,
                elapsed_ms,
                "search succeeded"
            );
        }
        Ok(successes)
    }

    /// Sweep commands older than the configured timeout to `not-found`.
    pub async fn sweep_timeouts(&self) -> StoreResult<usize> {
        let now = Utc::now();
        let cutoff = now - Duration::hours(self.config.command_timeout_hours.max(1) as i64);
        let mut store = self.store.lock().await;
        let stale = store.commands_dispatched_before(cutoff)?;
        let swept = stale.len();
        for command in stale {
            let next_eligible =
                now + Duration::seconds(self.config.backoff_base_secs.max(60) as i64);
            store.record_command_timeout(&command, next_eligible, now)?;
            info!(
                kind = command.kind.as_str(),
                content = command.content_id,
                command = command.upstream_command_id,
                "command timed out; registry cooling down"
            );
        }
        Ok(swept)
    }
}
