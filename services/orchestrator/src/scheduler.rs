//! Global scheduler: owns the per-connector dispatcher tasks and the
//! shared sync / discovery / maintenance sweeps.
//!
//! The supervisor tick reconciles the dispatcher task set against the
//! enabled-connector list, so enabling a connector spawns its dispatcher
//! and disabling (or deleting) one signals the task to stop at its next
//! suspension point. Every loop observes the process-wide shutdown
//! signal; nothing is aborted mid-transaction.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::discovery::{DiscoveryEngine, DiscoveryOptions};
use crate::dispatch::Dispatcher;
use crate::outcome::OutcomeReconciler;
use crate::store::Store;
use crate::sync::{SyncEngine, SyncOptions};

const SUPERVISOR_TICK: StdDuration = StdDuration::from_secs(10);
const MAINTENANCE_TICK: StdDuration = StdDuration::from_secs(3600);

pub struct Scheduler {
    store: Arc<Mutex<Store>>,
    sync: Arc<SyncEngine>,
    discovery: Arc<DiscoveryEngine>,
    dispatcher: Arc<Dispatcher>,
    reconciler: Arc<OutcomeReconciler>,
    config: OrchestratorConfig,
    shutdown: watch::Receiver<bool>,
}

/// A running dispatcher task plus its private stop signal.
struct DispatcherHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Scheduler {
    pub fn new(
        store: Arc<Mutex<Store>>,
        sync: Arc<SyncEngine>,
        discovery: Arc<DiscoveryEngine>,
        dispatcher: Arc<Dispatcher>,
        reconciler: Arc<OutcomeReconciler>,
        config: OrchestratorConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Scheduler {
            store,
            sync,
            discovery,
            dispatcher,
            reconciler,
            config,
            shutdown,
        }
    }

    /// Main loop; returns once shutdown is signalled and all dispatcher
    /// tasks have stopped.
    pub async fn run(mut self) {
        let start = tokio::time::Instant::now();
        let sync_period = StdDuration::from_secs(self.config.sync.interval_secs.max(30));
        let reconcile_period =
            StdDuration::from_secs(self.config.sync.reconcile_interval_secs.max(300));

        let mut supervisor = tokio::time::interval(SUPERVISOR_TICK);
        let mut sync_tick = tokio::time::interval_at(start + sync_period, sync_period);
        let mut reconcile_tick =
            tokio::time::interval_at(start + reconcile_period, reconcile_period);
        let mut maintenance_tick =
            tokio::time::interval_at(start + MAINTENANCE_TICK, MAINTENANCE_TICK);

        let mut dispatchers: HashMap<i64, DispatcherHandle> = HashMap::new();
        info!(
            sync_interval = self.config.sync.interval_secs,
            reconcile_interval = self.config.sync.reconcile_interval_secs,
            "scheduler started"
        );

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        break;
                    }
                }
                _ = supervisor.tick() => {
                    self.reconcile_dispatchers(&mut dispatchers).await;
                }
                _ = sync_tick.tick() => {
                    self.run_sweep(false).await;
                }
                _ = reconcile_tick.tick() => {
                    self.run_sweep(true).await;
                }
                _ = maintenance_tick.tick() => {
                    self.run_maintenance().await;
                }
            }
        }

        // Graceful stop: signal every dispatcher, then wait for each.
        for (_, handle) in dispatchers.iter() {
            let _ = handle.stop.send(true);
        }
        for (connector_id, handle) in dispatchers {
            if handle.task.await.is_err() {
                warn!(connector = connector_id, "dispatcher task panicked");
            }
        }
        info!("scheduler stopped");
    }

    /// Spawn dispatchers for newly enabled connectors; stop dispatchers
    /// whose connector is gone or disabled.
    async fn reconcile_dispatchers(&self, dispatchers: &mut HashMap<i64, DispatcherHandle>) {
        let enabled: Vec<i64> = {
            let store = self.store.lock().await;
            match store.list_enabled_connectors() {
                Ok(connectors) => connectors.into_iter().map(|c| c.id).collect(),
                Err(e) => {
                    warn!(error = %e, "connector listing failed");
                    return;
                }
            }
        };

        let stale: Vec<i64> = dispatchers
            .keys()
            .filter(|id| !enabled.contains(id))
            .copied()
            .collect();
        for connector_id in stale {
            if let Some(handle) = dispatchers.remove(&connector_id) {
                debug!(connector = connector_id, "stopping dispatcher");
                let _ = handle.stop.send(true);
            }
        }

        for connector_id in enabled {
            if dispatchers.contains_key(&connector_id) {
                continue;
            }
            debug!(connector = connector_id, "starting dispatcher");
            let (stop_tx, stop_rx) = watch::channel(false);
            let dispatcher = self.dispatcher.clone();
            let task = tokio::spawn(async move {
                dispatcher.run_loop(connector_id, stop_rx).await;
            });
            dispatchers.insert(
                connector_id,
                DispatcherHandle {
                    stop: stop_tx,
                    task,
                },
            );
        }
    }

    /// One sweep over every enabled connector: sync, settle acquisitions,
    /// then rediscover candidates.
    async fn run_sweep(&self, reconcile: bool) {
        let connectors = {
            let store = self.store.lock().await;
            store.list_enabled_connectors().unwrap_or_default()
        };
        let opts = SyncOptions {
            concurrency: self.config.sync.concurrency,
            request_delay_ms: self.config.sync.request_delay_ms,
            skip_retry: false,
        };
        for connector in connectors {
            if *self.shutdown.borrow() {
                return;
            }
            let outcome = if reconcile {
                self.sync.run_reconcile(connector.id, &opts).await
            } else {
                self.sync.run_incremental(connector.id, &opts).await
            };

            if let Err(e) = self.reconciler.reconcile_acquisitions(&outcome.acquired).await {
                warn!(connector = %connector.name, error = %e, "acquisition reconcile failed");
            }

            if outcome.error.is_none() {
                let discovery_opts = DiscoveryOptions {
                    batch_size: self.config.discovery.batch_size,
                };
                if let Err(e) = self
                    .discovery
                    .run_discover_gaps(connector.id, discovery_opts)
                    .await
                {
                    warn!(connector = %connector.name, error = %e, "gap discovery failed");
                }
                if let Err(e) = self
                    .discovery
                    .run_discover_upgrades(connector.id, discovery_opts)
                    .await
                {
                    warn!(connector = %connector.name, error = %e, "upgrade discovery failed");
                }
            }
        }
    }

    /// Hourly bookkeeping: command timeouts and history retention.
    async fn run_maintenance(&self) {
        match self.reconciler.sweep_timeouts().await {
            Ok(0) => {}
            Ok(n) => info!(swept = n, "pending commands timed out"),
            Err(e) => warn!(error = %e, "timeout sweep failed"),
        }

        let cutoff = Utc::now() - Duration::days(i64::from(self.config.history.retention_days));
        let mut store = self.store.lock().await;
        match store.prune_history_before(cutoff) {
            Ok(0) => {}
            Ok(n) => info!(pruned = n, "search history pruned"),
            Err(e) => warn!(error = %e, "history prune failed"),
        }
    }
}
