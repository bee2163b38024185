// orchestrator: Watches upstream media-automation instances and issues
// throttled search commands for missing and upgradable content.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::{Mutex, watch};
use tracing::info;

use orchestrator::admin::{self, AppState};
use orchestrator::clients::HttpClientFactory;
use orchestrator::config;
use orchestrator::discovery::DiscoveryEngine;
use orchestrator::dispatch::Dispatcher;
use orchestrator::outcome::OutcomeReconciler;
use orchestrator::scheduler::Scheduler;
use orchestrator::store::Store;
use orchestrator::sync::SyncEngine;
use orchestrator::vault::Vault;

#[tokio::main]
async fn main() {
    // Structured logging to stdout; RUST_LOG overrides the default level.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "orchestrator starting");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/sweeparr/orchestrator.toml".to_owned());
    let cfg = config::load_config_from_path(Path::new(&config_path)).unwrap_or_else(|e| {
        eprintln!("FATAL: failed to load config: {e}");
        std::process::exit(1);
    });

    // The secret key is process-wide and immutable; a bad key is fatal
    // before anything else starts.
    let vault = Vault::from_hex_key(&cfg.secret_key_hex).unwrap_or_else(|e| {
        eprintln!("FATAL: vault init failed: {e}");
        std::process::exit(1);
    });
    let vault = Arc::new(vault);

    let store = Store::open(Path::new(&cfg.store.sqlite_path)).unwrap_or_else(|e| {
        eprintln!("FATAL: failed to open store: {e}");
        std::process::exit(1);
    });

    // Verifier pair: prove on reopen that the configured key matches the
    // one the stored ciphertexts were written under.
    let verifier_check = match store.vault_verifier() {
        Ok(Some(blob)) => vault.check_verifier(&blob).map_err(|e| e.to_string()),
        Ok(None) => vault
            .verifier_blob()
            .map_err(|e| e.to_string())
            .and_then(|blob| store.save_vault_verifier(&blob).map_err(|e| e.to_string())),
        Err(e) => Err(e.to_string()),
    };
    if let Err(e) = verifier_check {
        eprintln!("FATAL: vault verifier check failed (key mismatch?): {e}");
        std::process::exit(1);
    }

    let store = Arc::new(Mutex::new(store));
    {
        let mut guard = store.lock().await;
        if let Err(e) = guard.ensure_default_profile() {
            eprintln!("FATAL: default throttle profile: {e}");
            std::process::exit(1);
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let clients = Arc::new(HttpClientFactory::new(vault.clone()));

    let sync = Arc::new(SyncEngine::new(
        store.clone(),
        clients.clone(),
        cfg.sync.clone(),
        shutdown_rx.clone(),
    ));
    let discovery = Arc::new(DiscoveryEngine::new(store.clone()));
    let dispatcher = Arc::new(Dispatcher::new(store.clone(), clients, cfg.dispatch.clone()));
    let reconciler = Arc::new(OutcomeReconciler::new(store.clone(), cfg.dispatch.clone()));

    let scheduler = Scheduler::new(
        store.clone(),
        sync.clone(),
        discovery.clone(),
        dispatcher,
        reconciler.clone(),
        cfg.clone(),
        shutdown_rx,
    );
    let scheduler_task = tokio::spawn(scheduler.run());

    let state = Arc::new(AppState {
        store,
        vault,
        sync,
        discovery,
        reconciler,
        config: cfg.clone(),
    });

    tokio::select! {
        result = admin::serve(state, &cfg.server.bind) => {
            if let Err(e) = result {
                eprintln!("FATAL: admin server: {e}");
            }
        }
        () = shutdown_signal() => {}
    }

    let _ = shutdown_tx.send(true);
    let _ = scheduler_task.await;
    info!("orchestrator shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); }
        _ = terminate => { info!("received SIGTERM, shutting down"); }
    }
}
