//! Orchestrator configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/sweeparr/orchestrator.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//! - `vault.secret_key_file`
//!
//! # Secret key file format
//! Exactly 64 hex characters (a 256-bit AES key) on a single line;
//! trimmed on read. Anything else fails startup.

use serde::Deserialize;
use std::path::Path;

// ---------------------------------------------------------------------------
// Config types (deserialized from TOML)
// ---------------------------------------------------------------------------

/// Top-level orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub schema_version: u32,
    /// 64 hex chars read from the secret key file (not the file path).
    pub secret_key_hex: String,
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub sync: SyncConfig,
    pub discovery: DiscoveryConfig,
    pub dispatch: DispatchConfig,
    pub history: HistoryConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub sqlite_path: String,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Seconds between incremental sweeps per connector.
    pub interval_secs: u64,
    /// Seconds between reconcile sweeps per connector.
    pub reconcile_interval_secs: u64,
    /// Episode fetch worker pool size.
    pub concurrency: usize,
    /// Inter-start spacing between episode fetches.
    pub request_delay_ms: u64,
    /// Whole-sync retry attempts on retryable failure.
    pub max_retries: u32,
    pub retry_base_secs: u64,
    pub retry_cap_secs: u64,
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub batch_size: usize,
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Seconds between dispatcher drain ticks.
    pub tick_secs: u64,
    /// Attempts before a registry entry is exhausted.
    pub attempt_ceiling: u32,
    pub backoff_base_secs: u64,
    pub backoff_cap_secs: u64,
    /// Pending commands older than this are swept as not-found.
    pub command_timeout_hours: u64,
}

#[derive(Debug, Clone)]
pub struct HistoryConfig {
    pub retention_days: u32,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    server: Option<RawServerConfig>,
    store: Option<RawStoreConfig>,
    vault: Option<RawVaultConfig>,
    sync: Option<RawSyncConfig>,
    discovery: Option<RawDiscoveryConfig>,
    dispatch: Option<RawDispatchConfig>,
    history: Option<RawHistoryConfig>,
}

#[derive(Debug, Deserialize)]
struct RawServerConfig {
    bind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawStoreConfig {
    sqlite_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawVaultConfig {
    secret_key_file: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawSyncConfig {
    interval_secs: Option<u64>,
    reconcile_interval_secs: Option<u64>,
    concurrency: Option<usize>,
    request_delay_ms: Option<u64>,
    max_retries: Option<u32>,
    retry_base_secs: Option<u64>,
    retry_cap_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawDiscoveryConfig {
    batch_size: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawDispatchConfig {
    tick_secs: Option<u64>,
    attempt_ceiling: Option<u32>,
    backoff_base_secs: Option<u64>,
    backoff_cap_secs: Option<u64>,
    command_timeout_hours: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawHistoryConfig {
    retention_days: Option<u32>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load config from the default path `/etc/sweeparr/orchestrator.toml`.
pub fn load_config() -> Result<OrchestratorConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/sweeparr/orchestrator.toml"))
}

/// Load config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<OrchestratorConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<OrchestratorConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {schema_version}"
        )));
    }

    let raw_vault = raw
        .vault
        .ok_or_else(|| ConfigError::MissingField("vault".to_owned()))?;
    let secret_key_file = raw_vault
        .secret_key_file
        .ok_or_else(|| ConfigError::MissingField("vault.secret_key_file".to_owned()))?;
    let secret_key_hex = read_secret_key_file(&secret_key_file)?;

    let server = ServerConfig {
        bind: raw
            .server
            .and_then(|s| s.bind)
            .unwrap_or_else(|| "0.0.0.0:8989".to_owned()),
    };

    let store = StoreConfig {
        sqlite_path: raw
            .store
            .and_then(|s| s.sqlite_path)
            .unwrap_or_else(|| "/var/lib/sweeparr/sweeparr.sqlite3".to_owned()),
    };

    let sync = match raw.sync {
        Some(s) => SyncConfig {
            interval_secs: s.interval_secs.unwrap_or(900),
            reconcile_interval_secs: s.reconcile_interval_secs.unwrap_or(86_400),
            concurrency: s.concurrency.unwrap_or(5),
            request_delay_ms: s.request_delay_ms.unwrap_or(100),
            max_retries: s.max_retries.unwrap_or(3),
            retry_base_secs: s.retry_base_secs.unwrap_or(30),
            retry_cap_secs: s.retry_cap_secs.unwrap_or(300),
        },
        None => SyncConfig {
            interval_secs: 900,
            reconcile_interval_secs: 86_400,
            concurrency: 5,
            request_delay_ms: 100,
            max_retries: 3,
            retry_base_secs: 30,
            retry_cap_secs: 300,
        },
    };
    if sync.concurrency == 0 {
        return Err(ConfigError::InvalidValue(
            "sync.concurrency must be at least 1".to_owned(),
        ));
    }

    let discovery = DiscoveryConfig {
        batch_size: raw
            .discovery
            .and_then(|d| d.batch_size)
            .unwrap_or(1000)
            .max(1),
    };

    let dispatch = match raw.dispatch {
        Some(d) => DispatchConfig {
            tick_secs: d.tick_secs.unwrap_or(5),
            attempt_ceiling: d.attempt_ceiling.unwrap_or(6),
            backoff_base_secs: d.backoff_base_secs.unwrap_or(300),
            backoff_cap_secs: d.backoff_cap_secs.unwrap_or(21_600),
            command_timeout_hours: d.command_timeout_hours.unwrap_or(24),
        },
        None => DispatchConfig {
            tick_secs: 5,
            attempt_ceiling: 6,
            backoff_base_secs: 300,
            backoff_cap_secs: 21_600,
            command_timeout_hours: 24,
        },
    };

    let history = HistoryConfig {
        retention_days: raw.history.and_then(|h| h.retention_days).unwrap_or(30),
    };

    Ok(OrchestratorConfig {
        schema_version,
        secret_key_hex,
        server,
        store,
        sync,
        discovery,
        dispatch,
        history,
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}

// ---------------------------------------------------------------------------
// Secret key file reader
// ---------------------------------------------------------------------------

fn read_secret_key_file(path: &str) -> Result<String, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading secret key file '{path}': {e}")))?;
    let key = content.trim().to_owned();
    if key.len() != 64 || !key.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ConfigError::InvalidValue(format!(
            "secret key file '{path}' must contain exactly 64 hex characters"
        )));
    }
    Ok(key)
}
