//! Connector registry: CRUD, health lifecycle, sync-state bookkeeping.
//!
//! Connector deletion cascades over everything the connector owns in a
//! single transaction (mirror content, sync state, search registry,
//! request queue, throttle state, pending commands, history).

use arr_api::models::Dialect;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};

use super::{Store, StoreError, StoreResult, fmt_ts};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Connector health, driven by sync outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Degraded,
    Unhealthy,
    Offline,
    Unknown,
}

impl Health {
    pub fn as_str(self) -> &'static str {
        match self {
            Health::Healthy => "healthy",
            Health::Degraded => "degraded",
            Health::Unhealthy => "unhealthy",
            Health::Offline => "offline",
            Health::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "healthy" => Some(Health::Healthy),
            "degraded" => Some(Health::Degraded),
            "unhealthy" => Some(Health::Unhealthy),
            "offline" => Some(Health::Offline),
            "unknown" => Some(Health::Unknown),
            _ => None,
        }
    }
}

/// One upstream instance.
#[derive(Debug, Clone)]
pub struct Connector {
    pub id: i64,
    pub dialect: Dialect,
    pub name: String,
    pub base_url: String,
    pub api_key_enc: Vec<u8>,
    pub enabled: bool,
    pub health: Health,
    pub throttle_profile_id: Option<i64>,
    pub queue_paused: bool,
    pub created_at: String,
    pub updated_at: String,
    pub last_sync_at: Option<String>,
}

/// Input for connector creation; the API key arrives already encrypted.
#[derive(Debug, Clone)]
pub struct NewConnector {
    pub dialect: Dialect,
    pub name: String,
    pub base_url: String,
    pub api_key_enc: Vec<u8>,
    pub enabled: bool,
    pub throttle_profile_id: Option<i64>,
}

/// Partial connector update; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct ConnectorUpdate {
    pub name: Option<String>,
    pub base_url: Option<String>,
    pub api_key_enc: Option<Vec<u8>>,
    pub enabled: Option<bool>,
    pub throttle_profile_id: Option<Option<i64>>,
}

/// Gap/upgrade/queue counters surfaced on the connector detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectorStatistics {
    pub gaps: i64,
    pub upgrade_candidates: i64,
    pub queue_depth: i64,
}

/// Per-connector sync bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct SyncState {
    pub last_incremental_at: Option<String>,
    pub last_reconcile_at: Option<String>,
    pub consecutive_failures: u32,
}

fn map_connector(row: &Row<'_>) -> rusqlite::Result<Connector> {
    let dialect_str: String = row.get("dialect")?;
    let health_str: String = row.get("health")?;
    Ok(Connector {
        id: row.get("id")?,
        dialect: Dialect::parse(&dialect_str).unwrap_or(Dialect::TvSonarr),
        name: row.get("name")?,
        base_url: row.get("base_url")?,
        api_key_enc: row.get("api_key_enc")?,
        enabled: row.get("enabled")?,
        health: Health::parse(&health_str).unwrap_or(Health::Unknown),
        throttle_profile_id: row.get("throttle_profile_id")?,
        queue_paused: row.get("queue_paused")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        last_sync_at: row.get("last_sync_at")?,
    })
}

/// Strip trailing slashes; the stored URL never carries them.
pub fn normalize_base_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_owned()
}

const SELECT_CONNECTOR: &str = "SELECT id, dialect, name, base_url, api_key_enc, enabled, health, \
     throttle_profile_id, queue_paused, created_at, updated_at, last_sync_at FROM connectors";

// ---------------------------------------------------------------------------
// Store impl
// ---------------------------------------------------------------------------

impl Store {
    pub fn create_connector(
        &mut self,
        new: &NewConnector,
        now: DateTime<Utc>,
    ) -> StoreResult<Connector> {
        let ts = fmt_ts(now);
        let url = normalize_base_url(&new.base_url);
        if new.name.trim().is_empty() {
            return Err(StoreError::InvalidValue("connector name is empty".into()));
        }
        if url.is_empty() {
            return Err(StoreError::InvalidValue("connector URL is empty".into()));
        }

        let tx = self.conn.transaction()?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO connectors
                 (dialect, name, base_url, api_key_enc, enabled, health,
                  throttle_profile_id, queue_paused, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'unknown', ?6, 0, ?7, ?7)",
            params![
                new.dialect.as_str(),
                new.name,
                url,
                new.api_key_enc,
                new.enabled,
                new.throttle_profile_id,
                ts,
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::Conflict(format!(
                "connector name '{}' already exists",
                new.name
            )));
        }
        let id = tx.last_insert_rowid();
        tx.execute(
            "INSERT OR IGNORE INTO sync_state (connector_id) VALUES (?1)",
            params![id],
        )?;
        tx.commit()?;

        self.connector(id)
    }

    pub fn connector(&self, id: i64) -> StoreResult<Connector> {
        self.conn
            .query_row(
                &format!("{SELECT_CONNECTOR} WHERE id = ?1"),
                params![id],
                map_connector,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("connector {id}")))
    }

    pub fn connector_by_name(&self, name: &str) -> StoreResult<Option<Connector>> {
        Ok(self
            .conn
            .query_row(
                &format!("{SELECT_CONNECTOR} WHERE name = ?1"),
                params![name],
                map_connector,
            )
            .optional()?)
    }

    pub fn list_connectors(&self) -> StoreResult<Vec<Connector>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{SELECT_CONNECTOR} ORDER BY name"))?;
        let rows = stmt.query_map([], map_connector)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn list_enabled_connectors(&self) -> StoreResult<Vec<Connector>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{SELECT_CONNECTOR} WHERE enabled = 1 ORDER BY name"))?;
        let rows = stmt.query_map([], map_connector)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Enabled connectors whose health permits dispatch.
    pub fn list_healthy_connectors(&self) -> StoreResult<Vec<Connector>> {
        let mut stmt = self.conn.prepare(&format!(
            "{SELECT_CONNECTOR} WHERE enabled = 1 AND health IN ('healthy','degraded') ORDER BY name"
        ))?;
        let rows = stmt.query_map([], map_connector)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn update_connector(
        &mut self,
        id: i64,
        update: &ConnectorUpdate,
        now: DateTime<Utc>,
    ) -> StoreResult<Connector> {
        let existing = self.connector(id)?;
        let name = update.name.clone().unwrap_or(existing.name);
        let base_url = update
            .base_url
            .as_deref()
            .map(normalize_base_url)
            .unwrap_or(existing.base_url);
        let api_key_enc = update
            .api_key_enc
            .clone()
            .unwrap_or(existing.api_key_enc);
        let enabled = update.enabled.unwrap_or(existing.enabled);
        let throttle_profile_id = match update.throttle_profile_id {
            Some(p) => p,
            None => existing.throttle_profile_id,
        };

        let changed = self.conn.execute(
            "UPDATE connectors SET name = ?2, base_url = ?3, api_key_enc = ?4,
                 enabled = ?5, throttle_profile_id = ?6, updated_at = ?7
             WHERE id = ?1
               AND NOT EXISTS (SELECT 1 FROM connectors WHERE name = ?2 AND id != ?1)",
            params![id, name, base_url, api_key_enc, enabled, throttle_profile_id, fmt_ts(now)],
        )?;
        if changed == 0 {
            return Err(StoreError::Conflict(format!(
                "connector name '{name}' already exists"
            )));
        }
        self.connector(id)
    }

    /// Health transition, driven by the sync engine.
    pub fn update_connector_health(
        &mut self,
        id: i64,
        health: Health,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let changed = self.conn.execute(
            "UPDATE connectors SET health = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, health.as_str(), fmt_ts(now)],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("connector {id}")));
        }
        Ok(())
    }

    /// Side-effect of a successful sync.
    pub fn update_connector_last_sync(&mut self, id: i64, now: DateTime<Utc>) -> StoreResult<()> {
        self.conn.execute(
            "UPDATE connectors SET last_sync_at = ?2, updated_at = ?2 WHERE id = ?1",
            params![id, fmt_ts(now)],
        )?;
        Ok(())
    }

    pub fn set_queue_paused(&mut self, id: i64, paused: bool, now: DateTime<Utc>) -> StoreResult<()> {
        let changed = self.conn.execute(
            "UPDATE connectors SET queue_paused = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, paused, fmt_ts(now)],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("connector {id}")));
        }
        Ok(())
    }

    /// Atomic cascade over everything the connector owns.
    pub fn delete_connector(&mut self, id: i64) -> StoreResult<()> {
        let tx = self.conn.transaction()?;
        let removed = tx.execute("DELETE FROM connectors WHERE id = ?1", params![id])?;
        if removed == 0 {
            return Err(StoreError::NotFound(format!("connector {id}")));
        }
        for table in [
            "pending_commands",
            "search_history",
            "request_queue",
            "search_registry",
            "episodes",
            "seasons",
            "series",
            "movies",
            "throttle_state",
        ] {
            tx.execute(
                &format!("DELETE FROM {table} WHERE connector_id = ?1"),
                params![id],
            )?;
        }
        tx.execute("DELETE FROM sync_state WHERE connector_id = ?1", params![id])?;
        tx.commit()?;
        Ok(())
    }

    pub fn connector_statistics(&self, id: i64) -> StoreResult<ConnectorStatistics> {
        let gaps: i64 = self.conn.query_row(
            "SELECT (SELECT COUNT(*) FROM episodes
                      WHERE connector_id = ?1 AND monitored = 1 AND has_file = 0)
                  + (SELECT COUNT(*) FROM movies
                      WHERE connector_id = ?1 AND monitored = 1 AND has_file = 0)",
            params![id],
            |r| r.get(0),
        )?;
        let upgrades: i64 = self.conn.query_row(
            "SELECT (SELECT COUNT(*) FROM episodes
                      WHERE connector_id = ?1 AND monitored = 1 AND has_file = 1
                        AND quality_cutoff_not_met = 1)
                  + (SELECT COUNT(*) FROM movies
                      WHERE connector_id = ?1 AND monitored = 1 AND has_file = 1
                        AND quality_cutoff_not_met = 1)",
            params![id],
            |r| r.get(0),
        )?;
        let queue_depth: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM request_queue WHERE connector_id = ?1",
            params![id],
            |r| r.get(0),
        )?;
        Ok(ConnectorStatistics {
            gaps,
            upgrade_candidates: upgrades,
            queue_depth,
        })
    }

    // -----------------------------------------------------------------------
    // Sync state
    // -----------------------------------------------------------------------

    pub fn sync_state(&self, connector_id: i64) -> StoreResult<SyncState> {
        let state = self
            .conn
            .query_row(
                "SELECT last_incremental_at, last_reconcile_at, consecutive_failures
                 FROM sync_state WHERE connector_id = ?1",
                params![connector_id],
                |row| {
                    Ok(SyncState {
                        last_incremental_at: row.get(0)?,
                        last_reconcile_at: row.get(1)?,
                        consecutive_failures: row.get::<_, i64>(2)?.max(0) as u32,
                    })
                },
            )
            .optional()?;
        Ok(state.unwrap_or_default())
    }

    pub fn record_sync_success(
        &mut self,
        connector_id: i64,
        reconcile: bool,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let ts = fmt_ts(now);
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO sync_state (connector_id) VALUES (?1)",
            params![connector_id],
        )?;
        if reconcile {
            tx.execute(
                "UPDATE sync_state SET last_reconcile_at = ?2, consecutive_failures = 0
                 WHERE connector_id = ?1",
                params![connector_id, ts],
            )?;
        } else {
            tx.execute(
                "UPDATE sync_state SET last_incremental_at = ?2, consecutive_failures = 0
                 WHERE connector_id = ?1",
                params![connector_id, ts],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Bump the consecutive-failure counter; returns the new value.
    pub fn record_sync_failure(&mut self, connector_id: i64) -> StoreResult<u32> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO sync_state (connector_id) VALUES (?1)",
            params![connector_id],
        )?;
        tx.execute(
            "UPDATE sync_state SET consecutive_failures = consecutive_failures + 1
             WHERE connector_id = ?1",
            params![connector_id],
        )?;
        let failures: i64 = tx.query_row(
            "SELECT consecutive_failures FROM sync_state WHERE connector_id = ?1",
            params![connector_id],
            |r| r.get(0),
        )?;
        tx.commit()?;
        Ok(failures.max(0) as u32)
    }
}
