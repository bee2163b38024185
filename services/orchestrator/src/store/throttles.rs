//! Throttle profiles and per-connector throttle state.
//!
//! Profiles are operator-managed parameter sets; state rows are the
//! rolling counters the gate decision reads and the dispatcher bumps.
//! State rows are only ever touched by the owning connector's single
//! dispatcher task, so a plain read-modify-write is race-free.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};

use super::{Store, StoreError, StoreResult, fmt_ts, parse_ts};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Per-connector rate-limit parameter set.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ThrottleProfile {
    pub id: i64,
    pub name: String,
    pub requests_per_minute: u32,
    pub daily_budget: Option<u32>,
    pub batch_size: u32,
    pub batch_cooldown_secs: u32,
    pub rate_limit_pause_secs: u32,
    pub is_default: bool,
}

/// Profile input; validated before it touches the table.
#[derive(Debug, Clone)]
pub struct NewThrottleProfile {
    pub name: String,
    pub requests_per_minute: u32,
    pub daily_budget: Option<u32>,
    pub batch_size: u32,
    pub batch_cooldown_secs: u32,
    pub rate_limit_pause_secs: u32,
    pub is_default: bool,
}

impl NewThrottleProfile {
    /// Conservative built-in defaults, used when no profile exists yet.
    pub fn conservative(name: &str) -> Self {
        NewThrottleProfile {
            name: name.to_owned(),
            requests_per_minute: 5,
            daily_budget: None,
            batch_size: 10,
            batch_cooldown_secs: 120,
            rate_limit_pause_secs: 900,
            is_default: true,
        }
    }

    fn validate(&self) -> StoreResult<()> {
        if self.name.trim().is_empty() {
            return Err(StoreError::InvalidValue("profile name is empty".into()));
        }
        if !(1..=60).contains(&self.requests_per_minute) {
            return Err(StoreError::InvalidValue(
                "requests_per_minute must be within 1..=60".into(),
            ));
        }
        if let Some(budget) = self.daily_budget {
            if budget < 10 {
                return Err(StoreError::InvalidValue(
                    "daily_budget must be at least 10".into(),
                ));
            }
        }
        if !(1..=50).contains(&self.batch_size) {
            return Err(StoreError::InvalidValue(
                "batch_size must be within 1..=50".into(),
            ));
        }
        if !(10..=3600).contains(&self.batch_cooldown_secs) {
            return Err(StoreError::InvalidValue(
                "batch_cooldown_secs must be within 10..=3600".into(),
            ));
        }
        if !(60..=3600).contains(&self.rate_limit_pause_secs) {
            return Err(StoreError::InvalidValue(
                "rate_limit_pause_secs must be within 60..=3600".into(),
            ));
        }
        Ok(())
    }
}

/// Rolling dispatch counters for one connector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThrottleState {
    pub minute_started_at: Option<DateTime<Utc>>,
    pub requests_this_minute: u32,
    /// UTC calendar day (`YYYY-MM-DD`) the daily counter belongs to.
    pub day: Option<String>,
    pub requests_today: u32,
    pub batch_started_at: Option<DateTime<Utc>>,
    pub requests_this_batch: u32,
    pub last_dispatch_at: Option<DateTime<Utc>>,
    pub paused_until: Option<DateTime<Utc>>,
    pub pause_reason: Option<String>,
}

fn map_profile(row: &Row<'_>) -> rusqlite::Result<ThrottleProfile> {
    Ok(ThrottleProfile {
        id: row.get("id")?,
        name: row.get("name")?,
        requests_per_minute: row.get::<_, i64>("requests_per_minute")?.max(0) as u32,
        daily_budget: row
            .get::<_, Option<i64>>("daily_budget")?
            .map(|b| b.max(0) as u32),
        batch_size: row.get::<_, i64>("batch_size")?.max(0) as u32,
        batch_cooldown_secs: row.get::<_, i64>("batch_cooldown_secs")?.max(0) as u32,
        rate_limit_pause_secs: row.get::<_, i64>("rate_limit_pause_secs")?.max(0) as u32,
        is_default: row.get("is_default")?,
    })
}

const SELECT_PROFILE: &str = "SELECT id, name, requests_per_minute, daily_budget, batch_size, \
     batch_cooldown_secs, rate_limit_pause_secs, is_default FROM throttle_profiles";

// ---------------------------------------------------------------------------
// Store impl
// ---------------------------------------------------------------------------

impl Store {
    pub fn create_throttle_profile(
        &mut self,
        new: &NewThrottleProfile,
    ) -> StoreResult<ThrottleProfile> {
        new.validate()?;
        let tx = self.conn.transaction()?;
        if new.is_default {
            tx.execute("UPDATE throttle_profiles SET is_default = 0", [])?;
        }
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO throttle_profiles
                 (name, requests_per_minute, daily_budget, batch_size,
                  batch_cooldown_secs, rate_limit_pause_secs, is_default)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                new.name,
                new.requests_per_minute,
                new.daily_budget,
                new.batch_size,
                new.batch_cooldown_secs,
                new.rate_limit_pause_secs,
                new.is_default,
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::Conflict(format!(
                "throttle profile '{}' already exists",
                new.name
            )));
        }
        let id = tx.last_insert_rowid();
        tx.commit()?;
        self.throttle_profile(id)
    }

    pub fn throttle_profile(&self, id: i64) -> StoreResult<ThrottleProfile> {
        self.conn
            .query_row(
                &format!("{SELECT_PROFILE} WHERE id = ?1"),
                params![id],
                map_profile,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("throttle profile {id}")))
    }

    pub fn list_throttle_profiles(&self) -> StoreResult<Vec<ThrottleProfile>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{SELECT_PROFILE} ORDER BY name"))?;
        let rows = stmt.query_map([], map_profile)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn update_throttle_profile(
        &mut self,
        id: i64,
        new: &NewThrottleProfile,
    ) -> StoreResult<ThrottleProfile> {
        new.validate()?;
        let tx = self.conn.transaction()?;
        if new.is_default {
            tx.execute("UPDATE throttle_profiles SET is_default = 0", [])?;
        }
        let changed = tx.execute(
            "UPDATE throttle_profiles
             SET name = ?2, requests_per_minute = ?3, daily_budget = ?4, batch_size = ?5,
                 batch_cooldown_secs = ?6, rate_limit_pause_secs = ?7, is_default = ?8
             WHERE id = ?1
               AND NOT EXISTS (SELECT 1 FROM throttle_profiles WHERE name = ?2 AND id != ?1)",
            params![
                id,
                new.name,
                new.requests_per_minute,
                new.daily_budget,
                new.batch_size,
                new.batch_cooldown_secs,
                new.rate_limit_pause_secs,
                new.is_default,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::Conflict(format!(
                "throttle profile {id} missing or name '{}' taken",
                new.name
            )));
        }
        tx.commit()?;
        self.throttle_profile(id)
    }

    /// Refused while any connector references the profile.
    pub fn delete_throttle_profile(&mut self, id: i64) -> StoreResult<()> {
        let referenced: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM connectors WHERE throttle_profile_id = ?1",
            params![id],
            |r| r.get(0),
        )?;
        if referenced > 0 {
            return Err(StoreError::Conflict(format!(
                "throttle profile {id} is referenced by {referenced} connector(s)"
            )));
        }
        let removed = self
            .conn
            .execute("DELETE FROM throttle_profiles WHERE id = ?1", params![id])?;
        if removed == 0 {
            return Err(StoreError::NotFound(format!("throttle profile {id}")));
        }
        Ok(())
    }

    /// Create the built-in default profile on first startup.
    pub fn ensure_default_profile(&mut self) -> StoreResult<ThrottleProfile> {
        let existing = self
            .conn
            .query_row(
                &format!("{SELECT_PROFILE} WHERE is_default = 1 LIMIT 1"),
                [],
                map_profile,
            )
            .optional()?;
        if let Some(profile) = existing {
            return Ok(profile);
        }
        self.create_throttle_profile(&NewThrottleProfile::conservative("default"))
    }

    /// The profile governing a connector: its explicit reference, else
    /// the default profile.
    pub fn profile_for_connector(&self, connector_id: i64) -> StoreResult<ThrottleProfile> {
        let explicit: Option<i64> = self.conn.query_row(
            "SELECT throttle_profile_id FROM connectors WHERE id = ?1",
            params![connector_id],
            |r| r.get(0),
        )?;
        if let Some(profile_id) = explicit {
            return self.throttle_profile(profile_id);
        }
        self.conn
            .query_row(
                &format!("{SELECT_PROFILE} WHERE is_default = 1 LIMIT 1"),
                [],
                map_profile,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound("default throttle profile".into()))
    }

    // -----------------------------------------------------------------------
    // Throttle state
    // -----------------------------------------------------------------------

    pub fn throttle_state(&self, connector_id: i64) -> StoreResult<ThrottleState> {
        let state = self
            .conn
            .query_row(
                "SELECT minute_started_at, requests_this_minute, day, requests_today,
                        batch_started_at, requests_this_batch, last_dispatch_at,
                        paused_until, pause_reason
                 FROM throttle_state WHERE connector_id = ?1",
                params![connector_id],
                |row| {
                    Ok(ThrottleState {
                        minute_started_at: row
                            .get::<_, Option<String>>(0)?
                            .as_deref()
                            .and_then(parse_ts),
                        requests_this_minute: row.get::<_, i64>(1)?.max(0) as u32,
                        day: row.get(2)?,
                        requests_today: row.get::<_, i64>(3)?.max(0) as u32,
                        batch_started_at: row
                            .get::<_, Option<String>>(4)?
                            .as_deref()
                            .and_then(parse_ts),
                        requests_this_batch: row.get::<_, i64>(5)?.max(0) as u32,
                        last_dispatch_at: row
                            .get::<_, Option<String>>(6)?
                            .as_deref()
                            .and_then(parse_ts),
                        paused_until: row
                            .get::<_, Option<String>>(7)?
                            .as_deref()
                            .and_then(parse_ts),
                        pause_reason: row.get(8)?,
                    })
                },
            )
            .optional()?;
        Ok(state.unwrap_or_default())
    }

    pub fn save_throttle_state(
        &mut self,
        connector_id: i64,
        state: &ThrottleState,
    ) -> StoreResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO throttle_state
                 (connector_id, minute_started_at, requests_this_minute, day, requests_today,
                  batch_started_at, requests_this_batch, last_dispatch_at,
                  paused_until, pause_reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                connector_id,
                state.minute_started_at.map(fmt_ts),
                state.requests_this_minute,
                state.day,
                state.requests_today,
                state.batch_started_at.map(fmt_ts),
                state.requests_this_batch,
                state.last_dispatch_at.map(fmt_ts),
                state.paused_until.map(fmt_ts),
                state.pause_reason,
            ],
        )?;
        Ok(())
    }

    /// Clear any active pause (operator queue reset).
    pub fn clear_throttle_pause(&mut self, connector_id: i64) -> StoreResult<()> {
        self.conn.execute(
            "UPDATE throttle_state SET paused_until = NULL, pause_reason = NULL
             WHERE connector_id = ?1",
            params![connector_id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn profile(name: &str, rpm: u32) -> NewThrottleProfile {
        NewThrottleProfile {
            name: name.to_owned(),
            requests_per_minute: rpm,
            daily_budget: Some(100),
            batch_size: 10,
            batch_cooldown_secs: 60,
            rate_limit_pause_secs: 600,
            is_default: false,
        }
    }

    #[test]
    fn profile_validation_enforces_spec_ranges() {
        let mut store = Store::open_in_memory().unwrap();
        for bad in [
            NewThrottleProfile { requests_per_minute: 0, ..profile("a", 5) },
            NewThrottleProfile { requests_per_minute: 61, ..profile("b", 5) },
            NewThrottleProfile { daily_budget: Some(9), ..profile("c", 5) },
            NewThrottleProfile { batch_size: 0, ..profile("d", 5) },
            NewThrottleProfile { batch_size: 51, ..profile("e", 5) },
            NewThrottleProfile { batch_cooldown_secs: 9, ..profile("f", 5) },
            NewThrottleProfile { batch_cooldown_secs: 3601, ..profile("g", 5) },
            NewThrottleProfile { rate_limit_pause_secs: 59, ..profile("h", 5) },
            NewThrottleProfile { rate_limit_pause_secs: 3601, ..profile("i", 5) },
        ] {
            assert!(matches!(
                store.create_throttle_profile(&bad),
                Err(StoreError::InvalidValue(_))
            ));
        }
        assert!(store.create_throttle_profile(&profile("ok", 60)).is_ok());
    }

    #[test]
    fn ensure_default_profile_is_idempotent() {
        let mut store = Store::open_in_memory().unwrap();
        let first = store.ensure_default_profile().unwrap();
        let second = store.ensure_default_profile().unwrap();
        assert_eq!(first.id, second.id);
        assert!(first.is_default);
    }

    #[test]
    fn only_one_default_at_a_time() {
        let mut store = Store::open_in_memory().unwrap();
        store.ensure_default_profile().unwrap();
        let aggressive = store
            .create_throttle_profile(&NewThrottleProfile {
                is_default: true,
                ..profile("aggressive", 30)
            })
            .unwrap();
        let defaults: Vec<ThrottleProfile> = store
            .list_throttle_profiles()
            .unwrap()
            .into_iter()
            .filter(|p| p.is_default)
            .collect();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults[0].id, aggressive.id);
    }

    #[test]
    fn delete_refused_while_referenced() {
        let mut store = Store::open_in_memory().unwrap();
        let p = store.create_throttle_profile(&profile("slow", 2)).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 0, 0, 0).unwrap();
        store
            .create_connector(
                &crate::store::connectors::NewConnector {
                    dialect: arr_api::models::Dialect::MovieRadarr,
                    name: "r".to_owned(),
                    base_url: "http://r.lan".to_owned(),
                    api_key_enc: vec![0],
                    enabled: true,
                    throttle_profile_id: Some(p.id),
                },
                now,
            )
            .unwrap();
        assert!(matches!(
            store.delete_throttle_profile(p.id),
            Err(StoreError::Conflict(_))
        ));
    }

    #[test]
    fn throttle_state_round_trips() {
        let mut store = Store::open_in_memory().unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 9, 30, 0).unwrap();
        let state = ThrottleState {
            minute_started_at: Some(now),
            requests_this_minute: 4,
            day: Some("2026-03-10".to_owned()),
            requests_today: 40,
            batch_started_at: Some(now),
            requests_this_batch: 2,
            last_dispatch_at: Some(now),
            paused_until: None,
            pause_reason: None,
        };
        store.save_throttle_state(7, &state).unwrap();
        assert_eq!(store.throttle_state(7).unwrap(), state);
        assert_eq!(store.throttle_state(8).unwrap(), ThrottleState::default());

        store.clear_throttle_pause(7).unwrap();
        assert_eq!(store.throttle_state(7).unwrap().paused_until, None);
    }
}
