//! Pending upstream commands and the append-only search history.
//!
//! A pending command is the record of one dispatched search awaiting
//! outcome reconciliation. Success is observed (a later sync sees the
//! file appear), never queried; the reconciliation paths here bundle
//! history append + registry cleanup + command removal into single
//! transactions.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};

use super::content::ContentKind;
use super::registry::SearchType;
use super::{Store, StoreResult, fmt_ts};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One dispatched upstream search command.
#[derive(Debug, Clone)]
pub struct PendingCommand {
    pub id: i64,
    pub connector_id: i64,
    pub registry_id: i64,
    pub kind: ContentKind,
    pub content_id: i64,
    pub upstream_command_id: i64,
    pub dispatched_at: String,
    pub file_acquired: bool,
}

/// One terminal search outcome.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HistoryRow {
    pub id: i64,
    pub connector_id: i64,
    pub kind: String,
    pub content_id: i64,
    pub search_type: String,
    pub outcome: String,
    pub failure_category: Option<String>,
    pub elapsed_ms: Option<i64>,
    pub attempt: i64,
    pub recorded_at: String,
}

fn map_command(row: &Row<'_>) -> rusqlite::Result<PendingCommand> {
    let kind_str: String = row.get("content_kind")?;
    Ok(PendingCommand {
        id: row.get("id")?,
        connector_id: row.get("connector_id")?,
        registry_id: row.get("registry_id")?,
        kind: ContentKind::parse(&kind_str).unwrap_or(ContentKind::Episode),
        content_id: row.get("content_id")?,
        upstream_command_id: row.get("upstream_command_id")?,
        dispatched_at: row.get("dispatched_at")?,
        file_acquired: row.get("file_acquired")?,
    })
}

fn map_history(row: &Row<'_>) -> rusqlite::Result<HistoryRow> {
    Ok(HistoryRow {
        id: row.get("id")?,
        connector_id: row.get("connector_id")?,
        kind: row.get("content_kind")?,
        content_id: row.get("content_id")?,
        search_type: row.get("search_type")?,
        outcome: row.get("outcome")?,
        failure_category: row.get("failure_category")?,
        elapsed_ms: row.get("elapsed_ms")?,
        attempt: row.get("attempt")?,
        recorded_at: row.get("recorded_at")?,
    })
}

const SELECT_COMMAND: &str = "SELECT id, connector_id, registry_id, content_kind, content_id, \
     upstream_command_id, dispatched_at, file_acquired FROM pending_commands";

// ---------------------------------------------------------------------------
// Store impl
// ---------------------------------------------------------------------------

impl Store {
    pub fn insert_pending_command(
        &mut self,
        connector_id: i64,
        registry_id: i64,
        kind: ContentKind,
        content_id: i64,
        upstream_command_id: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<i64> {
        self.conn.execute(
            "INSERT INTO pending_commands
                 (connector_id, registry_id, content_kind, content_id,
                  upstream_command_id, dispatched_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                connector_id,
                registry_id,
                kind.as_str(),
                content_id,
                upstream_command_id,
                fmt_ts(now),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn pending_command(&self, id: i64) -> StoreResult<Option<PendingCommand>> {
        Ok(self
            .conn
            .query_row(
                &format!("{SELECT_COMMAND} WHERE id = ?1"),
                params![id],
                map_command,
            )
            .optional()?)
    }

    /// The oldest not-yet-acquired command for this content whose registry
    /// entry is still `searching` — the one a fresh acquisition settles.
    pub fn oldest_searching_command(
        &self,
        kind: ContentKind,
        content_id: i64,
    ) -> StoreResult<Option<PendingCommand>> {
        Ok(self
            .conn
            .query_row(
                &format!(
                    "{SELECT_COMMAND} WHERE id IN (
                         SELECT pc.id FROM pending_commands pc
                         JOIN search_registry r ON r.id = pc.registry_id
                         WHERE pc.content_kind = ?1 AND pc.content_id = ?2
                           AND pc.file_acquired = 0 AND r.state = 'searching'
                         ORDER BY pc.dispatched_at ASC, pc.id ASC
                         LIMIT 1)"
                ),
                params![kind.as_str(), content_id],
                map_command,
            )
            .optional()?)
    }

    /// Commands dispatched before `cutoff` with no acquisition yet.
    pub fn commands_dispatched_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<PendingCommand>> {
        let mut stmt = self.conn.prepare(&format!(
            "{SELECT_COMMAND} WHERE file_acquired = 0 AND dispatched_at < ?1
             ORDER BY dispatched_at ASC"
        ))?;
        let rows = stmt.query_map(params![fmt_ts(cutoff)], map_command)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // -----------------------------------------------------------------------
    // Outcome reconciliation (single-transaction bundles)
    // -----------------------------------------------------------------------

    /// Success: mark the command acquired, append a success history row,
    /// and delete the registry row, queue row, and command.
    ///
    /// Returns the recorded elapsed milliseconds.
    pub fn record_search_success(
        &mut self,
        command: &PendingCommand,
        now: DateTime<Utc>,
    ) -> StoreResult<i64> {
        let elapsed_ms = super::parse_ts(&command.dispatched_at)
            .map(|d| (now - d).num_milliseconds().max(0))
            .unwrap_or(0);
        let tx = self.conn.transaction()?;

        // Registry metadata feeds the history row; the row may already be
        // gone if a resolved-sweep raced us, in which case defaults apply.
        let (search_type, attempt): (String, i64) = tx
            .query_row(
                "SELECT search_type, attempt_count FROM search_registry WHERE id = ?1",
                params![command.registry_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?
            .unwrap_or_else(|| (SearchType::Gap.as_str().to_owned(), 0));

        let acquired = tx.execute(
            "UPDATE pending_commands SET file_acquired = 1
             WHERE id = ?1 AND file_acquired = 0",
            params![command.id],
        )?;
        if acquired == 0 {
            // Already settled by an earlier sweep; nothing more to record.
            return Ok(elapsed_ms);
        }
        tx.execute(
            "INSERT INTO search_history
                 (connector_id, content_kind, content_id, search_type, outcome,
                  elapsed_ms, attempt, recorded_at)
             VALUES (?1, ?2, ?3, ?4, 'success', ?5, ?6, ?7)",
            params![
                command.connector_id,
                command.kind.as_str(),
                command.content_id,
                search_type,
                elapsed_ms,
                attempt + 1,
                fmt_ts(now),
            ],
        )?;
        tx.execute(
            "DELETE FROM request_queue WHERE registry_id = ?1",
            params![command.registry_id],
        )?;
        tx.execute(
            "DELETE FROM search_registry WHERE id = ?1",
            params![command.registry_id],
        )?;
        tx.execute(
            "DELETE FROM pending_commands WHERE id = ?1",
            params![command.id],
        )?;
        tx.commit()?;
        Ok(elapsed_ms)
    }

    /// Timeout: append a not-found history row, move the registry entry to
    /// cooldown with attempt++, and delete the command.
    pub fn record_command_timeout(
        &mut self,
        command: &PendingCommand,
        next_eligible: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let ts = fmt_ts(now);
        let tx = self.conn.transaction()?;
        let meta: Option<(String, i64)> = tx
            .query_row(
                "SELECT search_type, attempt_count FROM search_registry WHERE id = ?1",
                params![command.registry_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let (search_type, attempt) =
            meta.unwrap_or_else(|| (SearchType::Gap.as_str().to_owned(), 0));

        tx.execute(
            "INSERT INTO search_history
                 (connector_id, content_kind, content_id, search_type, outcome,
                  failure_category, attempt, recorded_at)
             VALUES (?1, ?2, ?3, ?4, 'not-found', 'not-found', ?5, ?6)",
            params![
                command.connector_id,
                command.kind.as_str(),
                command.content_id,
                search_type,
                attempt + 1,
                ts,
            ],
        )?;
        tx.execute(
            "UPDATE search_registry
             SET state = 'cooldown', attempt_count = attempt_count + 1,
                 failure_category = 'not-found', next_eligible_at = ?2, updated_at = ?3
             WHERE id = ?1 AND state = 'searching'",
            params![command.registry_id, fmt_ts(next_eligible), ts],
        )?;
        tx.execute(
            "DELETE FROM request_queue WHERE registry_id = ?1",
            params![command.registry_id],
        )?;
        tx.execute(
            "DELETE FROM pending_commands WHERE id = ?1",
            params![command.id],
        )?;
        tx.commit()?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Search history
    // -----------------------------------------------------------------------

    /// Append a terminal outcome (exhausted, failed, …) outside the
    /// reconciliation bundles above.
    #[allow(clippy::too_many_arguments)]
    pub fn record_history(
        &mut self,
        connector_id: i64,
        kind: ContentKind,
        content_id: i64,
        search_type: SearchType,
        outcome: &str,
        failure_category: Option<&str>,
        attempt: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.conn.execute(
            "INSERT INTO search_history
                 (connector_id, content_kind, content_id, search_type, outcome,
                  failure_category, attempt, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                connector_id,
                kind.as_str(),
                content_id,
                search_type.as_str(),
                outcome,
                failure_category,
                attempt,
                fmt_ts(now),
            ],
        )?;
        Ok(())
    }

    pub fn list_history(
        &self,
        connector_id: Option<i64>,
        offset: i64,
        limit: i64,
    ) -> StoreResult<Vec<HistoryRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, connector_id, content_kind, content_id, search_type, outcome,
                    failure_category, elapsed_ms, attempt, recorded_at
             FROM search_history
             WHERE (?1 IS NULL OR connector_id = ?1)
             ORDER BY recorded_at DESC, id DESC
             LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt.query_map(params![connector_id, limit, offset], map_history)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Age-based retention prune; returns rows removed.
    pub fn prune_history_before(&mut self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        Ok(self.conn.execute(
            "DELETE FROM search_history WHERE recorded_at < ?1",
            params![fmt_ts(cutoff)],
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::registry::{SearchState, SearchType};
    use arr_api::models::Dialect;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap()
    }

    /// Store with one connector, one gap movie entry in `searching`, and
    /// one pending command; returns (store, connector, registry id, command).
    fn searching_fixture() -> (Store, i64, i64, PendingCommand) {
        let mut store = Store::open_in_memory().unwrap();
        let c = store
            .create_connector(
                &crate::store::connectors::NewConnector {
                    dialect: Dialect::MovieRadarr,
                    name: "radarr".to_owned(),
                    base_url: "http://r.lan".to_owned(),
                    api_key_enc: vec![0],
                    enabled: true,
                    throttle_profile_id: None,
                },
                now(),
            )
            .unwrap();
        store
            .upsert_movies(
                c.id,
                &[arr_api::models::MovieResource {
                    id: 1,
                    title: "m".to_owned(),
                    monitored: true,
                    has_file: false,
                    quality_cutoff_not_met: false,
                    movie_file: None,
                }],
                now(),
            )
            .unwrap();
        store
            .insert_candidates(c.id, ContentKind::Movie, SearchType::Gap, 1000, now())
            .unwrap();
        let row = store.pop_next_pending(c.id, now()).unwrap().unwrap();
        store.mark_searching(row.id, now()).unwrap();
        let command_id = store
            .insert_pending_command(c.id, row.id, ContentKind::Movie, row.content_id, 5001, now())
            .unwrap();
        let command = store.pending_command(command_id).unwrap().unwrap();
        (store, c.id, row.id, command)
    }

    #[test]
    fn oldest_searching_command_prefers_earliest_dispatch() {
        let (mut store, connector_id, registry_id, first) = searching_fixture();
        store
            .insert_pending_command(
                connector_id,
                registry_id,
                ContentKind::Movie,
                first.content_id,
                5002,
                now() + Duration::seconds(30),
            )
            .unwrap();
        let oldest = store
            .oldest_searching_command(ContentKind::Movie, first.content_id)
            .unwrap()
            .unwrap();
        assert_eq!(oldest.upstream_command_id, 5001);
    }

    #[test]
    fn success_records_history_and_deletes_registry_and_command() {
        let (mut store, connector_id, registry_id, command) = searching_fixture();
        let later = now() + Duration::seconds(90);
        let elapsed = store.record_search_success(&command, later).unwrap();
        assert_eq!(elapsed, 90_000);

        assert!(store.registry_row(registry_id).unwrap().is_none());
        assert!(store.pending_command(command.id).unwrap().is_none());
        assert!(!store.has_queue_row(registry_id).unwrap());

        let history = store.list_history(Some(connector_id), 0, 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].outcome, "success");
        assert_eq!(history[0].elapsed_ms, Some(90_000));
        assert_eq!(history[0].attempt, 1);
    }

    #[test]
    fn success_is_recorded_at_most_once() {
        let (mut store, connector_id, _registry_id, command) = searching_fixture();
        store.record_search_success(&command, now()).unwrap();
        // Settling the same command again must not add a second row.
        store.record_search_success(&command, now()).unwrap();
        let history = store.list_history(Some(connector_id), 0, 10).unwrap();
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn timeout_moves_registry_to_cooldown_and_drops_command() {
        let (mut store, connector_id, registry_id, command) = searching_fixture();
        let later = now() + Duration::hours(25);
        store
            .record_command_timeout(&command, later + Duration::seconds(600), later)
            .unwrap();

        let row = store.registry_row(registry_id).unwrap().unwrap();
        assert_eq!(row.state, SearchState::Cooldown);
        assert_eq!(row.attempt_count, 1);
        assert_eq!(row.failure_category.as_deref(), Some("not-found"));
        assert!(store.pending_command(command.id).unwrap().is_none());

        let history = store.list_history(Some(connector_id), 0, 10).unwrap();
        assert_eq!(history[0].outcome, "not-found");
    }

    #[test]
    fn timeout_sweep_selects_only_old_commands() {
        let (store, _, _, command) = searching_fixture();
        let cutoff_before = now() - Duration::hours(1);
        assert!(store.commands_dispatched_before(cutoff_before).unwrap().is_empty());
        let cutoff_after = now() + Duration::hours(24);
        let old = store.commands_dispatched_before(cutoff_after).unwrap();
        assert_eq!(old.len(), 1);
        assert_eq!(old[0].id, command.id);
    }

    #[test]
    fn history_prune_removes_old_rows() {
        let (mut store, connector_id, _, command) = searching_fixture();
        store.record_search_success(&command, now()).unwrap();
        assert_eq!(store.prune_history_before(now() - Duration::days(1)).unwrap(), 0);
        assert_eq!(store.prune_history_before(now() + Duration::days(1)).unwrap(), 1);
        assert!(store.list_history(Some(connector_id), 0, 10).unwrap().is_empty());
    }
}
