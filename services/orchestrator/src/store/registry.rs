//! Search registry and request queue.
//!
//! One row per search candidate, unique on (connector, kind, content id).
//! `content_id` is NOT a referential FK — it points into episodes or
//! movies depending on `content_kind`, and every cleanup path cascades
//! by hand per kind.
//!
//! # State machine
//! pending → queued → searching → cooldown/exhausted, with cooldown →
//! pending once the clock passes `next_eligible_at`, and deletion from
//! any state on success, content removal, or operator clear. Bulk admin
//! operations skip rows currently `searching` so they never race the
//! dispatcher.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};

use super::content::ContentKind;
use super::{Store, StoreError, StoreResult, fmt_ts};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchState {
    Pending,
    Queued,
    Searching,
    Cooldown,
    Exhausted,
}

impl SearchState {
    pub fn as_str(self) -> &'static str {
        match self {
            SearchState::Pending => "pending",
            SearchState::Queued => "queued",
            SearchState::Searching => "searching",
            SearchState::Cooldown => "cooldown",
            SearchState::Exhausted => "exhausted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SearchState::Pending),
            "queued" => Some(SearchState::Queued),
            "searching" => Some(SearchState::Searching),
            "cooldown" => Some(SearchState::Cooldown),
            "exhausted" => Some(SearchState::Exhausted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchType {
    Gap,
    Upgrade,
}

impl SearchType {
    pub fn as_str(self) -> &'static str {
        match self {
            SearchType::Gap => "gap",
            SearchType::Upgrade => "upgrade",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "gap" => Some(SearchType::Gap),
            "upgrade" => Some(SearchType::Upgrade),
            _ => None,
        }
    }
}

/// One search candidate.
#[derive(Debug, Clone)]
pub struct RegistryRow {
    pub id: i64,
    pub connector_id: i64,
    pub kind: ContentKind,
    pub content_id: i64,
    pub state: SearchState,
    pub search_type: SearchType,
    pub priority: i64,
    pub attempt_count: i64,
    pub failure_category: Option<String>,
    pub next_eligible_at: Option<String>,
    pub scheduled_at: Option<String>,
    pub season_pack_failed: bool,
    pub last_searched_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Result of a bulk admin operation; `skipped` counts rows left alone
/// because they were `searching` at the time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct BulkResult {
    pub affected: usize,
    pub skipped: usize,
}

fn map_row(row: &Row<'_>) -> rusqlite::Result<RegistryRow> {
    let kind_str: String = row.get("content_kind")?;
    let state_str: String = row.get("state")?;
    let type_str: String = row.get("search_type")?;
    Ok(RegistryRow {
        id: row.get("id")?,
        connector_id: row.get("connector_id")?,
        kind: ContentKind::parse(&kind_str).unwrap_or(ContentKind::Episode),
        content_id: row.get("content_id")?,
        state: SearchState::parse(&state_str).unwrap_or(SearchState::Pending),
        search_type: SearchType::parse(&type_str).unwrap_or(SearchType::Gap),
        priority: row.get("priority")?,
        attempt_count: row.get("attempt_count")?,
        failure_category: row.get("failure_category")?,
        next_eligible_at: row.get("next_eligible_at")?,
        scheduled_at: row.get("scheduled_at")?,
        season_pack_failed: row.get("season_pack_failed")?,
        last_searched_at: row.get("last_searched_at")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

const SELECT_ROW: &str = "SELECT id, connector_id, content_kind, content_id, state, search_type, \
     priority, attempt_count, failure_category, next_eligible_at, scheduled_at, \
     season_pack_failed, last_searched_at, created_at, updated_at FROM search_registry";

/// Mirror-table predicate per (kind, search type); used by both the
/// candidate count and the anti-join insert so they cannot drift apart.
fn candidate_predicate(search_type: SearchType) -> &'static str {
    match search_type {
        SearchType::Gap => "monitored = 1 AND has_file = 0",
        SearchType::Upgrade => "monitored = 1 AND has_file = 1 AND quality_cutoff_not_met = 1",
    }
}

fn content_table(kind: ContentKind) -> &'static str {
    match kind {
        ContentKind::Episode => "episodes",
        ContentKind::Movie => "movies",
    }
}

// ---------------------------------------------------------------------------
// Store impl
// ---------------------------------------------------------------------------

impl Store {
    pub fn registry_row(&self, id: i64) -> StoreResult<Option<RegistryRow>> {
        Ok(self
            .conn
            .query_row(&format!("{SELECT_ROW} WHERE id = ?1"), params![id], map_row)
            .optional()?)
    }

    pub fn registry_row_for_content(
        &self,
        connector_id: i64,
        kind: ContentKind,
        content_id: i64,
    ) -> StoreResult<Option<RegistryRow>> {
        Ok(self
            .conn
            .query_row(
                &format!(
                    "{SELECT_ROW} WHERE connector_id = ?1 AND content_kind = ?2 AND content_id = ?3"
                ),
                params![connector_id, kind.as_str(), content_id],
                map_row,
            )
            .optional()?)
    }

    pub fn list_registry(
        &self,
        connector_id: Option<i64>,
        state: Option<SearchState>,
        offset: i64,
        limit: i64,
    ) -> StoreResult<Vec<RegistryRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "{SELECT_ROW}
             WHERE (?1 IS NULL OR connector_id = ?1)
               AND (?2 IS NULL OR state = ?2)
             ORDER BY priority DESC, created_at ASC, id ASC
             LIMIT ?3 OFFSET ?4"
        ))?;
        let rows = stmt.query_map(
            params![connector_id, state.map(SearchState::as_str), limit, offset],
            map_row,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn count_registry_by_state(
        &self,
        connector_id: i64,
        state: SearchState,
    ) -> StoreResult<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM search_registry WHERE connector_id = ?1 AND state = ?2",
            params![connector_id, state.as_str()],
            |r| r.get(0),
        )?)
    }

    // -----------------------------------------------------------------------
    // Discovery support
    // -----------------------------------------------------------------------

    /// Mirror rows currently matching the search-type predicate.
    pub fn count_candidates(
        &self,
        connector_id: i64,
        kind: ContentKind,
        search_type: SearchType,
    ) -> StoreResult<usize> {
        let count: i64 = self.conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE connector_id = ?1 AND {}",
                content_table(kind),
                candidate_predicate(search_type),
            ),
            params![connector_id],
            |r| r.get(0),
        )?;
        Ok(count.max(0) as usize)
    }

    /// Anti-join insert of missing registry rows, `batch` at a time.
    ///
    /// Conflict-ignore absorbs races with a concurrent sweep; returns the
    /// number of rows actually created.
    pub fn insert_candidates(
        &mut self,
        connector_id: i64,
        kind: ContentKind,
        search_type: SearchType,
        batch: usize,
        now: DateTime<Utc>,
    ) -> StoreResult<usize> {
        let ts = fmt_ts(now);
        let sql = format!(
            "INSERT OR IGNORE INTO search_registry
                 (connector_id, content_kind, content_id, state, search_type,
                  priority, created_at, updated_at)
             SELECT c.connector_id, ?2, c.id, 'pending', ?3, 0, ?4, ?4
             FROM {table} c
             WHERE c.connector_id = ?1 AND {predicate}
               AND NOT EXISTS (SELECT 1 FROM search_registry r
                               WHERE r.connector_id = c.connector_id
                                 AND r.content_kind = ?2
                                 AND r.content_id = c.id)
             LIMIT ?5",
            table = content_table(kind),
            predicate = candidate_predicate(search_type),
        );
        let mut created = 0;
        loop {
            let inserted = self.conn.execute(
                &sql,
                params![connector_id, kind.as_str(), search_type.as_str(), ts, batch as i64],
            )?;
            created += inserted;
            if inserted == 0 {
                break;
            }
        }
        Ok(created)
    }

    /// Delete registry rows whose candidate condition no longer holds.
    ///
    /// Gap rows go as soon as the content has a file. Upgrade rows go
    /// once the cutoff is met, but only after at least one search has
    /// been issued (`last_searched_at` set) so fresh entries are not
    /// reaped before the dispatcher ever saw them.
    pub fn delete_resolved(
        &mut self,
        connector_id: i64,
        kind: ContentKind,
        search_type: SearchType,
    ) -> StoreResult<usize> {
        let resolved_predicate = match search_type {
            SearchType::Gap => "has_file = 1",
            SearchType::Upgrade => "quality_cutoff_not_met = 0",
        };
        let searched_guard = match search_type {
            SearchType::Gap => "",
            SearchType::Upgrade => "AND last_searched_at IS NOT NULL",
        };
        let tx = self.conn.transaction()?;
        let sql = format!(
            "SELECT id FROM search_registry
             WHERE connector_id = ?1 AND content_kind = ?2 AND search_type = ?3
               {searched_guard}
               AND content_id IN (SELECT id FROM {table}
                                  WHERE connector_id = ?1 AND {resolved_predicate})",
            table = content_table(kind),
        );
        let ids: Vec<i64> = {
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt.query_map(
                params![connector_id, kind.as_str(), search_type.as_str()],
                |r| r.get(0),
            )?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        for id in &ids {
            tx.execute("DELETE FROM request_queue WHERE registry_id = ?1", params![id])?;
            tx.execute("DELETE FROM search_registry WHERE id = ?1", params![id])?;
        }
        tx.commit()?;
        Ok(ids.len())
    }

    /// Hand-rolled cascade when content rows disappear (reconcile).
    pub fn delete_registry_for_content(
        &mut self,
        kind: ContentKind,
        content_ids: &[i64],
    ) -> StoreResult<usize> {
        let mut deleted = 0;
        let tx = self.conn.transaction()?;
        for chunk in content_ids.chunks(200) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            tx.execute(
                &format!(
                    "DELETE FROM request_queue WHERE registry_id IN
                         (SELECT id FROM search_registry
                          WHERE content_kind = '{}' AND content_id IN ({placeholders}))",
                    kind.as_str(),
                ),
                rusqlite::params_from_iter(chunk.iter()),
            )?;
            tx.execute(
                &format!(
                    "DELETE FROM pending_commands
                     WHERE content_kind = '{}' AND content_id IN ({placeholders})",
                    kind.as_str(),
                ),
                rusqlite::params_from_iter(chunk.iter()),
            )?;
            deleted += tx.execute(
                &format!(
                    "DELETE FROM search_registry
                     WHERE content_kind = '{}' AND content_id IN ({placeholders})",
                    kind.as_str(),
                ),
                rusqlite::params_from_iter(chunk.iter()),
            )?;
        }
        tx.commit()?;
        Ok(deleted)
    }

    // -----------------------------------------------------------------------
    // Dispatch-side transitions
    // -----------------------------------------------------------------------

    /// Pop the next dispatchable entry: select, mark queued, and create
    /// the request-queue row in one transaction.
    ///
    /// Selection order: priority DESC, scheduled_at ASC NULLS LAST,
    /// created_at ASC; insertion order breaks remaining ties.
    pub fn pop_next_pending(
        &mut self,
        connector_id: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<RegistryRow>> {
        let ts = fmt_ts(now);
        let tx = self.conn.transaction()?;
        let row = tx
            .query_row(
                &format!(
                    "{SELECT_ROW}
                     WHERE connector_id = ?1 AND state = 'pending'
                       AND (next_eligible_at IS NULL OR next_eligible_at <= ?2)
                       AND (scheduled_at IS NULL OR scheduled_at <= ?2)
                     ORDER BY priority DESC, scheduled_at ASC NULLS LAST,
                              created_at ASC, id ASC
                     LIMIT 1"
                ),
                params![connector_id, ts],
                map_row,
            )
            .optional()?;
        let Some(mut row) = row else {
            return Ok(None);
        };
        tx.execute(
            "UPDATE search_registry SET state = 'queued', updated_at = ?2 WHERE id = ?1",
            params![row.id, ts],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO request_queue
                 (registry_id, connector_id, priority, scheduled_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![row.id, row.connector_id, row.priority, row.scheduled_at, ts],
        )?;
        tx.commit()?;
        row.state = SearchState::Queued;
        Ok(Some(row))
    }

    /// Roll a queued entry back to pending, parked until `until`
    /// (throttle deny path). The queue row is removed.
    pub fn defer_entry(
        &mut self,
        registry_id: i64,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "UPDATE search_registry SET state = 'pending', scheduled_at = ?2, updated_at = ?3
             WHERE id = ?1 AND state = 'queued'",
            params![registry_id, fmt_ts(until), fmt_ts(now)],
        )?;
        tx.execute(
            "DELETE FROM request_queue WHERE registry_id = ?1",
            params![registry_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// queued → searching, stamping `last_searched_at`.
    pub fn mark_searching(&mut self, registry_id: i64, now: DateTime<Utc>) -> StoreResult<()> {
        let ts = fmt_ts(now);
        let changed = self.conn.execute(
            "UPDATE search_registry
             SET state = 'searching', scheduled_at = NULL, last_searched_at = ?2, updated_at = ?2
             WHERE id = ?1 AND state = 'queued'",
            params![registry_id, ts],
        )?;
        if changed == 0 {
            return Err(StoreError::InvalidValue(format!(
                "registry {registry_id} is not queued"
            )));
        }
        Ok(())
    }

    /// searching → cooldown with back-off; attempt counter bumps.
    pub fn mark_cooldown(
        &mut self,
        registry_id: i64,
        next_eligible: DateTime<Utc>,
        failure_category: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "UPDATE search_registry
             SET state = 'cooldown', attempt_count = attempt_count + 1,
                 failure_category = ?2, next_eligible_at = ?3, updated_at = ?4
             WHERE id = ?1",
            params![registry_id, failure_category, fmt_ts(next_eligible), fmt_ts(now)],
        )?;
        tx.execute(
            "DELETE FROM request_queue WHERE registry_id = ?1",
            params![registry_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Terminal failure: attempt ceiling or non-retryable rejection.
    pub fn mark_exhausted(
        &mut self,
        registry_id: i64,
        failure_category: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "UPDATE search_registry
             SET state = 'exhausted', attempt_count = attempt_count + 1,
                 failure_category = ?2, next_eligible_at = NULL, updated_at = ?3
             WHERE id = ?1",
            params![registry_id, failure_category, fmt_ts(now)],
        )?;
        tx.execute(
            "DELETE FROM request_queue WHERE registry_id = ?1",
            params![registry_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// cooldown → pending for every entry whose clock has passed.
    pub fn release_cooldowns(&mut self, connector_id: i64, now: DateTime<Utc>) -> StoreResult<usize> {
        let ts = fmt_ts(now);
        let released = self.conn.execute(
            "UPDATE search_registry
             SET state = 'pending', updated_at = ?2
             WHERE connector_id = ?1 AND state = 'cooldown' AND next_eligible_at <= ?2",
            params![connector_id, ts],
        )?;
        Ok(released)
    }

    /// Remember that a season-pack search was rejected for this entry.
    pub fn set_season_pack_failed(&mut self, registry_id: i64, now: DateTime<Utc>) -> StoreResult<()> {
        self.conn.execute(
            "UPDATE search_registry SET season_pack_failed = 1, updated_at = ?2 WHERE id = ?1",
            params![registry_id, fmt_ts(now)],
        )?;
        Ok(())
    }

    /// Success path: the registry row ceases to exist.
    pub fn delete_registry_row(&mut self, registry_id: i64) -> StoreResult<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM request_queue WHERE registry_id = ?1",
            params![registry_id],
        )?;
        tx.execute(
            "DELETE FROM search_registry WHERE id = ?1",
            params![registry_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Operator / bulk operations (all skip rows currently `searching`)
    // -----------------------------------------------------------------------

    /// Operator "clear failed searches": exhausted/cooldown → pending with
    /// counters reset.
    pub fn clear_failed(&mut self, connector_id: i64, now: DateTime<Utc>) -> StoreResult<usize> {
        let cleared = self.conn.execute(
            "UPDATE search_registry
             SET state = 'pending', attempt_count = 0, failure_category = NULL,
                 next_eligible_at = NULL, season_pack_failed = 0, updated_at = ?2
             WHERE connector_id = ?1 AND state IN ('exhausted','cooldown')",
            params![connector_id, fmt_ts(now)],
        )?;
        Ok(cleared)
    }

    pub fn bulk_set_priority(
        &mut self,
        ids: &[i64],
        priority: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<BulkResult> {
        let priority = priority.clamp(0, 100);
        self.bulk_update(
            ids,
            "UPDATE search_registry SET priority = ?2, updated_at = ?3
             WHERE id = ?1 AND state != 'searching'",
            |tx, id| {
                tx.execute(
                    "UPDATE request_queue SET priority = ?2 WHERE registry_id = ?1",
                    params![id, priority],
                )?;
                Ok(())
            },
            priority,
            now,
        )
    }

    /// Force entries to the front of the line: pending immediately,
    /// with any park/back-off timestamps cleared.
    pub fn bulk_queue_now(&mut self, ids: &[i64], now: DateTime<Utc>) -> StoreResult<BulkResult> {
        let ts = fmt_ts(now);
        let mut affected = 0;
        let mut skipped = 0;
        let tx = self.conn.transaction()?;
        for &id in ids {
            let changed = tx.execute(
                "UPDATE search_registry
                 SET state = 'pending', next_eligible_at = NULL, scheduled_at = NULL,
                     updated_at = ?2
                 WHERE id = ?1 AND state != 'searching'",
                params![id, ts],
            )?;
            if changed == 0 {
                skipped += 1;
            } else {
                affected += 1;
                tx.execute("DELETE FROM request_queue WHERE registry_id = ?1", params![id])?;
            }
        }
        tx.commit()?;
        Ok(BulkResult { affected, skipped })
    }

    pub fn bulk_exhaust(&mut self, ids: &[i64], now: DateTime<Utc>) -> StoreResult<BulkResult> {
        let ts = fmt_ts(now);
        let mut affected = 0;
        let mut skipped = 0;
        let tx = self.conn.transaction()?;
        for &id in ids {
            let changed = tx.execute(
                "UPDATE search_registry
                 SET state = 'exhausted', next_eligible_at = NULL, updated_at = ?2
                 WHERE id = ?1 AND state != 'searching'",
                params![id, ts],
            )?;
            if changed == 0 {
                skipped += 1;
            } else {
                affected += 1;
                tx.execute("DELETE FROM request_queue WHERE registry_id = ?1", params![id])?;
            }
        }
        tx.commit()?;
        Ok(BulkResult { affected, skipped })
    }

    /// Operator clear: delete entries outright (never while searching).
    pub fn bulk_clear(&mut self, ids: &[i64]) -> StoreResult<BulkResult> {
        let mut affected = 0;
        let mut skipped = 0;
        let tx = self.conn.transaction()?;
        for &id in ids {
            let removed = tx.execute(
                "DELETE FROM search_registry WHERE id = ?1 AND state != 'searching'",
                params![id],
            )?;
            if removed == 0 {
                skipped += 1;
            } else {
                affected += 1;
                tx.execute("DELETE FROM request_queue WHERE registry_id = ?1", params![id])?;
            }
        }
        tx.commit()?;
        Ok(BulkResult { affected, skipped })
    }

    /// Per-connector queue clear: drop every non-searching registry row
    /// and its queue entry.
    pub fn clear_connector_queue(&mut self, connector_id: i64) -> StoreResult<usize> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM request_queue
             WHERE connector_id = ?1
               AND registry_id NOT IN (SELECT id FROM search_registry
                                       WHERE connector_id = ?1 AND state = 'searching')",
            params![connector_id],
        )?;
        let removed = tx.execute(
            "DELETE FROM search_registry WHERE connector_id = ?1 AND state != 'searching'",
            params![connector_id],
        )?;
        tx.commit()?;
        Ok(removed)
    }

    fn bulk_update(
        &mut self,
        ids: &[i64],
        sql: &str,
        mut also: impl FnMut(&rusqlite::Transaction<'_>, i64) -> StoreResult<()>,
        value: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<BulkResult> {
        let ts = fmt_ts(now);
        let mut affected = 0;
        let mut skipped = 0;
        let tx = self.conn.transaction()?;
        for &id in ids {
            let changed = tx.execute(sql, params![id, value, ts])?;
            if changed == 0 {
                skipped += 1;
            } else {
                affected += 1;
                also(&tx, id)?;
            }
        }
        tx.commit()?;
        Ok(BulkResult { affected, skipped })
    }

    // -----------------------------------------------------------------------
    // Queue depth
    // -----------------------------------------------------------------------

    pub fn queue_depth(&self, connector_id: i64) -> StoreResult<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM request_queue WHERE connector_id = ?1",
            params![connector_id],
            |r| r.get(0),
        )?)
    }

    /// True when the registry row has a live queue row (queued/searching).
    pub fn has_queue_row(&self, registry_id: i64) -> StoreResult<bool> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM request_queue WHERE registry_id = ?1",
            params![registry_id],
            |r| r.get(0),
        )?;
        Ok(n > 0)
    }
}
