//! Content mirror: series/seasons/episodes and movies, keyed by
//! (connector, upstream id).
//!
//! Sync upserts through here and never deletes; reconcile computes the
//! set difference against the upstream listing and removes stale rows.
//! File transitions are tracked at upsert time: false→true stamps
//! `first_downloaded_at` (once) and reports the row to the caller for
//! outcome reconciliation; true→false stamps `file_lost_at` and bumps
//! `file_loss_count`.

use arr_api::models::{EpisodeResource, MovieResource, SeriesResource};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, Transaction, params};

use super::{Store, StoreResult, fmt_ts};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Discriminator for the polymorphic registry/content reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentKind {
    Episode,
    Movie,
}

impl ContentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentKind::Episode => "episode",
            ContentKind::Movie => "movie",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "episode" => Some(ContentKind::Episode),
            "movie" => Some(ContentKind::Movie),
            _ => None,
        }
    }

    fn table(self) -> &'static str {
        match self {
            ContentKind::Episode => "episodes",
            ContentKind::Movie => "movies",
        }
    }
}

/// A mirror row whose file just appeared (has_file false→true).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquiredContent {
    pub kind: ContentKind,
    pub content_id: i64,
}

/// Counters returned from a batch upsert.
#[derive(Debug, Default)]
pub struct UpsertStats {
    pub upserted: usize,
    pub acquired: Vec<AcquiredContent>,
}

/// A mirror episode row.
#[derive(Debug, Clone)]
pub struct EpisodeRow {
    pub id: i64,
    pub connector_id: i64,
    pub series_id: i64,
    pub season_id: i64,
    pub upstream_id: i64,
    pub title: String,
    pub monitored: bool,
    pub has_file: bool,
    pub quality_cutoff_not_met: bool,
    pub quality: Option<String>,
    pub first_downloaded_at: Option<String>,
    pub file_lost_at: Option<String>,
    pub file_loss_count: i64,
}

/// A mirror movie row.
#[derive(Debug, Clone)]
pub struct MovieRow {
    pub id: i64,
    pub connector_id: i64,
    pub upstream_id: i64,
    pub title: String,
    pub monitored: bool,
    pub has_file: bool,
    pub quality_cutoff_not_met: bool,
    pub quality: Option<String>,
    pub first_downloaded_at: Option<String>,
    pub file_lost_at: Option<String>,
    pub file_loss_count: i64,
}

/// Flat listing item for the admin content view (either kind).
#[derive(Debug, Clone, serde::Serialize)]
pub struct ContentItem {
    pub id: i64,
    pub connector_id: i64,
    pub kind: String,
    pub upstream_id: i64,
    pub title: String,
    pub monitored: bool,
    pub has_file: bool,
    pub quality_cutoff_not_met: bool,
    pub quality: Option<String>,
}

fn map_episode(row: &Row<'_>) -> rusqlite::Result<EpisodeRow> {
    Ok(EpisodeRow {
        id: row.get("id")?,
        connector_id: row.get("connector_id")?,
        series_id: row.get("series_id")?,
        season_id: row.get("season_id")?,
        upstream_id: row.get("upstream_id")?,
        title: row.get("title")?,
        monitored: row.get("monitored")?,
        has_file: row.get("has_file")?,
        quality_cutoff_not_met: row.get("quality_cutoff_not_met")?,
        quality: row.get("quality")?,
        first_downloaded_at: row.get("first_downloaded_at")?,
        file_lost_at: row.get("file_lost_at")?,
        file_loss_count: row.get("file_loss_count")?,
    })
}

fn map_movie(row: &Row<'_>) -> rusqlite::Result<MovieRow> {
    Ok(MovieRow {
        id: row.get("id")?,
        connector_id: row.get("connector_id")?,
        upstream_id: row.get("upstream_id")?,
        title: row.get("title")?,
        monitored: row.get("monitored")?,
        has_file: row.get("has_file")?,
        quality_cutoff_not_met: row.get("quality_cutoff_not_met")?,
        quality: row.get("quality")?,
        first_downloaded_at: row.get("first_downloaded_at")?,
        file_lost_at: row.get("file_lost_at")?,
        file_loss_count: row.get("file_loss_count")?,
    })
}

// ---------------------------------------------------------------------------
// Store impl
// ---------------------------------------------------------------------------

impl Store {
    /// Upsert a series and its season list; returns the local series id.
    pub fn upsert_series(
        &mut self,
        connector_id: i64,
        series: &SeriesResource,
    ) -> StoreResult<i64> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO series (connector_id, upstream_id, title, monitored)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (connector_id, upstream_id)
             DO UPDATE SET title = excluded.title, monitored = excluded.monitored",
            params![connector_id, series.id, series.title, series.monitored],
        )?;
        let local_id: i64 = tx.query_row(
            "SELECT id FROM series WHERE connector_id = ?1 AND upstream_id = ?2",
            params![connector_id, series.id],
            |r| r.get(0),
        )?;
        for season in &series.seasons {
            ensure_season(&tx, connector_id, local_id, season.season_number, season.monitored)?;
        }
        tx.commit()?;
        Ok(local_id)
    }

    /// Batch-upsert episodes of one series, tracking file transitions.
    pub fn upsert_episodes(
        &mut self,
        connector_id: i64,
        series_local_id: i64,
        episodes: &[EpisodeResource],
        now: DateTime<Utc>,
    ) -> StoreResult<UpsertStats> {
        let ts = fmt_ts(now);
        let mut stats = UpsertStats::default();
        let tx = self.conn.transaction()?;
        for ep in episodes {
            let season_id =
                ensure_season(&tx, connector_id, series_local_id, ep.season_number, false)?;
            let existing: Option<(i64, bool)> = tx
                .query_row(
                    "SELECT id, has_file FROM episodes
                     WHERE connector_id = ?1 AND upstream_id = ?2",
                    params![connector_id, ep.id],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;

            match existing {
                None => {
                    tx.execute(
                        "INSERT INTO episodes
                             (connector_id, series_id, season_id, upstream_id, title, monitored,
                              has_file, quality_cutoff_not_met, quality, first_downloaded_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                        params![
                            connector_id,
                            series_local_id,
                            season_id,
                            ep.id,
                            ep.title,
                            ep.monitored,
                            ep.has_file,
                            ep.quality_cutoff_not_met,
                            ep.quality_name(),
                            if ep.has_file { Some(&ts) } else { None },
                        ],
                    )?;
                }
                Some((id, had_file)) => {
                    tx.execute(
                        "UPDATE episodes SET series_id = ?2, season_id = ?3, title = ?4,
                             monitored = ?5, has_file = ?6, quality_cutoff_not_met = ?7,
                             quality = ?8,
                             first_downloaded_at = CASE
                                 WHEN ?6 AND first_downloaded_at IS NULL THEN ?9
                                 ELSE first_downloaded_at END,
                             file_lost_at = CASE
                                 WHEN ?10 AND NOT ?6 THEN ?9 ELSE file_lost_at END,
                             file_loss_count = file_loss_count + CASE
                                 WHEN ?10 AND NOT ?6 THEN 1 ELSE 0 END
                         WHERE id = ?1",
                        params![
                            id,
                            series_local_id,
                            season_id,
                            ep.title,
                            ep.monitored,
                            ep.has_file,
                            ep.quality_cutoff_not_met,
                            ep.quality_name(),
                            ts,
                            had_file,
                        ],
                    )?;
                    if !had_file && ep.has_file {
                        stats.acquired.push(AcquiredContent {
                            kind: ContentKind::Episode,
                            content_id: id,
                        });
                    }
                }
            }
            stats.upserted += 1;
        }
        tx.commit()?;
        Ok(stats)
    }

    /// Batch-upsert the movie listing, tracking file transitions.
    pub fn upsert_movies(
        &mut self,
        connector_id: i64,
        movies: &[MovieResource],
        now: DateTime<Utc>,
    ) -> StoreResult<UpsertStats> {
        let ts = fmt_ts(now);
        let mut stats = UpsertStats::default();
        let tx = self.conn.transaction()?;
        for movie in movies {
            let existing: Option<(i64, bool)> = tx
                .query_row(
                    "SELECT id, has_file FROM movies
                     WHERE connector_id = ?1 AND upstream_id = ?2",
                    params![connector_id, movie.id],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;

            match existing {
                None => {
                    tx.execute(
                        "INSERT INTO movies
                             (connector_id, upstream_id, title, monitored, has_file,
                              quality_cutoff_not_met, quality, first_downloaded_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                        params![
                            connector_id,
                            movie.id,
                            movie.title,
                            movie.monitored,
                            movie.has_file,
                            movie.quality_cutoff_not_met,
                            movie.quality_name(),
                            if movie.has_file { Some(&ts) } else { None },
                        ],
                    )?;
                }
                Some((id, had_file)) => {
                    tx.execute(
                        "UPDATE movies SET title = ?2, monitored = ?3, has_file = ?4,
                             quality_cutoff_not_met = ?5, quality = ?6,
                             first_downloaded_at = CASE
                                 WHEN ?4 AND first_downloaded_at IS NULL THEN ?7
                                 ELSE first_downloaded_at END,
                             file_lost_at = CASE
                                 WHEN ?8 AND NOT ?4 THEN ?7 ELSE file_lost_at END,
                             file_loss_count = file_loss_count + CASE
                                 WHEN ?8 AND NOT ?4 THEN 1 ELSE 0 END
                         WHERE id = ?1",
                        params![
                            id,
                            movie.title,
                            movie.monitored,
                            movie.has_file,
                            movie.quality_cutoff_not_met,
                            movie.quality_name(),
                            ts,
                            had_file,
                        ],
                    )?;
                    if !had_file && movie.has_file {
                        stats.acquired.push(AcquiredContent {
                            kind: ContentKind::Movie,
                            content_id: id,
                        });
                    }
                }
            }
            stats.upserted += 1;
        }
        tx.commit()?;
        Ok(stats)
    }

    // -----------------------------------------------------------------------
    // Reconcile support (set differences against the upstream listing)
    // -----------------------------------------------------------------------

    /// (local id, upstream id) pairs for every series of the connector.
    pub fn series_upstream_ids(&self, connector_id: i64) -> StoreResult<Vec<(i64, i64)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, upstream_id FROM series WHERE connector_id = ?1")?;
        let rows = stmt.query_map(params![connector_id], |r| Ok((r.get(0)?, r.get(1)?)))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// (local id, upstream id) pairs for episodes of one series.
    pub fn episode_upstream_ids(&self, series_local_id: i64) -> StoreResult<Vec<(i64, i64)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, upstream_id FROM episodes WHERE series_id = ?1")?;
        let rows = stmt.query_map(params![series_local_id], |r| Ok((r.get(0)?, r.get(1)?)))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// (local id, upstream id) pairs for every movie of the connector.
    pub fn movie_upstream_ids(&self, connector_id: i64) -> StoreResult<Vec<(i64, i64)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, upstream_id FROM movies WHERE connector_id = ?1")?;
        let rows = stmt.query_map(params![connector_id], |r| Ok((r.get(0)?, r.get(1)?)))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Delete series rows and their seasons/episodes; returns the local ids
    /// of the episodes that went with them (for the registry cascade).
    pub fn delete_series_cascade(&mut self, series_local_ids: &[i64]) -> StoreResult<Vec<i64>> {
        let mut episode_ids = Vec::new();
        let tx = self.conn.transaction()?;
        for chunk in series_local_ids.chunks(200) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let chunk_params = rusqlite::params_from_iter(chunk.iter());
            let mut stmt = tx.prepare(&format!(
                "SELECT id FROM episodes WHERE series_id IN ({placeholders})"
            ))?;
            let ids = stmt.query_map(chunk_params, |r| r.get::<_, i64>(0))?;
            for id in ids {
                episode_ids.push(id?);
            }
            drop(stmt);
            tx.execute(
                &format!("DELETE FROM episodes WHERE series_id IN ({placeholders})"),
                rusqlite::params_from_iter(chunk.iter()),
            )?;
            tx.execute(
                &format!("DELETE FROM seasons WHERE series_id IN ({placeholders})"),
                rusqlite::params_from_iter(chunk.iter()),
            )?;
            tx.execute(
                &format!("DELETE FROM series WHERE id IN ({placeholders})"),
                rusqlite::params_from_iter(chunk.iter()),
            )?;
        }
        tx.commit()?;
        Ok(episode_ids)
    }

    /// Delete content rows of one kind by local id.
    pub fn delete_content_rows(&mut self, kind: ContentKind, ids: &[i64]) -> StoreResult<usize> {
        let mut deleted = 0;
        let tx = self.conn.transaction()?;
        for chunk in ids.chunks(200) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            deleted += tx.execute(
                &format!("DELETE FROM {} WHERE id IN ({placeholders})", kind.table()),
                rusqlite::params_from_iter(chunk.iter()),
            )?;
        }
        tx.commit()?;
        Ok(deleted)
    }

    // -----------------------------------------------------------------------
    // Row access
    // -----------------------------------------------------------------------

    pub fn episode(&self, id: i64) -> StoreResult<Option<EpisodeRow>> {
        Ok(self
            .conn
            .query_row(
                "SELECT * FROM episodes WHERE id = ?1",
                params![id],
                map_episode,
            )
            .optional()?)
    }

    pub fn movie(&self, id: i64) -> StoreResult<Option<MovieRow>> {
        Ok(self
            .conn
            .query_row("SELECT * FROM movies WHERE id = ?1", params![id], map_movie)
            .optional()?)
    }

    /// Season number and series upstream id for an episode (season-pack
    /// dispatch needs both).
    pub fn episode_dispatch_keys(&self, id: i64) -> StoreResult<Option<(i64, i64, i64)>> {
        Ok(self
            .conn
            .query_row(
                "SELECT e.upstream_id, s.upstream_id, n.season_number
                 FROM episodes e
                 JOIN series s ON s.id = e.series_id
                 JOIN seasons n ON n.id = e.season_id
                 WHERE e.id = ?1",
                params![id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()?)
    }

    /// Flat content listing for the admin surface.
    pub fn list_content(
        &self,
        connector_id: Option<i64>,
        kind: Option<ContentKind>,
        offset: i64,
        limit: i64,
    ) -> StoreResult<Vec<ContentItem>> {
        let mut items = Vec::new();
        let take_episodes = kind.is_none_or(|k| k == ContentKind::Episode);
        let take_movies = kind.is_none_or(|k| k == ContentKind::Movie);

        if take_episodes {
            let mut stmt = self.conn.prepare(
                "SELECT id, connector_id, upstream_id, title, monitored, has_file,
                        quality_cutoff_not_met, quality
                 FROM episodes
                 WHERE (?1 IS NULL OR connector_id = ?1)
                 ORDER BY id LIMIT ?2 OFFSET ?3",
            )?;
            let rows = stmt.query_map(params![connector_id, limit, offset], |r| {
                Ok(ContentItem {
                    id: r.get(0)?,
                    connector_id: r.get(1)?,
                    kind: "episode".to_owned(),
                    upstream_id: r.get(2)?,
                    title: r.get(3)?,
                    monitored: r.get(4)?,
                    has_file: r.get(5)?,
                    quality_cutoff_not_met: r.get(6)?,
                    quality: r.get(7)?,
                })
            })?;
            for row in rows {
                items.push(row?);
            }
        }
        if take_movies {
            let mut stmt = self.conn.prepare(
                "SELECT id, connector_id, upstream_id, title, monitored, has_file,
                        quality_cutoff_not_met, quality
                 FROM movies
                 WHERE (?1 IS NULL OR connector_id = ?1)
                 ORDER BY id LIMIT ?2 OFFSET ?3",
            )?;
            let rows = stmt.query_map(params![connector_id, limit, offset], |r| {
                Ok(ContentItem {
                    id: r.get(0)?,
                    connector_id: r.get(1)?,
                    kind: "movie".to_owned(),
                    upstream_id: r.get(2)?,
                    title: r.get(3)?,
                    monitored: r.get(4)?,
                    has_file: r.get(5)?,
                    quality_cutoff_not_met: r.get(6)?,
                    quality: r.get(7)?,
                })
            })?;
            for row in rows {
                items.push(row?);
            }
        }
        Ok(items)
    }
}

/// Find-or-create a season row; episodes referencing a season the series
/// listing did not mention (e.g. specials) get an unmonitored placeholder.
fn ensure_season(
    tx: &Transaction<'_>,
    connector_id: i64,
    series_local_id: i64,
    season_number: i64,
    monitored: bool,
) -> rusqlite::Result<i64> {
    tx.execute(
        "INSERT INTO seasons (connector_id, series_id, season_number, monitored)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (connector_id, series_id, season_number)
         DO UPDATE SET monitored = excluded.monitored",
        params![connector_id, series_local_id, season_number, monitored],
    )?;
    tx.query_row(
        "SELECT id FROM seasons
         WHERE connector_id = ?1 AND series_id = ?2 AND season_number = ?3",
        params![connector_id, series_local_id, season_number],
        |r| r.get(0),
    )
}
