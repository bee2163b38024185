//! Durable SQLite store for the orchestrator.
//!
//! One connection per process, shared as `Arc<Mutex<Store>>`; every
//! multi-step mutation runs inside a single transaction so sweeps and
//! dispatchers can unwind at any suspension point without partial writes.
//!
//! # SQLite durability settings
//! Applied at open: WAL, synchronous=FULL, foreign_keys=ON.
//! PRAGMA integrity_check runs at open; returns error if it fails.
//!
//! Repo modules (one per table family) add `impl Store` blocks:
//! `connectors`, `content`, `registry`, `throttles`, `commands`.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use thiserror::Error;

pub mod commands;
pub mod connectors;
pub mod content;
pub mod registry;
pub mod throttles;

const SCHEMA_SQL: &str = include_str!("schema.sql");
const META_VAULT_VERIFIER: &str = "vault_verifier";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Integrity: {0}")]
    IntegrityCheckFailed(String),
    #[error("NotFound: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("InvalidValue: {0}")]
    InvalidValue(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// The orchestrator's durable store.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the store at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        let store = Store { conn };
        store.apply_pragmas()?;
        store.run_integrity_check()?;
        store.apply_schema()?;
        Ok(store)
    }

    /// Open an in-memory store (tests).
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Store { conn };
        store.apply_pragmas()?;
        store.apply_schema()?;
        Ok(store)
    }

    fn apply_pragmas(&self) -> StoreResult<()> {
        self.conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=FULL;
             PRAGMA foreign_keys=ON;",
        )?;
        Ok(())
    }

    fn run_integrity_check(&self) -> StoreResult<()> {
        let result: String = self
            .conn
            .pragma_query_value(None, "integrity_check", |row| row.get(0))?;
        if result != "ok" {
            return Err(StoreError::IntegrityCheckFailed(result));
        }
        Ok(())
    }

    fn apply_schema(&self) -> StoreResult<()> {
        self.conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Vault verifier (meta table)
    // -----------------------------------------------------------------------

    /// Stored vault verifier blob, if any.
    pub fn vault_verifier(&self) -> StoreResult<Option<Vec<u8>>> {
        let blob = self
            .conn
            .query_row(
                "SELECT value FROM meta WHERE key = ?1",
                params![META_VAULT_VERIFIER],
                |row| row.get(0),
            )
            .optional()?;
        Ok(blob)
    }

    /// Persist the vault verifier blob (first startup only; later startups
    /// check against the stored one instead of replacing it).
    pub fn save_vault_verifier(&self, blob: &[u8]) -> StoreResult<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO meta (key, value) VALUES (?1, ?2)",
            params![META_VAULT_VERIFIER, blob],
        )?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Timestamp helpers
// ---------------------------------------------------------------------------

/// Format an instant as RFC 3339 UTC with millisecond precision.
///
/// The fixed width keeps lexicographic TEXT comparison chronological,
/// which the eligibility and ordering SQL relies on.
pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored timestamp back into an instant.
pub fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn open_in_memory_applies_schema() {
        let store = Store::open_in_memory().unwrap();
        // A schema table must exist and be queryable.
        let n: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM connectors", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn open_on_disk_round_trips() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let store = Store::open(file.path()).unwrap();
        store.save_vault_verifier(b"blob-1").unwrap();
        drop(store);
        let store = Store::open(file.path()).unwrap();
        assert_eq!(store.vault_verifier().unwrap().as_deref(), Some(&b"blob-1"[..]));
    }

    #[test]
    fn vault_verifier_is_write_once() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.vault_verifier().unwrap(), None);
        store.save_vault_verifier(b"first").unwrap();
        store.save_vault_verifier(b"second").unwrap();
        assert_eq!(store.vault_verifier().unwrap().as_deref(), Some(&b"first"[..]));
    }

    #[test]
    fn timestamps_order_lexicographically() {
        let early = fmt_ts(Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap());
        let late = fmt_ts(Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 5).unwrap());
        assert!(early < late);
        assert_eq!(parse_ts(&early).unwrap().timestamp(), 1_772_355_600);
    }
}
