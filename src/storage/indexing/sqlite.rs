//! SQLite-backed index: one table per identifier space in a shared database file.
//!
//! Writes are grouped in a transaction that is opened lazily by the first
//! write and committed by [`KeyValueIndex::flush`], so a crash loses at most
//! the writes since the last checkpoint and never leaves a partial batch.

use std::path::Path;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::{rejected, KeyPolicy, KeyValueIndex, PutOutcome};
use crate::core::IndexedTriple;
use crate::error::{Error, Result};

const BUSY_TIMEOUT: Duration = Duration::from_secs(60);

fn connect(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
    Ok(conn)
}

pub struct SqliteIndex {
    conn: Connection,
    table: &'static str,
    select_sql: String,
    size: u64,
    in_transaction: bool,
    policy: KeyPolicy,
}

impl SqliteIndex {
    pub fn open(path: &Path, table: &'static str, policy: KeyPolicy) -> Result<Self> {
        let conn = connect(path)?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                key TEXT PRIMARY KEY NOT NULL,
                id INTEGER NOT NULL UNIQUE
            );"
        ))?;

        let size: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
        debug!(path = %path.display(), table, size, "opened sqlite index");

        Ok(Self {
            conn,
            table,
            select_sql: format!("SELECT id FROM {table} WHERE key = ?1"),
            size: size as u64,
            in_transaction: false,
            policy,
        })
    }

    fn lookup(&self, key: &str) -> Result<Option<u64>> {
        let mut stmt = self.conn.prepare_cached(&self.select_sql)?;
        let id: Option<i64> = stmt.query_row(params![key], |row| row.get(0)).optional()?;
        Ok(id.map(|id| id as u64))
    }

    fn begin(&mut self) -> Result<()> {
        if !self.in_transaction {
            self.conn.execute_batch("BEGIN IMMEDIATE")?;
            self.in_transaction = true;
        }
        Ok(())
    }
}

impl KeyValueIndex for SqliteIndex {
    fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.lookup(key)?.is_some())
    }

    fn get(&self, key: &str) -> Result<u64> {
        self.lookup(key)?.ok_or_else(|| Error::KeyNotFound(key.to_string()))
    }

    fn put(&mut self, key: &str, value: u64) -> Result<PutOutcome> {
        if !self.policy.accepts(key) {
            return Ok(PutOutcome::RejectedKey);
        }
        self.begin()?;

        let table = self.table;
        let inserted = self
            .conn
            .execute(&format!("INSERT OR IGNORE INTO {table} (key, id) VALUES (?1, ?2)"), params![key, value as i64])
            .map_err(|e| Error::sqlite_key(key, e))?;
        if inserted == 1 {
            self.size += 1;
            return Ok(PutOutcome::Inserted);
        }

        self.conn
            .execute(&format!("UPDATE {table} SET id = ?2 WHERE key = ?1 AND id != ?2"), params![key, value as i64])
            .map_err(|e| Error::sqlite_key(key, e))?;
        Ok(PutOutcome::AlreadyPresent)
    }

    fn put_all(&mut self, entries: &mut dyn Iterator<Item = (String, u64)>) -> Result<()> {
        self.begin()?;
        let table = self.table;
        let mut inserted = 0u64;
        {
            let mut stmt = self
                .conn
                .prepare_cached(&format!("INSERT OR IGNORE INTO {table} (key, id) VALUES (?1, ?2)"))?;
            for (key, value) in entries {
                if !self.policy.accepts(&key) {
                    return Err(rejected(&key));
                }
                inserted +=
                    stmt.execute(params![key, value as i64]).map_err(|e| Error::sqlite_key(&key, e))? as u64;
            }
        }
        self.size += inserted;
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.size)
    }

    fn flush(&mut self) -> Result<()> {
        if self.in_transaction {
            self.conn.execute_batch("COMMIT")?;
            self.in_transaction = false;
        }
        Ok(())
    }

    fn entries(&self) -> Result<Vec<(String, u64)>> {
        let mut stmt = self.conn.prepare(&format!("SELECT key, id FROM {} ORDER BY id", self.table))?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64)))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    fn policy(&self) -> &KeyPolicy {
        &self.policy
    }
}

/// `transformed_data` table receiving materialized triples next to the indexes.
pub struct TransformedTable {
    conn: Connection,
}

impl TransformedTable {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = connect(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS transformed_data (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                subject_id INTEGER NOT NULL,
                relation_id INTEGER NOT NULL,
                object_id INTEGER NOT NULL
            );",
        )?;
        Ok(Self { conn })
    }

    pub fn row_count(&self) -> Result<u64> {
        let count: i64 =
            self.conn.query_row("SELECT COUNT(*) FROM transformed_data", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Drop rows past `rows`, left over from a chunk that never completed.
    pub fn truncate(&mut self, rows: u64) -> Result<()> {
        self.conn.execute(
            "DELETE FROM transformed_data WHERE id NOT IN
                (SELECT id FROM transformed_data ORDER BY id LIMIT ?1)",
            params![rows as i64],
        )?;
        Ok(())
    }

    pub fn append(&mut self, rows: &[IndexedTriple]) -> Result<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO transformed_data (subject_id, relation_id, object_id) VALUES (?1, ?2, ?3)",
            )?;
            for row in rows {
                stmt.execute(params![row.subject as i64, row.relation as i64, row.object as i64])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}
