//! Persistent store.
//!
//! A single SQLite connection guarded by a mutex. All access happens inside
//! [`Store::transaction`]; repository helpers are methods on [`Tx`], so a
//! helper called from inside another helper shares its transaction instead
//! of opening a new one.
//!
//! Records are stored as JSON in a `data` column, with the fields used for
//! lookups duplicated into indexed key columns.
//!
//! The mutex is never held across an `.await`: closures passed to
//! [`Store::transaction`] are synchronous.

mod artifact;
mod batch;
mod instance;
mod network;
mod queue;
pub mod schema;
mod target;

use crate::error::{StoreError, StoreResult};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Params};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;

pub struct Store {
    conn: Mutex<Connection>,
}

/// An open transaction.
pub struct Tx<'a> {
    conn: &'a Connection,
}

impl Store {
    /// Opens (creating if needed) the database at `path` and applies pending
    /// schema migrations.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::Schema {
                    version: 0,
                    message: format!("Failed to create {}: {}", parent.display(), e),
                })?;
            }
        }

        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(mut conn: Connection) -> StoreResult<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        schema::apply(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Runs `f` inside a transaction, committing if it returns `Ok`.
    pub fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Tx<'_>) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(StoreError::from)?;
        let result = f(&Tx { conn: &*tx })?;
        tx.commit().map_err(StoreError::from)?;
        Ok(result)
    }
}

impl Tx<'_> {
    fn execute(&self, sql: &str, params: impl Params) -> StoreResult<usize> {
        Ok(self.conn.execute(sql, params)?)
    }

    /// Selects a single `data` column and decodes it.
    fn query_one<T: DeserializeOwned>(&self, sql: &str, params: impl Params) -> StoreResult<Option<T>> {
        let data: Option<String> = self
            .conn
            .query_row(sql, params, |row| row.get(0))
            .optional()?;
        data.map(|data| decode(&data)).transpose()
    }

    /// Selects a `data` column over many rows and decodes each.
    fn query_all<T: DeserializeOwned>(&self, sql: &str, params: impl Params) -> StoreResult<Vec<T>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, |row| row.get::<_, String>(0))?;
        rows.map(|row| decode(&row?)).collect()
    }

    fn count(&self, sql: &str, params: impl Params) -> StoreResult<usize> {
        let count: i64 = self.conn.query_row(sql, params, |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn encode<T: Serialize>(value: &T) -> StoreResult<String> {
    Ok(serde_json::to_string(value)?)
}

fn decode<T: DeserializeOwned>(data: &str) -> StoreResult<T> {
    Ok(serde_json::from_str(data)?)
}
