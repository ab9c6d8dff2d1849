// src/db/mod.rs

//! Database access for paddock.
//!
//! Two SQLite databases live under `<var>/database/`:
//!
//! - `cluster.db` - the local replica of the cluster database (images,
//!   aliases, profiles, projects, members, pools, global config). The
//!   replication engine itself is an external collaborator; this module
//!   only consumes the replica through transactions.
//! - `local.db` - node-local state: the raft configuration and per-node
//!   config keys.
//!
//! All multi-statement sequences go through [`transaction`] so a failure
//! leaves no partial rows behind.

pub mod models;
pub mod schema;

use crate::error::Result;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;

/// Cluster database file name under the database directory
pub const CLUSTER_DB: &str = "cluster.db";

/// Node-local database file name under the database directory
pub const LOCAL_DB: &str = "local.db";

/// Open a database connection with the standard pragmas
pub fn open(path: impl AsRef<Path>) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;",
    )?;
    Ok(conn)
}

/// Initialize a database: create parent directories and run migrations
pub fn init_cluster(path: impl AsRef<Path>) -> Result<Connection> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let conn = open(path)?;
    schema::migrate_cluster(&conn)?;
    Ok(conn)
}

/// Initialize the node-local database
pub fn init_local(path: impl AsRef<Path>) -> Result<Connection> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let conn = open(path)?;
    schema::migrate_local(&conn)?;
    Ok(conn)
}

/// Run a closure inside a transaction, committing on Ok and rolling back
/// on Err
pub fn transaction<T>(
    conn: &mut Connection,
    f: impl FnOnce(&rusqlite::Transaction) -> Result<T>,
) -> Result<T> {
    let tx = conn.transaction()?;
    let result = f(&tx)?;
    tx.commit()?;
    Ok(result)
}

/// Shared handle over a connection, usable from async tasks
///
/// SQLite connections are not Sync; the daemon serialises access through an
/// async mutex and runs each closure without awaiting while it is held.
#[derive(Clone)]
pub struct Db {
    conn: Arc<tokio::sync::Mutex<Connection>>,
}

impl Db {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Arc::new(tokio::sync::Mutex::new(conn)),
        }
    }

    /// Run a closure against the connection
    pub async fn with<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().await;
        f(&mut conn)
    }

    /// Run a closure inside a transaction
    pub async fn tx<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn.lock().await;
        transaction(&mut conn, f)
    }
}

/// Read a global config value from the cluster database
pub fn config_get(conn: &Connection, key: &str) -> Result<Option<String>> {
    use rusqlite::OptionalExtension;

    let value = conn
        .query_row("SELECT value FROM config WHERE key = ?1", [key], |row| {
            row.get(0)
        })
        .optional()?;

    Ok(value)
}

/// Write a global config value
pub fn config_set(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO config (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        [key, value],
    )?;
    Ok(())
}

/// Read a node-local config value from the local database
pub fn node_config_get(conn: &Connection, key: &str) -> Result<Option<String>> {
    use rusqlite::OptionalExtension;

    let value = conn
        .query_row(
            "SELECT value FROM node_config WHERE key = ?1",
            [key],
            |row| row.get(0),
        )
        .optional()?;

    Ok(value)
}

/// Write a node-local config value
pub fn node_config_set(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO node_config (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        [key, value],
    )?;
    Ok(())
}
