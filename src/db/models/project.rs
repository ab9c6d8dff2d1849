// src/db/models/project.rs

//! Projects and their configuration.

use crate::error::{Error, Result};
use rusqlite::{Connection, OptionalExtension, Row};
use std::collections::HashMap;

/// Name of the project that always exists
pub const DEFAULT_PROJECT: &str = "default";

/// A project scoping images, aliases and profiles
#[derive(Debug, Clone)]
pub struct Project {
    pub id: i64,
    pub name: String,
}

impl Project {
    /// Look up a project by name
    pub fn get_by_name(conn: &Connection, name: &str) -> Result<Self> {
        let mut stmt = conn.prepare("SELECT id, name FROM projects WHERE name = ?1")?;

        stmt.query_row([name], Self::from_row)
            .optional()?
            .ok_or_else(|| Error::not_found("Project"))
    }

    /// Create a project, returning its id
    pub fn create(conn: &Connection, name: &str) -> Result<i64> {
        conn.execute("INSERT INTO projects (name) VALUES (?1)", [name])
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(err, _)
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Error::AlreadyExists(format!("Project {} already exists", name))
                }
                other => other.into(),
            })?;

        Ok(conn.last_insert_rowid())
    }

    /// All projects
    pub fn list(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare("SELECT id, name FROM projects ORDER BY name")?;
        let projects = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(projects)
    }

    /// Read a single project config key
    pub fn config_get(conn: &Connection, name: &str, key: &str) -> Result<Option<String>> {
        let value = conn
            .query_row(
                "SELECT pc.value FROM project_config pc
                 JOIN projects p ON p.id = pc.project_id
                 WHERE p.name = ?1 AND pc.key = ?2",
                [name, key],
                |row| row.get(0),
            )
            .optional()?;

        Ok(value)
    }

    /// Write a project config key
    pub fn config_set(conn: &Connection, name: &str, key: &str, value: &str) -> Result<()> {
        let project = Self::get_by_name(conn, name)?;
        conn.execute(
            "INSERT INTO project_config (project_id, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(project_id, key) DO UPDATE SET value = excluded.value",
            rusqlite::params![project.id, key, value],
        )?;
        Ok(())
    }

    /// All config for a project
    pub fn config(conn: &Connection, name: &str) -> Result<HashMap<String, String>> {
        let mut stmt = conn.prepare(
            "SELECT pc.key, pc.value FROM project_config pc
             JOIN projects p ON p.id = pc.project_id
             WHERE p.name = ?1",
        )?;

        let mut config = HashMap::new();
        let rows = stmt.query_map([name], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (key, value) = row?;
            config.insert(key, value);
        }

        Ok(config)
    }

    /// A project-local integer setting with a global-config fallback.
    ///
    /// Used for `images.auto_update_interval` and
    /// `images.remote_cache_expiry`; the project value wins whenever set,
    /// including a zero that disables the mechanism.
    pub fn effective_i64(
        conn: &Connection,
        name: &str,
        key: &str,
        global_default: i64,
    ) -> Result<i64> {
        if let Some(value) = Self::config_get(conn, name, key)? {
            return value
                .parse()
                .map_err(|_| Error::Validation(format!("Invalid value for {}: {}", key, value)));
        }

        if let Some(value) = crate::db::config_get(conn, key)? {
            return value
                .parse()
                .map_err(|_| Error::Validation(format!("Invalid value for {}: {}", key, value)));
        }

        Ok(global_default)
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON").unwrap();
        db::schema::migrate_cluster(&conn).unwrap();
        conn
    }

    #[test]
    fn test_default_project_exists() {
        let conn = test_conn();
        let project = Project::get_by_name(&conn, DEFAULT_PROJECT).unwrap();
        assert_eq!(project.name, "default");
    }

    #[test]
    fn test_create_and_duplicate() {
        let conn = test_conn();
        Project::create(&conn, "staging").unwrap();

        let err = Project::create(&conn, "staging").unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn test_config_fallback_chain() {
        let conn = test_conn();
        Project::create(&conn, "staging").unwrap();

        // Nothing set anywhere: built-in default wins
        assert_eq!(
            Project::effective_i64(&conn, "staging", "images.remote_cache_expiry", 10).unwrap(),
            10
        );

        // Global config overrides the built-in default
        db::config_set(&conn, "images.remote_cache_expiry", "20").unwrap();
        assert_eq!(
            Project::effective_i64(&conn, "staging", "images.remote_cache_expiry", 10).unwrap(),
            20
        );

        // Project-local value wins over global
        Project::config_set(&conn, "staging", "images.remote_cache_expiry", "5").unwrap();
        assert_eq!(
            Project::effective_i64(&conn, "staging", "images.remote_cache_expiry", 10).unwrap(),
            5
        );

        // Zero at project level disables even with a global default
        Project::config_set(&conn, "staging", "images.remote_cache_expiry", "0").unwrap();
        assert_eq!(
            Project::effective_i64(&conn, "staging", "images.remote_cache_expiry", 10).unwrap(),
            0
        );
    }
}
