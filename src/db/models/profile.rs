// src/db/models/profile.rs

//! Profiles referenced by image records.
//!
//! Only the slice the image store needs lives here: resolution by name at
//! commit time and the default profile of a project. Profile contents are
//! the instance subsystem's business.

use crate::error::{Error, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};

/// A named profile inside a project
#[derive(Debug, Clone)]
pub struct Profile {
    pub id: i64,
    pub project: String,
    pub name: String,
    pub description: Option<String>,
}

impl Profile {
    /// Create a profile, returning its id
    pub fn create(
        conn: &Connection,
        project: &str,
        name: &str,
        description: Option<&str>,
    ) -> Result<i64> {
        let project_row = super::Project::get_by_name(conn, project)?;

        conn.execute(
            "INSERT INTO profiles (project_id, name, description) VALUES (?1, ?2, ?3)",
            params![project_row.id, name, description],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Error::AlreadyExists(format!("Profile {} already exists", name))
            }
            other => other.into(),
        })?;

        Ok(conn.last_insert_rowid())
    }

    /// Resolve a profile by name in a project
    pub fn get_by_name(conn: &Connection, project: &str, name: &str) -> Result<Self> {
        conn.query_row(
            "SELECT pr.id, p.name, pr.name, pr.description
             FROM profiles pr JOIN projects p ON p.id = pr.project_id
             WHERE p.name = ?1 AND pr.name = ?2",
            [project, name],
            Self::from_row,
        )
        .optional()?
        .ok_or_else(|| Error::Validation(format!("Profile '{}' doesn't exist", name)))
    }

    /// Resolve a list of names to ids, in order; any miss fails the batch
    pub fn resolve_names(conn: &Connection, project: &str, names: &[String]) -> Result<Vec<i64>> {
        let mut ids = Vec::with_capacity(names.len());
        for name in names {
            ids.push(Self::get_by_name(conn, project, name)?.id);
        }
        Ok(ids)
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project: row.get(1)?,
            name: row.get(2)?,
            description: row.get(3)?,
        })
    }
}
