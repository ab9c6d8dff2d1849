// src/db/models/alias.rs

//! Per-project image aliases.
//!
//! Aliases are unique inside a project and cascade away with their target
//! record, so they never outlive the image they point at.

use crate::error::{Error, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};

/// A name → image pointer inside one project
#[derive(Debug, Clone)]
pub struct ImageAlias {
    pub id: i64,
    pub project: String,
    pub name: String,
    pub image_id: i64,
    pub description: String,
}

impl ImageAlias {
    /// Create an alias; duplicate names in a project conflict
    pub fn create(
        conn: &Connection,
        project: &str,
        name: &str,
        image_id: i64,
        description: &str,
    ) -> Result<i64> {
        let project_row = super::Project::get_by_name(conn, project)?;

        let result = conn.execute(
            "INSERT INTO image_aliases (project_id, name, image_id, description)
             VALUES (?1, ?2, ?3, ?4)",
            params![project_row.id, name, image_id, description],
        );

        match result {
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(Error::AlreadyExists(format!(
                    "Alias {} already exists",
                    name
                )))
            }
            Err(e) => Err(e.into()),
            Ok(_) => Ok(conn.last_insert_rowid()),
        }
    }

    /// Look up an alias by name
    pub fn get(conn: &Connection, project: &str, name: &str) -> Result<Self> {
        conn.query_row(
            "SELECT a.id, p.name, a.name, a.image_id, a.description
             FROM image_aliases a JOIN projects p ON p.id = a.project_id
             WHERE p.name = ?1 AND a.name = ?2",
            [project, name],
            Self::from_row,
        )
        .optional()?
        .ok_or_else(|| Error::not_found("Image alias"))
    }

    /// All aliases in a project, name-ordered
    pub fn list(conn: &Connection, project: &str) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT a.id, p.name, a.name, a.image_id, a.description
             FROM image_aliases a JOIN projects p ON p.id = a.project_id
             WHERE p.name = ?1 ORDER BY a.name",
        )?;

        let aliases = stmt
            .query_map([project], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(aliases)
    }

    /// Aliases pointing at a specific image record
    pub fn list_for_image(conn: &Connection, image_id: i64) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT a.id, p.name, a.name, a.image_id, a.description
             FROM image_aliases a JOIN projects p ON p.id = a.project_id
             WHERE a.image_id = ?1 ORDER BY a.name",
        )?;

        let aliases = stmt
            .query_map([image_id], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(aliases)
    }

    /// Re-point an alias and/or replace its description
    pub fn update(conn: &Connection, id: i64, image_id: i64, description: &str) -> Result<()> {
        conn.execute(
            "UPDATE image_aliases SET image_id = ?1, description = ?2 WHERE id = ?3",
            params![image_id, description, id],
        )?;
        Ok(())
    }

    /// Rename an alias; the new name must be free in the project
    pub fn rename(conn: &Connection, id: i64, new_name: &str) -> Result<()> {
        let result = conn.execute(
            "UPDATE image_aliases SET name = ?1 WHERE id = ?2",
            params![new_name, id],
        );

        match result {
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(Error::AlreadyExists(format!(
                    "Alias {} already exists",
                    new_name
                )))
            }
            Err(e) => Err(e.into()),
            Ok(_) => Ok(()),
        }
    }

    /// Delete by name
    pub fn delete(conn: &Connection, project: &str, name: &str) -> Result<()> {
        let alias = Self::get(conn, project, name)?;
        conn.execute("DELETE FROM image_aliases WHERE id = ?1", [alias.id])?;
        Ok(())
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project: row.get(1)?,
            name: row.get(2)?,
            image_id: row.get(3)?,
            description: row.get(4)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::db::models::Image;
    use crate::fingerprint::fingerprint_bytes;
    use crate::instance::InstanceType;

    fn test_conn_with_image() -> (Connection, i64) {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON").unwrap();
        db::schema::migrate_cluster(&conn).unwrap();

        let mut image = Image::new(
            "default",
            fingerprint_bytes(b"blob"),
            InstanceType::Container,
        );
        let id = image.insert(&conn, &[]).unwrap();
        (conn, id)
    }

    #[test]
    fn test_alias_lifecycle() {
        let (conn, image_id) = test_conn_with_image();

        ImageAlias::create(&conn, "default", "u22", image_id, "Ubuntu").unwrap();

        let alias = ImageAlias::get(&conn, "default", "u22").unwrap();
        assert_eq!(alias.image_id, image_id);
        assert_eq!(alias.description, "Ubuntu");

        ImageAlias::update(&conn, alias.id, image_id, "Ubuntu 22").unwrap();
        assert_eq!(
            ImageAlias::get(&conn, "default", "u22").unwrap().description,
            "Ubuntu 22"
        );

        ImageAlias::rename(&conn, alias.id, "ubuntu-lts").unwrap();
        assert!(ImageAlias::get(&conn, "default", "u22")
            .unwrap_err()
            .is_not_found());
        assert!(ImageAlias::get(&conn, "default", "ubuntu-lts").is_ok());

        ImageAlias::delete(&conn, "default", "ubuntu-lts").unwrap();
        assert!(ImageAlias::get(&conn, "default", "ubuntu-lts")
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_duplicate_alias_conflicts() {
        let (conn, image_id) = test_conn_with_image();

        ImageAlias::create(&conn, "default", "u22", image_id, "").unwrap();
        let err = ImageAlias::create(&conn, "default", "u22", image_id, "").unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[test]
    fn test_rename_onto_taken_name_conflicts() {
        let (conn, image_id) = test_conn_with_image();

        ImageAlias::create(&conn, "default", "one", image_id, "").unwrap();
        let two = ImageAlias::create(&conn, "default", "two", image_id, "").unwrap();

        let err = ImageAlias::rename(&conn, two, "one").unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[test]
    fn test_alias_does_not_outlive_image() {
        let (conn, image_id) = test_conn_with_image();

        ImageAlias::create(&conn, "default", "u22", image_id, "").unwrap();
        Image::delete(&conn, image_id).unwrap();

        assert!(ImageAlias::get(&conn, "default", "u22")
            .unwrap_err()
            .is_not_found());
    }
}
