// src/db/models/member.rs

//! Cluster members and blob placement.
//!
//! The `nodes` table mirrors cluster membership; `images_nodes` records
//! which members hold which blob. The replication and expiry loops drive
//! their decisions off these queries.

use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use rusqlite::{params, Connection, OptionalExtension, Row};

/// A cluster member as seen by the replicated database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub id: i64,
    pub name: String,
    pub address: String,
}

impl Member {
    /// Register a member
    pub fn create(conn: &Connection, name: &str, address: &str) -> Result<i64> {
        conn.execute(
            "INSERT INTO nodes (name, address) VALUES (?1, ?2)",
            [name, address],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Error::AlreadyExists(format!("Cluster member {} already exists", name))
            }
            other => other.into(),
        })?;

        Ok(conn.last_insert_rowid())
    }

    pub fn get_by_address(conn: &Connection, address: &str) -> Result<Self> {
        conn.query_row(
            "SELECT id, name, address FROM nodes WHERE address = ?1",
            [address],
            Self::from_row,
        )
        .optional()?
        .ok_or_else(|| Error::not_found("Cluster member"))
    }

    pub fn list(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare("SELECT id, name, address FROM nodes ORDER BY id")?;
        let members = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(members)
    }

    pub fn count(conn: &Connection) -> Result<i64> {
        let count = conn.query_row("SELECT COUNT(*) FROM nodes", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Record that a member holds a blob
    pub fn add_image(conn: &Connection, fingerprint: &Fingerprint, node_id: i64) -> Result<()> {
        conn.execute(
            "INSERT INTO images_nodes (fingerprint, node_id) VALUES (?1, ?2)
             ON CONFLICT(fingerprint, node_id) DO NOTHING",
            params![fingerprint.as_str(), node_id],
        )?;
        Ok(())
    }

    /// Drop a member's claim on a blob
    pub fn remove_image(conn: &Connection, fingerprint: &Fingerprint, node_id: i64) -> Result<()> {
        conn.execute(
            "DELETE FROM images_nodes WHERE fingerprint = ?1 AND node_id = ?2",
            params![fingerprint.as_str(), node_id],
        )?;
        Ok(())
    }

    /// Drop every placement row for a blob
    pub fn remove_image_everywhere(conn: &Connection, fingerprint: &Fingerprint) -> Result<()> {
        conn.execute(
            "DELETE FROM images_nodes WHERE fingerprint = ?1",
            [fingerprint.as_str()],
        )?;
        Ok(())
    }

    /// Addresses of members holding the blob
    pub fn nodes_with_image(conn: &Connection, fingerprint: &Fingerprint) -> Result<Vec<String>> {
        let mut stmt = conn.prepare(
            "SELECT n.address FROM images_nodes inn
             JOIN nodes n ON n.id = inn.node_id
             WHERE inn.fingerprint = ?1 ORDER BY n.id",
        )?;

        let addresses = stmt
            .query_map([fingerprint.as_str()], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(addresses)
    }

    /// Addresses of members not holding the blob
    pub fn nodes_without_image(
        conn: &Connection,
        fingerprint: &Fingerprint,
    ) -> Result<Vec<String>> {
        let mut stmt = conn.prepare(
            "SELECT address FROM nodes WHERE id NOT IN
                 (SELECT node_id FROM images_nodes WHERE fingerprint = ?1)
             ORDER BY id",
        )?;

        let addresses = stmt
            .query_map([fingerprint.as_str()], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(addresses)
    }

    /// Member ids of blob holders, for deterministic owner selection
    pub fn node_ids_with_image(conn: &Connection, fingerprint: &Fingerprint) -> Result<Vec<i64>> {
        let mut stmt = conn.prepare(
            "SELECT node_id FROM images_nodes WHERE fingerprint = ?1 ORDER BY node_id",
        )?;

        let ids = stmt
            .query_map([fingerprint.as_str()], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Where to fetch a blob that is not here: the address of some holder,
    /// or None when the blob is local (or nobody has it)
    pub fn locate_blob(
        conn: &Connection,
        fingerprint: &Fingerprint,
        local_address: &str,
    ) -> Result<Option<String>> {
        let addresses = Self::nodes_with_image(conn, fingerprint)?;

        if addresses.iter().any(|a| a == local_address) {
            return Ok(None);
        }

        Ok(addresses.into_iter().next())
    }

    /// Fingerprints this member holds locally (leftover scanning)
    pub fn local_fingerprints(conn: &Connection, node_id: i64) -> Result<Vec<String>> {
        let mut stmt =
            conn.prepare("SELECT fingerprint FROM images_nodes WHERE node_id = ?1")?;

        let fingerprints = stmt
            .query_map([node_id], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(fingerprints)
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            address: row.get(2)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::fingerprint::fingerprint_bytes;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON").unwrap();
        db::schema::migrate_cluster(&conn).unwrap();
        conn
    }

    #[test]
    fn test_placement_queries() {
        let conn = test_conn();
        let n1 = Member::create(&conn, "n1", "10.0.0.1:8443").unwrap();
        let _n2 = Member::create(&conn, "n2", "10.0.0.2:8443").unwrap();
        let n3 = Member::create(&conn, "n3", "10.0.0.3:8443").unwrap();

        let fp = fingerprint_bytes(b"blob");
        Member::add_image(&conn, &fp, n1).unwrap();
        Member::add_image(&conn, &fp, n3).unwrap();
        // Re-adding is a no-op
        Member::add_image(&conn, &fp, n1).unwrap();

        assert_eq!(
            Member::nodes_with_image(&conn, &fp).unwrap(),
            vec!["10.0.0.1:8443", "10.0.0.3:8443"]
        );
        assert_eq!(
            Member::nodes_without_image(&conn, &fp).unwrap(),
            vec!["10.0.0.2:8443"]
        );
        assert_eq!(Member::node_ids_with_image(&conn, &fp).unwrap(), vec![n1, n3]);
    }

    #[test]
    fn test_locate_blob() {
        let conn = test_conn();
        let n1 = Member::create(&conn, "n1", "10.0.0.1:8443").unwrap();
        Member::create(&conn, "n2", "10.0.0.2:8443").unwrap();

        let fp = fingerprint_bytes(b"blob");
        Member::add_image(&conn, &fp, n1).unwrap();

        // Local holder: nothing to fetch
        assert_eq!(
            Member::locate_blob(&conn, &fp, "10.0.0.1:8443").unwrap(),
            None
        );

        // Remote holder
        assert_eq!(
            Member::locate_blob(&conn, &fp, "10.0.0.2:8443").unwrap(),
            Some("10.0.0.1:8443".to_string())
        );

        // Nobody holds it
        let ghost = fingerprint_bytes(b"ghost");
        assert_eq!(
            Member::locate_blob(&conn, &ghost, "10.0.0.2:8443").unwrap(),
            None
        );
    }

    #[test]
    fn test_local_fingerprints() {
        let conn = test_conn();
        let n1 = Member::create(&conn, "n1", "10.0.0.1:8443").unwrap();

        let a = fingerprint_bytes(b"a");
        let b = fingerprint_bytes(b"b");
        Member::add_image(&conn, &a, n1).unwrap();
        Member::add_image(&conn, &b, n1).unwrap();

        let mut local = Member::local_fingerprints(&conn, n1).unwrap();
        local.sort();
        let mut expected = vec![a.to_string(), b.to_string()];
        expected.sort();
        assert_eq!(local, expected);
    }
}
