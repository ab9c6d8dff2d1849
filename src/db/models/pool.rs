// src/db/models/pool.rs

//! Storage pools and per-pool image volumes.
//!
//! Pool drivers are plugins outside this crate; the image store only needs
//! to know which pools carry an optimized volume for a fingerprint so
//! maintenance can create and delete them through the driver contract.

use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use rusqlite::{params, Connection, OptionalExtension, Row};

/// Pool drivers whose storage is shared between cluster members
pub const REMOTE_DRIVERS: &[&str] = &["ceph", "cephfs", "lvmcluster"];

/// A storage pool as the image store sees it
#[derive(Debug, Clone)]
pub struct StoragePool {
    pub id: i64,
    pub name: String,
    pub driver: String,
}

impl StoragePool {
    /// Whether this pool's storage is shared across members
    pub fn is_remote(&self) -> bool {
        REMOTE_DRIVERS.contains(&self.driver.as_str())
    }

    pub fn create(conn: &Connection, name: &str, driver: &str) -> Result<i64> {
        conn.execute(
            "INSERT INTO storage_pools (name, driver) VALUES (?1, ?2)",
            [name, driver],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Error::AlreadyExists(format!("Storage pool {} already exists", name))
            }
            other => other.into(),
        })?;

        Ok(conn.last_insert_rowid())
    }

    pub fn get_by_name(conn: &Connection, name: &str) -> Result<Self> {
        conn.query_row(
            "SELECT id, name, driver FROM storage_pools WHERE name = ?1",
            [name],
            Self::from_row,
        )
        .optional()?
        .ok_or_else(|| Error::not_found("Storage pool"))
    }

    /// Record that a pool carries an optimized volume for the blob
    pub fn add_image(conn: &Connection, fingerprint: &Fingerprint, pool_id: i64) -> Result<()> {
        conn.execute(
            "INSERT INTO images_pools (fingerprint, pool_id) VALUES (?1, ?2)
             ON CONFLICT(fingerprint, pool_id) DO NOTHING",
            params![fingerprint.as_str(), pool_id],
        )?;
        Ok(())
    }

    /// Drop a pool's volume row for the blob
    pub fn remove_image(conn: &Connection, fingerprint: &Fingerprint, pool_id: i64) -> Result<()> {
        conn.execute(
            "DELETE FROM images_pools WHERE fingerprint = ?1 AND pool_id = ?2",
            params![fingerprint.as_str(), pool_id],
        )?;
        Ok(())
    }

    /// Pools carrying an optimized volume for the blob
    pub fn pools_with_image(
        conn: &Connection,
        fingerprint: &Fingerprint,
    ) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT sp.id, sp.name, sp.driver FROM images_pools ip
             JOIN storage_pools sp ON sp.id = ip.pool_id
             WHERE ip.fingerprint = ?1 ORDER BY sp.id",
        )?;

        let pools = stmt
            .query_map([fingerprint.as_str()], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(pools)
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            driver: row.get(2)?,
        })
    }
}

/// Split a `pool/volume` value (e.g. `storage.images_volume`) into its parts
pub fn split_volume(value: &str) -> Result<(String, String)> {
    match value.split_once('/') {
        Some((pool, volume)) if !pool.is_empty() && !volume.is_empty() => {
            Ok((pool.to_string(), volume.to_string()))
        }
        _ => Err(Error::Validation(format!(
            "Invalid storage volume: {}",
            value
        ))),
    }
}
