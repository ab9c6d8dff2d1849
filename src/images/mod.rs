// src/images/mod.rs

//! Image store: ingestion, distribution and maintenance.
//!
//! Ingestion accepts raw uploads, remote pulls, URL pulls and instance
//! publishes through one entry point; all of them hash on the fly, write
//! through the project quota, and publish atomically. Maintenance loops
//! (auto-update, expiry, leftover cleanup, replication) live in their own
//! submodules and are serialised by the daemon's image task lock.

pub mod download;
pub mod ingest;
pub mod maintenance;
pub mod publish;
pub mod replication;

use crate::db::models::{Image, ImageAlias};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

/// Project config key bounding total image spool bytes
pub const QUOTA_KEY: &str = "limits.images_space";

/// Header prefix for raw image uploads
pub mod headers {
    pub const FINGERPRINT: &str = "X-Paddock-fingerprint";
    pub const FILENAME: &str = "X-Paddock-filename";
    pub const PUBLIC: &str = "X-Paddock-public";
    pub const PROPERTIES: &str = "X-Paddock-properties";
    pub const ALIASES: &str = "X-Paddock-aliases";
    pub const PROFILES: &str = "X-Paddock-profiles";
    pub const SECRET: &str = "X-Paddock-secret";
    /// Cluster notification marker: suppresses database writes on the
    /// receiving member
    pub const NOTIFY: &str = "X-Paddock-notify";
    /// Upstream answer headers for URL pulls
    pub const IMAGE_HASH: &str = "Paddock-Image-Hash";
    pub const IMAGE_URL: &str = "Paddock-Image-URL";
}

/// `POST /1.0/images` JSON body
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImagesPost {
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub auto_update: bool,
    #[serde(default)]
    pub properties: HashMap<String, String>,
    #[serde(default)]
    pub aliases: Vec<AliasEntry>,
    #[serde(default)]
    pub profiles: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// `unified` (default) or `split`, for instance publishes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression_algorithm: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ImagesPostSource>,
}

/// Where an image comes from
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImagesPostSource {
    /// `image`, `url`, `container`, `virtual-machine`, `snapshot`
    #[serde(rename = "type", default)]
    pub source_type: String,
    /// `pull` or `push`
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub certificate: String,
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub fingerprint: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub project: String,
    /// Instance name for publish sources
    #[serde(default)]
    pub name: String,
}

/// An alias to attach on creation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AliasEntry {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Wire rendering of an image record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageInfo {
    pub fingerprint: String,
    pub filename: String,
    pub size: i64,
    pub architecture: String,
    #[serde(rename = "type")]
    pub image_type: String,
    pub public: bool,
    pub auto_update: bool,
    pub cached: bool,
    pub properties: HashMap<String, String>,
    pub aliases: Vec<AliasEntry>,
    pub profiles: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    pub uploaded_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_source: Option<UpdateSource>,
}

/// Wire rendering of an image's upstream pointer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateSource {
    pub server: String,
    pub protocol: String,
    #[serde(default)]
    pub certificate: String,
    pub alias: String,
}

impl ImageInfo {
    /// Render a record with its aliases, profiles and source attached
    pub fn from_record(conn: &rusqlite::Connection, id: i64, image: &Image) -> Result<Self> {
        let aliases = ImageAlias::list_for_image(conn, id)?
            .into_iter()
            .map(|a| AliasEntry {
                name: a.name,
                description: a.description,
            })
            .collect();

        let profiles = Image::profiles(conn, id)?;

        let update_source = match Image::get_source(conn, id) {
            Ok(source) => Some(UpdateSource {
                server: source.server,
                protocol: source.protocol,
                certificate: source.certificate,
                alias: source.alias,
            }),
            Err(ref e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };

        Ok(Self {
            fingerprint: image.fingerprint.to_string(),
            filename: image.filename.clone(),
            size: image.size,
            architecture: image.architecture.clone(),
            image_type: image.image_type.as_str().to_string(),
            public: image.public,
            auto_update: image.auto_update,
            cached: image.cached,
            properties: image.properties.clone(),
            aliases,
            profiles,
            created_at: image.created_at,
            expires_at: image.expires_at,
            last_used_at: image.last_used_at,
            uploaded_at: image.upload_date,
            update_source,
        })
    }
}

/// Per-fingerprint named mutex.
///
/// Two ingests of the same fingerprint may run concurrently up to the
/// commit point; whoever holds the lock commits, the other observes
/// already-exists.
#[derive(Clone, Default)]
pub struct ImageLocks {
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl ImageLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for a fingerprint
    pub async fn lock(&self, fingerprint: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap();
            locks
                .entry(fingerprint.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };

        lock.lock_owned().await
    }
}

/// Writer enforcing the project image-space budget
///
/// A budget below zero means unbounded. Exceeding the budget aborts the
/// write with quota-exceeded; the caller unwinds and removes its temp
/// files.
pub struct QuotaWriter<W: Write> {
    inner: W,
    budget: i64,
    written: i64,
}

impl<W: Write> QuotaWriter<W> {
    pub fn new(inner: W, budget: i64) -> Self {
        Self {
            inner,
            budget,
            written: 0,
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for QuotaWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.budget >= 0 {
            self.written += buf.len() as i64;
            if self.written > self.budget {
                return Err(io::Error::other(Error::QuotaExceeded.to_string()));
            }
        }

        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Resolve the remaining image-space budget for a project.
///
/// Charged against the sum of existing record sizes; no key or a negative
/// value means unbounded (-1).
pub fn project_image_budget(conn: &rusqlite::Connection, project: &str) -> Result<i64> {
    use crate::db::models::Project;

    let Some(value) = Project::config_get(conn, project, QUOTA_KEY)? else {
        return Ok(-1);
    };

    let quota: i64 = value
        .parse()
        .map_err(|_| Error::Validation(format!("Invalid value for {}: {}", QUOTA_KEY, value)))?;
    if quota < 0 {
        return Ok(-1);
    }

    let used: i64 = conn.query_row(
        "SELECT COALESCE(SUM(i.size), 0) FROM images i
         JOIN projects p ON p.id = i.project_id WHERE p.name = ?1",
        [project],
        |row| row.get(0),
    )?;

    Ok((quota - used).max(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::db::models::Project;

    #[tokio::test]
    async fn test_image_locks_serialise_per_fingerprint() {
        let locks = ImageLocks::new();

        let guard = locks.lock("aaaa").await;

        // A different fingerprint is not blocked
        let _other = locks.lock("bbbb").await;

        // The same fingerprint is blocked until the guard drops
        let locks2 = locks.clone();
        let contended = tokio::spawn(async move { locks2.lock("aaaa").await });
        tokio::task::yield_now().await;
        assert!(!contended.is_finished());

        drop(guard);
        contended.await.unwrap();
    }

    #[test]
    fn test_quota_writer_bounds() {
        let mut writer = QuotaWriter::new(Vec::new(), 10);
        writer.write_all(&[0u8; 10]).unwrap();
        let err = writer.write_all(&[0u8; 1]).unwrap_err();
        assert!(err.to_string().contains("quota"));
    }

    #[test]
    fn test_quota_writer_unbounded() {
        let mut writer = QuotaWriter::new(Vec::new(), -1);
        writer.write_all(&[0u8; 1024]).unwrap();
    }

    #[test]
    fn test_project_budget() {
        let dir = tempfile::tempdir().unwrap();
        let conn = db::init_cluster(dir.path().join("cluster.db")).unwrap();

        // No key: unbounded
        assert_eq!(project_image_budget(&conn, "default").unwrap(), -1);

        Project::config_set(&conn, "default", QUOTA_KEY, "1000").unwrap();
        assert_eq!(project_image_budget(&conn, "default").unwrap(), 1000);

        // Existing records are charged against the budget
        conn.execute(
            "INSERT INTO images (project_id, fingerprint, size, type) VALUES (1, 'aa', 600, 'container')",
            [],
        )
        .unwrap();
        assert_eq!(project_image_budget(&conn, "default").unwrap(), 400);
    }
}
