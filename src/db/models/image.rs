// src/db/models/image.rs

//! Image records and the per-project image store.
//!
//! A record exists per (project, fingerprint); the blob on disk is shared.
//! Creation inserts the record, its properties, its profile links and the
//! optional upstream source pointer in one transaction so a failure leaves
//! no dangling rows.

use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::instance::InstanceType;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::str::FromStr;

/// Upstream pointer for a remote-origin image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSource {
    pub server: String,
    pub protocol: String,
    pub certificate: String,
    pub alias: String,
}

/// An image record in one project
#[derive(Debug, Clone)]
pub struct Image {
    pub id: Option<i64>,
    pub project: String,
    pub fingerprint: Fingerprint,
    pub filename: String,
    pub size: i64,
    pub public: bool,
    pub auto_update: bool,
    pub cached: bool,
    pub architecture: String,
    pub image_type: InstanceType,
    pub created_at: Option<DateTime<Utc>>,
    /// None means the image never expires
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub upload_date: DateTime<Utc>,
    pub properties: HashMap<String, String>,
}

/// Filter for image queries; None fields match everything
#[derive(Debug, Clone, Default)]
pub struct ImageFilter {
    pub project: Option<String>,
    pub public: Option<bool>,
    pub auto_update: Option<bool>,
    pub cached: Option<bool>,
}

const IMAGE_COLUMNS: &str = "i.id, p.name, i.fingerprint, i.filename, i.size, i.public, \
     i.auto_update, i.cached, i.architecture, i.type, i.created_at, i.expires_at, \
     i.last_used_at, i.upload_date";

impl Image {
    /// Build a fresh record; `insert` fills in the id
    pub fn new(project: &str, fingerprint: Fingerprint, image_type: InstanceType) -> Self {
        Self {
            id: None,
            project: project.to_string(),
            fingerprint,
            filename: String::new(),
            size: 0,
            public: false,
            auto_update: false,
            cached: false,
            architecture: String::new(),
            image_type,
            created_at: None,
            expires_at: None,
            last_used_at: None,
            upload_date: Utc::now(),
            properties: HashMap::new(),
        }
    }

    /// Insert the record plus properties and profile links.
    ///
    /// `profile_ids` must already resolve in the record's project; pass the
    /// project's default profile id when the caller has no explicit list.
    pub fn insert(&mut self, conn: &Connection, profile_ids: &[i64]) -> Result<i64> {
        let project = super::Project::get_by_name(conn, &self.project)?;

        let result = conn.execute(
            "INSERT INTO images (project_id, fingerprint, filename, size, public, auto_update,
                                 cached, architecture, type, created_at, expires_at, last_used_at,
                                 upload_date)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                project.id,
                self.fingerprint.as_str(),
                self.filename,
                self.size,
                self.public,
                self.auto_update,
                self.cached,
                self.architecture,
                self.image_type.as_str(),
                self.created_at.map(ts),
                self.expires_at.map(ts),
                self.last_used_at.map(ts),
                ts(self.upload_date),
            ],
        );

        match result {
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(Error::AlreadyExists(format!(
                    "Image with same fingerprint already exists: {}",
                    self.fingerprint
                )));
            }
            Err(e) => return Err(e.into()),
            Ok(_) => {}
        }

        let id = conn.last_insert_rowid();
        self.id = Some(id);

        for (key, value) in &self.properties {
            conn.execute(
                "INSERT INTO image_properties (image_id, key, value) VALUES (?1, ?2, ?3)",
                params![id, key, value],
            )?;
        }

        for (order, profile_id) in profile_ids.iter().enumerate() {
            conn.execute(
                "INSERT INTO image_profiles (image_id, profile_id, sort_order) VALUES (?1, ?2, ?3)",
                params![id, profile_id, order as i64],
            )?;
        }

        Ok(id)
    }

    /// Attach the upstream source pointer
    pub fn set_source(conn: &Connection, image_id: i64, source: &ImageSource) -> Result<()> {
        conn.execute(
            "INSERT INTO image_source (image_id, server, protocol, certificate, alias)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(image_id) DO UPDATE SET
                server = excluded.server, protocol = excluded.protocol,
                certificate = excluded.certificate, alias = excluded.alias",
            params![
                image_id,
                source.server,
                source.protocol,
                source.certificate,
                source.alias
            ],
        )?;
        Ok(())
    }

    /// The upstream source pointer, if this is a remote-origin image
    pub fn get_source(conn: &Connection, image_id: i64) -> Result<ImageSource> {
        conn.query_row(
            "SELECT server, protocol, certificate, alias FROM image_source WHERE image_id = ?1",
            [image_id],
            |row| {
                Ok(ImageSource {
                    server: row.get(0)?,
                    protocol: row.get(1)?,
                    certificate: row.get(2)?,
                    alias: row.get(3)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| Error::not_found("Image source"))
    }

    /// Look up by exact fingerprint in a project
    pub fn get(conn: &Connection, project: &str, fingerprint: &Fingerprint) -> Result<(i64, Self)> {
        let query = format!(
            "SELECT {IMAGE_COLUMNS} FROM images i JOIN projects p ON p.id = i.project_id
             WHERE p.name = ?1 AND i.fingerprint = ?2"
        );

        let row = conn
            .query_row(&query, params![project, fingerprint.as_str()], Self::from_row)
            .optional()?
            .ok_or_else(|| Error::not_found("Image"))?;

        Self::finish(conn, row)
    }

    /// Look up by unique fingerprint prefix in a project.
    ///
    /// Ambiguous prefixes are a validation error; missing ones not-found.
    pub fn get_by_prefix(
        conn: &Connection,
        project: &str,
        prefix: &str,
        public_only: bool,
    ) -> Result<(i64, Self)> {
        Fingerprint::validate_prefix(prefix)?;

        let mut query = format!(
            "SELECT {IMAGE_COLUMNS} FROM images i JOIN projects p ON p.id = i.project_id
             WHERE p.name = ?1 AND i.fingerprint LIKE ?2"
        );
        if public_only {
            query.push_str(" AND i.public = 1");
        }

        let pattern = format!("{}%", prefix.to_lowercase());
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt
            .query_map(params![project, pattern], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        match rows.len() {
            0 => Err(Error::not_found("Image")),
            1 => Self::finish(conn, rows.into_iter().next().unwrap()),
            _ => Err(Error::Validation(format!(
                "More than one image matches the prefix {}",
                prefix
            ))),
        }
    }

    /// Whether the record exists in this project
    pub fn exists(conn: &Connection, project: &str, fingerprint: &Fingerprint) -> Result<bool> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM images i JOIN projects p ON p.id = i.project_id
             WHERE p.name = ?1 AND i.fingerprint = ?2",
            params![project, fingerprint.as_str()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Whether any project references the fingerprint
    pub fn exists_anywhere(conn: &Connection, fingerprint: &Fingerprint) -> Result<bool> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM images WHERE fingerprint = ?1",
            [fingerprint.as_str()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// True when a project other than the given one also holds a record
    /// for this fingerprint - deleting then only drops the local record
    pub fn referenced_by_other_projects(
        conn: &Connection,
        project: &str,
        fingerprint: &Fingerprint,
    ) -> Result<bool> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM images i JOIN projects p ON p.id = i.project_id
             WHERE i.fingerprint = ?1 AND p.name != ?2",
            params![fingerprint.as_str(), project],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// List images matching a filter, properties included
    pub fn list(conn: &Connection, filter: &ImageFilter) -> Result<Vec<Self>> {
        let mut query = format!(
            "SELECT {IMAGE_COLUMNS} FROM images i JOIN projects p ON p.id = i.project_id WHERE 1=1"
        );
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(project) = &filter.project {
            params_vec.push(Box::new(project.clone()));
            query.push_str(&format!(" AND p.name = ?{}", params_vec.len()));
        }
        if let Some(public) = filter.public {
            params_vec.push(Box::new(public));
            query.push_str(&format!(" AND i.public = ?{}", params_vec.len()));
        }
        if let Some(auto_update) = filter.auto_update {
            params_vec.push(Box::new(auto_update));
            query.push_str(&format!(" AND i.auto_update = ?{}", params_vec.len()));
        }
        if let Some(cached) = filter.cached {
            params_vec.push(Box::new(cached));
            query.push_str(&format!(" AND i.cached = ?{}", params_vec.len()));
        }

        query.push_str(" ORDER BY i.fingerprint");

        let mut stmt = conn.prepare(&query)?;
        let rows = stmt
            .query_map(
                rusqlite::params_from_iter(params_vec.iter().map(|p| p.as_ref())),
                Self::from_row,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut images = Vec::with_capacity(rows.len());
        for row in rows {
            images.push(Self::finish(conn, row)?.1);
        }
        Ok(images)
    }

    /// Group matching records by fingerprint, for the maintenance loops
    pub fn grouped_by_fingerprint(
        conn: &Connection,
        filter: &ImageFilter,
    ) -> Result<HashMap<String, Vec<Self>>> {
        let mut grouped: HashMap<String, Vec<Self>> = HashMap::new();
        for image in Self::list(conn, filter)? {
            grouped
                .entry(image.fingerprint.to_string())
                .or_default()
                .push(image);
        }
        Ok(grouped)
    }

    /// Delete a record; aliases, properties, links and source cascade
    pub fn delete(conn: &Connection, id: i64) -> Result<()> {
        conn.execute("DELETE FROM images WHERE id = ?1", [id])?;
        Ok(())
    }

    /// Replace the mutable fields of a record
    pub fn update(
        &self,
        conn: &Connection,
        id: i64,
        profile_ids: Option<&[i64]>,
    ) -> Result<()> {
        conn.execute(
            "UPDATE images SET filename = ?1, size = ?2, public = ?3, auto_update = ?4,
                               architecture = ?5, created_at = ?6, expires_at = ?7
             WHERE id = ?8",
            params![
                self.filename,
                self.size,
                self.public,
                self.auto_update,
                self.architecture,
                self.created_at.map(ts),
                self.expires_at.map(ts),
                id
            ],
        )?;

        conn.execute("DELETE FROM image_properties WHERE image_id = ?1", [id])?;
        for (key, value) in &self.properties {
            conn.execute(
                "INSERT INTO image_properties (image_id, key, value) VALUES (?1, ?2, ?3)",
                params![id, key, value],
            )?;
        }

        if let Some(profile_ids) = profile_ids {
            conn.execute("DELETE FROM image_profiles WHERE image_id = ?1", [id])?;
            for (order, profile_id) in profile_ids.iter().enumerate() {
                conn.execute(
                    "INSERT INTO image_profiles (image_id, profile_id, sort_order)
                     VALUES (?1, ?2, ?3)",
                    params![id, profile_id, order as i64],
                )?;
            }
        }

        Ok(())
    }

    /// Stamp the last-used date
    pub fn update_last_use_date(
        conn: &Connection,
        project: &str,
        fingerprint: &Fingerprint,
        when: DateTime<Utc>,
    ) -> Result<()> {
        conn.execute(
            "UPDATE images SET last_used_at = ?1
             WHERE fingerprint = ?2
               AND project_id = (SELECT id FROM projects WHERE name = ?3)",
            params![ts(when), fingerprint.as_str(), project],
        )?;
        Ok(())
    }

    /// Mark cached and stamp the last-used date in one go (auto-update
    /// stitching)
    pub fn set_cached_and_last_use_date(
        conn: &Connection,
        project: &str,
        fingerprint: &Fingerprint,
        when: DateTime<Utc>,
    ) -> Result<()> {
        conn.execute(
            "UPDATE images SET cached = 1, last_used_at = ?1
             WHERE fingerprint = ?2
               AND project_id = (SELECT id FROM projects WHERE name = ?3)",
            params![ts(when), fingerprint.as_str(), project],
        )?;
        Ok(())
    }

    /// Ordered profile names linked to a record
    pub fn profiles(conn: &Connection, image_id: i64) -> Result<Vec<String>> {
        let mut stmt = conn.prepare(
            "SELECT pr.name FROM image_profiles ip
             JOIN profiles pr ON pr.id = ip.profile_id
             WHERE ip.image_id = ?1 ORDER BY ip.sort_order",
        )?;

        let names = stmt
            .query_map([image_id], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(names)
    }

    /// Re-point every alias of the old record at the new one
    pub fn move_aliases(conn: &Connection, old_id: i64, new_id: i64) -> Result<()> {
        conn.execute(
            "UPDATE image_aliases SET image_id = ?1 WHERE image_id = ?2",
            [new_id, old_id],
        )?;
        Ok(())
    }

    /// Copy the old record's profile links onto the new record, replacing
    /// whatever the new record had
    pub fn copy_default_profiles(conn: &Connection, old_id: i64, new_id: i64) -> Result<()> {
        conn.execute("DELETE FROM image_profiles WHERE image_id = ?1", [new_id])?;
        conn.execute(
            "INSERT INTO image_profiles (image_id, profile_id, sort_order)
             SELECT ?1, profile_id, sort_order FROM image_profiles WHERE image_id = ?2",
            [new_id, old_id],
        )?;
        Ok(())
    }

    fn from_row(row: &Row) -> rusqlite::Result<(i64, Self)> {
        let fingerprint: String = row.get(2)?;
        let type_str: String = row.get(9)?;

        let image = Self {
            id: Some(row.get(0)?),
            project: row.get(1)?,
            fingerprint: Fingerprint::new(fingerprint).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    2,
                    rusqlite::types::Type::Text,
                    Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())),
                )
            })?,
            filename: row.get(3)?,
            size: row.get(4)?,
            public: row.get(5)?,
            auto_update: row.get(6)?,
            cached: row.get(7)?,
            architecture: row.get(8)?,
            image_type: InstanceType::from_str(&type_str).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    9,
                    rusqlite::types::Type::Text,
                    Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())),
                )
            })?,
            created_at: parse_ts(row.get::<_, Option<String>>(10)?),
            expires_at: parse_ts(row.get::<_, Option<String>>(11)?),
            last_used_at: parse_ts(row.get::<_, Option<String>>(12)?),
            upload_date: parse_ts(Some(row.get::<_, String>(13)?)).unwrap_or_else(Utc::now),
            properties: HashMap::new(),
        };

        Ok((row.get(0)?, image))
    }

    fn finish(conn: &Connection, (id, mut image): (i64, Self)) -> Result<(i64, Self)> {
        let mut stmt =
            conn.prepare("SELECT key, value FROM image_properties WHERE image_id = ?1")?;
        let rows = stmt.query_map([id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (key, value) = row?;
            image.properties.insert(key, value);
        }

        Ok((id, image))
    }
}

fn ts(when: DateTime<Utc>) -> String {
    when.to_rfc3339()
}

fn parse_ts(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
        .map(|dt| dt.with_timezone(&Utc))
}
