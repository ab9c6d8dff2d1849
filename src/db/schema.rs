// src/db/schema.rs

//! Schema definitions and migrations for the cluster and local databases.

use crate::error::Result;
use rusqlite::Connection;
use tracing::{debug, info};

/// Current cluster schema version
pub const CLUSTER_SCHEMA_VERSION: i32 = 1;

/// Current local schema version
pub const LOCAL_SCHEMA_VERSION: i32 = 1;

fn init_schema_version(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    Ok(())
}

/// Get the current schema version from a database
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    init_schema_version(conn)?;

    let version = conn
        .query_row(
            "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    Ok(())
}

/// Apply pending cluster database migrations
pub fn migrate_cluster(conn: &Connection) -> Result<()> {
    let current = get_schema_version(conn)?;
    if current >= CLUSTER_SCHEMA_VERSION {
        debug!("Cluster schema is up to date (version {})", current);
        return Ok(());
    }

    for version in (current + 1)..=CLUSTER_SCHEMA_VERSION {
        info!("Applying cluster schema migration to version {}", version);
        match version {
            1 => migrate_cluster_v1(conn)?,
            _ => panic!("Unknown cluster migration version: {}", version),
        }
        set_schema_version(conn, version)?;
    }

    Ok(())
}

/// Apply pending local database migrations
pub fn migrate_local(conn: &Connection) -> Result<()> {
    let current = get_schema_version(conn)?;
    if current >= LOCAL_SCHEMA_VERSION {
        debug!("Local schema is up to date (version {})", current);
        return Ok(());
    }

    for version in (current + 1)..=LOCAL_SCHEMA_VERSION {
        info!("Applying local schema migration to version {}", version);
        match version {
            1 => migrate_local_v1(conn)?,
            _ => panic!("Unknown local migration version: {}", version),
        }
        set_schema_version(conn, version)?;
    }

    Ok(())
}

/// Initial cluster schema - Version 1
///
/// Images are keyed (project, fingerprint); the blob itself is shared, so
/// holder and pool placement link on the fingerprint, not the record.
fn migrate_cluster_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        -- Global configuration (database-first, no config files)
        CREATE TABLE config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        -- Projects
        CREATE TABLE projects (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE
        );

        CREATE TABLE project_config (
            project_id INTEGER NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            UNIQUE(project_id, key),
            FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
        );

        -- Profiles applied to instances created from an image
        CREATE TABLE profiles (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            description TEXT,
            UNIQUE(project_id, name),
            FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
        );

        -- Image records, one per (project, fingerprint)
        CREATE TABLE images (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project_id INTEGER NOT NULL,
            fingerprint TEXT NOT NULL,
            filename TEXT NOT NULL DEFAULT '',
            size INTEGER NOT NULL,
            public INTEGER NOT NULL DEFAULT 0,
            auto_update INTEGER NOT NULL DEFAULT 0,
            cached INTEGER NOT NULL DEFAULT 0,
            architecture TEXT NOT NULL DEFAULT '',
            type TEXT NOT NULL CHECK(type IN ('container', 'virtual-machine')),
            created_at TEXT,
            expires_at TEXT,
            last_used_at TEXT,
            upload_date TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE(project_id, fingerprint),
            FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
        );

        CREATE INDEX idx_images_fingerprint ON images(fingerprint);
        CREATE INDEX idx_images_project_id ON images(project_id);

        CREATE TABLE image_properties (
            image_id INTEGER NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            UNIQUE(image_id, key),
            FOREIGN KEY (image_id) REFERENCES images(id) ON DELETE CASCADE
        );

        -- Aliases never outlive their target
        CREATE TABLE image_aliases (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            image_id INTEGER NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            UNIQUE(project_id, name),
            FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE,
            FOREIGN KEY (image_id) REFERENCES images(id) ON DELETE CASCADE
        );

        CREATE INDEX idx_image_aliases_image_id ON image_aliases(image_id);

        -- Ordered profile links; the order is the apply order
        CREATE TABLE image_profiles (
            image_id INTEGER NOT NULL,
            profile_id INTEGER NOT NULL,
            sort_order INTEGER NOT NULL,
            UNIQUE(image_id, profile_id),
            FOREIGN KEY (image_id) REFERENCES images(id) ON DELETE CASCADE,
            FOREIGN KEY (profile_id) REFERENCES profiles(id) ON DELETE CASCADE
        );

        -- Upstream pointer for remote-origin images
        CREATE TABLE image_source (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            image_id INTEGER NOT NULL UNIQUE,
            server TEXT NOT NULL,
            protocol TEXT NOT NULL,
            certificate TEXT NOT NULL DEFAULT '',
            alias TEXT NOT NULL,
            FOREIGN KEY (image_id) REFERENCES images(id) ON DELETE CASCADE
        );

        -- Cluster members
        CREATE TABLE nodes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            address TEXT NOT NULL UNIQUE
        );

        -- Which members hold which blob locally
        CREATE TABLE images_nodes (
            fingerprint TEXT NOT NULL,
            node_id INTEGER NOT NULL,
            UNIQUE(fingerprint, node_id),
            FOREIGN KEY (node_id) REFERENCES nodes(id) ON DELETE CASCADE
        );

        CREATE INDEX idx_images_nodes_fingerprint ON images_nodes(fingerprint);

        -- Storage pools and per-pool image volumes
        CREATE TABLE storage_pools (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            driver TEXT NOT NULL
        );

        CREATE TABLE images_pools (
            fingerprint TEXT NOT NULL,
            pool_id INTEGER NOT NULL,
            UNIQUE(fingerprint, pool_id),
            FOREIGN KEY (pool_id) REFERENCES storage_pools(id) ON DELETE CASCADE
        );

        -- The default project always exists
        INSERT INTO projects (name) VALUES ('default');
        INSERT INTO profiles (project_id, name, description)
            SELECT id, 'default', 'Default paddock profile' FROM projects WHERE name = 'default';
        ",
    )?;

    Ok(())
}

/// Initial local schema - Version 1
///
/// The raft configuration is edited out-of-band by the admin surface while
/// the daemon is stopped; role 0 = voter, 1 = stand-by, 2 = spare.
fn migrate_local_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE node_config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE raft_nodes (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL DEFAULT '',
            address TEXT NOT NULL,
            role INTEGER NOT NULL DEFAULT 0
        );
        ",
    )?;

    Ok(())
}
