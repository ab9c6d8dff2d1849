// src/instance.rs

//! Instance contract consumed by the image and migration subsystems.
//!
//! The per-instance lifecycle (start/stop/freeze) and the on-disk rootfs
//! format live in the instance drivers, outside this crate. The image
//! publisher and the migration transport only need the narrow surface
//! defined here.

use crate::archive::metadata::ImageMetadata;
use crate::error::{Error, Result};
use crate::migration::{MigrateReceiveArgs, MigrateSendArgs};
use crate::progress::ProgressTracker;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;

/// Instance kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceType {
    Container,
    VirtualMachine,
}

impl InstanceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Container => "container",
            Self::VirtualMachine => "virtual-machine",
        }
    }
}

impl FromStr for InstanceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "container" => Ok(Self::Container),
            "virtual-machine" => Ok(Self::VirtualMachine),
            _ => Err(Error::Validation(format!("Invalid instance type: {}", s))),
        }
    }
}

impl std::fmt::Display for InstanceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The slice of an instance driver that images and migration consume
#[async_trait]
pub trait Instance: Send + Sync {
    fn name(&self) -> &str;

    fn project(&self) -> &str;

    fn instance_type(&self) -> InstanceType;

    /// Architecture name, e.g. "x86_64"
    fn architecture(&self) -> String;

    fn is_running(&self) -> bool;

    /// Root of the instance filesystem, used for size estimation
    fn rootfs_path(&self) -> PathBuf;

    /// Export the instance as an image archive.
    ///
    /// When `rootfs` is None the export is unified (single tarball);
    /// otherwise metadata and rootfs are written separately. Blocking:
    /// callers run this on a blocking task.
    fn export(
        &self,
        meta: &mut dyn Write,
        rootfs: Option<&mut dyn Write>,
        properties: &HashMap<String, String>,
        expires_at: Option<DateTime<Utc>>,
        tracker: &ProgressTracker,
    ) -> Result<ImageMetadata>;

    /// Drive the sending side of a migration
    async fn migrate_send(&self, args: MigrateSendArgs) -> Result<()>;

    /// Drive the receiving side of a migration
    async fn migrate_receive(&self, args: MigrateReceiveArgs) -> Result<()>;
}

/// Resolve an instance by project and name.
///
/// Instance drivers register through this hook; the daemon wires the real
/// loader at startup and tests install fakes.
pub type InstanceLoader =
    dyn Fn(&str, &str) -> Result<std::sync::Arc<dyn Instance>> + Send + Sync;

/// Whether a name refers to a snapshot (`instance/snapshot`)
pub fn is_snapshot_name(name: &str) -> bool {
    name.contains('/')
}
