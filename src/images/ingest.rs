// src/images/ingest.rs

//! Upload ingestion: raw tarballs and split multipart uploads.
//!
//! The HTTP layer spools request bodies into temp files inside the image
//! directory (through the project quota writer) and hands them here. This
//! module owns fingerprinting, metadata inspection, the atomic publish and
//! the database commit.

use super::{AliasEntry, ImageInfo};
use crate::archive::metadata::read_image_metadata;
use crate::db::models::{Image, ImageAlias, Member, Profile};
use crate::error::{Error, Result};
use crate::fingerprint::{Fingerprint, FingerprintHasher};
use crate::instance::InstanceType;
use crate::lifecycle::{authz_hook, LifecycleAction, LifecycleEvent};
use crate::server::State;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// Decoded upload headers and options
#[derive(Debug, Default, Clone)]
pub struct UploadMeta {
    pub project: String,
    pub filename: String,
    pub public: bool,
    pub expected_fingerprint: Option<String>,
    pub properties: HashMap<String, String>,
    pub aliases: Vec<AliasEntry>,
    pub profiles: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Cluster notification: register this member as a holder, do not
    /// touch global state
    pub is_notification: bool,
}

/// Spooled upload body
pub enum UploadBody {
    /// Single unified tarball
    Unified(PathBuf),
    /// `multipart/form-data`: metadata part plus rootfs part
    Split {
        meta: PathBuf,
        rootfs: PathBuf,
        /// Form name of the second part; decides the image type
        rootfs_part_name: String,
    },
}

impl UploadBody {
    fn remove_temps(&self) {
        let paths = match self {
            Self::Unified(meta) => vec![meta],
            Self::Split { meta, rootfs, .. } => vec![meta, rootfs],
        };
        for path in paths {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Ingest a spooled upload, returning the committed image info.
///
/// Exactly one concurrent ingest of a fingerprint commits; the rest
/// observe already-exists. Temp files never survive an error path.
pub async fn process_upload(
    state: &Arc<State>,
    meta: UploadMeta,
    body: UploadBody,
) -> Result<ImageInfo> {
    let result = process_upload_inner(state, &meta, &body).await;
    if result.is_err() {
        body.remove_temps();
    }
    result
}

async fn process_upload_inner(
    state: &Arc<State>,
    meta: &UploadMeta,
    body: &UploadBody,
) -> Result<ImageInfo> {
    // Fingerprint first: the lock is keyed on it.
    let (fingerprint, size) = fingerprint_body(body)?;

    if let Some(expected) = &meta.expected_fingerprint {
        if fingerprint.as_str() != expected.to_lowercase() {
            return Err(Error::Integrity(format!(
                "Fingerprints don't match, got {} expected {}",
                fingerprint, expected
            )));
        }
    }

    let _guard = state.image_locks.lock(fingerprint.as_str()).await;

    // Inspect the metadata tarball; the rootfs part name wins on type for
    // split uploads.
    let (meta_path, rootfs_path, part_type) = match body {
        UploadBody::Unified(path) => (path.clone(), None, None),
        UploadBody::Split {
            meta: meta_path,
            rootfs,
            rootfs_part_name,
        } => {
            let image_type = match rootfs_part_name.as_str() {
                "rootfs" => InstanceType::Container,
                "rootfs.img" => InstanceType::VirtualMachine,
                _ => return Err(Error::Validation("Invalid multipart image".to_string())),
            };

            (meta_path.clone(), Some(rootfs.clone()), Some(image_type))
        }
    };

    let inspect = meta_path.clone();
    let (archive_meta, detected_type) =
        tokio::task::spawn_blocking(move || read_image_metadata(&inspect))
            .await
            .map_err(|e| Error::Other(format!("Metadata inspection failed: {}", e)))?
            .map_err(|e| {
                error!("Failed to get image metadata: {}", e);
                e
            })?;

    let image_type = part_type.unwrap_or(detected_type);

    // Files land before the record: a crash here leaves an orphan blob
    // that leftover cleanup reclaims, never a record without its blob.
    let freshly_published = !state.archive.exists(&fingerprint);
    publish_blobs(state, &fingerprint, &meta_path, rootfs_path.as_deref())?;

    let node_id = state.local_member_id().await?;
    let project = meta.project.clone();
    let fingerprint_db = fingerprint.clone();
    let is_notification = meta.is_notification;

    // One transaction: record, properties, aliases, profile links.
    let meta_clone = meta.clone();
    let existing = state
        .cluster
        .tx(move |tx| {
            if Image::exists(tx, &project, &fingerprint_db)? {
                if is_notification {
                    // Internal cluster copy: just register this member as
                    // a holder.
                    if let Some(node_id) = node_id {
                        Member::add_image(tx, &fingerprint_db, node_id)?;
                    }
                    let (id, image) = Image::get(tx, &project, &fingerprint_db)?;
                    return Ok(Some(ImageInfo::from_record(tx, id, &image)?));
                }

                return Err(Error::AlreadyExists(format!(
                    "Image with same fingerprint already exists: {}",
                    fingerprint_db
                )));
            }

            let profile_ids = if meta_clone.profiles.is_empty() {
                vec![Profile::get_by_name(tx, &project, "default")?.id]
            } else {
                Profile::resolve_names(tx, &project, &meta_clone.profiles)?
            };

            let mut image = Image::new(&project, fingerprint_db.clone(), image_type);
            image.filename = meta_clone.filename.clone();
            image.size = size;
            image.public = meta_clone.public;
            image.architecture = archive_meta.architecture.clone();
            image.created_at = Utc.timestamp_opt(archive_meta.creation_date, 0).single();
            image.expires_at = meta_clone.expires_at.or_else(|| {
                (archive_meta.expiry_date > 0)
                    .then(|| Utc.timestamp_opt(archive_meta.expiry_date, 0).single())
                    .flatten()
            });
            image.properties = if meta_clone.properties.is_empty() {
                archive_meta.properties.clone()
            } else {
                meta_clone.properties.clone()
            };

            let id = image.insert(tx, &profile_ids)?;

            for alias in &meta_clone.aliases {
                ImageAlias::create(tx, &project, &alias.name, id, &alias.description)?;
            }

            if let Some(node_id) = node_id {
                Member::add_image(tx, &fingerprint_db, node_id)?;
            }

            Ok(None)
        })
        .await;

    let existing = match existing {
        Ok(existing) => existing,
        Err(e) => {
            // Drop the blob again unless some project already references
            // it (a concurrent ingest committed first, or another project
            // shares the fingerprint).
            if freshly_published {
                let referenced = state
                    .cluster
                    .with({
                        let fp = fingerprint.clone();
                        move |conn| Image::exists_anywhere(conn, &fp)
                    })
                    .await
                    .unwrap_or(true);
                if !referenced {
                    let _ = state.archive.delete(&fingerprint);
                }
            }
            return Err(e);
        }
    };

    if let Some(info) = existing {
        return Ok(info);
    }

    info!(
        "Image ingested: {} ({} bytes) in project {}",
        fingerprint, size, meta.project
    );

    if !meta.is_notification {
        state.events.send(
            LifecycleEvent::new(
                LifecycleAction::ImageCreated,
                &meta.project,
                format!("/1.0/images/{}", fingerprint),
            )
            .with_context("type", image_type.as_str().into()),
        );

        authz_hook(
            "add image",
            state.authorizer.add_image(&meta.project, fingerprint.as_str()),
        );
        for alias in &meta.aliases {
            authz_hook(
                "add image alias",
                state.authorizer.add_image_alias(&meta.project, &alias.name),
            );
        }
    }

    let fingerprint_read = fingerprint.clone();
    let project_read = meta.project.clone();
    state
        .cluster
        .with(move |conn| {
            let (id, image) = Image::get(conn, &project_read, &fingerprint_read)?;
            ImageInfo::from_record(conn, id, &image)
        })
        .await
}

fn publish_blobs(
    state: &Arc<State>,
    fingerprint: &Fingerprint,
    meta_path: &std::path::Path,
    rootfs_path: Option<&std::path::Path>,
) -> Result<()> {
    if state.archive.exists(fingerprint) {
        // Blob already present (concurrent ingest or earlier holder);
        // drop the temps.
        let _ = std::fs::remove_file(meta_path);
        if let Some(rootfs) = rootfs_path {
            let _ = std::fs::remove_file(rootfs);
        }
        return Ok(());
    }

    state.archive.publish(fingerprint, meta_path, rootfs_path)
}

fn fingerprint_body(body: &UploadBody) -> Result<(Fingerprint, i64)> {
    let mut hasher = FingerprintHasher::new();
    let mut size = 0i64;

    let paths: Vec<&PathBuf> = match body {
        UploadBody::Unified(meta) => vec![meta],
        UploadBody::Split { meta, rootfs, .. } => vec![meta, rootfs],
    };

    for path in paths {
        let mut file = File::open(path)?;
        let mut buffer = [0u8; 65536];
        loop {
            let n = std::io::Read::read(&mut file, &mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
            size += n as i64;
        }
    }

    Ok((hasher.finalize(), size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::DaemonConfig;
    use std::io::Write;

    fn build_image_tar(rootfs_entry: &str) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, content) in [
            (
                "metadata.yaml",
                "architecture: x86_64\ncreation_date: 1700000000\n".as_bytes(),
            ),
            (rootfs_entry, b"data".as_slice()),
        ] {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, content).unwrap();
        }
        builder.into_inner().unwrap()
    }

    async fn test_state() -> (tempfile::TempDir, Arc<State>) {
        let dir = tempfile::tempdir().unwrap();
        let state = State::new(DaemonConfig::default().with_var_dir(dir.path())).unwrap();
        (dir, state)
    }

    fn spool(state: &State, data: &[u8]) -> PathBuf {
        let mut tmp = tempfile::Builder::new()
            .prefix(".paddock_upload_")
            .tempfile_in(state.archive.dir())
            .unwrap();
        tmp.write_all(data).unwrap();
        let (_, path) = tmp.keep().unwrap();
        path
    }

    #[tokio::test]
    async fn test_unified_upload() {
        let (_dir, state) = test_state().await;
        let tarball = build_image_tar("rootfs/etc/hostname");
        let expected = crate::fingerprint::fingerprint_bytes(&tarball);

        let path = spool(&state, &tarball);
        let info = process_upload(
            &state,
            UploadMeta {
                project: "default".to_string(),
                filename: "image.tar".to_string(),
                ..Default::default()
            },
            UploadBody::Unified(path),
        )
        .await
        .unwrap();

        assert_eq!(info.fingerprint, expected.as_str());
        assert_eq!(info.size, tarball.len() as i64);
        assert_eq!(info.image_type, "container");
        assert!(state.archive.exists(&expected));
    }

    #[tokio::test]
    async fn test_second_identical_upload_already_exists() {
        let (_dir, state) = test_state().await;
        let tarball = build_image_tar("rootfs/etc/hostname");

        let first = spool(&state, &tarball);
        process_upload(
            &state,
            UploadMeta {
                project: "default".to_string(),
                ..Default::default()
            },
            UploadBody::Unified(first),
        )
        .await
        .unwrap();

        let second = spool(&state, &tarball);
        let err = process_upload(
            &state,
            UploadMeta {
                project: "default".to_string(),
                ..Default::default()
            },
            UploadBody::Unified(second),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::AlreadyExists(_)));

        // No upload temp files survive next to the published blob
        let published = crate::fingerprint::fingerprint_bytes(&tarball);
        let mut entries = state.archive.entries().unwrap();
        entries.retain(|name| name != published.as_str());
        assert!(entries.is_empty(), "leftover temps: {:?}", entries);
    }

    #[tokio::test]
    async fn test_split_upload_virtual_machine() {
        let (_dir, state) = test_state().await;

        let meta_tar = {
            let mut builder = tar::Builder::new(Vec::new());
            let content = b"architecture: x86_64\ncreation_date: 1700000000\n";
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, "metadata.yaml", content.as_slice())
                .unwrap();
            builder.into_inner().unwrap()
        };
        let rootfs_img = b"qcow2 bytes".to_vec();

        // Fingerprint covers metadata then rootfs, in that order
        let mut hasher = FingerprintHasher::new();
        hasher.update(&meta_tar);
        hasher.update(&rootfs_img);
        let expected = hasher.finalize();

        let meta_path = spool(&state, &meta_tar);
        let rootfs_path = spool(&state, &rootfs_img);

        let info = process_upload(
            &state,
            UploadMeta {
                project: "default".to_string(),
                ..Default::default()
            },
            UploadBody::Split {
                meta: meta_path,
                rootfs: rootfs_path,
                rootfs_part_name: "rootfs.img".to_string(),
            },
        )
        .await
        .unwrap();

        assert_eq!(info.fingerprint, expected.as_str());
        assert_eq!(info.image_type, "virtual-machine");
        assert_eq!(info.size, (meta_tar.len() + rootfs_img.len()) as i64);
        assert!(state.archive.is_split(&expected));
    }

    #[tokio::test]
    async fn test_split_upload_bad_part_name_rejected() {
        let (_dir, state) = test_state().await;

        let meta_path = spool(&state, b"irrelevant");
        let rootfs_path = spool(&state, b"irrelevant");

        let err = process_upload(
            &state,
            UploadMeta {
                project: "default".to_string(),
                ..Default::default()
            },
            UploadBody::Split {
                meta: meta_path,
                rootfs: rootfs_path,
                rootfs_part_name: "disk".to_string(),
            },
        )
        .await
        .unwrap_err();

        assert!(err.to_string().contains("Invalid multipart image"));
        // Error path removed the temps
        assert!(state.archive.entries().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expected_fingerprint_mismatch() {
        let (_dir, state) = test_state().await;
        let tarball = build_image_tar("rootfs/etc/hostname");

        let path = spool(&state, &tarball);
        let err = process_upload(
            &state,
            UploadMeta {
                project: "default".to_string(),
                expected_fingerprint: Some("ab".repeat(32)),
                ..Default::default()
            },
            UploadBody::Unified(path),
        )
        .await
        .unwrap_err();

        assert!(err.to_string().contains("don't match"));
        assert!(state.archive.entries().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_aliases_created_with_record() {
        let (_dir, state) = test_state().await;
        let tarball = build_image_tar("rootfs/etc/hostname");

        let path = spool(&state, &tarball);
        let info = process_upload(
            &state,
            UploadMeta {
                project: "default".to_string(),
                aliases: vec![AliasEntry {
                    name: "u22".to_string(),
                    description: "Ubuntu".to_string(),
                }],
                ..Default::default()
            },
            UploadBody::Unified(path),
        )
        .await
        .unwrap();

        assert_eq!(info.aliases.len(), 1);
        assert_eq!(info.aliases[0].name, "u22");
        // The default profile is linked when none are named
        assert_eq!(info.profiles, vec!["default"]);
    }
}
