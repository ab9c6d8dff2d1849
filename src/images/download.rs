// src/images/download.rs

//! Pulling images from remote servers.
//!
//! Used by user-initiated pulls, URL pulls, auto-update refreshes and the
//! cluster replication loops. Downloads stream through the project quota
//! into a temp file in the image directory, hash on the fly and publish
//! atomically like every other ingestion path.

use super::{headers, ImageInfo, QuotaWriter};
use crate::db::models::{Image, ImageSource, Member, Profile};
use crate::error::{Error, Result};
use crate::fingerprint::{Fingerprint, HashingWriter};
use crate::lifecycle::{authz_hook, LifecycleAction, LifecycleEvent};
use crate::server::State;
use chrono::{TimeZone, Utc};
use std::io::Write;
use std::sync::Arc;
use tracing::{debug, info};

/// Peer-to-peer pull protocol name
pub const PROTOCOL_PADDOCK: &str = "paddock";

/// Plain-URL protocol name
pub const PROTOCOL_DIRECT: &str = "direct";

/// What to download and how to record it
#[derive(Debug, Clone, Default)]
pub struct ImageDownloadArgs {
    pub server: String,
    pub protocol: String,
    pub certificate: String,
    /// One-time secret for private source images
    pub secret: String,
    /// Alias name or fingerprint on the remote
    pub alias: String,
    pub auto_update: bool,
    pub public: bool,
    pub cached: bool,
    pub project: String,
    /// Remaining image-space budget; negative is unbounded
    pub budget: i64,
}

/// Download an image, returning its committed info.
///
/// When the record already exists in the project the download is skipped
/// unless the blob itself is missing locally, in which case only the blob
/// is fetched and this member registers as a holder.
pub async fn image_download(state: &Arc<State>, args: &ImageDownloadArgs) -> Result<ImageInfo> {
    let fingerprint = resolve_fingerprint(state, args).await?;

    let _guard = state.image_locks.lock(fingerprint.as_str()).await;

    let project = args.project.clone();
    let fp = fingerprint.clone();
    let existing = state
        .cluster
        .with(move |conn| match Image::get(conn, &project, &fp) {
            Ok((id, image)) => Ok(Some(ImageInfo::from_record(conn, id, &image)?)),
            Err(ref e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        })
        .await?;

    if let Some(info) = &existing {
        if state.archive.exists(&fingerprint) {
            debug!("Image already up to date: {}", fingerprint);
            return Ok(info.clone());
        }
    }

    // Fetch the blob(s) into temp files next to their final home.
    let (meta_tmp, rootfs_tmp, size) = fetch_blobs(state, args, &fingerprint).await?;

    // The record needs architecture/type/dates: the peer's record wins,
    // local inspection covers direct pulls.
    let details = match fetch_remote_record(state, args, &fingerprint).await {
        Some(details) => details,
        None => {
            let inspect = meta_tmp.clone();
            let inspected =
                tokio::task::spawn_blocking(move || {
                    crate::archive::metadata::read_image_metadata(&inspect)
                })
                .await
                .map_err(|e| Error::Other(format!("Metadata inspection failed: {}", e)))?;

            match inspected {
                Ok((meta, itype)) => RecordDetails {
                    architecture: meta.architecture,
                    image_type: itype,
                    created_at: Utc.timestamp_opt(meta.creation_date, 0).single(),
                    expires_at: (meta.expiry_date > 0)
                        .then(|| Utc.timestamp_opt(meta.expiry_date, 0).single())
                        .flatten(),
                    properties: meta.properties,
                },
                Err(_) => RecordDetails::default(),
            }
        }
    };

    // Blob first, record second; leftover cleanup reclaims orphans.
    let freshly_published = !state.archive.exists(&fingerprint);
    if freshly_published {
        state
            .archive
            .publish(&fingerprint, &meta_tmp, rootfs_tmp.as_deref())?;
    } else {
        let _ = std::fs::remove_file(&meta_tmp);
        if let Some(rootfs) = &rootfs_tmp {
            let _ = std::fs::remove_file(rootfs);
        }
    }

    let result =
        commit_download(state, args, &fingerprint, existing.is_some(), size, details).await;

    match result {
        Ok(info) => {
            info!(
                "Image downloaded: {} from {} into project {}",
                fingerprint, args.server, args.project
            );
            Ok(info)
        }
        Err(e) => {
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
            Err(e)
        }
    }
}

/// Resolve the remote alias (or fingerprint) to a full fingerprint
async fn resolve_fingerprint(state: &Arc<State>, args: &ImageDownloadArgs) -> Result<Fingerprint> {
    // A full fingerprint needs no resolution.
    if let Ok(fp) = Fingerprint::new(args.alias.clone()) {
        return Ok(fp);
    }

    if args.protocol == PROTOCOL_DIRECT {
        return Err(Error::Validation(
            "Direct downloads require a full fingerprint".to_string(),
        ));
    }

    let url = format!(
        "{}/1.0/images/aliases/{}",
        args.server.trim_end_matches('/'),
        args.alias
    );

    #[derive(serde::Deserialize)]
    struct AliasAnswer {
        target: String,
    }

    let answer: AliasAnswer = state
        .http
        .get(&url)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    Fingerprint::new(answer.target)
}

/// Stream the remote blob(s) into temp files, enforcing budget and hash
async fn fetch_blobs(
    state: &Arc<State>,
    args: &ImageDownloadArgs,
    fingerprint: &Fingerprint,
) -> Result<(std::path::PathBuf, Option<std::path::PathBuf>, i64)> {
    let base = args.server.trim_end_matches('/');

    let (meta_url, rootfs_url) = if args.protocol == PROTOCOL_DIRECT {
        (base.to_string(), None)
    } else {
        let mut meta = format!("{}/1.0/images/{}/export?part=meta", base, fingerprint);
        let mut rootfs = format!("{}/1.0/images/{}/export?part=rootfs", base, fingerprint);
        if !args.secret.is_empty() {
            meta.push_str(&format!("&secret={}", args.secret));
            rootfs.push_str(&format!("&secret={}", args.secret));
        }
        (meta, Some(rootfs))
    };

    let mut hasher_writer = HashingWriter::new(QuotaWriter::new(NullSink, args.budget));
    let mut total = 0i64;

    let meta_tmp = spool_url(state, &meta_url, &mut hasher_writer, &mut total)
        .await?
        .ok_or_else(|| Error::not_found("Image"))?;

    let rootfs_tmp = match rootfs_url {
        Some(url) => spool_url(state, &url, &mut hasher_writer, &mut total).await?,
        None => None,
    };

    let (_, actual) = hasher_writer.finalize();
    if &actual != fingerprint {
        let _ = std::fs::remove_file(&meta_tmp);
        if let Some(rootfs) = &rootfs_tmp {
            let _ = std::fs::remove_file(rootfs);
        }
        return Err(Error::Integrity(format!(
            "Fingerprints don't match, got {} expected {}",
            actual, fingerprint
        )));
    }

    Ok((meta_tmp, rootfs_tmp, total))
}

/// Sink for hashing without a second copy of the bytes
struct NullSink;

impl Write for NullSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Download one URL into a temp file inside the image directory.
///
/// Returns None on 404 (split part absent). Every chunk also feeds the
/// running hash so the canonical concatenation is covered.
async fn spool_url(
    state: &Arc<State>,
    url: &str,
    hasher: &mut HashingWriter<QuotaWriter<NullSink>>,
    total: &mut i64,
) -> Result<Option<std::path::PathBuf>> {
    debug!("Downloading image part from {}", url);

    let response = state.http.get(url).send().await?;

    if response.status() == reqwest::StatusCode::NOT_FOUND {
        return Ok(None);
    }

    let mut response = response.error_for_status()?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".paddock_download_")
        .tempfile_in(state.archive.dir())?;

    while let Some(chunk) = response.chunk().await? {
        hasher
            .write_all(&chunk)
            .map_err(|_| Error::QuotaExceeded)?;
        tmp.as_file_mut().write_all(&chunk)?;
        *total += chunk.len() as i64;
    }

    let (_, path) = tmp.keep().map_err(|e| Error::Io(e.error))?;
    Ok(Some(path))
}

/// Record fields learned from the peer or from local inspection
#[derive(Debug, Clone)]
struct RecordDetails {
    architecture: String,
    image_type: crate::instance::InstanceType,
    created_at: Option<chrono::DateTime<Utc>>,
    expires_at: Option<chrono::DateTime<Utc>>,
    properties: std::collections::HashMap<String, String>,
}

impl Default for RecordDetails {
    fn default() -> Self {
        Self {
            architecture: String::new(),
            image_type: crate::instance::InstanceType::Container,
            created_at: None,
            expires_at: None,
            properties: Default::default(),
        }
    }
}

/// Ask the peer for its record of the image (paddock protocol only)
async fn fetch_remote_record(
    state: &Arc<State>,
    args: &ImageDownloadArgs,
    fingerprint: &Fingerprint,
) -> Option<RecordDetails> {
    if args.protocol != PROTOCOL_PADDOCK {
        return None;
    }

    let mut url = format!(
        "{}/1.0/images/{}",
        args.server.trim_end_matches('/'),
        fingerprint
    );
    if !args.secret.is_empty() {
        url.push_str(&format!("?secret={}", args.secret));
    }

    let info: ImageInfo = state
        .http
        .get(&url)
        .send()
        .await
        .ok()?
        .error_for_status()
        .ok()?
        .json()
        .await
        .ok()?;

    Some(RecordDetails {
        architecture: info.architecture,
        image_type: info
            .image_type
            .parse::<crate::instance::InstanceType>()
            .ok()?,
        created_at: info.created_at,
        expires_at: info.expires_at,
        properties: info.properties,
    })
}

/// Create or refresh the database record for a downloaded image
async fn commit_download(
    state: &Arc<State>,
    args: &ImageDownloadArgs,
    fingerprint: &Fingerprint,
    record_exists: bool,
    size: i64,
    details: RecordDetails,
) -> Result<ImageInfo> {
    let node_id = state.local_member_id().await?;
    let cloned_args = args.clone();
    let fingerprint = fingerprint.clone();

    let info = state
        .cluster
        .tx(move |tx| {
            let args = cloned_args;
            if record_exists {
                if let Some(node_id) = node_id {
                    Member::add_image(tx, &fingerprint, node_id)?;
                }
                let (id, image) = Image::get(tx, &args.project, &fingerprint)?;
                return Ok(ImageInfo::from_record(tx, id, &image)?);
            }

            let mut image = Image::new(&args.project, fingerprint.clone(), details.image_type);
            image.size = size;
            image.public = args.public;
            image.auto_update = args.auto_update;
            image.cached = args.cached;
            image.architecture = details.architecture.clone();
            image.created_at = details.created_at;
            image.expires_at = details.expires_at;
            image.properties = details.properties.clone();

            let default_profile = Profile::get_by_name(tx, &args.project, "default")?.id;
            let id = image.insert(tx, &[default_profile])?;

            if !args.server.is_empty() {
                Image::set_source(
                    tx,
                    id,
                    &ImageSource {
                        server: args.server.clone(),
                        protocol: args.protocol.clone(),
                        certificate: args.certificate.clone(),
                        alias: args.alias.clone(),
                    },
                )?;
            }

            if let Some(node_id) = node_id {
                Member::add_image(tx, &fingerprint, node_id)?;
            }

            let (id, image) = Image::get(tx, &args.project, &fingerprint)?;
            Ok(ImageInfo::from_record(tx, id, &image)?)
        })
        .await?;

    if !record_exists {
        state.events.send(LifecycleEvent::new(
            LifecycleAction::ImageCreated,
            &args.project,
            format!("/1.0/images/{}", info.fingerprint),
        ));
        authz_hook(
            "add image",
            state.authorizer.add_image(&args.project, &info.fingerprint),
        );
    }

    Ok(info)
}

/// Resolve an URL pull: HEAD the given URL and follow its answer headers
pub async fn resolve_url_source(state: &Arc<State>, url: &str) -> Result<ImageDownloadArgs> {
    let response = state
        .http
        .head(url)
        .header("User-Agent", concat!("paddock/", env!("CARGO_PKG_VERSION")))
        .send()
        .await?
        .error_for_status()?;

    let hash = response
        .headers()
        .get(headers::IMAGE_HASH)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| Error::Validation(format!("Missing {} header", headers::IMAGE_HASH)))?;

    let target = response
        .headers()
        .get(headers::IMAGE_URL)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| Error::Validation(format!("Missing {} header", headers::IMAGE_URL)))?;

    Ok(ImageDownloadArgs {
        server: target.to_string(),
        protocol: PROTOCOL_DIRECT.to_string(),
        alias: hash.to_string(),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_requires_fingerprint() {
        let args = ImageDownloadArgs {
            protocol: PROTOCOL_DIRECT.to_string(),
            alias: "ubuntu/22.04".to_string(),
            ..Default::default()
        };

        // No remote resolution possible for direct pulls
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let state = crate::server::State::new(
            crate::server::DaemonConfig::default().with_var_dir(dir.path()),
        )
        .unwrap();

        let err = rt.block_on(resolve_fingerprint(&state, &args)).unwrap_err();
        assert!(err.to_string().contains("full fingerprint"));
    }

    #[test]
    fn test_full_fingerprint_skips_resolution() {
        let fp = crate::fingerprint::fingerprint_bytes(b"image");
        let args = ImageDownloadArgs {
            protocol: PROTOCOL_PADDOCK.to_string(),
            alias: fp.to_string(),
            ..Default::default()
        };

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let state = crate::server::State::new(
            crate::server::DaemonConfig::default().with_var_dir(dir.path()),
        )
        .unwrap();

        let resolved = rt.block_on(resolve_fingerprint(&state, &args)).unwrap();
        assert_eq!(resolved, fp);
    }
}
