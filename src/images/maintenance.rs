// src/images/maintenance.rs

//! Image maintenance: auto-update, expiry and leftover cleanup.
//!
//! The loops are mutually serialised by the daemon's image task lock so
//! they never step on each other. Auto-update runs hourly but skips its
//! first scheduled run after startup; expiry runs daily with an initial
//! synchronous pass before the loops start.

use super::download::{image_download, ImageDownloadArgs};
use super::ImageInfo;
use crate::db::models::{
    split_volume, Image, ImageFilter, Member, Project, StoragePool,
};
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::lifecycle::{LifecycleAction, LifecycleEvent};
use crate::operations::{Operation, OperationClass, OperationType};
use crate::server::State;
use chrono::{Duration as ChronoDuration, Utc};
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Built-in default for `images.auto_update_interval` (hours)
pub const DEFAULT_AUTO_UPDATE_INTERVAL: i64 = 6;

/// Built-in default for `images.remote_cache_expiry` (days)
pub const DEFAULT_REMOTE_CACHE_EXPIRY: i64 = 10;

/// Hourly auto-update loop.
///
/// The first scheduled run after startup is postponed; every run after
/// that takes the image task lock and processes each auto-update image.
pub async fn auto_update_images_task(state: Arc<State>) {
    // The immediate tick is swallowed: the first update pass runs an hour
    // after startup, not during it.
    let mut ticker = tokio::time::interval(Duration::from_secs(3600));
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let op = state.operations.create(
            OperationClass::Task,
            OperationType::ImagesUpdate,
            crate::db::models::DEFAULT_PROJECT,
            HashMap::new(),
            serde_json::Map::new(),
            None,
        );

        debug!("Acquiring image task lock");
        let _task_guard = state.task_lock.lock().await;
        debug!("Acquired image task lock");

        info!("Updating images");
        let _ = op.start();
        let result = auto_update_images(&state).await;
        match &result {
            Ok(()) => info!("Done updating images"),
            Err(e) => error!("Failed updating images: {}", e),
        }
        op.complete(result);
    }
}

/// Daily expiry loop
pub async fn prune_expired_images_task(state: Arc<State>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(24 * 3600));
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }

        prune_expired_images_now(&state).await;
    }
}

/// One expiry pass: also used synchronously at startup so stale files
/// never coexist with live ones
pub async fn prune_expired_images_now(state: &Arc<State>) {
    let op = state.operations.create(
        OperationClass::Task,
        OperationType::ImagesExpire,
        crate::db::models::DEFAULT_PROJECT,
        HashMap::new(),
        serde_json::Map::new(),
        None,
    );

    debug!("Acquiring image task lock");
    let _task_guard = state.task_lock.lock().await;
    debug!("Acquired image task lock");

    info!("Pruning expired images");
    let _ = op.start();
    let result = prune_expired_images(state, &op).await;
    match &result {
        Ok(()) => info!("Done pruning expired images"),
        Err(e) => error!("Failed expiring images: {}", e),
    }
    op.complete(result);
}

/// Deterministic owner selection for an image.
///
/// Seeded with the number of records for the fingerprint so the same
/// member wins each hour; candidate ids are sorted first. Behaviour across
/// cluster resizes follows the seed, deliberately.
pub fn stable_random_member(seed: i64, member_ids: &[i64]) -> Option<i64> {
    if member_ids.is_empty() {
        return None;
    }

    let mut sorted = member_ids.to_vec();
    sorted.sort_unstable();

    let mut rng = rand::rngs::StdRng::seed_from_u64(seed as u64);
    let index = rng.gen_range(0..sorted.len());
    Some(sorted[index])
}

/// Update every auto-update image this member owns
pub async fn auto_update_images(state: &Arc<State>) -> Result<()> {
    let grouped = state
        .cluster
        .with(|conn| {
            Image::grouped_by_fingerprint(
                conn,
                &ImageFilter {
                    auto_update: Some(true),
                    ..Default::default()
                },
            )
        })
        .await
        .map_err(|e| Error::Other(format!("Unable to retrieve image fingerprints: {}", e)))?;

    let local_id = state.local_member_id().await?;

    for (fingerprint, images) in grouped {
        if state.shutdown.is_cancelled() {
            return Ok(());
        }

        let fp = Fingerprint::new(fingerprint.clone())?;

        let holder_ids = state
            .cluster
            .with({
                let fp = fp.clone();
                move |conn| Member::node_ids_with_image(conn, &fp)
            })
            .await?;

        // With several holders, exactly one member owns the update.
        if holder_ids.len() > 1 {
            let selected = stable_random_member(images.len() as i64, &holder_ids);
            if selected != local_id {
                debug!(
                    "Skipping image update for {}: not the selected member",
                    fingerprint
                );
                continue;
            }
        }

        let mut delete_ids = Vec::new();
        let mut new_image: Option<ImageInfo> = None;

        for image in &images {
            let id = image.id.expect("listed records carry their id");

            match auto_update_image(state, None, id, image, &image.project, false).await {
                Ok(Some(info)) => {
                    delete_ids.push(id);
                    if new_image.is_none() {
                        new_image = Some(info);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!(
                        "Failed to update image {} in project {}: {}",
                        fingerprint, image.project, e
                    );
                }
            }
        }

        if let Some(new_image) = new_image {
            if holder_ids.len() > 1 {
                if let Err(e) = super::replication::distribute_image(
                    state,
                    &fp,
                    &new_image,
                )
                .await
                {
                    error!(
                        "Failed to distribute new image {}: {}",
                        new_image.fingerprint, e
                    );
                }
            }

            // Remove the old records only after distribution.
            let _ = state
                .cluster
                .with(move |conn| {
                    for id in delete_ids {
                        if let Err(e) = Image::delete(conn, id) {
                            error!("Error deleting old image from database: {}", e);
                        }
                    }
                    Ok(())
                })
                .await;
        }
    }

    Ok(())
}

/// Refresh a single image from its upstream source.
///
/// Returns the new image info when the upstream fingerprint changed, None
/// when the image was already current (or the interval says not now).
pub async fn auto_update_image(
    state: &Arc<State>,
    op: Option<&Operation>,
    id: i64,
    image: &Image,
    project: &str,
    manual: bool,
) -> Result<Option<ImageInfo>> {
    let fingerprint = image.fingerprint.clone();

    if !manual {
        let project_name = project.to_string();
        let interval = state
            .cluster
            .with(move |conn| {
                Project::effective_i64(
                    conn,
                    &project_name,
                    "images.auto_update_interval",
                    DEFAULT_AUTO_UPDATE_INTERVAL,
                )
            })
            .await?;

        // Zero (or negative) disables auto-update for the project.
        if interval <= 0 {
            return Ok(None);
        }

        let elapsed_hours =
            ((Utc::now() - state.start_time).num_minutes() as f64 / 60.0).round() as i64;
        if elapsed_hours % interval != 0 {
            return Ok(None);
        }
    }

    let source = state
        .cluster
        .with(move |conn| Image::get_source(conn, id))
        .await
        .map_err(|e| {
            error!("Error getting source image for {}: {}", fingerprint, e);
            e
        })?;

    debug!(
        "Processing image {} from {} ({} alias {})",
        image.fingerprint, source.server, source.protocol, source.alias
    );

    let new_info = image_download(
        state,
        &ImageDownloadArgs {
            server: source.server.clone(),
            protocol: source.protocol.clone(),
            certificate: source.certificate.clone(),
            alias: source.alias.clone(),
            auto_update: true,
            public: image.public,
            cached: image.cached,
            project: project.to_string(),
            budget: -1,
            ..Default::default()
        },
    )
    .await
    .map_err(|e| {
        error!("Failed to update the image {}: {}", image.fingerprint, e);
        e
    })?;

    if new_info.fingerprint == image.fingerprint.as_str() {
        debug!("Image already up to date: {}", image.fingerprint);
        set_refresh_result(state, op, project, &image.fingerprint, false);
        return Ok(None);
    }

    let new_fp = Fingerprint::new(new_info.fingerprint.clone())?;

    // Stitch the record: cached/last-used metadata, aliases, profiles.
    let old_fp = image.fingerprint.clone();
    let project_db = project.to_string();
    let cached = image.cached;
    let last_used = image.last_used_at.unwrap_or_else(Utc::now);
    let stitch_fp = new_fp.clone();
    state
        .cluster
        .tx(move |tx| {
            let (new_id, _) = Image::get(tx, &project_db, &stitch_fp)?;

            if cached {
                Image::set_cached_and_last_use_date(tx, &project_db, &stitch_fp, last_used)?;
            } else {
                Image::update_last_use_date(tx, &project_db, &stitch_fp, last_used)?;
            }

            Image::move_aliases(tx, id, new_id)?;
            Image::copy_default_profiles(tx, id, new_id)?;

            // The old per-pool volumes die with the old image.
            for pool in StoragePool::pools_with_image(tx, &old_fp)? {
                debug!(
                    "Deleting image volume {} from storage pool {}",
                    old_fp, pool.name
                );
                StoragePool::remove_image(tx, &old_fp, pool.id)?;
            }

            Ok(())
        })
        .await?;

    // Remove the superseded blob.
    state.archive.delete(&image.fingerprint)?;

    set_refresh_result(state, op, project, &image.fingerprint, true);

    Ok(Some(new_info))
}

fn set_refresh_result(
    state: &Arc<State>,
    op: Option<&Operation>,
    project: &str,
    fingerprint: &Fingerprint,
    refreshed: bool,
) {
    if let Some(op) = op {
        let mut metadata = serde_json::Map::new();
        metadata.insert("refreshed".to_string(), refreshed.into());
        op.update_metadata(metadata);
    }

    if refreshed {
        state.events.send(
            LifecycleEvent::new(
                LifecycleAction::ImageRefreshed,
                project,
                format!("/1.0/images/{}", fingerprint),
            )
            .with_requestor(op.and_then(|op| op.requestor())),
        );
    }
}

/// Drop expired cached images.
///
/// A record expires `images.remote_cache_expiry` days after its last use
/// (or upload). The blob and per-pool volumes go only once every project
/// holding the fingerprint has expired.
pub async fn prune_expired_images(state: &Arc<State>, op: &Operation) -> Result<()> {
    let (expiry_days, grouped) = state
        .cluster
        .with(|conn| {
            let mut expiry_days = HashMap::new();
            for project in Project::list(conn)? {
                let days = Project::effective_i64(
                    conn,
                    &project.name,
                    "images.remote_cache_expiry",
                    DEFAULT_REMOTE_CACHE_EXPIRY,
                )?;
                expiry_days.insert(project.name, days);
            }

            let grouped = Image::grouped_by_fingerprint(
                conn,
                &ImageFilter {
                    cached: Some(true),
                    ..Default::default()
                },
            )?;

            Ok((expiry_days, grouped))
        })
        .await
        .map_err(|e| Error::Other(format!("Unable to retrieve project names: {}", e)))?;

    for (fingerprint, records) in grouped {
        // Anything not expired now will be expired at the next run; a
        // cancelled loop just stops early.
        if state.shutdown.is_cancelled() {
            return Ok(());
        }

        let fp = Fingerprint::new(fingerprint.clone())?;
        let mut deleted = 0usize;

        for record in &records {
            let days = expiry_days.get(&record.project).copied().unwrap_or(0);

            // Non-positive expiry disables expiry for the project.
            if days <= 0 {
                continue;
            }

            let reference = record.last_used_at.unwrap_or(record.upload_date);
            let expires = reference + ChronoDuration::days(days);
            if expires > Utc::now() {
                continue;
            }

            let id = record.id.expect("listed records carry their id");
            state
                .cluster
                .with(move |conn| Image::delete(conn, id))
                .await
                .map_err(|e| {
                    Error::Other(format!(
                        "Error deleting image {} in project {} from database: {}",
                        fingerprint, record.project, e
                    ))
                })?;

            deleted += 1;

            info!(
                "Deleted expired cached image record: {} in project {} (expired {})",
                fingerprint, record.project, expires
            );

            state.events.send(
                LifecycleEvent::new(
                    LifecycleAction::ImageDeleted,
                    &record.project,
                    format!("/1.0/images/{}", fingerprint),
                )
                .with_requestor(op.requestor()),
            );
        }

        // Files and volumes stay while any project still holds the image.
        if deleted < records.len() {
            continue;
        }

        let cleanup_fp = fp.clone();
        state
            .cluster
            .with(move |conn| {
                for pool in StoragePool::pools_with_image(conn, &cleanup_fp)? {
                    debug!(
                        "Deleting image volume {} from storage pool {}",
                        cleanup_fp, pool.name
                    );
                    StoragePool::remove_image(conn, &cleanup_fp, pool.id)?;
                }
                Member::remove_image_everywhere(conn, &cleanup_fp)?;
                Ok(())
            })
            .await?;

        state.archive.delete(&fp)?;

        info!("Deleted expired cached image files and volumes: {}", fp);
    }

    Ok(())
}

/// Remove files in the image directory that no record references.
///
/// Skipped entirely when the image directory sits on a multi-node shared
/// volume: other members may own those files.
pub async fn prune_leftover_images(state: &Arc<State>) {
    let op = state.operations.create(
        OperationClass::Task,
        OperationType::ImagesPruneLeftover,
        crate::db::models::DEFAULT_PROJECT,
        HashMap::new(),
        serde_json::Map::new(),
        None,
    );

    debug!("Acquiring image task lock");
    let _task_guard = state.task_lock.lock().await;
    debug!("Acquired image task lock");

    info!("Cleaning up leftover image files");
    let _ = op.start();
    let result = prune_leftover_images_inner(state).await;
    match &result {
        Ok(()) => info!("Done cleaning up leftover image files"),
        Err(e) => error!("Failed cleaning up leftover image files: {}", e),
    }
    op.complete(result);
}

async fn prune_leftover_images_inner(state: &Arc<State>) -> Result<()> {
    // Shared image storage: leave foreign files alone.
    let volume = state.images_volume().await?;
    if !volume.is_empty() {
        let (pool_name, _) = split_volume(&volume)?;
        let remote = state
            .cluster
            .with(move |conn| {
                Ok(match StoragePool::get_by_name(conn, &pool_name) {
                    Ok(pool) => pool.is_remote(),
                    Err(_) => false,
                })
            })
            .await?;

        if remote {
            debug!("Skipping leftover cleanup: image volume is multi-node");
            return Ok(());
        }
    }

    let local_id = state.local_member_id().await?;
    let known: Vec<String> = state
        .cluster
        .with(move |conn| match local_id {
            Some(node_id) => Member::local_fingerprints(conn, node_id),
            None => {
                // Standalone server: every record is local.
                let images = Image::list(conn, &ImageFilter::default())?;
                Ok(images
                    .into_iter()
                    .map(|i| i.fingerprint.to_string())
                    .collect())
            }
        })
        .await
        .map_err(|e| Error::Other(format!("Unable to retrieve the list of images: {}", e)))?;

    for entry in state.archive.entries()? {
        let bare = entry.split('.').next().unwrap_or(&entry);
        if !known.iter().any(|fp| fp == bare) {
            let path = state.archive.dir().join(&entry);
            std::fs::remove_file(&path).map_err(|e| {
                Error::Other(format!("Unable to remove leftover image: {}: {}", entry, e))
            })?;
            debug!("Removed leftover image file: {}", entry);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::InstanceType;
    use crate::server::DaemonConfig;

    async fn test_state() -> (tempfile::TempDir, Arc<State>) {
        let dir = tempfile::tempdir().unwrap();
        let state = State::new(DaemonConfig::default().with_var_dir(dir.path())).unwrap();
        (dir, state)
    }

    #[test]
    fn test_stable_random_member_is_deterministic() {
        let ids = vec![7, 3, 5];

        let first = stable_random_member(4, &ids).unwrap();
        for _ in 0..10 {
            assert_eq!(stable_random_member(4, &ids).unwrap(), first);
        }

        // Order of candidates does not matter
        assert_eq!(stable_random_member(4, &[3, 5, 7]).unwrap(), first);

        // Empty candidate set
        assert_eq!(stable_random_member(4, &[]), None);
    }

    #[tokio::test]
    async fn test_expiry_disabled_by_zero() {
        let (_dir, state) = test_state().await;

        // Cached record well past any default expiry
        let mut blob: &[u8] = b"old blob";
        let (fp, _) = state.archive.write(&mut blob, None, None).unwrap();

        let record_fp = fp.clone();
        state
            .cluster
            .with(move |conn| {
                let mut image =
                    Image::new("default", record_fp.clone(), InstanceType::Container);
                image.cached = true;
                image.upload_date = Utc::now() - ChronoDuration::days(400);
                image.insert(conn, &[])?;
                Project::config_set(conn, "default", "images.remote_cache_expiry", "0")
            })
            .await
            .unwrap();

        let op = state.operations.create(
            OperationClass::Task,
            OperationType::ImagesExpire,
            "default",
            HashMap::new(),
            serde_json::Map::new(),
            None,
        );
        prune_expired_images(&state, &op).await.unwrap();

        // Zero expiry disables the mechanism regardless of age
        let still_there = state
            .cluster
            .with(move |conn| Image::exists(conn, "default", &fp))
            .await
            .unwrap();
        assert!(still_there);
    }

    #[tokio::test]
    async fn test_expired_cached_image_removed() {
        let (_dir, state) = test_state().await;

        let mut blob: &[u8] = b"old blob";
        let (fp, _) = state.archive.write(&mut blob, None, None).unwrap();

        let record_fp = fp.clone();
        state
            .cluster
            .with(move |conn| {
                let mut image =
                    Image::new("default", record_fp.clone(), InstanceType::Container);
                image.cached = true;
                image.upload_date = Utc::now() - ChronoDuration::days(30);
                image.insert(conn, &[])?;
                Ok(())
            })
            .await
            .unwrap();

        let op = state.operations.create(
            OperationClass::Task,
            OperationType::ImagesExpire,
            "default",
            HashMap::new(),
            serde_json::Map::new(),
            None,
        );
        prune_expired_images(&state, &op).await.unwrap();

        let check_fp = fp.clone();
        let gone = state
            .cluster
            .with(move |conn| Image::exists(conn, "default", &check_fp))
            .await
            .unwrap();
        assert!(!gone);
        assert!(!state.archive.exists(&fp));
    }

    #[tokio::test]
    async fn test_blob_retained_while_other_project_is_fresh() {
        let (_dir, state) = test_state().await;

        let mut blob: &[u8] = b"shared blob";
        let (fp, _) = state.archive.write(&mut blob, None, None).unwrap();

        let record_fp = fp.clone();
        state
            .cluster
            .with(move |conn| {
                Project::create(conn, "staging")?;

                // Expired in default
                let mut old = Image::new("default", record_fp.clone(), InstanceType::Container);
                old.cached = true;
                old.upload_date = Utc::now() - ChronoDuration::days(30);
                old.insert(conn, &[])?;

                // Fresh in staging
                let mut fresh =
                    Image::new("staging", record_fp.clone(), InstanceType::Container);
                fresh.cached = true;
                fresh.upload_date = Utc::now();
                fresh.insert(conn, &[])?;

                Ok(())
            })
            .await
            .unwrap();

        let op = state.operations.create(
            OperationClass::Task,
            OperationType::ImagesExpire,
            "default",
            HashMap::new(),
            serde_json::Map::new(),
            None,
        );
        prune_expired_images(&state, &op).await.unwrap();

        // Only the expired project record is gone; the blob stays
        let check_fp = fp.clone();
        let (default_gone, staging_kept) = state
            .cluster
            .with(move |conn| {
                Ok((
                    !Image::exists(conn, "default", &check_fp)?,
                    Image::exists(conn, "staging", &check_fp)?,
                ))
            })
            .await
            .unwrap();
        assert!(default_gone);
        assert!(staging_kept);
        assert!(state.archive.exists(&fp));
    }

    #[tokio::test]
    async fn test_leftover_cleanup() {
        let (_dir, state) = test_state().await;

        // A referenced blob
        let mut blob: &[u8] = b"referenced";
        let (fp, _) = state.archive.write(&mut blob, None, None).unwrap();
        let record_fp = fp.clone();
        state
            .cluster
            .with(move |conn| {
                Image::new("default", record_fp.clone(), InstanceType::Container)
                    .insert(conn, &[])?;
                Ok(())
            })
            .await
            .unwrap();

        // An orphan file with a rootfs suffix
        let orphan = "deadbeef".repeat(8);
        std::fs::write(state.archive.dir().join(&orphan), b"junk").unwrap();
        std::fs::write(
            state.archive.dir().join(format!("{}.rootfs", orphan)),
            b"junk",
        )
        .unwrap();

        prune_leftover_images(&state).await;

        assert!(state.archive.exists(&fp));
        assert!(!state.archive.dir().join(&orphan).exists());
        assert!(!state
            .archive
            .dir()
            .join(format!("{}.rootfs", orphan))
            .exists());
    }
}
