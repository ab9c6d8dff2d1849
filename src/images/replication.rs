// src/images/replication.rs

//! Cluster-wide image replication.
//!
//! Two mechanisms: `distribute_image` pushes a freshly auto-updated blob
//! to every member that held the old one, and the hourly sync loop (leader
//! only) tops up under-replicated images to `images.images_minimal_replica`
//! holders.

use super::{headers, ImageInfo, ImagesPost, ImagesPostSource};
use crate::db::models::{split_volume, Member, StoragePool};
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::operations::{OperationClass, OperationType};
use crate::server::State;
use rand::seq::SliceRandom;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Built-in default for `images.images_minimal_replica`
pub const DEFAULT_MINIMAL_REPLICA: i64 = 3;

/// Push a new image to every member that previously held the old one.
///
/// Members whose `storage.images_volume` names a remote pool already seen
/// in the dedup list share their image volume, so pushing again would be
/// redundant. On each remote the per-pool volumes are refreshed through
/// `/internal/image-optimize` and the old volume dropped.
pub async fn distribute_image(
    state: &Arc<State>,
    old_fingerprint: &Fingerprint,
    new_image: &ImageInfo,
) -> Result<()> {
    let local_address = state.local_address().await?;
    let new_fp = Fingerprint::new(new_image.fingerprint.clone())?;

    // Seed the dedup list with our own image volume when it is remote.
    let mut image_volumes: Vec<String> = Vec::new();
    let volume = state.images_volume().await?;
    if !volume.is_empty() {
        match remote_volume(state, &volume).await {
            Ok(true) => image_volumes.push(volume),
            Ok(false) => {}
            Err(e) => error!("Failed to load config: {}", e),
        }
    }

    let (holders, pool_names) = {
        let old_fp = old_fingerprint.clone();
        let query_fp = new_fp.clone();
        state
            .cluster
            .with(move |conn| {
                let holders = Member::nodes_with_image(conn, &old_fp)?;
                let pools = StoragePool::pools_with_image(conn, &query_fp)?
                    .into_iter()
                    .map(|p| p.name)
                    .collect::<Vec<_>>();
                Ok((holders, pools))
            })
            .await?
    };

    for address in holders {
        if address == local_address {
            continue;
        }

        if state.shutdown.is_cancelled() {
            return Err(Error::Other("Cancelled".to_string()));
        }

        // Skip members sharing an image volume we already pushed to.
        let peer_volume = peer_images_volume(state, &address).await;
        if let Some(peer_volume) = peer_volume {
            if !peer_volume.is_empty() {
                if image_volumes.contains(&peer_volume) {
                    debug!(
                        "Skipping image distribution to {}: shared image volume {}",
                        address, peer_volume
                    );
                    continue;
                }

                if let Ok(true) = remote_volume(state, &peer_volume).await {
                    image_volumes.push(peer_volume);
                }
            }
        }

        push_image_to_member(state, &address, new_image, &new_fp).await?;

        for pool_name in &pool_names {
            if pool_name.is_empty() {
                continue;
            }

            let optimize = state
                .http
                .post(format!("https://{}/internal/image-optimize", address))
                .json(&json!({ "image": new_image, "pool": pool_name }))
                .send()
                .await;

            if let Err(e) = optimize.and_then(|r| r.error_for_status()) {
                error!(
                    "Failed creating new image in storage pool {} on {}: {}",
                    pool_name, address, e
                );
            }

            debug!(
                "Deleting old image volume {} from storage pool {} on {}",
                old_fingerprint, pool_name, address
            );
        }
    }

    Ok(())
}

/// Whether a `pool/volume` setting points at a shared remote pool
async fn remote_volume(state: &Arc<State>, volume: &str) -> Result<bool> {
    let (pool_name, _) = split_volume(volume)?;
    state
        .cluster
        .with(move |conn| {
            Ok(match StoragePool::get_by_name(conn, &pool_name) {
                Ok(pool) => pool.is_remote(),
                Err(_) => false,
            })
        })
        .await
}

/// Ask a member for its `storage.images_volume` setting
async fn peer_images_volume(state: &Arc<State>, address: &str) -> Option<String> {
    #[derive(serde::Deserialize)]
    struct ServerInfo {
        #[serde(default)]
        config: HashMap<String, String>,
    }

    let info: ServerInfo = state
        .http
        .get(format!("https://{}/1.0", address))
        .send()
        .await
        .ok()?
        .error_for_status()
        .ok()?
        .json()
        .await
        .ok()?;

    Some(
        info.config
            .get("storage.images_volume")
            .cloned()
            .unwrap_or_default(),
    )
}

/// Push both blob files to a member as a cluster notification
async fn push_image_to_member(
    state: &Arc<State>,
    address: &str,
    image: &ImageInfo,
    fingerprint: &Fingerprint,
) -> Result<()> {
    info!("Distributing image {} to {}", fingerprint, address);

    let streams = state.archive.read(fingerprint, false)?;
    let meta_bytes = {
        let mut data = Vec::new();
        use std::io::Read;
        let mut meta = streams.meta;
        meta.read_to_end(&mut data)?;
        data
    };

    let request = state
        .http
        .post(format!("https://{}/1.0/images", address))
        .header(headers::NOTIFY, "1")
        .header(headers::FINGERPRINT, fingerprint.as_str())
        .header(headers::FILENAME, &image.filename);

    let response = match streams.rootfs {
        Some(mut rootfs) => {
            let mut rootfs_bytes = Vec::new();
            use std::io::Read;
            rootfs.read_to_end(&mut rootfs_bytes)?;

            let rootfs_part_name = if image.image_type == "virtual-machine" {
                "rootfs.img"
            } else {
                "rootfs"
            };

            let form = reqwest::multipart::Form::new()
                .part(
                    "metadata",
                    reqwest::multipart::Part::bytes(meta_bytes).file_name("metadata"),
                )
                .part(
                    rootfs_part_name,
                    reqwest::multipart::Part::bytes(rootfs_bytes).file_name(rootfs_part_name),
                );

            request.multipart(form).send().await?
        }
        None => {
            request
                .header("Content-Type", "application/octet-stream")
                .body(meta_bytes)
                .send()
                .await?
        }
    };

    response.error_for_status()?;
    Ok(())
}

/// Hourly sync loop; only the raft leader runs it
pub async fn auto_sync_images_task(state: Arc<State>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(3600));
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }

        match is_leader(&state).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("Skipping image synchronization task since we're not leader");
                continue;
            }
            Err(e) => {
                error!("Failed to get leader cluster member address: {}", e);
                continue;
            }
        }

        let op = state.operations.create(
            OperationClass::Task,
            OperationType::ImagesSynchronize,
            crate::db::models::DEFAULT_PROJECT,
            HashMap::new(),
            serde_json::Map::new(),
            None,
        );

        debug!("Acquiring image task lock");
        let _task_guard = state.task_lock.lock().await;
        debug!("Acquired image task lock");

        info!("Synchronizing images across the cluster");
        let _ = op.start();
        let result = auto_sync_images(&state).await;
        match &result {
            Ok(()) => info!("Done synchronizing images across the cluster"),
            Err(e) => error!("Failed synchronizing images: {}", e),
        }
        op.complete(result);
    }
}

/// The leader is the lowest-id voter in the local raft configuration.
///
/// Not clustered (no raft rows) means no leader and no sync duty.
async fn is_leader(state: &Arc<State>) -> Result<bool> {
    let local_address = state.local_address().await?;
    if local_address.is_empty() {
        return Ok(false);
    }

    state
        .local
        .with(move |conn| {
            use rusqlite::OptionalExtension;

            let leader: Option<String> = conn
                .query_row(
                    "SELECT address FROM raft_nodes WHERE role = 0 ORDER BY id LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .optional()?;

            Ok(leader.as_deref() == Some(local_address.as_str()))
        })
        .await
}

/// Top up replicas for every image in the cluster
pub async fn auto_sync_images(state: &Arc<State>) -> Result<()> {
    let grouped = state
        .cluster
        .with(|conn| {
            crate::db::models::Image::grouped_by_fingerprint(conn, &Default::default())
        })
        .await
        .map_err(|e| Error::Other(format!("Failed to query image fingerprints: {}", e)))?;

    for (fingerprint, records) in grouped {
        if state.shutdown.is_cancelled() {
            return Ok(());
        }

        let project = records
            .first()
            .map(|r| r.project.clone())
            .unwrap_or_else(|| crate::db::models::DEFAULT_PROJECT.to_string());

        if let Err(e) = image_sync_between_nodes(state, &project, &fingerprint).await {
            error!(
                "Failed to synchronize images for {} in project {}: {}",
                fingerprint, project, e
            );
        }
    }

    Ok(())
}

/// Replicate one image onto enough members.
///
/// `images.images_minimal_replica` of −1 means every member. A random
/// holder serves as source; each round picks a random member still missing
/// the image and asks it to pull.
pub async fn image_sync_between_nodes(
    state: &Arc<State>,
    project: &str,
    fingerprint: &str,
) -> Result<()> {
    info!(
        "Syncing image to members started: {} in project {}",
        fingerprint, project
    );

    let fp = Fingerprint::new(fingerprint.to_string())?;

    let mut desired = state
        .global_i64("images.images_minimal_replica", DEFAULT_MINIMAL_REPLICA)
        .await?;

    let (holders, member_count) = {
        let fp = fp.clone();
        state
            .cluster
            .with(move |conn| {
                Ok((
                    Member::nodes_with_image(conn, &fp)?,
                    Member::count(conn)?,
                ))
            })
            .await
            .map_err(|e| {
                Error::Other(format!(
                    "Failed to get nodes for the image synchronization: {}",
                    e
                ))
            })?
    };

    // -1 means that we want to replicate the image on all nodes.
    if desired == -1 {
        desired = member_count;
    }

    if holders.is_empty() {
        info!(
            "No members have image, nothing to do: {} in project {}",
            fingerprint, project
        );
        return Ok(());
    }

    let missing_count = desired - holders.len() as i64;
    if missing_count <= 0 {
        info!(
            "Sufficient members have image: {} in project {} ({} >= {})",
            fingerprint,
            project,
            holders.len(),
            desired
        );
        return Ok(());
    }

    // Pick a random holder as the pull source.
    let source = holders
        .choose(&mut rand::thread_rng())
        .cloned()
        .expect("holders is non-empty");

    for _ in 0..missing_count {
        let candidates = {
            let fp = fp.clone();
            state
                .cluster
                .with(move |conn| Member::nodes_without_image(conn, &fp))
                .await
                .map_err(|e| {
                    Error::Other(format!(
                        "Failed to get nodes for the image synchronization: {}",
                        e
                    ))
                })?
        };

        if candidates.is_empty() {
            info!("All members have image: {} in project {}", fingerprint, project);
            return Ok(());
        }

        let target = candidates
            .choose(&mut rand::thread_rng())
            .cloned()
            .expect("candidates is non-empty");

        info!(
            "Copying image {} to member {} (project {})",
            fingerprint, target, project
        );

        let body = ImagesPost {
            source: Some(ImagesPostSource {
                source_type: "image".to_string(),
                mode: "pull".to_string(),
                server: format!("https://{}", source),
                fingerprint: fingerprint.to_string(),
                project: project.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };

        state
            .http
            .post(format!("https://{}/1.0/images?project={}", target, project))
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::Other(format!("Failed to copy image to {}: {}", target, e)))?;
    }

    info!(
        "Syncing image to members finished: {} in project {}",
        fingerprint, project
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::server::DaemonConfig;

    async fn test_state() -> (tempfile::TempDir, Arc<State>) {
        let dir = tempfile::tempdir().unwrap();
        let state = State::new(DaemonConfig::default().with_var_dir(dir.path())).unwrap();
        (dir, state)
    }

    #[tokio::test]
    async fn test_not_clustered_is_never_leader() {
        let (_dir, state) = test_state().await;
        assert!(!is_leader(&state).await.unwrap());
    }

    #[tokio::test]
    async fn test_leader_is_lowest_voter() {
        let (_dir, state) = test_state().await;

        state
            .local
            .with(|conn| {
                db::node_config_set(conn, "cluster.https_address", "10.0.0.1:8443")?;
                conn.execute_batch(
                    "INSERT INTO raft_nodes (id, name, address, role) VALUES
                         (1, 'n1', '10.0.0.1:8443', 0),
                         (2, 'n2', '10.0.0.2:8443', 0),
                         (3, 'n3', '10.0.0.3:8443', 2)",
                )?;
                Ok(())
            })
            .await
            .unwrap();

        assert!(is_leader(&state).await.unwrap());

        // A spare with a lower id would not change leadership; a voter
        // with a lower id on another address does.
        state
            .local
            .with(|conn| db::node_config_set(conn, "cluster.https_address", "10.0.0.2:8443"))
            .await
            .unwrap();
        assert!(!is_leader(&state).await.unwrap());
    }

    #[tokio::test]
    async fn test_sync_skips_replicated_enough() {
        let (_dir, state) = test_state().await;

        let fp = crate::fingerprint::fingerprint_bytes(b"blob");
        let record_fp = fp.clone();
        state
            .cluster
            .with(move |conn| {
                let n1 = Member::create(conn, "n1", "10.0.0.1:8443")?;
                let n2 = Member::create(conn, "n2", "10.0.0.2:8443")?;
                Member::add_image(conn, &record_fp, n1)?;
                Member::add_image(conn, &record_fp, n2)?;
                db::config_set(conn, "images.images_minimal_replica", "2")
            })
            .await
            .unwrap();

        // Enough holders: returns without touching the network
        image_sync_between_nodes(&state, "default", fp.as_str())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_sync_no_holders_is_noop() {
        let (_dir, state) = test_state().await;

        let fp = crate::fingerprint::fingerprint_bytes(b"nowhere");
        image_sync_between_nodes(&state, "default", fp.as_str())
            .await
            .unwrap();
    }
}
