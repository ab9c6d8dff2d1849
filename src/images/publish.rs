// src/images/publish.rs

//! Publishing an instance as an image.
//!
//! Publishes are globally serialised: the CPU and I/O load of a publish is
//! such that running several in parallel takes longer than running them
//! one after the other, and two publishes of the same instance would race
//! on storage and end with conflicting fingerprints.
//!
//! The export, optional compression and fingerprinting happen in a single
//! pass: the instance driver writes the tarball into a pipe, a compressor
//! task drains it into the temp file, and the hash is taken over whatever
//! lands on disk.

use super::{project_image_budget, ImageInfo, ImagesPost, QuotaWriter};
use crate::archive::compression::compress_stream;
use crate::db::models::{Image, ImageAlias, Member, Profile};
use crate::error::{Error, Result};
use crate::fingerprint::{Fingerprint, FingerprintHasher};
use crate::instance::{is_snapshot_name, Instance};
use crate::lifecycle::{authz_hook, LifecycleAction, LifecycleEvent};
use crate::operations::Operation;
use crate::progress::{set_progress_metadata, ProgressTracker, ProgressWriter};
use crate::server::State;
use chrono::{TimeZone, Utc};
use serde_json::Map;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use tracing::info;
use walkdir::WalkDir;

/// Default compression when neither project nor global config names one
pub const DEFAULT_COMPRESSION: &str = "gzip";

/// Publish an instance (or snapshot) as an image
pub async fn publish_instance(
    state: &Arc<State>,
    project: &str,
    req: &ImagesPost,
    op: &Operation,
) -> Result<ImageInfo> {
    let source = req
        .source
        .as_ref()
        .ok_or_else(|| Error::Validation("No source provided".to_string()))?;

    if source.name.is_empty() || source.source_type.is_empty() {
        return Err(Error::Validation("No source provided".to_string()));
    }

    match source.source_type.as_str() {
        "snapshot" => {
            if !is_snapshot_name(&source.name) {
                return Err(Error::Validation("Not a snapshot".to_string()));
            }
        }
        "container" | "virtual-machine" | "instance" => {
            if is_snapshot_name(&source.name) {
                return Err(Error::Validation("This is a snapshot".to_string()));
            }
        }
        other => {
            return Err(Error::Validation(format!("Bad type: {}", other)));
        }
    }

    let split = match req.format.as_deref() {
        None | Some("unified") => false,
        Some("split") => true,
        Some(other) => {
            return Err(Error::Validation(format!("Invalid image format: {}", other)));
        }
    };

    let instance = state.load_instance(project, &source.name)?;

    let _publish_guard = state.publish_lock.lock().await;

    let project_owned = project.to_string();
    let (budget, compress) = state
        .cluster
        .with({
            let project = project_owned.clone();
            let requested = req.compression_algorithm.clone();
            move |conn| {
                let budget = project_image_budget(conn, &project)?;

                let compress = match requested {
                    Some(algo) => algo,
                    None => {
                        match crate::db::models::Project::config_get(
                            conn,
                            &project,
                            "images.compression_algorithm",
                        )? {
                            Some(algo) => algo,
                            None => crate::db::config_get(conn, "images.compression_algorithm")?
                                .unwrap_or_else(|| DEFAULT_COMPRESSION.to_string()),
                        }
                    }
                };

                Ok((budget, compress))
            }
        })
        .await?;

    // Export + compress + hash in one pass, off the async runtime.
    let images_dir = state.archive.dir().to_path_buf();
    let op_progress = op.clone();
    let properties = req.properties.clone();
    let expires_at = req.expires_at;
    let export_instance = instance.clone();

    let outcome = tokio::task::spawn_blocking(move || {
        build_image_files(
            &*export_instance,
            &images_dir,
            split,
            &compress,
            budget,
            properties,
            expires_at,
            op_progress,
        )
    })
    .await
    .map_err(|e| Error::Other(format!("Image pack task failed: {}", e)))??;

    let _guard = state.image_locks.lock(outcome.fingerprint.as_str()).await;

    // Blob first, record second; leftover cleanup reclaims orphans.
    let freshly_published = !state.archive.exists(&outcome.fingerprint);
    if freshly_published {
        state.archive.publish(
            &outcome.fingerprint,
            &outcome.meta_tmp,
            outcome.rootfs_tmp.as_deref(),
        )?;
    } else {
        let _ = std::fs::remove_file(&outcome.meta_tmp);
        if let Some(rootfs) = &outcome.rootfs_tmp {
            let _ = std::fs::remove_file(rootfs);
        }
    }

    let node_id = state.local_member_id().await?;
    let fingerprint = outcome.fingerprint.clone();
    let project_db = project_owned.clone();
    let filename = req.filename.clone();
    let public = req.public;
    let aliases = req.aliases.clone();
    let profiles = req.profiles.clone();
    let record_properties = outcome.properties.clone();
    let size = outcome.size;
    let image_type = instance.instance_type();
    let architecture = instance.architecture();
    let record_expires = outcome.expires_at;

    let commit = state
        .cluster
        .tx(move |tx| {
            if Image::exists(tx, &project_db, &fingerprint)? {
                return Err(Error::AlreadyExists(format!(
                    "The image already exists: {}",
                    fingerprint
                )));
            }

            let profile_ids = if profiles.is_empty() {
                vec![Profile::get_by_name(tx, &project_db, "default")?.id]
            } else {
                Profile::resolve_names(tx, &project_db, &profiles)?
            };

            let mut image = Image::new(&project_db, fingerprint.clone(), image_type);
            image.filename = filename;
            image.size = size;
            image.public = public;
            image.architecture = architecture;
            image.created_at = Some(Utc::now());
            image.expires_at = record_expires;
            image.properties = record_properties;

            let id = image.insert(tx, &profile_ids)?;

            for alias in &aliases {
                ImageAlias::create(tx, &project_db, &alias.name, id, &alias.description)?;
            }

            if let Some(node_id) = node_id {
                Member::add_image(tx, &fingerprint, node_id)?;
            }

            Ok(id)
        })
        .await;

    if let Err(e) = commit {
        if freshly_published {
            let referenced = state
                .cluster
                .with({
                    let fp = outcome.fingerprint.clone();
                    move |conn| Image::exists_anywhere(conn, &fp)
                })
                .await
                .unwrap_or(true);
            if !referenced {
                let _ = state.archive.delete(&outcome.fingerprint);
            }
        }
        return Err(e);
    }

    info!(
        "Instance published as image: {} ({} bytes) in project {}",
        outcome.fingerprint, outcome.size, project
    );

    state.events.send(
        LifecycleEvent::new(
            LifecycleAction::ImageCreated,
            project,
            format!("/1.0/images/{}", outcome.fingerprint),
        )
        .with_requestor(op.requestor())
        .with_context("type", image_type.as_str().into()),
    );
    authz_hook(
        "add image",
        state.authorizer.add_image(project, outcome.fingerprint.as_str()),
    );

    let fingerprint = outcome.fingerprint.clone();
    state
        .cluster
        .with(move |conn| {
            let (id, image) = Image::get(conn, &project_owned, &fingerprint)?;
            ImageInfo::from_record(conn, id, &image)
        })
        .await
}

struct PublishOutcome {
    fingerprint: Fingerprint,
    size: i64,
    meta_tmp: PathBuf,
    rootfs_tmp: Option<PathBuf>,
    properties: std::collections::HashMap<String, String>,
    expires_at: Option<chrono::DateTime<Utc>>,
}

/// Export the instance into temp files, compressing and hashing in-pass
#[allow(clippy::too_many_arguments)]
fn build_image_files(
    instance: &dyn Instance,
    images_dir: &std::path::Path,
    split: bool,
    compress: &str,
    budget: i64,
    properties: std::collections::HashMap<String, String>,
    expires_at: Option<chrono::DateTime<Utc>>,
    op: Operation,
) -> Result<PublishOutcome> {
    // Close estimate of total input, purely to drive progress metadata.
    let mut total_size = 0i64;
    for entry in WalkDir::new(instance.rootfs_path()).into_iter().flatten() {
        if let Ok(meta) = entry.metadata() {
            total_size += meta.len() as i64;
        }
    }

    let meta_tmp = tempfile::Builder::new()
        .prefix(".paddock_build_")
        .tempfile_in(images_dir)?;
    let rootfs_tmp = tempfile::Builder::new()
        .prefix(".paddock_build_")
        .tempfile_in(images_dir)?;

    let progress = {
        let op = op.clone();
        Arc::new(move |percent: i64, speed: i64| {
            let mut metadata = Map::new();
            set_progress_metadata(
                &mut metadata,
                "create_image_from_container_pack",
                "Image pack",
                percent,
                total_size * (percent / 100),
                speed,
            );
            op.update_metadata(metadata);
        })
    };

    let result = export_streams(
        instance,
        meta_tmp.as_file(),
        split.then(|| rootfs_tmp.as_file()),
        compress,
        budget,
        total_size,
        progress,
        &properties,
        expires_at,
    );

    let meta = match result {
        Ok(meta) => meta,
        Err(e) => return Err(e),
    };

    // Size and fingerprint cover both files for split images.
    let mut size = meta_tmp.as_file().metadata()?.len() as i64;
    let fingerprint = if split {
        size += rootfs_tmp.as_file().metadata()?.len() as i64;

        let mut hasher = FingerprintHasher::new();
        for file in [meta_tmp.path(), rootfs_tmp.path()] {
            let mut f = File::open(file)?;
            let mut buffer = [0u8; 65536];
            loop {
                let n = f.read(&mut buffer)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buffer[..n]);
            }
        }
        hasher.finalize()
    } else {
        let mut f = File::open(meta_tmp.path())?;
        crate::fingerprint::fingerprint_reader(&mut f)?
    };

    let record_expires = expires_at.or_else(|| {
        (meta.expiry_date > 0)
            .then(|| Utc.timestamp_opt(meta.expiry_date, 0).single())
            .flatten()
    });

    let (_, meta_path) = meta_tmp.keep().map_err(|e| Error::Io(e.error))?;
    let rootfs_path = if split {
        let (_, path) = rootfs_tmp.keep().map_err(|e| Error::Io(e.error))?;
        Some(path)
    } else {
        None
    };

    Ok(PublishOutcome {
        fingerprint,
        size,
        meta_tmp: meta_path,
        rootfs_tmp: rootfs_path,
        properties: meta.properties,
        expires_at: record_expires,
    })
}

/// Wire the export through progress, quota and (optionally) a compressor
#[allow(clippy::too_many_arguments)]
fn export_streams(
    instance: &dyn Instance,
    meta_file: &File,
    rootfs_file: Option<&File>,
    compress: &str,
    budget: i64,
    total_size: i64,
    progress: Arc<dyn Fn(i64, i64) + Send + Sync>,
    properties: &std::collections::HashMap<String, String>,
    expires_at: Option<chrono::DateTime<Utc>>,
) -> Result<crate::archive::metadata::ImageMetadata> {
    let tracker = |handler: Arc<dyn Fn(i64, i64) + Send + Sync>| ProgressTracker {
        length: total_size,
        handler,
    };

    if compress == "none" {
        // Straight to disk, no helper task.
        let mut meta_writer = QuotaWriter::new(
            ProgressWriter::new(meta_file.try_clone()?, tracker(progress.clone())),
            budget,
        );

        let meta = if let Some(rootfs_file) = rootfs_file {
            let mut rootfs_writer = QuotaWriter::new(
                ProgressWriter::new(rootfs_file.try_clone()?, tracker(progress.clone())),
                budget,
            );
            instance.export(
                &mut meta_writer,
                Some(&mut rootfs_writer),
                properties,
                expires_at,
                &ProgressTracker::silent(),
            )?
        } else {
            instance.export(
                &mut meta_writer,
                None,
                properties,
                expires_at,
                &ProgressTracker::silent(),
            )?
        };

        return Ok(meta);
    }

    // Compressing: the export writes into a pipe, a helper thread drains
    // it through the compressor into the file.
    let (meta_pipe_writer, meta_pipe_reader) = pipe();
    let meta_out = meta_file.try_clone()?;
    let compress_owned = compress.to_string();
    let meta_helper = std::thread::spawn(move || -> Result<()> {
        let mut reader = meta_pipe_reader;
        let mut out = meta_out;
        compress_stream(&compress_owned, &mut reader, &mut out)
    });

    let mut rootfs_helper = None;
    let mut rootfs_pipe_writer = None;
    if let Some(rootfs_file) = rootfs_file {
        let (writer, reader) = pipe();
        let rootfs_out = rootfs_file.try_clone()?;
        let compress_owned = compress.to_string();
        rootfs_helper = Some(std::thread::spawn(move || -> Result<()> {
            let mut reader = reader;
            let mut out = rootfs_out;
            compress_stream(&compress_owned, &mut reader, &mut out)
        }));
        rootfs_pipe_writer = Some(writer);
    }

    let mut meta_writer = QuotaWriter::new(
        ProgressWriter::new(meta_pipe_writer, tracker(progress.clone())),
        budget,
    );

    let export_result = if let Some(writer) = rootfs_pipe_writer {
        let mut rootfs_writer =
            QuotaWriter::new(ProgressWriter::new(writer, tracker(progress.clone())), budget);
        let result = instance.export(
            &mut meta_writer,
            Some(&mut rootfs_writer),
            properties,
            expires_at,
            &ProgressTracker::silent(),
        );
        drop(rootfs_writer);
        result
    } else {
        instance.export(
            &mut meta_writer,
            None,
            properties,
            expires_at,
            &ProgressTracker::silent(),
        )
    };

    // Closing the write side lets the compressor see EOF and finish.
    drop(meta_writer);

    let meta_compress = meta_helper
        .join()
        .map_err(|_| Error::Other("Compression helper panicked".to_string()))?;
    let rootfs_compress = match rootfs_helper {
        Some(helper) => helper
            .join()
            .map_err(|_| Error::Other("Compression helper panicked".to_string()))?,
        None => Ok(()),
    };

    // A compressor failure closed the pipe under the exporter; its error
    // is the interesting one, the exporter's is discarded.
    meta_compress?;
    rootfs_compress?;

    let meta = export_result?;
    Ok(meta)
}

/// In-process pipe with close semantics.
///
/// Dropping the reader makes further writes fail with broken-pipe, which
/// is how a failed compressor unblocks the exporter.
fn pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::sync_channel::<Vec<u8>>(16);
    (
        PipeWriter { tx },
        PipeReader {
            rx,
            buffer: Vec::new(),
            pos: 0,
        },
    )
}

struct PipeWriter {
    tx: mpsc::SyncSender<Vec<u8>>,
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct PipeReader {
    rx: mpsc::Receiver<Vec<u8>>,
    buffer: Vec<u8>,
    pos: usize,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.buffer.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.buffer = chunk;
                    self.pos = 0;
                }
                // Writer gone: EOF
                Err(_) => return Ok(0),
            }
        }

        let n = (self.buffer.len() - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&self.buffer[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::metadata::ImageMetadata;
    use crate::migration::{MigrateReceiveArgs, MigrateSendArgs};
    use crate::server::DaemonConfig;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct FakeInstance {
        rootfs: tempfile::TempDir,
    }

    impl FakeInstance {
        fn new() -> Self {
            let rootfs = tempfile::tempdir().unwrap();
            std::fs::write(rootfs.path().join("hostname"), b"web1\n").unwrap();
            Self { rootfs }
        }
    }

    #[async_trait]
    impl Instance for FakeInstance {
        fn name(&self) -> &str {
            "web1"
        }

        fn project(&self) -> &str {
            "default"
        }

        fn instance_type(&self) -> crate::instance::InstanceType {
            crate::instance::InstanceType::Container
        }

        fn architecture(&self) -> String {
            "x86_64".to_string()
        }

        fn is_running(&self) -> bool {
            false
        }

        fn rootfs_path(&self) -> PathBuf {
            self.rootfs.path().to_path_buf()
        }

        fn export(
            &self,
            meta: &mut dyn Write,
            rootfs: Option<&mut dyn Write>,
            properties: &HashMap<String, String>,
            _expires_at: Option<chrono::DateTime<Utc>>,
            _tracker: &ProgressTracker,
        ) -> Result<ImageMetadata> {
            meta.write_all(b"meta tarball bytes")?;
            if let Some(rootfs) = rootfs {
                rootfs.write_all(b"rootfs tarball bytes")?;
            }

            Ok(ImageMetadata {
                architecture: "x86_64".to_string(),
                creation_date: 1_700_000_000,
                expiry_date: 0,
                properties: properties.clone(),
            })
        }

        async fn migrate_send(&self, _args: MigrateSendArgs) -> Result<()> {
            unimplemented!("not exercised")
        }

        async fn migrate_receive(&self, _args: MigrateReceiveArgs) -> Result<()> {
            unimplemented!("not exercised")
        }
    }

    fn publish_request(name: &str, format: Option<&str>) -> ImagesPost {
        ImagesPost {
            source: Some(crate::images::ImagesPostSource {
                source_type: "container".to_string(),
                name: name.to_string(),
                ..Default::default()
            }),
            format: format.map(String::from),
            ..Default::default()
        }
    }

    async fn test_state() -> (tempfile::TempDir, Arc<State>) {
        let dir = tempfile::tempdir().unwrap();
        let state = State::new(DaemonConfig::default().with_var_dir(dir.path())).unwrap();
        state.set_instance_loader(Box::new(|_project, _name| {
            Ok(Arc::new(FakeInstance::new()) as Arc<dyn Instance>)
        }));
        (dir, state)
    }

    fn test_op(state: &Arc<State>) -> Operation {
        state.operations.create(
            crate::operations::OperationClass::Task,
            crate::operations::OperationType::InstancePublish,
            "default",
            HashMap::new(),
            Map::new(),
            None,
        )
    }

    #[tokio::test]
    async fn test_publish_unified_uncompressed() {
        let (_dir, state) = test_state().await;
        let op = test_op(&state);

        let mut req = publish_request("web1", None);
        req.compression_algorithm = Some("none".to_string());

        let info = publish_instance(&state, "default", &req, &op).await.unwrap();

        let expected = crate::fingerprint::fingerprint_bytes(b"meta tarball bytes");
        assert_eq!(info.fingerprint, expected.as_str());
        assert_eq!(info.image_type, "container");
        assert!(state.archive.exists(&expected));
        assert!(!state.archive.is_split(&expected));
    }

    #[tokio::test]
    async fn test_publish_split_hashes_both_files() {
        let (_dir, state) = test_state().await;
        let op = test_op(&state);

        let mut req = publish_request("web1", Some("split"));
        req.compression_algorithm = Some("none".to_string());

        let info = publish_instance(&state, "default", &req, &op).await.unwrap();

        let mut hasher = FingerprintHasher::new();
        hasher.update(b"meta tarball bytes");
        hasher.update(b"rootfs tarball bytes");
        let expected = hasher.finalize();

        assert_eq!(info.fingerprint, expected.as_str());
        assert_eq!(
            info.size,
            (b"meta tarball bytes".len() + b"rootfs tarball bytes".len()) as i64
        );
        assert!(state.archive.is_split(&expected));
    }

    #[tokio::test]
    async fn test_publish_gzip_compressed() {
        let (_dir, state) = test_state().await;
        let op = test_op(&state);

        let req = publish_request("web1", None);
        // Default algorithm is gzip
        let info = publish_instance(&state, "default", &req, &op).await.unwrap();

        let fp = crate::fingerprint::Fingerprint::new(info.fingerprint.clone()).unwrap();
        let mut streams = state.archive.read(&fp, false).unwrap();
        let mut first = [0u8; 2];
        streams.meta.read_exact(&mut first).unwrap();
        assert_eq!(first, [0x1f, 0x8b]);
    }

    #[tokio::test]
    async fn test_publish_duplicate_fingerprint_rejected() {
        let (_dir, state) = test_state().await;

        let mut req = publish_request("web1", None);
        req.compression_algorithm = Some("none".to_string());

        let op = test_op(&state);
        publish_instance(&state, "default", &req, &op).await.unwrap();

        let op = test_op(&state);
        let err = publish_instance(&state, "default", &req, &op)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_publish_rejects_bad_shapes() {
        let (_dir, state) = test_state().await;
        let op = test_op(&state);

        // Snapshot type on a non-snapshot name
        let mut req = publish_request("web1", None);
        req.source.as_mut().unwrap().source_type = "snapshot".to_string();
        let err = publish_instance(&state, "default", &req, &op)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Not a snapshot"));

        // Unknown format
        let req = publish_request("web1", Some("tarball"));
        let err = publish_instance(&state, "default", &req, &op)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Invalid image format"));

        // Missing source
        let req = ImagesPost::default();
        let err = publish_instance(&state, "default", &req, &op)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("No source provided"));
    }
}
