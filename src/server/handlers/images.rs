// src/server/handlers/images.rs

//! `/1.0/images` and per-image endpoints.

use super::{
    check_etag, is_cluster_notification, operation_response, project_param, ApiResult,
};
use crate::db::models::{Image, ImageFilter, Member, Profile, StoragePool};
use crate::error::Error;
use crate::fingerprint::Fingerprint;
use crate::images::download::{image_download, resolve_url_source, ImageDownloadArgs};
use crate::images::ingest::{process_upload, UploadBody, UploadMeta};
use crate::images::publish::publish_instance;
use crate::images::{
    headers as image_headers, project_image_budget, AliasEntry, ImageInfo, ImagesPost, QuotaWriter,
};
use crate::lifecycle::{authz_hook, LifecycleAction, LifecycleEvent};
use crate::operations::{random_secret, OperationClass, OperationType};
use crate::server::State;
use axum::body::Body;
use axum::extract::{FromRequest, Multipart, Path, Query, Request, State as AxState};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Map};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Default, Deserialize)]
pub struct ImagesQuery {
    pub project: Option<String>,
    /// Present on untrusted queries; forces public-only results
    pub public: Option<String>,
    #[serde(rename = "all-projects")]
    pub all_projects: Option<bool>,
    pub recursion: Option<i32>,
    pub secret: Option<String>,
    /// Export extension: fetch only one half of a split image
    pub part: Option<String>,
    /// Substring filter on fingerprints and aliases
    pub filter: Option<String>,
}

impl ImagesQuery {
    fn public_only(&self) -> bool {
        self.public.is_some()
    }
}

/// GET `/1.0/images`
pub async fn images_get(
    AxState(state): AxState<Arc<State>>,
    Query(query): Query<ImagesQuery>,
) -> ApiResult<Response> {
    // Unauthenticated public queries are forced to the default project.
    let project = if query.public_only() {
        crate::db::models::DEFAULT_PROJECT.to_string()
    } else {
        project_param(query.project.clone())
    };

    let filter = ImageFilter {
        project: (!query.all_projects.unwrap_or(false)).then_some(project),
        public: query.public_only().then_some(true),
        ..Default::default()
    };

    let recursion = query.recursion.unwrap_or(0) > 0;
    let name_filter = query.filter.clone();

    let body = state
        .cluster
        .with(move |conn| {
            let mut images = Image::list(conn, &filter)?;

            if let Some(pattern) = &name_filter {
                images.retain(|image| image.fingerprint.as_str().contains(pattern.as_str()));
            }

            if recursion {
                let mut infos = Vec::with_capacity(images.len());
                for image in &images {
                    let id = image.id.expect("listed records carry their id");
                    infos.push(ImageInfo::from_record(conn, id, image)?);
                }
                Ok(serde_json::to_value(infos)?)
            } else {
                let urls: Vec<String> = images
                    .iter()
                    .map(|image| format!("/1.0/images/{}", image.fingerprint))
                    .collect();
                Ok(serde_json::to_value(urls)?)
            }
        })
        .await?;

    Ok(Json(body).into_response())
}

/// POST `/1.0/images`
///
/// Dispatches on the content type: JSON bodies select remote pulls, URL
/// pulls, instance publishes or push-token creation; anything else is a
/// raw upload (single tarball or `multipart/form-data`).
pub async fn images_post(
    AxState(state): AxState<Arc<State>>,
    Query(query): Query<ImagesQuery>,
    request: Request,
) -> ApiResult<Response> {
    let project = project_param(query.project.clone());
    let headers = request.headers().clone();

    // Push ingestion presents its one-time secret up front.
    let push_secret = header_string(&headers, image_headers::SECRET);
    if let Some(secret) = &push_secret {
        let expected = header_string(&headers, image_headers::FINGERPRINT).ok_or_else(|| {
            Error::Forbidden("Push secret without expected fingerprint".to_string())
        })?;

        let valid = state.operations.image_valid_secret(&expected, secret)?;
        if valid.is_none() {
            return Err(Error::Forbidden("Invalid push secret".to_string()).into());
        }
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();

    if content_type.starts_with("application/json") {
        let bytes = axum::body::to_bytes(request.into_body(), 64 * 1024 * 1024)
            .await
            .map_err(|e| Error::Validation(format!("Failed reading request body: {}", e)))?;
        let body: ImagesPost = serde_json::from_slice(&bytes).map_err(Error::from)?;
        return images_post_json(state, project, body).await;
    }

    let budget = {
        let project = project.clone();
        state
            .cluster
            .with(move |conn| project_image_budget(conn, &project))
            .await?
    };

    let upload_meta = upload_meta_from_headers(&headers, &project)?;

    let body = if content_type.starts_with("multipart/form-data") {
        spool_multipart(&state, request, budget).await?
    } else {
        let path = spool_body(&state, request.into_body(), budget).await?;
        UploadBody::Unified(path)
    };

    let is_notification = is_cluster_notification(&headers);
    let info = process_upload(&state, upload_meta, body).await?;

    if !is_notification {
        sync_after_create(&state, &project, &info.fingerprint).await;
    }

    Ok((StatusCode::OK, Json(info)).into_response())
}

async fn images_post_json(
    state: Arc<State>,
    project: String,
    body: ImagesPost,
) -> ApiResult<Response> {
    let source = body
        .source
        .clone()
        .ok_or_else(|| Error::Validation("Missing image source".to_string()))?;

    // Push mode: allocate the one-time secret and wait for the peer.
    if source.mode == "push" {
        return create_token_response(&state, &project, &source.fingerprint, Map::new());
    }

    match source.source_type.as_str() {
        "image" => {
            let budget = {
                let project = project.clone();
                state
                    .cluster
                    .with(move |conn| project_image_budget(conn, &project))
                    .await?
            };

            let alias = if !source.fingerprint.is_empty() {
                source.fingerprint.clone()
            } else if !source.alias.is_empty() {
                source.alias.clone()
            } else {
                return Err(Error::Validation(
                    "Must specify one of alias or fingerprint for init from image".to_string(),
                )
                .into());
            };

            let args = ImageDownloadArgs {
                server: source.server.clone(),
                protocol: if source.protocol.is_empty() {
                    crate::images::download::PROTOCOL_PADDOCK.to_string()
                } else {
                    source.protocol.clone()
                },
                certificate: source.certificate.clone(),
                secret: source.secret.clone(),
                alias,
                auto_update: body.auto_update,
                public: body.public,
                cached: false,
                project: project.clone(),
                budget,
            };

            let op = state.operations.create(
                OperationClass::Task,
                OperationType::ImageDownload,
                &project,
                HashMap::new(),
                Map::new(),
                None,
            );
            let _ = op.start();

            let run_state = state.clone();
            let aliases = body.aliases.clone();
            op.run(async move {
                let info = image_download(&run_state, &args).await?;
                attach_aliases(&run_state, &args.project, &info, &aliases).await?;
                sync_after_create(&run_state, &args.project, &info.fingerprint).await;
                Ok(())
            });

            Ok(operation_response(&op))
        }
        "url" => {
            let budget = {
                let project = project.clone();
                state
                    .cluster
                    .with(move |conn| project_image_budget(conn, &project))
                    .await?
            };

            if source.url.is_empty() {
                return Err(Error::Validation("Missing URL".to_string()).into());
            }

            let op = state.operations.create(
                OperationClass::Task,
                OperationType::ImageDownload,
                &project,
                HashMap::new(),
                Map::new(),
                None,
            );
            let _ = op.start();

            let run_state = state.clone();
            let url = source.url.clone();
            let aliases = body.aliases.clone();
            let public = body.public;
            let auto_update = body.auto_update;
            let project_run = project.clone();
            op.run(async move {
                let mut args = resolve_url_source(&run_state, &url).await?;
                args.project = project_run.clone();
                args.budget = budget;
                args.public = public;
                args.auto_update = auto_update;

                let info = image_download(&run_state, &args).await?;
                attach_aliases(&run_state, &project_run, &info, &aliases).await?;
                sync_after_create(&run_state, &project_run, &info.fingerprint).await;
                Ok(())
            });

            Ok(operation_response(&op))
        }
        "container" | "virtual-machine" | "instance" | "snapshot" => {
            let op = state.operations.create(
                OperationClass::Task,
                OperationType::InstancePublish,
                &project,
                HashMap::new(),
                Map::new(),
                None,
            );
            let _ = op.start();

            let run_state = state.clone();
            let run_op = op.clone();
            let project_run = project.clone();
            op.run(async move {
                let info = publish_instance(&run_state, &project_run, &body, &run_op).await?;
                sync_after_create(&run_state, &project_run, &info.fingerprint).await;
                Ok(())
            });

            Ok(operation_response(&op))
        }
        other => Err(Error::Validation(format!("Unknown source type {}", other)).into()),
    }
}

/// Best-effort replica top-up after a new image landed; the sync loop
/// retries transient failures on its next tick
async fn sync_after_create(state: &Arc<State>, project: &str, fingerprint: &str) {
    if let Err(e) =
        crate::images::replication::image_sync_between_nodes(state, project, fingerprint).await
    {
        error!("Failed syncing image between members: {}", e);
    }
}

async fn attach_aliases(
    state: &Arc<State>,
    project: &str,
    info: &ImageInfo,
    aliases: &[AliasEntry],
) -> crate::error::Result<()> {
    if aliases.is_empty() {
        return Ok(());
    }

    let fingerprint = Fingerprint::new(info.fingerprint.clone())?;
    let project_db = project.to_string();
    let aliases = aliases.to_vec();
    state
        .cluster
        .tx(move |tx| {
            let (id, _) = Image::get(tx, &project_db, &fingerprint)?;
            for alias in &aliases {
                crate::db::models::ImageAlias::create(
                    tx,
                    &project_db,
                    &alias.name,
                    id,
                    &alias.description,
                )?;
            }
            Ok(())
        })
        .await
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .filter(|s| !s.is_empty())
}

fn upload_meta_from_headers(headers: &HeaderMap, project: &str) -> Result<UploadMeta, Error> {
    let mut properties = HashMap::new();
    if let Some(encoded) = header_string(headers, image_headers::PROPERTIES) {
        for (key, value) in url::form_urlencoded::parse(encoded.as_bytes()) {
            properties.insert(key.into_owned(), value.into_owned());
        }
    }

    let mut aliases = Vec::new();
    if let Some(encoded) = header_string(headers, image_headers::ALIASES) {
        for (key, value) in url::form_urlencoded::parse(encoded.as_bytes()) {
            if key == "alias" {
                aliases.push(AliasEntry {
                    name: value.into_owned(),
                    description: String::new(),
                });
            }
        }
    }

    let mut profiles = Vec::new();
    if let Some(encoded) = header_string(headers, image_headers::PROFILES) {
        for (key, value) in url::form_urlencoded::parse(encoded.as_bytes()) {
            if key == "profile" {
                profiles.push(value.into_owned());
            }
        }
    }

    Ok(UploadMeta {
        project: project.to_string(),
        filename: header_string(headers, image_headers::FILENAME).unwrap_or_default(),
        public: header_string(headers, image_headers::PUBLIC)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false),
        expected_fingerprint: header_string(headers, image_headers::FINGERPRINT),
        properties,
        aliases,
        profiles,
        expires_at: None,
        is_notification: is_cluster_notification(headers),
    })
}

/// Spool a request body into a temp file inside the image directory
async fn spool_body(
    state: &Arc<State>,
    body: Body,
    budget: i64,
) -> Result<PathBuf, Error> {
    let tmp = tempfile::Builder::new()
        .prefix(".paddock_upload_")
        .tempfile_in(state.archive.dir())?;

    let mut writer = QuotaWriter::new(tmp, budget);
    let mut stream = body.into_data_stream();

    while let Some(chunk) = stream.next().await {
        let chunk =
            chunk.map_err(|e| Error::Validation(format!("Failed reading request body: {}", e)))?;
        writer.write_all(&chunk).map_err(|e| {
            if e.to_string().contains("quota") {
                Error::QuotaExceeded
            } else {
                Error::Io(e)
            }
        })?;
    }

    let tmp = writer.into_inner();
    let (_, path) = tmp.keep().map_err(|e| Error::Io(e.error))?;
    Ok(path)
}

/// Spool a multipart upload: `metadata` part then `rootfs`/`rootfs.img`
async fn spool_multipart(
    state: &Arc<State>,
    request: Request,
    budget: i64,
) -> Result<UploadBody, Error> {
    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(|e| Error::Validation(format!("Invalid multipart request: {}", e)))?;

    let mut spool_part = |name: String, data: Vec<u8>| -> Result<PathBuf, Error> {
        let tmp = tempfile::Builder::new()
            .prefix(&format!(".paddock_{}_", name.replace('.', "_")))
            .tempfile_in(state.archive.dir())?;
        let mut writer = QuotaWriter::new(tmp, budget);
        writer.write_all(&data).map_err(|e| {
            if e.to_string().contains("quota") {
                Error::QuotaExceeded
            } else {
                Error::Io(e)
            }
        })?;
        let (_, path) = writer.into_inner().keep().map_err(|e| Error::Io(e.error))?;
        Ok(path)
    };

    // First part must be the metadata tarball.
    let first = multipart
        .next_field()
        .await
        .map_err(|e| Error::Validation(format!("Invalid multipart image: {}", e)))?
        .ok_or_else(|| Error::Validation("Invalid multipart image".to_string()))?;

    if first.name() != Some("metadata") {
        return Err(Error::Validation("Invalid multipart image".to_string()));
    }

    let meta_bytes = first
        .bytes()
        .await
        .map_err(|e| Error::Validation(format!("Failed to copy the image tarfile: {}", e)))?;
    let meta_path = spool_part("metadata".to_string(), meta_bytes.to_vec())?;

    // Second part decides container vs virtual machine.
    let second = multipart
        .next_field()
        .await
        .map_err(|e| Error::Validation(format!("Invalid multipart image: {}", e)))?
        .ok_or_else(|| Error::Validation("Invalid multipart image".to_string()))?;

    let part_name = second.name().unwrap_or_default().to_string();
    if part_name != "rootfs" && part_name != "rootfs.img" {
        let _ = std::fs::remove_file(&meta_path);
        return Err(Error::Validation("Invalid multipart image".to_string()));
    }

    let rootfs_bytes = second
        .bytes()
        .await
        .map_err(|e| Error::Validation(format!("Failed to copy the rootfs tarfile: {}", e)))?;
    let rootfs_path = match spool_part(part_name.clone(), rootfs_bytes.to_vec()) {
        Ok(path) => path,
        Err(e) => {
            let _ = std::fs::remove_file(&meta_path);
            return Err(e);
        }
    };

    Ok(UploadBody::Split {
        meta: meta_path,
        rootfs: rootfs_path,
        rootfs_part_name: part_name,
    })
}

/// Resolve a fingerprint path parameter, honouring public/secret access
async fn resolve_image(
    state: &Arc<State>,
    project: &str,
    prefix: &str,
    query: &ImagesQuery,
) -> Result<(i64, Image), Error> {
    let public_only = if query.public_only() {
        // A valid one-time secret grants access to a private image; the
        // 404 (rather than 403) keeps existence hidden otherwise.
        match &query.secret {
            Some(secret) => state
                .operations
                .image_valid_secret(prefix, secret)?
                .is_none(),
            None => true,
        }
    } else {
        false
    };

    let project = project.to_string();
    let prefix = prefix.to_string();
    state
        .cluster
        .with(move |conn| Image::get_by_prefix(conn, &project, &prefix, public_only))
        .await
        .map_err(|e| {
            if public_only && !e.is_not_found() {
                Error::not_found("Image")
            } else {
                e
            }
        })
}

/// GET `/1.0/images/{fingerprint}`
pub async fn image_get(
    AxState(state): AxState<Arc<State>>,
    Path(fingerprint): Path<String>,
    Query(query): Query<ImagesQuery>,
) -> ApiResult<Response> {
    let project = project_param(query.project.clone());
    let (id, image) = resolve_image(&state, &project, &fingerprint, &query).await?;

    let info = state
        .cluster
        .with(move |conn| ImageInfo::from_record(conn, id, &image))
        .await?;

    let tag = super::etag(&json!({
        "public": info.public,
        "auto_update": info.auto_update,
        "properties": info.properties,
        "expires_at": info.expires_at,
        "profiles": info.profiles,
    }));

    let mut response = Json(info).into_response();
    if let Ok(value) = tag.parse() {
        response.headers_mut().insert(header::ETAG, value);
    }
    Ok(response)
}

#[derive(Debug, Deserialize)]
pub struct ImagePut {
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub auto_update: bool,
    #[serde(default)]
    pub properties: HashMap<String, String>,
    #[serde(default)]
    pub profiles: Vec<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// PUT `/1.0/images/{fingerprint}`
pub async fn image_put(
    AxState(state): AxState<Arc<State>>,
    Path(fingerprint): Path<String>,
    Query(query): Query<ImagesQuery>,
    headers: HeaderMap,
    Json(body): Json<ImagePut>,
) -> ApiResult<Response> {
    let project = project_param(query.project.clone());
    let (id, image) = resolve_image(&state, &project, &fingerprint, &query).await?;

    check_etag(
        &headers,
        &json!({
            "public": image.public,
            "auto_update": image.auto_update,
            "properties": image.properties,
            "expires_at": image.expires_at,
        }),
    )?;

    let project_db = project.clone();
    state
        .cluster
        .tx(move |tx| {
            let mut updated = image.clone();
            updated.public = body.public;
            updated.auto_update = body.auto_update;
            updated.properties = body.properties.clone();
            updated.expires_at = body.expires_at;

            let profile_ids = if body.profiles.is_empty() {
                None
            } else {
                Some(Profile::resolve_names(tx, &project_db, &body.profiles)?)
            };

            updated.update(tx, id, profile_ids.as_deref())
        })
        .await?;

    state.events.send(LifecycleEvent::new(
        LifecycleAction::ImageUpdated,
        &project,
        format!("/1.0/images/{}", fingerprint),
    ));

    Ok(StatusCode::OK.into_response())
}

/// PATCH `/1.0/images/{fingerprint}`
pub async fn image_patch(
    AxState(state): AxState<Arc<State>>,
    Path(fingerprint): Path<String>,
    Query(query): Query<ImagesQuery>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<Response> {
    let project = project_param(query.project.clone());
    let (id, image) = resolve_image(&state, &project, &fingerprint, &query).await?;

    check_etag(
        &headers,
        &json!({
            "public": image.public,
            "auto_update": image.auto_update,
            "properties": image.properties,
            "expires_at": image.expires_at,
        }),
    )?;

    state
        .cluster
        .tx(move |tx| {
            let mut updated = image.clone();

            if let Some(public) = body.get("public").and_then(|v| v.as_bool()) {
                updated.public = public;
            }
            if let Some(auto_update) = body.get("auto_update").and_then(|v| v.as_bool()) {
                updated.auto_update = auto_update;
            }
            if let Some(properties) = body.get("properties").and_then(|v| v.as_object()) {
                for (key, value) in properties {
                    if let Some(value) = value.as_str() {
                        updated.properties.insert(key.clone(), value.to_string());
                    }
                }
            }

            updated.update(tx, id, None)
        })
        .await?;

    state.events.send(LifecycleEvent::new(
        LifecycleAction::ImageUpdated,
        &project,
        format!("/1.0/images/{}", fingerprint),
    ));

    Ok(StatusCode::OK.into_response())
}

/// DELETE `/1.0/images/{fingerprint}`
pub async fn image_delete(
    AxState(state): AxState<Arc<State>>,
    Path(fingerprint): Path<String>,
    Query(query): Query<ImagesQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let project = project_param(query.project.clone());
    let (id, image) = resolve_image(&state, &project, &fingerprint, &query).await?;
    let is_notification = is_cluster_notification(&headers);

    let mut resources = HashMap::new();
    resources.insert(
        "images".to_string(),
        vec![format!("/1.0/images/{}", image.fingerprint)],
    );

    let op = state.operations.create(
        OperationClass::Task,
        OperationType::ImageDelete,
        &project,
        resources,
        Map::new(),
        None,
    );
    let _ = op.start();

    let run_state = state.clone();
    let run_op = op.clone();
    op.run(async move {
        delete_image_task(&run_state, &project, id, image, is_notification, &run_op).await
    });

    Ok(operation_response(&op))
}

async fn delete_image_task(
    state: &Arc<State>,
    project: &str,
    id: i64,
    image: Image,
    is_notification: bool,
    op: &crate::operations::Operation,
) -> crate::error::Result<()> {
    // Concurrent image operations on this fingerprint wait their turn.
    let _guard = state.image_locks.lock(image.fingerprint.as_str()).await;

    let fingerprint = image.fingerprint.clone();
    let project_db = project.to_string();

    // Re-check under the lock: another request may have removed it.
    let check_fp = fingerprint.clone();
    let check_project = project_db.clone();
    let exists = state
        .cluster
        .with(move |conn| Image::exists(conn, &check_project, &check_fp))
        .await?;
    if !exists {
        return Err(Error::not_found("Image"));
    }

    if !is_notification {
        // Another project still references the blob: drop only our record.
        let check_fp = fingerprint.clone();
        let check_project = project_db.clone();
        let referenced = state
            .cluster
            .with(move |conn| {
                Image::referenced_by_other_projects(conn, &check_project, &check_fp)
            })
            .await?;

        if referenced {
            state
                .cluster
                .with(move |conn| Image::delete(conn, id))
                .await?;
            return Ok(());
        }

        // Tell the other holders to remove their copy from disk.
        let local_address = state.local_address().await?;
        let holders = {
            let fp = fingerprint.clone();
            state
                .cluster
                .with(move |conn| Member::nodes_with_image(conn, &fp))
                .await?
        };

        for address in holders {
            if address == local_address {
                continue;
            }

            let result = state
                .http
                .delete(format!(
                    "https://{}/1.0/images/{}?project={}",
                    address, fingerprint, project_db
                ))
                .header(image_headers::NOTIFY, "1")
                .send()
                .await
                .and_then(|r| r.error_for_status());

            if let Err(e) = result {
                return Err(Error::Other(format!(
                    "Failed to delete image from peer node: {}",
                    e
                )));
            }
        }

        // Aliases and authorizer entries go with the image.
        let aliases = {
            let project = project_db.clone();
            state
                .cluster
                .with(move |conn| crate::db::models::ImageAlias::list_for_image(conn, id))
                .await?
        };
        for alias in aliases {
            authz_hook(
                "delete image alias",
                state.authorizer.delete_image_alias(&project_db, &alias.name),
            );
            state.events.send(
                LifecycleEvent::new(
                    LifecycleAction::ImageAliasDeleted,
                    &project_db,
                    format!("/1.0/images/aliases/{}", alias.name),
                )
                .with_requestor(op.requestor()),
            );
        }

        authz_hook(
            "delete image",
            state
                .authorizer
                .delete_image(&project_db, fingerprint.as_str()),
        );
        state.events.send(
            LifecycleEvent::new(
                LifecycleAction::ImageDeleted,
                &project_db,
                format!("/1.0/images/{}", fingerprint),
            )
            .with_requestor(op.requestor()),
        );
    }

    // Per-pool volumes, placement and (unless a notification) the record.
    let cleanup_fp = fingerprint.clone();
    let local_id = state.local_member_id().await?;
    state
        .cluster
        .tx(move |tx| {
            for pool in StoragePool::pools_with_image(tx, &cleanup_fp)? {
                StoragePool::remove_image(tx, &cleanup_fp, pool.id)?;
            }

            if is_notification {
                if let Some(node_id) = local_id {
                    Member::remove_image(tx, &cleanup_fp, node_id)?;
                }
            } else {
                Member::remove_image_everywhere(tx, &cleanup_fp)?;
                Image::delete(tx, id)?;
            }

            Ok(())
        })
        .await?;

    state.archive.delete(&fingerprint)?;

    info!(
        "Image deleted: {} in project {}",
        fingerprint, project
    );

    Ok(())
}

/// GET `/1.0/images/{fingerprint}/export`
pub async fn image_export_get(
    AxState(state): AxState<Arc<State>>,
    Path(fingerprint): Path<String>,
    Query(query): Query<ImagesQuery>,
) -> ApiResult<Response> {
    let project = project_param(query.project.clone());
    let (_, image) = resolve_image(&state, &project, &fingerprint, &query).await?;

    // Blob on another member only: replay the request there.
    if !state.archive.exists(&image.fingerprint) {
        let local_address = state.local_address().await?;
        let located = {
            let fp = image.fingerprint.clone();
            state
                .cluster
                .with(move |conn| Member::locate_blob(conn, &fp, &local_address))
                .await?
        };

        if let Some(address) = located {
            let path = match &query.part {
                Some(part) => format!(
                    "/1.0/images/{}/export?project={}&part={}",
                    image.fingerprint, project, part
                ),
                None => format!("/1.0/images/{}/export?project={}", image.fingerprint, project),
            };
            return Ok(super::super::forward_request(&state, &address, &path).await?);
        }

        return Err(Error::not_found("Image file").into());
    }

    let split = state.archive.is_split(&image.fingerprint);

    let fp = image.fingerprint.clone();
    let project_db = project.clone();
    state
        .cluster
        .with(move |conn| Image::update_last_use_date(conn, &project_db, &fp, Utc::now()))
        .await?;

    state.events.send(LifecycleEvent::new(
        LifecycleAction::ImageRetrieved,
        &project,
        format!("/1.0/images/{}", image.fingerprint),
    ));

    match query.part.as_deref() {
        Some("meta") => {
            let path = state.archive.blob_path(&image.fingerprint);
            serve_file(path, &image.filename).await
        }
        Some("rootfs") => {
            if !split {
                return Err(Error::not_found("Image rootfs file").into());
            }
            let path = state.archive.rootfs_path(&image.fingerprint);
            serve_file(path, "rootfs").await
        }
        Some(other) => Err(Error::Validation(format!("Unknown export part {}", other)).into()),
        // No part selector: single file, or a multipart body for split
        // images.
        None if split => serve_multipart(&state, &image).await,
        None => {
            let path = state.archive.blob_path(&image.fingerprint);
            serve_file(path, &image.filename).await
        }
    }
}

async fn serve_file(path: PathBuf, filename: &str) -> ApiResult<Response> {
    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|_| Error::not_found("Image file"))?;

    let stream = tokio_util::io::ReaderStream::new(file);
    let body = Body::from_stream(stream);

    let mut response = Response::new(body);
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        "application/octet-stream".parse().unwrap(),
    );
    if !filename.is_empty() {
        if let Ok(value) = format!("attachment; filename={}", filename).parse() {
            response
                .headers_mut()
                .insert(header::CONTENT_DISPOSITION, value);
        }
    }
    Ok(response)
}

async fn serve_multipart(state: &Arc<State>, image: &Image) -> ApiResult<Response> {
    let streams = state.archive.read(&image.fingerprint, true)?;

    let boundary = random_secret();
    let rootfs_name = match image.image_type {
        crate::instance::InstanceType::VirtualMachine => "rootfs.img",
        crate::instance::InstanceType::Container => "rootfs",
    };

    let mut body = Vec::new();
    for (name, mut file) in [
        ("metadata".to_string(), streams.meta),
        (rootfs_name.to_string(), streams.rootfs.expect("split image")),
    ] {
        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\r\n",
                name, name
            )
            .as_bytes(),
        );
        std::io::Read::read_to_end(&mut file, &mut body).map_err(Error::from)?;
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());

    let mut response = Response::new(Body::from(body));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        format!("multipart/form-data; boundary={}", boundary)
            .parse()
            .unwrap(),
    );
    Ok(response)
}

#[derive(Debug, Deserialize)]
pub struct ImageExportPost {
    pub target: String,
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub certificate: String,
    #[serde(default)]
    pub aliases: Vec<AliasEntry>,
}

/// POST `/1.0/images/{fingerprint}/export` - push the image to a remote
pub async fn image_export_post(
    AxState(state): AxState<Arc<State>>,
    Path(fingerprint): Path<String>,
    Query(query): Query<ImagesQuery>,
    Json(body): Json<ImageExportPost>,
) -> ApiResult<Response> {
    let project = project_param(query.project.clone());
    let (_, image) = resolve_image(&state, &project, &fingerprint, &query).await?;

    let op = state.operations.create(
        OperationClass::Task,
        OperationType::ImageDownload,
        &project,
        HashMap::new(),
        Map::new(),
        None,
    );
    let _ = op.start();

    let run_state = state.clone();
    op.run(async move {
        let streams = run_state.archive.read(&image.fingerprint, false)?;
        let mut meta_bytes = Vec::new();
        std::io::Read::read_to_end(&mut { streams.meta }, &mut meta_bytes)?;

        let mut request = run_state
            .http
            .post(format!("{}/1.0/images", body.target.trim_end_matches('/')))
            .header(image_headers::FINGERPRINT, image.fingerprint.as_str());

        if !body.secret.is_empty() {
            request = request.header(image_headers::SECRET, &body.secret);
        }

        let response = match streams.rootfs {
            Some(mut rootfs) => {
                let mut rootfs_bytes = Vec::new();
                std::io::Read::read_to_end(&mut rootfs, &mut rootfs_bytes)?;

                let rootfs_part = match image.image_type {
                    crate::instance::InstanceType::VirtualMachine => "rootfs.img",
                    crate::instance::InstanceType::Container => "rootfs",
                };

                let form = reqwest::multipart::Form::new()
                    .part(
                        "metadata",
                        reqwest::multipart::Part::bytes(meta_bytes).file_name("metadata"),
                    )
                    .part(
                        rootfs_part,
                        reqwest::multipart::Part::bytes(rootfs_bytes).file_name(rootfs_part),
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

        response
            .error_for_status()
            .map_err(crate::error::Error::Http)?;
        Ok(())
    });

    Ok(operation_response(&op))
}

/// POST `/1.0/images/{fingerprint}/secret`
pub async fn image_secret_post(
    AxState(state): AxState<Arc<State>>,
    Path(fingerprint): Path<String>,
    Query(query): Query<ImagesQuery>,
) -> ApiResult<Response> {
    let project = project_param(query.project.clone());
    let (_, image) = resolve_image(&state, &project, &fingerprint, &query).await?;

    create_token_response(&state, &project, image.fingerprint.as_str(), Map::new())
}

/// POST `/1.0/images/{fingerprint}/refresh`
pub async fn image_refresh_post(
    AxState(state): AxState<Arc<State>>,
    Path(fingerprint): Path<String>,
    Query(query): Query<ImagesQuery>,
) -> ApiResult<Response> {
    let project = project_param(query.project.clone());
    let (id, image) = resolve_image(&state, &project, &fingerprint, &query).await?;

    let op = state.operations.create(
        OperationClass::Task,
        OperationType::ImagesUpdate,
        &project,
        HashMap::new(),
        Map::new(),
        None,
    );
    let _ = op.start();

    let run_state = state.clone();
    let run_op = op.clone();
    op.run(async move {
        let result = crate::images::maintenance::auto_update_image(
            &run_state,
            Some(&run_op),
            id,
            &image,
            image.project.as_str(),
            true,
        )
        .await?;

        if result.is_some() {
            // Drop the superseded record.
            run_state
                .cluster
                .with(move |conn| Image::delete(conn, id))
                .await?;
        }

        Ok(())
    });

    Ok(operation_response(&op))
}

/// Allocate a one-time secret on an image-token operation
fn create_token_response(
    state: &Arc<State>,
    project: &str,
    fingerprint: &str,
    mut metadata: Map<String, serde_json::Value>,
) -> ApiResult<Response> {
    if fingerprint.is_empty() {
        return Err(Error::Validation("Missing image fingerprint".to_string()).into());
    }

    let secret = random_secret();
    metadata.insert("secret".to_string(), secret.into());

    let mut resources = HashMap::new();
    resources.insert(
        "images".to_string(),
        vec![format!("/1.0/images/{}", fingerprint)],
    );

    let op = state.operations.create(
        OperationClass::Token,
        OperationType::ImageToken,
        crate::db::models::DEFAULT_PROJECT,
        resources,
        metadata,
        None,
    );

    state.events.send(LifecycleEvent::new(
        LifecycleAction::ImageSecretCreated,
        project,
        format!("/1.0/images/{}", fingerprint),
    ));

    Ok(operation_response(&op))
}

/// POST `/internal/image-optimize`
pub async fn image_optimize_post(
    AxState(state): AxState<Arc<State>>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<Response> {
    let fingerprint = body
        .get("image")
        .and_then(|image| image.get("fingerprint"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::Validation("Missing image fingerprint".to_string()))?;
    let pool_name = body
        .get("pool")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::Validation("No storage pool specified".to_string()))?
        .to_string();

    let fp = Fingerprint::new(fingerprint.to_string())?;

    state
        .cluster
        .with(move |conn| {
            let pool = StoragePool::get_by_name(conn, &pool_name)?;
            StoragePool::add_image(conn, &fp, pool.id)
        })
        .await
        .map_err(|e| {
            error!("Failed creating image volume: {}", e);
            e
        })?;

    Ok(StatusCode::OK.into_response())
}
