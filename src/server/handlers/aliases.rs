// src/server/handlers/aliases.rs

//! `/1.0/images/aliases` endpoints.

use super::{check_etag, project_param, ApiResult};
use crate::db::models::{Image, ImageAlias};
use crate::error::Error;
use crate::lifecycle::{authz_hook, LifecycleAction, LifecycleEvent};
use crate::server::State;
use axum::extract::{Path, Query, State as AxState};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

#[derive(Debug, Default, Deserialize)]
pub struct AliasQuery {
    pub project: Option<String>,
    pub recursion: Option<i32>,
}

/// Wire shape of an alias
#[derive(Debug, Serialize, Deserialize)]
pub struct AliasInfo {
    pub name: String,
    pub description: String,
    /// Fingerprint of the target image
    pub target: String,
    #[serde(rename = "type")]
    pub image_type: String,
}

async fn render_alias(
    state: &Arc<State>,
    project: &str,
    name: &str,
) -> Result<AliasInfo, Error> {
    let project = project.to_string();
    let name = name.to_string();
    state
        .cluster
        .with(move |conn| {
            let alias = ImageAlias::get(conn, &project, &name)?;

            let (fingerprint, image_type): (String, String) = conn.query_row(
                "SELECT fingerprint, type FROM images WHERE id = ?1",
                [alias.image_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;

            Ok(AliasInfo {
                name: alias.name,
                description: alias.description,
                target: fingerprint,
                image_type,
            })
        })
        .await
}

/// GET `/1.0/images/aliases`
pub async fn aliases_get(
    AxState(state): AxState<Arc<State>>,
    Query(query): Query<AliasQuery>,
) -> ApiResult<Response> {
    let project = project_param(query.project.clone());
    let recursion = query.recursion.unwrap_or(0) > 0;

    let names: Vec<String> = {
        let project = project.clone();
        state
            .cluster
            .with(move |conn| {
                Ok(ImageAlias::list(conn, &project)?
                    .into_iter()
                    .map(|a| a.name)
                    .collect())
            })
            .await?
    };

    if !recursion {
        let urls: Vec<String> = names
            .iter()
            .map(|name| format!("/1.0/images/aliases/{}", name))
            .collect();
        return Ok(Json(urls).into_response());
    }

    let mut infos = Vec::with_capacity(names.len());
    for name in names {
        infos.push(render_alias(&state, &project, &name).await?);
    }
    Ok(Json(infos).into_response())
}

#[derive(Debug, Deserialize)]
pub struct AliasesPost {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Fingerprint (or unique prefix) of the target image
    pub target: String,
}

/// POST `/1.0/images/aliases`
pub async fn aliases_post(
    AxState(state): AxState<Arc<State>>,
    Query(query): Query<AliasQuery>,
    Json(body): Json<AliasesPost>,
) -> ApiResult<Response> {
    let project = project_param(query.project.clone());

    if body.name.is_empty() || body.target.is_empty() {
        return Err(Error::Validation("name and target are required".to_string()).into());
    }

    {
        let project = project.clone();
        let body_name = body.name.clone();
        let target = body.target.clone();
        let description = body.description.clone();
        state
            .cluster
            .tx(move |tx| {
                let (image_id, _) = Image::get_by_prefix(tx, &project, &target, false)?;
                ImageAlias::create(tx, &project, &body_name, image_id, &description)?;
                Ok(())
            })
            .await?;
    }

    state.events.send(LifecycleEvent::new(
        LifecycleAction::ImageAliasCreated,
        &project,
        format!("/1.0/images/aliases/{}", body.name),
    ));
    authz_hook(
        "add image alias",
        state.authorizer.add_image_alias(&project, &body.name),
    );

    Ok(StatusCode::OK.into_response())
}

/// GET `/1.0/images/aliases/{name}`
pub async fn alias_get(
    AxState(state): AxState<Arc<State>>,
    Path(name): Path<String>,
    Query(query): Query<AliasQuery>,
) -> ApiResult<Response> {
    let project = project_param(query.project.clone());
    let info = render_alias(&state, &project, &name).await?;

    let tag = super::etag(&json!({
        "description": info.description,
        "target": info.target,
    }));

    let mut response = Json(info).into_response();
    if let Ok(value) = tag.parse() {
        response.headers_mut().insert(header::ETAG, value);
    }
    Ok(response)
}

#[derive(Debug, Deserialize)]
pub struct AliasPut {
    #[serde(default)]
    pub description: String,
    pub target: String,
}

/// PUT `/1.0/images/aliases/{name}`
pub async fn alias_put(
    AxState(state): AxState<Arc<State>>,
    Path(name): Path<String>,
    Query(query): Query<AliasQuery>,
    headers: HeaderMap,
    Json(body): Json<AliasPut>,
) -> ApiResult<Response> {
    let project = project_param(query.project.clone());

    let current = render_alias(&state, &project, &name).await?;
    check_etag(
        &headers,
        &json!({"description": current.description, "target": current.target}),
    )?;

    {
        let project = project.clone();
        let name = name.clone();
        state
            .cluster
            .tx(move |tx| {
                let alias = ImageAlias::get(tx, &project, &name)?;
                let (image_id, _) = Image::get_by_prefix(tx, &project, &body.target, false)?;
                ImageAlias::update(tx, alias.id, image_id, &body.description)
            })
            .await?;
    }

    state.events.send(LifecycleEvent::new(
        LifecycleAction::ImageAliasUpdated,
        &project,
        format!("/1.0/images/aliases/{}", name),
    ));

    Ok(StatusCode::OK.into_response())
}

/// PATCH `/1.0/images/aliases/{name}`
pub async fn alias_patch(
    AxState(state): AxState<Arc<State>>,
    Path(name): Path<String>,
    Query(query): Query<AliasQuery>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<Response> {
    let project = project_param(query.project.clone());

    let current = render_alias(&state, &project, &name).await?;
    check_etag(
        &headers,
        &json!({"description": current.description, "target": current.target}),
    )?;

    let description = body
        .get("description")
        .and_then(|v| v.as_str())
        .map(String::from)
        .unwrap_or(current.description);
    let target = body
        .get("target")
        .and_then(|v| v.as_str())
        .map(String::from)
        .unwrap_or(current.target);

    {
        let project = project.clone();
        let name = name.clone();
        state
            .cluster
            .tx(move |tx| {
                let alias = ImageAlias::get(tx, &project, &name)?;
                let (image_id, _) = Image::get_by_prefix(tx, &project, &target, false)?;
                ImageAlias::update(tx, alias.id, image_id, &description)
            })
            .await?;
    }

    state.events.send(LifecycleEvent::new(
        LifecycleAction::ImageAliasUpdated,
        &project,
        format!("/1.0/images/aliases/{}", name),
    ));

    Ok(StatusCode::OK.into_response())
}

#[derive(Debug, Deserialize)]
pub struct AliasRename {
    pub name: String,
}

/// POST `/1.0/images/aliases/{name}` - rename
pub async fn alias_post(
    AxState(state): AxState<Arc<State>>,
    Path(name): Path<String>,
    Query(query): Query<AliasQuery>,
    Json(body): Json<AliasRename>,
) -> ApiResult<Response> {
    let project = project_param(query.project.clone());

    if body.name.is_empty() {
        return Err(Error::Validation("Missing new alias name".to_string()).into());
    }

    {
        let project = project.clone();
        let name = name.clone();
        let new_name = body.name.clone();
        state
            .cluster
            .tx(move |tx| {
                let alias = ImageAlias::get(tx, &project, &name)?;
                ImageAlias::rename(tx, alias.id, &new_name)
            })
            .await?;
    }

    state.events.send(
        LifecycleEvent::new(
            LifecycleAction::ImageAliasRenamed,
            &project,
            format!("/1.0/images/aliases/{}", body.name),
        )
        .with_context("old_name", name.clone().into()),
    );
    authz_hook(
        "rename image alias",
        state
            .authorizer
            .rename_image_alias(&project, &name, &body.name),
    );

    Ok(StatusCode::OK.into_response())
}

/// DELETE `/1.0/images/aliases/{name}`
pub async fn alias_delete(
    AxState(state): AxState<Arc<State>>,
    Path(name): Path<String>,
    Query(query): Query<AliasQuery>,
) -> ApiResult<Response> {
    let project = project_param(query.project.clone());

    {
        let project = project.clone();
        let name = name.clone();
        state
            .cluster
            .with(move |conn| ImageAlias::delete(conn, &project, &name))
            .await?;
    }

    state.events.send(LifecycleEvent::new(
        LifecycleAction::ImageAliasDeleted,
        &project,
        format!("/1.0/images/aliases/{}", name),
    ));
    authz_hook(
        "delete image alias",
        state.authorizer.delete_image_alias(&project, &name),
    );

    Ok(StatusCode::OK.into_response())
}
