// src/server/handlers/cluster.rs

//! Internal cluster endpoints and the server info root.

use super::ApiResult;
use crate::cluster;
use crate::error::Error;
use crate::server::State;
use axum::extract::{Path, State as AxState};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// GET `/1.0` - server environment and config
pub async fn server_get(AxState(state): AxState<Arc<State>>) -> ApiResult<Response> {
    let mut config = HashMap::new();

    let volume = state.images_volume().await?;
    if !volume.is_empty() {
        config.insert("storage.images_volume".to_string(), volume);
    }

    let address = state.local_address().await?;
    if !address.is_empty() {
        config.insert("cluster.https_address".to_string(), address);
    }

    let body = json!({
        "api_version": "1.0",
        "server_name": "paddock",
        "server_version": env!("CARGO_PKG_VERSION"),
        "config": config,
    });

    Ok(Json(body).into_response())
}

/// DELETE `/internal/cluster/raft-node/{address}`
///
/// The one admin action that needs the daemon running: drop a member from
/// the raft configuration after an unclean removal.
pub async fn raft_node_delete(
    AxState(state): AxState<Arc<State>>,
    Path(address): Path<String>,
) -> ApiResult<Response> {
    let removed = state
        .local
        .with(move |conn| {
            let members = cluster::get_raft_nodes(conn)?;

            let Some(target) = members.iter().find(|m| m.address == address) else {
                return Err(Error::not_found("Raft node"));
            };

            // Removing the only voter would brick the configuration.
            let voters = members
                .iter()
                .filter(|m| m.role == cluster::RaftRole::Voter)
                .count();
            if target.role == cluster::RaftRole::Voter && voters <= 1 {
                return Err(Error::Validation(
                    "Cannot remove the only voter from the raft configuration".to_string(),
                ));
            }

            conn.execute(
                "DELETE FROM raft_nodes WHERE address = ?1",
                [&target.address],
            )?;

            Ok(target.address.clone())
        })
        .await?;

    info!("Removed raft node {}", removed);
    Ok(StatusCode::OK.into_response())
}
