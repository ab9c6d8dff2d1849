// src/server/routes.rs

//! Axum router for the daemon API.

use super::handlers::{aliases, cluster, images, operations, websocket};
use super::State;
use axum::routing::{delete, get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Build the full application router
pub fn create_router(state: Arc<State>) -> Router {
    Router::new()
        .route("/1.0", get(cluster::server_get))
        // Images
        .route(
            "/1.0/images",
            get(images::images_get).post(images::images_post),
        )
        .route(
            "/1.0/images/aliases",
            get(aliases::aliases_get).post(aliases::aliases_post),
        )
        .route(
            "/1.0/images/aliases/:name",
            get(aliases::alias_get)
                .post(aliases::alias_post)
                .put(aliases::alias_put)
                .patch(aliases::alias_patch)
                .delete(aliases::alias_delete),
        )
        .route(
            "/1.0/images/:fingerprint",
            get(images::image_get)
                .put(images::image_put)
                .patch(images::image_patch)
                .delete(images::image_delete),
        )
        .route(
            "/1.0/images/:fingerprint/export",
            get(images::image_export_get).post(images::image_export_post),
        )
        .route(
            "/1.0/images/:fingerprint/secret",
            post(images::image_secret_post),
        )
        .route(
            "/1.0/images/:fingerprint/refresh",
            post(images::image_refresh_post),
        )
        // Operations
        .route(
            "/1.0/operations/:id",
            get(operations::operation_get).delete(operations::operation_delete),
        )
        .route("/1.0/operations/:id/wait", get(operations::operation_wait))
        // Migration channels
        .route("/websocket", get(websocket::websocket_get))
        // Internal cluster plumbing
        .route(
            "/internal/cluster/raft-node/:address",
            delete(cluster::raft_node_delete),
        )
        .route("/internal/image-optimize", post(images::image_optimize_post))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
