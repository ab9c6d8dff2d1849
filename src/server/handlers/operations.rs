// src/server/handlers/operations.rs

//! `/1.0/operations` endpoints.

use super::ApiResult;
use crate::server::State;
use axum::extract::{Path, State as AxState};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::sync::Arc;

/// GET `/1.0/operations/{id}`
pub async fn operation_get(
    AxState(state): AxState<Arc<State>>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let op = state.operations.get(&id)?;
    Ok(Json(op.info()).into_response())
}

/// DELETE `/1.0/operations/{id}` - cancel
pub async fn operation_delete(
    AxState(state): AxState<Arc<State>>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let op = state.operations.get(&id)?;
    op.cancel();
    Ok(StatusCode::OK.into_response())
}

/// GET `/1.0/operations/{id}/wait`
pub async fn operation_wait(
    AxState(state): AxState<Arc<State>>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let op = state.operations.get(&id)?;
    op.wait().await;
    Ok(Json(op.info()).into_response())
}
