// src/server/handlers/mod.rs

//! REST handlers for the daemon API.

pub mod aliases;
pub mod cluster;
pub mod images;
pub mod operations;
pub mod websocket;

use crate::error::Error;
use crate::operations::Operation;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use sha2::{Digest, Sha256};

/// Error wrapper mapping the crate taxonomy onto HTTP statuses
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Sqlite(rusqlite::Error::QueryReturnedNoRows) => StatusCode::NOT_FOUND,
            Error::AlreadyExists(_) => StatusCode::CONFLICT,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::QuotaExceeded => StatusCode::PAYLOAD_TOO_LARGE,
            Error::Integrity(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = json!({
            "error": self.0.to_string(),
            "error_code": status.as_u16(),
        });

        (status, Json(body)).into_response()
    }
}

/// Handler result alias
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// `202 Accepted` with the operation's location and rendered body
pub fn operation_response(op: &Operation) -> Response {
    let info = op.info();
    let mut response = (StatusCode::ACCEPTED, Json(info)).into_response();
    if let Ok(location) = op.url().parse() {
        response.headers_mut().insert(header::LOCATION, location);
    }
    response
}

/// Whether the request is an internal cluster notification
pub fn is_cluster_notification(headers: &HeaderMap) -> bool {
    headers
        .get(crate::images::headers::NOTIFY)
        .and_then(|v| v.to_str().ok())
        == Some("1")
}

/// Project selector from the query string, defaulting to `default`
pub fn project_param(project: Option<String>) -> String {
    match project {
        Some(project) if !project.is_empty() => project,
        _ => crate::db::models::DEFAULT_PROJECT.to_string(),
    }
}

/// ETag over a serialisable view of the mutable fields
pub fn etag<T: serde::Serialize>(value: &T) -> String {
    let payload = serde_json::to_vec(value).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&payload);
    format!("{:x}", hasher.finalize())
}

/// Enforce `If-Match` when the client sent one
pub fn check_etag<T: serde::Serialize>(headers: &HeaderMap, value: &T) -> Result<(), Error> {
    let Some(sent) = headers.get(header::IF_MATCH).and_then(|v| v.to_str().ok()) else {
        return Ok(());
    };

    let current = etag(value);
    if sent.trim_matches('"') != current {
        return Err(Error::PreconditionFailed(format!(
            "provided: {}, current: {}",
            sent, current
        )));
    }

    Ok(())
}
