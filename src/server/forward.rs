// src/server/forward.rs

//! Request forwarding between cluster members.
//!
//! When an image blob lives only on another member, the request is
//! replayed there and the answer streamed back, so clients never need to
//! know which member holds which blob.

use crate::error::Result;
use crate::server::State;
use axum::body::Body;
use axum::http::StatusCode;
use axum::response::Response;
use std::sync::Arc;
use tracing::debug;

/// Replay a GET against a peer and stream its response back
pub async fn forward_request(
    state: &Arc<State>,
    address: &str,
    path_and_query: &str,
) -> Result<Response> {
    let url = format!("https://{}{}", address, path_and_query);
    debug!("Forwarding request to cluster member {}", url);

    let upstream = state
        .http
        .get(&url)
        .header(crate::images::headers::NOTIFY, "1")
        .send()
        .await?;

    let status =
        StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = upstream
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .cloned();

    let stream = upstream.bytes_stream();
    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = status;
    if let Some(content_type) = content_type {
        if let Ok(value) = content_type.to_str().unwrap_or_default().parse() {
            response
                .headers_mut()
                .insert(axum::http::header::CONTENT_TYPE, value);
        }
    }

    Ok(response)
}
