// src/operations/mod.rs

//! Background operations and one-time secret tokens.
//!
//! Every long task is wrapped in an operation so the API can answer
//! `202 Accepted` with a pollable URL. Three classes exist: `task` runs
//! work, `token` holds a one-time secret in its metadata and runs nothing,
//! `websocket` carries upgraded connections for the migration transport.

use crate::error::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long a token operation stays valid
pub const TOKEN_VALID_SECS: i64 = 300;

/// Operation classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationClass {
    Task,
    Token,
    Websocket,
}

/// Operation status machine: pending → running → terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Running,
    Success,
    Failure,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Cancelled)
    }
}

/// What an operation is doing, used for filtering and descriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationType {
    #[serde(rename = "image-download")]
    ImageDownload,
    #[serde(rename = "image-delete")]
    ImageDelete,
    #[serde(rename = "image-token")]
    ImageToken,
    #[serde(rename = "images-update")]
    ImagesUpdate,
    #[serde(rename = "images-expire")]
    ImagesExpire,
    #[serde(rename = "images-prune-leftover")]
    ImagesPruneLeftover,
    #[serde(rename = "images-synchronize")]
    ImagesSynchronize,
    #[serde(rename = "instance-publish")]
    InstancePublish,
    #[serde(rename = "instance-migrate")]
    InstanceMigrate,
}

/// Wire shape of an operation, as the API renders it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationInfo {
    pub id: String,
    pub class: OperationClass,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub project: String,
    pub status: OperationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resources: HashMap<String, Vec<String>>,
    pub metadata: Map<String, Value>,
    pub err: String,
    pub location: String,
}

struct OperationState {
    status: OperationStatus,
    metadata: Map<String, Value>,
    err: String,
    updated_at: DateTime<Utc>,
}

struct OperationInner {
    id: String,
    class: OperationClass,
    op_type: OperationType,
    project: String,
    requestor: Option<String>,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    resources: HashMap<String, Vec<String>>,
    state: Mutex<OperationState>,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
    cancel: CancellationToken,
}

/// Handle to a single operation
#[derive(Clone)]
pub struct Operation {
    inner: Arc<OperationInner>,
}

impl Operation {
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn class(&self) -> OperationClass {
        self.inner.class
    }

    pub fn op_type(&self) -> OperationType {
        self.inner.op_type
    }

    pub fn project(&self) -> &str {
        &self.inner.project
    }

    pub fn requestor(&self) -> Option<String> {
        self.inner.requestor.clone()
    }

    /// URL of this operation on the API surface
    pub fn url(&self) -> String {
        format!("/1.0/operations/{}", self.inner.id)
    }

    /// Cancellation signal threaded into the operation's blocking calls
    pub fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub fn status(&self) -> OperationStatus {
        self.inner.state.lock().unwrap().status
    }

    pub fn is_running(&self) -> bool {
        self.status() == OperationStatus::Running
    }

    /// Token operations outlive their validity window but stop being
    /// single-use once expired
    pub fn is_expired(&self) -> bool {
        match self.inner.expires_at {
            Some(expires_at) => Utc::now() > expires_at,
            None => false,
        }
    }

    /// Merge metadata keys into the operation
    pub fn update_metadata(&self, metadata: Map<String, Value>) {
        let mut state = self.inner.state.lock().unwrap();
        for (key, value) in metadata {
            state.metadata.insert(key, value);
        }
        state.updated_at = Utc::now();
    }

    /// Read a metadata value
    pub fn metadata_get(&self, key: &str) -> Option<Value> {
        self.inner.state.lock().unwrap().metadata.get(key).cloned()
    }

    /// Move to running; only valid from pending
    pub fn start(&self) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        if state.status != OperationStatus::Pending {
            return Err(Error::Other(format!(
                "Operation {} is not pending",
                self.inner.id
            )));
        }

        state.status = OperationStatus::Running;
        state.updated_at = Utc::now();
        Ok(())
    }

    fn finish(&self, status: OperationStatus, err: Option<String>) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.status.is_terminal() {
                return;
            }

            state.status = status;
            state.err = err.unwrap_or_default();
            state.updated_at = Utc::now();
        }

        let _ = self.inner.done_tx.send(true);
    }

    /// Cancel the operation: signals the task and settles the status
    pub fn cancel(&self) {
        debug!("Cancelling operation {}", self.inner.id);
        self.inner.cancel.cancel();
        self.finish(OperationStatus::Cancelled, None);
    }

    /// Wait for the operation to reach a terminal state
    pub async fn wait(&self) -> OperationStatus {
        let mut done = self.inner.done_rx.clone();
        while !*done.borrow() {
            if done.changed().await.is_err() {
                break;
            }
        }
        self.status()
    }

    /// Settle the operation with the outcome of already-run work
    pub fn complete(&self, result: Result<()>) {
        match result {
            Ok(()) => self.finish(OperationStatus::Success, None),
            Err(err) => self.finish(OperationStatus::Failure, Some(err.to_string())),
        }
    }

    /// Run a future as this operation's work, settling the status when it
    /// completes
    pub fn run<F>(&self, future: F)
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let op = self.clone();
        tokio::spawn(async move {
            match future.await {
                Ok(()) => op.finish(OperationStatus::Success, None),
                Err(err) => {
                    warn!("Operation {} failed: {}", op.id(), err);
                    op.finish(OperationStatus::Failure, Some(err.to_string()));
                }
            }
        });
    }

    /// Render for the API
    pub fn info(&self) -> OperationInfo {
        let state = self.inner.state.lock().unwrap();
        OperationInfo {
            id: self.inner.id.clone(),
            class: self.inner.class,
            op_type: self.inner.op_type,
            project: self.inner.project.clone(),
            status: state.status,
            created_at: self.inner.created_at,
            updated_at: state.updated_at,
            resources: self.inner.resources.clone(),
            metadata: state.metadata.clone(),
            err: state.err.clone(),
            location: self.url(),
        }
    }
}

/// Registry of live operations on this member
#[derive(Clone, Default)]
pub struct Operations {
    ops: Arc<Mutex<HashMap<String, Operation>>>,
}

impl Operations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register an operation
    pub fn create(
        &self,
        class: OperationClass,
        op_type: OperationType,
        project: &str,
        resources: HashMap<String, Vec<String>>,
        metadata: Map<String, Value>,
        requestor: Option<String>,
    ) -> Operation {
        let now = Utc::now();
        let (done_tx, done_rx) = watch::channel(false);

        let expires_at = match class {
            OperationClass::Token => Some(now + Duration::seconds(TOKEN_VALID_SECS)),
            _ => None,
        };

        // Tokens hold no work; they are born running so they can be
        // consumed, and settle when used or cancelled.
        let status = match class {
            OperationClass::Token => OperationStatus::Running,
            _ => OperationStatus::Pending,
        };

        let op = Operation {
            inner: Arc::new(OperationInner {
                id: Uuid::new_v4().to_string(),
                class,
                op_type,
                project: project.to_string(),
                requestor,
                created_at: now,
                expires_at,
                resources,
                state: Mutex::new(OperationState {
                    status,
                    metadata,
                    err: String::new(),
                    updated_at: now,
                }),
                done_tx,
                done_rx,
                cancel: CancellationToken::new(),
            }),
        };

        self.ops
            .lock()
            .unwrap()
            .insert(op.id().to_string(), op.clone());

        info!(
            "Created {} operation {} ({:?})",
            match class {
                OperationClass::Task => "task",
                OperationClass::Token => "token",
                OperationClass::Websocket => "websocket",
            },
            op.id(),
            op_type
        );

        op
    }

    pub fn get(&self, id: &str) -> Result<Operation> {
        self.ops
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("Operation"))
    }

    /// Operations of a given type in a project
    pub fn by_type(&self, project: &str, op_type: OperationType) -> Vec<Operation> {
        self.ops
            .lock()
            .unwrap()
            .values()
            .filter(|op| op.project() == project && op.op_type() == op_type)
            .cloned()
            .collect()
    }

    /// Drop an operation from the registry
    pub fn remove(&self, id: &str) {
        self.ops.lock().unwrap().remove(id);
    }

    /// Validate and consume an image token secret.
    ///
    /// Scans in-flight `image-token` operations in the default project for
    /// one whose resources include the image and whose `secret` metadata
    /// matches. A live match is cancelled and dropped (single use); an
    /// expired match still authorises the request so a slow transfer can
    /// complete.
    pub fn image_valid_secret(
        &self,
        fingerprint: &str,
        secret: &str,
    ) -> Result<Option<OperationInfo>> {
        let image_url = format!("/1.0/images/{}", fingerprint);

        let candidates = self.by_type(crate::db::models::DEFAULT_PROJECT, OperationType::ImageToken);

        for op in candidates {
            let info = op.info();

            let Some(images) = info.resources.get("images") else {
                continue;
            };

            if !images.iter().any(|url| url.starts_with(&image_url)) {
                continue;
            }

            let Some(Value::String(op_secret)) = info.metadata.get("secret") else {
                continue;
            };

            if !constant_time_eq(op_secret.as_bytes(), secret.as_bytes()) {
                continue;
            }

            if op.is_running() && !op.is_expired() {
                // Token is single-use, so cancel it now.
                op.cancel();
                self.remove(op.id());
            }

            return Ok(Some(info));
        }

        Ok(None)
    }
}

/// Compare secrets without an early-exit on the first differing byte
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Generate a random hex secret of the standard length
pub fn random_secret() -> String {
    use rand::Rng;

    let mut rng = rand::thread_rng();
    (0..32)
        .map(|_| format!("{:x}", rng.gen_range(0..16)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn token_with_secret(ops: &Operations, fingerprint: &str, secret: &str) -> Operation {
        let mut metadata = Map::new();
        metadata.insert("secret".to_string(), json!(secret));

        let mut resources = HashMap::new();
        resources.insert(
            "images".to_string(),
            vec![format!("/1.0/images/{}", fingerprint)],
        );

        ops.create(
            OperationClass::Token,
            OperationType::ImageToken,
            "default",
            resources,
            metadata,
            None,
        )
    }

    #[tokio::test]
    async fn test_task_lifecycle() {
        let ops = Operations::new();
        let op = ops.create(
            OperationClass::Task,
            OperationType::ImagesUpdate,
            "default",
            HashMap::new(),
            Map::new(),
            None,
        );

        assert_eq!(op.status(), OperationStatus::Pending);
        op.start().unwrap();
        assert!(op.is_running());

        op.run(async { Ok(()) });
        assert_eq!(op.wait().await, OperationStatus::Success);
    }

    #[tokio::test]
    async fn test_task_failure_records_error() {
        let ops = Operations::new();
        let op = ops.create(
            OperationClass::Task,
            OperationType::ImageDelete,
            "default",
            HashMap::new(),
            Map::new(),
            None,
        );

        op.start().unwrap();
        op.run(async { Err(Error::Other("boom".to_string())) });

        assert_eq!(op.wait().await, OperationStatus::Failure);
        assert_eq!(op.info().err, "boom");
    }

    #[test]
    fn test_secret_consumed_once() {
        let ops = Operations::new();
        let op = token_with_secret(&ops, "abcd1234", "s3cret");
        assert!(op.is_running());

        // First use matches, cancels and drops the token
        let found = ops.image_valid_secret("abcd1234", "s3cret").unwrap();
        assert!(found.is_some());
        assert_eq!(op.status(), OperationStatus::Cancelled);

        // Second use finds nothing
        let again = ops.image_valid_secret("abcd1234", "s3cret").unwrap();
        assert!(again.is_none());
        assert!(ops.get(op.id()).is_err());
    }

    #[test]
    fn test_wrong_secret_or_image_rejected() {
        let ops = Operations::new();
        token_with_secret(&ops, "abcd1234", "s3cret");

        assert!(ops.image_valid_secret("abcd1234", "wrong").unwrap().is_none());
        assert!(ops.image_valid_secret("ffff0000", "s3cret").unwrap().is_none());
    }

    #[test]
    fn test_cancel_settles_status() {
        let ops = Operations::new();
        let op = ops.create(
            OperationClass::Task,
            OperationType::InstanceMigrate,
            "default",
            HashMap::new(),
            Map::new(),
            None,
        );

        op.start().unwrap();
        op.cancel();
        assert_eq!(op.status(), OperationStatus::Cancelled);
        assert!(op.cancel_token().is_cancelled());
    }

    #[test]
    fn test_random_secret_shape() {
        let secret = random_secret();
        assert_eq!(secret.len(), 32);
        assert!(secret.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(secret, random_secret());
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"same", b"same"));
        assert!(!constant_time_eq(b"same", b"diff"));
        assert!(!constant_time_eq(b"short", b"longer"));
    }
}
