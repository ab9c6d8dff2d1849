// src/lifecycle.rs

//! Lifecycle events and authorizer hooks.
//!
//! Every mutation of the image store emits a structured lifecycle event on
//! a broadcast bus and mirrors the change into the authorizer. The
//! authorizer is eventually-consistent with the database of record: hook
//! failures are logged at ERROR and never fail the calling operation.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::error;

/// Lifecycle actions emitted by the image subsystem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleAction {
    #[serde(rename = "image-created")]
    ImageCreated,
    #[serde(rename = "image-updated")]
    ImageUpdated,
    #[serde(rename = "image-deleted")]
    ImageDeleted,
    #[serde(rename = "image-refreshed")]
    ImageRefreshed,
    #[serde(rename = "image-retrieved")]
    ImageRetrieved,
    #[serde(rename = "image-secret-created")]
    ImageSecretCreated,
    #[serde(rename = "image-alias-created")]
    ImageAliasCreated,
    #[serde(rename = "image-alias-updated")]
    ImageAliasUpdated,
    #[serde(rename = "image-alias-deleted")]
    ImageAliasDeleted,
    #[serde(rename = "image-alias-renamed")]
    ImageAliasRenamed,
}

/// A structured lifecycle event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub action: LifecycleAction,
    pub project: String,
    /// API path of the affected entity, e.g. `/1.0/images/<fp>`
    pub source: String,
    /// Who triggered the action, when known
    pub requestor: Option<String>,
    /// Action-specific extras
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub context: Map<String, Value>,
}

impl LifecycleEvent {
    pub fn new(action: LifecycleAction, project: &str, source: String) -> Self {
        Self {
            action,
            project: project.to_string(),
            source,
            requestor: None,
            context: Map::new(),
        }
    }

    pub fn with_requestor(mut self, requestor: Option<String>) -> Self {
        self.requestor = requestor;
        self
    }

    pub fn with_context(mut self, key: &str, value: Value) -> Self {
        self.context.insert(key.to_string(), value);
        self
    }
}

/// Broadcast bus for lifecycle events
#[derive(Debug, Clone)]
pub struct Events {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl Events {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    /// Emit an event; having no listeners is fine
    pub fn send(&self, event: LifecycleEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }
}

impl Default for Events {
    fn default() -> Self {
        Self::new()
    }
}

/// Authorizer mutations mirrored from image store changes
///
/// Implementations talk to an external policy engine; the daemon never
/// waits on one to answer before finishing the user's request.
pub trait Authorizer: Send + Sync {
    fn add_image(&self, project: &str, fingerprint: &str) -> anyhow::Result<()>;
    fn delete_image(&self, project: &str, fingerprint: &str) -> anyhow::Result<()>;
    fn add_image_alias(&self, project: &str, name: &str) -> anyhow::Result<()>;
    fn delete_image_alias(&self, project: &str, name: &str) -> anyhow::Result<()>;
    fn rename_image_alias(&self, project: &str, old_name: &str, new_name: &str)
        -> anyhow::Result<()>;
}

/// Authorizer that accepts everything; the default wiring
pub struct NullAuthorizer;

impl Authorizer for NullAuthorizer {
    fn add_image(&self, _project: &str, _fingerprint: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn delete_image(&self, _project: &str, _fingerprint: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn add_image_alias(&self, _project: &str, _name: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn delete_image_alias(&self, _project: &str, _name: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn rename_image_alias(
        &self,
        _project: &str,
        _old_name: &str,
        _new_name: &str,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Run an authorizer hook, logging instead of propagating failure
pub fn authz_hook(description: &str, result: anyhow::Result<()>) {
    if let Err(err) = result {
        error!("Failed to update authorizer ({}): {}", description, err);
    }
}
