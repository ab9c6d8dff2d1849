// src/migration/control.rs

//! Control channel frames.
//!
//! The control channel carries JSON messages; filesystem and state bytes
//! may race them, so anything that needs ordering goes through explicit
//! sync points here.

use serde::{Deserialize, Serialize};

/// A frame on the control channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Source → sink: what this migration carries
    Offer(MigrationOffer),
    /// Sink → source: accept or refuse the offer
    Response(MigrationResponse),
    /// Either direction: explicit ordering barrier
    Sync(MigrationSync),
    /// Terminal frame: success or the final error text
    Control(MigrationControl),
}

/// The source's description of the transfer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MigrationOffer {
    pub instance_name: String,
    pub instance_type: String,
    pub snapshots: bool,
    pub live: bool,
    #[serde(default)]
    pub refresh: bool,
    /// Set on cluster-internal moves: the sink may skip snapshot and
    /// refresh checks because both sides share the database
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_move_source_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_pool: Option<String>,
}

/// The sink's answer to an offer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MigrationResponse {
    pub accepted: bool,
    #[serde(default)]
    pub refresh: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Ordering barrier inside the control stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MigrationSync {
    /// Barrier name agreed between the two drivers
    pub name: String,
}

/// Terminal control frame
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MigrationControl {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

impl ControlMessage {
    /// Terminal error frame with the given message
    pub fn error(message: impl Into<String>) -> Self {
        Self::Control(MigrationControl {
            success: false,
            message: message.into(),
        })
    }

    /// Terminal success frame
    pub fn success() -> Self {
        Self::Control(MigrationControl {
            success: true,
            message: String::new(),
        })
    }
}
