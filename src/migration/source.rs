// src/migration/source.rs

//! Sending side of a migration session.

use super::{
    control::ControlMessage, ChannelRegistry, Dialer, MigrateSendArgs, MigrationChannels,
    MigrationConn, CHANNEL_CONTROL, CHANNEL_FILESYSTEM, CHANNEL_STATE, CRIU_BINARY,
};
use crate::error::{Error, Result};
use crate::instance::{Instance, InstanceType};
use crate::operations::random_secret;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};

/// Push-mode target: where to dial and which secrets to present
#[derive(Debug, Clone)]
pub struct PushTarget {
    /// Operation URL on the target, e.g. `https://peer:8443/1.0/operations/<id>`
    pub operation_url: String,
    /// PEM of the target's certificate, pinned for the dial
    pub certificate: Option<String>,
    /// Channel name → secret, as allocated by the target
    pub secrets: HashMap<String, String>,
}

/// The source half of a migration
#[derive(Debug)]
pub struct MigrationSource {
    pub channels: Arc<MigrationChannels>,
    live: bool,
    instance_only: bool,
    allow_inconsistent: bool,
    cluster_move_source_name: Option<String>,
    storage_pool: Option<String>,
    push: bool,
}

impl MigrationSource {
    /// Build the source session.
    ///
    /// The channel set is `{control, filesystem}` plus `state` when the
    /// session is live. Live container migration requires the
    /// checkpoint/restore tool on this end.
    pub fn new(
        instance: &dyn Instance,
        registry: &ChannelRegistry,
        stateful: bool,
        instance_only: bool,
        allow_inconsistent: bool,
        cluster_move_source_name: Option<String>,
        storage_pool: Option<String>,
        push_target: Option<PushTarget>,
    ) -> Result<Self> {
        let mut channel_names = vec![CHANNEL_CONTROL, CHANNEL_FILESYSTEM];
        let mut live = false;

        if stateful && instance.is_running() {
            if instance.instance_type() == InstanceType::Container
                && super::find_executable(CRIU_BINARY).is_none()
            {
                return Err(Error::Validation(
                    "Live migration is not supported on the source".to_string(),
                ));
            }

            live = true;
            channel_names.push(CHANNEL_STATE);
        }

        let mut conns = HashMap::with_capacity(channel_names.len());
        for name in channel_names {
            let conn = match &push_target {
                Some(target) => {
                    let secret = target.secrets.get(name).cloned().ok_or_else(|| {
                        Error::Validation(format!(
                            "Expected {} connection secret missing from migration source target request",
                            name
                        ))
                    })?;

                    MigrationConn::new_dial(
                        secret,
                        Dialer {
                            url: target.operation_url.clone(),
                            certificate: target.certificate.clone(),
                        },
                    )
                }
                None => MigrationConn::new_accept(random_secret(), registry),
            };

            conns.insert(name, conn);
        }

        Ok(Self {
            channels: Arc::new(MigrationChannels::new(conns)),
            live,
            instance_only,
            allow_inconsistent,
            cluster_move_source_name,
            storage_pool,
            push: push_target.is_some(),
        })
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    pub fn is_push(&self) -> bool {
        self.push
    }

    /// Channel secrets to publish on the migration operation (pull mode)
    pub async fn secrets(&self) -> HashMap<String, String> {
        self.channels.secrets().await
    }

    /// Drive the migration to completion.
    ///
    /// Any failure is written to the control channel as a terminal error
    /// frame before teardown so the other side can surface it.
    pub async fn run(&self, instance: Arc<dyn Instance>) -> Result<()> {
        debug!(
            instance = instance.name(),
            project = instance.project(),
            live = self.live,
            push = self.push,
            "Waiting for migration control connection on source"
        );

        self.channels.connect_control("source").await?;

        debug!("Migration control connection established on source");

        let args = MigrateSendArgs {
            channels: self.channels.clone(),
            snapshots: !self.instance_only,
            live: self.live,
            cluster_move_source_name: self.cluster_move_source_name.clone(),
            storage_pool: self.storage_pool.clone(),
            allow_inconsistent: self.allow_inconsistent,
        };

        let result = instance.migrate_send(args).await;

        // Close everything but control, then report on control, then let
        // the owning side drop it.
        self.channels.disconnect().await;

        match result {
            Ok(()) => {
                let _ = self.channels.send_control(&ControlMessage::success()).await;
                self.channels.close_control().await;
                debug!("Migration channels disconnected on source");
                Ok(())
            }
            Err(err) => {
                error!("Failed migration on source: {}", err);
                let message = format!("Failed migration on source: {}", err);
                let _ = self
                    .channels
                    .send_control(&ControlMessage::error(&message))
                    .await;
                self.channels.close_control().await;
                Err(Error::Other(message))
            }
        }
    }
}
