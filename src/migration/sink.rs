// src/migration/sink.rs

//! Receiving side of a migration session.

use super::{
    control::ControlMessage, ChannelRegistry, Dialer, MigrateReceiveArgs, MigrationChannels,
    MigrationConn, CHANNEL_CONTROL, CHANNEL_FILESYSTEM, CHANNEL_STATE, CRIU_BINARY,
};
use crate::error::{Error, Result};
use crate::instance::{Instance, InstanceType};
use crate::operations::random_secret;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};

/// How a sink session is configured
pub struct MigrationSinkArgs {
    /// Source operation URL to dial (pull mode)
    pub url: Option<String>,
    /// PEM of the source's certificate, pinned for the dial
    pub certificate: Option<String>,
    /// Channel secrets from the source (pull mode)
    pub secrets: HashMap<String, String>,
    /// Push mode: the source dials us instead
    pub push: bool,
    pub live: bool,
    pub instance_only: bool,
    pub cluster_move_source_name: Option<String>,
    pub storage_pool: Option<String>,
    pub refresh: bool,
    pub refresh_exclude_older: Option<DateTime<Utc>>,
}

/// The sink half of a migration
#[derive(Debug)]
pub struct MigrationSink {
    pub channels: Arc<MigrationChannels>,
    live: bool,
    instance_only: bool,
    push: bool,
    cluster_move_source_name: Option<String>,
    storage_pool: Option<String>,
    refresh: bool,
    refresh_exclude_older: Option<DateTime<Utc>>,
}

impl MigrationSink {
    /// Build the sink session.
    ///
    /// Pull mode dials the source with its published secrets; push mode
    /// allocates fresh secrets and waits for the source to dial. Live
    /// container migration requires the checkpoint/restore tool on this
    /// end too.
    pub fn new(
        instance: &dyn Instance,
        registry: &ChannelRegistry,
        args: MigrationSinkArgs,
    ) -> Result<Self> {
        let mut channel_names = vec![CHANNEL_CONTROL, CHANNEL_FILESYSTEM];

        if args.live {
            if instance.instance_type() == InstanceType::Container
                && super::find_executable(CRIU_BINARY).is_none()
            {
                return Err(Error::Validation(
                    "Live migration is not supported on the target".to_string(),
                ));
            }

            channel_names.push(CHANNEL_STATE);
        }

        let mut conns = HashMap::with_capacity(channel_names.len());
        for name in channel_names {
            let conn = if !args.push {
                let secret = args.secrets.get(name).cloned().ok_or_else(|| {
                    Error::Validation(format!(
                        "Expected {} connection secret missing from migration sink target request",
                        name
                    ))
                })?;

                let url = args.url.clone().ok_or_else(|| {
                    Error::Validation("Missing migration source URL".to_string())
                })?;

                MigrationConn::new_dial(
                    secret,
                    Dialer {
                        url,
                        certificate: args.certificate.clone(),
                    },
                )
            } else {
                MigrationConn::new_accept(random_secret(), registry)
            };

            conns.insert(name, conn);
        }

        Ok(Self {
            channels: Arc::new(MigrationChannels::new(conns)),
            live: args.live,
            instance_only: args.instance_only,
            push: args.push,
            cluster_move_source_name: args.cluster_move_source_name,
            storage_pool: args.storage_pool,
            refresh: args.refresh,
            refresh_exclude_older: args.refresh_exclude_older,
        })
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    /// Channel secrets to publish on the target operation (push mode)
    pub async fn secrets(&self) -> HashMap<String, String> {
        self.channels.secrets().await
    }

    /// Drive the receive to completion, reporting failure on control
    pub async fn run(&self, instance: Arc<dyn Instance>) -> Result<()> {
        debug!(
            instance = instance.name(),
            project = instance.project(),
            live = self.live,
            push = self.push,
            refresh = self.refresh,
            "Waiting for migration control connection on target"
        );

        self.channels.connect_control("target").await?;

        debug!("Migration control connection established on target");

        let args = MigrateReceiveArgs {
            channels: self.channels.clone(),
            snapshots: !self.instance_only,
            live: self.live,
            cluster_move_source_name: self.cluster_move_source_name.clone(),
            storage_pool: self.storage_pool.clone(),
            refresh: self.refresh,
            refresh_exclude_older: self.refresh_exclude_older,
        };

        let result = instance.migrate_receive(args).await;

        // In push mode this side owns the teardown ordering.
        if self.push {
            self.channels.disconnect().await;
        }

        match result {
            Ok(()) => {
                debug!("Migration channels disconnected on target");
                Ok(())
            }
            Err(err) => {
                error!("Failed migration on target: {}", err);
                let message = format!("Failed migration on target: {}", err);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::metadata::ImageMetadata;
    use crate::migration::MigrateSendArgs;
    use crate::progress::ProgressTracker;
    use async_trait::async_trait;
    use std::io::Write;
    use std::path::PathBuf;

    struct FakeInstance;

    #[async_trait]
    impl Instance for FakeInstance {
        fn name(&self) -> &str {
            "web1"
        }

        fn project(&self) -> &str {
            "default"
        }

        fn instance_type(&self) -> InstanceType {
            InstanceType::VirtualMachine
        }

        fn architecture(&self) -> String {
            "x86_64".to_string()
        }

        fn is_running(&self) -> bool {
            false
        }

        fn rootfs_path(&self) -> PathBuf {
            PathBuf::from("/tmp/nonexistent")
        }

        fn export(
            &self,
            _meta: &mut dyn Write,
            _rootfs: Option<&mut dyn Write>,
            _properties: &std::collections::HashMap<String, String>,
            _expires_at: Option<chrono::DateTime<Utc>>,
            _tracker: &ProgressTracker,
        ) -> crate::error::Result<ImageMetadata> {
            unimplemented!("not exercised")
        }

        async fn migrate_send(&self, _args: MigrateSendArgs) -> crate::error::Result<()> {
            Ok(())
        }

        async fn migrate_receive(&self, _args: MigrateReceiveArgs) -> crate::error::Result<()> {
            Ok(())
        }
    }

    fn pull_args(secrets: HashMap<String, String>) -> MigrationSinkArgs {
        MigrationSinkArgs {
            url: Some("https://peer:8443/1.0/operations/abc".to_string()),
            certificate: None,
            secrets,
            push: false,
            live: false,
            instance_only: false,
            cluster_move_source_name: None,
            storage_pool: None,
            refresh: false,
            refresh_exclude_older: None,
        }
    }

    #[test]
    fn test_pull_sink_requires_all_secrets() {
        let registry = ChannelRegistry::new();

        let err = MigrationSink::new(
            &FakeInstance,
            &registry,
            pull_args([("control".to_string(), "s1".to_string())].into()),
        )
        .unwrap_err();
        assert!(err.to_string().contains("filesystem"));
    }

    #[tokio::test]
    async fn test_push_sink_allocates_secrets() {
        let registry = ChannelRegistry::new();

        let mut args = pull_args(HashMap::new());
        args.push = true;
        args.url = None;

        let sink = MigrationSink::new(&FakeInstance, &registry, args).unwrap();
        let secrets = sink.secrets().await;
        assert_eq!(secrets.len(), 2);
        assert!(secrets.contains_key("control"));
        assert!(secrets.contains_key("filesystem"));
    }

    #[tokio::test]
    async fn test_vm_live_sink_needs_no_checkpoint_tool() {
        // VMs carry their state channel without criu
        let registry = ChannelRegistry::new();

        let mut args = pull_args(HashMap::new());
        args.push = true;
        args.url = None;
        args.live = true;

        let sink = MigrationSink::new(&FakeInstance, &registry, args).unwrap();
        assert!(sink.is_live());
        assert!(sink.channels.has_state().await);
    }

    #[tokio::test]
    async fn test_control_timeout_on_target() {
        tokio::time::pause();

        let registry = ChannelRegistry::new();
        let mut args = pull_args(HashMap::new());
        args.push = true;
        args.url = None;

        let sink = MigrationSink::new(&FakeInstance, &registry, args).unwrap();
        let err = sink.channels.connect_control("target").await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Failed waiting for migration control connection on target"
        );
    }
}
