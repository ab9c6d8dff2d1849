// src/server/mod.rs

//! The paddock daemon: shared state and the HTTP surface.
//!
//! One `State` is shared by the REST handlers, the migration transport and
//! the maintenance loops. The replicated database, the storage drivers and
//! the authorizer backends are external collaborators reached through the
//! handles held here.

mod forward;
pub mod handlers;
mod routes;

pub use forward::forward_request;
pub use routes::create_router;

use crate::archive::ImageArchive;
use crate::db::{self, Db};
use crate::error::Result;
use crate::images::ImageLocks;
use crate::lifecycle::{Authorizer, Events, NullAuthorizer};
use crate::migration::ChannelRegistry;
use crate::operations::Operations;
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// State directory (default `/var/lib/paddock`)
    pub var_dir: PathBuf,
    /// Address the REST API binds to
    pub bind_addr: SocketAddr,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            var_dir: PathBuf::from("/var/lib/paddock"),
            bind_addr: "0.0.0.0:8443".parse().unwrap(),
        }
    }
}

impl DaemonConfig {
    pub fn with_var_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.var_dir = dir.into();
        self
    }

    /// `<var>/images`
    pub fn images_dir(&self) -> PathBuf {
        self.var_dir.join("images")
    }

    /// `<var>/database`
    pub fn database_dir(&self) -> PathBuf {
        self.var_dir.join("database")
    }

    pub fn cluster_db_path(&self) -> PathBuf {
        self.database_dir().join(db::CLUSTER_DB)
    }

    pub fn local_db_path(&self) -> PathBuf {
        self.database_dir().join(db::LOCAL_DB)
    }
}

/// Shared daemon state
pub struct State {
    pub config: DaemonConfig,
    /// Local replica of the cluster database
    pub cluster: Db,
    /// Node-local database (raft config, node config)
    pub local: Db,
    pub archive: ImageArchive,
    pub operations: Operations,
    pub events: Events,
    pub authorizer: Arc<dyn Authorizer>,
    /// Pending websocket hand-offs for migration channels
    pub channels: ChannelRegistry,
    /// Per-fingerprint write serialisation
    pub image_locks: ImageLocks,
    /// Instance publish is globally serialised: parallel publishes thrash
    /// storage and two publishes of one instance race to conflicting
    /// fingerprints
    pub publish_lock: tokio::sync::Mutex<()>,
    /// Only one maintenance loop runs at a time
    pub task_lock: tokio::sync::Mutex<()>,
    pub start_time: DateTime<Utc>,
    pub shutdown: CancellationToken,
    pub http: reqwest::Client,
    /// Instance driver hook; the daemon wires the real loader at startup
    instance_loader: std::sync::RwLock<Option<Box<crate::instance::InstanceLoader>>>,
}

impl State {
    /// Open databases and the image archive, building the shared state
    pub fn new(config: DaemonConfig) -> Result<Arc<Self>> {
        let cluster = db::init_cluster(config.cluster_db_path())?;
        let local = db::init_local(config.local_db_path())?;
        let archive = ImageArchive::open(config.images_dir())?;

        let http = reqwest::Client::builder()
            .user_agent(concat!("paddock/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(crate::error::Error::Http)?;

        Ok(Arc::new(Self {
            config,
            cluster: Db::new(cluster),
            local: Db::new(local),
            archive,
            operations: Operations::new(),
            events: Events::new(),
            authorizer: Arc::new(NullAuthorizer),
            channels: ChannelRegistry::new(),
            image_locks: ImageLocks::new(),
            publish_lock: tokio::sync::Mutex::new(()),
            task_lock: tokio::sync::Mutex::new(()),
            start_time: Utc::now(),
            shutdown: CancellationToken::new(),
            http,
            instance_loader: std::sync::RwLock::new(None),
        }))
    }

    /// Install the instance driver loader
    pub fn set_instance_loader(&self, loader: Box<crate::instance::InstanceLoader>) {
        *self.instance_loader.write().unwrap() = Some(loader);
    }

    /// Resolve an instance by project and name through the driver hook
    pub fn load_instance(
        &self,
        project: &str,
        name: &str,
    ) -> Result<Arc<dyn crate::instance::Instance>> {
        let loader = self.instance_loader.read().unwrap();
        match loader.as_ref() {
            Some(loader) => loader(project, name),
            None => Err(crate::error::Error::Other(
                "No instance driver registered".to_string(),
            )),
        }
    }

    /// This member's cluster address (`cluster.https_address`), empty when
    /// not clustered
    pub async fn local_address(&self) -> Result<String> {
        self.local
            .with(|conn| db::node_config_get(conn, "cluster.https_address"))
            .await
            .map(|v| v.unwrap_or_default())
    }

    /// This member's row id in the nodes table, None when not clustered
    pub async fn local_member_id(&self) -> Result<Option<i64>> {
        let address = self.local_address().await?;
        if address.is_empty() {
            return Ok(None);
        }

        self.cluster
            .with(
                |conn| match crate::db::models::Member::get_by_address(conn, &address) {
                    Ok(member) => Ok(Some(member.id)),
                    Err(ref e) if e.is_not_found() => Ok(None),
                    Err(e) => Err(e),
                },
            )
            .await
    }

    /// Node-local `storage.images_volume` setting, empty when unset
    pub async fn images_volume(&self) -> Result<String> {
        self.local
            .with(|conn| db::node_config_get(conn, "storage.images_volume"))
            .await
            .map(|v| v.unwrap_or_default())
    }

    /// Global integer config with a built-in default
    pub async fn global_i64(&self, key: &'static str, default: i64) -> Result<i64> {
        self.cluster
            .with(move |conn| {
                let Some(value) = db::config_get(conn, key)? else {
                    return Ok(default);
                };
                value.parse().map_err(|_| {
                    crate::error::Error::Validation(format!(
                        "Invalid value for {}: {}",
                        key, value
                    ))
                })
            })
            .await
    }

    /// Global string config with a built-in default
    pub async fn global_string(&self, key: &'static str, default: &str) -> Result<String> {
        let default = default.to_string();
        self.cluster
            .with(move |conn| Ok(db::config_get(conn, key)?.unwrap_or(default)))
            .await
    }
}

/// Run the daemon: REST API plus background maintenance loops
pub async fn run_server(state: Arc<State>) -> Result<()> {
    info!("Starting paddock daemon on {}", state.config.bind_addr);
    info!("State directory: {:?}", state.config.var_dir);

    // Maintenance: an initial synchronous expiry pass runs before the
    // loops start so stale files never coexist with live ones.
    crate::images::maintenance::prune_expired_images_now(&state).await;
    crate::images::maintenance::prune_leftover_images(&state).await;

    tokio::spawn(crate::images::maintenance::auto_update_images_task(
        state.clone(),
    ));
    tokio::spawn(crate::images::maintenance::prune_expired_images_task(
        state.clone(),
    ));
    tokio::spawn(crate::images::replication::auto_sync_images_task(
        state.clone(),
    ));

    let app = create_router(state.clone());

    let listener = tokio::net::TcpListener::bind(state.config.bind_addr).await?;
    info!("Daemon is ready to serve");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_state_initialises_layout() {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig::default().with_var_dir(dir.path());

        let state = State::new(config).unwrap();
        assert!(dir.path().join("images").is_dir());
        assert!(dir.path().join("database/cluster.db").exists());
        assert!(dir.path().join("database/local.db").exists());

        // Not clustered yet
        assert_eq!(state.local_address().await.unwrap(), "");
        assert_eq!(state.local_member_id().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_global_config_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let state = State::new(DaemonConfig::default().with_var_dir(dir.path())).unwrap();

        assert_eq!(
            state.global_i64("images.auto_update_interval", 6).await.unwrap(),
            6
        );

        state
            .cluster
            .with(|conn| db::config_set(conn, "images.auto_update_interval", "12"))
            .await
            .unwrap();

        assert_eq!(
            state.global_i64("images.auto_update_interval", 6).await.unwrap(),
            12
        );
    }
}
