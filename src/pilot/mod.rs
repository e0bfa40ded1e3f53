//! Engine programmatic surface
//!
//! [`DockerPilot`] wires the registries and the engine together and exposes
//! the operations an external API layer calls. [`Session`] carries the
//! per-session scope: the selected host and the in-memory elevation secret.

mod session;

pub use session::Session;

use std::path::Path;
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::backup::BackupClassification;
use crate::config::Configuration;
use crate::descriptor::{ContainerDescriptor, Environment};
use crate::engine::{
    DeploymentHistoryEntry, Engine, EnvReport, MigrateOptions, PromoteOptions, Strategy,
};
use crate::error::Result;
use crate::health::HealthResolver;
use crate::hosts::{HostRecord, HostRegistry, SecretMaterial};
use crate::progress::{ProgressRecord, ProgressRegistry};

pub struct DockerPilot {
    config: Arc<Configuration>,
    hosts: Arc<HostRegistry>,
    progress: Arc<ProgressRegistry>,
    engine: Arc<Engine>,
}

impl DockerPilot {
    /// Build the full stack from a loaded configuration.
    pub fn open(config: Configuration) -> Result<Self> {
        let config = Arc::new(config);
        let progress = Arc::new(ProgressRegistry::new());
        let hosts = Arc::new(HostRegistry::open(&config, Arc::clone(&progress))?);

        if let Err(e) = HealthResolver::seed_defaults(&config.health_defaults_file()) {
            tracing::warn!("could not seed health-check defaults: {}", e);
        }
        let health = Arc::new(HealthResolver::load(
            &config.health_defaults_file(),
            &config.health_overrides_file(),
        ));
        let history = Arc::new(crate::engine::HistoryJournal::new(config.history_file()));

        let engine = Arc::new(Engine::new(
            Arc::clone(&config),
            Arc::clone(&hosts),
            Arc::clone(&progress),
            health,
            history,
        ));

        Ok(Self {
            config,
            hosts,
            progress,
            engine,
        })
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    /// Open a session scope. Defaults to the local host with no elevation
    /// secret.
    pub fn session(&self) -> Session {
        Session::new()
    }

    // ------------------------------------------------------------------
    // Hosts
    // ------------------------------------------------------------------

    pub fn list_hosts(&self) -> Vec<HostRecord> {
        self.hosts.list()
    }

    pub fn create_host(&self, record: HostRecord, secret: &SecretMaterial) -> Result<HostRecord> {
        self.hosts.create(record, secret)
    }

    pub fn update_host(
        &self,
        id: &str,
        record: HostRecord,
        secret: Option<&SecretMaterial>,
    ) -> Result<HostRecord> {
        self.hosts.update(id, record, secret)
    }

    pub fn delete_host(&self, id: &str) -> Result<()> {
        self.hosts.delete(id)
    }

    pub async fn test_host(&self, record: &HostRecord, secret: &SecretMaterial) -> Result<()> {
        self.hosts.test(record, secret).await
    }

    /// Open a connection for a stored host and ping its daemon.
    pub async fn test_host_id(&self, id: &str) -> Result<()> {
        let client = self.hosts.resolve(id).await?;
        let result = client.docker().ping().await;
        client.close().await;
        result
    }

    // ------------------------------------------------------------------
    // Environments and configs
    // ------------------------------------------------------------------

    pub async fn inspect_environments(&self, session: &Session) -> Result<Vec<EnvReport>> {
        self.engine.inspect_environments(&session.selected_host()).await
    }

    pub async fn prepare_config(
        &self,
        session: &Session,
        container: &str,
        target: Environment,
    ) -> Result<(std::path::PathBuf, ContainerDescriptor)> {
        self.engine
            .prepare_config(container, target, &session.selected_host())
            .await
    }

    pub async fn import_config(
        &self,
        path: &Path,
        target: Environment,
        override_container_name: Option<&str>,
    ) -> Result<ContainerDescriptor> {
        self.engine
            .import_config(path, target, override_container_name)
            .await
    }

    pub async fn classify_backup(
        &self,
        session: &Session,
        container: &str,
    ) -> Result<BackupClassification> {
        self.engine
            .classify_backup(container, &session.selected_host())
            .await
    }

    // ------------------------------------------------------------------
    // Promotions
    // ------------------------------------------------------------------

    /// Start one promotion; returns once the operation key is leased.
    pub fn promote_one(
        &self,
        session: &Session,
        from: Environment,
        to: Environment,
        container: &str,
        skip_backup: bool,
    ) -> Result<()> {
        self.engine
            .promote_one(from, to, container, self.session_options(session, skip_backup, None))
    }

    /// Promotion with an explicit strategy override.
    pub fn promote_one_with(
        &self,
        session: &Session,
        from: Environment,
        to: Environment,
        container: &str,
        skip_backup: bool,
        strategy: Strategy,
    ) -> Result<()> {
        self.engine.promote_one(
            from,
            to,
            container,
            self.session_options(session, skip_backup, Some(strategy)),
        )
    }

    /// Promote every container of `from`; progress runs under each name.
    pub async fn promote_all(
        &self,
        session: &Session,
        from: Environment,
        to: Environment,
        skip_backup: bool,
    ) -> Result<Vec<(String, Result<()>)>> {
        self.engine
            .promote_all(from, to, self.session_options(session, skip_backup, None))
            .await
    }

    fn session_options(
        &self,
        session: &Session,
        skip_backup: bool,
        strategy: Option<Strategy>,
    ) -> PromoteOptions {
        PromoteOptions {
            source_host: session.selected_host(),
            target_host: session.selected_host(),
            strategy,
            skip_backup,
            elevation_secret: session.elevation_secret(),
            ..PromoteOptions::default()
        }
    }

    // ------------------------------------------------------------------
    // Migration
    // ------------------------------------------------------------------

    pub fn migrate(
        &self,
        container: &str,
        source_id: &str,
        target_id: &str,
        include_data: bool,
        stop_source: bool,
    ) -> Result<()> {
        self.engine.migrate(
            container,
            source_id,
            target_id,
            MigrateOptions {
                include_data,
                stop_source,
            },
        )
    }

    // ------------------------------------------------------------------
    // Progress and history
    // ------------------------------------------------------------------

    pub fn cancel(&self, container: &str) -> Result<()> {
        self.engine.cancel(container)
    }

    pub fn progress(&self, container: &str) -> Option<ProgressRecord> {
        self.progress.get(container)
    }

    pub fn progress_all(&self) -> Vec<ProgressRecord> {
        self.progress.all()
    }

    /// Push channel mirroring one key's updates.
    pub fn subscribe_progress(&self, container: &str) -> Option<broadcast::Receiver<ProgressRecord>> {
        self.progress.subscribe(container)
    }

    pub async fn deployment_history(&self, limit: usize) -> Result<Vec<DeploymentHistoryEntry>> {
        self.engine.history().recent(limit).await
    }

    pub async fn prune_history(&self, keep: usize) -> Result<()> {
        self.engine.history().prune(keep).await
    }
}
