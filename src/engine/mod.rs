//! Deployment and migration engine
//!
//! Each operation acquires a progress lease, resolves its own clients,
//! drives a strategy state machine with cooperative cancellation at stage
//! boundaries, and appends a history entry on the way out.

mod bluegreen;
mod canary;
mod driver;
mod history;
mod migrate;
mod quick;
mod rolling;

pub use history::{DeployStatus, DeploymentHistoryEntry, HistoryJournal};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::backup::{backup_mount, classify, BackupClassification};
use crate::config::Configuration;
use crate::descriptor::{
    export_yaml, import_yaml, introspect, transform, ContainerDescriptor, Environment,
};
use crate::error::{ErrorKind, PilotError, Result};
use crate::health::HealthResolver;
use crate::hosts::{AuthenticatedClient, HostRegistry, LOCAL_HOST_ID};
use crate::progress::{ProgressLease, ProgressRegistry, Stage};

use driver::{Abort, Outcome, StepResult, StrategyCtx};

/// Deployment strategy. Defaults per target environment: quick for dev,
/// rolling for staging, blue-green for prod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    Quick,
    Rolling,
    BlueGreen,
    Canary,
}

impl Strategy {
    fn default_for(env: Environment) -> Self {
        match env {
            Environment::Dev => Strategy::Quick,
            Environment::Staging => Strategy::Rolling,
            Environment::Prod => Strategy::BlueGreen,
        }
    }
}

/// Options for one promotion.
#[derive(Debug, Clone)]
pub struct PromoteOptions {
    pub source_host: String,
    pub target_host: String,
    pub strategy: Option<Strategy>,
    pub skip_backup: bool,
    /// Keep the old image after a quick deploy
    pub no_cleanup: bool,
    /// Build context; when absent the image is pulled or transferred
    pub dockerfile: Option<PathBuf>,
    /// Session elevation secret for privileged-path backups
    pub elevation_secret: Option<String>,
    /// Blue-green: copy data between distinct volumes before the switch
    pub migrate_data: bool,
}

impl Default for PromoteOptions {
    fn default() -> Self {
        Self {
            source_host: LOCAL_HOST_ID.to_string(),
            target_host: LOCAL_HOST_ID.to_string(),
            strategy: None,
            skip_backup: false,
            no_cleanup: false,
            dockerfile: None,
            elevation_secret: None,
            migrate_data: true,
        }
    }
}

/// Options for one migration.
#[derive(Debug, Clone)]
pub struct MigrateOptions {
    pub include_data: bool,
    pub stop_source: bool,
}

/// Per-environment summary for the pipeline view.
#[derive(Debug, Clone, Serialize)]
pub struct EnvReport {
    pub environment: Environment,
    pub image: Option<String>,
    pub container_count_running: usize,
    pub container_count_total: usize,
    pub status: String,
    pub containers: Vec<String>,
}

pub struct Engine {
    pub(crate) config: Arc<Configuration>,
    pub(crate) hosts: Arc<HostRegistry>,
    pub(crate) progress: Arc<ProgressRegistry>,
    pub(crate) health: Arc<HealthResolver>,
    pub(crate) history: Arc<HistoryJournal>,
}

impl Engine {
    pub fn new(
        config: Arc<Configuration>,
        hosts: Arc<HostRegistry>,
        progress: Arc<ProgressRegistry>,
        health: Arc<HealthResolver>,
        history: Arc<HistoryJournal>,
    ) -> Self {
        Self {
            config,
            hosts,
            progress,
            health,
            history,
        }
    }

    pub fn progress(&self) -> &Arc<ProgressRegistry> {
        &self.progress
    }

    pub fn history(&self) -> &Arc<HistoryJournal> {
        &self.history
    }

    /// Start a promotion; returns as soon as the lease is held. A second
    /// call for the same container fails fast with `already_running`.
    pub fn promote_one(
        self: &Arc<Self>,
        from: Environment,
        to: Environment,
        container: &str,
        opts: PromoteOptions,
    ) -> Result<()> {
        let lease = self.progress.acquire(container)?;
        lease.set_hosts(vec![opts.source_host.clone(), opts.target_host.clone()]);

        let engine = Arc::clone(self);
        let container = container.to_string();
        tokio::spawn(async move {
            engine.run_promotion(lease, from, to, container, opts).await;
        });
        Ok(())
    }

    /// Promote every container of `from` on the source host. Progress runs
    /// under each container's own key; per-container start failures are
    /// returned alongside the keys that did start.
    pub async fn promote_all(
        self: &Arc<Self>,
        from: Environment,
        to: Environment,
        opts: PromoteOptions,
    ) -> Result<Vec<(String, Result<()>)>> {
        let client = self.hosts.resolve(&opts.source_host).await?;
        let names = containers_in_env(&client, from).await;
        client.close().await;
        let names = names?;

        let mut started = Vec::new();
        for name in names {
            let result = self.promote_one(from, to, &name, opts.clone());
            started.push((name, result));
        }
        Ok(started)
    }

    /// Start a cross-host migration. Same-host requests are rejected before
    /// any progress record exists.
    pub fn migrate(
        self: &Arc<Self>,
        container: &str,
        source_id: &str,
        target_id: &str,
        opts: MigrateOptions,
    ) -> Result<()> {
        if source_id == target_id {
            return Err(PilotError::new(
                ErrorKind::SameHost,
                "source and target are the same host",
            ));
        }
        // Two records pointing at one endpoint are still the same host.
        if let (Ok(a), Ok(b)) = (self.hosts.get(source_id), self.hosts.get(target_id)) {
            if !a.hostname.is_empty() && a.hostname == b.hostname && a.port == b.port {
                return Err(PilotError::new(
                    ErrorKind::SameHost,
                    format!("{} and {} resolve to the same endpoint", source_id, target_id),
                ));
            }
        }

        let lease = self.progress.acquire(container)?;
        lease.set_hosts(vec![source_id.to_string(), target_id.to_string()]);

        let engine = Arc::clone(self);
        let container = container.to_string();
        let source_id = source_id.to_string();
        let target_id = target_id.to_string();
        tokio::spawn(async move {
            engine
                .run_migration(lease, container, source_id, target_id, opts)
                .await;
        });
        Ok(())
    }

    /// Request cancellation of a running operation.
    pub fn cancel(&self, container: &str) -> Result<()> {
        self.progress.cancel(container)
    }

    /// Backup pre-flight for a container; the caller examines the result
    /// before starting a promotion.
    pub async fn classify_backup(
        &self,
        container: &str,
        host_id: &str,
    ) -> Result<BackupClassification> {
        let client = self.hosts.resolve(host_id).await?;
        let result = async {
            let descriptor =
                introspect(client.docker(), container, &self.health, &self.config.health).await?;
            classify(client.docker(), &descriptor, &self.config.backup).await
        }
        .await;
        client.close().await;
        result
    }

    /// Introspect + transform and persist the YAML descriptor under
    /// `configs/deployment-<env>-<container>.yml`.
    pub async fn prepare_config(
        &self,
        container: &str,
        target: Environment,
        host_id: &str,
    ) -> Result<(PathBuf, ContainerDescriptor)> {
        let client = self.hosts.resolve(host_id).await?;
        let result = async {
            let descriptor =
                introspect(client.docker(), container, &self.health, &self.config.health).await?;
            let transformed = transform(&descriptor, target);
            transformed.validate()?;

            let yaml = export_yaml(&transformed)?;
            let path = self.config_path(target, &transformed.container_name);
            tokio::fs::create_dir_all(self.config.configs_dir()).await?;
            tokio::fs::write(&path, yaml).await?;

            info!(container, path = %path.display(), "prepared deployment config");
            Ok((path, transformed))
        }
        .await;
        client.close().await;
        result
    }

    /// Import an externally edited descriptor, validate it, and store the
    /// normalized form under the configs directory.
    pub async fn import_config(
        &self,
        path: &std::path::Path,
        target: Environment,
        override_container_name: Option<&str>,
    ) -> Result<ContainerDescriptor> {
        let content = tokio::fs::read_to_string(path).await?;
        let mut descriptor = import_yaml(&content)?;

        if let Some(name) = override_container_name {
            descriptor.container_name = name.to_string();
        }
        descriptor.validate()?;

        let stored = self.config_path(target, &descriptor.container_name);
        tokio::fs::create_dir_all(self.config.configs_dir()).await?;
        tokio::fs::write(&stored, export_yaml(&descriptor)?).await?;

        info!(path = %stored.display(), "imported deployment config");
        Ok(descriptor)
    }

    /// Per-environment summary of the pipeline on one host.
    pub async fn inspect_environments(&self, host_id: &str) -> Result<Vec<EnvReport>> {
        let client = self.hosts.resolve(host_id).await?;
        let result = environment_reports(&client).await;
        client.close().await;
        result
    }

    fn config_path(&self, env: Environment, container: &str) -> PathBuf {
        self.config
            .configs_dir()
            .join(format!("deployment-{}-{}.yml", env, container))
    }

    async fn run_promotion(
        self: Arc<Self>,
        lease: ProgressLease,
        from: Environment,
        to: Environment,
        container: String,
        opts: PromoteOptions,
    ) {
        let started = Instant::now();
        info!(container = container.as_str(), %from, %to, "promotion started");

        lease.update(Stage::Starting, 0, "resolving hosts");
        let source = match self.hosts.resolve(&opts.source_host).await {
            Ok(client) => client,
            Err(e) => {
                self.finish(lease, &container, "promotion", None, started, Err(Abort::Fail(e)))
                    .await;
                return;
            }
        };
        let target = match self.hosts.resolve(&opts.target_host).await {
            Ok(client) => client,
            Err(e) => {
                source.close().await;
                self.finish(lease, &container, "promotion", None, started, Err(Abort::Fail(e)))
                    .await;
                return;
            }
        };

        let result = self
            .promotion_body(&lease, &source, &target, to, &container, &opts)
            .await;

        let image_tag = match &result {
            Ok((_, tag)) => Some(tag.clone()),
            Err(_) => None,
        };

        source.close().await;
        target.close().await;

        self.finish(
            lease,
            &container,
            "promotion",
            image_tag,
            started,
            result.map(|(outcome, _)| outcome),
        )
        .await;
    }

    async fn promotion_body(
        &self,
        lease: &ProgressLease,
        source: &AuthenticatedClient,
        target: &AuthenticatedClient,
        to: Environment,
        container: &str,
        opts: &PromoteOptions,
    ) -> StepResult<(Outcome, String)> {
        lease.update(Stage::Starting, 2, format!("inspecting {}", container));
        let source_descriptor = introspect(
            source.docker(),
            container,
            &self.health,
            &self.config.health,
        )
        .await
        .map_err(Abort::Fail)?;

        let descriptor = transform(&source_descriptor, to);
        descriptor.validate().map_err(Abort::Fail)?;

        if lease.cancel_requested() {
            return Err(Abort::Cancelled);
        }

        if !opts.skip_backup {
            self.backup_source(lease, source, &source_descriptor, container, opts)
                .await?;
        }

        let strategy = opts.strategy.unwrap_or_else(|| Strategy::default_for(to));
        let ctx = StrategyCtx {
            engine: self,
            lease,
            source,
            target,
            source_descriptor: &source_descriptor,
            descriptor: &descriptor,
            opts,
        };

        let outcome = match strategy {
            Strategy::Quick => quick::run(&ctx).await?,
            Strategy::Rolling => rolling::run(&ctx).await?,
            Strategy::BlueGreen => bluegreen::run(&ctx).await?,
            Strategy::Canary => canary::run(&ctx).await?,
        };

        Ok((outcome, descriptor.image_tag))
    }

    /// Snapshot the source container's mounts before deploying. Fails with
    /// `elevation_required` when privileged paths exist and no secret was
    /// provided; checks cancellation between archive files.
    async fn backup_source(
        &self,
        lease: &ProgressLease,
        source: &AuthenticatedClient,
        descriptor: &ContainerDescriptor,
        op_key: &str,
        opts: &PromoteOptions,
    ) -> StepResult<()> {
        if descriptor.volumes.is_empty() {
            return Ok(());
        }

        lease.update(Stage::BackingUp, 5, "classifying mounts");
        let classification = classify(source.docker(), descriptor, &self.config.backup)
            .await
            .map_err(Abort::Fail)?;

        if classification.requires_sudo && opts.elevation_secret.is_none() {
            return Err(Abort::Fail(PilotError::new(
                ErrorKind::ElevationRequired,
                format!(
                    "privileged paths need an elevation secret: {}",
                    classification.privileged_paths.join(", ")
                ),
            )));
        }
        if let Some(warning) = classification.warning() {
            warn!(container = op_key, "{}", warning);
        }

        let archive_dir = self.config.backups_dir();
        let total = descriptor.volumes.len();
        for (index, mount) in descriptor.volumes.iter().enumerate() {
            if lease.cancel_requested() {
                return Err(Abort::Cancelled);
            }
            lease.update(
                Stage::BackingUp,
                5 + (index * 10 / total.max(1)) as u8,
                format!("backing up {} ({}/{})", mount.source_id(), index + 1, total),
            );

            let record = backup_mount(
                source.docker(),
                mount,
                op_key,
                &archive_dir,
                &self.config.docker.helper_image,
                opts.elevation_secret.as_deref(),
            )
            .await
            .map_err(Abort::Fail)?;

            if let Some(reason) = &record.skip_reason {
                warn!(mount = record.identifier.as_str(), "skipped: {}", reason);
            }
        }

        Ok(())
    }

    async fn run_migration(
        self: Arc<Self>,
        lease: ProgressLease,
        container: String,
        source_id: String,
        target_id: String,
        opts: MigrateOptions,
    ) {
        let started = Instant::now();
        info!(
            container = container.as_str(),
            from = source_id.as_str(),
            to = target_id.as_str(),
            "migration started"
        );

        lease.update(Stage::Starting, 0, "resolving hosts");
        let source = match self.hosts.resolve(&source_id).await {
            Ok(client) => client,
            Err(e) => {
                self.finish(lease, &container, "migration", None, started, Err(Abort::Fail(e)))
                    .await;
                return;
            }
        };
        let target = match self.hosts.resolve(&target_id).await {
            Ok(client) => client,
            Err(e) => {
                source.close().await;
                self.finish(lease, &container, "migration", None, started, Err(Abort::Fail(e)))
                    .await;
                return;
            }
        };

        let result = migrate::run(&self, &lease, &source, &target, &container, &opts).await;

        source.close().await;
        target.close().await;

        self.finish(lease, &container, "migration", None, started, result)
            .await;
    }

    /// Terminal bookkeeping shared by all operations: final progress record
    /// and the history entry.
    async fn finish(
        &self,
        lease: ProgressLease,
        container: &str,
        fallback_strategy: &str,
        image_tag: Option<String>,
        started: Instant,
        result: StepResult<Outcome>,
    ) {
        let duration_ms = started.elapsed().as_millis() as u64;

        let (strategy, status, message, stage) = match result {
            Ok(outcome) => (
                outcome.strategy.to_string(),
                DeployStatus::Success,
                outcome.message,
                Stage::Completed,
            ),
            Err(Abort::Cancelled) => (
                fallback_strategy.to_string(),
                DeployStatus::Failed,
                "cancelled by operator".to_string(),
                Stage::Cancelled,
            ),
            Err(Abort::Fail(e)) => {
                let stage = if e.kind() == ErrorKind::InvariantViolation {
                    Stage::Error
                } else {
                    Stage::Failed
                };
                (
                    fallback_strategy.to_string(),
                    DeployStatus::Failed,
                    e.to_string(),
                    stage,
                )
            }
        };

        match stage {
            Stage::Completed => info!(container, %strategy, "operation completed"),
            Stage::Cancelled => warn!(container, %strategy, "operation cancelled"),
            _ => error!(container, %strategy, "operation failed: {}", message),
        }

        lease.finish(stage, 0, message.clone());

        let entry = DeploymentHistoryEntry {
            timestamp: Utc::now(),
            strategy,
            image_tag: image_tag.unwrap_or_default(),
            container_name: container.to_string(),
            status,
            duration_ms,
            output: Some(message),
        };
        if let Err(e) = self.history.append(&entry).await {
            error!("could not append history entry: {}", e);
        }
    }
}

/// Names of containers belonging to an environment, by suffix convention.
/// Deployment artifacts (candidates, parked colors, canaries, helpers) are
/// excluded.
async fn containers_in_env(
    client: &AuthenticatedClient,
    env: Environment,
) -> Result<Vec<String>> {
    let containers = client.docker().list_containers(true).await?;

    let mut names: Vec<String> = containers
        .iter()
        .filter_map(|c| c.names.as_ref()?.first().cloned())
        .map(|n| n.trim_start_matches('/').to_string())
        .filter(|n| !is_artifact(n))
        .filter(|n| env_of(n) == env)
        .collect();
    names.sort();
    names.dedup();
    Ok(names)
}

fn env_of(name: &str) -> Environment {
    if name.ends_with("-dev") {
        Environment::Dev
    } else if name.ends_with("-staging") {
        Environment::Staging
    } else {
        Environment::Prod
    }
}

fn is_artifact(name: &str) -> bool {
    name.contains("-new-")
        || name.contains("-old-")
        || name.ends_with("-canary")
        || name.ends_with("-blue")
        || name.ends_with("-green")
        || name.ends_with("-migrated")
        || name.starts_with("dp-helper-")
        || name.starts_with("dp-scratch-")
}

async fn environment_reports(client: &AuthenticatedClient) -> Result<Vec<EnvReport>> {
    let containers = client.docker().list_containers(true).await?;

    let mut reports = Vec::new();
    for env in Environment::ALL {
        let mut names = Vec::new();
        let mut running = 0;
        let mut image = None;

        for container in &containers {
            let Some(name) = container
                .names
                .as_ref()
                .and_then(|n| n.first())
                .map(|n| n.trim_start_matches('/').to_string())
            else {
                continue;
            };
            if is_artifact(&name) || env_of(&name) != env {
                continue;
            }

            if container.state.as_deref() == Some("running") {
                running += 1;
            }
            if image.is_none() {
                image = container.image.clone();
            }
            names.push(name);
        }
        names.sort();

        let total = names.len();
        let status = if total == 0 {
            "empty"
        } else if running == total {
            "running"
        } else if running > 0 {
            "degraded"
        } else {
            "stopped"
        };

        reports.push(EnvReport {
            environment: env,
            image,
            container_count_running: running,
            container_count_total: total,
            status: status.to_string(),
            containers: names,
        });
    }

    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hosts::{AuthKind, HostRecord, SecretMaterial};

    fn test_engine(dir: &std::path::Path) -> (Arc<Engine>, Arc<ProgressRegistry>) {
        let mut config = Configuration::default();
        config.config_root = dir.to_path_buf();
        let config = Arc::new(config);

        let progress = Arc::new(ProgressRegistry::new());
        let hosts =
            Arc::new(HostRegistry::open(&config, Arc::clone(&progress)).unwrap());
        let history = Arc::new(HistoryJournal::new(config.history_file()));

        let engine = Arc::new(Engine::new(
            Arc::clone(&config),
            hosts,
            Arc::clone(&progress),
            Arc::new(HealthResolver::new()),
            history,
        ));
        (engine, progress)
    }

    #[tokio::test]
    async fn migration_rejects_same_host_without_a_progress_record() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, progress) = test_engine(dir.path());

        let err = engine
            .migrate(
                "nginx",
                "local",
                "local",
                MigrateOptions {
                    include_data: false,
                    stop_source: false,
                },
            )
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::SameHost);
        assert!(progress.get("nginx").is_none());
    }

    #[tokio::test]
    async fn migration_rejects_records_for_one_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, progress) = test_engine(dir.path());

        let record = |id: &str| HostRecord {
            id: id.to_string(),
            name: id.to_string(),
            hostname: "edge.example.com".to_string(),
            port: 22,
            username: "deploy".to_string(),
            auth_kind: AuthKind::Password,
            description: String::new(),
            created_at: Utc::now(),
        };
        let secret = SecretMaterial::Password {
            password: "pw".into(),
        };
        engine.hosts.create(record("a"), &secret).unwrap();
        engine.hosts.create(record("b"), &secret).unwrap();

        let err = engine
            .migrate(
                "nginx",
                "a",
                "b",
                MigrateOptions {
                    include_data: false,
                    stop_source: false,
                },
            )
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::SameHost);
        assert!(progress.get("nginx").is_none());
    }

    #[tokio::test]
    async fn second_promotion_for_a_key_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, progress) = test_engine(dir.path());

        // Hold the key as if an operation were running.
        let lease = progress.acquire("myapp").unwrap();

        let err = engine
            .promote_one(
                Environment::Dev,
                Environment::Staging,
                "myapp",
                PromoteOptions::default(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyRunning);

        lease.finish(Stage::Completed, 100, "done");
    }

    #[test]
    fn default_strategies_per_env() {
        assert_eq!(Strategy::default_for(Environment::Dev), Strategy::Quick);
        assert_eq!(Strategy::default_for(Environment::Staging), Strategy::Rolling);
        assert_eq!(Strategy::default_for(Environment::Prod), Strategy::BlueGreen);
    }

    #[test]
    fn env_classification_by_suffix() {
        assert_eq!(env_of("myapp-dev"), Environment::Dev);
        assert_eq!(env_of("myapp-staging"), Environment::Staging);
        assert_eq!(env_of("myapp"), Environment::Prod);
    }

    #[test]
    fn artifacts_are_excluded() {
        assert!(is_artifact("myapp-new-1a2b3c4d"));
        assert!(is_artifact("myapp-old-20260801120000"));
        assert!(is_artifact("myapp-canary"));
        assert!(is_artifact("myapp-blue"));
        assert!(is_artifact("dp-helper-abc12345"));
        assert!(!is_artifact("myapp"));
        assert!(!is_artifact("myapp-staging"));
    }
}
