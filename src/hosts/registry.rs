use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::Configuration;
use crate::docker::DockerClient;
use crate::error::{ErrorKind, PilotError, Result};
use crate::progress::ProgressRegistry;

use super::record::{HostRecord, SecretMaterial, LOCAL_HOST_ID};
use super::secrets::SecretStore;
use super::ssh::SshTunnel;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredHost {
    #[serde(flatten)]
    record: HostRecord,
    /// Sealed `SecretMaterial`, base64 ciphertext
    secret: String,
}

/// Registry of Docker endpoints, persisted encrypted under the config root.
///
/// Read-mostly; a single reader-writer lock serializes mutation. The
/// implicit `"local"` host is never stored.
pub struct HostRegistry {
    path: PathBuf,
    store: SecretStore,
    hosts: RwLock<HashMap<String, StoredHost>>,
    progress: Arc<ProgressRegistry>,
}

impl HostRegistry {
    pub fn open(config: &Configuration, progress: Arc<ProgressRegistry>) -> Result<Self> {
        let path = config.servers_file();
        let store = SecretStore::open(&config.config_root)?;

        let hosts = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let list: Vec<StoredHost> = serde_json::from_str(&content)?;
            list.into_iter().map(|h| (h.record.id.clone(), h)).collect()
        } else {
            HashMap::new()
        };

        Ok(Self {
            path,
            store,
            hosts: RwLock::new(hosts),
            progress,
        })
    }

    /// Stored records, secrets omitted. The implicit local host is not
    /// included.
    pub fn list(&self) -> Vec<HostRecord> {
        let mut records: Vec<_> = self
            .hosts
            .read()
            .values()
            .map(|h| h.record.clone())
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub fn get(&self, id: &str) -> Result<HostRecord> {
        if id == LOCAL_HOST_ID {
            return Ok(local_record());
        }
        self.hosts
            .read()
            .get(id)
            .map(|h| h.record.clone())
            .ok_or_else(|| PilotError::new(ErrorKind::HostNotFound, format!("host {}", id)))
    }

    pub fn create(&self, mut record: HostRecord, material: &SecretMaterial) -> Result<HostRecord> {
        if record.id == LOCAL_HOST_ID {
            return Err(PilotError::new(
                ErrorKind::Conflict,
                "the id \"local\" is reserved",
            ));
        }
        if !material.matches(record.auth_kind) {
            return Err(PilotError::new(
                ErrorKind::AuthRejected,
                "secret material does not match auth kind",
            ));
        }

        record.created_at = Utc::now();
        let secret = self.seal_material(material)?;

        {
            let mut hosts = self.hosts.write();
            if hosts.contains_key(&record.id) {
                return Err(PilotError::conflict(format!("host {}", record.id)));
            }
            hosts.insert(
                record.id.clone(),
                StoredHost {
                    record: record.clone(),
                    secret,
                },
            );
        }

        self.persist()?;
        info!(host = %record.id, "host created");
        Ok(record)
    }

    pub fn update(
        &self,
        id: &str,
        mut record: HostRecord,
        material: Option<&SecretMaterial>,
    ) -> Result<HostRecord> {
        if id == LOCAL_HOST_ID {
            return Err(PilotError::new(
                ErrorKind::Conflict,
                "the local host cannot be updated",
            ));
        }

        let sealed = match material {
            Some(m) => {
                if !m.matches(record.auth_kind) {
                    return Err(PilotError::new(
                        ErrorKind::AuthRejected,
                        "secret material does not match auth kind",
                    ));
                }
                Some(self.seal_material(m)?)
            }
            None => None,
        };

        {
            let mut hosts = self.hosts.write();
            let existing = hosts
                .get_mut(id)
                .ok_or_else(|| PilotError::new(ErrorKind::HostNotFound, format!("host {}", id)))?;

            record.id = id.to_string();
            record.created_at = existing.record.created_at;
            existing.record = record.clone();
            if let Some(secret) = sealed {
                existing.secret = secret;
            }
        }

        self.persist()?;
        info!(host = %id, "host updated");
        Ok(record)
    }

    /// Delete a host. Refused while an in-flight operation references it.
    pub fn delete(&self, id: &str) -> Result<()> {
        if id == LOCAL_HOST_ID {
            return Err(PilotError::new(
                ErrorKind::Conflict,
                "the local host cannot be deleted",
            ));
        }
        if self.progress.host_in_use(id) {
            return Err(PilotError::new(
                ErrorKind::Conflict,
                format!("host {} is referenced by a running operation", id),
            ));
        }

        let removed = self.hosts.write().remove(id);
        if removed.is_none() {
            return Err(PilotError::new(
                ErrorKind::HostNotFound,
                format!("host {}", id),
            ));
        }

        self.persist()?;
        info!(host = %id, "host deleted");
        Ok(())
    }

    /// Open a connection for a candidate record and return after one
    /// successful ping. Typed failures per the auth taxonomy.
    pub async fn test(&self, record: &HostRecord, material: &SecretMaterial) -> Result<()> {
        let client = connect_remote(record, material).await?;
        let result = client.docker().ping().await.map_err(|e| {
            PilotError::new(ErrorKind::DaemonError, format!("daemon ping failed: {}", e))
        });
        client.close().await;
        result
    }

    /// Resolve a host id to an authenticated client. Not pooled; the caller
    /// owns the client for the duration of one operation and closes it.
    pub async fn resolve(&self, id: &str) -> Result<AuthenticatedClient> {
        if id == LOCAL_HOST_ID {
            let docker = DockerClient::local().map_err(|e| {
                PilotError::new(ErrorKind::DaemonUnavailable, format!("local daemon: {}", e))
            })?;
            return Ok(AuthenticatedClient {
                host_id: LOCAL_HOST_ID.to_string(),
                docker,
                tunnel: None,
            });
        }

        let (record, sealed) = {
            let hosts = self.hosts.read();
            let stored = hosts
                .get(id)
                .ok_or_else(|| PilotError::new(ErrorKind::HostNotFound, format!("host {}", id)))?;
            (stored.record.clone(), stored.secret.clone())
        };

        let material: SecretMaterial = serde_json::from_slice(&self.store.unseal(&sealed)?)
            .map_err(|_| {
                PilotError::new(ErrorKind::AuthRejected, "stored secret is unreadable")
            })?;

        connect_remote(&record, &material).await
    }

    fn seal_material(&self, material: &SecretMaterial) -> Result<String> {
        let plaintext = serde_json::to_vec(material)?;
        self.store.seal(&plaintext)
    }

    fn persist(&self) -> Result<()> {
        let list: Vec<StoredHost> = {
            let hosts = self.hosts.read();
            let mut list: Vec<_> = hosts.values().cloned().collect();
            list.sort_by(|a, b| a.record.id.cmp(&b.record.id));
            list
        };

        let content = serde_json::to_string_pretty(&list)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, content)?;
        Ok(())
    }
}

fn local_record() -> HostRecord {
    HostRecord {
        id: LOCAL_HOST_ID.to_string(),
        name: "Local daemon".to_string(),
        hostname: String::new(),
        port: 0,
        username: String::new(),
        auth_kind: super::record::AuthKind::Password,
        description: "Platform-native Docker daemon".to_string(),
        created_at: Utc::now(),
    }
}

async fn connect_remote(
    record: &HostRecord,
    material: &SecretMaterial,
) -> Result<AuthenticatedClient> {
    let tunnel = SshTunnel::connect(record, material).await?;
    let docker = DockerClient::with_http(&tunnel.docker_endpoint(), &record.hostname)
        .map_err(|e| PilotError::new(ErrorKind::Unreachable, e.to_string()))?;

    Ok(AuthenticatedClient {
        host_id: record.id.clone(),
        docker,
        tunnel: Some(tunnel),
    })
}

/// Ephemeral handle bound to one host for the duration of one operation.
pub struct AuthenticatedClient {
    host_id: String,
    docker: DockerClient,
    tunnel: Option<SshTunnel>,
}

impl AuthenticatedClient {
    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    pub fn docker(&self) -> &DockerClient {
        &self.docker
    }

    /// Tear down the Docker connection and, for remote hosts, the SSH
    /// session. Dropping without closing aborts the tunnel less gracefully.
    pub async fn close(self) {
        if let Some(tunnel) = self.tunnel {
            tunnel.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hosts::record::AuthKind;

    fn test_config(dir: &std::path::Path) -> Configuration {
        let mut config = Configuration::default();
        config.config_root = dir.to_path_buf();
        config
    }

    fn sample_record(id: &str) -> HostRecord {
        HostRecord {
            id: id.to_string(),
            name: "Edge".to_string(),
            hostname: "edge.example.com".to_string(),
            port: 22,
            username: "deploy".to_string(),
            auth_kind: AuthKind::Password,
            description: String::new(),
            created_at: Utc::now(),
        }
    }

    fn password() -> SecretMaterial {
        SecretMaterial::Password {
            password: "hunter2".into(),
        }
    }

    #[tokio::test]
    async fn create_get_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let progress = Arc::new(ProgressRegistry::new());
        let registry = HostRegistry::open(&test_config(dir.path()), progress).unwrap();

        registry.create(sample_record("edge-1"), &password()).unwrap();
        assert_eq!(registry.get("edge-1").unwrap().hostname, "edge.example.com");
        assert_eq!(registry.list().len(), 1);

        registry.delete("edge-1").unwrap();
        assert_eq!(
            registry.get("edge-1").unwrap_err().kind(),
            ErrorKind::HostNotFound
        );
    }

    #[tokio::test]
    async fn duplicate_id_is_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let progress = Arc::new(ProgressRegistry::new());
        let registry = HostRegistry::open(&test_config(dir.path()), progress).unwrap();

        registry.create(sample_record("edge-1"), &password()).unwrap();
        let err = registry
            .create(sample_record("edge-1"), &password())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn local_id_is_reserved() {
        let dir = tempfile::tempdir().unwrap();
        let progress = Arc::new(ProgressRegistry::new());
        let registry = HostRegistry::open(&test_config(dir.path()), progress).unwrap();

        let err = registry
            .create(sample_record(LOCAL_HOST_ID), &password())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        // But it always resolves as a record.
        assert_eq!(registry.get(LOCAL_HOST_ID).unwrap().id, "local");
    }

    #[tokio::test]
    async fn secrets_are_ciphertext_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let progress = Arc::new(ProgressRegistry::new());
        let config = test_config(dir.path());
        let registry = HostRegistry::open(&config, progress).unwrap();

        registry.create(sample_record("edge-1"), &password()).unwrap();

        let raw = std::fs::read_to_string(config.servers_file()).unwrap();
        assert!(!raw.contains("hunter2"));
    }

    #[tokio::test]
    async fn registry_reloads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        {
            let progress = Arc::new(ProgressRegistry::new());
            let registry = HostRegistry::open(&config, progress).unwrap();
            registry.create(sample_record("edge-1"), &password()).unwrap();
        }

        let progress = Arc::new(ProgressRegistry::new());
        let reopened = HostRegistry::open(&config, progress).unwrap();
        assert_eq!(reopened.list().len(), 1);
        assert_eq!(reopened.get("edge-1").unwrap().username, "deploy");
    }

    #[tokio::test]
    async fn delete_refused_while_host_in_use() {
        let dir = tempfile::tempdir().unwrap();
        let progress = Arc::new(ProgressRegistry::new());
        let registry =
            HostRegistry::open(&test_config(dir.path()), Arc::clone(&progress)).unwrap();

        registry.create(sample_record("edge-1"), &password()).unwrap();

        let lease = progress.acquire("myapp").unwrap();
        lease.set_hosts(vec!["edge-1".into()]);

        let err = registry.delete("edge-1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        lease.finish(crate::progress::Stage::Completed, 100, "done");
        registry.delete("edge-1").unwrap();
    }
}
