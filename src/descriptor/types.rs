use std::collections::{BTreeMap, HashMap};

use bollard::models::{
    HostConfig, Mount, MountTypeEnum, PortBinding, RestartPolicy as DockerRestartPolicy,
    RestartPolicyNameEnum,
};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, PilotError, Result};

/// Paths that require elevated credentials to read from the host.
const PRIVILEGED_PREFIXES: &[&str] = &[
    "/var/lib/docker",
    "/root",
    "/etc",
    "/proc",
    "/sys",
    "/lib/modules",
    "/boot",
];

/// Paths that are never backupable; the backup subsystem skips them.
const SYSTEM_PREFIXES: &[&str] = &["/proc", "/sys", "/lib/modules", "/boot"];

const MIB: i64 = 1024 * 1024;
const GIB: i64 = 1024 * MIB;

/// Pipeline environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Staging,
    Prod,
}

/// Resource and naming bundle applied during promotion.
#[derive(Debug, Clone, Copy)]
pub struct EnvProfile {
    pub suffix: &'static str,
    pub cpu: f64,
    pub memory_bytes: i64,
    pub replicas: u32,
}

impl Environment {
    pub const ALL: [Environment; 3] = [Environment::Dev, Environment::Staging, Environment::Prod];

    pub fn profile(&self) -> EnvProfile {
        match self {
            Environment::Dev => EnvProfile {
                suffix: "-dev",
                cpu: 0.5,
                memory_bytes: 512 * MIB,
                replicas: 1,
            },
            Environment::Staging => EnvProfile {
                suffix: "-staging",
                cpu: 1.0,
                memory_bytes: GIB,
                replicas: 2,
            },
            Environment::Prod => EnvProfile {
                suffix: "",
                cpu: 2.0,
                memory_bytes: 2 * GIB,
                replicas: 3,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Dev => "dev",
            Environment::Staging => "staging",
            Environment::Prod => "prod",
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Environment {
    type Err = PilotError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "dev" => Ok(Environment::Dev),
            "staging" => Ok(Environment::Staging),
            "prod" => Ok(Environment::Prod),
            other => Err(PilotError::new(
                ErrorKind::MissingField,
                format!("unknown environment: {}", other),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    No,
    Always,
    OnFailure,
    UnlessStopped,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::No
    }
}

impl RestartPolicy {
    pub fn to_docker(self) -> DockerRestartPolicy {
        let name = match self {
            RestartPolicy::No => RestartPolicyNameEnum::NO,
            RestartPolicy::Always => RestartPolicyNameEnum::ALWAYS,
            RestartPolicy::OnFailure => RestartPolicyNameEnum::ON_FAILURE,
            RestartPolicy::UnlessStopped => RestartPolicyNameEnum::UNLESS_STOPPED,
        };
        DockerRestartPolicy {
            name: Some(name),
            maximum_retry_count: None,
        }
    }

    pub fn from_docker(name: RestartPolicyNameEnum) -> Self {
        match name {
            RestartPolicyNameEnum::ALWAYS => RestartPolicy::Always,
            RestartPolicyNameEnum::ON_FAILURE => RestartPolicy::OnFailure,
            RestartPolicyNameEnum::UNLESS_STOPPED => RestartPolicy::UnlessStopped,
            _ => RestartPolicy::No,
        }
    }
}

/// One mount of a container: a named volume or a host bind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MountSpec {
    Volume {
        volume_name: String,
        mount_path: String,
        read_only: bool,
    },
    Bind {
        host_path: String,
        mount_path: String,
        read_only: bool,
    },
}

impl MountSpec {
    /// Volume name or host path; the stable identifier used for archive
    /// names and data-migration matching.
    pub fn source_id(&self) -> &str {
        match self {
            MountSpec::Volume { volume_name, .. } => volume_name,
            MountSpec::Bind { host_path, .. } => host_path,
        }
    }

    pub fn mount_path(&self) -> &str {
        match self {
            MountSpec::Volume { mount_path, .. } | MountSpec::Bind { mount_path, .. } => mount_path,
        }
    }

    pub fn read_only(&self) -> bool {
        match self {
            MountSpec::Volume { read_only, .. } | MountSpec::Bind { read_only, .. } => *read_only,
        }
    }

    /// Bind mounts under system-owned prefixes need elevated credentials.
    pub fn privileged(&self) -> bool {
        match self {
            MountSpec::Volume { .. } => false,
            MountSpec::Bind { host_path, .. } => {
                PRIVILEGED_PREFIXES.iter().any(|p| is_subpath(host_path, p))
            }
        }
    }

    /// Kernel-backed paths that must never be archived.
    pub fn system_path(&self) -> bool {
        match self {
            MountSpec::Volume { .. } => false,
            MountSpec::Bind { host_path, .. } => {
                SYSTEM_PREFIXES.iter().any(|p| is_subpath(host_path, p))
            }
        }
    }

    pub fn to_docker_mount(&self, force_read_only: bool) -> Mount {
        match self {
            MountSpec::Volume {
                volume_name,
                mount_path,
                read_only,
            } => Mount {
                source: Some(volume_name.clone()),
                target: Some(mount_path.clone()),
                typ: Some(MountTypeEnum::VOLUME),
                read_only: Some(*read_only || force_read_only),
                ..Default::default()
            },
            MountSpec::Bind {
                host_path,
                mount_path,
                read_only,
            } => Mount {
                source: Some(host_path.clone()),
                target: Some(mount_path.clone()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(*read_only || force_read_only),
                ..Default::default()
            },
        }
    }
}

fn is_subpath(path: &str, prefix: &str) -> bool {
    path == prefix || path.starts_with(&format!("{}/", prefix))
}

/// How to publish ports when creating a container from a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortMode {
    /// The descriptor's original container→host map
    Original,
    /// Expose the same container ports on daemon-assigned ephemeral host
    /// ports, for probing a candidate next to the live container
    Ephemeral,
    /// No published ports
    Unbound,
}

/// Normalized deployment descriptor. Produced by introspection in full
/// fidelity; the environment transform only touches name, tag, resources,
/// and replicas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerDescriptor {
    pub container_name: String,
    pub image_tag: String,
    pub command: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
    /// container port → host port
    pub port_bindings: BTreeMap<u16, u16>,
    /// Ordered K=V pairs, original order preserved
    pub environment: Vec<String>,
    /// In the container's reported mount order
    pub volumes: Vec<MountSpec>,
    pub networks: Vec<String>,
    pub restart_policy: RestartPolicy,
    pub cpu_limit: Option<f64>,
    /// Bytes
    pub memory_limit: Option<i64>,
    pub labels: BTreeMap<String, String>,
    /// `None` disables HTTP probing
    pub healthcheck_endpoint: Option<String>,
    pub healthcheck_retries: u32,
    /// Seconds per probe attempt
    pub healthcheck_timeout: u64,
    pub replicas: u32,
}

impl ContainerDescriptor {
    pub fn validate(&self) -> Result<()> {
        if self.container_name.is_empty() {
            return Err(PilotError::new(ErrorKind::MissingField, "container_name"));
        }
        if self.image_tag.is_empty() {
            return Err(PilotError::new(ErrorKind::MissingField, "image_tag"));
        }

        let mut host_ports = std::collections::HashSet::new();
        for (container_port, host_port) in &self.port_bindings {
            if !host_ports.insert(host_port) {
                return Err(PilotError::new(
                    ErrorKind::InvalidDescriptor,
                    format!(
                        "host port {} bound to more than one container port ({})",
                        host_port, container_port
                    ),
                ));
            }
        }

        for mount in &self.volumes {
            if mount.source_id().is_empty() {
                return Err(PilotError::new(
                    ErrorKind::InvalidDescriptor,
                    "mount with empty source",
                ));
            }
            if !mount.mount_path().starts_with('/') {
                return Err(PilotError::new(
                    ErrorKind::UnsupportedMount,
                    format!("mount path {} is not absolute", mount.mount_path()),
                ));
            }
        }

        Ok(())
    }

    /// Build the Docker create config for this descriptor.
    pub fn container_config(&self, ports: PortMode) -> bollard::container::Config<String> {
        let mut exposed: HashMap<String, HashMap<(), ()>> = HashMap::new();
        let mut bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();

        for (container_port, host_port) in &self.port_bindings {
            let key = format!("{}/tcp", container_port);
            exposed.insert(key.clone(), HashMap::new());
            match ports {
                PortMode::Original => {
                    bindings.insert(
                        key,
                        Some(vec![PortBinding {
                            host_ip: None,
                            host_port: Some(host_port.to_string()),
                        }]),
                    );
                }
                PortMode::Ephemeral => {
                    bindings.insert(
                        key,
                        Some(vec![PortBinding {
                            host_ip: None,
                            host_port: None,
                        }]),
                    );
                }
                PortMode::Unbound => {}
            }
        }

        let mounts: Vec<Mount> = self
            .volumes
            .iter()
            .map(|m| m.to_docker_mount(false))
            .collect();

        let host_config = HostConfig {
            port_bindings: if bindings.is_empty() {
                None
            } else {
                Some(bindings)
            },
            mounts: if mounts.is_empty() { None } else { Some(mounts) },
            memory: self.memory_limit,
            nano_cpus: self.cpu_limit.map(|c| (c * 1_000_000_000.0) as i64),
            network_mode: self.networks.first().cloned(),
            restart_policy: Some(self.restart_policy.to_docker()),
            ..Default::default()
        };

        bollard::container::Config {
            image: Some(self.image_tag.clone()),
            cmd: self.command.clone(),
            entrypoint: self.entrypoint.clone(),
            env: if self.environment.is_empty() {
                None
            } else {
                Some(self.environment.clone())
            },
            labels: if self.labels.is_empty() {
                None
            } else {
                Some(self.labels.clone().into_iter().collect())
            },
            exposed_ports: if exposed.is_empty() {
                None
            } else {
                Some(exposed)
            },
            host_config: Some(host_config),
            ..Default::default()
        }
    }
}

#[cfg(test)]
pub(crate) fn sample_descriptor() -> ContainerDescriptor {
    ContainerDescriptor {
        container_name: "grafana".into(),
        image_tag: "grafana/grafana:10.4.0".into(),
        command: None,
        entrypoint: None,
        port_bindings: [(3000u16, 3000u16)].into_iter().collect(),
        environment: vec!["GF_SECURITY_ADMIN_USER=admin".into(), "TZ=UTC".into()],
        volumes: vec![
            MountSpec::Bind {
                host_path: "/srv/grafana/provisioning".into(),
                mount_path: "/etc/grafana/provisioning".into(),
                read_only: true,
            },
            MountSpec::Volume {
                volume_name: "grafana-data".into(),
                mount_path: "/var/lib/grafana".into(),
                read_only: false,
            },
        ],
        networks: vec!["monitoring".into()],
        restart_policy: RestartPolicy::UnlessStopped,
        cpu_limit: Some(0.5),
        memory_limit: Some(512 * MIB),
        labels: [("team".to_string(), "obs".to_string())].into_iter().collect(),
        healthcheck_endpoint: Some("/api/health".into()),
        healthcheck_retries: 5,
        healthcheck_timeout: 5,
        replicas: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn privileged_and_system_classification() {
        let docker_bind = MountSpec::Bind {
            host_path: "/var/lib/docker/volumes/foo/_data".into(),
            mount_path: "/data".into(),
            read_only: false,
        };
        assert!(docker_bind.privileged());
        assert!(!docker_bind.system_path());

        let proc_bind = MountSpec::Bind {
            host_path: "/proc".into(),
            mount_path: "/host/proc".into(),
            read_only: true,
        };
        assert!(proc_bind.privileged());
        assert!(proc_bind.system_path());

        let plain = MountSpec::Bind {
            host_path: "/srv/app".into(),
            mount_path: "/data".into(),
            read_only: false,
        };
        assert!(!plain.privileged());

        // Prefix match is per path component, not per character.
        let lookalike = MountSpec::Bind {
            host_path: "/rootfs-data".into(),
            mount_path: "/data".into(),
            read_only: false,
        };
        assert!(!lookalike.privileged());

        let volume = MountSpec::Volume {
            volume_name: "data".into(),
            mount_path: "/data".into(),
            read_only: false,
        };
        assert!(!volume.privileged());
        assert!(!volume.system_path());
    }

    #[test]
    fn validate_rejects_duplicate_host_ports() {
        let mut desc = sample_descriptor();
        desc.port_bindings.insert(3001, 3000);
        assert_eq!(
            desc.validate().unwrap_err().kind(),
            ErrorKind::InvalidDescriptor
        );
    }

    #[test]
    fn validate_requires_name_and_image() {
        let mut desc = sample_descriptor();
        desc.container_name.clear();
        assert_eq!(desc.validate().unwrap_err().kind(), ErrorKind::MissingField);
    }

    #[test]
    fn config_honors_port_mode() {
        let desc = sample_descriptor();

        let original = desc.container_config(PortMode::Original);
        let bindings = original.host_config.unwrap().port_bindings.unwrap();
        let bound = bindings.get("3000/tcp").unwrap().as_ref().unwrap();
        assert_eq!(bound[0].host_port.as_deref(), Some("3000"));

        let ephemeral = desc.container_config(PortMode::Ephemeral);
        let bindings = ephemeral.host_config.unwrap().port_bindings.unwrap();
        let bound = bindings.get("3000/tcp").unwrap().as_ref().unwrap();
        assert_eq!(bound[0].host_port, None);

        let unbound = desc.container_config(PortMode::Unbound);
        assert!(unbound.host_config.unwrap().port_bindings.is_none());
    }

    #[test]
    fn profiles_match_pipeline_table() {
        assert_eq!(Environment::Dev.profile().suffix, "-dev");
        assert_eq!(Environment::Staging.profile().memory_bytes, GIB);
        assert_eq!(Environment::Prod.profile().suffix, "");
        assert_eq!(Environment::Prod.profile().replicas, 3);
    }
}
