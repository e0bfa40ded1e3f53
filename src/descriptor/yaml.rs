//! Descriptor file format
//!
//! YAML with a top-level `deployment:` key. `port_mapping` maps host port to
//! container port as strings; `volumes` maps the volume name or host path to
//! either the container path or `{bind, mode}`, in the descriptor's mount
//! order. Import of an exported descriptor reproduces it exactly.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use crate::error::{ErrorKind, PilotError, Result};

use super::types::{ContainerDescriptor, MountSpec, RestartPolicy};

const MIB: i64 = 1024 * 1024;
const GIB: i64 = 1024 * MIB;

#[derive(Debug, Serialize, Deserialize)]
struct DeploymentFile {
    deployment: DeploymentYaml,
}

#[derive(Debug, Serialize, Deserialize)]
struct DeploymentYaml {
    container_name: String,
    image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    command: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    entrypoint: Option<Vec<String>>,
    /// host port → container port
    #[serde(default)]
    port_mapping: BTreeMap<String, String>,
    #[serde(default)]
    environment: Vec<String>,
    /// Key order mirrors the descriptor's mount order
    #[serde(default)]
    volumes: Mapping,
    #[serde(default)]
    networks: Vec<String>,
    #[serde(default)]
    restart_policy: RestartPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cpu_limit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    memory_limit: Option<String>,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    /// null disables HTTP probing
    health_check_endpoint: Option<String>,
    health_check_retries: u32,
    health_check_timeout: u64,
    replicas: u32,
}

/// Serialize a descriptor to the deployment YAML form.
pub fn export_yaml(descriptor: &ContainerDescriptor) -> Result<String> {
    let port_mapping = descriptor
        .port_bindings
        .iter()
        .map(|(container, host)| (host.to_string(), container.to_string()))
        .collect();

    // A YAML mapping keeps insertion order, so the file lists mounts the
    // way the container reports them.
    let mut volumes = Mapping::new();
    for mount in &descriptor.volumes {
        let value = if mount.read_only() {
            let mut entry = Mapping::new();
            entry.insert(Value::from("bind"), Value::from(mount.mount_path()));
            entry.insert(Value::from("mode"), Value::from("ro"));
            Value::Mapping(entry)
        } else {
            Value::from(mount.mount_path())
        };
        volumes.insert(Value::from(mount.source_id()), value);
    }

    let file = DeploymentFile {
        deployment: DeploymentYaml {
            container_name: descriptor.container_name.clone(),
            image: descriptor.image_tag.clone(),
            command: descriptor.command.clone(),
            entrypoint: descriptor.entrypoint.clone(),
            port_mapping,
            environment: descriptor.environment.clone(),
            volumes,
            networks: descriptor.networks.clone(),
            restart_policy: descriptor.restart_policy,
            cpu_limit: descriptor.cpu_limit.map(format_cpu),
            memory_limit: descriptor.memory_limit.map(format_memory),
            labels: descriptor.labels.clone(),
            health_check_endpoint: descriptor.healthcheck_endpoint.clone(),
            health_check_retries: descriptor.healthcheck_retries,
            health_check_timeout: descriptor.healthcheck_timeout,
            replicas: descriptor.replicas,
        },
    };

    Ok(serde_yaml::to_string(&file)?)
}

/// Parse the deployment YAML form back into a descriptor and validate it.
pub fn import_yaml(content: &str) -> Result<ContainerDescriptor> {
    let file: DeploymentFile = serde_yaml::from_str(content)?;
    let y = file.deployment;

    let mut port_bindings = BTreeMap::new();
    for (host, container) in &y.port_mapping {
        let host: u16 = host.parse().map_err(|_| bad_port(host))?;
        let container: u16 = container.parse().map_err(|_| bad_port(container))?;
        port_bindings.insert(container, host);
    }

    // Mounts come back in document order.
    let mut volumes = Vec::new();
    for (key, entry) in &y.volumes {
        let source = key.as_str().ok_or_else(|| {
            PilotError::new(ErrorKind::InvalidDescriptor, "volume key is not a string")
        })?;

        let (mount_path, read_only) = match entry {
            Value::String(path) => (path.clone(), false),
            Value::Mapping(fields) => {
                let mut bind = None;
                let mut mode = None;
                for (field, value) in fields {
                    match field.as_str() {
                        Some("bind") => bind = value.as_str(),
                        Some("mode") => mode = value.as_str(),
                        _ => {}
                    }
                }
                let bind = bind.ok_or_else(|| {
                    PilotError::new(
                        ErrorKind::InvalidDescriptor,
                        format!("volume {} has no bind target", source),
                    )
                })?;
                (bind.to_string(), mode == Some("ro"))
            }
            _ => {
                return Err(PilotError::new(
                    ErrorKind::InvalidDescriptor,
                    format!("volume {} has an unsupported value", source),
                ));
            }
        };

        let mount = if source.starts_with('/') {
            MountSpec::Bind {
                host_path: source.to_string(),
                mount_path,
                read_only,
            }
        } else {
            MountSpec::Volume {
                volume_name: source.to_string(),
                mount_path,
                read_only,
            }
        };
        volumes.push(mount);
    }

    let descriptor = ContainerDescriptor {
        container_name: y.container_name,
        image_tag: y.image,
        command: y.command,
        entrypoint: y.entrypoint,
        port_bindings,
        environment: y.environment,
        volumes,
        networks: y.networks,
        restart_policy: y.restart_policy,
        cpu_limit: y.cpu_limit.as_deref().map(parse_cpu).transpose()?,
        memory_limit: y.memory_limit.as_deref().map(parse_memory).transpose()?,
        labels: y.labels,
        healthcheck_endpoint: y.health_check_endpoint,
        healthcheck_retries: y.health_check_retries,
        healthcheck_timeout: y.health_check_timeout,
        replicas: y.replicas,
    };

    descriptor.validate()?;
    Ok(descriptor)
}

fn bad_port(value: &str) -> PilotError {
    PilotError::new(
        ErrorKind::InvalidDescriptor,
        format!("invalid port: {}", value),
    )
}

fn format_cpu(cpu: f64) -> String {
    if cpu == cpu.trunc() {
        format!("{:.1}", cpu)
    } else {
        format!("{}", cpu)
    }
}

fn parse_cpu(value: &str) -> Result<f64> {
    value.parse().map_err(|_| {
        PilotError::new(
            ErrorKind::InvalidDescriptor,
            format!("invalid cpu_limit: {}", value),
        )
    })
}

fn format_memory(bytes: i64) -> String {
    if bytes > 0 && bytes % GIB == 0 {
        format!("{}Gi", bytes / GIB)
    } else if bytes > 0 && bytes % MIB == 0 {
        format!("{}Mi", bytes / MIB)
    } else {
        bytes.to_string()
    }
}

fn parse_memory(value: &str) -> Result<i64> {
    let bad = || {
        PilotError::new(
            ErrorKind::InvalidDescriptor,
            format!("invalid memory_limit: {}", value),
        )
    };

    if let Some(n) = value.strip_suffix("Gi") {
        n.parse::<i64>().map(|n| n * GIB).map_err(|_| bad())
    } else if let Some(n) = value.strip_suffix("Mi") {
        n.parse::<i64>().map(|n| n * MIB).map_err(|_| bad())
    } else if let Some(n) = value.strip_suffix("Ki") {
        n.parse::<i64>().map(|n| n * 1024).map_err(|_| bad())
    } else {
        value.parse().map_err(|_| bad())
    }
}

#[cfg(test)]
mod tests {
    use super::super::types::{sample_descriptor, Environment};
    use super::super::transform::transform;
    use super::*;

    #[test]
    fn export_import_is_identity() {
        let desc = sample_descriptor();
        let yaml = export_yaml(&desc).unwrap();
        let back = import_yaml(&yaml).unwrap();
        assert_eq!(back, desc);
    }

    #[test]
    fn export_import_is_identity_after_transform() {
        let desc = transform(&sample_descriptor(), Environment::Staging);
        let yaml = export_yaml(&desc).unwrap();
        let back = import_yaml(&yaml).unwrap();
        assert_eq!(back, desc);

        // And byte-identical when re-exported.
        assert_eq!(export_yaml(&back).unwrap(), yaml);
    }

    #[test]
    fn staging_export_carries_profile_values() {
        let desc = transform(&sample_descriptor(), Environment::Staging);
        let yaml = export_yaml(&desc).unwrap();

        assert!(yaml.contains("container_name: grafana-staging"));
        assert!(yaml.contains("cpu_limit: '1.0'") || yaml.contains("cpu_limit: \"1.0\""));
        assert!(yaml.contains("memory_limit: 1Gi"));
        assert!(yaml.contains("health_check_endpoint: /api/health"));
    }

    #[test]
    fn volumes_round_trip_both_kinds() {
        let desc = sample_descriptor();
        let yaml = export_yaml(&desc).unwrap();

        // Read-only bind becomes the object form, volume the string form.
        assert!(yaml.contains("mode: ro"));
        assert!(yaml.contains("grafana-data: /var/lib/grafana"));

        let back = import_yaml(&yaml).unwrap();
        assert_eq!(back.volumes, desc.volumes);
    }

    #[test]
    fn mount_order_survives_round_trip() {
        // Daemon-reported order is rarely alphabetical; it must come back
        // exactly as exported.
        let mut desc = sample_descriptor();
        desc.volumes = vec![
            MountSpec::Volume {
                volume_name: "zeta-data".into(),
                mount_path: "/var/lib/zeta".into(),
                read_only: false,
            },
            MountSpec::Bind {
                host_path: "/alpha/conf".into(),
                mount_path: "/etc/zeta".into(),
                read_only: true,
            },
            MountSpec::Volume {
                volume_name: "beta-cache".into(),
                mount_path: "/cache".into(),
                read_only: false,
            },
        ];

        let yaml = export_yaml(&desc).unwrap();
        let back = import_yaml(&yaml).unwrap();
        assert_eq!(back.volumes, desc.volumes);

        // And the file itself lists them in that order.
        let zeta = yaml.find("zeta-data").unwrap();
        let alpha = yaml.find("/alpha/conf").unwrap();
        let beta = yaml.find("beta-cache").unwrap();
        assert!(zeta < alpha && alpha < beta);
    }

    #[test]
    fn null_endpoint_survives_round_trip() {
        let mut desc = sample_descriptor();
        desc.healthcheck_endpoint = None;
        let yaml = export_yaml(&desc).unwrap();
        assert!(yaml.contains("health_check_endpoint: null"));
        assert_eq!(import_yaml(&yaml).unwrap().healthcheck_endpoint, None);
    }

    #[test]
    fn memory_units() {
        assert_eq!(format_memory(512 * MIB), "512Mi");
        assert_eq!(format_memory(GIB), "1Gi");
        assert_eq!(parse_memory("2Gi").unwrap(), 2 * GIB);
        assert_eq!(parse_memory("512Mi").unwrap(), 512 * MIB);
        assert_eq!(parse_memory("1048576").unwrap(), MIB);
        assert!(parse_memory("lots").is_err());
    }

    #[test]
    fn import_rejects_bad_ports() {
        let yaml = r#"
deployment:
  container_name: app
  image: app:1
  port_mapping:
    "eighty": "80"
  health_check_endpoint: /health
  health_check_retries: 3
  health_check_timeout: 5
  replicas: 1
"#;
        assert_eq!(
            import_yaml(yaml).unwrap_err().kind(),
            ErrorKind::InvalidDescriptor
        );
    }
}
