use std::collections::BTreeMap;

use bollard::models::MountPointTypeEnum;
use tracing::debug;

use crate::config::HealthConfiguration;
use crate::docker::DockerClient;
use crate::error::{PilotError, Result};
use crate::health::{HealthResolver, Probe};

use super::types::{ContainerDescriptor, MountSpec, RestartPolicy};

/// Read a container's runtime state and derive its descriptor in full
/// fidelity: original port bindings, env order, labels, restart policy, and
/// mount list all preserved.
pub async fn introspect(
    client: &DockerClient,
    container_name: &str,
    resolver: &HealthResolver,
    health: &HealthConfiguration,
) -> Result<ContainerDescriptor> {
    let inspect = client.inspect_container(container_name).await?;

    let name = inspect
        .name
        .as_deref()
        .map(|n| n.trim_start_matches('/').to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| container_name.to_string());

    let config = inspect.config.unwrap_or_default();
    let host_config = inspect.host_config.unwrap_or_default();

    let image_tag = config
        .image
        .clone()
        .ok_or_else(|| PilotError::internal(format!("{} has no image reference", name)))?;

    let mut port_bindings = BTreeMap::new();
    if let Some(bindings) = &host_config.port_bindings {
        for (key, binding) in bindings {
            let Some(container_port) = parse_port_key(key) else {
                debug!("skipping unparseable port key {}", key);
                continue;
            };
            let host_port = binding
                .as_ref()
                .and_then(|b| b.first())
                .and_then(|b| b.host_port.as_deref())
                .and_then(|p| p.parse::<u16>().ok());
            if let Some(host_port) = host_port {
                port_bindings.insert(container_port, host_port);
            }
        }
    }

    // Mounts and networks keep the order the daemon reports them in; the
    // descriptor must match the live container, not a normalized view.
    let volumes: Vec<MountSpec> = inspect
        .mounts
        .unwrap_or_default()
        .into_iter()
        .filter_map(|mount| {
            let target = mount.destination?;
            let read_only = !mount.rw.unwrap_or(true);
            match mount.typ {
                Some(MountPointTypeEnum::VOLUME) => Some(MountSpec::Volume {
                    volume_name: mount.name?,
                    mount_path: target,
                    read_only,
                }),
                Some(MountPointTypeEnum::BIND) => Some(MountSpec::Bind {
                    host_path: mount.source?,
                    mount_path: target,
                    read_only,
                }),
                _ => None,
            }
        })
        .collect();

    let networks: Vec<String> = inspect
        .network_settings
        .and_then(|ns| ns.networks)
        .map(|nets| nets.into_keys().collect())
        .unwrap_or_default();

    let restart_policy = host_config
        .restart_policy
        .and_then(|p| p.name)
        .map(RestartPolicy::from_docker)
        .unwrap_or_default();

    let cpu_limit = host_config
        .nano_cpus
        .filter(|n| *n > 0)
        .map(|n| n as f64 / 1_000_000_000.0);
    let memory_limit = host_config.memory.filter(|m| *m > 0);

    let healthcheck_endpoint = match resolver.resolve(&image_tag) {
        Probe::Http { endpoint } => Some(endpoint),
        Probe::StateOnly => None,
    };

    Ok(ContainerDescriptor {
        container_name: name,
        image_tag,
        command: config.cmd,
        entrypoint: config.entrypoint,
        port_bindings,
        environment: config.env.unwrap_or_default(),
        volumes,
        networks,
        restart_policy,
        cpu_limit,
        memory_limit,
        labels: config
            .labels
            .map(|l| l.into_iter().collect())
            .unwrap_or_default(),
        healthcheck_endpoint,
        healthcheck_retries: health.retries,
        healthcheck_timeout: health.timeout_secs,
        replicas: 1,
    })
}

fn parse_port_key(key: &str) -> Option<u16> {
    key.split('/').next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_keys_drop_protocol() {
        assert_eq!(parse_port_key("8080/tcp"), Some(8080));
        assert_eq!(parse_port_key("53/udp"), Some(53));
        assert_eq!(parse_port_key("not-a-port"), None);
    }
}
