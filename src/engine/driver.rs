//! Shared strategy machinery
//!
//! Every strategy runs inside a [`StrategyCtx`] and speaks in
//! [`StepResult`]s: a step either succeeds, fails with a typed error, or is
//! interrupted by the operation's cancel latch. Long-running suspension
//! points go through [`bounded`], which races the work against cancellation
//! and the stage's intrinsic timeout.

use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

use crate::descriptor::{ContainerDescriptor, PortMode};
use crate::docker::DockerClient;
use crate::error::{PilotError, Result};
use crate::health::{probe_http, wait_ready_state};
use crate::hosts::AuthenticatedClient;
use crate::progress::ProgressLease;

use super::{Engine, PromoteOptions};

/// Why a strategy stopped short of completion.
#[derive(Debug)]
pub(crate) enum Abort {
    /// Operator requested cancellation; rollback already performed
    Cancelled,
    Fail(PilotError),
}

impl From<PilotError> for Abort {
    fn from(e: PilotError) -> Self {
        Abort::Fail(e)
    }
}

pub(crate) type StepResult<T> = std::result::Result<T, Abort>;

/// Everything a strategy needs for one promotion.
pub(crate) struct StrategyCtx<'a> {
    pub engine: &'a Engine,
    pub lease: &'a ProgressLease,
    pub source: &'a AuthenticatedClient,
    pub target: &'a AuthenticatedClient,
    /// Descriptor of the running source container, untransformed
    pub source_descriptor: &'a ContainerDescriptor,
    /// Descriptor transformed for the target environment
    pub descriptor: &'a ContainerDescriptor,
    pub opts: &'a PromoteOptions,
}

/// What a finished strategy reports into history.
pub(crate) struct Outcome {
    pub strategy: &'static str,
    pub message: String,
}

/// Stage-boundary cancellation check.
pub(crate) fn checkpoint(ctx: &StrategyCtx<'_>) -> StepResult<()> {
    if ctx.lease.cancel_requested() {
        Err(Abort::Cancelled)
    } else {
        Ok(())
    }
}

/// Run a long step, interruptible by cancellation and bounded by the stage
/// timeout. Timeout maps to `failed`, never `cancelled`.
pub(crate) async fn bounded<T, F>(
    lease: &ProgressLease,
    limit: Duration,
    what: &str,
    fut: F,
) -> StepResult<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        result = tokio::time::timeout(limit, fut) => match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(Abort::Fail(e)),
            Err(_) => Err(Abort::Fail(PilotError::timeout(what))),
        },
        _ = lease.cancelled() => Err(Abort::Cancelled),
    }
}

/// Sleep that returns early on cancellation.
pub(crate) async fn settle(lease: &ProgressLease, duration: Duration) -> StepResult<()> {
    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = lease.cancelled() => Err(Abort::Cancelled),
    }
}

/// Make the target image available: build it from the Dockerfile context
/// when one is given, stream it from the source host when the hosts differ,
/// otherwise pull-if-absent.
pub(crate) async fn ensure_new_image(ctx: &StrategyCtx<'_>) -> StepResult<()> {
    let tag = &ctx.descriptor.image_tag;
    let docker = ctx.target.docker();

    if let Some(context_dir) = &ctx.opts.dockerfile {
        let limit = Duration::from_secs(ctx.engine.config.docker.build_timeout_secs);
        return bounded(
            ctx.lease,
            limit,
            "image build",
            docker.build_image(context_dir, tag),
        )
        .await;
    }

    if docker.image_id(tag).await.map_err(Abort::Fail)?.is_some() {
        return Ok(());
    }

    if ctx.source.host_id() != ctx.target.host_id() {
        // The image lives on the source host; stream it across.
        info!(
            image = tag.as_str(),
            from = ctx.source.host_id(),
            to = ctx.target.host_id(),
            "transferring image between hosts"
        );
        let source_tag = &ctx.source_descriptor.image_tag;
        let stream = ctx.source.docker().export_image(source_tag);
        let load = docker.import_image(stream);
        bounded(
            ctx.lease,
            Duration::from_secs(ctx.engine.config.docker.pull_timeout_secs),
            "image transfer",
            load,
        )
        .await?;
        // Retag under the target name when the transform renamed it.
        if source_tag != tag {
            let (repo, version) = split_reference(tag);
            docker
                .tag_image(source_tag, &repo, &version)
                .await
                .map_err(Abort::Fail)?;
        }
        return Ok(());
    }

    let limit = Duration::from_secs(ctx.engine.config.docker.pull_timeout_secs);
    bounded(ctx.lease, limit, "image pull", docker.pull_image(tag)).await
}

fn split_reference(image: &str) -> (String, String) {
    match image.rfind(':') {
        Some(idx) if !image[idx..].contains('/') => {
            (image[..idx].to_string(), image[idx + 1..].to_string())
        }
        _ => (image.to_string(), "latest".to_string()),
    }
}

/// Create and start a container from the descriptor under `name`, with the
/// chosen port mode and any extra labels.
pub(crate) async fn create_started(
    client: &DockerClient,
    descriptor: &ContainerDescriptor,
    name: &str,
    ports: PortMode,
    extra_labels: &[(&str, &str)],
) -> Result<()> {
    let mut desc = descriptor.clone();
    for (key, value) in extra_labels {
        desc.labels.insert((*key).to_string(), (*value).to_string());
    }

    client
        .create_container(name, desc.container_config(ports))
        .await?;
    client.start_container(name).await?;
    Ok(())
}

/// Stop a container within 30 s plus the configured stop timeout.
pub(crate) async fn stop_bounded(
    lease: &ProgressLease,
    client: &DockerClient,
    name: &str,
    timeout_arg: i64,
) -> StepResult<()> {
    let limit = Duration::from_secs(30 + timeout_arg.max(0) as u64);
    bounded(
        lease,
        limit,
        "container stop",
        client.stop_container(name, timeout_arg),
    )
    .await
}

/// Validate a freshly started container against the descriptor's probe
/// contract. For HTTP probes the published host port of the descriptor's
/// first container port is used; a container without published ports falls
/// back to the state check.
pub(crate) async fn validate_container(
    ctx: &StrategyCtx<'_>,
    client: &AuthenticatedClient,
    name: &str,
) -> StepResult<()> {
    let desc = ctx.descriptor;

    let endpoint = match &desc.healthcheck_endpoint {
        Some(endpoint) => endpoint.clone(),
        None => {
            return bounded(
                ctx.lease,
                Duration::from_secs(30),
                "readiness check",
                wait_ready_state(client.docker(), name),
            )
            .await;
        }
    };

    let Some(host_port) = published_port(client.docker(), name, desc).await? else {
        warn!(
            container = name,
            "no published port to probe; falling back to state check"
        );
        return bounded(
            ctx.lease,
            Duration::from_secs(30),
            "readiness check",
            wait_ready_state(client.docker(), name),
        )
        .await;
    };

    let base = format!("http://{}:{}", client.docker().probe_host(), host_port);
    let per_attempt = Duration::from_secs(desc.healthcheck_timeout);
    let overall =
        Duration::from_secs((desc.healthcheck_timeout + 2) * desc.healthcheck_retries.max(1) as u64 + 5);

    bounded(
        ctx.lease,
        overall,
        "health probe",
        probe_http(&base, &endpoint, desc.healthcheck_retries, per_attempt),
    )
    .await
}

/// Published host port for the descriptor's first container port, read from
/// the live container (covers daemon-assigned ephemeral ports).
async fn published_port(
    client: &DockerClient,
    name: &str,
    descriptor: &ContainerDescriptor,
) -> StepResult<Option<u16>> {
    let Some((&container_port, _)) = descriptor.port_bindings.iter().next() else {
        return Ok(None);
    };

    let inspect = client.inspect_container(name).await.map_err(Abort::Fail)?;
    let ports = inspect.network_settings.and_then(|ns| ns.ports);

    let key = format!("{}/tcp", container_port);
    let host_port = ports
        .as_ref()
        .and_then(|p| p.get(&key))
        .and_then(|bindings| bindings.as_ref())
        .and_then(|bindings| bindings.first())
        .and_then(|binding| binding.host_port.as_deref())
        .and_then(|p| p.parse().ok());

    Ok(host_port)
}

pub(crate) fn short_uuid() -> String {
    uuid::Uuid::new_v4().to_string()[..8].to_string()
}

pub(crate) fn timestamp_suffix() -> String {
    chrono::Utc::now().format("%Y%m%d%H%M%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_reference_handles_registries() {
        assert_eq!(
            split_reference("app:1.2"),
            ("app".to_string(), "1.2".to_string())
        );
        assert_eq!(
            split_reference("registry:5000/app"),
            ("registry:5000/app".to_string(), "latest".to_string())
        );
        assert_eq!(
            split_reference("grafana/grafana:10.4.0"),
            ("grafana/grafana".to_string(), "10.4.0".to_string())
        );
    }
}
