//! Canary deploy
//!
//! A canary runs next to the live container with its traffic weight encoded
//! in a label; an external ingress is expected to honor the weight. The
//! engine itself only observes: restarts or probe failures during the
//! observation window kill the canary, a clean window promotes it.

use std::time::Duration;

use tracing::{info, warn};

use crate::descriptor::PortMode;
use crate::error::{ErrorKind, PilotError};
use crate::health::probe_http;
use crate::progress::Stage;

use super::driver::{
    checkpoint, create_started, ensure_new_image, settle, stop_bounded, validate_container,
    Abort, Outcome, StepResult, StrategyCtx,
};

const WEIGHT_LABEL: &str = "dockerpilot.weight";
const CANARY_LABEL: &str = "dockerpilot.canary";
const CANARY_WEIGHT: &str = "5";

const OBSERVE_WINDOW: Duration = Duration::from_secs(30);
const SAMPLE_INTERVAL: Duration = Duration::from_secs(5);
const OLD_STOP_TIMEOUT: i64 = 10;

pub(crate) async fn run(ctx: &StrategyCtx<'_>) -> StepResult<Outcome> {
    let docker = ctx.target.docker();
    let name = &ctx.descriptor.container_name;
    let canary = format!("{}-canary", name);

    ctx.lease
        .update(Stage::Building, 15, format!("building {}", ctx.descriptor.image_tag));
    ensure_new_image(ctx).await?;

    checkpoint(ctx)?;
    ctx.lease
        .update(Stage::Creating, 30, format!("starting canary {}", canary));
    docker.remove_container_quiet(&canary).await;
    if let Err(e) = create_started(
        docker,
        ctx.descriptor,
        &canary,
        PortMode::Ephemeral,
        &[(WEIGHT_LABEL, CANARY_WEIGHT), (CANARY_LABEL, "true")],
    )
    .await
    {
        docker.remove_container_quiet(&canary).await;
        return Err(Abort::Fail(e));
    }

    ctx.lease
        .update(Stage::Validating, 40, format!("observing {} for {}s", canary, OBSERVE_WINDOW.as_secs()));
    if let Err(abort) = observe(ctx, &canary).await {
        warn!("canary {} failed observation, rolling back", canary);
        let _ = docker.stop_container(&canary, 5).await;
        docker.remove_container_quiet(&canary).await;
        return Err(abort);
    }

    checkpoint(ctx)?;
    ctx.lease
        .update(Stage::Switching, 80, format!("promoting canary to {}", name));

    let old_exists = docker.container_exists(name).await.map_err(Abort::Fail)?;
    if old_exists {
        stop_bounded(ctx.lease, docker, name, OLD_STOP_TIMEOUT).await?;
        docker.remove_container(name, false).await.map_err(Abort::Fail)?;
    }

    // The canary probed on ephemeral ports; promote by recreating under the
    // real name with the original port map and without the canary markers.
    let _ = docker.stop_container(&canary, 5).await;
    docker.remove_container_quiet(&canary).await;

    create_started(docker, ctx.descriptor, name, PortMode::Original, &[])
        .await
        .map_err(Abort::Fail)?;
    info!("canary promoted to {}", name);

    ctx.lease.update(Stage::CleaningUp, 95, "canary promoted");

    Ok(Outcome {
        strategy: "canary",
        message: format!("{} promoted from canary ({})", name, ctx.descriptor.image_tag),
    })
}

/// Watch the canary for the observation window: any restart or any failed
/// probe sample exceeds the 5 % failure budget and triggers rollback.
async fn observe(ctx: &StrategyCtx<'_>, canary: &str) -> StepResult<()> {
    let docker = ctx.target.docker();

    // Baseline after start.
    validate_container(ctx, ctx.target, canary).await?;

    let baseline = docker
        .inspect_container(canary)
        .await
        .map_err(Abort::Fail)?
        .restart_count
        .unwrap_or(0);

    let samples = (OBSERVE_WINDOW.as_secs() / SAMPLE_INTERVAL.as_secs()).max(1);
    for sample in 0..samples {
        settle(ctx.lease, SAMPLE_INTERVAL).await?;

        let inspect = docker.inspect_container(canary).await.map_err(Abort::Fail)?;
        let restarts = inspect.restart_count.unwrap_or(0);
        let running = inspect
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);

        if restarts > baseline || !running {
            return Err(Abort::Fail(PilotError::new(
                ErrorKind::ProbeFailed,
                format!(
                    "canary {} restarted during observation (sample {}/{})",
                    canary,
                    sample + 1,
                    samples
                ),
            )));
        }

        if let Some(endpoint) = &ctx.descriptor.healthcheck_endpoint {
            if let Some(port) = published_probe_port(docker, canary, ctx).await? {
                let base = format!("http://{}:{}", docker.probe_host(), port);
                if probe_http(&base, endpoint, 1, Duration::from_secs(ctx.descriptor.healthcheck_timeout))
                    .await
                    .is_err()
                {
                    return Err(Abort::Fail(PilotError::new(
                        ErrorKind::ProbeFailed,
                        format!("canary {} failed a probe sample", canary),
                    )));
                }
            }
        }

        let progress = 40 + ((sample + 1) * 30 / samples) as u8;
        ctx.lease.update(
            Stage::Validating,
            progress,
            format!("canary healthy ({}/{})", sample + 1, samples),
        );
    }

    Ok(())
}

async fn published_probe_port(
    docker: &crate::docker::DockerClient,
    name: &str,
    ctx: &StrategyCtx<'_>,
) -> StepResult<Option<u16>> {
    let Some((&container_port, _)) = ctx.descriptor.port_bindings.iter().next() else {
        return Ok(None);
    };
    let inspect = docker.inspect_container(name).await.map_err(Abort::Fail)?;
    Ok(inspect
        .network_settings
        .and_then(|ns| ns.ports)
        .and_then(|p| p.get(&format!("{}/tcp", container_port)).cloned())
        .flatten()
        .and_then(|bindings| bindings.first().cloned())
        .and_then(|b| b.host_port)
        .and_then(|p| p.parse().ok()))
}
