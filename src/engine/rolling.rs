//! Rolling deploy
//!
//! Zero-downtime single-replica swap. A candidate starts next to the live
//! container on ephemeral ports, must pass the health contract, and only
//! then takes over the name and the original port map. The displaced
//! container soaks for 30 s before removal so a bad swap can be reversed.

use std::time::Duration;

use tracing::{info, warn};

use crate::descriptor::PortMode;
use crate::progress::Stage;

use super::driver::{
    checkpoint, create_started, ensure_new_image, settle, short_uuid, stop_bounded,
    timestamp_suffix, validate_container, Abort, Outcome, StepResult, StrategyCtx,
};

const STABILIZE: Duration = Duration::from_secs(5);
const SOAK: Duration = Duration::from_secs(30);
const OLD_STOP_TIMEOUT: i64 = 10;

pub(crate) async fn run(ctx: &StrategyCtx<'_>) -> StepResult<Outcome> {
    let docker = ctx.target.docker();
    let name = &ctx.descriptor.container_name;
    let candidate = format!("{}-new-{}", name, short_uuid());

    ctx.lease
        .update(Stage::Building, 15, format!("building {}", ctx.descriptor.image_tag));
    ensure_new_image(ctx).await?;

    checkpoint(ctx)?;
    ctx.lease
        .update(Stage::Creating, 35, format!("starting candidate {}", candidate));
    if let Err(e) = create_started(docker, ctx.descriptor, &candidate, PortMode::Ephemeral, &[]).await
    {
        docker.remove_container_quiet(&candidate).await;
        return Err(Abort::Fail(e));
    }

    // From here on, every exit that is not the happy path must take the
    // candidate down: no `<name>-new-*` survives a failed deploy.
    if let Err(abort) = settle(ctx.lease, STABILIZE).await {
        docker.remove_container_quiet(&candidate).await;
        return Err(abort);
    }

    ctx.lease
        .update(Stage::Validating, 50, format!("probing {}", candidate));
    match validate_container(ctx, ctx.target, &candidate).await {
        Ok(()) => {}
        Err(abort) => {
            warn!("candidate {} failed validation, old container untouched", candidate);
            let _ = docker.stop_container(&candidate, 5).await;
            docker.remove_container_quiet(&candidate).await;
            return Err(abort);
        }
    }

    checkpoint_with_candidate(ctx, docker, &candidate).await?;

    ctx.lease
        .update(Stage::Switching, 70, format!("swapping {} into place", name));
    let old_exists = docker.container_exists(name).await.map_err(Abort::Fail)?;
    let parked = format!("{}-old-{}", name, timestamp_suffix());

    if old_exists {
        stop_bounded(ctx.lease, docker, name, OLD_STOP_TIMEOUT).await?;
        docker
            .rename_container(name, &parked)
            .await
            .map_err(Abort::Fail)?;
    }

    // The candidate probed on ephemeral ports; recreate it under the real
    // name with the original port map.
    let _ = docker.stop_container(&candidate, 5).await;
    docker.remove_container_quiet(&candidate).await;

    if let Err(e) = create_started(docker, ctx.descriptor, name, PortMode::Original, &[]).await {
        if old_exists {
            warn!("swap failed, restoring {}", name);
            if docker.rename_container(&parked, name).await.is_ok() {
                let _ = docker.start_container(name).await;
            }
        }
        return Err(Abort::Fail(e));
    }
    info!("{} swapped to {}", name, ctx.descriptor.image_tag);

    // Soak before discarding the previous version. Cancellation past the
    // switch completes the deploy rather than reversing it.
    ctx.lease.update(Stage::Switching, 85, "soaking after swap");
    if old_exists {
        let _ = settle(ctx.lease, SOAK).await;
        ctx.lease.update(Stage::CleaningUp, 95, "removing previous container");
        docker.remove_container_quiet(&parked).await;
    } else {
        ctx.lease.update(Stage::CleaningUp, 95, "no previous container");
    }

    Ok(Outcome {
        strategy: "rolling",
        message: format!("{} rolled to {}", name, ctx.descriptor.image_tag),
    })
}

/// Stage-boundary check that also reaps the candidate on cancellation.
async fn checkpoint_with_candidate(
    ctx: &StrategyCtx<'_>,
    docker: &crate::docker::DockerClient,
    candidate: &str,
) -> StepResult<()> {
    match checkpoint(ctx) {
        Ok(()) => Ok(()),
        Err(abort) => {
            let _ = docker.stop_container(candidate, 5).await;
            docker.remove_container_quiet(candidate).await;
            Err(abort)
        }
    }
}
