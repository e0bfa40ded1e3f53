//! Quick deploy
//!
//! Development-grade swap: build, stop the old container, start the new one
//! in its place. Downtime during the swap is accepted. Build failures leave
//! no side effects; a failed create attempts to resurrect the old container
//! from its captured image id.

use tracing::{info, warn};

use crate::descriptor::PortMode;
use crate::error::{ErrorKind, PilotError};
use crate::progress::Stage;

use super::driver::{
    checkpoint, create_started, ensure_new_image, stop_bounded, validate_container, Abort,
    Outcome, StepResult, StrategyCtx,
};

pub(crate) async fn run(ctx: &StrategyCtx<'_>) -> StepResult<Outcome> {
    let docker = ctx.target.docker();
    let name = &ctx.descriptor.container_name;
    let tag = &ctx.descriptor.image_tag;

    ctx.lease.update(Stage::Starting, 0, format!("quick deploy of {}", name));

    // Capture the old container's image id for cleanup and resurrection.
    let old_exists = docker.container_exists(name).await.map_err(Abort::Fail)?;
    let old_image_id = if old_exists {
        docker
            .inspect_container(name)
            .await
            .map_err(Abort::Fail)?
            .image
    } else {
        None
    };

    checkpoint(ctx)?;
    ctx.lease.update(Stage::Building, 20, format!("building {}", tag));
    let prior_tag_id = docker.image_id(tag).await.map_err(Abort::Fail)?;
    match ensure_new_image(ctx).await {
        Ok(()) => {}
        Err(Abort::Cancelled) => {
            // Roll back the freshly produced image unless the tag already
            // pointed at it before we started.
            if let Ok(Some(new_id)) = docker.image_id(tag).await {
                if prior_tag_id.as_deref() != Some(new_id.as_str()) {
                    let _ = docker.remove_image(tag).await;
                }
            }
            return Err(Abort::Cancelled);
        }
        Err(fail) => return Err(fail),
    }

    checkpoint(ctx)?;
    ctx.lease.update(Stage::Stopping, 50, format!("stopping {}", name));
    if old_exists {
        stop_bounded(
            ctx.lease,
            docker,
            name,
            ctx.engine.config.docker.stop_timeout_secs,
        )
        .await?;
        docker.remove_container(name, false).await.map_err(Abort::Fail)?;
    }

    ctx.lease.update(Stage::Creating, 70, format!("creating {}", name));
    if let Err(e) = create_started(docker, ctx.descriptor, name, PortMode::Original, &[]).await {
        // Best-effort resurrection of the old container; not guaranteed.
        if let Some(image_id) = &old_image_id {
            warn!("create failed, trying to restore previous {}", name);
            let mut fallback = ctx.source_descriptor.clone();
            fallback.image_tag = image_id.clone();
            fallback.container_name = name.clone();
            match create_started(docker, &fallback, name, PortMode::Original, &[]).await {
                Ok(()) => ctx
                    .lease
                    .update(Stage::Creating, 70, "create failed; previous container restored"),
                Err(restore) => warn!("could not restore previous {}: {}", name, restore),
            }
        }
        return Err(Abort::Fail(e));
    }

    ctx.lease.update(Stage::CleaningUp, 85, "removing stale image");
    if !ctx.opts.no_cleanup {
        if let Some(old_id) = &old_image_id {
            let new_id = docker.image_id(tag).await.map_err(Abort::Fail)?;
            if new_id.as_deref() != Some(old_id.as_str()) {
                match docker.image_in_use(old_id).await {
                    Ok(false) => {
                        if let Err(e) = docker.remove_image(old_id).await {
                            warn!("stale image {} not removed: {}", old_id, e);
                        }
                    }
                    Ok(true) => info!("old image {} still referenced, kept", old_id),
                    Err(e) => warn!("could not check image usage: {}", e),
                }
            }
        }
    }

    ctx.lease.update(Stage::Validating, 95, "probing new container");
    validate_with_cleanup(ctx, name).await?;

    Ok(Outcome {
        strategy: "quick",
        message: format!("{} now running {}", name, tag),
    })
}

/// A failed probe on a quick deploy is fatal but leaves the (unhealthy)
/// container in place for inspection.
async fn validate_with_cleanup(ctx: &StrategyCtx<'_>, name: &str) -> StepResult<()> {
    match validate_container(ctx, ctx.target, name).await {
        Ok(()) => Ok(()),
        Err(Abort::Cancelled) => Err(Abort::Cancelled),
        Err(Abort::Fail(e)) => Err(Abort::Fail(PilotError::new(
            if e.kind() == ErrorKind::ProbeTimeout {
                ErrorKind::ProbeTimeout
            } else {
                ErrorKind::ProbeFailed
            },
            format!("{} started but failed validation: {}", name, e.message),
        ))),
    }
}
