//! Cross-host migration
//!
//! Moves a container (image + config, optionally volume data) between two
//! Docker endpoints, streaming everything through the orchestrator: image
//! save/load with byte-mapped progress, volume data via scratch containers
//! and tar streams, never touching host disk.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tracing::{info, warn};

use crate::descriptor::{ContainerDescriptor, MountSpec, PortMode};
use crate::error::{ErrorKind, PilotError};
use crate::hosts::AuthenticatedClient;
use crate::progress::{ProgressLease, Stage};

use super::driver::{
    create_started, timestamp_suffix, validate_container, Abort, Outcome, StepResult,
    StrategyCtx,
};
use super::{Engine, MigrateOptions, PromoteOptions};

/// Image transfer is mapped onto this progress band.
const EXPORT_BAND: (u8, u8) = (10, 60);

pub(crate) async fn run(
    engine: &Engine,
    lease: &ProgressLease,
    source: &AuthenticatedClient,
    target: &AuthenticatedClient,
    container: &str,
    opts: &MigrateOptions,
) -> StepResult<Outcome> {
    lease.update(Stage::Starting, 5, format!("inspecting {}", container));
    let descriptor = crate::descriptor::introspect(
        source.docker(),
        container,
        &engine.health,
        &engine.config.health,
    )
    .await
    .map_err(Abort::Fail)?;

    // Everything created on the target so a cancelled run can be unwound.
    let mut created_volumes: Vec<String> = Vec::new();
    let mut created_container: Option<String> = None;

    let result = migrate_inner(
        engine,
        lease,
        source,
        target,
        container,
        &descriptor,
        opts,
        &mut created_volumes,
        &mut created_container,
    )
    .await;

    if matches!(result, Err(Abort::Cancelled)) {
        rollback_target(target, &created_volumes, &created_container).await;
    }

    result
}

#[allow(clippy::too_many_arguments)]
async fn migrate_inner(
    engine: &Engine,
    lease: &ProgressLease,
    source: &AuthenticatedClient,
    target: &AuthenticatedClient,
    container: &str,
    descriptor: &ContainerDescriptor,
    opts: &MigrateOptions,
    created_volumes: &mut Vec<String>,
    created_container: &mut Option<String>,
) -> StepResult<Outcome> {
    let image = &descriptor.image_tag;

    lease.update(Stage::Exporting, EXPORT_BAND.0, format!("transferring {}", image));
    transfer_image(lease, source, target, image).await?;

    if opts.include_data {
        lease.update(Stage::MigratingData, 62, "copying volume data");
        transfer_data(
            engine,
            lease,
            source,
            target,
            descriptor,
            created_volumes,
        )
        .await?;
    }

    if lease.cancel_requested() {
        return Err(Abort::Cancelled);
    }

    // Name and port conflicts on the target get adjusted, not fought.
    let mut final_name = container.to_string();
    if target
        .docker()
        .container_exists(&final_name)
        .await
        .map_err(Abort::Fail)?
    {
        final_name = format!("{}-migrated-{}", container, timestamp_suffix());
    }

    let ports = if ports_conflict(target, descriptor).await? {
        lease.update(
            Stage::Creating,
            80,
            "target ports in use; publishing on ephemeral ports",
        );
        PortMode::Ephemeral
    } else {
        PortMode::Original
    };

    lease.update(Stage::Creating, 80, format!("creating {}", final_name));
    let mut moved = descriptor.clone();
    moved.container_name = final_name.clone();
    create_started(target.docker(), &moved, &final_name, ports, &[])
        .await
        .map_err(Abort::Fail)?;
    *created_container = Some(final_name.clone());

    lease.update(Stage::Validating, 90, format!("probing {}", final_name));
    let probe_opts = PromoteOptions::default();
    let ctx = StrategyCtx {
        engine,
        lease,
        source,
        target,
        source_descriptor: descriptor,
        descriptor: &moved,
        opts: &probe_opts,
    };
    validate_container(&ctx, target, &final_name).await?;

    if opts.stop_source {
        lease.update(Stage::Stopping, 95, format!("stopping source {}", container));
        // Stop only; removal is operator policy.
        source
            .docker()
            .stop_container(container, engine.config.docker.stop_timeout_secs)
            .await
            .map_err(Abort::Fail)?;
    }

    lease.update(Stage::CleaningUp, 98, "migration complete");
    Ok(Outcome {
        strategy: "migration",
        message: format!(
            "{} migrated from {} to {} as {}",
            container,
            source.host_id(),
            target.host_id(),
            final_name
        ),
    })
}

/// Stream `docker save` from the source into `docker load` on the target,
/// mapping transferred bytes onto the 10..60 band.
async fn transfer_image(
    lease: &ProgressLease,
    source: &AuthenticatedClient,
    target: &AuthenticatedClient,
    image: &str,
) -> StepResult<()> {
    let total = source
        .docker()
        .image_size(image)
        .await
        .map_err(Abort::Fail)?
        .filter(|s| *s > 0)
        .map(|s| s as u64);

    let counter = Arc::new(AtomicU64::new(0));
    let tally = Arc::clone(&counter);
    let stream = source.docker().export_image(image).inspect(move |chunk| {
        if let Ok(bytes) = chunk {
            tally.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        }
    });

    let load = target.docker().import_image(stream);
    tokio::pin!(load);

    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            result = &mut load => {
                result.map_err(Abort::Fail)?;
                lease.update(Stage::Exporting, EXPORT_BAND.1, "image transferred");
                return Ok(());
            }
            _ = ticker.tick() => {
                let moved = counter.load(Ordering::Relaxed);
                let pct = match total {
                    Some(total) => {
                        let span = (EXPORT_BAND.1 - EXPORT_BAND.0) as u64;
                        EXPORT_BAND.0 + (moved.saturating_mul(span) / total.max(1)).min(span) as u8
                    }
                    None => EXPORT_BAND.0 + 10,
                };
                lease.update(
                    Stage::Exporting,
                    pct,
                    format!("transferred {} MiB", moved / (1024 * 1024)),
                );
            }
            _ = lease.cancelled() => {
                // Dropping the load future closes both streams.
                return Err(Abort::Cancelled);
            }
        }
    }
}

/// Copy named-volume data through scratch containers and a tar stream. Bind
/// mounts are copied only when the target host has the path available;
/// otherwise recorded as manual work, non-fatally.
async fn transfer_data(
    engine: &Engine,
    lease: &ProgressLease,
    source: &AuthenticatedClient,
    target: &AuthenticatedClient,
    descriptor: &ContainerDescriptor,
    created_volumes: &mut Vec<String>,
) -> StepResult<()> {
    let helper = &engine.config.docker.helper_image;

    for mount in &descriptor.volumes {
        if lease.cancel_requested() {
            return Err(Abort::Cancelled);
        }

        match mount {
            MountSpec::Volume { volume_name, .. } => {
                if !target
                    .docker()
                    .volume_exists(volume_name)
                    .await
                    .map_err(Abort::Fail)?
                {
                    target
                        .docker()
                        .create_volume(volume_name)
                        .await
                        .map_err(Abort::Fail)?;
                    created_volumes.push(volume_name.clone());
                }
                stream_mount(lease, source, target, helper, mount).await?;
                info!(volume = volume_name.as_str(), "volume data migrated");
            }
            MountSpec::Bind { host_path, .. } => {
                if !target_path_available(target, helper, host_path).await? {
                    // Non-fatal: the operator has to provision the path.
                    warn!("{} missing on target host", host_path);
                    lease.update(
                        Stage::MigratingData,
                        70,
                        format!("manual_action_required: {} missing on target host", host_path),
                    );
                    continue;
                }
                stream_mount(lease, source, target, helper, mount).await?;
                info!(path = host_path.as_str(), "bind mount data migrated");
            }
        }
    }

    Ok(())
}

/// Whether the target host already has a bind path. Checked from a helper
/// with the host filesystem mounted read-only.
async fn target_path_available(
    target: &AuthenticatedClient,
    helper: &str,
    host_path: &str,
) -> StepResult<bool> {
    let root = MountSpec::Bind {
        host_path: "/".into(),
        mount_path: "/host".into(),
        read_only: true,
    };
    let output = target
        .docker()
        .run_ephemeral(
            helper,
            vec![
                "sh".into(),
                "-c".into(),
                format!("test -e /host{}", host_path),
            ],
            vec![root.to_docker_mount(true)],
        )
        .await
        .map_err(Abort::Fail)?;
    Ok(output.exit_code == 0)
}

/// Stream one mount's data: scratch container on each side, tar piped
/// through the orchestrator.
async fn stream_mount(
    lease: &ProgressLease,
    source: &AuthenticatedClient,
    target: &AuthenticatedClient,
    helper: &str,
    mount: &MountSpec,
) -> StepResult<()> {
    let data_mount = |read_only: bool| match mount {
        MountSpec::Volume { volume_name, .. } => MountSpec::Volume {
            volume_name: volume_name.clone(),
            mount_path: "/data".into(),
            read_only,
        },
        MountSpec::Bind { host_path, .. } => MountSpec::Bind {
            host_path: host_path.clone(),
            mount_path: "/data".into(),
            read_only,
        },
    };

    let from = source
        .docker()
        .create_scratch(helper, vec![data_mount(true).to_docker_mount(true)])
        .await
        .map_err(Abort::Fail)?;
    let to = target
        .docker()
        .create_scratch(helper, vec![data_mount(false).to_docker_mount(false)])
        .await
        .map_err(Abort::Fail)?;

    let copy = async {
        let tar = source.docker().download_from_container(&from, "/data");
        target.docker().upload_to_container(&to, "/", tar).await
    };

    let result = tokio::select! {
        result = copy => result.map_err(|e| Abort::Fail(PilotError::new(
            ErrorKind::VolumeCopyFailed,
            format!("{}: {}", mount.source_id(), e.message),
        ))),
        _ = lease.cancelled() => Err(Abort::Cancelled),
    };

    source.docker().remove_container_quiet(&from).await;
    target.docker().remove_container_quiet(&to).await;
    result
}

async fn ports_conflict(
    target: &AuthenticatedClient,
    descriptor: &ContainerDescriptor,
) -> StepResult<bool> {
    if descriptor.port_bindings.is_empty() {
        return Ok(false);
    }

    let containers = target
        .docker()
        .list_containers(false)
        .await
        .map_err(Abort::Fail)?;

    let used: std::collections::HashSet<u16> = containers
        .iter()
        .flat_map(|c| c.ports.iter().flatten())
        .filter_map(|p| p.public_port)
        .collect();

    Ok(descriptor
        .port_bindings
        .values()
        .any(|host_port| used.contains(host_port)))
}

/// Unwind a cancelled migration: half-created target resources go away, the
/// source is left untouched.
async fn rollback_target(
    target: &AuthenticatedClient,
    created_volumes: &[String],
    created_container: &Option<String>,
) {
    if let Some(name) = created_container {
        target.docker().remove_container_quiet(name).await;
    }
    for volume in created_volumes {
        if let Err(e) = target.docker().remove_volume(volume).await {
            warn!("could not remove volume {}: {}", volume, e);
        }
    }
}
