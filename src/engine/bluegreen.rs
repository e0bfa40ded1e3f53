//! Blue-green deploy
//!
//! The candidate comes up under the opposite color of the live container,
//! is validated on probe ports, optionally receives data from the old
//! container's volumes, and then takes over atomically. The displaced
//! container is kept under its color name for a 60 s grace window so an
//! operator can swap back.

use std::time::Duration;

use futures_util::StreamExt;
use tracing::{info, warn};

use crate::descriptor::{ContainerDescriptor, MountSpec, PortMode};
use crate::error::{ErrorKind, PilotError};
use crate::progress::Stage;

use super::driver::{
    checkpoint, create_started, ensure_new_image, settle, stop_bounded, validate_container,
    Abort, Outcome, StepResult, StrategyCtx,
};

const COLOR_LABEL: &str = "dockerpilot.color";
const ROLLBACK_GRACE: Duration = Duration::from_secs(60);
const OLD_STOP_TIMEOUT: i64 = 10;

/// Database families whose config subtree is copied alongside volume data.
const DB_CONFIG_SUBTREES: &[(&str, &str)] = &[
    ("db2", "/database/config"),
    ("influxdb", "/etc/influxdb2"),
    ("postgres", "/var/lib/postgresql/data"),
    ("mysql", "/etc/mysql"),
    ("mongodb", "/data/configdb"),
    ("elasticsearch", "/usr/share/elasticsearch/config"),
];

fn opposite(color: &str) -> &'static str {
    if color == "blue" {
        "green"
    } else {
        "blue"
    }
}

pub(crate) async fn run(ctx: &StrategyCtx<'_>) -> StepResult<Outcome> {
    let docker = ctx.target.docker();
    let name = &ctx.descriptor.container_name;

    // Determine colors from the live container's labels; first deploy gets
    // blue.
    let old_exists = docker.container_exists(name).await.map_err(Abort::Fail)?;
    let old_descriptor = if old_exists {
        Some(
            crate::descriptor::introspect(
                docker,
                name,
                &ctx.engine.health,
                &ctx.engine.config.health,
            )
            .await
            .map_err(Abort::Fail)?,
        )
    } else {
        None
    };

    let old_color = old_descriptor
        .as_ref()
        .and_then(|d| d.labels.get(COLOR_LABEL).cloned())
        .unwrap_or_else(|| "green".to_string());
    let new_color = opposite(&old_color);
    let candidate = format!("{}-{}", name, new_color);

    ctx.lease.update(
        Stage::Building,
        15,
        format!("building {} ({})", ctx.descriptor.image_tag, new_color),
    );
    ensure_new_image(ctx).await?;

    checkpoint(ctx)?;
    ctx.lease
        .update(Stage::Creating, 30, format!("starting {}", candidate));
    docker.remove_container_quiet(&candidate).await;
    if let Err(e) = create_started(
        docker,
        ctx.descriptor,
        &candidate,
        PortMode::Ephemeral,
        &[(COLOR_LABEL, new_color)],
    )
    .await
    {
        docker.remove_container_quiet(&candidate).await;
        return Err(Abort::Fail(e));
    }

    ctx.lease
        .update(Stage::Validating, 45, format!("probing {}", candidate));
    if let Err(abort) = validate_container(ctx, ctx.target, &candidate).await {
        let _ = docker.stop_container(&candidate, 5).await;
        docker.remove_container_quiet(&candidate).await;
        return Err(abort);
    }

    if ctx.opts.migrate_data {
        if let Some(old_desc) = &old_descriptor {
            ctx.lease
                .update(Stage::MigratingData, 55, "copying volume data");
            if let Err(abort) = migrate_data(ctx, old_desc, name, &candidate).await {
                let _ = docker.stop_container(&candidate, 5).await;
                docker.remove_container_quiet(&candidate).await;
                return Err(abort);
            }
        }
    }

    checkpoint(ctx)?;
    ctx.lease
        .update(Stage::Switching, 70, format!("switching {} to {}", name, new_color));

    let parked = format!("{}-{}", name, old_color);
    if old_exists {
        stop_bounded(ctx.lease, docker, name, OLD_STOP_TIMEOUT).await?;
        docker.remove_container_quiet(&parked).await;
        docker
            .rename_container(name, &parked)
            .await
            .map_err(Abort::Fail)?;
    }

    // The candidate validated on probe ports; rebind to the live port map
    // under the real name.
    let _ = docker.stop_container(&candidate, 5).await;
    docker.remove_container_quiet(&candidate).await;

    if let Err(e) = create_started(
        docker,
        ctx.descriptor,
        name,
        PortMode::Original,
        &[(COLOR_LABEL, new_color)],
    )
    .await
    {
        if old_exists {
            warn!("switch failed, restoring {}", name);
            if docker.rename_container(&parked, name).await.is_ok() {
                let _ = docker.start_container(name).await;
            }
        }
        return Err(Abort::Fail(e));
    }
    info!("{} is now {} ({})", name, ctx.descriptor.image_tag, new_color);

    // Grace window for operator rollback. Cancellation past the switch is
    // honored as complete; the switch is not reversed, but the parked
    // container is retained for a manual swap-back.
    if old_exists {
        ctx.lease
            .update(Stage::Switching, 85, "grace window for rollback");
        match settle(ctx.lease, ROLLBACK_GRACE).await {
            Ok(()) => {
                ctx.lease
                    .update(Stage::CleaningUp, 95, format!("removing {}", parked));
                docker.remove_container_quiet(&parked).await;
            }
            Err(_) => {
                ctx.lease.update(
                    Stage::CleaningUp,
                    95,
                    format!("switch kept; {} retained for manual rollback", parked),
                );
            }
        }
    } else {
        ctx.lease.update(Stage::CleaningUp, 95, "first deploy, nothing to retire");
    }

    Ok(Outcome {
        strategy: "blue-green",
        message: format!("{} switched to {} ({})", name, ctx.descriptor.image_tag, new_color),
    })
}

/// Copy data from the old container's mounts into the new descriptor's
/// distinct mounts. Matching sources are already shared and skipped. For
/// recognized database images the config subtree is additionally copied
/// container-to-container.
async fn migrate_data(
    ctx: &StrategyCtx<'_>,
    old_descriptor: &ContainerDescriptor,
    old_name: &str,
    candidate: &str,
) -> StepResult<()> {
    let docker = ctx.target.docker();
    let helper = &ctx.engine.config.docker.helper_image;

    for mount in &ctx.descriptor.volumes {
        checkpoint(ctx)?;

        // The old container's mount at the same container path.
        let Some(old_mount) = old_descriptor
            .volumes
            .iter()
            .find(|m| m.mount_path() == mount.mount_path())
        else {
            continue;
        };

        if old_mount.source_id() == mount.source_id() {
            // Same volume or host path: shared, nothing to copy.
            continue;
        }

        info!(
            from = old_mount.source_id(),
            to = mount.source_id(),
            "copying mount data"
        );

        if let MountSpec::Volume { volume_name, .. } = mount {
            if !docker.volume_exists(volume_name).await.map_err(Abort::Fail)? {
                docker.create_volume(volume_name).await.map_err(Abort::Fail)?;
            }
        }

        let from = remounted(old_mount, "/from", true);
        let to = remounted(mount, "/to", false);

        let output = docker
            .run_ephemeral(
                helper,
                vec!["sh".into(), "-c".into(), "cp -a /from/. /to/".into()],
                vec![from.to_docker_mount(true), to.to_docker_mount(false)],
            )
            .await
            .map_err(Abort::Fail)?;

        if output.exit_code != 0 {
            return Err(Abort::Fail(PilotError::new(
                ErrorKind::VolumeCopyFailed,
                format!(
                    "copy {} -> {} exited {}: {}",
                    old_mount.source_id(),
                    mount.source_id(),
                    output.exit_code,
                    output.logs.trim()
                ),
            )));
        }
    }

    // Database config subtrees travel container-to-container.
    let image = ctx.descriptor.image_tag.to_ascii_lowercase();
    for (family, subtree) in DB_CONFIG_SUBTREES {
        if !image.contains(family) {
            continue;
        }
        checkpoint(ctx)?;
        info!(family, subtree, "copying database config subtree");

        let tar = docker
            .download_from_container(old_name, subtree)
            .collect::<Vec<_>>()
            .await;
        if tar.iter().any(|chunk| chunk.is_err()) {
            warn!("config subtree {} not readable on {}, skipped", subtree, old_name);
            continue;
        }
        let parent = std::path::Path::new(subtree)
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| "/".to_string());

        let stream = futures_util::stream::iter(tar);
        docker
            .upload_to_container(candidate, &parent, stream)
            .await
            .map_err(Abort::Fail)?;
    }

    Ok(())
}

/// The same source remounted at a fixed helper path.
fn remounted(mount: &MountSpec, at: &str, read_only: bool) -> MountSpec {
    match mount {
        MountSpec::Volume { volume_name, .. } => MountSpec::Volume {
            volume_name: volume_name.clone(),
            mount_path: at.to_string(),
            read_only,
        },
        MountSpec::Bind { host_path, .. } => MountSpec::Bind {
            host_path: host_path.clone(),
            mount_path: at.to_string(),
            read_only,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colors_alternate() {
        assert_eq!(opposite("blue"), "green");
        assert_eq!(opposite("green"), "blue");
        // Unknown labels fall back to blue.
        assert_eq!(opposite("chartreuse"), "blue");
    }
}
