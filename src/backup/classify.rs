use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::BackupConfiguration;
use crate::descriptor::{ContainerDescriptor, MountSpec};
use crate::docker::DockerClient;
use crate::error::Result;

const GIB: u64 = 1024 * 1024 * 1024;

/// How one mount will be handled by a backup run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MountClass {
    /// Named volume, archived through an ephemeral helper
    Volume,
    /// Bind mount readable by the invoking user
    Bind,
    /// Bind mount that needs elevated credentials
    PrivilegedBind,
    /// Kernel-backed path, never archived
    System,
}

/// Pre-flight result the caller examines before starting an operation.
/// Replaces interactive prompts: the engine never asks, it reports.
#[derive(Debug, Clone, Serialize)]
pub struct BackupClassification {
    pub requires_sudo: bool,
    /// Sum of estimated sizes; `None` when any mount's size is unknown
    pub total_size_bytes: Option<u64>,
    /// Mounts at or above the large threshold, or of unknown size
    pub large_mounts: Vec<String>,
    pub privileged_paths: Vec<String>,
    /// System paths dropped from backup, with a warning
    pub skipped_system: Vec<String>,
    pub mounts: Vec<(String, MountClass)>,
}

impl BackupClassification {
    pub fn total_size_gb(&self) -> Option<f64> {
        self.total_size_bytes.map(|b| b as f64 / GIB as f64)
    }

    pub fn total_size_tb(&self) -> Option<f64> {
        self.total_size_gb().map(|gb| gb / 1024.0)
    }

    /// Message the caller can surface before a big or privileged run.
    pub fn warning(&self) -> Option<String> {
        if !self.large_mounts.is_empty() {
            return Some(format!(
                "large or unsized mounts: {}",
                self.large_mounts.join(", ")
            ));
        }
        if self.requires_sudo {
            return Some(format!(
                "privileged paths need elevation: {}",
                self.privileged_paths.join(", ")
            ));
        }
        None
    }
}

pub fn class_of(mount: &MountSpec) -> MountClass {
    match mount {
        MountSpec::Volume { .. } => MountClass::Volume,
        MountSpec::Bind { .. } if mount.system_path() => MountClass::System,
        MountSpec::Bind { .. } if mount.privileged() => MountClass::PrivilegedBind,
        MountSpec::Bind { .. } => MountClass::Bind,
    }
}

/// Classify every mount of a descriptor and estimate total backup size.
///
/// Volume sizes come from the daemon; bind mounts are stat-walked under a
/// time bound. A mount whose size cannot be determined in time is reported
/// as unknown and flagged large.
pub async fn classify(
    client: &DockerClient,
    descriptor: &ContainerDescriptor,
    config: &BackupConfiguration,
) -> Result<BackupClassification> {
    let threshold = config.large_threshold_gib * GIB;

    let mut requires_sudo = false;
    let mut total: Option<u64> = Some(0);
    let mut large_mounts = Vec::new();
    let mut privileged_paths = Vec::new();
    let mut skipped_system = Vec::new();
    let mut mounts = Vec::new();

    for mount in &descriptor.volumes {
        let class = class_of(mount);
        let id = mount.source_id().to_string();
        mounts.push((id.clone(), class));

        let size = match class {
            MountClass::System => {
                warn!("{} is a system path; it will not be backed up", id);
                skipped_system.push(id.clone());
                continue;
            }
            MountClass::Volume => client.volume_size(&id).await.ok().flatten(),
            MountClass::Bind => {
                walk_size(Path::new(&id), Duration::from_secs(config.max_walk_secs)).await
            }
            MountClass::PrivilegedBind => {
                requires_sudo = true;
                privileged_paths.push(id.clone());
                // Usually unreadable without elevation; try anyway.
                walk_size(Path::new(&id), Duration::from_secs(config.max_walk_secs)).await
            }
        };

        match size {
            Some(bytes) => {
                debug!("{}: {} bytes", id, bytes);
                total = total.map(|t| t + bytes);
                if bytes >= threshold {
                    large_mounts.push(id);
                }
            }
            None => {
                debug!("{}: size unknown", id);
                total = None;
                large_mounts.push(id);
            }
        }
    }

    Ok(BackupClassification {
        requires_sudo,
        total_size_bytes: total,
        large_mounts,
        privileged_paths,
        skipped_system,
        mounts,
    })
}

/// Sum file sizes under a path, aborting at the deadline. Returns `None` on
/// timeout or when the path cannot be read.
async fn walk_size(path: &Path, budget: Duration) -> Option<u64> {
    let path = path.to_path_buf();
    let expired = Arc::new(AtomicBool::new(false));

    let flag = Arc::clone(&expired);
    let walker = tokio::task::spawn_blocking(move || -> Option<u64> {
        let mut total = 0u64;
        for entry in walkdir::WalkDir::new(&path) {
            if flag.load(Ordering::Relaxed) {
                return None;
            }
            let entry = entry.ok()?;
            if entry.file_type().is_file() {
                total += entry.metadata().ok()?.len();
            }
        }
        Some(total)
    });

    match tokio::time::timeout(budget, walker).await {
        Ok(Ok(size)) => size,
        Ok(Err(_)) => None,
        Err(_) => {
            expired.store(true, Ordering::Relaxed);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bind(path: &str) -> MountSpec {
        MountSpec::Bind {
            host_path: path.into(),
            mount_path: "/data".into(),
            read_only: false,
        }
    }

    #[test]
    fn classes_cover_the_matrix() {
        let volume = MountSpec::Volume {
            volume_name: "data".into(),
            mount_path: "/data".into(),
            read_only: false,
        };
        assert_eq!(class_of(&volume), MountClass::Volume);
        assert_eq!(class_of(&bind("/srv/app")), MountClass::Bind);
        assert_eq!(
            class_of(&bind("/var/lib/docker/volumes/foo/_data")),
            MountClass::PrivilegedBind
        );
        assert_eq!(class_of(&bind("/proc/sysinfo")), MountClass::System);
        assert_eq!(class_of(&bind("/lib/modules")), MountClass::System);
    }

    #[tokio::test]
    async fn walk_size_sums_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), vec![0u8; 100]).unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b"), vec![0u8; 50]).unwrap();

        let size = walk_size(dir.path(), Duration::from_secs(5)).await;
        assert_eq!(size, Some(150));
    }

    #[tokio::test]
    async fn walk_size_missing_path_is_unknown() {
        let size = walk_size(Path::new("/definitely/not/here"), Duration::from_secs(1)).await;
        assert_eq!(size, None);
    }
}
