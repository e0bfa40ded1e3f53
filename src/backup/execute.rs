use std::path::{Path, PathBuf};
use std::process::Stdio;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, warn};

use crate::descriptor::MountSpec;
use crate::docker::DockerClient;
use crate::error::{ErrorKind, PilotError, Result};

use super::classify::{class_of, MountClass};

/// What a backup run did with one mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    Volume,
    Bind,
    PrivilegedBind,
    Skipped,
}

/// Result of backing up one mount. Kept only while the originating
/// operation might need it for rollback.
#[derive(Debug, Clone, Serialize)]
pub struct BackupRecord {
    pub kind: BackupKind,
    pub identifier: String,
    pub archive_path: Option<PathBuf>,
    pub size_bytes: u64,
    pub sha256: Option<String>,
    pub created_at: DateTime<Utc>,
    pub skip_reason: Option<String>,
}

impl BackupRecord {
    fn skipped(identifier: &str, reason: impl Into<String>) -> Self {
        Self {
            kind: BackupKind::Skipped,
            identifier: identifier.to_string(),
            archive_path: None,
            size_bytes: 0,
            sha256: None,
            created_at: Utc::now(),
            skip_reason: Some(reason.into()),
        }
    }
}

/// Snapshot one mount into `<archive_dir>/<op_key>-<mount>.tar.gz`.
///
/// Named volumes and plain bind mounts go through an ephemeral helper with
/// the source mounted read-only; privileged bind mounts run the host's
/// elevation command fed the stored secret on stdin. Re-running overwrites
/// the same archive name.
pub async fn backup_mount(
    client: &DockerClient,
    mount: &MountSpec,
    op_key: &str,
    archive_dir: &Path,
    helper_image: &str,
    elevation_secret: Option<&str>,
) -> Result<BackupRecord> {
    let identifier = mount.source_id();
    let archive_name = format!("{}-{}.tar.gz", op_key, sanitize(identifier));
    let archive_path = archive_dir.join(&archive_name);

    tokio::fs::create_dir_all(archive_dir).await?;

    let kind = match class_of(mount) {
        MountClass::System => {
            return Ok(BackupRecord::skipped(
                identifier,
                "system path is not backupable",
            ));
        }
        MountClass::Volume => {
            helper_archive(client, mount, &archive_name, archive_dir, helper_image).await?;
            BackupKind::Volume
        }
        MountClass::Bind => {
            helper_archive(client, mount, &archive_name, archive_dir, helper_image).await?;
            BackupKind::Bind
        }
        MountClass::PrivilegedBind => {
            let secret = elevation_secret.ok_or_else(|| {
                PilotError::new(
                    ErrorKind::ElevationRequired,
                    format!("{} needs elevated credentials", identifier),
                )
            })?;
            elevated_archive(identifier, &archive_path, secret).await?;
            BackupKind::PrivilegedBind
        }
    };

    let size_bytes = tokio::fs::metadata(&archive_path).await?.len();
    let sha256 = checksum(&archive_path).await?;

    info!(
        mount = identifier,
        archive = %archive_path.display(),
        size_bytes,
        "backup archived"
    );

    Ok(BackupRecord {
        kind,
        identifier: identifier.to_string(),
        archive_path: Some(archive_path),
        size_bytes,
        sha256: Some(sha256),
        created_at: Utc::now(),
        skip_reason: None,
    })
}

/// Archive through an ephemeral helper: source mounted read-only at
/// `/volume`, archive dir read-write at `/backup`. The artifact is chowned
/// to the owner of the archive dir so the orchestrator can read it.
async fn helper_archive(
    client: &DockerClient,
    mount: &MountSpec,
    archive_name: &str,
    archive_dir: &Path,
    helper_image: &str,
) -> Result<()> {
    let (uid, gid) = owner_of(archive_dir);

    let source_mount = match mount {
        MountSpec::Volume {
            volume_name,
            ..
        } => MountSpec::Volume {
            volume_name: volume_name.clone(),
            mount_path: "/volume".into(),
            read_only: true,
        },
        MountSpec::Bind { host_path, .. } => MountSpec::Bind {
            host_path: host_path.clone(),
            mount_path: "/volume".into(),
            read_only: true,
        },
    };
    let backup_mount = MountSpec::Bind {
        host_path: archive_dir.to_string_lossy().into_owned(),
        mount_path: "/backup".into(),
        read_only: false,
    };

    let script = format!(
        "tar -czf /backup/{name} -C /volume . && chown {uid}:{gid} /backup/{name}",
        name = archive_name,
        uid = uid,
        gid = gid,
    );

    let output = client
        .run_ephemeral(
            helper_image,
            vec!["sh".into(), "-c".into(), script],
            vec![
                source_mount.to_docker_mount(true),
                backup_mount.to_docker_mount(false),
            ],
        )
        .await?;

    if output.exit_code != 0 {
        return Err(PilotError::new(
            ErrorKind::BackupFailed,
            format!(
                "helper tar exited {}: {}",
                output.exit_code,
                output.logs.trim()
            ),
        ));
    }
    Ok(())
}

/// Archive a privileged path with the host's elevation command, feeding the
/// stored secret through stdin.
async fn elevated_archive(host_path: &str, archive_path: &Path, secret: &str) -> Result<()> {
    let (uid, gid) = owner_of(archive_path.parent().unwrap_or(Path::new(".")));

    let script = format!(
        "tar -czf {archive} -C {source} . && chown {uid}:{gid} {archive}",
        archive = shell_quote(&archive_path.to_string_lossy()),
        source = shell_quote(host_path),
        uid = uid,
        gid = gid,
    );

    let mut child = tokio::process::Command::new("sudo")
        .args(["-S", "-p", "", "sh", "-c", &script])
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(secret.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
    }

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let kind = if stderr.contains("incorrect password")
            || stderr.contains("Sorry, try again")
        {
            ErrorKind::ElevationRequired
        } else {
            ErrorKind::BackupFailed
        };
        return Err(PilotError::new(
            kind,
            format!("elevated tar of {} failed: {}", host_path, stderr.trim()),
        ));
    }
    Ok(())
}

async fn checksum(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

fn sanitize(identifier: &str) -> String {
    identifier
        .trim_matches('/')
        .replace('/', "_")
        .replace(|c: char| !c.is_ascii_alphanumeric() && c != '-' && c != '_' && c != '.', "_")
}

#[cfg(unix)]
fn owner_of(path: &Path) -> (u32, u32) {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata(path)
        .map(|m| (m.uid(), m.gid()))
        .unwrap_or_else(|e| {
            warn!("cannot stat {}: {}", path.display(), e);
            (0, 0)
        })
}

#[cfg(not(unix))]
fn owner_of(_path: &Path) -> (u32, u32) {
    (0, 0)
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_names_are_filesystem_safe() {
        assert_eq!(sanitize("grafana-data"), "grafana-data");
        assert_eq!(
            sanitize("/var/lib/docker/volumes/foo/_data"),
            "var_lib_docker_volumes_foo__data"
        );
        assert_eq!(sanitize("weird name!"), "weird_name_");
    }

    #[test]
    fn shell_quoting_survives_single_quotes() {
        assert_eq!(shell_quote("/plain/path"), "'/plain/path'");
        assert_eq!(shell_quote("a'b"), r"'a'\''b'");
    }

    #[tokio::test]
    async fn checksum_matches_known_vector() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        tokio::fs::write(&path, b"abc").await.unwrap();

        assert_eq!(
            checksum(&path).await.unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn system_paths_yield_skip_records() {
        let record = BackupRecord::skipped("/proc", "system path is not backupable");
        assert_eq!(record.kind, BackupKind::Skipped);
        assert!(record.archive_path.is_none());
        assert!(record.sha256.is_none());
    }
}
