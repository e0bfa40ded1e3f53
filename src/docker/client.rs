use std::path::Path;
use std::sync::Arc;

use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, ListContainersOptions,
    LogsOptions, RemoveContainerOptions, RenameContainerOptions, StopContainerOptions,
    UploadToContainerOptions, WaitContainerOptions,
};
use bollard::image::{BuildImageOptions, CreateImageOptions, RemoveImageOptions, TagImageOptions};
use bollard::models::{ContainerInspectResponse, ContainerSummary, HostConfig, Mount};
use bollard::volume::CreateVolumeOptions;
use bollard::Docker;
use bytes::Bytes;
use futures_util::stream::{Stream, StreamExt, TryStreamExt};
use tracing::{debug, error, info, warn};

use crate::error::{ErrorKind, PilotError, Result};

/// Output of a run-to-completion helper container.
#[derive(Debug, Clone)]
pub struct EphemeralOutput {
    pub exit_code: i64,
    pub logs: String,
}

/// Thin façade over one Docker Engine API endpoint.
///
/// Cheap to clone; all callers of one operation share the same underlying
/// connection. The probe host is where published ports of this endpoint are
/// reachable from the orchestrator (loopback for the local daemon, the SSH
/// hostname for tunneled remotes).
#[derive(Clone)]
pub struct DockerClient {
    client: Arc<Docker>,
    probe_host: String,
}

impl DockerClient {
    /// Connect to the platform-native daemon socket.
    pub fn local() -> Result<Self> {
        let client = Docker::connect_with_local_defaults()?;
        Ok(Self {
            client: Arc::new(client),
            probe_host: "127.0.0.1".to_string(),
        })
    }

    /// Connect over TCP, e.g. to a tunneled remote daemon socket.
    pub fn with_http(address: &str, probe_host: &str) -> Result<Self> {
        let client = Docker::connect_with_http(address, 120, bollard::API_DEFAULT_VERSION)?;
        Ok(Self {
            client: Arc::new(client),
            probe_host: probe_host.to_string(),
        })
    }

    /// Host where published ports are reachable, for health probes.
    pub fn probe_host(&self) -> &str {
        &self.probe_host
    }

    pub async fn ping(&self) -> Result<()> {
        self.client.ping().await?;
        Ok(())
    }

    pub async fn inspect_container(&self, name: &str) -> Result<ContainerInspectResponse> {
        Ok(self.client.inspect_container(name, None).await?)
    }

    pub async fn container_exists(&self, name: &str) -> Result<bool> {
        match self.client.inspect_container(name, None).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>> {
        let options = Some(ListContainersOptions::<String> {
            all,
            ..Default::default()
        });
        Ok(self.client.list_containers(options).await?)
    }

    /// Pull an image, draining the status stream.
    pub async fn pull_image(&self, image: &str) -> Result<()> {
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        let mut stream = self.client.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!("pull {}: {}", image, status);
                    }
                }
                Err(e) => {
                    error!("pull {} failed: {}", image, e);
                    return Err(e.into());
                }
            }
        }

        info!("pulled {}", image);
        Ok(())
    }

    /// Make sure an image is present locally, pulling if absent.
    pub async fn ensure_image(&self, image: &str) -> Result<()> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => self.pull_image(image).await,
            Err(e) => Err(e.into()),
        }
    }

    pub async fn image_id(&self, image: &str) -> Result<Option<String>> {
        match self.client.inspect_image(image).await {
            Ok(inspect) => Ok(inspect.id),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn image_size(&self, image: &str) -> Result<Option<i64>> {
        match self.client.inspect_image(image).await {
            Ok(inspect) => Ok(inspect.size),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Build an image from a local context directory tagged as `tag`.
    ///
    /// The context is tarred in a blocking task and streamed to the daemon;
    /// build output lines are logged as they arrive.
    pub async fn build_image(&self, context_dir: &Path, tag: &str) -> Result<()> {
        let context = context_dir.to_path_buf();
        let tar_bytes = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
            let mut builder = tar::Builder::new(Vec::new());
            builder.append_dir_all(".", &context)?;
            Ok(builder.into_inner()?)
        })
        .await
        .map_err(|e| PilotError::internal(e.to_string()))??;

        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: tag.to_string(),
            rm: true,
            ..Default::default()
        };

        let mut stream = self
            .client
            .build_image(options, None, Some(tar_bytes.into()));

        while let Some(result) = stream.next().await {
            let info = result?;
            if let Some(line) = info.stream {
                let line = line.trim_end();
                if !line.is_empty() {
                    debug!("build {}: {}", tag, line);
                }
            }
            if let Some(detail) = info.error {
                return Err(PilotError::new(
                    ErrorKind::DaemonError,
                    format!("build failed: {}", detail),
                ));
            }
        }

        info!("built {}", tag);
        Ok(())
    }

    pub async fn tag_image(&self, image: &str, repo: &str, tag: &str) -> Result<()> {
        self.client
            .tag_image(
                image,
                Some(TagImageOptions {
                    repo: repo.to_string(),
                    tag: tag.to_string(),
                }),
            )
            .await?;
        Ok(())
    }

    pub async fn remove_image(&self, image: &str) -> Result<()> {
        self.client
            .remove_image(
                image,
                Some(RemoveImageOptions {
                    force: false,
                    ..Default::default()
                }),
                None,
            )
            .await?;
        Ok(())
    }

    /// Whether any container (running or not) uses the given image id.
    pub async fn image_in_use(&self, image_id: &str) -> Result<bool> {
        let containers = self.list_containers(true).await?;
        Ok(containers
            .iter()
            .any(|c| c.image_id.as_deref() == Some(image_id)))
    }

    pub async fn create_container(&self, name: &str, config: Config<String>) -> Result<String> {
        let options = Some(CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        });
        let response = self.client.create_container(options, config).await?;
        Ok(response.id)
    }

    pub async fn start_container(&self, name: &str) -> Result<()> {
        self.client.start_container::<String>(name, None).await?;
        Ok(())
    }

    pub async fn stop_container(&self, name: &str, timeout_secs: i64) -> Result<()> {
        self.client
            .stop_container(name, Some(StopContainerOptions { t: timeout_secs }))
            .await?;
        Ok(())
    }

    pub async fn remove_container(&self, name: &str, force: bool) -> Result<()> {
        self.client
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await?;
        Ok(())
    }

    /// Remove a container if it exists, logging rather than failing.
    pub async fn remove_container_quiet(&self, name: &str) {
        match self.remove_container(name, true).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("could not remove {}: {}", name, e),
        }
    }

    pub async fn rename_container(&self, name: &str, new_name: &str) -> Result<()> {
        self.client
            .rename_container(
                name,
                RenameContainerOptions {
                    name: new_name.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    /// Wait for a container to exit and return its status code.
    pub async fn wait_container(&self, name: &str) -> Result<i64> {
        let mut stream = self
            .client
            .wait_container(name, None::<WaitContainerOptions<String>>);

        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // A non-zero exit surfaces as a ContainerWaitError carrying the code.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(e.into()),
            None => Err(PilotError::internal("wait stream ended without a status")),
        }
    }

    /// Collected stdout+stderr of a finished container.
    pub async fn container_logs(&self, name: &str) -> Result<String> {
        let options = Some(LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: "all".to_string(),
            ..Default::default()
        });

        let mut stream = self.client.logs(name, options);
        let mut collected = String::new();
        while let Some(result) = stream.next().await {
            match result {
                Ok(output) => collected.push_str(&String::from_utf8_lossy(&output.into_bytes())),
                Err(e) => {
                    warn!("log stream for {} ended early: {}", name, e);
                    break;
                }
            }
        }
        Ok(collected)
    }

    /// Tar stream of a path inside a container.
    pub fn download_from_container(
        &self,
        name: &str,
        path: &str,
    ) -> impl Stream<Item = std::result::Result<Bytes, bollard::errors::Error>> {
        self.client.download_from_container(
            name,
            Some(DownloadFromContainerOptions {
                path: path.to_string(),
            }),
        )
    }

    /// Extract a tar stream into a path inside a container.
    pub async fn upload_to_container<S>(&self, name: &str, path: &str, tar: S) -> Result<()>
    where
        S: Stream<Item = std::result::Result<Bytes, bollard::errors::Error>> + Send + 'static,
    {
        let chunks: Vec<Bytes> = tar.try_collect().await?;
        let body = Bytes::from(chunks.concat());
        self.client
            .upload_to_container(
                name,
                Some(UploadToContainerOptions {
                    path: path.to_string(),
                    ..Default::default()
                }),
                body,
            )
            .await?;
        Ok(())
    }

    /// Tar stream of a full image (`docker save`).
    pub fn export_image(
        &self,
        image: &str,
    ) -> impl Stream<Item = std::result::Result<Bytes, bollard::errors::Error>> {
        self.client.export_image(image)
    }

    /// Load an image from a tar stream (`docker load`).
    pub async fn import_image<S>(&self, tar: S) -> Result<()>
    where
        S: Stream<Item = std::result::Result<Bytes, bollard::errors::Error>> + Send + 'static,
    {
        let chunks: Vec<Bytes> = tar.try_collect().await?;
        let body = Bytes::from(chunks.concat());
        let mut stream = self.client.import_image(
            bollard::image::ImportImageOptions {
                ..Default::default()
            },
            body,
            None,
        );

        while let Some(result) = stream.next().await {
            let info = result?;
            if let Some(detail) = info.error {
                return Err(PilotError::new(
                    ErrorKind::DaemonError,
                    format!("image load failed: {}", detail),
                ));
            }
        }
        Ok(())
    }

    pub async fn volume_exists(&self, name: &str) -> Result<bool> {
        match self.client.inspect_volume(name).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn create_volume(&self, name: &str) -> Result<()> {
        self.client
            .create_volume(CreateVolumeOptions {
                name: name.to_string(),
                ..Default::default()
            })
            .await?;
        Ok(())
    }

    pub async fn remove_volume(&self, name: &str) -> Result<()> {
        self.client.remove_volume(name, None).await?;
        Ok(())
    }

    /// Volume size as reported by the daemon, when it reports one.
    pub async fn volume_size(&self, name: &str) -> Result<Option<u64>> {
        let volume = self.client.inspect_volume(name).await?;
        Ok(volume
            .usage_data
            .and_then(|u| u64::try_from(u.size).ok())
            .filter(|size| *size > 0))
    }

    /// Pull-if-absent, run to completion, capture exit code and logs, and
    /// remove the container regardless of outcome.
    pub async fn run_ephemeral(
        &self,
        image: &str,
        cmd: Vec<String>,
        mounts: Vec<Mount>,
    ) -> Result<EphemeralOutput> {
        self.ensure_image(image).await?;

        let name = format!("dp-helper-{}", short_id());
        let config = Config {
            image: Some(image.to_string()),
            cmd: Some(cmd),
            host_config: Some(HostConfig {
                mounts: if mounts.is_empty() { None } else { Some(mounts) },
                ..Default::default()
            }),
            ..Default::default()
        };

        self.create_container(&name, config).await?;

        let run = async {
            self.start_container(&name).await?;
            let exit_code = self.wait_container(&name).await?;
            let logs = self.container_logs(&name).await?;
            Ok::<_, PilotError>(EphemeralOutput { exit_code, logs })
        };

        let result = run.await;
        self.remove_container_quiet(&name).await;
        result
    }

    /// Create a stopped scratch container used purely as a mount point for
    /// tar streaming. The caller removes it.
    pub async fn create_scratch(&self, image: &str, mounts: Vec<Mount>) -> Result<String> {
        self.ensure_image(image).await?;

        let name = format!("dp-scratch-{}", short_id());
        let config = Config {
            image: Some(image.to_string()),
            cmd: Some(vec!["true".to_string()]),
            host_config: Some(HostConfig {
                mounts: if mounts.is_empty() { None } else { Some(mounts) },
                ..Default::default()
            }),
            ..Default::default()
        };

        self.create_container(&name, config).await?;
        Ok(name)
    }
}

fn short_id() -> String {
    uuid::Uuid::new_v4().to_string()[..8].to_string()
}
