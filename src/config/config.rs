//! Configuration structures and loading

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Main configuration
///
/// Every field carries a default so a missing config file yields a working
/// local-only setup rooted at `~/.dockerpilot`.
#[derive(Debug, Clone, Deserialize)]
pub struct Configuration {
    /// Enable debug mode
    #[serde(default)]
    pub debug: bool,

    /// Root directory for persisted state (servers.json, backups/, configs/)
    #[serde(default = "default_config_root")]
    pub config_root: PathBuf,

    /// Docker interaction settings
    #[serde(default)]
    pub docker: DockerConfiguration,

    /// Backup pre-flight and execution settings
    #[serde(default)]
    pub backup: BackupConfiguration,

    /// Health probe defaults
    #[serde(default)]
    pub health: HealthConfiguration,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            debug: false,
            config_root: default_config_root(),
            docker: DockerConfiguration::default(),
            backup: BackupConfiguration::default(),
            health: HealthConfiguration::default(),
        }
    }
}

impl Configuration {
    /// Load configuration from a TOML file; a missing file yields defaults.
    pub fn load(path: &str) -> Result<Self> {
        let config_path = Path::new(path);

        let mut config: Configuration = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .with_context(|| format!("Failed to read config file: {}", path))?;
            toml::from_str(&content).with_context(|| "Failed to parse configuration")?
        } else {
            Configuration::default()
        };

        // Resolve a relative config_root against the config file's directory
        if config.config_root.is_relative() {
            let base_dir = config_path
                .parent()
                .and_then(|p| if p.as_os_str().is_empty() { None } else { Some(p) })
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
            config.config_root = base_dir.join(&config.config_root);
        }

        std::fs::create_dir_all(&config.config_root)?;
        std::fs::create_dir_all(config.backups_dir())?;
        std::fs::create_dir_all(config.configs_dir())?;

        Ok(config)
    }

    pub fn servers_file(&self) -> PathBuf {
        self.config_root.join("servers.json")
    }

    pub fn history_file(&self) -> PathBuf {
        self.config_root.join("deployment_history.json")
    }

    pub fn configs_dir(&self) -> PathBuf {
        self.config_root.join("configs")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.config_root.join("backups")
    }

    pub fn health_defaults_file(&self) -> PathBuf {
        self.config_root.join("health-checks-defaults.json")
    }

    pub fn health_overrides_file(&self) -> PathBuf {
        self.config_root.join("health-checks-user.yml")
    }
}

fn default_config_root() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".dockerpilot")
}

/// Docker interaction settings
#[derive(Debug, Clone, Deserialize)]
pub struct DockerConfiguration {
    /// Image used for ephemeral helper containers (tar, copy)
    #[serde(default = "default_helper_image")]
    pub helper_image: String,

    /// Seconds to wait when stopping a container
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: i64,

    /// Image build timeout in seconds
    #[serde(default = "default_build_timeout")]
    pub build_timeout_secs: u64,

    /// Image pull timeout in seconds
    #[serde(default = "default_pull_timeout")]
    pub pull_timeout_secs: u64,
}

impl Default for DockerConfiguration {
    fn default() -> Self {
        Self {
            helper_image: default_helper_image(),
            stop_timeout_secs: default_stop_timeout(),
            build_timeout_secs: default_build_timeout(),
            pull_timeout_secs: default_pull_timeout(),
        }
    }
}

fn default_helper_image() -> String {
    "alpine:3".into()
}

fn default_stop_timeout() -> i64 {
    10
}

fn default_build_timeout() -> u64 {
    20 * 60
}

fn default_pull_timeout() -> u64 {
    10 * 60
}

/// Backup pre-flight and execution settings
#[derive(Debug, Clone, Deserialize)]
pub struct BackupConfiguration {
    /// Bound on the stat-walk used to estimate bind-mount sizes, in seconds.
    /// On expiry the size is reported as unknown and the mount flagged large.
    #[serde(default = "default_max_walk")]
    pub max_walk_secs: u64,

    /// Size at which a mount is flagged as large, in GiB
    #[serde(default = "default_large_threshold")]
    pub large_threshold_gib: u64,
}

impl Default for BackupConfiguration {
    fn default() -> Self {
        Self {
            max_walk_secs: default_max_walk(),
            large_threshold_gib: default_large_threshold(),
        }
    }
}

fn default_max_walk() -> u64 {
    10
}

fn default_large_threshold() -> u64 {
    500
}

/// Health probe defaults applied when a descriptor does not override them
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfiguration {
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Per-attempt timeout in seconds
    #[serde(default = "default_probe_timeout")]
    pub timeout_secs: u64,
}

impl Default for HealthConfiguration {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            timeout_secs: default_probe_timeout(),
        }
    }
}

fn default_retries() -> u32 {
    5
}

fn default_probe_timeout() -> u64 {
    5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let config = Configuration::default();
        assert_eq!(config.docker.helper_image, "alpine:3");
        assert_eq!(config.docker.build_timeout_secs, 20 * 60);
        assert_eq!(config.backup.large_threshold_gib, 500);
        assert!(config.servers_file().ends_with("servers.json"));
    }

    #[test]
    fn parses_partial_toml() {
        let config: Configuration = toml::from_str(
            r#"
            config_root = "/tmp/dp"

            [docker]
            helper_image = "busybox:1"
            "#,
        )
        .unwrap();

        assert_eq!(config.config_root, PathBuf::from("/tmp/dp"));
        assert_eq!(config.docker.helper_image, "busybox:1");
        assert_eq!(config.docker.stop_timeout_secs, 10);
    }
}
