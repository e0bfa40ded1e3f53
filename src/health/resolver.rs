use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Resolved probe spec for an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Probe {
    /// HTTP GET against the endpoint, expecting 200.
    Http { endpoint: String },
    /// No HTTP probe; readiness is container state running for >= 2 s
    /// without a restart.
    StateOnly,
}

/// Image stems that never get an HTTP probe.
const NON_HTTP_STEMS: &[&str] = &[
    "ssh",
    "redis",
    "mariadb",
    "mysql",
    "postgresql",
    "mongodb",
    "db2",
    "rabbitmq",
    "kafka",
];

fn builtin_defaults() -> BTreeMap<String, String> {
    [
        ("qdrant", "/healthz"),
        ("ollama", "/api/version"),
        ("influxdb", "/ready"),
        ("grafana", "/api/health"),
        ("prometheus", "/-/healthy"),
        ("nextcloud", "/status.php"),
        ("elasticsearch", "/_cluster/health"),
        ("homeassistant", "/"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// Pure resolver from image reference to probe spec.
///
/// Layering, first hit wins: user overrides, shipped defaults, the non-HTTP
/// allow-list, then the `/health` fallback. Matching is case-insensitive
/// substring on the image name; when several keys match, the longest wins.
/// Swapping the defaults JSON file is a valid re-configuration.
pub struct HealthResolver {
    defaults: BTreeMap<String, String>,
    overrides: BTreeMap<String, String>,
}

impl HealthResolver {
    pub fn new() -> Self {
        Self {
            defaults: builtin_defaults(),
            overrides: BTreeMap::new(),
        }
    }

    /// Load from the config root: `health-checks-defaults.json` replaces the
    /// built-in table when present, `health-checks-user.yml` layers on top.
    /// Unreadable files are logged and skipped.
    pub fn load(defaults_path: &Path, overrides_path: &Path) -> Self {
        let mut resolver = Self::new();

        if defaults_path.exists() {
            match std::fs::read_to_string(defaults_path)
                .map_err(|e| e.to_string())
                .and_then(|s| serde_json::from_str(&s).map_err(|e| e.to_string()))
            {
                Ok(map) => resolver.defaults = map,
                Err(e) => warn!("ignoring {}: {}", defaults_path.display(), e),
            }
        }

        if overrides_path.exists() {
            match std::fs::read_to_string(overrides_path)
                .map_err(|e| e.to_string())
                .and_then(|s| serde_yaml::from_str(&s).map_err(|e| e.to_string()))
            {
                Ok(map) => resolver.overrides = map,
                Err(e) => warn!("ignoring {}: {}", overrides_path.display(), e),
            }
        }

        resolver
    }

    /// Write the built-in defaults table for user editing, if absent.
    pub fn seed_defaults(path: &Path) -> std::io::Result<()> {
        if path.exists() {
            return Ok(());
        }
        let json = serde_json::to_string_pretty(&builtin_defaults())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        std::fs::write(path, json)
    }

    pub fn with_overrides(mut self, overrides: BTreeMap<String, String>) -> Self {
        self.overrides = overrides;
        self
    }

    /// Resolve the probe for an image reference such as `grafana/grafana:10.4.0`.
    pub fn resolve(&self, image: &str) -> Probe {
        let name = image.to_ascii_lowercase();

        if let Some(endpoint) = longest_match(&self.overrides, &name) {
            debug!(image, endpoint, "health endpoint from user override");
            return Probe::Http {
                endpoint: endpoint.to_string(),
            };
        }

        if let Some(endpoint) = longest_match(&self.defaults, &name) {
            return Probe::Http {
                endpoint: endpoint.to_string(),
            };
        }

        if NON_HTTP_STEMS.iter().any(|stem| name.contains(stem)) {
            return Probe::StateOnly;
        }

        Probe::Http {
            endpoint: "/health".to_string(),
        }
    }
}

impl Default for HealthResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn longest_match<'a>(table: &'a BTreeMap<String, String>, name: &str) -> Option<&'a str> {
    table
        .iter()
        .filter(|(key, _)| name.contains(&key.to_ascii_lowercase()))
        .max_by_key(|(key, _)| key.len())
        .map(|(_, endpoint)| endpoint.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_endpoints() {
        let resolver = HealthResolver::new();
        assert_eq!(
            resolver.resolve("grafana/grafana:10.4.0"),
            Probe::Http {
                endpoint: "/api/health".into()
            }
        );
        assert_eq!(
            resolver.resolve("influxdb:2.7"),
            Probe::Http {
                endpoint: "/ready".into()
            }
        );
    }

    #[test]
    fn fallback_is_health() {
        let resolver = HealthResolver::new();
        assert_eq!(
            resolver.resolve("my-random-app:1.0"),
            Probe::Http {
                endpoint: "/health".into()
            }
        );
    }

    #[test]
    fn non_http_images_skip_probing() {
        let resolver = HealthResolver::new();
        assert_eq!(resolver.resolve("ssh-jump:2.3"), Probe::StateOnly);
        assert_eq!(resolver.resolve("redis:7-alpine"), Probe::StateOnly);
        assert_eq!(resolver.resolve("bitnami/kafka:3.6"), Probe::StateOnly);
    }

    #[test]
    fn longest_key_wins() {
        let mut overrides = BTreeMap::new();
        overrides.insert("grafana".to_string(), "/short".to_string());
        overrides.insert("grafana-oss".to_string(), "/long".to_string());
        let resolver = HealthResolver::new().with_overrides(overrides);

        assert_eq!(
            resolver.resolve("grafana-oss:9"),
            Probe::Http {
                endpoint: "/long".into()
            }
        );
        assert_eq!(
            resolver.resolve("grafana:9"),
            Probe::Http {
                endpoint: "/short".into()
            }
        );
    }

    #[test]
    fn overrides_beat_defaults_and_skip_list() {
        let mut overrides = BTreeMap::new();
        overrides.insert("redis".to_string(), "/ping".to_string());
        let resolver = HealthResolver::new().with_overrides(overrides);

        assert_eq!(
            resolver.resolve("redis:7"),
            Probe::Http {
                endpoint: "/ping".into()
            }
        );
    }

    #[test]
    fn seeded_defaults_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("health-checks-defaults.json");

        HealthResolver::seed_defaults(&path).unwrap();
        let resolver = HealthResolver::load(&path, &dir.path().join("missing.yml"));
        assert_eq!(
            resolver.resolve("prometheus:v2"),
            Probe::Http {
                endpoint: "/-/healthy".into()
            }
        );
    }

    #[test]
    fn matching_is_case_insensitive() {
        let resolver = HealthResolver::new();
        assert_eq!(
            resolver.resolve("docker.io/Grafana/Grafana:10"),
            Probe::Http {
                endpoint: "/api/health".into()
            }
        );
    }
}
