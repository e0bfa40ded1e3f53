use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reserved id for the implicit local-daemon host. Never stored.
pub const LOCAL_HOST_ID: &str = "local";

/// SSH authentication flavor for a remote host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    Password,
    Key,
    KeyWithPassphrase,
    PasswordTotp,
}

/// One Docker endpoint reachable over SSH.
///
/// Secrets never live here; they are sealed separately and the registry only
/// ever hands out records without them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostRecord {
    /// Stable opaque id; `"local"` is reserved for the implicit local record
    pub id: String,
    /// Display name
    pub name: String,
    pub hostname: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    pub auth_kind: AuthKind,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
}

fn default_ssh_port() -> u16 {
    22
}

/// Secret material matching a record's auth kind. Held in memory only while
/// an operation needs it; sealed with the secret store before touching disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SecretMaterial {
    Password {
        password: String,
    },
    Key {
        private_key_pem: String,
        #[serde(default)]
        passphrase: Option<String>,
    },
    PasswordTotp {
        password: String,
        /// Base32-encoded TOTP seed; a code is generated and consumed once
        /// per connection.
        totp_seed: String,
    },
}

impl SecretMaterial {
    pub fn matches(&self, kind: AuthKind) -> bool {
        matches!(
            (self, kind),
            (SecretMaterial::Password { .. }, AuthKind::Password)
                | (SecretMaterial::Key { passphrase: None, .. }, AuthKind::Key)
                | (
                    SecretMaterial::Key {
                        passphrase: Some(_),
                        ..
                    },
                    AuthKind::KeyWithPassphrase
                )
                | (SecretMaterial::PasswordTotp { .. }, AuthKind::PasswordTotp)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn material_matches_auth_kind() {
        let pw = SecretMaterial::Password {
            password: "s3cret".into(),
        };
        assert!(pw.matches(AuthKind::Password));
        assert!(!pw.matches(AuthKind::Key));

        let key = SecretMaterial::Key {
            private_key_pem: "---".into(),
            passphrase: Some("phrase".into()),
        };
        assert!(key.matches(AuthKind::KeyWithPassphrase));
        assert!(!key.matches(AuthKind::Key));
    }

    #[test]
    fn record_defaults_port() {
        let record: HostRecord = serde_json::from_str(
            r#"{
                "id": "edge-1",
                "name": "Edge",
                "hostname": "edge.example.com",
                "username": "deploy",
                "auth_kind": "password",
                "created_at": "2026-01-01T00:00:00Z"
            }"#,
        )
        .unwrap();
        assert_eq!(record.port, 22);
    }
}
