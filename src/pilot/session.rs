use parking_lot::RwLock;
use zeroize::Zeroize;

use crate::hosts::LOCAL_HOST_ID;

/// Per-session scope: the selected host and the elevation secret.
///
/// The secret lives in memory only and is wiped on explicit clear or when
/// the session drops; it is never persisted.
pub struct Session {
    host_id: RwLock<String>,
    elevation_secret: RwLock<Option<String>>,
}

impl Session {
    pub(crate) fn new() -> Self {
        Self {
            host_id: RwLock::new(LOCAL_HOST_ID.to_string()),
            elevation_secret: RwLock::new(None),
        }
    }

    /// Scope subsequent operations to the given host id.
    pub fn select_host(&self, host_id: &str) {
        *self.host_id.write() = host_id.to_string();
    }

    pub fn selected_host(&self) -> String {
        self.host_id.read().clone()
    }

    /// Store the sudo password used for privileged-path backups.
    pub fn set_elevation_secret(&self, secret: &str) {
        *self.elevation_secret.write() = Some(secret.to_string());
    }

    pub fn elevation_secret(&self) -> Option<String> {
        self.elevation_secret.read().clone()
    }

    pub fn clear_elevation_secret(&self) {
        self.wipe();
    }

    fn wipe(&self) {
        if let Some(mut secret) = self.elevation_secret.write().take() {
            secret.zeroize();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.wipe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_local() {
        let session = Session::new();
        assert_eq!(session.selected_host(), "local");
        assert_eq!(session.elevation_secret(), None);
    }

    #[test]
    fn host_selection_sticks() {
        let session = Session::new();
        session.select_host("edge-1");
        assert_eq!(session.selected_host(), "edge-1");
    }

    #[test]
    fn secret_set_and_clear() {
        let session = Session::new();
        session.set_elevation_secret("sudo-pw");
        assert_eq!(session.elevation_secret().as_deref(), Some("sudo-pw"));

        session.clear_elevation_secret();
        assert_eq!(session.elevation_secret(), None);
    }
}
