//! Secrets at rest
//!
//! Host secrets are sealed with XChaCha20-Poly1305 under a key derived from a
//! machine-stable seed (owner uid of the config root plus its canonical
//! path). Records on disk carry ciphertext only; moving the file to another
//! machine fails decryption rather than leaking credentials.

use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{ErrorKind, PilotError, Result};

type HmacSha256 = Hmac<Sha256>;

const KDF_CONTEXT: &[u8] = b"dockerpilot.secret-store.v1";
const NONCE_LEN: usize = 24;

/// Seals and opens secret blobs with a machine-derived key.
#[derive(Clone)]
pub struct SecretStore {
    cipher: XChaCha20Poly1305,
}

impl SecretStore {
    /// Derive the store key from the config root. The seed is stable across
    /// restarts on one machine: owner uid of the directory plus its
    /// canonical path.
    pub fn open(config_root: &Path) -> Result<Self> {
        let canonical = config_root
            .canonicalize()
            .unwrap_or_else(|_| config_root.to_path_buf());

        let uid = owner_uid(&canonical);

        let mut mac = <HmacSha256 as Mac>::new_from_slice(KDF_CONTEXT)
            .map_err(|e| PilotError::internal(e.to_string()))?;
        mac.update(&uid.to_le_bytes());
        mac.update(canonical.to_string_lossy().as_bytes());
        let key_bytes = mac.finalize().into_bytes();

        let cipher = XChaCha20Poly1305::new(Key::from_slice(&key_bytes));
        Ok(Self { cipher })
    }

    /// Encrypt and base64-encode. Output embeds the random nonce.
    pub fn seal(&self, plaintext: &[u8]) -> Result<String> {
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| PilotError::internal("secret encryption failed"))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(blob))
    }

    /// Decode and decrypt a sealed blob.
    pub fn unseal(&self, sealed: &str) -> Result<Vec<u8>> {
        let blob = BASE64
            .decode(sealed)
            .map_err(|_| PilotError::new(ErrorKind::AuthRejected, "corrupt secret blob"))?;
        if blob.len() <= NONCE_LEN {
            return Err(PilotError::new(
                ErrorKind::AuthRejected,
                "corrupt secret blob",
            ));
        }

        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        self.cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| {
                PilotError::new(
                    ErrorKind::AuthRejected,
                    "secret does not decrypt on this machine",
                )
            })
    }
}

#[cfg(unix)]
fn owner_uid(path: &Path) -> u64 {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata(path).map(|m| m.uid() as u64).unwrap_or(0)
}

#[cfg(not(unix))]
fn owner_uid(_path: &Path) -> u64 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_unseal_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SecretStore::open(dir.path()).unwrap();

        let sealed = store.seal(b"hunter2").unwrap();
        assert_ne!(sealed.as_bytes(), b"hunter2");
        assert_eq!(store.unseal(&sealed).unwrap(), b"hunter2");
    }

    #[test]
    fn nonces_differ_between_seals() {
        let dir = tempfile::tempdir().unwrap();
        let store = SecretStore::open(dir.path()).unwrap();

        let a = store.seal(b"same").unwrap();
        let b = store.seal(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tampered_blob_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = SecretStore::open(dir.path()).unwrap();

        let sealed = store.seal(b"payload").unwrap();
        let mut raw = BASE64.decode(&sealed).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        let tampered = BASE64.encode(raw);

        assert!(store.unseal(&tampered).is_err());
    }

    #[test]
    fn different_root_means_different_key() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let store_a = SecretStore::open(dir_a.path()).unwrap();
        let store_b = SecretStore::open(dir_b.path()).unwrap();

        let sealed = store_a.seal(b"pinned").unwrap();
        assert!(store_b.unseal(&sealed).is_err());
    }
}
