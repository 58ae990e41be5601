// Copyright 2023 System76 <info@system76.com>
// SPDX-License-Identifier: MPL-2.0

//! Request encryption. The daemon generates ephemeral key material at
//! startup and publishes it, hex-encoded and with restricted permissions,
//! at a well-known path. Clients seal their serialized request with
//! AES-256-GCM; the wire envelope is `base64(nonce ‖ ciphertext)`.

use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use thiserror::Error;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Why a request envelope failed to open.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("the envelope is not valid base64")]
    Encoding,
    #[error("the envelope is too short")]
    Truncated,
    #[error("decryption failed")]
    Decrypt,
    #[error("the decrypted body is not UTF-8")]
    Utf8,
}

/// The daemon's ephemeral request key.
pub struct RequestKey {
    key: [u8; KEY_LEN],
}

impl RequestKey {
    /// Generates fresh key material.
    #[must_use]
    pub fn generate() -> Self {
        let mut key = [0_u8; KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut key);
        Self { key }
    }

    /// Restores a key from its hex form, as clients read it from the
    /// published file.
    #[must_use]
    pub fn from_hex(text: &str) -> Option<Self> {
        let text = text.trim();

        if text.len() != KEY_LEN * 2 {
            return None;
        }

        let mut key = [0_u8; KEY_LEN];
        for (idx, byte) in key.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&text[idx * 2..idx * 2 + 2], 16).ok()?;
        }

        Some(Self { key })
    }

    fn to_hex(&self) -> String {
        let mut hex = String::with_capacity(KEY_LEN * 2);
        for byte in &self.key {
            use std::fmt::Write;
            let _res = write!(hex, "{byte:02x}");
        }

        hex
    }

    /// The path the key is published at: a runtime directory for root
    /// daemons, a per-user temporary directory otherwise.
    #[must_use]
    pub fn default_path(uid: u32) -> PathBuf {
        if uid == 0 {
            PathBuf::from("/run/guapow/request.key")
        } else {
            let mut itoa = itoa::Buffer::new();
            PathBuf::from(["/tmp/guapow-", itoa.format(uid)].concat()).join("request.key")
        }
    }

    /// Publishes the key with owner/group-only permissions so local
    /// clients can read it but other users cannot.
    pub fn publish(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
            std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o750))?;
        }

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o640)
            .open(path)?;

        file.write_all(self.to_hex().as_bytes())?;
        drop(file);

        // The mode option only applies on creation; restarts must not
        // inherit looser permissions.
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o640))?;
        tracing::info!("request key published at {}", path.display());

        Ok(())
    }

    /// Seals a request body the way clients do.
    #[must_use]
    pub fn seal(&self, plaintext: &str) -> String {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));

        let mut nonce = [0_u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        // Encryption with a fresh random nonce cannot fail.
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .unwrap_or_default();

        let mut envelope = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        envelope.extend_from_slice(&nonce);
        envelope.extend_from_slice(&ciphertext);

        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(envelope)
    }

    /// Opens a sealed request body.
    pub fn open(&self, envelope: &str) -> Result<String, CryptoError> {
        use base64::Engine;

        let raw = base64::engine::general_purpose::STANDARD
            .decode(envelope.trim())
            .map_err(|_| CryptoError::Encoding)?;

        if raw.len() <= NONCE_LEN {
            return Err(CryptoError::Truncated);
        }

        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Decrypt)?;

        String::from_utf8(plaintext).map_err(|_| CryptoError::Utf8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let key = RequestKey::generate();
        let body = "request.pid=42 request.user=alice proc.nice=-5";

        let envelope = key.seal(body);
        assert_eq!(key.open(&envelope).unwrap(), body);
    }

    #[test]
    fn tampered_envelope_rejected() {
        let key = RequestKey::generate();
        let envelope = key.seal("request.pid=42");

        use base64::Engine;
        let mut raw = base64::engine::general_purpose::STANDARD.decode(&envelope).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        let tampered = base64::engine::general_purpose::STANDARD.encode(raw);

        assert!(matches!(key.open(&tampered), Err(CryptoError::Decrypt)));
    }

    #[test]
    fn wrong_key_rejected() {
        let envelope = RequestKey::generate().seal("request.pid=42");
        let other = RequestKey::generate();

        assert!(other.open(&envelope).is_err());
    }

    #[test]
    fn malformed_envelopes_rejected() {
        let key = RequestKey::generate();
        assert!(matches!(key.open("@@@not-base64@@@"), Err(CryptoError::Encoding)));
        assert!(matches!(key.open("aGk="), Err(CryptoError::Truncated)));
    }

    #[test]
    fn hex_round_trip() {
        let key = RequestKey::generate();
        let restored = RequestKey::from_hex(&key.to_hex()).unwrap();

        let envelope = key.seal("body");
        assert_eq!(restored.open(&envelope).unwrap(), "body");

        assert!(RequestKey::from_hex("abc").is_none());
        assert!(RequestKey::from_hex(&"zz".repeat(32)).is_none());
    }

    #[test]
    fn published_key_is_restricted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys/request.key");

        let key = RequestKey::generate();
        key.publish(&path).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o640);

        let text = std::fs::read_to_string(&path).unwrap();
        let restored = RequestKey::from_hex(&text).unwrap();
        assert_eq!(restored.open(&key.seal("x")).unwrap(), "x");
    }
}
