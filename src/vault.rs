//! Sealed storage for the key sections stripped out of profile documents.
//!
//! Material is sealed with ChaCha20-Poly1305 under a per-install key kept
//! next to the profiles (mode 0600). Sealed values are base64 of
//! `nonce || ciphertext` and live in the profile's `key_data` field.

use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::{
    aead::{rand_core::RngCore, Aead},
    ChaCha20Poly1305, KeyInit, Nonce,
};
use rand::rngs::OsRng;
use tracing::info;

use crate::error::{AppError, Result};

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

pub struct KeyVault {
    cipher: ChaCha20Poly1305,
}

impl KeyVault {
    pub fn key_path(data_dir: &Path) -> PathBuf {
        data_dir.join("vault.key")
    }

    /// Load the install key, creating it on first use.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let path = Self::key_path(data_dir);
        let key = if path.exists() {
            let key = std::fs::read(&path)
                .map_err(|e| AppError::Read(format!("{}: {}", path.display(), e)))?;
            if key.len() != KEY_LEN {
                return Err(AppError::Process(format!("Bad vault key length {}", key.len())));
            }
            key
        } else {
            let mut key = vec![0_u8; KEY_LEN];
            OsRng.fill_bytes(&mut key);
            std::fs::create_dir_all(data_dir)?;
            std::fs::write(&path, &key)
                .map_err(|e| AppError::Write(format!("{}: {}", path.display(), e)))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
            }
            info!(path = %path.display(), "Created vault key");
            key
        };
        Self::from_key(&key)
    }

    pub fn from_key(key: &[u8]) -> Result<Self> {
        let cipher = ChaCha20Poly1305::new_from_slice(key)
            .map_err(|_| AppError::Process("Invalid vault key length".into()))?;
        Ok(Self { cipher })
    }

    pub fn seal(&self, plain: &str) -> Result<String> {
        let mut nonce = [0_u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt((&nonce).into(), plain.as_bytes())
            .map_err(|_| AppError::Process("Key material encryption failed".into()))?;
        let mut out = nonce.to_vec();
        out.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(out))
    }

    pub fn unseal(&self, sealed: &str) -> Result<String> {
        let raw = STANDARD
            .decode(sealed.trim())
            .map_err(|e| AppError::Parse(format!("Sealed key data: {}", e)))?;
        if raw.len() <= NONCE_LEN {
            return Err(AppError::Parse("Sealed key data too short".into()));
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| AppError::Process("Key material decryption failed".into()))?;
        String::from_utf8(plain).map_err(|e| AppError::Parse(format!("Sealed key data: {}", e)))
    }
}
