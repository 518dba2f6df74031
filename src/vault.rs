//! Authenticated encryption for env-var secrets at rest.
//!
//! The AES-256-GCM key is derived once at process start from the operator
//! secret via Argon2id and lives only in memory. Ciphertext records are
//! self-contained: `v1:<base64 nonce>:<base64 ciphertext||tag>`.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use argon2::Argon2;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use rand::RngCore;

use crate::errors::VaultError;

const RECORD_VERSION: &str = "v1";
const NONCE_LEN: usize = 12;

pub struct Vault {
    cipher: Aes256Gcm,
}

impl Vault {
    /// Derive the encryption key from the operator secret. Argon2id is
    /// deliberately slow; this runs once at startup.
    pub fn new(master_secret: &str, salt: &str) -> Result<Self, VaultError> {
        let mut key_bytes = [0u8; 32];
        Argon2::default()
            .hash_password_into(master_secret.as_bytes(), salt.as_bytes(), &mut key_bytes)
            .map_err(|e| VaultError::KeyDerivation(e.to_string()))?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
        key_bytes.fill(0);
        Ok(Self { cipher })
    }

    /// Encrypt a plaintext value into a self-contained ciphertext record.
    /// A fresh random nonce is drawn per call.
    pub fn seal(&self, plaintext: &str) -> Result<String, VaultError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let body = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| VaultError::Seal)?;
        Ok(format!(
            "{}:{}:{}",
            RECORD_VERSION,
            B64.encode(nonce_bytes),
            B64.encode(body)
        ))
    }

    /// Decrypt a ciphertext record produced by `seal`.
    ///
    /// Returns `Format` when the record does not parse into its three
    /// components and `Integrity` when the authentication tag does not
    /// verify. Both fail only this value; callers carry on.
    pub fn unseal(&self, record: &str) -> Result<String, VaultError> {
        let parts: Vec<&str> = record.split(':').collect();
        if parts.len() != 3 {
            return Err(VaultError::Format(format!(
                "expected 3 ':'-delimited parts, got {}",
                parts.len()
            )));
        }
        if parts[0] != RECORD_VERSION {
            return Err(VaultError::Format(format!(
                "unknown record version '{}'",
                parts[0]
            )));
        }
        let nonce_bytes = B64
            .decode(parts[1])
            .map_err(|e| VaultError::Format(format!("nonce is not valid base64: {}", e)))?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(VaultError::Format(format!(
                "nonce must be {} bytes, got {}",
                NONCE_LEN,
                nonce_bytes.len()
            )));
        }
        let body = B64
            .decode(parts[2])
            .map_err(|e| VaultError::Format(format!("body is not valid base64: {}", e)))?;

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), body.as_ref())
            .map_err(|_| VaultError::Integrity)?;
        String::from_utf8(plaintext)
            .map_err(|_| VaultError::Format("decrypted value is not valid UTF-8".into()))
    }
}
