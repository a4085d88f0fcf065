use std::path::Path;

use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};

use pulse_core::EventRecord;

use crate::error::StoreError;

const NONCE_LEN: usize = 12;

/// Encoding applied to records at rest. The queue never looks inside the
/// encoded string, so swapping codecs does not touch queue logic.
pub trait RecordCodec: Send + Sync {
    fn encode(&self, record: &EventRecord) -> Result<String, StoreError>;

    /// Decode one stored body. Implementations must tolerate bodies written
    /// by an earlier codec (plaintext rows written before encryption was
    /// turned on still have to drain).
    fn decode(&self, body: &str) -> Result<EventRecord, StoreError>;
}

/// Plain JSON at rest.
#[derive(Clone, Copy, Debug, Default)]
pub struct PlainCodec;

impl RecordCodec for PlainCodec {
    fn encode(&self, record: &EventRecord) -> Result<String, StoreError> {
        Ok(serde_json::to_string(record)?)
    }

    fn decode(&self, body: &str) -> Result<EventRecord, StoreError> {
        serde_json::from_str(body).map_err(|e| StoreError::Decode(e.to_string()))
    }
}

/// ChaCha20-Poly1305 at rest. Encoded form is base64(nonce || ciphertext).
/// Decode tries decryption first and falls back to a raw JSON parse.
#[derive(Clone)]
pub struct CipherCodec {
    key: [u8; 32],
}

impl std::fmt::Debug for CipherCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CipherCodec([REDACTED])")
    }
}

impl CipherCodec {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    fn encrypt(&self, plaintext: &str) -> Result<String, StoreError> {
        let cipher = ChaCha20Poly1305::new(&self.key.into());
        let mut nonce_bytes = [0u8; NONCE_LEN];
        chacha20poly1305::aead::rand_core::RngCore::fill_bytes(&mut OsRng, &mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| StoreError::Cipher("encryption failed".into()))?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            &combined,
        ))
    }

    fn decrypt(&self, encoded: &str) -> Result<String, StoreError> {
        let combined =
            base64::Engine::decode(&base64::engine::general_purpose::STANDARD, encoded)
                .map_err(|_| StoreError::Cipher("invalid encoding".into()))?;

        if combined.len() < NONCE_LEN {
            return Err(StoreError::Cipher("truncated ciphertext".into()));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let cipher = ChaCha20Poly1305::new(&self.key.into());

        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| StoreError::Cipher("decryption failed".into()))?;

        String::from_utf8(plaintext).map_err(|_| StoreError::Cipher("invalid UTF-8".into()))
    }
}

impl RecordCodec for CipherCodec {
    fn encode(&self, record: &EventRecord) -> Result<String, StoreError> {
        self.encrypt(&serde_json::to_string(record)?)
    }

    fn decode(&self, body: &str) -> Result<EventRecord, StoreError> {
        match self.decrypt(body) {
            Ok(plaintext) => {
                serde_json::from_str(&plaintext).map_err(|e| StoreError::Decode(e.to_string()))
            }
            // Pre-encryption rows are plain JSON.
            Err(_) => serde_json::from_str(body).map_err(|e| StoreError::Decode(e.to_string())),
        }
    }
}

/// Generate a random 256-bit key.
pub fn generate_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    chacha20poly1305::aead::rand_core::RngCore::fill_bytes(&mut OsRng, &mut key);
    key
}

/// Load or create the at-rest key file.
pub fn load_or_create_key(path: &Path) -> Result<[u8; 32], StoreError> {
    if path.exists() {
        let encoded =
            std::fs::read_to_string(path).map_err(|e| StoreError::Io(e.to_string()))?;
        let bytes = base64::Engine::decode(
            &base64::engine::general_purpose::STANDARD,
            encoded.trim(),
        )
        .map_err(|_| StoreError::Cipher("invalid key encoding".into()))?;
        if bytes.len() != 32 {
            return Err(StoreError::Cipher("invalid key length".into()));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        Ok(key)
    } else {
        let key = generate_key();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io(e.to_string()))?;
        }
        let encoded = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, key);
        std::fs::write(path, &encoded).map_err(|e| StoreError::Io(e.to_string()))?;

        // Set file permissions to 0600 on Unix
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| StoreError::Io(e.to_string()))?;
        }

        Ok(key)
    }
}
