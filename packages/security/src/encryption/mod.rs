// ABOUTME: Token secret encryption using AES-256-GCM AEAD
// ABOUTME: Derives the key from a single deployment secret with Argon2id
//
// SECURITY MODEL:
//
// - One symmetric key per deployment, derived from WARDEN_ENCRYPTION_KEY
// - Argon2id with a fixed application salt: the same secret always yields the
//   same key, so records survive restarts, but the raw secret is never a key
// - Every encryption draws a fresh 96-bit IV; the GCM tag authenticates the
//   ciphertext, so any modified byte fails decryption instead of returning
//   garbage

use argon2::{Argon2, ParamsBuilder, Version};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ring::{
    aead::{self, Aad, LessSafeKey, Nonce, UnboundKey},
    error::Unspecified,
    rand::{SecureRandom, SystemRandom},
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Application salt for key derivation (constant, not secret)
const APP_SALT: &[u8; 32] = b"warden-token-encryption-v1-2025!";

/// IV size for AES-256-GCM
const IV_SIZE: usize = 12;

/// Authentication tag size for AES-256-GCM
const TAG_SIZE: usize = 16;

/// Shortest deployment secret accepted
pub const MIN_SECRET_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum EncryptionError {
    #[error("Encryption secret is not configured (set {0})")]
    MissingSecret(String),

    #[error("Encryption secret must be at least 16 bytes")]
    WeakSecret,

    #[error("Failed to generate random data: {0}")]
    RandomGeneration(String),

    #[error("Failed to encrypt data: {0}")]
    Encryption(String),

    #[error("Failed to decrypt data: {0}")]
    Decryption(String),

    #[error("Failed to derive encryption key: {0}")]
    KeyDerivation(String),

    #[error("Invalid encrypted data format")]
    InvalidFormat,
}

impl From<Unspecified> for EncryptionError {
    fn from(_: Unspecified) -> Self {
        EncryptionError::Encryption("Cryptographic operation failed".to_string())
    }
}

/// Argon2id cost parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    /// Memory: 64 MB, Iterations: 3, Parallelism: 4
    fn default() -> Self {
        Self {
            memory_kib: 65536,
            iterations: 3,
            parallelism: 4,
        }
    }
}

/// Ciphertext, IV, and tag of one encrypted secret, each base64-encoded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedBlob {
    pub ciphertext: String,
    pub iv: String,
    pub auth_tag: String,
}

impl EncryptedBlob {
    /// Serialize for a single database column
    pub fn to_json(&self) -> Result<String, EncryptionError> {
        serde_json::to_string(self).map_err(|_| EncryptionError::InvalidFormat)
    }

    /// Parse the single-column form
    pub fn from_json(value: &str) -> Result<Self, EncryptionError> {
        serde_json::from_str(value).map_err(|_| EncryptionError::InvalidFormat)
    }
}

/// Encryption service for token secrets
pub struct TokenCipher {
    rng: SystemRandom,
    key: LessSafeKey,
}

impl fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCipher")
            .field("algorithm", &"AES-256-GCM")
            .finish_non_exhaustive()
    }
}

impl TokenCipher {
    /// Create the cipher from the secret stored in an environment variable
    pub fn from_env(var: &str) -> Result<Self, EncryptionError> {
        let secret = std::env::var(var)
            .ok()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| EncryptionError::MissingSecret(var.to_string()))?;
        Self::from_secret(&secret)
    }

    /// Create the cipher from a deployment secret with default Argon2 costs
    pub fn from_secret(secret: &str) -> Result<Self, EncryptionError> {
        Self::from_secret_with_params(secret, KdfParams::default())
    }

    /// Create the cipher from a deployment secret with explicit Argon2 costs
    pub fn from_secret_with_params(secret: &str, params: KdfParams) -> Result<Self, EncryptionError> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(EncryptionError::WeakSecret);
        }

        let key_bytes = derive_key(secret.as_bytes(), params)?;
        let unbound_key = UnboundKey::new(&aead::AES_256_GCM, &key_bytes)
            .map_err(|_| EncryptionError::KeyDerivation("Invalid key length".to_string()))?;

        Ok(Self {
            rng: SystemRandom::new(),
            key: LessSafeKey::new(unbound_key),
        })
    }

    /// Encrypt a secret with a fresh IV
    pub fn encrypt(&self, plaintext: &str) -> Result<EncryptedBlob, EncryptionError> {
        let mut iv = [0u8; IV_SIZE];
        self.rng.fill(&mut iv).map_err(|_| {
            EncryptionError::RandomGeneration("Failed to generate IV".to_string())
        })?;

        let nonce = Nonce::try_assume_unique_for_key(&iv)?;
        let mut in_out = plaintext.as_bytes().to_vec();

        let tag = self
            .key
            .seal_in_place_separate_tag(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| EncryptionError::Encryption("Seal operation failed".to_string()))?;

        Ok(EncryptedBlob {
            ciphertext: BASE64.encode(&in_out),
            iv: BASE64.encode(iv),
            auth_tag: BASE64.encode(tag.as_ref()),
        })
    }

    /// Decrypt a blob, failing on any tampering
    pub fn decrypt(&self, blob: &EncryptedBlob) -> Result<String, EncryptionError> {
        let iv = BASE64
            .decode(&blob.iv)
            .map_err(|_| EncryptionError::InvalidFormat)?;
        let tag = BASE64
            .decode(&blob.auth_tag)
            .map_err(|_| EncryptionError::InvalidFormat)?;
        let ciphertext = BASE64
            .decode(&blob.ciphertext)
            .map_err(|_| EncryptionError::InvalidFormat)?;

        if iv.len() != IV_SIZE || tag.len() != TAG_SIZE {
            return Err(EncryptionError::InvalidFormat);
        }

        let nonce = Nonce::try_assume_unique_for_key(&iv)
            .map_err(|_| EncryptionError::InvalidFormat)?;

        // ring expects ciphertext || tag
        let mut in_out = Vec::with_capacity(ciphertext.len() + TAG_SIZE);
        in_out.extend_from_slice(&ciphertext);
        in_out.extend_from_slice(&tag);

        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| EncryptionError::Decryption("Open operation failed".to_string()))?;

        String::from_utf8(plaintext.to_vec())
            .map_err(|_| EncryptionError::Decryption("Invalid UTF-8 in decrypted data".to_string()))
    }
}

fn derive_key(secret: &[u8], params: KdfParams) -> Result<[u8; 32], EncryptionError> {
    let argon_params = ParamsBuilder::new()
        .m_cost(params.memory_kib)
        .t_cost(params.iterations)
        .p_cost(params.parallelism)
        .output_len(32)
        .build()
        .map_err(|e| EncryptionError::KeyDerivation(format!("Invalid Argon2 params: {}", e)))?;

    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, Version::V0x13, argon_params);

    let mut key = [0u8; 32];
    argon2
        .hash_password_into(secret, APP_SALT, &mut key)
        .map_err(|e| EncryptionError::KeyDerivation(format!("Argon2 derivation failed: {}", e)))?;
    Ok(key)
}
