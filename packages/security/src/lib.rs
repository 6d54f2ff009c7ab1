// ABOUTME: Encryption of OAuth token secrets at rest for Warden
// ABOUTME: Provides the deployment-wide AEAD cipher and its encrypted blob format

pub mod encryption;

// Re-export main types for convenience
pub use encryption::{EncryptedBlob, EncryptionError, KdfParams, TokenCipher, MIN_SECRET_LEN};
