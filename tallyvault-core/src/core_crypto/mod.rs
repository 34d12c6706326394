//! Encryption Engine
//!
//! Field-level authenticated encryption for everything the vault persists
//! or transmits:
//!
//! - `aead`: self-describing [`EncryptedField`] values (ChaCha20-Poly1305 or
//!   AES-256-GCM, detached tags, fresh nonces)
//! - `field_cipher`: schema-checked sealing of typed values, bound to the
//!   field's location
//! - `rate_limit`: token-bucket pacing for bulk re-encryption

pub mod aead;
pub mod field_cipher;
pub mod rate_limit;

pub use aead::{decrypt, encrypt, Algorithm, EncryptedField};
pub use field_cipher::FieldCipher;
pub use rate_limit::{BatchLimitConfig, BatchLimiter};
