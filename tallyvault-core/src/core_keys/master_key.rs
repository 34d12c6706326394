//! Master key derivation and data-key wrapping.
//!
//! The master key is derived from the user's passphrase with Argon2id and
//! only ever lives in memory. It never encrypts records directly: for each
//! (company, key id) pair an HKDF-SHA256 wrapping key is derived from it and
//! used to seal that data key with ChaCha20-Poly1305.

use argon2::Argon2;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{ZeroizeOnDrop, Zeroizing};

use super::passphrase::validate_passphrase;
use crate::core_store::model::{CompanyId, KeyId};
use crate::errors::{VaultError, VaultResult};

/// Length of master and data keys in bytes (256 bits)
pub const KEY_LENGTH: usize = 32;

const SALT_LENGTH: usize = 16;
const NONCE_LENGTH: usize = 12;

/// Memory floor for production parameters (8 MiB)
pub const MIN_MEMORY_KIB: u32 = 8 * 1024;

const WRAP_SALT: &[u8] = b"tallyvault-key-wrap-v1";
const VERIFIER_INFO: &[u8] = b"tallyvault-passphrase-verifier-v1";
const VERIFIER_PLAINTEXT: &[u8] = b"tallyvault unlocked";

/// Argon2id parameters needed to re-derive the master key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub salt: Vec<u8>,
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl KdfParams {
    /// Fresh parameters with a random salt
    pub fn generate(memory_kib: u32, iterations: u32, parallelism: u32) -> Self {
        let salt: [u8; SALT_LENGTH] = rand::random();
        KdfParams {
            salt: salt.to_vec(),
            memory_kib,
            iterations,
            parallelism,
        }
    }

    /// Check the cost parameters. `allow_weak` lifts the memory floor for tests.
    pub fn validate(&self, allow_weak: bool) -> VaultResult<()> {
        if self.salt.len() < SALT_LENGTH {
            return Err(VaultError::Validation(format!(
                "KDF salt must be at least {} bytes",
                SALT_LENGTH
            )));
        }
        if self.iterations == 0 {
            return Err(VaultError::Validation("KDF iterations must be at least 1".into()));
        }
        if self.parallelism == 0 {
            return Err(VaultError::Validation("KDF parallelism must be at least 1".into()));
        }
        if !allow_weak && self.memory_kib < MIN_MEMORY_KIB {
            return Err(VaultError::Validation(format!(
                "KDF memory must be at least {} KiB (got {})",
                MIN_MEMORY_KIB, self.memory_kib
            )));
        }
        Ok(())
    }
}

/// In-memory master key, zeroized on drop
#[derive(ZeroizeOnDrop)]
pub struct MasterKey {
    key: [u8; KEY_LENGTH],
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Data key sealed under a wrapping key; the ciphertext carries the tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

/// Proof that a passphrase derives this vault's master key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassphraseVerifier {
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

/// Derive the master key from a passphrase.
///
/// The passphrase must pass [`validate_passphrase`]; callers validate the
/// cost parameters against their own policy first.
pub fn derive_master_key(passphrase: &str, params: &KdfParams) -> VaultResult<MasterKey> {
    validate_passphrase(passphrase)?;

    let argon_params = argon2::Params::new(
        params.memory_kib,
        params.iterations,
        params.parallelism,
        Some(KEY_LENGTH),
    )
    .map_err(|e| VaultError::Validation(format!("invalid Argon2 parameters: {}", e)))?;
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, argon_params);

    let mut key = [0u8; KEY_LENGTH];
    argon2
        .hash_password_into(passphrase.as_bytes(), &params.salt, &mut key)
        .map_err(|e| VaultError::Validation(format!("key derivation failed: {}", e)))?;

    Ok(MasterKey { key })
}

impl MasterKey {
    fn derive(&self, info: &[u8]) -> VaultResult<Zeroizing<[u8; KEY_LENGTH]>> {
        let hk = Hkdf::<Sha256>::new(Some(WRAP_SALT), &self.key);
        let mut okm = Zeroizing::new([0u8; KEY_LENGTH]);
        hk.expand(info, &mut okm[..])
            .map_err(|_| VaultError::Validation("HKDF output length".into()))?;
        Ok(okm)
    }

    fn wrapping_cipher(&self, company: &CompanyId, key_id: &KeyId) -> VaultResult<ChaCha20Poly1305> {
        let info = wrap_context(company, key_id);
        let wrapping_key = self.derive(&info)?;
        ChaCha20Poly1305::new_from_slice(&wrapping_key[..])
            .map_err(|_| VaultError::Validation("wrapping key length".into()))
    }

    /// Seal raw data-key material for storage
    pub fn wrap(
        &self,
        company: &CompanyId,
        key_id: &KeyId,
        material: &[u8; KEY_LENGTH],
    ) -> VaultResult<WrappedKey> {
        let cipher = self.wrapping_cipher(company, key_id)?;
        let nonce: [u8; NONCE_LENGTH] = rand::random();
        let aad = wrap_context(company, key_id);
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: material,
                    aad: &aad,
                },
            )
            .map_err(|_| VaultError::Validation("key wrapping failed".into()))?;
        Ok(WrappedKey {
            nonce: nonce.to_vec(),
            ciphertext,
        })
    }

    /// Open a wrapped data key. A failed tag means the record was tampered
    /// with or belongs to another company or key id.
    pub fn unwrap(
        &self,
        company: &CompanyId,
        key_id: &KeyId,
        wrapped: &WrappedKey,
    ) -> VaultResult<Zeroizing<[u8; KEY_LENGTH]>> {
        if wrapped.nonce.len() != NONCE_LENGTH {
            return Err(VaultError::Integrity(format!(
                "wrapped key {} has a malformed nonce",
                key_id
            )));
        }
        let cipher = self.wrapping_cipher(company, key_id)?;
        let aad = wrap_context(company, key_id);
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(
                    Nonce::from_slice(&wrapped.nonce),
                    Payload {
                        msg: &wrapped.ciphertext,
                        aad: &aad,
                    },
                )
                .map_err(|_| {
                    VaultError::Integrity(format!(
                        "wrapped key {} for company {} failed authentication",
                        key_id, company
                    ))
                })?,
        );
        if plaintext.len() != KEY_LENGTH {
            return Err(VaultError::Integrity(format!(
                "wrapped key {} has the wrong length",
                key_id
            )));
        }
        let mut material = Zeroizing::new([0u8; KEY_LENGTH]);
        material.copy_from_slice(&plaintext);
        Ok(material)
    }

    pub fn verifier(&self) -> VaultResult<PassphraseVerifier> {
        let key = self.derive(VERIFIER_INFO)?;
        let cipher = ChaCha20Poly1305::new_from_slice(&key[..])
            .map_err(|_| VaultError::Validation("verifier key length".into()))?;
        let nonce: [u8; NONCE_LENGTH] = rand::random();
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), VERIFIER_PLAINTEXT)
            .map_err(|_| VaultError::Validation("verifier sealing failed".into()))?;
        Ok(PassphraseVerifier {
            nonce: nonce.to_vec(),
            ciphertext,
        })
    }

    pub fn check_verifier(&self, verifier: &PassphraseVerifier) -> VaultResult<()> {
        if verifier.nonce.len() != NONCE_LENGTH {
            return Err(VaultError::Integrity("passphrase verifier is malformed".into()));
        }
        let key = self.derive(VERIFIER_INFO)?;
        let cipher = ChaCha20Poly1305::new_from_slice(&key[..])
            .map_err(|_| VaultError::Validation("verifier key length".into()))?;
        match cipher.decrypt(Nonce::from_slice(&verifier.nonce), verifier.ciphertext.as_slice()) {
            Ok(plaintext) if plaintext == VERIFIER_PLAINTEXT => Ok(()),
            _ => Err(VaultError::Integrity(
                "passphrase does not unlock this vault".into(),
            )),
        }
    }
}

fn wrap_context(company: &CompanyId, key_id: &KeyId) -> Vec<u8> {
    format!("tallyvault:wrap:v1|{}|{}", company, key_id).into_bytes()
}
