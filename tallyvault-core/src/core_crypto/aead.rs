/*
    aead.rs - Authenticated encryption of single values

    Produces self-describing EncryptedField values:
    - Fresh random nonce per call (192-bit for XChaCha20-Poly1305)
    - Detached authentication tag
    - Key id and algorithm version recorded alongside the ciphertext

    Both the key id and the algorithm version are folded into the associated
    data, so relabelling a ciphertext fails authentication.
*/

use aes_gcm::Aes256Gcm;
use chacha20poly1305::aead::generic_array::GenericArray;
use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::XChaCha20Poly1305;
use serde::{Deserialize, Serialize};
use tracing::error;
use zeroize::Zeroizing;

use crate::core_keys::DataKey;
use crate::core_store::model::KeyId;
use crate::errors::{VaultError, VaultResult};

pub const XCHACHA_NONCE_LENGTH: usize = 24;
pub const GCM_NONCE_LENGTH: usize = 12;
pub const TAG_LENGTH: usize = 16;

/// Supported AEAD algorithms, identified on the wire by version number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Algorithm {
    #[default]
    XChaCha20Poly1305,
    Aes256Gcm,
}

impl Algorithm {
    pub fn version(&self) -> u8 {
        match self {
            Algorithm::XChaCha20Poly1305 => 1,
            Algorithm::Aes256Gcm => 2,
        }
    }

    pub fn nonce_len(&self) -> usize {
        match self {
            Algorithm::XChaCha20Poly1305 => XCHACHA_NONCE_LENGTH,
            Algorithm::Aes256Gcm => GCM_NONCE_LENGTH,
        }
    }

    fn random_nonce(&self) -> Vec<u8> {
        let mut nonce = vec![0u8; self.nonce_len()];
        rand::fill(&mut nonce[..]);
        nonce
    }

    pub fn from_version(version: u8) -> VaultResult<Self> {
        match version {
            1 => Ok(Algorithm::XChaCha20Poly1305),
            2 => Ok(Algorithm::Aes256Gcm),
            other => Err(VaultError::Validation(format!(
                "unsupported algorithm version {}",
                other
            ))),
        }
    }
}

/// Ciphertext of one value plus everything needed to open it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedField {
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
    pub auth_tag: Vec<u8>,
    pub key_id: KeyId,
    pub algorithm_version: u8,
}

impl EncryptedField {
    pub fn algorithm(&self) -> VaultResult<Algorithm> {
        Algorithm::from_version(self.algorithm_version)
    }

    /// Bytes stored for this field, used for quota accounting
    pub fn encoded_len(&self) -> usize {
        self.ciphertext.len() + self.nonce.len() + self.auth_tag.len() + self.key_id.0.len() + 1
    }
}

fn full_aad(aad: &[u8], key_id: &KeyId, version: u8) -> Vec<u8> {
    let mut full = Vec::with_capacity(aad.len() + key_id.0.len() + 2);
    full.extend_from_slice(aad);
    full.push(0);
    full.extend_from_slice(key_id.0.as_bytes());
    full.push(version);
    full
}

fn seal_with<C: AeadInPlace + KeyInit>(
    key: &[u8],
    nonce: &[u8],
    aad: &[u8],
    buffer: &mut Vec<u8>,
) -> VaultResult<Vec<u8>> {
    let cipher = C::new_from_slice(key)
        .map_err(|_| VaultError::Validation("invalid data key length".into()))?;
    let tag = cipher
        .encrypt_in_place_detached(GenericArray::from_slice(nonce), aad, buffer)
        .map_err(|_| VaultError::Validation("encryption failed".into()))?;
    Ok(tag.to_vec())
}

fn open_with<C: AeadInPlace + KeyInit>(
    key: &[u8],
    nonce: &[u8],
    aad: &[u8],
    buffer: &mut Vec<u8>,
    tag: &[u8],
) -> Result<(), ()> {
    let cipher = C::new_from_slice(key).map_err(|_| ())?;
    cipher
        .decrypt_in_place_detached(
            GenericArray::from_slice(nonce),
            aad,
            buffer,
            GenericArray::from_slice(tag),
        )
        .map_err(|_| ())
}

/// Encrypt `plaintext` under `key`.
///
/// Fails with `KeyRetired` if the key may no longer produce ciphertext.
pub fn encrypt(
    plaintext: &[u8],
    key: &DataKey,
    aad: &[u8],
    algorithm: Algorithm,
) -> VaultResult<EncryptedField> {
    if !key.can_encrypt() {
        return Err(VaultError::KeyRetired(key.key_id().to_string()));
    }

    let nonce = algorithm.random_nonce();
    let version = algorithm.version();
    let aad = full_aad(aad, key.key_id(), version);
    let mut buffer = plaintext.to_vec();
    let tag = match algorithm {
        Algorithm::XChaCha20Poly1305 => {
            seal_with::<XChaCha20Poly1305>(key.material(), &nonce, &aad, &mut buffer)?
        }
        Algorithm::Aes256Gcm => seal_with::<Aes256Gcm>(key.material(), &nonce, &aad, &mut buffer)?,
    };

    Ok(EncryptedField {
        ciphertext: buffer,
        nonce,
        auth_tag: tag,
        key_id: key.key_id().clone(),
        algorithm_version: version,
    })
}

/// Decrypt a field. The tag is verified before any plaintext is released.
pub fn decrypt(field: &EncryptedField, key: &DataKey, aad: &[u8]) -> VaultResult<Zeroizing<Vec<u8>>> {
    if &field.key_id != key.key_id() {
        return Err(VaultError::Validation(format!(
            "field is encrypted under key {}, not {}",
            field.key_id,
            key.key_id()
        )));
    }
    let algorithm = field.algorithm()?;
    if field.nonce.len() != algorithm.nonce_len() || field.auth_tag.len() != TAG_LENGTH {
        return Err(integrity_failure(&field.key_id, "malformed nonce or tag"));
    }

    let aad = full_aad(aad, &field.key_id, field.algorithm_version);
    let mut buffer = Zeroizing::new(field.ciphertext.clone());
    let opened = match algorithm {
        Algorithm::XChaCha20Poly1305 => open_with::<XChaCha20Poly1305>(
            key.material(),
            &field.nonce,
            &aad,
            &mut buffer,
            &field.auth_tag,
        ),
        Algorithm::Aes256Gcm => open_with::<Aes256Gcm>(
            key.material(),
            &field.nonce,
            &aad,
            &mut buffer,
            &field.auth_tag,
        ),
    };

    match opened {
        Ok(()) => Ok(buffer),
        Err(()) => Err(integrity_failure(&field.key_id, "authentication tag mismatch")),
    }
}

fn integrity_failure(key_id: &KeyId, reason: &str) -> VaultError {
    error!(key_id = %key_id, reason, "Field failed authentication");
    crate::metrics::record_integrity_failure();
    VaultError::Integrity(format!("field under key {}: {}", key_id, reason))
}
