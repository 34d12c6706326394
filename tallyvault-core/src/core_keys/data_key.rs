//! Per-company data keys and their persisted records.

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroizing;

use super::master_key::{WrappedKey, KEY_LENGTH};
use crate::core_store::model::{CompanyId, KeyId, Timestamp};

/// Lifecycle state of a data key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyStatus {
    /// Introduced by a rotation that has not completed yet
    Pending,
    /// The company's current key; exactly one per company
    Active,
    /// Escrowed after rotation: decrypt-only until `expires_at`
    Retired {
        retired_at: Timestamp,
        expires_at: Timestamp,
    },
    /// Wrapped material erased
    Destroyed { destroyed_at: Timestamp },
}

impl KeyStatus {
    pub fn name(&self) -> &'static str {
        match self {
            KeyStatus::Pending => "pending",
            KeyStatus::Active => "active",
            KeyStatus::Retired { .. } => "retired",
            KeyStatus::Destroyed { .. } => "destroyed",
        }
    }

    /// Whether new ciphertext may be produced under this key
    pub fn can_encrypt(&self) -> bool {
        matches!(self, KeyStatus::Pending | KeyStatus::Active)
    }

    /// Whether existing ciphertext may still be opened at `now`
    pub fn can_decrypt(&self, now: Timestamp) -> bool {
        match self {
            KeyStatus::Pending | KeyStatus::Active => true,
            KeyStatus::Retired { expires_at, .. } => now < *expires_at,
            KeyStatus::Destroyed { .. } => false,
        }
    }
}

/// Persisted form of a data key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRecord {
    pub key_id: KeyId,
    pub company_id: CompanyId,
    pub status: KeyStatus,
    /// `None` once destroyed
    pub wrapped: Option<WrappedKey>,
    pub created_at: Timestamp,
}

impl KeyRecord {
    /// Erase the wrapped material irrecoverably
    pub fn destroy(&mut self, now: Timestamp) {
        self.wrapped = None;
        self.status = KeyStatus::Destroyed { destroyed_at: now };
    }
}

/// Unwrapped data key held in the session cache
pub struct DataKey {
    key_id: KeyId,
    company_id: CompanyId,
    status: KeyStatus,
    material: Zeroizing<[u8; KEY_LENGTH]>,
}

impl DataKey {
    pub(crate) fn new(
        key_id: KeyId,
        company_id: CompanyId,
        status: KeyStatus,
        material: Zeroizing<[u8; KEY_LENGTH]>,
    ) -> Self {
        DataKey {
            key_id,
            company_id,
            status,
            material,
        }
    }

    pub fn key_id(&self) -> &KeyId {
        &self.key_id
    }

    pub fn company_id(&self) -> &CompanyId {
        &self.company_id
    }

    pub fn status(&self) -> KeyStatus {
        self.status
    }

    pub fn can_encrypt(&self) -> bool {
        self.status.can_encrypt()
    }

    pub(crate) fn material(&self) -> &[u8; KEY_LENGTH] {
        &self.material
    }
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataKey")
            .field("key_id", &self.key_id)
            .field("company_id", &self.company_id)
            .field("status", &self.status)
            .field("material", &"[REDACTED]")
            .finish()
    }
}
