/*
    types.rs - Identifier and time types shared by every vault component

    Defines:
    - Wall-clock timestamps
    - IDs for companies, entities, devices, conflicts, keys and rotation jobs
    - Operation ids (device, seq) and entity references
*/

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::schema::EntityKind;
use crate::errors::{VaultError, VaultResult};

/// Unix timestamp in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Create a timestamp representing the current time
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Timestamp(millis)
    }

    /// Create a timestamp from milliseconds since epoch
    pub fn from_millis(millis: u64) -> Self {
        Timestamp(millis)
    }

    /// Get milliseconds since epoch
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Timestamp `duration` later, saturating
    pub fn plus(&self, duration: Duration) -> Self {
        Timestamp(self.0.saturating_add(duration.as_millis() as u64))
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Timestamp::now()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                $name(id.into())
            }

            /// Generate a new random id
            pub fn generate() -> Self {
                $name(uuid::Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                $name(s.to_string())
            }
        }
    };
}

string_id!(
    /// Tenant boundary; every table is partitioned by it
    CompanyId
);
string_id!(
    /// Unique identifier for an entity within a company
    EntityId
);
string_id!(
    /// Unique identifier for a device (one vault session per device)
    DeviceId
);
string_id!(
    /// Unique identifier for a conflict record
    ConflictId
);
string_id!(
    /// Identifier of a company data key
    KeyId
);
string_id!(
    /// Identifier of a key rotation job
    JobId
);

/// Partition reserved for vault-wide records (KDF parameters, passphrase verifier)
const SYSTEM_PARTITION: &str = "_system";

impl CompanyId {
    pub fn system() -> Self {
        CompanyId(SYSTEM_PARTITION.to_string())
    }

    /// Reject ids that are empty, too long, or collide with the system partition
    pub fn validate(&self) -> VaultResult<()> {
        if self.0.trim().is_empty() {
            return Err(VaultError::Validation("company id must not be empty".into()));
        }
        if self.0.len() > 128 {
            return Err(VaultError::Validation("company id is too long".into()));
        }
        if self.0.starts_with('_') {
            return Err(VaultError::Validation(format!(
                "company id '{}' uses the reserved '_' prefix",
                self.0
            )));
        }
        Ok(())
    }
}

impl DeviceId {
    pub fn validate(&self) -> VaultResult<()> {
        if self.0.is_empty() || self.0.contains(':') || self.0.contains('/') {
            return Err(VaultError::Validation(format!(
                "device id '{}' must be non-empty and contain no ':' or '/'",
                self.0
            )));
        }
        Ok(())
    }
}

/// Operation identifier: the author device and its per-company sequence number
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpId {
    pub device: DeviceId,
    pub seq: u64,
}

impl OpId {
    pub fn new(device: DeviceId, seq: u64) -> Self {
        OpId { device, seq }
    }

    /// Storage key; zero padding keeps one device's ops in sequence order
    pub fn storage_key(&self) -> String {
        format!("{}:{:020}", self.device, self.seq)
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.device, self.seq)
    }
}

/// Fully qualified reference to an entity
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub company_id: CompanyId,
    pub kind: EntityKind,
    pub entity_id: EntityId,
}

impl EntityRef {
    pub fn new(company_id: CompanyId, kind: EntityKind, entity_id: EntityId) -> Self {
        EntityRef {
            company_id,
            kind,
            entity_id,
        }
    }

    /// Key within the company's entity table
    pub fn storage_key(&self) -> String {
        format!("{}/{}", self.kind.as_str(), self.entity_id)
    }

    /// Inverse of [`EntityRef::storage_key`]
    pub fn from_storage_key(company_id: &CompanyId, key: &str) -> VaultResult<Self> {
        let (kind, id) = key
            .split_once('/')
            .ok_or_else(|| VaultError::Validation(format!("malformed entity key '{}'", key)))?;
        Ok(EntityRef {
            company_id: company_id.clone(),
            kind: EntityKind::parse(kind)?,
            entity_id: EntityId::new(id),
        })
    }

    pub fn validate(&self) -> VaultResult<()> {
        self.company_id.validate()?;
        if self.entity_id.0.is_empty() {
            return Err(VaultError::Validation("entity id must not be empty".into()));
        }
        Ok(())
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.company_id, self.kind.as_str(), self.entity_id)
    }
}
