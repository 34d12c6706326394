/*
    entry.rs - Audit log entries

    Each entry stores an encrypted event payload plus the plaintext metadata
    needed to check the hash chain without any key:
    - seq: position in the company's chain, starting at 1
    - prev_hash / hash: BLAKE3 link to the predecessor
    - recorded_at / retain_until: retention window
*/

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core_crypto::EncryptedField;
use crate::core_store::model::{CompanyId, ConflictId, DeviceId, EntityRef, JobId, KeyId, OpId, Timestamp};
use crate::errors::VaultResult;

/// Predecessor hash of the first entry
pub const GENESIS_HASH: [u8; 32] = [0u8; 32];

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditAction {
    FieldWritten,
    EntityDeleted,
    RemoteMerged,
    ConflictResolved,
    KeyProvisioned,
    KeyRotationStarted,
    KeyRotationCompleted,
    KeyRotationRolledBack,
    KeysPurged,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::FieldWritten => "field_written",
            AuditAction::EntityDeleted => "entity_deleted",
            AuditAction::RemoteMerged => "remote_merged",
            AuditAction::ConflictResolved => "conflict_resolved",
            AuditAction::KeyProvisioned => "key_provisioned",
            AuditAction::KeyRotationStarted => "key_rotation_started",
            AuditAction::KeyRotationCompleted => "key_rotation_completed",
            AuditAction::KeyRotationRolledBack => "key_rotation_rolled_back",
            AuditAction::KeysPurged => "keys_purged",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decrypted audit payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub actor: DeviceId,
    pub action: AuditAction,
    pub entity: Option<EntityRef>,
    pub field: Option<String>,
    pub op_id: Option<OpId>,
    pub conflict_id: Option<ConflictId>,
    pub key_id: Option<KeyId>,
    pub job_id: Option<JobId>,
    pub detail: Option<String>,
}

impl AuditEvent {
    pub fn new(actor: DeviceId, action: AuditAction) -> Self {
        AuditEvent {
            actor,
            action,
            entity: None,
            field: None,
            op_id: None,
            conflict_id: None,
            key_id: None,
            job_id: None,
            detail: None,
        }
    }

    pub fn entity(mut self, entity: EntityRef) -> Self {
        self.entity = Some(entity);
        self
    }

    pub fn field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn op(mut self, op_id: OpId) -> Self {
        self.op_id = Some(op_id);
        self
    }

    pub fn conflict(mut self, conflict_id: ConflictId) -> Self {
        self.conflict_id = Some(conflict_id);
        self
    }

    pub fn key(mut self, key_id: KeyId) -> Self {
        self.key_id = Some(key_id);
        self
    }

    pub fn job(mut self, job_id: JobId) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn to_bytes(&self) -> VaultResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> VaultResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Stored, chained entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub company_id: CompanyId,
    pub seq: u64,
    pub recorded_at: Timestamp,
    pub retain_until: Timestamp,
    pub payload: EncryptedField,
    pub prev_hash: [u8; 32],
    pub hash: [u8; 32],
}

impl AuditLogEntry {
    /// Storage key: zero-padded so key order is chain order
    pub fn storage_key(seq: u64) -> String {
        format!("{:020}", seq)
    }

    /// Hash over the entry's content and its predecessor's hash
    pub fn compute_hash(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.company_id.as_str().as_bytes());
        hasher.update(&[0]);
        hasher.update(&self.seq.to_be_bytes());
        hasher.update(&self.recorded_at.as_millis().to_be_bytes());
        hasher.update(&self.retain_until.as_millis().to_be_bytes());
        hasher.update(&[self.payload.algorithm_version]);
        hasher.update(self.payload.key_id.as_str().as_bytes());
        hasher.update(&[0]);
        hasher.update(&self.payload.nonce);
        hasher.update(&self.payload.auth_tag);
        hasher.update(&self.payload.ciphertext);
        hasher.update(&self.prev_hash);
        *hasher.finalize().as_bytes()
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }
}

/// Latest entry of a company's chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditHead {
    pub seq: u64,
    pub hash: [u8; 32],
}

impl Default for AuditHead {
    fn default() -> Self {
        AuditHead {
            seq: 0,
            hash: GENESIS_HASH,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> AuditLogEntry {
        let mut entry = AuditLogEntry {
            company_id: CompanyId::new("acme"),
            seq: 1,
            recorded_at: Timestamp::from_millis(1_000),
            retain_until: Timestamp::from_millis(2_000),
            payload: EncryptedField {
                ciphertext: vec![7; 24],
                nonce: vec![1; 12],
                auth_tag: vec![2; 16],
                key_id: KeyId::new("k1"),
                algorithm_version: 1,
            },
            prev_hash: GENESIS_HASH,
            hash: [0; 32],
        };
        entry.hash = entry.compute_hash();
        entry
    }

    #[test]
    fn test_hash_covers_payload_and_link() {
        let original = entry();

        let mut flipped = original.clone();
        flipped.payload.ciphertext[0] ^= 1;
        assert_ne!(flipped.compute_hash(), original.hash);

        let mut relinked = original.clone();
        relinked.prev_hash[31] = 1;
        assert_ne!(relinked.compute_hash(), original.hash);

        let mut moved = original.clone();
        moved.seq = 2;
        assert_ne!(moved.compute_hash(), original.hash);
    }

    #[test]
    fn test_storage_key_sorts_numerically() {
        assert!(AuditLogEntry::storage_key(9) < AuditLogEntry::storage_key(10));
    }

    #[test]
    fn test_event_builder() {
        let event = AuditEvent::new(DeviceId::new("laptop"), AuditAction::FieldWritten)
            .field("memo")
            .detail("imported");
        assert_eq!(event.field.as_deref(), Some("memo"));
        assert_eq!(AuditEvent::from_bytes(&event.to_bytes().unwrap()).unwrap(), event);
    }
}
