//! Relay boundary.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core_store::clock::VectorClock;
use crate::core_store::model::{CompanyId, DeviceId, OpId};
use crate::core_store::oplog::OperationLogEntry;
use crate::errors::{VaultError, VaultResult};

/// An op as the relay sees it: routing fields plus opaque bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationEnvelope {
    pub device: DeviceId,
    pub seq: u64,
    pub company_id: CompanyId,
    pub payload: Vec<u8>,
}

impl OperationEnvelope {
    pub fn seal(op: &OperationLogEntry) -> VaultResult<Self> {
        Ok(OperationEnvelope {
            device: op.op_id.device.clone(),
            seq: op.op_id.seq,
            company_id: op.entity.company_id.clone(),
            payload: op.to_bytes()?,
        })
    }

    pub fn op_id(&self) -> OpId {
        OpId::new(self.device.clone(), self.seq)
    }

    /// Decode the payload and check it against the routing fields
    pub fn open(&self) -> VaultResult<OperationLogEntry> {
        let op = OperationLogEntry::from_bytes(&self.payload)?;
        if op.op_id != self.op_id() || op.entity.company_id != self.company_id {
            return Err(VaultError::Validation(format!(
                "envelope {} does not match its payload ({} in {})",
                self.op_id(),
                op.op_id,
                op.entity.company_id
            )));
        }
        Ok(op)
    }
}

/// Carries envelopes between devices without being able to read them
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Store a device's envelopes. Re-pushing an envelope is harmless.
    async fn push_operations(
        &self,
        device: &DeviceId,
        company: &CompanyId,
        envelopes: Vec<OperationEnvelope>,
    ) -> VaultResult<()>;

    /// Up to `limit` envelopes of the company the caller has not seen
    /// according to `since`, ordered by device then sequence. Fewer than
    /// `limit` means nothing else is pending.
    async fn pull_operations(
        &self,
        company: &CompanyId,
        since: &VectorClock,
        limit: usize,
    ) -> VaultResult<Vec<OperationEnvelope>>;
}
