//! In-process relay.
//!
//! Keeps envelopes per company and device in memory. Tests flip it offline
//! to simulate a lost connection or add latency to trigger timeouts.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

use super::transport::{OperationEnvelope, RelayTransport};
use crate::core_store::clock::VectorClock;
use crate::core_store::model::{CompanyId, DeviceId};
use crate::errors::{VaultError, VaultResult};

type DeviceLog = BTreeMap<u64, OperationEnvelope>;

pub struct MemoryRelay {
    logs: RwLock<BTreeMap<CompanyId, BTreeMap<DeviceId, DeviceLog>>>,
    online: AtomicBool,
    latency_ms: AtomicU64,
}

impl MemoryRelay {
    pub fn new() -> Self {
        MemoryRelay {
            logs: RwLock::new(BTreeMap::new()),
            online: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Delay applied to every call before it is served
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of envelopes held for a company
    pub async fn len(&self, company: &CompanyId) -> usize {
        let logs = self.logs.read().await;
        logs.get(company)
            .map_or(0, |devices| devices.values().map(|log| log.len()).sum())
    }

    async fn connect(&self) -> VaultResult<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if !self.is_online() {
            return Err(VaultError::Transport("relay unreachable".to_string()));
        }
        Ok(())
    }
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RelayTransport for MemoryRelay {
    async fn push_operations(
        &self,
        device: &DeviceId,
        company: &CompanyId,
        envelopes: Vec<OperationEnvelope>,
    ) -> VaultResult<()> {
        self.connect().await?;
        if let Some(stray) = envelopes
            .iter()
            .find(|e| &e.device != device || &e.company_id != company)
        {
            return Err(VaultError::Validation(format!(
                "device {} cannot push envelope {} for company {}",
                device,
                stray.op_id(),
                stray.company_id
            )));
        }

        let mut logs = self.logs.write().await;
        let log = logs
            .entry(company.clone())
            .or_default()
            .entry(device.clone())
            .or_default();
        let count = envelopes.len();
        for envelope in envelopes {
            log.entry(envelope.seq).or_insert(envelope);
        }
        debug!(device = %device, company = %company, count, "Relay stored envelopes");
        Ok(())
    }

    async fn pull_operations(
        &self,
        company: &CompanyId,
        since: &VectorClock,
        limit: usize,
    ) -> VaultResult<Vec<OperationEnvelope>> {
        self.connect().await?;
        let logs = self.logs.read().await;
        let Some(devices) = logs.get(company) else {
            return Ok(Vec::new());
        };
        Ok(devices
            .iter()
            .flat_map(|(device, log)| log.range(since.get(device) + 1..).map(|(_, e)| e.clone()))
            .take(limit)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(device: &str, seq: u64) -> OperationEnvelope {
        OperationEnvelope {
            device: DeviceId::new(device),
            seq,
            company_id: CompanyId::new("acme"),
            payload: vec![seq as u8],
        }
    }

    #[tokio::test]
    async fn test_pull_skips_seen_sequences() {
        let relay = MemoryRelay::new();
        let acme = CompanyId::new("acme");
        let laptop = DeviceId::new("laptop");
        let phone = DeviceId::new("phone");
        relay
            .push_operations(&laptop, &acme, vec![envelope("laptop", 1), envelope("laptop", 2)])
            .await
            .unwrap();
        relay
            .push_operations(&phone, &acme, vec![envelope("phone", 1)])
            .await
            .unwrap();
        // Re-push is harmless
        relay
            .push_operations(&laptop, &acme, vec![envelope("laptop", 2)])
            .await
            .unwrap();
        assert_eq!(relay.len(&acme).await, 3);

        let since = VectorClock::new().with(&laptop, 1);
        let pulled = relay.pull_operations(&acme, &since, 10).await.unwrap();
        let ids: Vec<_> = pulled.iter().map(|e| e.op_id().to_string()).collect();
        assert_eq!(ids, vec!["laptop#2", "phone#1"]);

        let other = relay
            .pull_operations(&CompanyId::new("globex"), &VectorClock::new(), 10)
            .await
            .unwrap();
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn test_pull_returns_at_most_limit() {
        let relay = MemoryRelay::new();
        let acme = CompanyId::new("acme");
        let laptop = DeviceId::new("laptop");
        let phone = DeviceId::new("phone");
        relay
            .push_operations(&laptop, &acme, (1..=3).map(|seq| envelope("laptop", seq)).collect())
            .await
            .unwrap();
        relay
            .push_operations(&phone, &acme, vec![envelope("phone", 1)])
            .await
            .unwrap();

        let first = relay.pull_operations(&acme, &VectorClock::new(), 2).await.unwrap();
        let ids: Vec<_> = first.iter().map(|e| e.op_id().to_string()).collect();
        assert_eq!(ids, vec!["laptop#1", "laptop#2"]);

        let since = VectorClock::new().with(&laptop, 2);
        let rest = relay.pull_operations(&acme, &since, 2).await.unwrap();
        let ids: Vec<_> = rest.iter().map(|e| e.op_id().to_string()).collect();
        assert_eq!(ids, vec!["laptop#3", "phone#1"]);

        let since = since.with(&laptop, 3).with(&phone, 1);
        assert!(relay.pull_operations(&acme, &since, 2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_offline_relay_fails_retryably() {
        let relay = MemoryRelay::new();
        relay.set_online(false);
        let err = relay
            .pull_operations(&CompanyId::new("acme"), &VectorClock::new(), 10)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_push_for_another_device_rejected() {
        let relay = MemoryRelay::new();
        let result = relay
            .push_operations(
                &DeviceId::new("phone"),
                &CompanyId::new("acme"),
                vec![envelope("laptop", 1)],
            )
            .await;
        assert!(matches!(result, Err(VaultError::Validation(_))));
    }
}
