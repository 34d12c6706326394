/*
    engine.rs - Push/pull exchange between a vault and a relay

    Progress lives in the store, not in memory:
    - pushed_through: highest own sequence the relay acknowledged
    - received: per device, the highest sequence applied without gaps

    Outbound entries are never queued separately: "own ops above
    pushed_through" is the queue, so nothing is lost across restarts. A timed
    out exchange leaves the local log untouched and is retried with backoff.
*/

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::backoff::ExponentialBackoff;
use super::transport::{OperationEnvelope, RelayTransport};
use crate::config::SyncConfig;
use crate::core_store::clock::VectorClock;
use crate::core_store::model::{CompanyId, DeviceId, OpId};
use crate::core_store::store::{Table, WriteBatch};
use crate::errors::{VaultError, VaultResult};
use crate::metrics::{record_counter, Timer};
use crate::vault::{ApplyReport, RejectedOp, Vault};

const CHECKPOINT_KEY: &str = "sync_checkpoint";

/// Persisted sync progress for one company
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    pub pushed_through: u64,
    pub received: VectorClock,
}

/// Outcome of one push/pull round
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub pushed: usize,
    pub pulled: usize,
    pub applied: ApplyReport,
}

pub struct SyncEngine {
    vault: Arc<Vault>,
    transport: Arc<dyn RelayTransport>,
    config: SyncConfig,
    backoff: ExponentialBackoff,
}

impl SyncEngine {
    pub fn new(vault: Arc<Vault>, transport: Arc<dyn RelayTransport>) -> Self {
        let config = vault.config().sync.clone();
        SyncEngine {
            backoff: ExponentialBackoff::from_config(&config),
            vault,
            transport,
            config,
        }
    }

    pub fn checkpoint(&self, company: &CompanyId) -> VaultResult<SyncCheckpoint> {
        Ok(self
            .vault
            .store()
            .get_record(Table::Meta, company, CHECKPOINT_KEY)?
            .unwrap_or_default())
    }

    fn save_checkpoint(&self, company: &CompanyId, checkpoint: &SyncCheckpoint) -> VaultResult<()> {
        let store = self.vault.store();
        let mut batch = WriteBatch::new();
        store.stage_put(&mut batch, Table::Meta, company, CHECKPOINT_KEY, checkpoint)?;
        store.commit(batch)
    }

    /// Push, then pull
    pub async fn sync_once(&self, company: &CompanyId) -> VaultResult<SyncReport> {
        let pushed = self.push(company).await?;
        let (pulled, applied) = self.pull(company).await?;
        info!(
            device = %self.vault.device_id(),
            company = %company,
            pushed,
            pulled,
            conflicts = applied.conflicts.len(),
            rejected = applied.rejected.len(),
            "Sync round complete"
        );
        Ok(SyncReport {
            pushed,
            pulled,
            applied,
        })
    }

    /// Send own ops the relay has not acknowledged, `batch_size` at a time.
    /// The checkpoint advances after each acknowledged batch.
    pub async fn push(&self, company: &CompanyId) -> VaultResult<usize> {
        let mut checkpoint = self.checkpoint(company)?;
        let device = self.vault.device_id().clone();
        let mut pushed = 0;
        loop {
            let ops = self
                .vault
                .outbound_operations(company, checkpoint.pushed_through, self.config.batch_size)?;
            let Some(last) = ops.last().map(|op| op.op_id.seq) else {
                break;
            };
            let envelopes = ops
                .iter()
                .map(OperationEnvelope::seal)
                .collect::<VaultResult<Vec<_>>>()?;
            let count = envelopes.len();

            self.exchange("push", || {
                let transport = self.transport.clone();
                let device = device.clone();
                let company = company.clone();
                let envelopes = envelopes.clone();
                async move { transport.push_operations(&device, &company, envelopes).await }
            })
            .await?;

            checkpoint.pushed_through = last;
            self.save_checkpoint(company, &checkpoint)?;
            pushed += count;
            debug!(company = %company, through = last, count, "Pushed operations");
        }
        record_counter("sync.push.entries", pushed as u64);
        Ok(pushed)
    }

    /// Fetch unseen envelopes `batch_size` at a time and merge each batch.
    /// Envelopes whose payload does not decode or match its routing fields
    /// are reported as rejected. The checkpoint advances after each batch.
    pub async fn pull(&self, company: &CompanyId) -> VaultResult<(usize, ApplyReport)> {
        let mut checkpoint = self.checkpoint(company)?;
        let local_seq = self.vault.local_seq(company)?;
        let limit = self.config.batch_size;
        // Moves past rejected envelopes too, so one round always ends
        let mut since = checkpoint
            .received
            .clone()
            .with(self.vault.device_id(), local_seq);
        let mut pulled = 0;
        let mut report = ApplyReport::default();

        loop {
            let envelopes = self
                .exchange("pull", || {
                    let transport = self.transport.clone();
                    let company = company.clone();
                    let since = since.clone();
                    async move { transport.pull_operations(&company, &since, limit).await }
                })
                .await?;
            if envelopes.is_empty() {
                break;
            }
            let fetched = envelopes.len();

            let mut rejected = Vec::new();
            let mut ops = Vec::with_capacity(fetched);
            for envelope in &envelopes {
                since.observe(&envelope.device, envelope.seq);
                match envelope.open() {
                    Ok(op) => ops.push(op),
                    Err(e) => {
                        warn!(op = %envelope.op_id(), error = %e, "Discarding undecodable envelope");
                        rejected.push(RejectedOp {
                            op_id: envelope.op_id(),
                            reason: e.to_string(),
                        });
                    }
                }
            }
            // Hybrid clocks respect causality, so this order applies causes first
            ops.sort_by(|a, b| (a.hlc, &a.op_id).cmp(&(b.hlc, &b.op_id)));
            let count = ops.len();

            let mut batch = self.vault.apply_remote_operations(ops)?;
            batch.rejected.extend(rejected);
            report.absorb(batch);

            let devices: BTreeSet<&DeviceId> = envelopes.iter().map(|e| &e.device).collect();
            for device in devices {
                let contiguous = self.contiguous_seq(company, device, checkpoint.received.get(device))?;
                checkpoint.received.observe(device, contiguous);
            }
            self.save_checkpoint(company, &checkpoint)?;
            pulled += count;
            debug!(company = %company, fetched, applied = count, "Pulled operations");

            if fetched < limit {
                break;
            }
        }

        record_counter("sync.pull.entries", pulled as u64);
        Ok((pulled, report))
    }

    /// Highest sequence from `device` stored without gaps, starting at `from`.
    /// Rejected ops leave a gap so they are fetched again next round.
    fn contiguous_seq(&self, company: &CompanyId, device: &DeviceId, from: u64) -> VaultResult<u64> {
        let store = self.vault.store();
        let mut seq = from;
        while store.has_op(company, &OpId::new(device.clone(), seq + 1))? {
            seq += 1;
        }
        Ok(seq)
    }

    /// One relay call bounded by the configured timeout, retried with backoff
    async fn exchange<T, F, Fut>(&self, what: &'static str, mut call: F) -> VaultResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = VaultResult<T>>,
    {
        let limit = self.config.timeout;
        let timer = Timer::new("sync.exchange.duration_ms");
        let result = self
            .backoff
            .retry(what, || {
                let attempt = call();
                async move {
                    timeout(limit, attempt)
                        .await
                        .unwrap_or_else(|_| Err(VaultError::SyncTimeout(limit)))
                }
            })
            .await;
        timer.stop();
        result
    }

    /// Sync every `interval` until a shutdown signal arrives. Failed rounds
    /// are logged and retried on the next tick.
    pub async fn run(&self, companies: Vec<CompanyId>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            device = %self.vault.device_id(),
            companies = companies.len(),
            interval = ?self.config.interval,
            "Sync loop started"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!(device = %self.vault.device_id(), "Sync loop stopping");
                    break;
                }
                _ = ticker.tick() => {
                    for company in &companies {
                        match self.sync_once(company).await {
                            Ok(_) => {}
                            Err(e) if e.is_retryable() => {
                                warn!(company = %company, error = %e, "Sync round failed, will retry");
                            }
                            Err(e) => {
                                error!(company = %company, error = %e, "Sync round failed");
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_store::model::FieldValue;
    use crate::core_sync::MemoryRelay;
    use crate::test_utils::{acme, assert_converged, paired_vaults, transaction};
    use std::time::Duration;

    fn engines(relay: &Arc<MemoryRelay>, devices: &[&str]) -> (Vec<Arc<Vault>>, Vec<SyncEngine>) {
        let vaults = paired_vaults(devices, &acme()).unwrap();
        let engines = vaults
            .iter()
            .map(|v| SyncEngine::new(v.clone(), relay.clone()))
            .collect();
        (vaults, engines)
    }

    #[tokio::test]
    async fn test_offline_edits_merge_after_reconnect() {
        let relay = Arc::new(MemoryRelay::new());
        let (vaults, engines) = engines(&relay, &["laptop", "phone"]);
        let tx = transaction("tx-1");
        vaults[0].mutate_field(&tx, "description", FieldValue::text("Coffee")).unwrap();
        engines[0].sync_once(&acme()).await.unwrap();
        engines[1].sync_once(&acme()).await.unwrap();

        relay.set_online(false);
        vaults[0].mutate_field(&tx, "memo", FieldValue::text("client meeting")).unwrap();
        vaults[1]
            .mutate_field(&tx, "amount", FieldValue::money(-450, "USD"))
            .unwrap();
        let err = engines[0].sync_once(&acme()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(engines[0].checkpoint(&acme()).unwrap().pushed_through, 1);

        relay.set_online(true);
        let pushed = engines[0].sync_once(&acme()).await.unwrap();
        assert_eq!(pushed.pushed, 1);
        let phone = engines[1].sync_once(&acme()).await.unwrap();
        assert_eq!(phone.pulled, 1);
        assert!(phone.applied.conflicts.is_empty());
        engines[0].sync_once(&acme()).await.unwrap();

        assert_converged(&vaults, &tx);
        let snapshot = vaults[0].get_entity(&tx).unwrap();
        assert_eq!(snapshot.value("memo"), Some(&FieldValue::text("client meeting")));
        assert_eq!(snapshot.value("amount"), Some(&FieldValue::money(-450, "USD")));
        assert!(snapshot.open_conflict.is_none());
    }

    #[tokio::test]
    async fn test_timeout_leaves_local_log_untouched() {
        let relay = Arc::new(MemoryRelay::new());
        let (vaults, engines) = engines(&relay, &["laptop"]);
        vaults[0]
            .mutate_field(&transaction("tx-1"), "memo", FieldValue::text("slow"))
            .unwrap();

        relay.set_latency(vaults[0].config().sync.timeout + Duration::from_millis(200));
        let err = engines[0].push(&acme()).await.unwrap_err();
        assert!(matches!(err, VaultError::SyncTimeout(_)));
        assert_eq!(vaults[0].local_seq(&acme()).unwrap(), 1);
        assert_eq!(engines[0].checkpoint(&acme()).unwrap(), SyncCheckpoint::default());

        relay.set_latency(Duration::ZERO);
        assert_eq!(engines[0].push(&acme()).await.unwrap(), 1);
        assert_eq!(relay.len(&acme()).await, 1);
    }

    #[tokio::test]
    async fn test_second_round_is_a_no_op() {
        let relay = Arc::new(MemoryRelay::new());
        let (vaults, engines) = engines(&relay, &["laptop", "phone"]);
        for i in 0..5 {
            vaults[0]
                .mutate_field(&transaction(&format!("tx-{}", i)), "memo", FieldValue::text("x"))
                .unwrap();
        }
        // batch_size is smaller than the backlog
        assert_eq!(engines[0].sync_once(&acme()).await.unwrap().pushed, 5);
        assert_eq!(engines[1].sync_once(&acme()).await.unwrap().pulled, 5);

        let again = engines[1].sync_once(&acme()).await.unwrap();
        assert_eq!((again.pushed, again.pulled), (0, 0));
        let checkpoint = engines[1].checkpoint(&acme()).unwrap();
        assert_eq!(checkpoint.received.get(&DeviceId::new("laptop")), 5);
    }

    #[tokio::test]
    async fn test_undecodable_envelope_is_rejected_and_refetched() {
        let relay = Arc::new(MemoryRelay::new());
        let (_vaults, engines) = engines(&relay, &["laptop"]);
        let mallory = DeviceId::new("mallory");
        relay
            .push_operations(
                &mallory,
                &acme(),
                vec![OperationEnvelope {
                    device: mallory.clone(),
                    seq: 1,
                    company_id: acme(),
                    payload: vec![1, 2, 3],
                }],
            )
            .await
            .unwrap();

        let report = engines[0].sync_once(&acme()).await.unwrap();
        assert_eq!(report.pulled, 0);
        assert_eq!(report.applied.rejected.len(), 1);
        assert_eq!(report.applied.rejected[0].op_id, OpId::new(mallory.clone(), 1));
        assert_eq!(engines[0].checkpoint(&acme()).unwrap().received.get(&mallory), 0);
    }

    #[tokio::test]
    async fn test_pull_pages_past_rejected_envelopes() {
        let relay = Arc::new(MemoryRelay::new());
        let (vaults, engines) = engines(&relay, &["laptop", "phone"]);
        for i in 0..3 {
            vaults[0]
                .mutate_field(&transaction(&format!("tx-{}", i)), "memo", FieldValue::text("x"))
                .unwrap();
        }
        engines[0].push(&acme()).await.unwrap();
        let mallory = DeviceId::new("mallory");
        relay
            .push_operations(
                &mallory,
                &acme(),
                vec![OperationEnvelope {
                    device: mallory.clone(),
                    seq: 1,
                    company_id: acme(),
                    payload: vec![9, 9],
                }],
            )
            .await
            .unwrap();

        // batch_size 2: laptop#1..2, then laptop#3 with mallory#1, then nothing
        let (pulled, report) = engines[1].pull(&acme()).await.unwrap();
        assert_eq!(pulled, 3);
        assert_eq!(report.applied, 3);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].op_id, OpId::new(mallory.clone(), 1));

        let checkpoint = engines[1].checkpoint(&acme()).unwrap();
        assert_eq!(checkpoint.received.get(&DeviceId::new("laptop")), 3);
        assert_eq!(checkpoint.received.get(&mallory), 0);
        for i in 0..3 {
            let snapshot = vaults[1].get_entity(&transaction(&format!("tx-{}", i))).unwrap();
            assert_eq!(snapshot.value("memo"), Some(&FieldValue::text("x")));
        }

        let (pulled, report) = engines[1].pull(&acme()).await.unwrap();
        assert_eq!(pulled, 0);
        assert_eq!(report.rejected.len(), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let relay = Arc::new(MemoryRelay::new());
        let (vaults, mut engines) = engines(&relay, &["laptop"]);
        vaults[0]
            .mutate_field(&transaction("tx-1"), "memo", FieldValue::text("loop"))
            .unwrap();
        let engine = Arc::new(engines.remove(0));
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn({
            let engine = engine.clone();
            async move { engine.run(vec![acme()], rx).await }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(relay.len(&acme()).await, 1);
    }
}
