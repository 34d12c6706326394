/*
    trail.rs - Append, verify and query a company's audit chain

    Appends are staged into the caller's WriteBatch together with the
    mutation they describe, so a mutation and its audit entry commit or fail
    as one unit. Callers must hold the vault write lock while staging: the
    chain head is read, extended and written back within the same batch.
*/

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use super::entry::{AuditAction, AuditEvent, AuditHead, AuditLogEntry, GENESIS_HASH};
use crate::core_crypto::{aead, Algorithm};
use crate::core_keys::{DataKey, KeySession};
use crate::core_store::model::{CompanyId, DeviceId, EntityRef, Timestamp};
use crate::core_store::store::{LocalStore, Page, PageRequest, ScanRange, Table, WriteBatch};
use crate::errors::{VaultError, VaultResult};

const HEAD_KEY: &str = "audit_head";

/// Minimum retention for audit entries: seven years
pub const MIN_RETENTION: Duration = Duration::from_secs(7 * 365 * 24 * 60 * 60 + 2 * 24 * 60 * 60);

/// Result of walking a company's chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainVerification {
    pub entries_checked: u64,
    pub intact: bool,
    pub first_broken_seq: Option<u64>,
    pub reason: Option<String>,
}

impl ChainVerification {
    fn broken(entries_checked: u64, seq: u64, reason: impl Into<String>) -> Self {
        ChainVerification {
            entries_checked,
            intact: false,
            first_broken_seq: Some(seq),
            reason: Some(reason.into()),
        }
    }
}

/// Audit query filter; every criterion is optional
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub actor: Option<DeviceId>,
    pub action: Option<AuditAction>,
    pub entity: Option<EntityRef>,
    pub from: Option<Timestamp>,
    pub until: Option<Timestamp>,
    pub page: PageRequest,
}

impl AuditFilter {
    fn needs_payload(&self) -> bool {
        self.actor.is_some() || self.action.is_some() || self.entity.is_some()
    }

    fn matches_time(&self, recorded_at: Timestamp) -> bool {
        self.from.map_or(true, |from| recorded_at >= from)
            && self.until.map_or(true, |until| recorded_at < until)
    }

    fn matches_event(&self, event: &AuditEvent) -> bool {
        self.actor.as_ref().map_or(true, |a| &event.actor == a)
            && self.action.map_or(true, |a| event.action == a)
            && self
                .entity
                .as_ref()
                .map_or(true, |e| event.entity.as_ref() == Some(e))
    }
}

/// An entry as returned by queries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    pub seq: u64,
    pub recorded_at: Timestamp,
    pub retain_until: Timestamp,
    pub hash: String,
    /// `None` when the payload key is past its grace period
    pub event: Option<AuditEvent>,
}

pub struct AuditTrail {
    store: Arc<LocalStore>,
    retention: Duration,
    algorithm: Algorithm,
}

impl AuditTrail {
    /// Retention below [`MIN_RETENTION`] is raised to it
    pub fn new(store: Arc<LocalStore>, retention: Duration, algorithm: Algorithm) -> Self {
        AuditTrail {
            store,
            retention: retention.max(MIN_RETENTION),
            algorithm,
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    fn payload_aad(company: &CompanyId, seq: u64) -> Vec<u8> {
        format!("tallyvault:audit:v1|{}|{}", company, seq).into_bytes()
    }

    pub fn head(&self, company: &CompanyId) -> VaultResult<AuditHead> {
        Ok(self
            .store
            .get_record(Table::Meta, company, HEAD_KEY)?
            .unwrap_or_default())
    }

    /// Stage the next chained entry for `event`. At most one entry may be
    /// staged per batch.
    pub fn stage(
        &self,
        batch: &mut WriteBatch,
        company: &CompanyId,
        event: &AuditEvent,
        key: &DataKey,
        now: Timestamp,
    ) -> VaultResult<AuditLogEntry> {
        if batch.count(Table::AuditLog) > 0 {
            return Err(VaultError::Validation(
                "a batch may carry only one audit entry".into(),
            ));
        }
        let head = self.head(company)?;
        let seq = head.seq + 1;
        let payload = aead::encrypt(
            &event.to_bytes()?,
            key,
            &Self::payload_aad(company, seq),
            self.algorithm,
        )?;

        let mut entry = AuditLogEntry {
            company_id: company.clone(),
            seq,
            recorded_at: now,
            retain_until: now.plus(self.retention),
            payload,
            prev_hash: head.hash,
            hash: GENESIS_HASH,
        };
        entry.hash = entry.compute_hash();

        self.store.stage_insert(
            batch,
            Table::AuditLog,
            company,
            AuditLogEntry::storage_key(seq),
            &entry,
        )?;
        self.store.stage_put(
            batch,
            Table::Meta,
            company,
            HEAD_KEY,
            &AuditHead {
                seq,
                hash: entry.hash,
            },
        )?;
        crate::metrics::record_counter("audit.entries", 1);
        debug!(company = %company, seq, action = %event.action, "Staged audit entry");
        Ok(entry)
    }

    /// Recompute the chain without decrypting anything
    pub fn verify_chain(&self, company: &CompanyId) -> VaultResult<ChainVerification> {
        let page_size = self.store.limits().max_page_size.max(1);
        let mut expected_prev = GENESIS_HASH;
        let mut expected_seq = 1u64;
        let mut checked = 0u64;
        let mut after: Option<String> = None;

        loop {
            let range = ScanRange::new(page_size).after_opt(after.clone());
            let page = self.store.scan_raw(Table::AuditLog, company, &range)?;
            let done = page.len() < page_size;

            for (key, bytes) in &page {
                after = Some(key.clone());
                let entry: AuditLogEntry = match bincode::deserialize(bytes) {
                    Ok(entry) => entry,
                    Err(_) => {
                        return Ok(self.report_broken(company, checked, expected_seq, "entry does not decode"));
                    }
                };
                if entry.seq != expected_seq || key != &AuditLogEntry::storage_key(entry.seq) {
                    return Ok(self.report_broken(company, checked, expected_seq, "sequence gap or reordering"));
                }
                if entry.company_id != *company {
                    return Ok(self.report_broken(company, checked, entry.seq, "entry belongs to another company"));
                }
                if entry.prev_hash != expected_prev {
                    return Ok(self.report_broken(company, checked, entry.seq, "predecessor hash mismatch"));
                }
                if entry.compute_hash() != entry.hash {
                    return Ok(self.report_broken(company, checked, entry.seq, "entry hash mismatch"));
                }
                expected_prev = entry.hash;
                expected_seq += 1;
                checked += 1;
            }

            if done {
                break;
            }
        }

        let head = self.head(company)?;
        if head.seq != checked || head.hash != expected_prev {
            return Ok(self.report_broken(company, checked, checked + 1, "chain is shorter than its head"));
        }

        info!(company = %company, entries = checked, "Audit chain verified");
        Ok(ChainVerification {
            entries_checked: checked,
            intact: true,
            first_broken_seq: None,
            reason: None,
        })
    }

    fn report_broken(&self, company: &CompanyId, checked: u64, seq: u64, reason: &str) -> ChainVerification {
        error!(company = %company, seq, reason, "Audit chain broken");
        crate::metrics::record_integrity_failure();
        ChainVerification::broken(checked, seq, reason)
    }

    /// Filtered, paged read of a company's entries. The page cursor walks
    /// entries, so a page may hold fewer matches than its limit.
    pub fn query(
        &self,
        company: &CompanyId,
        filter: &AuditFilter,
        keys: &KeySession,
    ) -> VaultResult<Page<AuditRecord>> {
        let page = self
            .store
            .page_records::<AuditLogEntry>(Table::AuditLog, company, None, &filter.page)?;

        let mut items = Vec::new();
        for (_, entry) in page.items {
            if !filter.matches_time(entry.recorded_at) {
                continue;
            }
            let event = self.open(company, &entry, keys)?;
            if filter.needs_payload() {
                match &event {
                    Some(event) if filter.matches_event(event) => {}
                    _ => continue,
                }
            }
            items.push(AuditRecord {
                seq: entry.seq,
                recorded_at: entry.recorded_at,
                retain_until: entry.retain_until,
                hash: entry.hash_hex(),
                event,
            });
        }

        Ok(Page {
            items,
            next_cursor: page.next_cursor,
        })
    }

    fn open(
        &self,
        company: &CompanyId,
        entry: &AuditLogEntry,
        keys: &KeySession,
    ) -> VaultResult<Option<AuditEvent>> {
        let key = match keys.data_key(company, &entry.payload.key_id) {
            Ok(key) => key,
            Err(VaultError::KeyNotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let plaintext = aead::decrypt(&entry.payload, &key, &Self::payload_aad(company, entry.seq))?;
        Ok(Some(AuditEvent::from_bytes(&plaintext)?))
    }
}
