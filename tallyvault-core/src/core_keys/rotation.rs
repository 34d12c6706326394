/*
    rotation.rs - Resumable data key rotation

    A rotation job moves every entity of a company from the old key to a new
    one (or back, when rolled back). Progress is checkpointed per entity:
    the re-encrypted entity and the advanced cursor commit in one batch, so a
    crash at any point resumes from the cursor without re-encrypting twice.

    Only one job per company may be in flight. The guard is a row in the
    RotationLocks table claimed with insert-if-absent in the same batch that
    creates the pending key and the job.
*/

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use super::data_key::{DataKey, KeyStatus};
use super::session::KeySession;
use crate::core_audit::{AuditAction, AuditEvent, AuditTrail};
use crate::core_crypto::{BatchLimiter, FieldCipher};
use crate::core_store::model::{CompanyId, DeviceId, EntityRef, JobId, KeyId, Timestamp};
use crate::core_store::store::{LocalStore, ScanRange, Table, WriteBatch};
use crate::errors::{handle_poison, VaultError, VaultResult};

/// Key of the guard row in `Table::RotationLocks`
pub const ROTATION_LOCK_KEY: &str = "rotation";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RotationStatus {
    Pending,
    InProgress,
    Completed,
    RolledBack,
}

impl RotationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RotationStatus::Pending => "pending",
            RotationStatus::InProgress => "in_progress",
            RotationStatus::Completed => "completed",
            RotationStatus::RolledBack => "rolled_back",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RotationStatus::Completed | RotationStatus::RolledBack)
    }
}

impl fmt::Display for RotationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RotationDirection {
    /// Old key to new key
    Forward,
    /// New key back to old key
    Rollback,
}

/// Persisted rotation checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRotationJob {
    pub job_id: JobId,
    pub company_id: CompanyId,
    pub old_key_id: KeyId,
    pub new_key_id: KeyId,
    pub status: RotationStatus,
    /// Storage key of the last entity handled in the current direction
    pub cursor: Option<String>,
    pub direction: RotationDirection,
    pub entities_processed: u64,
    pub entities_reencrypted: u64,
    pub fields_reencrypted: u64,
    pub started_at: Timestamp,
    pub finished_at: Option<Timestamp>,
}

impl KeyRotationJob {
    pub fn new(company_id: CompanyId, old_key_id: KeyId, new_key_id: KeyId, now: Timestamp) -> Self {
        KeyRotationJob {
            job_id: JobId::generate(),
            company_id,
            old_key_id,
            new_key_id,
            status: RotationStatus::Pending,
            cursor: None,
            direction: RotationDirection::Forward,
            entities_processed: 0,
            entities_reencrypted: 0,
            fields_reencrypted: 0,
            started_at: now,
            finished_at: None,
        }
    }

    /// Key every entity must end up under in the current direction
    pub fn target_key(&self) -> &KeyId {
        match self.direction {
            RotationDirection::Forward => &self.new_key_id,
            RotationDirection::Rollback => &self.old_key_id,
        }
    }
}

/// Cooperative stop signal for a running job.
///
/// Checked only between entities; an entity is never left half-processed.
#[derive(Debug, Default)]
pub struct RotationControl {
    cancelled: AtomicBool,
    max_steps: Option<u64>,
}

impl RotationControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop after `steps` entities in this run, leaving the job resumable
    pub fn stop_after(steps: u64) -> Self {
        RotationControl {
            cancelled: AtomicBool::new(false),
            max_steps: Some(steps),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn should_stop(&self, steps: u64) -> bool {
        self.is_cancelled() || self.max_steps.map_or(false, |max| steps >= max)
    }
}

/// What one call to [`RotationRunner::run`] did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationReport {
    pub job: KeyRotationJob,
    pub entities_visited: u64,
    pub entities_reencrypted: u64,
    pub fields_reencrypted: u64,
    /// The job reached a terminal state during or before this run
    pub finished: bool,
}

impl RotationReport {
    fn new(job: KeyRotationJob) -> Self {
        RotationReport {
            finished: job.status.is_terminal(),
            job,
            entities_visited: 0,
            entities_reencrypted: 0,
            fields_reencrypted: 0,
        }
    }
}

/// Drives rotation jobs for one vault
pub struct RotationRunner {
    store: Arc<LocalStore>,
    keys: Arc<KeySession>,
    audit: Arc<AuditTrail>,
    cipher: FieldCipher,
    limiter: Arc<BatchLimiter>,
    write_lock: Arc<Mutex<()>>,
    actor: DeviceId,
    page_size: usize,
}

impl RotationRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<LocalStore>,
        keys: Arc<KeySession>,
        audit: Arc<AuditTrail>,
        cipher: FieldCipher,
        limiter: Arc<BatchLimiter>,
        write_lock: Arc<Mutex<()>>,
        actor: DeviceId,
        page_size: usize,
    ) -> Self {
        RotationRunner {
            store,
            keys,
            audit,
            cipher,
            limiter,
            write_lock,
            actor,
            page_size: page_size.max(1),
        }
    }

    pub fn job(&self, company: &CompanyId, job_id: &JobId) -> VaultResult<KeyRotationJob> {
        self.store
            .get_record(Table::RotationJobs, company, job_id.as_str())?
            .ok_or_else(|| VaultError::NotFound(format!("rotation job {} in company {}", job_id, company)))
    }

    fn stage_job(&self, batch: &mut WriteBatch, job: &KeyRotationJob) -> VaultResult<()> {
        self.store
            .stage_put(batch, Table::RotationJobs, &job.company_id, job.job_id.as_str(), job)
    }

    fn in_progress_error(&self, company: &CompanyId) -> VaultResult<VaultError> {
        let job_id = self
            .store
            .get_record::<JobId>(Table::RotationLocks, company, ROTATION_LOCK_KEY)?
            .map(|id| id.to_string())
            .unwrap_or_default();
        Ok(VaultError::RotationInProgress {
            company_id: company.to_string(),
            job_id,
        })
    }

    /// Create a pending key and a job, claiming the company's rotation guard
    pub fn start(&self, company: &CompanyId) -> VaultResult<KeyRotationJob> {
        let _guard = self.write_lock.lock().map_err(handle_poison)?;

        if self.keys.in_flight_job(company)?.is_some() {
            return Err(self.in_progress_error(company)?);
        }
        let active = self.keys.active_record(company)?;
        let active_key = self.keys.data_key(company, &active.key_id)?;
        let (pending, _) = self.keys.generate_key(company, KeyStatus::Pending)?;
        let now = self.keys.now();
        let job = KeyRotationJob::new(company.clone(), active.key_id.clone(), pending.key_id.clone(), now);

        let mut batch = WriteBatch::new();
        self.store
            .stage_insert(&mut batch, Table::RotationLocks, company, ROTATION_LOCK_KEY, &job.job_id)?;
        self.store
            .stage_put(&mut batch, Table::Keys, company, pending.key_id.as_str(), &pending)?;
        self.stage_job(&mut batch, &job)?;
        let event = AuditEvent::new(self.actor.clone(), AuditAction::KeyRotationStarted)
            .job(job.job_id.clone())
            .key(pending.key_id.clone());
        self.audit.stage(&mut batch, company, &event, &active_key, now)?;

        match self.store.commit(batch) {
            Ok(()) => {}
            Err(VaultError::AlreadyExists(_)) => return Err(self.in_progress_error(company)?),
            Err(e) => return Err(e),
        }

        info!(
            company = %company,
            job_id = %job.job_id,
            old_key = %job.old_key_id,
            new_key = %job.new_key_id,
            "Key rotation started"
        );
        Ok(job)
    }

    /// Switch an unfinished job to the rollback direction
    pub fn begin_rollback(&self, company: &CompanyId, job_id: &JobId) -> VaultResult<KeyRotationJob> {
        let _guard = self.write_lock.lock().map_err(handle_poison)?;
        let mut job = self.job(company, job_id)?;
        if job.status.is_terminal() {
            return Err(VaultError::InvalidTransition {
                from: job.status.to_string(),
                to: RotationStatus::RolledBack.to_string(),
            });
        }
        if job.direction == RotationDirection::Rollback {
            return Ok(job);
        }

        job.direction = RotationDirection::Rollback;
        job.status = RotationStatus::InProgress;
        job.cursor = None;
        job.entities_processed = 0;
        let mut batch = WriteBatch::new();
        self.stage_job(&mut batch, &job)?;
        self.store.commit(batch)?;

        warn!(company = %company, job_id = %job_id, "Key rotation rolling back");
        Ok(job)
    }

    /// Walk the remaining entities, then finalize the job.
    ///
    /// Returns early, leaving the job resumable, when `control` says stop.
    pub async fn run(
        &self,
        company: &CompanyId,
        job_id: &JobId,
        control: &RotationControl,
    ) -> VaultResult<RotationReport> {
        let mut job = self.job(company, job_id)?;
        if job.status.is_terminal() {
            return Ok(RotationReport::new(job));
        }
        if job.status == RotationStatus::Pending {
            job = self.mark_in_progress(&job)?;
        }

        let target = self.keys.data_key(company, job.target_key())?;
        let mut report = RotationReport::new(job.clone());
        info!(
            company = %company,
            job_id = %job_id,
            direction = ?job.direction,
            cursor = ?job.cursor,
            "Running key rotation"
        );

        loop {
            let range = ScanRange::new(self.page_size).after_opt(job.cursor.clone());
            let page = self.store.scan_raw(Table::Entities, company, &range)?;
            if page.is_empty() {
                break;
            }

            for (key, _) in page {
                if control.should_stop(report.entities_visited) {
                    info!(
                        company = %company,
                        job_id = %job_id,
                        processed = job.entities_processed,
                        "Key rotation paused"
                    );
                    report.job = job;
                    return Ok(report);
                }

                let resealed = self.step(&mut job, &key, &target)?;
                report.entities_visited += 1;
                if resealed > 0 {
                    report.entities_reencrypted += 1;
                    report.fields_reencrypted += resealed;
                    crate::metrics::record_counter("rotation.entities", 1);
                    self.limiter.acquire(resealed.min(u32::MAX as u64) as u32).await;
                }
            }
        }

        job = self.finalize(&job)?;
        report.job = job;
        report.finished = true;
        Ok(report)
    }

    fn mark_in_progress(&self, job: &KeyRotationJob) -> VaultResult<KeyRotationJob> {
        let _guard = self.write_lock.lock().map_err(handle_poison)?;
        let mut current = self.job(&job.company_id, &job.job_id)?;
        if current.status == RotationStatus::Pending {
            current.status = RotationStatus::InProgress;
            let mut batch = WriteBatch::new();
            self.stage_job(&mut batch, &current)?;
            self.store.commit(batch)?;
        }
        Ok(current)
    }

    /// Re-read the job under the write lock and make sure nobody redirected it
    fn current_job(&self, job: &KeyRotationJob) -> VaultResult<KeyRotationJob> {
        let current = self.job(&job.company_id, &job.job_id)?;
        if current.status.is_terminal() || current.direction != job.direction {
            return Err(VaultError::Cancelled(format!(
                "rotation job {} changed while running",
                job.job_id
            )));
        }
        Ok(current)
    }

    /// Re-encrypt one entity and advance the cursor past it, atomically.
    /// Returns the number of values re-sealed.
    fn step(&self, job: &mut KeyRotationJob, entity_key: &str, target: &DataKey) -> VaultResult<u64> {
        let _guard = self.write_lock.lock().map_err(handle_poison)?;
        let mut updated = self.current_job(job)?;
        let company = updated.company_id.clone();
        let entity_ref = EntityRef::from_storage_key(&company, entity_key)?;

        let mut batch = WriteBatch::new();
        let mut resealed = 0u64;
        if let Some(mut entity) = self.store.get_entity(&entity_ref)? {
            for (field, state) in entity.fields.iter_mut() {
                for head in state.heads.iter_mut() {
                    if &head.value.key_id == target.key_id() {
                        continue;
                    }
                    let source = self.keys.data_key(&company, &head.value.key_id)?;
                    head.value = self
                        .cipher
                        .reseal(&entity_ref, field, &head.value, &source, target)?;
                    resealed += 1;
                }
            }
            if resealed > 0 {
                self.store.stage_entity(&mut batch, &entity)?;
                updated.entities_reencrypted += 1;
            }
        }

        updated.cursor = Some(entity_key.to_string());
        updated.entities_processed += 1;
        updated.fields_reencrypted += resealed;
        self.stage_job(&mut batch, &updated)?;
        self.store.commit(batch)?;

        debug!(entity = %entity_ref, resealed, "Rotation step committed");
        *job = updated;
        Ok(resealed)
    }

    fn finalize(&self, job: &KeyRotationJob) -> VaultResult<KeyRotationJob> {
        let _guard = self.write_lock.lock().map_err(handle_poison)?;
        let mut job = self.current_job(job)?;
        let company = job.company_id.clone();
        let now = self.keys.now();

        let missing = |key_id: &KeyId| VaultError::KeyNotFound(format!("{} (company {})", key_id, company));
        let mut old_record = self
            .keys
            .key_record(&company, &job.old_key_id)?
            .ok_or_else(|| missing(&job.old_key_id))?;
        let mut new_record = self
            .keys
            .key_record(&company, &job.new_key_id)?
            .ok_or_else(|| missing(&job.new_key_id))?;

        let (event, audit_key) = match job.direction {
            RotationDirection::Forward => {
                let audit_key = self.keys.data_key(&company, &job.new_key_id)?;
                new_record.status = KeyStatus::Active;
                old_record.status = KeyStatus::Retired {
                    retired_at: now,
                    expires_at: now.plus(self.keys.grace_period()),
                };
                job.status = RotationStatus::Completed;
                (AuditAction::KeyRotationCompleted, audit_key)
            }
            RotationDirection::Rollback => {
                let audit_key = self.keys.data_key(&company, &job.old_key_id)?;
                new_record.destroy(now);
                job.status = RotationStatus::RolledBack;
                (AuditAction::KeyRotationRolledBack, audit_key)
            }
        };
        job.finished_at = Some(now);

        let mut batch = WriteBatch::new();
        self.stage_job(&mut batch, &job)?;
        self.store
            .stage_put(&mut batch, Table::Keys, &company, old_record.key_id.as_str(), &old_record)?;
        self.store
            .stage_put(&mut batch, Table::Keys, &company, new_record.key_id.as_str(), &new_record)?;
        batch.delete(Table::RotationLocks, &company, ROTATION_LOCK_KEY);
        let audit_event = AuditEvent::new(self.actor.clone(), event)
            .job(job.job_id.clone())
            .key(job.target_key().clone())
            .detail(format!(
                "{} entities, {} fields re-encrypted",
                job.entities_reencrypted, job.fields_reencrypted
            ));
        self.audit.stage(&mut batch, &company, &audit_event, &audit_key, now)?;
        self.store.commit(batch)?;

        self.keys.invalidate(&company, &job.old_key_id)?;
        self.keys.invalidate(&company, &job.new_key_id)?;
        if job.status == RotationStatus::Completed {
            crate::metrics::record_counter("rotation.jobs.completed", 1);
        }
        info!(
            company = %company,
            job_id = %job.job_id,
            status = %job.status,
            entities = job.entities_processed,
            fields = job.fields_reencrypted,
            "Key rotation finished"
        );
        Ok(job)
    }
}
