//! Key rotation entry points.

use tracing::info;

use super::Vault;
use crate::core_keys::{KeyRotationJob, RotationControl, RotationReport};
use crate::core_store::model::{CompanyId, JobId};
use crate::errors::{VaultError, VaultResult};

impl Vault {
    /// Start rotating the company's data key. Fails with
    /// `RotationInProgress` while another job holds the guard.
    pub fn rotate_key(&self, company: &CompanyId) -> VaultResult<KeyRotationJob> {
        self.rotation.start(company)
    }

    /// Re-encrypt entities for a job until it finishes or `control` stops it
    pub async fn run_rotation(
        &self,
        company: &CompanyId,
        job_id: &JobId,
        control: &RotationControl,
    ) -> VaultResult<RotationReport> {
        self.rotation.run(company, job_id, control).await
    }

    /// Continue the company's unfinished job from its checkpoint
    pub async fn resume_rotation(&self, company: &CompanyId) -> VaultResult<RotationReport> {
        let job = self
            .keys
            .in_flight_job(company)?
            .ok_or_else(|| VaultError::NotFound(format!("no rotation in flight for company {}", company)))?;
        info!(company = %company, job_id = %job.job_id, cursor = ?job.cursor, "Resuming key rotation");
        self.rotation
            .run(company, &job.job_id, &RotationControl::new())
            .await
    }

    /// Move every entity back under the old key and discard the new one
    pub async fn rollback_rotation(&self, company: &CompanyId, job_id: &JobId) -> VaultResult<RotationReport> {
        self.rotation.begin_rollback(company, job_id)?;
        self.rotation
            .run(company, job_id, &RotationControl::new())
            .await
    }

    pub fn rotation_job(&self, company: &CompanyId, job_id: &JobId) -> VaultResult<KeyRotationJob> {
        self.rotation.job(company, job_id)
    }

    /// Job currently holding the company's rotation guard
    pub fn in_flight_rotation(&self, company: &CompanyId) -> VaultResult<Option<KeyRotationJob>> {
        self.keys.in_flight_job(company)
    }
}
