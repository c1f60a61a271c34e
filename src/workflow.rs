//! Job status and approval workflow.
//!
//! Status changes go through the backend `update_job_status` procedure,
//! which owns the legality and role checks. Locally we only reject bad
//! status values and any change to an invoiced job, then mirror the
//! result once the backend accepts it.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use crate::auth::{Capability, IdentityClaims};
use crate::error::{AppError, AppResult};
use crate::gateway::is_permission_error;
use crate::models::{ts_to_db, ApprovalStatus, JobOrder, JobStatus};
use crate::sync::{SyncService, JOB_ORDERS_TABLE};
use crate::value_str;

const UPDATE_STATUS_RPC: &str = "update_job_status";

impl JobStatus {
    /// Successors offered in the UI. The backend has the final say.
    pub fn allowed_next(&self) -> &'static [JobStatus] {
        use JobStatus::*;
        match self {
            Pending => &[InProgress, Cancelled],
            InProgress => &[Designing, Cancelled],
            Designing => &[Completed, Cancelled],
            Completed => &[Finished, Cancelled],
            Finished => &[Invoiced, Cancelled],
            Cancelled => &[Pending],
            Invoiced => &[],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionResult {
    pub job_id: String,
    pub job_order_number: Option<String>,
    pub status: JobStatus,
}

/// Fields that change only through dedicated actions.
const PROTECTED_FIELDS: &[&str] = &[
    "id",
    "status",
    "approval_status",
    "approved_by",
    "approved_at",
    "job_order_number",
    "created_by",
    "created_at",
    "updated_at",
];

/// Fields that also need [`Capability::EditInvoice`].
const INVOICE_FIELDS: &[&str] = &["invoice_number", "total_value"];

pub struct JobWorkflow {
    sync: Arc<SyncService>,
}

impl JobWorkflow {
    pub fn new(sync: Arc<SyncService>) -> Self {
        Self { sync }
    }

    fn mirrored_job(&self, job_id: &str) -> AppResult<Option<JobOrder>> {
        self.sync
            .with_conn(|conn| crate::mirror::get_job(conn, job_id))
    }

    /// Rejects changes to an invoiced job. Jobs outside the mirror are
    /// looked up on the backend.
    async fn ensure_unlocked(&self, job_id: &str) -> AppResult<Option<JobOrder>> {
        let job = self.sync.get_job(job_id).await?;
        if job.as_ref().map(JobOrder::is_locked).unwrap_or(false) {
            warn!(job_id, "change rejected: job is invoiced");
            return Err(AppError::JobLocked {
                job_id: job_id.to_string(),
            });
        }
        Ok(job)
    }

    /// Map a backend failure, keeping authorization rejections distinct.
    fn rejection(claims: &IdentityClaims, capability: Capability, error: String) -> AppError {
        if is_permission_error(&error) {
            claims.denied(capability)
        } else {
            AppError::Gateway(error)
        }
    }

    pub fn available_transitions(&self, job_id: &str) -> AppResult<Vec<JobStatus>> {
        Ok(self
            .mirrored_job(job_id)?
            .map(|job| job.status.allowed_next().to_vec())
            .unwrap_or_default())
    }

    pub async fn update_job_status(
        &self,
        claims: &IdentityClaims,
        job_id: &str,
        new_status: &str,
    ) -> AppResult<TransitionResult> {
        if job_id.trim().is_empty() {
            return Err(AppError::Validation("Job id is required".into()));
        }
        let status: JobStatus = new_status.parse()?;
        self.ensure_unlocked(job_id).await?;

        let response = self
            .sync
            .gateway()
            .rpc(
                UPDATE_STATUS_RPC,
                serde_json::json!({ "job_id": job_id, "new_status": status.as_str() }),
            )
            .await
            .map_err(|e| Self::rejection(claims, Capability::EditJobOrders, e))?;

        let success = response
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !success {
            let error = value_str(&response, &["error", "message"])
                .unwrap_or_else(|| format!("Status change to {status} was rejected"));
            warn!(job_id, status = %status, user_id = %claims.user_id, error = %error, "status change rejected");
            if is_permission_error(&error) {
                return Err(claims.denied(Capability::EditJobOrders));
            }
            return Err(AppError::Transition(error));
        }

        self.sync
            .update_job_in_cache(job_id, &serde_json::json!({ "status": status.as_str() }));
        let job_order_number = value_str(&response, &["job_order_number"])
            .or_else(|| {
                response
                    .get("job_order_number")
                    .and_then(Value::as_i64)
                    .map(|n| n.to_string())
            })
            .or_else(|| {
                self.mirrored_job(job_id)
                    .ok()
                    .flatten()
                    .and_then(|j| j.job_order_number)
            });
        info!(job_id, status = %status, "job status updated");
        Ok(TransitionResult {
            job_id: job_id.to_string(),
            job_order_number,
            status,
        })
    }

    pub async fn approve(&self, claims: &IdentityClaims, job_id: &str) -> AppResult<JobOrder> {
        self.set_approval(claims, job_id, ApprovalStatus::Approved)
            .await
    }

    pub async fn reject(&self, claims: &IdentityClaims, job_id: &str) -> AppResult<JobOrder> {
        self.set_approval(claims, job_id, ApprovalStatus::Rejected)
            .await
    }

    async fn set_approval(
        &self,
        claims: &IdentityClaims,
        job_id: &str,
        approval: ApprovalStatus,
    ) -> AppResult<JobOrder> {
        if !claims.is_admin() {
            warn!(job_id, user_id = %claims.user_id, roles = ?claims.role_names(), "approval denied");
            return Err(claims.denied(Capability::ApproveJobOrders));
        }
        self.ensure_unlocked(job_id).await?;

        let partial = serde_json::json!({
            "approval_status": approval.as_str(),
            "approved_by": claims.user_id,
            "approved_at": ts_to_db(&Utc::now()),
        });
        self.sync
            .gateway()
            .update(JOB_ORDERS_TABLE, job_id, partial.clone())
            .await
            .map_err(|e| Self::rejection(claims, Capability::ApproveJobOrders, e))?;

        self.sync.update_job_in_cache(job_id, &partial);
        info!(job_id, approval = approval.as_str(), "job approval updated");
        self.sync
            .get_job(job_id)
            .await?
            .ok_or_else(|| AppError::Gateway(format!("Job {job_id} not found")))
    }

    /// Edit scalar fields of a job. Status and approval have their own
    /// actions and are refused here.
    pub async fn edit_job(
        &self,
        claims: &IdentityClaims,
        job_id: &str,
        fields: &Value,
    ) -> AppResult<JobOrder> {
        claims.require(Capability::EditJobOrders)?;
        let Some(object) = fields.as_object().filter(|o| !o.is_empty()) else {
            return Err(AppError::Validation("No fields to update".into()));
        };
        if let Some(key) = object.keys().find(|k| PROTECTED_FIELDS.contains(&k.as_str())) {
            return Err(AppError::Validation(format!(
                "Field {key} cannot be edited directly"
            )));
        }
        if object.keys().any(|k| INVOICE_FIELDS.contains(&k.as_str())) {
            claims.require(Capability::EditInvoice)?;
        }
        if let Some(priority) = object.get("priority").and_then(Value::as_str) {
            priority.parse::<crate::models::Priority>()?;
        }
        self.ensure_unlocked(job_id).await?;

        self.sync
            .gateway()
            .update(JOB_ORDERS_TABLE, job_id, fields.clone())
            .await
            .map_err(|e| Self::rejection(claims, Capability::EditJobOrders, e))?;

        self.sync.update_job_in_cache(job_id, fields);
        info!(job_id, fields = ?object.keys().collect::<Vec<_>>(), "job edited");
        self.sync
            .get_job(job_id)
            .await?
            .ok_or_else(|| AppError::Gateway(format!("Job {job_id} not found")))
    }

    /// Create a job on the backend; the stored row (with its assigned
    /// `job_order_number`) is mirrored and returned.
    pub async fn create_job(&self, claims: &IdentityClaims, draft: &Value) -> AppResult<JobOrder> {
        claims.require(Capability::CreateJobOrders)?;
        let Some(object) = draft.as_object() else {
            return Err(AppError::Validation("Job draft must be an object".into()));
        };

        let mut record = object.clone();
        for key in ["id", "job_order_number", "approved_by", "approved_at", "updated_at"] {
            record.remove(key);
        }
        let status = match record.get("status").and_then(Value::as_str) {
            Some(raw) => raw.parse::<JobStatus>()?,
            None => JobStatus::Pending,
        };
        if status.is_terminal() {
            return Err(AppError::Validation("A new job cannot start invoiced".into()));
        }
        if let Some(priority) = record.get("priority").and_then(Value::as_str) {
            priority.parse::<crate::models::Priority>()?;
        }
        record.insert("status".into(), status.as_str().into());
        record.insert(
            "approval_status".into(),
            ApprovalStatus::PendingApproval.as_str().into(),
        );
        record.insert("created_by".into(), claims.user_id.clone().into());

        let stored = self
            .sync
            .gateway()
            .insert(JOB_ORDERS_TABLE, Value::Object(record))
            .await
            .map_err(|e| Self::rejection(claims, Capability::CreateJobOrders, e))?;
        let job = self.sync.cache_remote_job(&stored)?;
        info!(job_id = %job.id, number = ?job.job_order_number, "job created");
        Ok(job)
    }
}
