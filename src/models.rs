//! Mirrored entities: job orders, reference entities, notifications,
//! sync metadata, and the transient edit-audit row delivered by the
//! change feed.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::AppError;
use crate::{value_f64, value_str};

/// Notification type surfaced on the dashboard for urgent jobs awaiting review.
pub const HIGH_PRIORITY_PENDING: &str = "high_priority_pending";

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// Canonical text form for timestamps stored in the mirror. A single fixed
/// precision keeps lexical and chronological order identical in SQL.
pub fn ts_to_db(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn ts_from_db(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(trimmed)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            // Postgres `timestamp without time zone` renders without an offset.
            chrono::NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f")
                .or_else(|_| chrono::NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S%.f"))
                .map(|naive| naive.and_utc())
                .ok()
        })
}

fn ts_field(v: &Value, keys: &[&str]) -> Option<DateTime<Utc>> {
    value_str(v, keys).and_then(|s| ts_from_db(&s))
}

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    #[default]
    Pending,
    InProgress,
    Designing,
    Completed,
    Finished,
    Cancelled,
    Invoiced,
}

impl JobStatus {
    pub const ALL: [JobStatus; 7] = [
        JobStatus::Pending,
        JobStatus::InProgress,
        JobStatus::Designing,
        JobStatus::Completed,
        JobStatus::Finished,
        JobStatus::Cancelled,
        JobStatus::Invoiced,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in-progress",
            JobStatus::Designing => "designing",
            JobStatus::Completed => "completed",
            JobStatus::Finished => "finished",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Invoiced => "invoiced",
        }
    }

    /// Invoiced jobs are locked: no status change, no field edit.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Invoiced)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().replace('_', "-").as_str() {
            "pending" => Ok(JobStatus::Pending),
            "in-progress" => Ok(JobStatus::InProgress),
            "designing" => Ok(JobStatus::Designing),
            "completed" => Ok(JobStatus::Completed),
            "finished" => Ok(JobStatus::Finished),
            "cancelled" | "canceled" => Ok(JobStatus::Cancelled),
            "invoiced" => Ok(JobStatus::Invoiced),
            other => Err(AppError::Validation(format!("Invalid job status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    #[default]
    PendingApproval,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::PendingApproval => "pending_approval",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApprovalStatus {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().as_str() {
            "pending_approval" | "pending" => Ok(ApprovalStatus::PendingApproval),
            "approved" => Ok(ApprovalStatus::Approved),
            "rejected" => Ok(ApprovalStatus::Rejected),
            other => Err(AppError::Validation(format!(
                "Invalid approval status: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" | "normal" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            other => Err(AppError::Validation(format!("Invalid priority: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Job orders
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct JobOrder {
    pub id: String,
    #[serde(default)]
    pub job_order_number: Option<String>,
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub customer_name: Option<String>,
    #[serde(default)]
    pub designer_id: Option<String>,
    #[serde(default)]
    pub designer_name: Option<String>,
    #[serde(default)]
    pub salesman_id: Option<String>,
    #[serde(default)]
    pub salesman_name: Option<String>,
    #[serde(default)]
    pub job_title_id: Option<String>,
    #[serde(default)]
    pub job_title: Option<String>,
    #[serde(default)]
    pub status: JobStatus,
    #[serde(default)]
    pub approval_status: ApprovalStatus,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(default)]
    pub estimated_hours: Option<f64>,
    #[serde(default)]
    pub actual_hours: Option<f64>,
    #[serde(default)]
    pub total_value: Option<f64>,
    #[serde(default)]
    pub invoice_number: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub job_order_details: Option<String>,
    #[serde(default)]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub approved_by: Option<String>,
    #[serde(default)]
    pub approved_at: Option<DateTime<Utc>>,
}

/// Pull the display name of a joined relation, e.g. `customer: {name}` or
/// `customers: {name}`, falling back to a flat `customer_name` column.
fn joined_name(row: &Value, relations: &[&str], flat_keys: &[&str], name_keys: &[&str]) -> Option<String> {
    for rel in relations {
        if let Some(obj) = row.get(*rel).filter(|v| v.is_object()) {
            if let Some(name) = value_str(obj, name_keys) {
                return Some(name);
            }
        }
    }
    value_str(row, flat_keys)
}

impl JobOrder {
    pub fn is_locked(&self) -> bool {
        self.status.is_terminal()
    }

    /// Build a mirror record from a backend row, tolerating joined relations
    /// and lenient enum spellings. Returns `None` when the row has no id.
    pub fn from_remote(row: &Value) -> Option<JobOrder> {
        let id = value_str(row, &["id"])?;
        let status = value_str(row, &["status"])
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();
        let approval_status = value_str(row, &["approval_status", "approvalStatus"])
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();
        let priority = value_str(row, &["priority"])
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();

        Some(JobOrder {
            id,
            job_order_number: value_str(row, &["job_order_number", "jobOrderNumber"])
                .or_else(|| row.get("job_order_number").and_then(Value::as_i64).map(|n| n.to_string())),
            customer_id: value_str(row, &["customer_id", "customerId"]),
            customer_name: joined_name(row, &["customer", "customers"], &["customer_name", "customerName"], &["name"]),
            designer_id: value_str(row, &["designer_id", "designerId"]),
            designer_name: joined_name(row, &["designer", "designers"], &["designer_name", "designerName"], &["name"]),
            salesman_id: value_str(row, &["salesman_id", "salesmanId"]),
            salesman_name: joined_name(row, &["salesman", "salesmen"], &["salesman_name", "salesmanName"], &["name"]),
            job_title_id: value_str(row, &["job_title_id", "jobTitleId"]),
            job_title: joined_name(row, &["job_title_ref", "job_titles"], &["job_title", "jobTitle"], &["name", "title"]),
            status,
            approval_status,
            priority,
            due_date: value_str(row, &["due_date", "dueDate"]),
            estimated_hours: value_f64(row, &["estimated_hours", "estimatedHours"]),
            actual_hours: value_f64(row, &["actual_hours", "actualHours"]),
            total_value: value_f64(row, &["total_value", "totalValue"]),
            invoice_number: value_str(row, &["invoice_number", "invoiceNumber"]),
            branch: value_str(row, &["branch"]),
            job_order_details: value_str(row, &["job_order_details", "jobOrderDetails"]),
            delivered_at: ts_field(row, &["delivered_at", "deliveredAt"]),
            created_by: value_str(row, &["created_by", "createdBy"]),
            created_at: ts_field(row, &["created_at", "createdAt"]),
            updated_at: ts_field(row, &["updated_at", "updatedAt"]),
            approved_by: value_str(row, &["approved_by", "approvedBy"]),
            approved_at: ts_field(row, &["approved_at", "approvedAt"]),
        })
    }
}

// ---------------------------------------------------------------------------
// Reference entities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    Customer,
    Designer,
    Salesman,
    JobTitle,
}

impl ReferenceKind {
    pub const ALL: [ReferenceKind; 4] = [
        ReferenceKind::Customer,
        ReferenceKind::Designer,
        ReferenceKind::Salesman,
        ReferenceKind::JobTitle,
    ];

    /// Table name, shared by the local mirror and the backend.
    pub fn table(&self) -> &'static str {
        match self {
            ReferenceKind::Customer => "customers",
            ReferenceKind::Designer => "designers",
            ReferenceKind::Salesman => "salesmen",
            ReferenceKind::JobTitle => "job_titles",
        }
    }
}

impl FromStr for ReferenceKind {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().replace('-', "_").as_str() {
            "customer" | "customers" => Ok(ReferenceKind::Customer),
            "designer" | "designers" => Ok(ReferenceKind::Designer),
            "salesman" | "salesmen" => Ok(ReferenceKind::Salesman),
            "job_title" | "job_titles" | "jobtitle" | "jobtitles" => Ok(ReferenceKind::JobTitle),
            other => Err(AppError::Validation(format!(
                "Unknown reference entity: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ReferenceEntity {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl ReferenceEntity {
    pub fn from_remote(row: &Value) -> Option<ReferenceEntity> {
        Some(ReferenceEntity {
            id: value_str(row, &["id"])?,
            name: value_str(row, &["name", "title", "full_name"])?,
            email: value_str(row, &["email"]),
            phone: value_str(row, &["phone", "mobile"]),
            company: value_str(row, &["company", "company_name"]),
            address: value_str(row, &["address"]),
            created_at: ts_field(row, &["created_at"]),
        })
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub snoozed_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl Notification {
    /// Unread and not currently snoozed.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        !self.read && self.snoozed_until.map(|until| until < now).unwrap_or(true)
    }

    pub fn from_remote(row: &Value) -> Option<Notification> {
        Some(Notification {
            id: value_str(row, &["id"])?,
            user_id: value_str(row, &["user_id", "userId"])?,
            job_id: value_str(row, &["job_id", "jobId"]),
            kind: value_str(row, &["type", "kind"]).unwrap_or_else(|| "general".to_string()),
            message: value_str(row, &["message"]).unwrap_or_default(),
            payload: row.get("payload").filter(|v| !v.is_null()).cloned(),
            read: row.get("read").and_then(Value::as_bool).unwrap_or(false),
            snoozed_until: ts_field(row, &["snoozed_until", "snoozedUntil"]),
            created_at: ts_field(row, &["created_at", "createdAt"]),
        })
    }
}

// ---------------------------------------------------------------------------
// Sync metadata
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct SyncMeta {
    pub store: String,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub sync_in_progress: bool,
    pub last_error: Option<String>,
}

// ---------------------------------------------------------------------------
// Edit audit (change feed payload, never persisted)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    #[serde(default)]
    pub old: Value,
    #[serde(default)]
    pub new: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEditAudit {
    pub id: String,
    pub job_id: String,
    #[serde(default)]
    pub job_order_number: Option<String>,
    pub edited_by: String,
    #[serde(default)]
    pub edited_by_name: Option<String>,
    #[serde(default)]
    pub edited_role: Option<String>,
    #[serde(default)]
    pub diff: BTreeMap<String, FieldChange>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl JobEditAudit {
    pub fn from_remote(row: &Value) -> Option<JobEditAudit> {
        let diff = row
            .get("diff")
            .cloned()
            .and_then(|d| serde_json::from_value::<BTreeMap<String, FieldChange>>(d).ok())
            .unwrap_or_default();
        Some(JobEditAudit {
            id: value_str(row, &["id"])?,
            job_id: value_str(row, &["job_id"])?,
            job_order_number: value_str(row, &["job_order_number"])
                .or_else(|| row.get("job_order_number").and_then(Value::as_i64).map(|n| n.to_string())),
            edited_by: value_str(row, &["edited_by"])?,
            edited_by_name: value_str(row, &["edited_by_name"]),
            edited_role: value_str(row, &["edited_role"]),
            diff,
            created_at: ts_field(row, &["created_at"]),
        })
    }

    pub fn changed_fields(&self) -> Vec<&str> {
        self.diff.keys().map(String::as_str).collect()
    }
}
