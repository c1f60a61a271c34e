//! Realtime edit notifications.
//!
//! Listens to inserts on the backend `job_edit_audit` table and turns edits
//! made by other users into toasts. The caller owns the returned
//! [`EditSubscription`]; dropping it or calling `unsubscribe` stops
//! delivery.

use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};
use crate::gateway::{ChangeEvent, Gateway};
use crate::models::JobEditAudit;

pub const JOB_EDIT_AUDIT_TABLE: &str = "job_edit_audit";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EditToast {
    pub title: String,
    pub message: String,
    pub job_id: String,
    pub job_order_number: Option<String>,
    pub editor_name: String,
    pub changed_fields: Vec<String>,
    /// In-app route to the edited job.
    pub link: String,
}

impl EditToast {
    pub fn from_audit(audit: &JobEditAudit) -> Self {
        let editor_name = audit
            .edited_by_name
            .clone()
            .unwrap_or_else(|| "Someone".to_string());
        let subject = match &audit.job_order_number {
            Some(number) => format!("job order {number}"),
            None => "a job order".to_string(),
        };
        let changed: Vec<String> = audit.changed_fields().iter().map(|f| f.to_string()).collect();
        let message = if changed.is_empty() {
            format!("{editor_name} edited {subject}")
        } else {
            format!("{editor_name} edited {subject} ({})", changed.join(", "))
        };
        EditToast {
            title: "Job order updated".to_string(),
            message,
            job_id: audit.job_id.clone(),
            job_order_number: audit.job_order_number.clone(),
            editor_name,
            changed_fields: changed,
            link: format!("/jobs/{}", audit.job_id),
        }
    }
}

/// Handle for one live subscription.
pub struct EditSubscription {
    token: CancellationToken,
}

impl EditSubscription {
    pub fn unsubscribe(&self) {
        if !self.token.is_cancelled() {
            debug!("edit subscription cancelled");
        }
        self.token.cancel();
    }

    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled()
    }
}

impl Drop for EditSubscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

pub struct EditNotifier {
    gateway: Arc<dyn Gateway>,
    current: Mutex<Option<CancellationToken>>,
}

impl EditNotifier {
    pub fn new(gateway: Arc<dyn Gateway>) -> Self {
        Self {
            gateway,
            current: Mutex::new(None),
        }
    }

    /// Deliver a toast for every edit not made by `current_user_id`, in the
    /// order the backend emits them. Replaces any earlier subscription made
    /// through this notifier. Must be called inside a Tokio runtime.
    pub fn subscribe<F>(&self, current_user_id: &str, on_event: F) -> AppResult<EditSubscription>
    where
        F: Fn(EditToast) + Send + 'static,
    {
        if current_user_id.trim().is_empty() {
            return Err(AppError::Validation("Current user id is required".into()));
        }
        let mut feed = self
            .gateway
            .subscribe_change_feed(JOB_EDIT_AUDIT_TABLE, ChangeEvent::Insert)
            .map_err(AppError::Gateway)?;

        let token = CancellationToken::new();
        if let Ok(mut current) = self.current.lock() {
            if let Some(previous) = current.replace(token.clone()) {
                previous.cancel();
            }
        }

        let user_id = current_user_id.to_string();
        let task_token = token.clone();
        tokio::spawn(async move {
            info!(user_id = %user_id, "edit notifier subscribed");
            loop {
                let row = tokio::select! {
                    biased;
                    _ = task_token.cancelled() => break,
                    row = feed.recv() => match row {
                        Some(row) => row,
                        None => break,
                    },
                };
                let Some(audit) = JobEditAudit::from_remote(&row) else {
                    warn!("malformed job edit audit row ignored");
                    continue;
                };
                if audit.edited_by == user_id {
                    debug!(job_id = %audit.job_id, "own edit suppressed");
                    continue;
                }
                on_event(EditToast::from_audit(&audit));
            }
            info!(user_id = %user_id, "edit notifier stopped");
        });

        Ok(EditSubscription { token })
    }

    /// Cancel whatever subscription this notifier currently holds.
    pub fn unsubscribe_all(&self) {
        if let Ok(mut current) = self.current.lock() {
            if let Some(token) = current.take() {
                token.cancel();
            }
        }
    }
}
