//! Error taxonomy shared by the mirror, sync, workflow and command layers.
//!
//! Low-level SQLite and HTTP plumbing returns `Result<_, String>` and is
//! mapped into [`AppError`] at the service boundary.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AppError {
    /// Remote call failed (network, auth, or backend-side validation).
    #[error("{0}")]
    Gateway(String),

    /// Local mirror read/write failed.
    #[error("local cache error: {0}")]
    Cache(String),

    /// Role check failed, either client-gated or rejected by the backend.
    #[error("Access denied for user {user_id} (roles: {roles:?}): {capability}")]
    AccessDenied {
        user_id: String,
        roles: Vec<String>,
        capability: String,
    },

    /// Input rejected before any remote call was issued.
    #[error("{0}")]
    Validation(String),

    /// The job has been invoiced and no longer accepts edits.
    #[error("Job {job_id} is invoiced and locked for editing")]
    JobLocked { job_id: String },

    /// Status change refused by the backend; message is passed through verbatim.
    #[error("{0}")]
    Transition(String),
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Gateway(_) => "gateway_error",
            AppError::Cache(_) => "cache_error",
            AppError::AccessDenied { .. } => "access_denied",
            AppError::Validation(_) => "validation_error",
            AppError::JobLocked { .. } => "job_locked",
            AppError::Transition(_) => "transition_rejected",
        }
    }

    pub fn is_access_denied(&self) -> bool {
        matches!(self, AppError::AccessDenied { .. })
    }

    /// JSON shape returned to the UI for a failed command.
    pub fn to_json(&self) -> Value {
        let mut body = serde_json::json!({
            "success": false,
            "error": self.to_string(),
            "code": self.code(),
        });
        if let AppError::AccessDenied {
            user_id,
            roles,
            capability,
        } = self
        {
            body["accessDenied"] = serde_json::json!({
                "userId": user_id,
                "roles": roles,
                "capability": capability,
            });
        }
        body
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(e: rusqlite::Error) -> Self {
        AppError::Cache(e.to_string())
    }
}

impl From<AppError> for String {
    fn from(e: AppError) -> Self {
        e.to_string()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_denied_json_carries_identity_context() {
        let err = AppError::AccessDenied {
            user_id: "user-7".into(),
            roles: vec!["designer".into()],
            capability: "approve_job_orders".into(),
        };
        let body = err.to_json();
        assert_eq!(body["code"], "access_denied");
        assert_eq!(body["accessDenied"]["userId"], "user-7");
        assert_eq!(body["accessDenied"]["roles"][0], "designer");
        assert!(err.is_access_denied());
    }

    #[test]
    fn transition_error_message_is_verbatim() {
        let err = AppError::Transition("Cannot move job from pending to finished".into());
        assert_eq!(err.to_string(), "Cannot move job from pending to finished");
        assert_eq!(err.code(), "transition_rejected");
    }
}
