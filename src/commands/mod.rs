//! JSON command surface for the UI shell.
//!
//! Every command takes the shell's first argument as `Option<Value>` and
//! returns `Result<Value, String>`. A malformed payload is an `Err`; a
//! service failure is an `Ok` body with `success: false` and an error code
//! so the UI can tell access denials from network trouble.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::error::AppResult;

pub mod auth;
pub mod diagnostics;
pub mod jobs;
pub mod reference;
pub mod settings;
pub mod sync;

/// Accept either a bare string or an object for single-id commands.
pub(crate) fn normalize_id_payload(arg0: Option<Value>, key: &str) -> Value {
    match arg0 {
        Some(Value::String(id)) => serde_json::json!({ key: id }),
        Some(v) => v,
        None => serde_json::json!({}),
    }
}

pub(crate) fn parse_payload<T: DeserializeOwned>(payload: Value, what: &str) -> Result<T, String> {
    serde_json::from_value(payload).map_err(|e| format!("Invalid {what} payload: {e}"))
}

pub(crate) fn required(value: String, name: &str) -> Result<String, String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(format!("Missing {name}"));
    }
    Ok(trimmed.to_string())
}

/// Wrap a service result as `{ success: true, <field>: ... }` or the error body.
pub(crate) fn respond<T: Serialize>(command: &str, field: &str, result: AppResult<T>) -> Value {
    match result {
        Ok(data) => {
            let data = serde_json::to_value(data).unwrap_or(Value::Null);
            serde_json::json!({ "success": true, field: data })
        }
        Err(e) => {
            warn!(command, code = e.code(), error = %e, "command failed");
            e.to_json()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use serde_json::json;

    #[test]
    fn id_payload_accepts_string_or_object() {
        assert_eq!(normalize_id_payload(Some(json!("J1")), "jobId"), json!({"jobId": "J1"}));
        assert_eq!(
            normalize_id_payload(Some(json!({"job_id": "J1"})), "jobId"),
            json!({"job_id": "J1"})
        );
        assert_eq!(normalize_id_payload(None, "jobId"), json!({}));
    }

    #[test]
    fn respond_shapes_success_and_error() {
        let ok = respond("test", "count", Ok::<_, AppError>(3));
        assert_eq!(ok, json!({"success": true, "count": 3}));

        let err = respond::<()>("test", "count", Err(AppError::JobLocked { job_id: "J1".into() }));
        assert_eq!(err["success"], false);
        assert_eq!(err["code"], "job_locked");
        assert!(required("  ".into(), "jobId").is_err());
    }
}
