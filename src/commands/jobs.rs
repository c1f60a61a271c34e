use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use super::{normalize_id_payload, parse_payload, required, respond};
use crate::auth::Capability;
use crate::mirror::JobFilter;
use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobIdPayload {
    #[serde(alias = "job_id", alias = "id")]
    job_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateStatusPayload {
    #[serde(alias = "job_id", alias = "id")]
    job_id: String,
    #[serde(alias = "new_status", alias = "newStatus")]
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EditJobPayload {
    #[serde(alias = "job_id", alias = "id")]
    job_id: String,
    #[serde(alias = "fields", alias = "updates")]
    changes: Value,
}

fn parse_job_id_payload(arg0: Option<Value>) -> Result<String, String> {
    let parsed: JobIdPayload = parse_payload(normalize_id_payload(arg0, "jobId"), "job")?;
    required(parsed.job_id, "jobId")
}

fn parse_update_status_payload(arg0: Option<Value>) -> Result<(String, String), String> {
    let parsed: UpdateStatusPayload =
        parse_payload(arg0.unwrap_or(Value::Null), "status update")?;
    Ok((required(parsed.job_id, "jobId")?, required(parsed.status, "status")?))
}

fn parse_edit_payload(arg0: Option<Value>) -> Result<(String, Value), String> {
    let parsed: EditJobPayload = parse_payload(arg0.unwrap_or(Value::Null), "job edit")?;
    Ok((required(parsed.job_id, "jobId")?, parsed.changes))
}

/// `{ job: {...} }` or the draft object itself.
fn parse_create_payload(arg0: Option<Value>) -> Result<Value, String> {
    match arg0 {
        Some(Value::Object(mut obj)) => match obj.remove("job") {
            Some(job @ Value::Object(_)) => Ok(job),
            Some(_) => Err("Invalid job draft".into()),
            None => Ok(Value::Object(obj)),
        },
        _ => Err("Missing job draft".into()),
    }
}

/// List mirrored jobs. Users without view-all only see jobs they created.
pub async fn jobs_list(state: &AppState, arg0: Option<Value>) -> Result<Value, String> {
    let mut filter: JobFilter = match arg0 {
        Some(v @ Value::Object(_)) => parse_payload(v, "job filter")?,
        _ => JobFilter::default(),
    };
    let claims = state.claims();
    if !claims.can(Capability::ViewAllJobOrders) {
        if let Err(e) = claims.require(Capability::ViewOwnJobOrders) {
            return Ok(respond::<()>("jobs_list", "jobs", Err(e)));
        }
        filter.created_by = Some(claims.user_id.clone());
    }
    Ok(respond("jobs_list", "jobs", state.sync.list_jobs(&filter)))
}

/// Same scoping as [`jobs_list`]: without view-all only the creator may read a job.
pub async fn jobs_get(state: &AppState, arg0: Option<Value>) -> Result<Value, String> {
    let job_id = parse_job_id_payload(arg0)?;
    let claims = state.claims();
    if let Err(e) = claims.require(Capability::ViewOwnJobOrders) {
        return Ok(respond::<()>("jobs_get", "job", Err(e)));
    }
    let result = state.sync.get_job(&job_id).await.and_then(|job| match job {
        Some(j)
            if !claims.can(Capability::ViewAllJobOrders)
                && j.created_by.as_deref() != Some(claims.user_id.as_str()) =>
        {
            Err(claims.denied(Capability::ViewAllJobOrders))
        }
        other => Ok(other),
    });
    Ok(respond("jobs_get", "job", result))
}

pub async fn jobs_create(state: &AppState, arg0: Option<Value>) -> Result<Value, String> {
    let draft = parse_create_payload(arg0)?;
    let result = state.workflow.create_job(&state.claims(), &draft).await;
    Ok(respond("jobs_create", "job", result))
}

pub async fn jobs_edit(state: &AppState, arg0: Option<Value>) -> Result<Value, String> {
    let (job_id, changes) = parse_edit_payload(arg0)?;
    let result = state.workflow.edit_job(&state.claims(), &job_id, &changes).await;
    Ok(respond("jobs_edit", "job", result))
}

pub async fn jobs_update_status(state: &AppState, arg0: Option<Value>) -> Result<Value, String> {
    let (job_id, status) = parse_update_status_payload(arg0)?;
    info!(job_id = %job_id, status = %status, "status change requested");
    let result = state
        .workflow
        .update_job_status(&state.claims(), &job_id, &status)
        .await;
    Ok(respond("jobs_update_status", "result", result))
}

pub async fn jobs_approve(state: &AppState, arg0: Option<Value>) -> Result<Value, String> {
    let job_id = parse_job_id_payload(arg0)?;
    let result = state.workflow.approve(&state.claims(), &job_id).await;
    Ok(respond("jobs_approve", "job", result))
}

pub async fn jobs_reject(state: &AppState, arg0: Option<Value>) -> Result<Value, String> {
    let job_id = parse_job_id_payload(arg0)?;
    let result = state.workflow.reject(&state.claims(), &job_id).await;
    Ok(respond("jobs_reject", "job", result))
}

pub async fn jobs_get_transitions(state: &AppState, arg0: Option<Value>) -> Result<Value, String> {
    let job_id = parse_job_id_payload(arg0)?;
    Ok(respond(
        "jobs_get_transitions",
        "transitions",
        state.workflow.available_transitions(&job_id),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewayUser;
    use crate::test_support::app_state;
    use serde_json::json;

    fn user(id: &str) -> GatewayUser {
        GatewayUser {
            id: id.into(),
            email: None,
            claims: json!({}),
        }
    }

    fn job(id: &str, status: &str, created_by: &str) -> Value {
        json!({
            "id": id,
            "job_order_number": format!("JO-{id}"),
            "status": status,
            "approval_status": "pending_approval",
            "priority": "medium",
            "created_by": created_by,
            "created_at": "2026-03-01T10:00:00Z",
            "updated_at": "2026-03-01T10:00:00Z",
        })
    }

    #[test]
    fn payload_parsers_accept_aliases() {
        assert_eq!(parse_job_id_payload(Some(json!("J1"))).unwrap(), "J1");
        assert_eq!(parse_job_id_payload(Some(json!({"job_id": " J2 "}))).unwrap(), "J2");
        assert!(parse_job_id_payload(None).is_err());

        let (id, status) =
            parse_update_status_payload(Some(json!({"id": "J1", "new_status": "printing"})))
                .unwrap();
        assert_eq!((id.as_str(), status.as_str()), ("J1", "printing"));

        let (id, changes) =
            parse_edit_payload(Some(json!({"jobId": "J1", "fields": {"priority": "high"}})))
                .unwrap();
        assert_eq!(id, "J1");
        assert_eq!(changes["priority"], "high");

        assert_eq!(
            parse_create_payload(Some(json!({"job": {"customer_id": "c"}}))).unwrap(),
            json!({"customer_id": "c"})
        );
        assert!(parse_create_payload(Some(json!({"job": 1}))).is_err());
        assert!(parse_create_payload(None).is_err());
    }

    #[tokio::test]
    async fn list_is_scoped_to_own_jobs_without_view_all() {
        let (gateway, state) = app_state();
        gateway.seed("user_roles", vec![json!({"user_id": "u-9", "role": "designer"})]);
        gateway.seed(
            "job_orders",
            vec![job("J1", "pending", "u-9"), job("J2", "pending", "u-3")],
        );
        state.sync.full_resync().await.unwrap();
        state.roles.resolve(Some(&user("u-9"))).await;

        let body = jobs_list(&state, None).await.unwrap();
        assert_eq!(body["success"], true);
        let jobs = body["jobs"].as_array().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0]["id"], "J1");
    }

    #[tokio::test]
    async fn get_hides_other_users_jobs_without_view_all() {
        let (gateway, state) = app_state();
        gateway.seed(
            "user_roles",
            vec![
                json!({"user_id": "u-9", "role": "designer"}),
                json!({"user_id": "u-4", "role": "manager"}),
            ],
        );
        gateway.seed(
            "job_orders",
            vec![job("J1", "pending", "u-9"), job("J2", "pending", "u-3")],
        );
        state.roles.resolve(Some(&user("u-9"))).await;

        let own = jobs_get(&state, Some(json!("J1"))).await.unwrap();
        assert_eq!(own["job"]["id"], "J1");

        let other = jobs_get(&state, Some(json!("J2"))).await.unwrap();
        assert_eq!(other["success"], false);
        assert_eq!(other["code"], "access_denied");

        state.roles.resolve(Some(&user("u-4"))).await;
        let body = jobs_get(&state, Some(json!("J2"))).await.unwrap();
        assert_eq!(body["job"]["id"], "J2");

        state.roles.clear();
        let body = jobs_get(&state, Some(json!("J1"))).await.unwrap();
        assert_eq!(body["code"], "access_denied");
    }

    #[tokio::test]
    async fn approve_without_admin_is_reported_as_access_denied() {
        let (gateway, state) = app_state();
        gateway.seed("user_roles", vec![json!({"user_id": "u-2", "role": "manager"})]);
        gateway.seed("job_orders", vec![job("J1", "pending", "u-2")]);
        state.sync.full_resync().await.unwrap();
        state.roles.resolve(Some(&user("u-2"))).await;

        let body = jobs_approve(&state, Some(json!("J1"))).await.unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], "access_denied");
        assert_eq!(body["accessDenied"]["userId"], "u-2");
        assert_eq!(gateway.call_count("update:job_orders"), 0);
    }

    #[tokio::test]
    async fn invoiced_job_has_no_transitions() {
        let (gateway, state) = app_state();
        gateway.seed("job_orders", vec![job("J1", "invoiced", "u-1")]);
        state.sync.full_resync().await.unwrap();

        let body = jobs_get_transitions(&state, Some(json!({"jobId": "J1"}))).await.unwrap();
        assert_eq!(body["transitions"], json!([]));
    }
}
