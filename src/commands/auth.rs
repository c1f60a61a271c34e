use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use super::parse_payload;
use crate::auth::{self, Capability};
use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HasPermissionPayload {
    #[serde(default)]
    role: Option<String>,
    #[serde(alias = "capability", alias = "name", alias = "key")]
    permission: String,
}

/// `"canEditJobOrders"`, `{ permission }` or `{ role, permission }`.
fn parse_has_permission_payload(arg0: Option<Value>) -> Result<HasPermissionPayload, String> {
    let payload = match arg0 {
        Some(Value::String(permission)) => serde_json::json!({ "permission": permission }),
        Some(v) => v,
        None => return Err("Missing permission".into()),
    };
    let mut parsed: HasPermissionPayload = parse_payload(payload, "permission")?;
    parsed.permission = parsed.permission.trim().to_string();
    if parsed.permission.is_empty() {
        return Err("Missing permission".into());
    }
    Ok(parsed)
}

/// Look up the session's user and resolve their roles.
pub async fn auth_resolve_roles(state: &AppState) -> Result<Value, String> {
    let resolved = state.roles.resolve_current().await;
    info!(loading = resolved.is_loading(), error = ?resolved.error(), "roles refreshed");
    Ok(resolved.to_json())
}

pub async fn auth_get_current_identity(state: &AppState) -> Result<Value, String> {
    Ok(state.roles.state().to_json())
}

/// With a `role`, checks the static table. Without one, checks the
/// signed-in user's resolved roles. Unknown names are denied.
pub async fn auth_has_permission(state: &AppState, arg0: Option<Value>) -> Result<Value, String> {
    let payload = parse_has_permission_payload(arg0)?;
    let allowed = match payload.role.as_deref() {
        Some(role) => auth::has_permission(role, &payload.permission),
        None => payload
            .permission
            .parse::<Capability>()
            .map(|capability| state.claims().can(capability))
            .unwrap_or(false),
    };
    Ok(serde_json::json!({
        "permission": payload.permission,
        "allowed": allowed,
    }))
}

pub async fn auth_sign_out(state: &AppState) -> Result<Value, String> {
    state.roles.clear();
    state.notifier.unsubscribe_all();
    Ok(serde_json::json!({ "success": true }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewayUser;
    use crate::test_support::app_state;
    use serde_json::json;

    #[test]
    fn permission_payload_forms() {
        let p = parse_has_permission_payload(Some(json!("canEditJobOrders"))).unwrap();
        assert_eq!(p.permission, "canEditJobOrders");
        assert!(p.role.is_none());

        let p = parse_has_permission_payload(Some(json!({"role": "designer", "capability": "x"})))
            .unwrap();
        assert_eq!(p.role.as_deref(), Some("designer"));
        assert!(parse_has_permission_payload(Some(json!({"permission": " "}))).is_err());
        assert!(parse_has_permission_payload(None).is_err());
    }

    #[tokio::test]
    async fn resolve_then_check_session_permissions() {
        let (gateway, state) = app_state();
        gateway.set_user(Some(GatewayUser {
            id: "u-5".into(),
            email: Some("sales@example.com".into()),
            claims: json!({}),
        }));
        gateway.seed("user_roles", vec![json!({"user_id": "u-5", "role": "salesman"})]);

        let identity = auth_resolve_roles(&state).await.unwrap();
        assert_eq!(identity["roles"], json!(["salesman"]));
        assert_eq!(identity["isAdmin"], false);

        let check = auth_has_permission(&state, Some(json!("manage_customers")))
            .await
            .unwrap();
        assert_eq!(check["allowed"], true);
        let check = auth_has_permission(&state, Some(json!("canEditJobOrders")))
            .await
            .unwrap();
        assert_eq!(check["allowed"], false);

        auth_sign_out(&state).await.unwrap();
        let identity = auth_get_current_identity(&state).await.unwrap();
        assert_eq!(identity["roles"], json!([]));
    }

    #[tokio::test]
    async fn explicit_role_checks_static_table() {
        let (_gateway, state) = app_state();
        let check = auth_has_permission(
            &state,
            Some(json!({"role": "superuser", "permission": "create_job_orders"})),
        )
        .await
        .unwrap();
        assert_eq!(check["allowed"], false);
        let check = auth_has_permission(
            &state,
            Some(json!({"role": "employee", "permission": "create_job_orders"})),
        )
        .await
        .unwrap();
        assert_eq!(check["allowed"], true);
    }
}
