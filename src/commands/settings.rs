use serde::Deserialize;
use serde_json::Value;

use super::{parse_payload, required, respond};
use crate::db::DbState;
use crate::{storage, system_config, AppState};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SystemConfigKeyPayload {
    #[serde(alias = "config_key", alias = "configKey", alias = "name")]
    key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SystemConfigUpdatePayload {
    #[serde(alias = "config_key", alias = "configKey", alias = "name")]
    key: String,
    #[serde(default, alias = "config_value", alias = "configValue")]
    value: Value,
}

fn parse_system_config_key_payload(arg0: Option<Value>) -> Result<String, String> {
    let payload = match arg0 {
        Some(Value::String(key)) => serde_json::json!({ "key": key }),
        Some(v) => v,
        None => Value::Null,
    };
    let parsed: SystemConfigKeyPayload = parse_payload(payload, "system configuration")?;
    required(parsed.key, "key")
}

fn parse_system_config_update_payload(arg0: Option<Value>) -> Result<(String, Value), String> {
    let parsed: SystemConfigUpdatePayload =
        parse_payload(arg0.unwrap_or(Value::Null), "system configuration")?;
    Ok((required(parsed.key, "key")?, parsed.value))
}

// ---------------------------------------------------------------------------
// Gateway credentials (available before the backend is connected)
// ---------------------------------------------------------------------------

pub async fn settings_is_configured(db: &DbState) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    Ok(serde_json::json!({ "configured": storage::is_configured(&conn) }))
}

pub async fn settings_get_gateway_config(db: &DbState) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    Ok(storage::get_full_config(&conn))
}

/// Store gateway URL, anon key, token or branch. A `connectionString`
/// replaces URL and key together.
pub async fn settings_update_gateway_credentials(
    db: &DbState,
    arg0: Option<Value>,
) -> Result<Value, String> {
    let update = storage::CredentialUpdate::from_payload(&arg0.unwrap_or(Value::Null))?;
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    storage::store_credentials(&conn, &update)?;
    Ok(serde_json::json!({
        "success": true,
        "configured": storage::is_configured(&conn),
    }))
}

pub async fn settings_factory_reset(db: &DbState) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    storage::factory_reset(&conn)
}

// ---------------------------------------------------------------------------
// System configurations
// ---------------------------------------------------------------------------

pub async fn system_config_refresh(state: &AppState) -> Result<Value, String> {
    Ok(respond(
        "system_config_refresh",
        "count",
        system_config::refresh(&state.sync).await,
    ))
}

/// Cached configurations; works offline.
pub async fn system_config_get_all(state: &AppState) -> Result<Value, String> {
    let mut body = respond(
        "system_config_get_all",
        "configs",
        system_config::get_all(&state.sync),
    );
    if body["success"] == true {
        body["fetchedAt"] = system_config::last_fetched(&state.sync)
            .ok()
            .flatten()
            .map(Value::String)
            .unwrap_or(Value::Null);
    }
    Ok(body)
}

pub async fn system_config_get(state: &AppState, arg0: Option<Value>) -> Result<Value, String> {
    let key = parse_system_config_key_payload(arg0)?;
    Ok(respond(
        "system_config_get",
        "value",
        system_config::get(&state.sync, &key),
    ))
}

pub async fn system_config_update(state: &AppState, arg0: Option<Value>) -> Result<Value, String> {
    let (key, value) = parse_system_config_update_payload(arg0)?;
    let result = system_config::update(&state.sync, &state.claims(), &key, value).await;
    Ok(respond("system_config_update", "key", result.map(|()| key)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewayUser;
    use crate::test_support::app_state;
    use serde_json::json;

    #[test]
    fn system_config_payloads() {
        assert_eq!(parse_system_config_key_payload(Some(json!("vat"))).unwrap(), "vat");
        assert_eq!(
            parse_system_config_key_payload(Some(json!({"config_key": "vat"}))).unwrap(),
            "vat"
        );
        assert!(parse_system_config_key_payload(None).is_err());

        let (key, value) =
            parse_system_config_update_payload(Some(json!({"configKey": "vat", "configValue": 24})))
                .unwrap();
        assert_eq!(key, "vat");
        assert_eq!(value, 24);
        assert!(parse_system_config_update_payload(Some(json!({"key": ""}))).is_err());
    }

    #[tokio::test]
    async fn refresh_then_read_cached_configs() {
        let (gateway, state) = app_state();
        gateway.on_rpc(system_config::GET_CONFIGS_RPC, |_| {
            Ok(json!({"company_name": "Acme Print", "default_vat": 24}))
        });

        let body = system_config_refresh(&state).await.unwrap();
        assert_eq!(body["count"], 2);

        let body = system_config_get_all(&state).await.unwrap();
        assert_eq!(body["configs"]["company_name"], "Acme Print");
        assert!(body["fetchedAt"].is_string());

        let body = system_config_get(&state, Some(json!("default_vat"))).await.unwrap();
        assert_eq!(body["value"], 24);
    }

    #[tokio::test]
    async fn update_requires_admin() {
        let (gateway, state) = app_state();
        gateway.on_rpc(system_config::UPDATE_CONFIG_RPC, |_| Ok(Value::Null));
        state
            .roles
            .resolve(Some(&GatewayUser {
                id: "u-1".into(),
                email: None,
                claims: json!({"role": "employee"}),
            }))
            .await;

        let body = system_config_update(&state, Some(json!({"key": "vat", "value": 13})))
            .await
            .unwrap();
        assert_eq!(body["code"], "access_denied");
    }
}
