//! Backend system configuration cache.
//!
//! Configurations live on the backend and are read through the
//! `get_system_configurations` RPC. The last successful pull is kept in
//! `local_settings` so reads keep working offline. Values are stored as
//! JSON text.

use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::auth::IdentityClaims;
use crate::db;
use crate::error::{AppError, AppResult};
use crate::sync::SyncService;
use crate::value_str;

pub const SETTINGS_CATEGORY: &str = "system";

pub const GET_CONFIGS_RPC: &str = "get_system_configurations";
pub const UPDATE_CONFIG_RPC: &str = "update_system_configuration";

/// Bookkeeping row stored next to the cached values.
const FETCHED_AT_KEY: &str = "__fetched_at";

/// Flatten the RPC result into `key -> value`. Accepts either an array of
/// `{ key, value }` rows or a plain object.
fn parse_configurations(payload: &Value) -> Map<String, Value> {
    let mut out = Map::new();
    match payload {
        Value::Array(rows) => {
            for row in rows {
                let Some(key) = value_str(row, &["key", "config_key", "name"]) else {
                    warn!("system configuration row without key ignored");
                    continue;
                };
                let value = row
                    .get("value")
                    .or_else(|| row.get("config_value"))
                    .cloned()
                    .unwrap_or(Value::Null);
                out.insert(key, value);
            }
        }
        Value::Object(map) => {
            for (key, value) in map {
                out.insert(key.clone(), value.clone());
            }
        }
        _ => {}
    }
    out.remove(FETCHED_AT_KEY);
    out
}

fn decode_cached(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Pull all configurations and replace the cached copy. Returns the number
/// of keys cached. On failure the previous cache is kept.
pub async fn refresh(sync: &SyncService) -> AppResult<usize> {
    let payload = sync
        .gateway()
        .rpc(GET_CONFIGS_RPC, json!({}))
        .await
        .map_err(|e| {
            warn!(error = %e, "system configuration fetch failed");
            AppError::Gateway(e)
        })?;
    let configs = parse_configurations(&payload);
    let count = configs.len();

    sync.with_conn(|conn| {
        db::delete_all_settings(conn, SETTINGS_CATEGORY)?;
        for (key, value) in &configs {
            db::set_setting(conn, SETTINGS_CATEGORY, key, &value.to_string())?;
        }
        db::set_setting(conn, SETTINGS_CATEGORY, FETCHED_AT_KEY, &Utc::now().to_rfc3339())
    })?;
    info!(count, "system configurations cached");
    Ok(count)
}

/// Cached configurations as a JSON object.
pub fn get_all(sync: &SyncService) -> AppResult<Value> {
    let cached = sync.with_conn(|conn| Ok(db::get_settings_in_category(conn, SETTINGS_CATEGORY)))?;
    let mut out = Map::new();
    if let Value::Object(map) = cached {
        for (key, raw) in map {
            if key == FETCHED_AT_KEY {
                continue;
            }
            if let Some(raw) = raw.as_str() {
                out.insert(key, decode_cached(raw));
            }
        }
    }
    Ok(Value::Object(out))
}

pub fn get(sync: &SyncService, key: &str) -> AppResult<Option<Value>> {
    if key == FETCHED_AT_KEY {
        return Ok(None);
    }
    let raw = sync.with_conn(|conn| Ok(db::get_setting(conn, SETTINGS_CATEGORY, key)))?;
    Ok(raw.as_deref().map(decode_cached))
}

pub fn last_fetched(sync: &SyncService) -> AppResult<Option<String>> {
    sync.with_conn(|conn| Ok(db::get_setting(conn, SETTINGS_CATEGORY, FETCHED_AT_KEY)))
}

/// Write one configuration on the backend, then mirror it locally.
/// Admin only.
pub async fn update(
    sync: &SyncService,
    claims: &IdentityClaims,
    key: &str,
    value: Value,
) -> AppResult<()> {
    let key = key.trim();
    if key.is_empty() || key == FETCHED_AT_KEY {
        return Err(AppError::Validation("Configuration key is required".into()));
    }
    if !claims.is_admin() {
        return Err(AppError::AccessDenied {
            user_id: claims.user_id.clone(),
            roles: claims.role_names(),
            capability: "update_system_configuration".into(),
        });
    }

    sync.gateway()
        .rpc(UPDATE_CONFIG_RPC, json!({ "p_key": key, "p_value": value }))
        .await
        .map_err(|e| {
            warn!(key, error = %e, "system configuration update failed");
            if crate::gateway::is_permission_error(&e) {
                AppError::AccessDenied {
                    user_id: claims.user_id.clone(),
                    roles: claims.role_names(),
                    capability: "update_system_configuration".into(),
                }
            } else {
                AppError::Gateway(e)
            }
        })?;

    // Backend already has the value; a local write failure only costs a stale read.
    if let Err(e) =
        sync.with_conn(|conn| db::set_setting(conn, SETTINGS_CATEGORY, key, &value.to_string()))
    {
        warn!(key, error = %e, "failed to cache updated system configuration");
    }
    info!(key, user_id = %claims.user_id, "system configuration updated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;
    use crate::gateway::testing::MemoryGateway;
    use std::sync::Arc;

    fn service(gateway: Arc<MemoryGateway>) -> SyncService {
        SyncService::new(Arc::new(db::test_state()), gateway)
    }

    #[test]
    fn parses_rows_and_plain_objects() {
        let rows = parse_configurations(&json!([
            {"key": "default_vat", "value": 24},
            {"config_key": "company_name", "config_value": "Acme Print"},
            {"value": "orphan"}
        ]));
        assert_eq!(rows["default_vat"], 24);
        assert_eq!(rows["company_name"], "Acme Print");
        assert_eq!(rows.len(), 2);

        let obj = parse_configurations(&json!({"a": true, "__fetched_at": "x"}));
        assert_eq!(obj.len(), 1);
    }

    #[tokio::test]
    async fn refresh_caches_and_serves_offline() {
        let gateway = Arc::new(MemoryGateway::new());
        gateway.on_rpc(GET_CONFIGS_RPC, |_| {
            Ok(json!([
                {"key": "default_vat", "value": 24},
                {"key": "units", "value": ["pcs", "m2"]}
            ]))
        });
        let sync = service(gateway.clone());

        assert_eq!(refresh(&sync).await.unwrap(), 2);
        assert!(last_fetched(&sync).unwrap().is_some());

        gateway.on_rpc(GET_CONFIGS_RPC, |_| Err("Network unreachable".into()));
        assert!(refresh(&sync).await.is_err());

        let all = get_all(&sync).unwrap();
        assert_eq!(all["default_vat"], 24);
        assert_eq!(all["units"], json!(["pcs", "m2"]));
        assert!(all.get(FETCHED_AT_KEY).is_none());
        assert_eq!(get(&sync, "missing").unwrap(), None);
    }

    #[tokio::test]
    async fn update_is_admin_only_and_writes_through() {
        let gateway = Arc::new(MemoryGateway::new());
        gateway.on_rpc(UPDATE_CONFIG_RPC, |args| {
            assert_eq!(args["p_key"], "default_vat");
            Ok(Value::Null)
        });
        let sync = service(gateway.clone());

        let manager = IdentityClaims::new("u-2", vec![Role::Manager]);
        let err = update(&sync, &manager, "default_vat", json!(13)).await.unwrap_err();
        assert!(err.is_access_denied());
        assert_eq!(gateway.call_count("rpc:"), 0);

        let admin = IdentityClaims::new("u-1", vec![Role::Admin]);
        update(&sync, &admin, "default_vat", json!(13)).await.unwrap();
        assert_eq!(get(&sync, "default_vat").unwrap(), Some(json!(13)));

        assert!(update(&sync, &admin, "  ", json!(1)).await.is_err());
    }

    #[tokio::test]
    async fn backend_permission_error_maps_to_access_denied() {
        let gateway = Arc::new(MemoryGateway::new());
        gateway.on_rpc(UPDATE_CONFIG_RPC, |_| {
            Err("Permission denied for function update_system_configuration".into())
        });
        let sync = service(gateway);
        let admin = IdentityClaims::new("u-1", vec![Role::Admin]);
        let err = update(&sync, &admin, "k", json!("v")).await.unwrap_err();
        assert!(err.is_access_denied());
        assert_eq!(get(&sync, "k").unwrap(), None);
    }
}
