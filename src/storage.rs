//! Gateway credential storage using the OS credential store.
//!
//! On Windows this uses DPAPI (via the `keyring` crate), on macOS Keychain,
//! and on Linux the kernel keyring. Every value is mirrored into
//! `local_settings` (category `gateway`) so a machine without a usable
//! credential store still starts.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use keyring::Entry;
use rusqlite::Connection;
use serde_json::Value;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::db;
use crate::gateway::{normalize_gateway_url, GatewayConfig};
use crate::value_str;

const SERVICE_NAME: &str = "job-orders-desk";

/// `local_settings` category holding the fallback copy of the credentials.
pub const SETTINGS_CATEGORY: &str = "gateway";

// Credential keys
const KEY_GATEWAY_URL: &str = "gateway_url";
const KEY_GATEWAY_ANON_KEY: &str = "gateway_anon_key";
const KEY_ACCESS_TOKEN: &str = "access_token";
const KEY_BRANCH: &str = "branch";

/// All credential keys managed by this module.
const ALL_KEYS: &[&str] = &[KEY_GATEWAY_URL, KEY_GATEWAY_ANON_KEY, KEY_ACCESS_TOKEN, KEY_BRANCH];

// ---------------------------------------------------------------------------
// Low-level helpers
// ---------------------------------------------------------------------------

/// Retrieve a single credential from the OS keyring. Returns `None` when the
/// entry does not exist (or the platform returns a "not found" error).
pub fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) => Some(pw),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

/// Store a credential in the OS keyring.
pub fn set_credential(key: &str, value: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    entry.set_password(value).map_err(|e| e.to_string())?;
    Ok(())
}

/// Delete a credential from the OS keyring. Silently succeeds if the entry
/// does not exist.
pub fn delete_credential(key: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    match entry.delete_credential() {
        Ok(()) => Ok(()),
        Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(e.to_string()),
    }
}

/// Keyring first, then the `local_settings` copy.
fn read_value(conn: &Connection, key: &str) -> Option<String> {
    get_credential(key)
        .or_else(|| db::get_setting(conn, SETTINGS_CATEGORY, key))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Write to both stores. A keyring failure is logged; the settings copy
/// must succeed.
fn write_value(conn: &Connection, key: &str, value: &str) -> Result<(), String> {
    if let Err(e) = set_credential(key, value) {
        warn!(key, error = %e, "keyring unavailable, using local settings only");
    }
    // The access token is a secret; it stays out of the plain settings table.
    if key == KEY_ACCESS_TOKEN {
        return Ok(());
    }
    db::set_setting(conn, SETTINGS_CATEGORY, key, value)
}

// ---------------------------------------------------------------------------
// Connection strings
// ---------------------------------------------------------------------------

/// Decode a connection string: either raw JSON or (url-safe) base64 of a
/// JSON object `{ "url": ..., "key": ... }`.
fn decode_connection_string_payload(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.starts_with('{') {
        return serde_json::from_str::<Value>(&compact).ok();
    }
    if compact.len() < 20 {
        return None;
    }

    let base64 = compact.replace('-', "+").replace('_', "/");
    let padded = format!(
        "{}{}",
        base64,
        "=".repeat((4usize.wrapping_sub(base64.len() % 4)) % 4)
    );
    let decoded = BASE64_STANDARD.decode(padded).ok()?;
    serde_json::from_slice::<Value>(&decoded).ok()
}

/// Gateway URL and anon key carried by a connection string.
pub fn parse_connection_string(raw: &str) -> Option<(String, String)> {
    let payload = decode_connection_string_payload(raw)?;
    let url = value_str(&payload, &["url", "gatewayUrl"]).map(|u| normalize_gateway_url(&u))?;
    let key = value_str(&payload, &["key", "anonKey", "anon_key"])?;
    if url.is_empty() {
        return None;
    }
    Some((url, key))
}

// ---------------------------------------------------------------------------
// High-level API
// ---------------------------------------------------------------------------

/// Credentials accepted on setup.
#[derive(Debug, Default, PartialEq)]
pub struct CredentialUpdate {
    pub gateway_url: Option<String>,
    pub anon_key: Option<String>,
    pub access_token: Option<String>,
    pub branch: Option<String>,
}

impl CredentialUpdate {
    /// Parse a setup payload. Accepts camelCase and snake_case keys, plus a
    /// `connectionString` that supplies URL and anon key together.
    pub fn from_payload(payload: &Value) -> Result<Self, String> {
        let mut update = CredentialUpdate {
            gateway_url: value_str(payload, &["gatewayUrl", "gateway_url", "url"])
                .map(|u| normalize_gateway_url(&u)),
            anon_key: value_str(payload, &["anonKey", "anon_key", "gatewayAnonKey"]),
            access_token: value_str(payload, &["accessToken", "access_token"]),
            branch: value_str(payload, &["branch"]),
        };
        if let Some(raw) = value_str(payload, &["connectionString", "connection_string"]) {
            let (url, key) = parse_connection_string(&raw)
                .ok_or("Connection string is not valid")?;
            update.gateway_url = Some(url);
            update.anon_key = Some(key);
        }
        if update == CredentialUpdate::default() {
            return Err("No gateway credentials supplied".into());
        }
        Ok(update)
    }
}

pub fn store_credentials(conn: &Connection, update: &CredentialUpdate) -> Result<(), String> {
    let pairs = [
        (KEY_GATEWAY_URL, &update.gateway_url),
        (KEY_GATEWAY_ANON_KEY, &update.anon_key),
        (KEY_ACCESS_TOKEN, &update.access_token),
        (KEY_BRANCH, &update.branch),
    ];
    for (key, value) in pairs {
        if let Some(v) = value {
            write_value(conn, key, v)?;
        }
    }
    info!(
        url = update.gateway_url.as_deref().unwrap_or("(unchanged)"),
        "gateway credentials updated"
    );
    Ok(())
}

/// Replace or drop the stored session token.
pub fn set_access_token(conn: &Connection, token: Option<&str>) -> Result<(), String> {
    match token.map(str::trim).filter(|t| !t.is_empty()) {
        Some(t) => write_value(conn, KEY_ACCESS_TOKEN, t),
        None => delete_credential(KEY_ACCESS_TOKEN),
    }
}

pub fn branch(conn: &Connection) -> Option<String> {
    read_value(conn, KEY_BRANCH)
}

/// Configured when both the gateway URL and anon key are known.
pub fn is_configured(conn: &Connection) -> bool {
    read_value(conn, KEY_GATEWAY_URL).is_some() && read_value(conn, KEY_GATEWAY_ANON_KEY).is_some()
}

pub fn load_gateway_config(conn: &Connection) -> Result<GatewayConfig, String> {
    let base_url = read_value(conn, KEY_GATEWAY_URL).ok_or("Gateway URL is not configured")?;
    let anon_key = read_value(conn, KEY_GATEWAY_ANON_KEY).ok_or("Gateway key is not configured")?;
    Ok(GatewayConfig {
        base_url,
        anon_key: Zeroizing::new(anon_key),
        access_token: get_credential(KEY_ACCESS_TOKEN).map(Zeroizing::new),
    })
}

/// Stored configuration with secrets reduced to presence flags.
pub fn get_full_config(conn: &Connection) -> Value {
    serde_json::json!({
        "gateway_url": read_value(conn, KEY_GATEWAY_URL),
        "has_anon_key": read_value(conn, KEY_GATEWAY_ANON_KEY).is_some(),
        "has_access_token": get_credential(KEY_ACCESS_TOKEN).is_some(),
        "branch": read_value(conn, KEY_BRANCH),
    })
}

/// Delete every stored credential.
pub fn factory_reset(conn: &Connection) -> Result<Value, String> {
    info!("performing factory reset, deleting all gateway credentials");
    for key in ALL_KEYS {
        delete_credential(key)?;
    }
    db::delete_all_settings(conn, SETTINGS_CATEGORY)?;
    Ok(serde_json::json!({ "success": true }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use serial_test::serial;

    fn encode(json: &str) -> String {
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(json)
    }

    #[test]
    fn connection_string_decodes_url_safe_base64() {
        let raw = encode(r#"{"url":"acme.backend.co/rest/v1","key":"anon-123"}"#);
        assert_eq!(
            parse_connection_string(&raw),
            Some(("https://acme.backend.co".to_string(), "anon-123".to_string()))
        );
    }

    #[test]
    fn connection_string_accepts_plain_json_and_rejects_garbage() {
        assert_eq!(
            parse_connection_string(r#" { "url": "http://localhost:54321", "key": "k" } "#),
            Some(("http://localhost:54321".to_string(), "k".to_string()))
        );
        assert_eq!(parse_connection_string("short"), None);
        assert_eq!(parse_connection_string(&encode(r#"{"url":"x.co"}"#)), None);
    }

    #[test]
    fn credential_update_prefers_connection_string() {
        let payload = serde_json::json!({
            "gatewayUrl": "https://old.backend.co",
            "connectionString": encode(r#"{"url":"new.backend.co","key":"anon-9"}"#),
            "branch": "north",
        });
        let update = CredentialUpdate::from_payload(&payload).unwrap();
        assert_eq!(update.gateway_url.as_deref(), Some("https://new.backend.co"));
        assert_eq!(update.anon_key.as_deref(), Some("anon-9"));
        assert_eq!(update.branch.as_deref(), Some("north"));
        assert!(update.access_token.is_none());
    }

    #[test]
    fn credential_update_rejects_empty_payload() {
        assert!(CredentialUpdate::from_payload(&serde_json::json!({})).is_err());
        assert!(CredentialUpdate::from_payload(&serde_json::json!({
            "connectionString": "not-a-connection-string-at-all"
        }))
        .is_err());
    }

    #[test]
    #[serial]
    fn settings_copy_backs_config_and_never_holds_token() {
        let state = db::test_state();
        let conn = state.conn.lock().unwrap();
        db::set_setting(&conn, SETTINGS_CATEGORY, KEY_GATEWAY_URL, "https://x.backend.co")
            .unwrap();
        db::set_setting(&conn, SETTINGS_CATEGORY, KEY_GATEWAY_ANON_KEY, "anon").unwrap();
        write_value(&conn, KEY_ACCESS_TOKEN, "secret-token").unwrap();

        assert!(is_configured(&conn));
        let config = load_gateway_config(&conn).unwrap();
        assert_eq!(config.base_url, "https://x.backend.co");
        assert_eq!(db::get_setting(&conn, SETTINGS_CATEGORY, KEY_ACCESS_TOKEN), None);
        assert!(format!("{config:?}").contains("[REDACTED]"));
        let _ = delete_credential(KEY_ACCESS_TOKEN);
    }
}
