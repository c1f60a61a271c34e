//! Diagnostics for the job orders desk.
//!
//! Provides:
//! - **About info**: version, build timestamp, git SHA, platform
//! - **Mirror health**: schema version, row counts, sync metadata, file sizes
//! - **Diagnostics export**: a JSON report with secrets redacted
//! - **Log rotation helpers**: used by `lib.rs` to configure rolling log files.

use chrono::Utc;
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::db::{self, DbState, MIRROR_TABLES};
use crate::mirror;
use crate::storage;
use crate::sync::{MIRROR_STORE, NOTIFICATIONS_STORE};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 10;

/// Rolling log file prefix.
pub const LOG_FILE_PREFIX: &str = "job-orders";

/// Overrides the log directory.
pub const LOG_DIR_ENV: &str = "JOB_ORDERS_LOG_DIR";

// ---------------------------------------------------------------------------
// About info
// ---------------------------------------------------------------------------

/// Returns version, build timestamp, git SHA, and platform info.
pub fn get_about_info() -> Value {
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "buildTimestamp": env!("BUILD_TIMESTAMP"),
        "gitSha": env!("BUILD_GIT_SHA"),
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "rustVersion": env!("CARGO_PKG_RUST_VERSION"),
    })
}

// ---------------------------------------------------------------------------
// Mirror health
// ---------------------------------------------------------------------------

fn file_size(path: &Path) -> Option<u64> {
    fs::metadata(path).ok().map(|m| m.len())
}

fn sync_meta_json(conn: &rusqlite::Connection, store: &str) -> Value {
    match mirror::get_sync_meta(conn, store) {
        Ok(meta) => json!({
            "lastSyncTime": meta.last_sync_time.map(|t| t.to_rfc3339()),
            "syncInProgress": meta.sync_in_progress,
            "lastError": meta.last_error,
        }),
        Err(e) => json!({ "error": e }),
    }
}

/// Schema version, row counts, sync metadata and on-disk size of the mirror.
pub fn get_mirror_health(db: &DbState) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let mut counts = serde_json::Map::new();
    for table in MIRROR_TABLES {
        counts.insert(table.to_string(), mirror::count_rows(&conn, table).into());
    }

    let wal_path = PathBuf::from(format!("{}-wal", db.db_path.display()));
    Ok(json!({
        "schemaVersion": db::schema_version(&conn),
        "expectedSchemaVersion": db::CURRENT_SCHEMA_VERSION,
        "counts": counts,
        "mirrorSync": sync_meta_json(&conn, MIRROR_STORE),
        "notificationSync": sync_meta_json(&conn, NOTIFICATIONS_STORE),
        "gatewayConfigured": storage::is_configured(&conn),
        "dbPath": db.db_path.display().to_string(),
        "dbSizeBytes": file_size(&db.db_path),
        "walSizeBytes": file_size(&wal_path),
    }))
}

// ---------------------------------------------------------------------------
// Export
// ---------------------------------------------------------------------------

/// Write a JSON diagnostics report into `output_dir` and return its path.
pub fn export_diagnostics(db: &DbState, output_dir: &Path) -> Result<String, String> {
    fs::create_dir_all(output_dir).map_err(|e| format!("create export dir: {e}"))?;

    let settings = {
        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        json!({
            "gateway": db::get_settings_in_category(&conn, storage::SETTINGS_CATEGORY),
            "system": db::get_settings_in_category(&conn, crate::system_config::SETTINGS_CATEGORY),
        })
    };
    let log_files: Vec<String> = list_log_files(&get_log_dir())
        .into_iter()
        .filter_map(|(p, _)| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .collect();

    let report = json!({
        "reportId": uuid::Uuid::new_v4().to_string(),
        "generatedAt": Utc::now().to_rfc3339(),
        "about": get_about_info(),
        "health": get_mirror_health(db)?,
        "settings": redact_sensitive_fields(settings),
        "logFiles": log_files,
    });

    let path = output_dir.join(format!(
        "diagnostics-{}.json",
        Utc::now().format("%Y%m%d-%H%M%S")
    ));
    let body = serde_json::to_string_pretty(&report).map_err(|e| e.to_string())?;
    fs::write(&path, body).map_err(|e| format!("write diagnostics: {e}"))?;
    info!(path = %path.display(), "diagnostics exported");
    Ok(path.display().to_string())
}

fn redact_sensitive_fields(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| {
                    if should_redact_key(&k) {
                        (k, Value::String("[REDACTED]".into()))
                    } else {
                        (k, redact_sensitive_fields(v))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(redact_sensitive_fields).collect()),
        other => other,
    }
}

fn should_redact_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    ["key", "token", "secret", "password", "authorization"]
        .iter()
        .any(|marker| lower.contains(marker))
}

// ---------------------------------------------------------------------------
// Log rotation
// ---------------------------------------------------------------------------

/// Returns the log directory path (same location used by lib.rs).
pub fn get_log_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(LOG_DIR_ENV) {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    let base = std::env::var("LOCALAPPDATA")
        .or_else(|_| std::env::var("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            #[cfg(target_os = "windows")]
            {
                PathBuf::from(std::env::var("USERPROFILE").unwrap_or_else(|_| ".".into()))
                    .join("AppData")
                    .join("Local")
            }
            #[cfg(not(target_os = "windows"))]
            {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                    .join(".local")
                    .join("share")
            }
        });
    base.join("com.joborders.desk").join("logs")
}

fn list_log_files(log_dir: &Path) -> Vec<(PathBuf, std::time::SystemTime)> {
    let mut log_files = Vec::new();
    if let Ok(entries) = fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let is_log = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|name| name.starts_with(&format!("{LOG_FILE_PREFIX}.")))
                .unwrap_or(false);
            if is_log {
                let modified = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(std::time::UNIX_EPOCH);
                log_files.push((path, modified));
            }
        }
    }
    // Newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));
    log_files
}

/// Prune old log files, keeping only the most recent `MAX_LOG_FILES`.
pub fn prune_old_logs(log_dir: &Path) -> usize {
    let mut removed = 0;
    for (path, _) in list_log_files(log_dir).iter().skip(MAX_LOG_FILES) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to prune log file {}: {e}", path.display()),
        }
    }
    removed
}
