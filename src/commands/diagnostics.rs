use serde_json::Value;
use std::path::PathBuf;
use tracing::info;

use crate::db::DbState;
use crate::diagnostics;

fn parse_export_dir_payload(arg0: Option<Value>) -> Option<PathBuf> {
    let raw = match arg0 {
        Some(Value::String(path)) => Some(path),
        Some(Value::Object(obj)) => ["path", "exportPath", "export_path", "dir"]
            .iter()
            .find_map(|key| obj.get(*key).and_then(Value::as_str))
            .map(str::to_string),
        _ => None,
    };
    raw.map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
}

pub async fn diagnostics_get_about() -> Result<Value, String> {
    Ok(diagnostics::get_about_info())
}

pub async fn diagnostics_get_mirror_health(db: &DbState) -> Result<Value, String> {
    diagnostics::get_mirror_health(db)
}

/// Export into the given directory, or next to the logs when none is given.
pub async fn diagnostics_export(db: &DbState, arg0: Option<Value>) -> Result<Value, String> {
    let dir = parse_export_dir_payload(arg0)
        .unwrap_or_else(|| diagnostics::get_log_dir().join("exports"));
    let path = diagnostics::export_diagnostics(db, &dir)?;
    info!(path = %path, "diagnostics export requested");
    Ok(serde_json::json!({ "success": true, "path": path }))
}
