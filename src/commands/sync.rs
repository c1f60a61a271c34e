use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::Value;

use super::{normalize_id_payload, parse_payload, required, respond};
use crate::error::AppError;
use crate::AppState;

/// Snooze length when the UI does not pass one.
const DEFAULT_SNOOZE_MINUTES: i64 = 60;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotificationIdPayload {
    #[serde(alias = "notification_id", alias = "id")]
    notification_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnoozePayload {
    #[serde(alias = "notification_id", alias = "id")]
    notification_id: String,
    #[serde(default, alias = "snoozed_until", alias = "until")]
    snoozed_until: Option<DateTime<Utc>>,
    #[serde(default, alias = "minutes")]
    snooze_minutes: Option<i64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct ActiveNotificationsPayload {
    #[serde(alias = "type", alias = "notification_type")]
    kind: Option<String>,
    #[serde(alias = "high_priority")]
    high_priority: bool,
}

fn parse_notification_id_payload(arg0: Option<Value>) -> Result<String, String> {
    let parsed: NotificationIdPayload = parse_payload(
        normalize_id_payload(arg0, "notificationId"),
        "notification",
    )?;
    required(parsed.notification_id, "notificationId")
}

fn parse_snooze_payload(
    arg0: Option<Value>,
    now: DateTime<Utc>,
) -> Result<(String, DateTime<Utc>), String> {
    let parsed: SnoozePayload = parse_payload(arg0.unwrap_or(Value::Null), "snooze")?;
    let id = required(parsed.notification_id, "notificationId")?;
    let until = match (parsed.snoozed_until, parsed.snooze_minutes) {
        (Some(until), _) => until,
        (None, Some(minutes)) if minutes > 0 => now + Duration::minutes(minutes),
        (None, Some(_)) => return Err("snoozeMinutes must be positive".into()),
        (None, None) => now + Duration::minutes(DEFAULT_SNOOZE_MINUTES),
    };
    if until <= now {
        return Err("Snooze time must be in the future".into());
    }
    Ok((id, until))
}

fn parse_active_notifications_payload(arg0: Option<Value>) -> ActiveNotificationsPayload {
    match arg0 {
        Some(Value::String(kind)) => ActiveNotificationsPayload {
            kind: Some(kind),
            high_priority: false,
        },
        Some(v @ Value::Object(_)) => serde_json::from_value(v).unwrap_or_default(),
        _ => ActiveNotificationsPayload::default(),
    }
}

fn signed_in_user(state: &AppState) -> Result<String, AppError> {
    let claims = state.claims();
    if claims.user_id.is_empty() {
        return Err(AppError::Validation("No signed-in user".into()));
    }
    Ok(claims.user_id)
}

pub async fn sync_full_resync(state: &AppState) -> Result<Value, String> {
    Ok(respond("sync_full_resync", "result", state.sync.full_resync().await))
}

pub async fn sync_get_status(state: &AppState) -> Result<Value, String> {
    Ok(respond("sync_get_status", "status", state.sync.sync_status()))
}

/// Pull the newest notifications for the signed-in user.
pub async fn sync_notifications(state: &AppState) -> Result<Value, String> {
    let result = match signed_in_user(state) {
        Ok(user_id) => state.sync.sync_notifications(&user_id).await,
        Err(e) => Err(e),
    };
    Ok(respond("sync_notifications", "count", result))
}

pub async fn notifications_get_active(
    state: &AppState,
    arg0: Option<Value>,
) -> Result<Value, String> {
    let payload = parse_active_notifications_payload(arg0);
    let now = Utc::now();
    let result = signed_in_user(state).and_then(|user_id| {
        if payload.high_priority {
            state
                .sync
                .get_active_high_priority_notifications(&user_id, now)
        } else {
            state
                .sync
                .get_active_notifications(&user_id, payload.kind.as_deref(), now)
        }
    });
    Ok(respond("notifications_get_active", "notifications", result))
}

pub async fn notifications_mark_read(
    state: &AppState,
    arg0: Option<Value>,
) -> Result<Value, String> {
    let id = parse_notification_id_payload(arg0)?;
    Ok(respond(
        "notifications_mark_read",
        "notification",
        state.sync.mark_notification_read(&id).await,
    ))
}

pub async fn notifications_snooze(state: &AppState, arg0: Option<Value>) -> Result<Value, String> {
    let (id, until) = parse_snooze_payload(arg0, Utc::now())?;
    Ok(respond(
        "notifications_snooze",
        "notification",
        state.sync.snooze_notification(&id, until).await,
    ))
}
