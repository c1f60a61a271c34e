//! Typed access to the local mirror tables.
//!
//! Every table is keyed by `id` and supports `get`, `put` (upsert),
//! `bulk_put`, `query` and a store-wide `clear`. Queries return owned
//! snapshots. Tables are independently consistent; there is no cross-table
//! transaction. Callers hold the `DbState` lock for the duration of a call.

use chrono::{DateTime, Utc};
use rusqlite::types::ToSql;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, warn};

use crate::db::MIRROR_TABLES;
use crate::models::{
    ts_from_db, ts_to_db, JobOrder, JobStatus, Notification, Priority, ReferenceEntity,
    ReferenceKind, SyncMeta,
};

const JOB_COLUMNS: &str = "id, job_order_number, customer_id, customer_name, designer_id,
    designer_name, salesman_id, salesman_name, job_title_id, job_title, status,
    approval_status, priority, due_date, estimated_hours, actual_hours, total_value,
    invoice_number, branch, job_order_details, delivered_at, created_by, created_at,
    updated_at, approved_by, approved_at";

const DEFAULT_QUERY_LIMIT: i64 = 500;

fn opt_ts(ts: &Option<DateTime<Utc>>) -> Option<String> {
    ts.as_ref().map(ts_to_db)
}

/// `%term%` for `LIKE ... ESCAPE '\'`, with the term's wildcards taken literally.
fn contains_pattern(term: &str) -> String {
    let mut pattern = String::with_capacity(term.len() + 2);
    pattern.push('%');
    for ch in term.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(ch);
    }
    pattern.push('%');
    pattern
}

fn row_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    Ok(row
        .get::<_, Option<String>>(idx)?
        .and_then(|s| ts_from_db(&s)))
}

/// Run `write` for every record inside one transaction. A failing row does
/// not undo the others; the first error is reported once all rows have
/// been attempted.
fn bulk_write<T>(
    conn: &Connection,
    label: &str,
    records: &[T],
    mut write: impl FnMut(&Connection, &T) -> Result<bool, String>,
) -> Result<usize, String> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| format!("{label} bulk begin: {e}"))?;
    let mut written = 0usize;
    let mut first_error: Option<String> = None;
    for record in records {
        match write(&*tx, record) {
            Ok(true) => written += 1,
            Ok(false) => {}
            Err(e) => {
                warn!(table = label, error = %e, "mirror row write failed");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }
    tx.commit().map_err(|e| format!("{label} bulk commit: {e}"))?;
    debug!(table = label, written, total = records.len(), "mirror bulk put");
    match first_error {
        Some(e) => Err(e),
        None => Ok(written),
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<JobOrder> {
    Ok(JobOrder {
        id: row.get(0)?,
        job_order_number: row.get(1)?,
        customer_id: row.get(2)?,
        customer_name: row.get(3)?,
        designer_id: row.get(4)?,
        designer_name: row.get(5)?,
        salesman_id: row.get(6)?,
        salesman_name: row.get(7)?,
        job_title_id: row.get(8)?,
        job_title: row.get(9)?,
        status: row
            .get::<_, String>(10)?
            .parse::<JobStatus>()
            .unwrap_or_default(),
        approval_status: row.get::<_, String>(11)?.parse().unwrap_or_default(),
        priority: row.get::<_, String>(12)?.parse::<Priority>().unwrap_or_default(),
        due_date: row.get(13)?,
        estimated_hours: row.get(14)?,
        actual_hours: row.get(15)?,
        total_value: row.get(16)?,
        invoice_number: row.get(17)?,
        branch: row.get(18)?,
        job_order_details: row.get(19)?,
        delivered_at: row_ts(row, 20)?,
        created_by: row.get(21)?,
        created_at: row_ts(row, 22)?,
        updated_at: row_ts(row, 23)?,
        approved_by: row.get(24)?,
        approved_at: row_ts(row, 25)?,
    })
}

fn write_job(conn: &Connection, job: &JobOrder, only_if_newer: bool) -> Result<bool, String> {
    let guard = if only_if_newer {
        "WHERE jobs.updated_at IS NULL
            OR excluded.updated_at IS NULL
            OR excluded.updated_at >= jobs.updated_at"
    } else {
        ""
    };
    let sql = format!(
        "INSERT INTO jobs ({JOB_COLUMNS})
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                 ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26)
         ON CONFLICT(id) DO UPDATE SET
            job_order_number = excluded.job_order_number,
            customer_id = excluded.customer_id,
            customer_name = excluded.customer_name,
            designer_id = excluded.designer_id,
            designer_name = excluded.designer_name,
            salesman_id = excluded.salesman_id,
            salesman_name = excluded.salesman_name,
            job_title_id = excluded.job_title_id,
            job_title = excluded.job_title,
            status = excluded.status,
            approval_status = excluded.approval_status,
            priority = excluded.priority,
            due_date = excluded.due_date,
            estimated_hours = excluded.estimated_hours,
            actual_hours = excluded.actual_hours,
            total_value = excluded.total_value,
            invoice_number = excluded.invoice_number,
            branch = excluded.branch,
            job_order_details = excluded.job_order_details,
            delivered_at = excluded.delivered_at,
            created_by = excluded.created_by,
            created_at = excluded.created_at,
            updated_at = excluded.updated_at,
            approved_by = excluded.approved_by,
            approved_at = excluded.approved_at
         {guard}"
    );
    let changed = conn
        .execute(
            &sql,
            params![
                job.id,
                job.job_order_number,
                job.customer_id,
                job.customer_name,
                job.designer_id,
                job.designer_name,
                job.salesman_id,
                job.salesman_name,
                job.job_title_id,
                job.job_title,
                job.status.as_str(),
                job.approval_status.as_str(),
                job.priority.as_str(),
                job.due_date,
                job.estimated_hours,
                job.actual_hours,
                job.total_value,
                job.invoice_number,
                job.branch,
                job.job_order_details,
                opt_ts(&job.delivered_at),
                job.created_by,
                opt_ts(&job.created_at),
                opt_ts(&job.updated_at),
                job.approved_by,
                opt_ts(&job.approved_at),
            ],
        )
        .map_err(|e| format!("put job {}: {e}", job.id))?;
    Ok(changed > 0)
}

pub fn get_job(conn: &Connection, id: &str) -> Result<Option<JobOrder>, String> {
    conn.query_row(
        &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
        params![id],
        job_from_row,
    )
    .optional()
    .map_err(|e| format!("get job {id}: {e}"))
}

/// Upsert a job. A row older (by `updated_at`) than the mirrored copy is
/// skipped so a late echo of the backend row cannot undo a newer local
/// update. Returns whether the row was written.
pub fn put_job(conn: &Connection, job: &JobOrder) -> Result<bool, String> {
    write_job(conn, job, true)
}

/// Upsert a job unconditionally.
pub fn replace_job(conn: &Connection, job: &JobOrder) -> Result<bool, String> {
    write_job(conn, job, false)
}

pub fn bulk_put_jobs(conn: &Connection, jobs: &[JobOrder]) -> Result<usize, String> {
    bulk_write(conn, "jobs", jobs, put_job)
}

/// List filter for the job mirror. Empty fields do not constrain.
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobFilter {
    #[serde(alias = "customer_id")]
    pub customer_id: Option<String>,
    #[serde(alias = "salesman_id")]
    pub salesman_id: Option<String>,
    #[serde(alias = "designer_id")]
    pub designer_id: Option<String>,
    #[serde(alias = "created_by")]
    pub created_by: Option<String>,
    pub status: Option<JobStatus>,
    pub branch: Option<String>,
    pub priority: Option<Priority>,
    #[serde(alias = "created_from", alias = "dateFrom")]
    pub created_from: Option<DateTime<Utc>>,
    #[serde(alias = "created_to", alias = "dateTo")]
    pub created_to: Option<DateTime<Utc>>,
    #[serde(alias = "q", alias = "query")]
    pub search: Option<String>,
    pub limit: Option<i64>,
}

pub fn query_jobs(conn: &Connection, filter: &JobFilter) -> Result<Vec<JobOrder>, String> {
    let mut clauses: Vec<String> = Vec::new();
    let mut values: Vec<Box<dyn ToSql>> = Vec::new();

    let mut eq = |column: &str, value: Option<String>| {
        if let Some(v) = value.filter(|v| !v.trim().is_empty()) {
            values.push(Box::new(v));
            clauses.push(format!("{column} = ?{}", values.len()));
        }
    };
    eq("customer_id", filter.customer_id.clone());
    eq("salesman_id", filter.salesman_id.clone());
    eq("designer_id", filter.designer_id.clone());
    eq("created_by", filter.created_by.clone());
    eq("status", filter.status.map(|s| s.as_str().to_string()));
    eq("branch", filter.branch.clone());
    eq("priority", filter.priority.map(|p| p.as_str().to_string()));

    if let Some(from) = filter.created_from {
        values.push(Box::new(ts_to_db(&from)));
        clauses.push(format!("created_at >= ?{}", values.len()));
    }
    if let Some(to) = filter.created_to {
        values.push(Box::new(ts_to_db(&to)));
        clauses.push(format!("created_at <= ?{}", values.len()));
    }
    if let Some(term) = filter.search.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        values.push(Box::new(contains_pattern(term)));
        let n = values.len();
        clauses.push(format!(
            "(job_order_number LIKE ?{n} ESCAPE '\\' OR job_order_details LIKE ?{n} ESCAPE '\\'
              OR customer_name LIKE ?{n} ESCAPE '\\' OR job_title LIKE ?{n} ESCAPE '\\'
              OR invoice_number LIKE ?{n} ESCAPE '\\')"
        ));
    }

    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    values.push(Box::new(filter.limit.unwrap_or(DEFAULT_QUERY_LIMIT).max(1)));
    let sql = format!(
        "SELECT {JOB_COLUMNS} FROM jobs {where_sql}
         ORDER BY COALESCE(created_at, '') DESC, id
         LIMIT ?{}",
        values.len()
    );

    let mut stmt = conn.prepare(&sql).map_err(|e| format!("query jobs: {e}"))?;
    let rows = stmt
        .query_map(
            rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())),
            job_from_row,
        )
        .map_err(|e| format!("query jobs: {e}"))?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("query jobs row: {e}"))
}

// ---------------------------------------------------------------------------
// Reference entities
// ---------------------------------------------------------------------------

fn reference_from_row(row: &Row<'_>) -> rusqlite::Result<ReferenceEntity> {
    Ok(ReferenceEntity {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        phone: row.get(3)?,
        company: row.get(4)?,
        address: row.get(5)?,
        created_at: row_ts(row, 6)?,
    })
}

pub fn get_reference(
    conn: &Connection,
    kind: ReferenceKind,
    id: &str,
) -> Result<Option<ReferenceEntity>, String> {
    conn.query_row(
        &format!(
            "SELECT id, name, email, phone, company, address, created_at
             FROM {} WHERE id = ?1",
            kind.table()
        ),
        params![id],
        reference_from_row,
    )
    .optional()
    .map_err(|e| format!("get {} {id}: {e}", kind.table()))
}

pub fn put_reference(
    conn: &Connection,
    kind: ReferenceKind,
    entity: &ReferenceEntity,
) -> Result<bool, String> {
    conn.execute(
        &format!(
            "INSERT INTO {} (id, name, email, phone, company, address, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                email = excluded.email,
                phone = excluded.phone,
                company = excluded.company,
                address = excluded.address,
                created_at = excluded.created_at",
            kind.table()
        ),
        params![
            entity.id,
            entity.name,
            entity.email,
            entity.phone,
            entity.company,
            entity.address,
            opt_ts(&entity.created_at),
        ],
    )
    .map(|changed| changed > 0)
    .map_err(|e| format!("put {} {}: {e}", kind.table(), entity.id))
}

pub fn bulk_put_references(
    conn: &Connection,
    kind: ReferenceKind,
    entities: &[ReferenceEntity],
) -> Result<usize, String> {
    bulk_write(conn, kind.table(), entities, |c, e| put_reference(c, kind, e))
}

/// Case-insensitive name search, alphabetical. An empty term lists all.
pub fn query_references(
    conn: &Connection,
    kind: ReferenceKind,
    search: Option<&str>,
    limit: Option<i64>,
) -> Result<Vec<ReferenceEntity>, String> {
    let term = search.map(str::trim).unwrap_or_default();
    let pattern = contains_pattern(term);
    let mut stmt = conn
        .prepare(&format!(
            "SELECT id, name, email, phone, company, address, created_at
             FROM {}
             WHERE (?1 = '' OR name LIKE ?2 ESCAPE '\\' OR email LIKE ?2 ESCAPE '\\'
                    OR phone LIKE ?2 ESCAPE '\\')
             ORDER BY name COLLATE NOCASE
             LIMIT ?3",
            kind.table()
        ))
        .map_err(|e| format!("query {}: {e}", kind.table()))?;
    let rows = stmt
        .query_map(
            params![term, pattern, limit.unwrap_or(DEFAULT_QUERY_LIMIT).max(1)],
            reference_from_row,
        )
        .map_err(|e| format!("query {}: {e}", kind.table()))?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("query {} row: {e}", kind.table()))
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

fn notification_from_row(row: &Row<'_>) -> rusqlite::Result<Notification> {
    Ok(Notification {
        id: row.get(0)?,
        user_id: row.get(1)?,
        job_id: row.get(2)?,
        kind: row.get(3)?,
        message: row.get(4)?,
        payload: row
            .get::<_, Option<String>>(5)?
            .and_then(|raw| serde_json::from_str(&raw).ok()),
        read: row.get::<_, i64>(6)? != 0,
        snoozed_until: row_ts(row, 7)?,
        created_at: row_ts(row, 8)?,
    })
}

const NOTIFICATION_COLUMNS: &str =
    "id, user_id, job_id, type, message, payload, read, snoozed_until, created_at";

pub fn get_notification(conn: &Connection, id: &str) -> Result<Option<Notification>, String> {
    conn.query_row(
        &format!("SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE id = ?1"),
        params![id],
        notification_from_row,
    )
    .optional()
    .map_err(|e| format!("get notification {id}: {e}"))
}

/// Replace-by-id upsert; the incoming row wins every field.
pub fn put_notification(conn: &Connection, n: &Notification) -> Result<bool, String> {
    conn.execute(
        &format!(
            "INSERT INTO notifications ({NOTIFICATION_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                user_id = excluded.user_id,
                job_id = excluded.job_id,
                type = excluded.type,
                message = excluded.message,
                payload = excluded.payload,
                read = excluded.read,
                snoozed_until = excluded.snoozed_until,
                created_at = excluded.created_at"
        ),
        params![
            n.id,
            n.user_id,
            n.job_id,
            n.kind,
            n.message,
            n.payload.as_ref().map(|p| p.to_string()),
            n.read as i64,
            opt_ts(&n.snoozed_until),
            opt_ts(&n.created_at),
        ],
    )
    .map(|changed| changed > 0)
    .map_err(|e| format!("put notification {}: {e}", n.id))
}

pub fn bulk_put_notifications(conn: &Connection, items: &[Notification]) -> Result<usize, String> {
    bulk_write(conn, "notifications", items, put_notification)
}

/// Notifications for a user, newest first, optionally narrowed by type.
pub fn query_notifications(
    conn: &Connection,
    user_id: &str,
    kind: Option<&str>,
    limit: Option<i64>,
) -> Result<Vec<Notification>, String> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications
             WHERE user_id = ?1 AND (?2 IS NULL OR type = ?2)
             ORDER BY COALESCE(created_at, '') DESC, id
             LIMIT ?3"
        ))
        .map_err(|e| format!("query notifications: {e}"))?;
    let rows = stmt
        .query_map(
            params![user_id, kind, limit.unwrap_or(DEFAULT_QUERY_LIMIT).max(1)],
            notification_from_row,
        )
        .map_err(|e| format!("query notifications: {e}"))?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("query notifications row: {e}"))
}

// ---------------------------------------------------------------------------
// Sync metadata
// ---------------------------------------------------------------------------

pub fn get_sync_meta(conn: &Connection, store: &str) -> Result<SyncMeta, String> {
    let meta = conn
        .query_row(
            "SELECT id, last_sync_time, sync_in_progress, last_error
             FROM sync_meta WHERE id = ?1",
            params![store],
            |row| {
                Ok(SyncMeta {
                    store: row.get(0)?,
                    last_sync_time: row_ts(row, 1)?,
                    sync_in_progress: row.get::<_, i64>(2)? != 0,
                    last_error: row.get(3)?,
                })
            },
        )
        .optional()
        .map_err(|e| format!("get sync_meta {store}: {e}"))?;
    Ok(meta.unwrap_or_else(|| SyncMeta {
        store: store.to_string(),
        ..Default::default()
    }))
}

/// Atomically flip `sync_in_progress` from 0 to 1. Returns false when a sync
/// is already marked in progress.
pub fn try_begin_sync(conn: &Connection, store: &str) -> Result<bool, String> {
    conn.execute(
        "INSERT OR IGNORE INTO sync_meta (id, sync_in_progress) VALUES (?1, 0)",
        params![store],
    )
    .map_err(|e| format!("sync_meta seed: {e}"))?;
    let changed = conn
        .execute(
            "UPDATE sync_meta SET sync_in_progress = 1 WHERE id = ?1 AND sync_in_progress = 0",
            params![store],
        )
        .map_err(|e| format!("sync_meta begin: {e}"))?;
    Ok(changed == 1)
}

/// Clear the in-progress flag, recording either the sync time or the error.
pub fn finish_sync(
    conn: &Connection,
    store: &str,
    outcome: Result<DateTime<Utc>, &str>,
) -> Result<(), String> {
    conn.execute(
        "INSERT OR IGNORE INTO sync_meta (id, sync_in_progress) VALUES (?1, 0)",
        params![store],
    )
    .map_err(|e| format!("sync_meta seed: {e}"))?;
    let result = match outcome {
        Ok(at) => conn.execute(
            "UPDATE sync_meta SET sync_in_progress = 0, last_sync_time = ?2, last_error = NULL
             WHERE id = ?1",
            params![store, ts_to_db(&at)],
        ),
        Err(error) => conn.execute(
            "UPDATE sync_meta SET sync_in_progress = 0, last_error = ?2 WHERE id = ?1",
            params![store, error],
        ),
    };
    result
        .map(|_| ())
        .map_err(|e| format!("sync_meta finish: {e}"))
}

/// Forget when `store` last synced, so readers treat it as never fetched.
pub fn reset_sync_time(conn: &Connection, store: &str) -> Result<(), String> {
    conn.execute(
        "UPDATE sync_meta SET last_sync_time = NULL, last_error = NULL WHERE id = ?1",
        params![store],
    )
    .map(|_| ())
    .map_err(|e| format!("sync_meta reset {store}: {e}"))
}

/// Reset in-progress flags left behind by a process that exited mid-sync.
pub fn reset_stale_sync_flags(conn: &Connection) -> Result<usize, String> {
    conn.execute(
        "UPDATE sync_meta SET sync_in_progress = 0 WHERE sync_in_progress = 1",
        [],
    )
    .map_err(|e| format!("sync_meta reset: {e}"))
}

// ---------------------------------------------------------------------------
// Store-wide
// ---------------------------------------------------------------------------

/// Drop every mirrored row. Used only by a full resync.
pub fn clear(conn: &Connection) -> Result<(), String> {
    let sql = MIRROR_TABLES
        .iter()
        .map(|t| format!("DELETE FROM {t};"))
        .collect::<String>();
    conn.execute_batch(&format!("BEGIN IMMEDIATE; {sql} COMMIT;"))
        .map_err(|e| {
            let _ = conn.execute_batch("ROLLBACK;");
            format!("clear mirror: {e}")
        })
}

pub fn count_rows(conn: &Connection, table: &str) -> i64 {
    conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::models::ApprovalStatus;
    use chrono::{Duration, TimeZone};

    fn job(id: &str, status: JobStatus) -> JobOrder {
        JobOrder {
            id: id.into(),
            job_order_number: Some(format!("JO-{id}")),
            status,
            ..Default::default()
        }
    }

    #[test]
    fn put_and_get_job_round_trips_all_fields() {
        let state = db::test_state();
        let conn = state.conn.lock().unwrap();
        let ts = Utc.with_ymd_and_hms(2026, 4, 1, 9, 30, 0).unwrap();
        let full = JobOrder {
            id: "job-1".into(),
            job_order_number: Some("JO-1".into()),
            customer_id: Some("c-1".into()),
            customer_name: Some("Acme".into()),
            status: JobStatus::Designing,
            approval_status: ApprovalStatus::Approved,
            priority: Priority::Urgent,
            estimated_hours: Some(3.5),
            total_value: Some(99.0),
            branch: Some("north".into()),
            created_at: Some(ts),
            updated_at: Some(ts),
            approved_at: Some(ts),
            ..Default::default()
        };
        assert!(put_job(&conn, &full).unwrap());
        assert_eq!(get_job(&conn, "job-1").unwrap(), Some(full));
        assert_eq!(get_job(&conn, "missing").unwrap(), None);
    }

    #[test]
    fn put_job_skips_rows_older_than_mirror() {
        let state = db::test_state();
        let conn = state.conn.lock().unwrap();
        let now = Utc::now();

        let mut newer = job("job-1", JobStatus::Completed);
        newer.updated_at = Some(now);
        put_job(&conn, &newer).unwrap();

        let mut stale = job("job-1", JobStatus::Designing);
        stale.updated_at = Some(now - Duration::seconds(5));
        assert!(!put_job(&conn, &stale).unwrap());
        assert_eq!(
            get_job(&conn, "job-1").unwrap().unwrap().status,
            JobStatus::Completed
        );

        assert!(replace_job(&conn, &stale).unwrap());
        assert_eq!(
            get_job(&conn, "job-1").unwrap().unwrap().status,
            JobStatus::Designing
        );
    }

    #[test]
    fn query_jobs_applies_filters_and_search() {
        let state = db::test_state();
        let conn = state.conn.lock().unwrap();
        let base = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let mut jobs = Vec::new();
        for i in 0..4 {
            let mut j = job(&format!("job-{i}"), JobStatus::Pending);
            j.customer_id = Some(if i % 2 == 0 { "c-even" } else { "c-odd" }.into());
            j.created_at = Some(base + Duration::days(i));
            j.job_order_details = Some(format!("banner print {i}"));
            jobs.push(j);
        }
        jobs[3].status = JobStatus::Invoiced;
        jobs[3].job_order_details = Some("vinyl wrap".into());
        assert_eq!(bulk_put_jobs(&conn, &jobs).unwrap(), 4);

        let even = query_jobs(
            &conn,
            &JobFilter {
                customer_id: Some("c-even".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(
            even.iter().map(|j| j.id.as_str()).collect::<Vec<_>>(),
            vec!["job-2", "job-0"]
        );

        let invoiced = query_jobs(
            &conn,
            &JobFilter {
                status: Some(JobStatus::Invoiced),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(invoiced.len(), 1);

        let search = query_jobs(
            &conn,
            &JobFilter {
                search: Some("VINYL".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(search.len(), 1);
        assert_eq!(search[0].id, "job-3");

        let windowed = query_jobs(
            &conn,
            &JobFilter {
                created_from: Some(base + Duration::days(1)),
                created_to: Some(base + Duration::days(2)),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(windowed.len(), 2);
    }

    #[test]
    fn bulk_put_keeps_good_rows_when_one_fails() {
        let state = db::test_state();
        let conn = state.conn.lock().unwrap();
        conn.execute_batch(
            "CREATE TRIGGER reject_bad BEFORE INSERT ON customers
             WHEN NEW.name = 'bad'
             BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
        )
        .unwrap();

        let entities = vec![
            ReferenceEntity {
                id: "c-1".into(),
                name: "good".into(),
                ..Default::default()
            },
            ReferenceEntity {
                id: "c-2".into(),
                name: "bad".into(),
                ..Default::default()
            },
            ReferenceEntity {
                id: "c-3".into(),
                name: "also good".into(),
                ..Default::default()
            },
        ];
        let err = bulk_put_references(&conn, ReferenceKind::Customer, &entities)
            .expect_err("bad row should be reported");
        assert!(err.contains("c-2"), "unexpected error: {err}");
        assert_eq!(count_rows(&conn, "customers"), 2);
    }

    #[test]
    fn query_references_searches_by_name() {
        let state = db::test_state();
        let conn = state.conn.lock().unwrap();
        let designers = ["Zoe", "adam", "Maya"].map(|name| ReferenceEntity {
            id: format!("d-{name}"),
            name: name.into(),
            ..Default::default()
        });
        bulk_put_references(&conn, ReferenceKind::Designer, &designers).unwrap();

        let all = query_references(&conn, ReferenceKind::Designer, None, None).unwrap();
        assert_eq!(
            all.iter().map(|d| d.name.as_str()).collect::<Vec<_>>(),
            vec!["adam", "Maya", "Zoe"]
        );
        let hit = query_references(&conn, ReferenceKind::Designer, Some("MAY"), None).unwrap();
        assert_eq!(hit.len(), 1);
        assert!(query_references(&conn, ReferenceKind::Salesman, None, None)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn search_terms_match_wildcards_literally() {
        let state = db::test_state();
        let conn = state.conn.lock().unwrap();
        let customers = [("c-1", "50% Off Signs"), ("c-2", "500 Prints"), ("c-3", "a_b Media")]
            .map(|(id, name)| ReferenceEntity {
                id: id.into(),
                name: name.into(),
                ..Default::default()
            });
        bulk_put_references(&conn, ReferenceKind::Customer, &customers).unwrap();

        let hit = query_references(&conn, ReferenceKind::Customer, Some("50%"), None).unwrap();
        assert_eq!(hit.iter().map(|c| c.id.as_str()).collect::<Vec<_>>(), vec!["c-1"]);
        let hit = query_references(&conn, ReferenceKind::Customer, Some("a_b"), None).unwrap();
        assert_eq!(hit.len(), 1);
        assert!(query_references(&conn, ReferenceKind::Customer, Some("\\"), None)
            .unwrap()
            .is_empty());

        let mut with_details = job("job-1", JobStatus::Pending);
        with_details.job_order_details = Some("100% cotton".into());
        put_job(&conn, &with_details).unwrap();
        put_job(&conn, &job("job-2", JobStatus::Pending)).unwrap();
        let filter = |term: &str| JobFilter {
            search: Some(term.into()),
            ..Default::default()
        };
        assert_eq!(query_jobs(&conn, &filter("0% c")).unwrap().len(), 1);
        assert!(query_jobs(&conn, &filter("JO_")).unwrap().is_empty());
    }

    #[test]
    fn sync_flag_is_exclusive_until_finished() {
        let state = db::test_state();
        let conn = state.conn.lock().unwrap();
        assert!(try_begin_sync(&conn, "mirror").unwrap());
        assert!(!try_begin_sync(&conn, "mirror").unwrap());

        finish_sync(&conn, "mirror", Err("offline")).unwrap();
        let meta = get_sync_meta(&conn, "mirror").unwrap();
        assert!(!meta.sync_in_progress);
        assert_eq!(meta.last_error.as_deref(), Some("offline"));

        assert!(try_begin_sync(&conn, "mirror").unwrap());
        assert_eq!(reset_stale_sync_flags(&conn).unwrap(), 1);
    }

    #[test]
    fn clear_empties_mirror_but_keeps_settings() {
        let state = db::test_state();
        let conn = state.conn.lock().unwrap();
        put_job(&conn, &job("job-1", JobStatus::Pending)).unwrap();
        db::set_setting(&conn, "gateway", "branch", "north").unwrap();

        clear(&conn).unwrap();
        assert_eq!(count_rows(&conn, "jobs"), 0);
        assert_eq!(db::get_setting(&conn, "gateway", "branch"), Some("north".into()));
    }
}
