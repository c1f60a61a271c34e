//! Sync service for the local mirror.
//!
//! Pulls reference tables, the recent job-order window and per-user
//! notifications from the backend into the mirror, and applies local
//! partial updates after a successful remote write. A full resync is
//! exclusive: a second request while one is running returns
//! [`SyncOutcome::Skipped`] instead of queueing. Mirror writes made while a
//! resync is fetching are recorded and replayed on top of the fresh
//! snapshot, so the resync never rolls them back.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::Connection;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::db::{DbState, MIRROR_TABLES};
use crate::error::{AppError, AppResult};
use crate::gateway::{Gateway, Query};
use crate::mirror::{self, JobFilter};
use crate::models::{
    ts_to_db, JobOrder, Notification, ReferenceEntity, ReferenceKind, HIGH_PRIORITY_PENDING,
};
use crate::value_str;

/// `sync_meta` key for the full mirror resync.
pub const MIRROR_STORE: &str = "mirror";
/// `sync_meta` key for notification pulls.
pub const NOTIFICATIONS_STORE: &str = "notifications";

/// Most recent job orders (by `updated_at`) kept in the mirror.
pub const JOB_WINDOW: usize = 500;
/// Newest notifications fetched per pull.
pub const NOTIFICATION_FETCH_LIMIT: usize = 100;
const REFERENCE_FETCH_LIMIT: usize = 1000;

/// Backend table names. The mirror names its job table `jobs`.
pub const JOB_ORDERS_TABLE: &str = "job_orders";
pub const NOTIFICATIONS_TABLE: &str = "notifications";

/// Job select with the display names of joined reference rows.
pub const JOB_SELECT: &str = "*,customer:customers(name),designer:designers(name),\
salesman:salesmen(name),job_title_ref:job_titles(name)";

// ---------------------------------------------------------------------------
// Freshness policy
// ---------------------------------------------------------------------------

/// Staleness windows for cached reads. Advisory: callers decide whether a
/// stale read triggers a refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheFreshness {
    Reference,
    Dashboard,
    Search,
    Activity,
    Notifications,
}

impl CacheFreshness {
    pub fn stale_after(&self) -> ChronoDuration {
        match self {
            CacheFreshness::Reference => ChronoDuration::minutes(30),
            CacheFreshness::Dashboard => ChronoDuration::minutes(5),
            CacheFreshness::Search => ChronoDuration::minutes(1),
            CacheFreshness::Activity => ChronoDuration::seconds(30),
            CacheFreshness::Notifications => ChronoDuration::seconds(60),
        }
    }

    /// Never-fetched data is stale.
    pub fn is_stale(&self, last_fetched: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match last_fetched {
            Some(at) => now - at >= self.stale_after(),
            None => true,
        }
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    #[serde(rename_all = "camelCase")]
    Completed {
        jobs: usize,
        references: usize,
        finished_at: DateTime<Utc>,
    },
    /// Another resync was already running; nothing was done.
    Skipped,
}

/// A mirror write recorded while a resync runs.
#[derive(Debug, Clone)]
enum DeferredWrite {
    JobPatch {
        job_id: String,
        partial: serde_json::Map<String, Value>,
        stamp: String,
    },
    Job(JobOrder),
    References(ReferenceKind, Vec<ReferenceEntity>),
    Notifications {
        items: Vec<Notification>,
        pulled_at: Option<DateTime<Utc>>,
    },
}

impl DeferredWrite {
    fn replay(&self, conn: &Connection) -> Result<(), String> {
        match self {
            DeferredWrite::JobPatch {
                job_id,
                partial,
                stamp,
            } => apply_job_patch(conn, job_id, partial, stamp).map(|_| ()),
            DeferredWrite::Job(job) => mirror::put_job(conn, job).map(|_| ()),
            DeferredWrite::References(kind, entities) => {
                mirror::bulk_put_references(conn, *kind, entities).map(|_| ())
            }
            DeferredWrite::Notifications { items, pulled_at } => {
                mirror::bulk_put_notifications(conn, items)?;
                match pulled_at {
                    Some(at) => mirror::finish_sync(conn, NOTIFICATIONS_STORE, Ok(*at)),
                    None => Ok(()),
                }
            }
        }
    }
}

/// Clears the in-memory resync flag however the resync ends.
struct ResyncGuard<'a>(&'a AtomicBool);

impl Drop for ResyncGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct SyncService {
    db: Arc<DbState>,
    gateway: Arc<dyn Gateway>,
    resync_running: AtomicBool,
    deferred: Mutex<Vec<DeferredWrite>>,
}

impl SyncService {
    pub fn new(db: Arc<DbState>, gateway: Arc<dyn Gateway>) -> Self {
        // A previous process may have exited mid-sync.
        if let Ok(conn) = db.conn.lock() {
            match mirror::reset_stale_sync_flags(&conn) {
                Ok(0) => {}
                Ok(n) => info!(stores = n, "cleared stale sync-in-progress flags"),
                Err(e) => warn!(error = %e, "failed to clear stale sync flags"),
            }
        }
        Self {
            db,
            gateway,
            resync_running: AtomicBool::new(false),
            deferred: Mutex::new(Vec::new()),
        }
    }

    pub fn gateway(&self) -> &Arc<dyn Gateway> {
        &self.gateway
    }

    /// Run `f` with the mirror connection locked. Never call across an await.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, String>,
    ) -> AppResult<T> {
        let conn = self
            .db
            .conn
            .lock()
            .map_err(|e| AppError::Cache(e.to_string()))?;
        f(&conn).map_err(AppError::Cache)
    }

    pub fn is_resync_running(&self) -> bool {
        self.resync_running.load(Ordering::SeqCst)
    }

    /// Record `write` for replay if a resync is running. Call with the
    /// mirror connection held so recording and the resync swap are ordered.
    fn defer_if_resyncing(&self, write: impl FnOnce() -> DeferredWrite) {
        if !self.is_resync_running() {
            return;
        }
        match self.deferred.lock() {
            Ok(mut queue) => queue.push(write()),
            Err(e) => warn!(error = %e, "deferred write queue poisoned"),
        }
    }

    fn take_deferred(&self) -> Vec<DeferredWrite> {
        self.deferred
            .lock()
            .map(|mut queue| std::mem::take(&mut *queue))
            .unwrap_or_default()
    }

    /// Run a mirror write, recording it for replay during a resync.
    fn write_mirror<T>(
        &self,
        deferred: impl FnOnce() -> DeferredWrite,
        f: impl FnOnce(&Connection) -> Result<T, String>,
    ) -> AppResult<T> {
        self.with_conn(|conn| {
            self.defer_if_resyncing(deferred);
            f(conn)
        })
    }

    // -- Full resync ---------------------------------------------------------

    /// Replace the mirror with a fresh copy of the reference tables and the
    /// job-order window. Returns `Skipped` if a resync is already running.
    pub async fn full_resync(&self) -> AppResult<SyncOutcome> {
        if self
            .resync_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            debug!("full resync already running, skipping");
            return Ok(SyncOutcome::Skipped);
        }
        let _guard = ResyncGuard(&self.resync_running);

        if !self.with_conn(|conn| mirror::try_begin_sync(conn, MIRROR_STORE))? {
            debug!("full resync flagged in progress in sync_meta, skipping");
            return Ok(SyncOutcome::Skipped);
        }
        // Leftovers from a failed resync are already reflected in the backend.
        self.take_deferred();

        info!("full resync started");
        let result = self.run_full_resync().await;

        let finish = match &result {
            Ok(SyncOutcome::Completed { finished_at, .. }) => Ok(*finished_at),
            Ok(SyncOutcome::Skipped) => Ok(Utc::now()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(e) = self.with_conn(|conn| {
            mirror::finish_sync(conn, MIRROR_STORE, finish.as_ref().map(|t| *t).map_err(String::as_str))
        }) {
            warn!(error = %e, "failed to record resync outcome");
        }

        match &result {
            Ok(SyncOutcome::Completed {
                jobs, references, ..
            }) => info!(jobs, references, "full resync complete"),
            Ok(SyncOutcome::Skipped) => {}
            Err(e) => warn!(error = %e, "full resync failed"),
        }
        result
    }

    async fn run_full_resync(&self) -> AppResult<SyncOutcome> {
        // Fetch everything before clearing so an offline resync leaves the
        // mirror intact.
        let mut references: Vec<(ReferenceKind, Vec<ReferenceEntity>)> = Vec::new();
        for kind in ReferenceKind::ALL {
            let rows = self
                .gateway
                .query(
                    kind.table(),
                    &Query::new().order_asc("name").limit(REFERENCE_FETCH_LIMIT),
                )
                .await
                .map_err(AppError::Gateway)?;
            let entities: Vec<ReferenceEntity> =
                rows.iter().filter_map(ReferenceEntity::from_remote).collect();
            references.push((kind, entities));
        }

        let job_rows = self
            .gateway
            .query(
                JOB_ORDERS_TABLE,
                &Query::new()
                    .select(JOB_SELECT)
                    .order_desc("updated_at")
                    .limit(JOB_WINDOW),
            )
            .await
            .map_err(AppError::Gateway)?;
        let jobs: Vec<JobOrder> = job_rows.iter().filter_map(JobOrder::from_remote).collect();
        if jobs.len() < job_rows.len() {
            warn!(
                skipped = job_rows.len() - jobs.len(),
                "job rows without id ignored"
            );
        }

        self.with_conn(|conn| {
            mirror::clear(conn)?;
            // Notifications are cleared but not re-pulled here.
            mirror::reset_sync_time(conn, NOTIFICATIONS_STORE)?;
            let mut reference_count = 0usize;
            let mut first_error: Option<String> = None;
            for (kind, entities) in &references {
                match mirror::bulk_put_references(conn, *kind, entities) {
                    Ok(n) => reference_count += n,
                    Err(e) => {
                        first_error.get_or_insert(e);
                    }
                }
            }
            let job_count = match mirror::bulk_put_jobs(conn, &jobs) {
                Ok(n) => n,
                Err(e) => {
                    first_error.get_or_insert(e);
                    0
                }
            };
            let deferred = self.take_deferred();
            if !deferred.is_empty() {
                debug!(writes = deferred.len(), "replaying writes made during resync");
            }
            for write in &deferred {
                if let Err(e) = write.replay(conn) {
                    warn!(error = %e, "replaying deferred mirror write failed");
                }
            }
            match first_error {
                Some(e) => Err(e),
                None => Ok(SyncOutcome::Completed {
                    jobs: job_count,
                    references: reference_count,
                    finished_at: Utc::now(),
                }),
            }
        })
    }

    /// Whether the mirror is older than `freshness` allows.
    pub fn mirror_is_stale(&self, freshness: CacheFreshness, now: DateTime<Utc>) -> bool {
        self.with_conn(|conn| mirror::get_sync_meta(conn, MIRROR_STORE))
            .map(|meta| freshness.is_stale(meta.last_sync_time, now))
            .unwrap_or(true)
    }

    // -- Jobs ----------------------------------------------------------------

    /// Merge `partial` into the mirrored job. Absent fields are unchanged,
    /// unknown fields and unparseable enum values are ignored, a job that is
    /// not mirrored is left alone. Returns whether the mirror was written;
    /// cache failures are logged, not returned.
    pub fn update_job_in_cache(&self, job_id: &str, partial: &Value) -> bool {
        let Some(fields) = partial.as_object() else {
            warn!(job_id, "job cache update ignored: partial is not an object");
            return false;
        };

        let stamp = ts_to_db(&Utc::now());
        let result = self.write_mirror(
            || DeferredWrite::JobPatch {
                job_id: job_id.to_string(),
                partial: fields.clone(),
                stamp: stamp.clone(),
            },
            |conn| apply_job_patch(conn, job_id, fields, &stamp),
        );

        match result {
            Ok(written) => written,
            Err(e) => {
                warn!(job_id, error = %e, "job cache update failed");
                false
            }
        }
    }

    /// Mirror read, falling back to a backend fetch that is then cached.
    pub async fn get_job(&self, job_id: &str) -> AppResult<Option<JobOrder>> {
        if job_id.trim().is_empty() {
            return Err(AppError::Validation("Job id is required".into()));
        }
        if let Some(job) = self.with_conn(|conn| mirror::get_job(conn, job_id))? {
            return Ok(Some(job));
        }
        let rows = self
            .gateway
            .query(
                JOB_ORDERS_TABLE,
                &Query::new().select(JOB_SELECT).eq("id", job_id).limit(1),
            )
            .await
            .map_err(AppError::Gateway)?;
        match rows.first() {
            Some(row) => self.cache_remote_job(row).map(Some),
            None => Ok(None),
        }
    }

    pub fn list_jobs(&self, filter: &JobFilter) -> AppResult<Vec<JobOrder>> {
        self.with_conn(|conn| mirror::query_jobs(conn, filter))
    }

    /// Store a backend job row in the mirror and return it.
    pub fn cache_remote_job(&self, row: &Value) -> AppResult<JobOrder> {
        let job = JobOrder::from_remote(row)
            .ok_or_else(|| AppError::Gateway("Backend returned a job without an id".into()))?;
        if let Err(e) = self.write_mirror(
            || DeferredWrite::Job(job.clone()),
            |conn| mirror::put_job(conn, &job),
        ) {
            warn!(job_id = %job.id, error = %e, "caching backend job failed");
        }
        Ok(job)
    }

    // -- Notifications -------------------------------------------------------

    /// Pull the newest notifications for `user_id` and upsert them by id.
    /// Rows already mirrored but absent from the response are kept.
    pub async fn sync_notifications(&self, user_id: &str) -> AppResult<usize> {
        if user_id.trim().is_empty() {
            return Err(AppError::Validation("User id is required".into()));
        }
        let rows = match self
            .gateway
            .query(
                NOTIFICATIONS_TABLE,
                &Query::new()
                    .eq("user_id", user_id)
                    .order_desc("created_at")
                    .limit(NOTIFICATION_FETCH_LIMIT),
            )
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!(user_id, error = %e, "notification pull failed");
                let _ = self.with_conn(|conn| {
                    mirror::finish_sync(conn, NOTIFICATIONS_STORE, Err(e.as_str()))
                });
                return Err(AppError::Gateway(e));
            }
        };
        let items: Vec<Notification> = rows.iter().filter_map(Notification::from_remote).collect();

        let pulled_at = Utc::now();
        let written = self.write_mirror(
            || DeferredWrite::Notifications {
                items: items.clone(),
                pulled_at: Some(pulled_at),
            },
            |conn| {
                let written = mirror::bulk_put_notifications(conn, &items);
                mirror::finish_sync(conn, NOTIFICATIONS_STORE, Ok(pulled_at))?;
                written
            },
        );
        match written {
            Ok(n) => {
                debug!(user_id, count = n, "notifications synced");
                Ok(n)
            }
            Err(e) => {
                warn!(user_id, error = %e, "notification cache write failed");
                Ok(0)
            }
        }
    }

    /// Active notifications for `user_id`, newest first, optionally of one type.
    pub fn get_active_notifications(
        &self,
        user_id: &str,
        kind: Option<&str>,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<Notification>> {
        let all = self.with_conn(|conn| mirror::query_notifications(conn, user_id, kind, None))?;
        Ok(all.into_iter().filter(|n| n.is_active(now)).collect())
    }

    pub fn get_active_high_priority_notifications(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<Notification>> {
        self.get_active_notifications(user_id, Some(HIGH_PRIORITY_PENDING), now)
    }

    pub async fn mark_notification_read(&self, id: &str) -> AppResult<Notification> {
        self.patch_notification(id, serde_json::json!({ "read": true }), |n| n.read = true)
            .await
    }

    pub async fn snooze_notification(
        &self,
        id: &str,
        until: DateTime<Utc>,
    ) -> AppResult<Notification> {
        self.patch_notification(
            id,
            serde_json::json!({ "snoozed_until": ts_to_db(&until) }),
            |n| n.snoozed_until = Some(until),
        )
        .await
    }

    async fn patch_notification(
        &self,
        id: &str,
        partial: Value,
        apply: impl FnOnce(&mut Notification),
    ) -> AppResult<Notification> {
        let mut current = self
            .with_conn(|conn| mirror::get_notification(conn, id))?
            .ok_or_else(|| AppError::Validation(format!("Notification {id} not found")))?;
        self.gateway
            .update(NOTIFICATIONS_TABLE, id, partial)
            .await
            .map_err(AppError::Gateway)?;
        apply(&mut current);
        if let Err(e) = self.write_mirror(
            || DeferredWrite::Notifications {
                items: vec![current.clone()],
                pulled_at: None,
            },
            |conn| mirror::put_notification(conn, &current),
        ) {
            warn!(notification_id = id, error = %e, "notification cache write failed");
        }
        Ok(current)
    }

    // -- Reference entities --------------------------------------------------

    /// Mirror search, then backend search (cached) when the mirror has nothing.
    pub async fn search_references(
        &self,
        kind: ReferenceKind,
        term: &str,
    ) -> AppResult<Vec<ReferenceEntity>> {
        let local = self.with_conn(|conn| mirror::query_references(conn, kind, Some(term), None))?;
        if !local.is_empty() || term.trim().is_empty() {
            return Ok(local);
        }
        self.fetch_references(kind, term).await
    }

    /// Backend name search; results are cached.
    async fn fetch_references(
        &self,
        kind: ReferenceKind,
        term: &str,
    ) -> AppResult<Vec<ReferenceEntity>> {
        let rows = self
            .gateway
            .query(
                kind.table(),
                &Query::new().ilike("name", term.trim()).order_asc("name").limit(50),
            )
            .await
            .map_err(AppError::Gateway)?;
        let remote: Vec<ReferenceEntity> = rows.iter().filter_map(ReferenceEntity::from_remote).collect();
        self.cache_references(kind, &remote);
        Ok(remote)
    }

    fn cache_references(&self, kind: ReferenceKind, entities: &[ReferenceEntity]) {
        if entities.is_empty() {
            return;
        }
        if let Err(e) = self.write_mirror(
            || DeferredWrite::References(kind, entities.to_vec()),
            |conn| mirror::bulk_put_references(conn, kind, entities),
        ) {
            warn!(table = kind.table(), error = %e, "reference cache write failed");
        }
    }

    /// Return the entity named `name` (case-insensitive), creating it on the
    /// backend when neither the mirror nor the backend has one.
    pub async fn find_or_create_reference(
        &self,
        kind: ReferenceKind,
        name: &str,
        details: &Value,
    ) -> AppResult<ReferenceEntity> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::Validation("Name is required".into()));
        }
        let same_name = |e: &ReferenceEntity| e.name.trim().eq_ignore_ascii_case(name);

        let local = self.with_conn(|conn| mirror::query_references(conn, kind, Some(name), None))?;
        if let Some(found) = local.into_iter().find(|e| same_name(e)) {
            return Ok(found);
        }
        // The mirror may hold only near matches; the backend decides.
        if let Some(found) = self
            .fetch_references(kind, name)
            .await?
            .into_iter()
            .find(|e| same_name(e))
        {
            return Ok(found);
        }

        let mut record = serde_json::json!({ "name": name });
        for key in ["email", "phone", "company", "address"] {
            if let Some(v) = value_str(details, &[key]) {
                record[key] = Value::String(v);
            }
        }
        let stored = self
            .gateway
            .insert(kind.table(), record)
            .await
            .map_err(AppError::Gateway)?;
        let entity = ReferenceEntity::from_remote(&stored)
            .ok_or_else(|| AppError::Gateway(format!("{} insert returned no id", kind.table())))?;
        self.cache_references(kind, std::slice::from_ref(&entity));
        info!(table = kind.table(), id = %entity.id, "reference entity created");
        Ok(entity)
    }

    // -- Status --------------------------------------------------------------

    pub fn sync_status(&self) -> AppResult<Value> {
        let running = self.is_resync_running();
        self.with_conn(|conn| {
            let meta = mirror::get_sync_meta(conn, MIRROR_STORE)?;
            let notifications = mirror::get_sync_meta(conn, NOTIFICATIONS_STORE)?;
            let mut counts = serde_json::Map::new();
            for table in MIRROR_TABLES {
                counts.insert(table.to_string(), mirror::count_rows(conn, table).into());
            }
            Ok(serde_json::json!({
                "lastSyncTime": meta.last_sync_time.map(|t| ts_to_db(&t)),
                "syncInProgress": running || meta.sync_in_progress,
                "lastError": meta.last_error,
                "notificationsSyncedAt": notifications.last_sync_time.map(|t| ts_to_db(&t)),
                "counts": counts,
            }))
        })
    }
}

/// Merge `fields` into the mirrored job and stamp `updated_at`. Returns
/// false when the job is not mirrored.
fn apply_job_patch(
    conn: &Connection,
    job_id: &str,
    fields: &serde_json::Map<String, Value>,
    stamp: &str,
) -> Result<bool, String> {
    let Some(job) = mirror::get_job(conn, job_id)? else {
        debug!(job_id, "job not mirrored, cache update skipped");
        return Ok(false);
    };
    let mut merged = serde_json::to_value(&job).map_err(|e| e.to_string())?;
    let Some(target) = merged.as_object_mut() else {
        return Ok(false);
    };
    for (key, value) in fields {
        if key == "id" || !target.contains_key(key) {
            debug!(job_id, field = %key, "unknown job field ignored");
            continue;
        }
        if !enum_field_accepts(key, value) {
            warn!(job_id, field = %key, value = %value, "invalid value ignored");
            continue;
        }
        target.insert(key.clone(), value.clone());
    }
    target.insert("updated_at".to_string(), Value::String(stamp.to_string()));

    let updated = JobOrder::from_remote(&merged)
        .ok_or_else(|| format!("job {job_id} lost its id during merge"))?;
    mirror::replace_job(conn, &updated)
}

/// Enum-typed job fields only accept values that parse.
fn enum_field_accepts(key: &str, value: &Value) -> bool {
    let Some(raw) = value.as_str() else {
        return !matches!(key, "status" | "approval_status" | "priority");
    };
    match key {
        "status" => raw.parse::<crate::models::JobStatus>().is_ok(),
        "approval_status" => raw.parse::<crate::models::ApprovalStatus>().is_ok(),
        "priority" => raw.parse::<crate::models::Priority>().is_ok(),
        _ => true,
    }
}
