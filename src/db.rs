//! Local SQLite database layer for the job-order mirror.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations, settings helpers,
//! and the shared connection state used by the mirror, sync service and
//! command layer. The database is a disposable cache of the hosted backend:
//! if it cannot be opened it is deleted and rebuilt on the next full resync.

use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

/// Shared state holding the mirror database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
pub(crate) const CURRENT_SCHEMA_VERSION: i32 = 3;

/// Tables cleared by a full resync. `sync_meta` and `local_settings` survive.
pub const MIRROR_TABLES: &[&str] = &[
    "jobs",
    "customers",
    "designers",
    "salesmen",
    "job_titles",
    "notifications",
];

/// Initialize the database at `{data_dir}/job-orders.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. On corruption or open failure,
/// deletes the file and retries once.
pub fn init(data_dir: &Path) -> Result<DbState, String> {
    fs::create_dir_all(data_dir).map_err(|e| format!("Failed to create data dir: {e}"))?;

    let db_path = data_dir.join("job-orders.db");
    info!("Opening mirror database at {}", db_path.display());

    let conn = match open_and_configure(&db_path).and_then(|c| run_migrations(&c).map(|_| c)) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Mirror database open failed ({}), deleting and retrying once",
                first_err
            );
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                let _ = fs::remove_file(db_path.with_extension("db-wal"));
                let _ = fs::remove_file(db_path.with_extension("db-shm"));
            }
            let conn = open_and_configure(&db_path)
                .map_err(|e| format!("Database open failed after retry: {e}"))?;
            run_migrations(&conn)?;
            conn
        }
    };

    info!("Mirror database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, String> {
    let conn = Connection::open(path).map_err(|e| format!("sqlite open: {e}"))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| format!("pragma setup: {e}"))?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| format!("create schema_version: {e}"))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Mirror schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating mirror from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Migration v1: job orders, reference entities, sync metadata, settings.
fn migrate_v1(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(setting_category, setting_key)
        );

        -- jobs (denormalized mirror of job_orders)
        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            job_order_number TEXT,
            customer_id TEXT,
            customer_name TEXT,
            designer_id TEXT,
            designer_name TEXT,
            salesman_id TEXT,
            salesman_name TEXT,
            job_title_id TEXT,
            job_title TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            approval_status TEXT NOT NULL DEFAULT 'pending_approval',
            priority TEXT NOT NULL DEFAULT 'medium',
            due_date TEXT,
            estimated_hours REAL,
            actual_hours REAL,
            total_value REAL,
            invoice_number TEXT,
            branch TEXT,
            job_order_details TEXT,
            delivered_at TEXT,
            created_by TEXT,
            created_at TEXT,
            updated_at TEXT,
            approved_by TEXT,
            approved_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_jobs_customer_id ON jobs(customer_id);
        CREATE INDEX IF NOT EXISTS idx_jobs_salesman_id ON jobs(salesman_id);
        CREATE INDEX IF NOT EXISTS idx_jobs_designer_id ON jobs(designer_id);
        CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
        CREATE INDEX IF NOT EXISTS idx_jobs_branch ON jobs(branch);
        CREATE INDEX IF NOT EXISTS idx_jobs_priority ON jobs(priority);

        -- reference entities share one shape
        CREATE TABLE IF NOT EXISTS customers (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT,
            phone TEXT,
            company TEXT,
            address TEXT,
            created_at TEXT
        );
        CREATE TABLE IF NOT EXISTS designers (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT,
            phone TEXT,
            company TEXT,
            address TEXT,
            created_at TEXT
        );
        CREATE TABLE IF NOT EXISTS salesmen (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT,
            phone TEXT,
            company TEXT,
            address TEXT,
            created_at TEXT
        );
        CREATE TABLE IF NOT EXISTS job_titles (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT,
            phone TEXT,
            company TEXT,
            address TEXT,
            created_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_customers_name ON customers(name);
        CREATE INDEX IF NOT EXISTS idx_designers_name ON designers(name);
        CREATE INDEX IF NOT EXISTS idx_salesmen_name ON salesmen(name);
        CREATE INDEX IF NOT EXISTS idx_job_titles_name ON job_titles(name);

        -- sync_meta (one row per store)
        CREATE TABLE IF NOT EXISTS sync_meta (
            id TEXT PRIMARY KEY,
            last_sync_time TEXT,
            sync_in_progress INTEGER NOT NULL DEFAULT 0
        );

        -- Record migration
        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        format!("migration v1: {e}")
    })?;

    info!("Applied migration v1 (jobs, reference tables, sync_meta)");
    Ok(())
}

/// Migration v2: cached notifications.
fn migrate_v2(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS notifications (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            job_id TEXT,
            type TEXT NOT NULL,
            message TEXT NOT NULL DEFAULT '',
            payload TEXT,
            read INTEGER NOT NULL DEFAULT 0,
            snoozed_until TEXT,
            created_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_notifications_user ON notifications(user_id);
        CREATE INDEX IF NOT EXISTS idx_notifications_user_type
            ON notifications(user_id, type);
        CREATE INDEX IF NOT EXISTS idx_notifications_created_at
            ON notifications(created_at);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        format!("migration v2: {e}")
    })?;

    info!("Applied migration v2 (notifications)");
    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool, String> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .map_err(|e| format!("table_info {table}: {e}"))?;
    let mut rows = stmt
        .query([])
        .map_err(|e| format!("table_info query: {e}"))?;
    while let Some(row) = rows.next().map_err(|e| format!("table_info next: {e}"))? {
        let name: String = row.get(1).map_err(|e| format!("table_info name: {e}"))?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Migration v3: sync error tracking and date-range indexes for list views.
fn migrate_v3(conn: &Connection) -> Result<(), String> {
    if !column_exists(conn, "sync_meta", "last_error")? {
        conn.execute_batch("ALTER TABLE sync_meta ADD COLUMN last_error TEXT;")
            .map_err(|e| format!("migration v3 add last_error: {e}"))?;
    }

    conn.execute_batch(
        "
        CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs(created_at);
        CREATE INDEX IF NOT EXISTS idx_jobs_updated_at ON jobs(updated_at);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (3);
        ",
    )
    .map_err(|e| {
        error!("Migration v3 failed: {e}");
        format!("migration v3: {e}")
    })?;

    info!("Applied migration v3 (sync_meta.last_error, job date indexes)");
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a setting.
pub fn set_setting(
    conn: &Connection,
    category: &str,
    key: &str,
    value: &str,
) -> Result<(), String> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )
    .map_err(|e| format!("set_setting: {e}"))?;
    Ok(())
}

/// All settings in one category as a JSON object.
pub fn get_settings_in_category(conn: &Connection, category: &str) -> serde_json::Value {
    let mut stmt = match conn.prepare(
        "SELECT setting_key, setting_value FROM local_settings
         WHERE setting_category = ?1 ORDER BY setting_key",
    ) {
        Ok(s) => s,
        Err(e) => {
            error!("get_settings_in_category prepare: {e}");
            return serde_json::json!({});
        }
    };

    let rows = match stmt.query_map(params![category], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    }) {
        Ok(r) => r,
        Err(e) => {
            error!("get_settings_in_category query: {e}");
            return serde_json::json!({});
        }
    };

    let mut result = serde_json::Map::new();
    for (key, val) in rows.flatten() {
        result.insert(key, serde_json::Value::String(val));
    }
    serde_json::Value::Object(result)
}

/// Delete all settings in a category.
pub fn delete_all_settings(conn: &Connection, category: &str) -> Result<(), String> {
    conn.execute(
        "DELETE FROM local_settings WHERE setting_category = ?1",
        params![category],
    )
    .map_err(|e| format!("delete_all_settings: {e}"))?;
    Ok(())
}

/// Schema version recorded in the database.
pub fn schema_version(conn: &Connection) -> i32 {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .unwrap_or(0)
}

/// Run all migrations on the given connection (test helper, not public API).
#[cfg(test)]
pub fn run_migrations_for_test(conn: &Connection) {
    run_migrations(conn).expect("run_migrations should succeed in test");
}

/// In-memory, fully migrated database state for unit tests.
#[cfg(test)]
pub fn test_state() -> DbState {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
    .expect("pragma setup");
    run_migrations_for_test(&conn);
    DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    /// Open an in-memory database and apply pragmas (mirrors open_and_configure).
    fn test_db() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )
        .expect("pragma setup");
        conn
    }

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .expect("prepare table list");
        stmt.query_map([], |row| row.get(0))
            .expect("query tables")
            .filter_map(|r| r.ok())
            .collect()
    }

    fn index_names(conn: &Connection, table: &str) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='index' AND tbl_name = ?1")
            .expect("prepare index list");
        stmt.query_map(params![table], |row| row.get(0))
            .expect("query indexes")
            .filter_map(|r| r.ok())
            .collect()
    }

    #[test]
    fn test_migrations_create_all_mirror_tables() {
        let conn = test_db();
        run_migrations(&conn).expect("run_migrations should succeed");

        let tables = table_names(&conn);
        for table in MIRROR_TABLES
            .iter()
            .chain(["sync_meta", "local_settings", "schema_version"].iter())
        {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }
        assert!(column_exists(&conn, "sync_meta", "last_error").unwrap());
    }

    #[test]
    fn test_jobs_have_list_filter_indexes() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        let indexes = index_names(&conn, "jobs");
        for column in [
            "customer_id",
            "salesman_id",
            "designer_id",
            "status",
            "branch",
            "priority",
            "created_at",
            "updated_at",
        ] {
            let expected = format!("idx_jobs_{column}");
            assert!(indexes.contains(&expected), "missing index {expected}");
        }
    }

    #[test]
    fn test_wal_mode_on_file_db() {
        let dir = std::env::temp_dir().join(format!("job_orders_wal_{}", uuid::Uuid::new_v4()));
        let _ = std::fs::create_dir_all(&dir);
        let db_path = dir.join("test_wal.db");

        let conn = open_and_configure(&db_path).expect("open temp db");
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .expect("read journal_mode");
        assert_eq!(mode.to_lowercase(), "wal", "journal_mode should be WAL");

        drop(conn);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_init_rebuilds_corrupt_database() {
        let dir = std::env::temp_dir().join(format!("job_orders_corrupt_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("job-orders.db"), b"definitely not sqlite").unwrap();

        let state = init(&dir).expect("init should rebuild");
        let conn = state.conn.lock().unwrap();
        assert_eq!(schema_version(&conn), CURRENT_SCHEMA_VERSION);

        drop(conn);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = test_db();
        run_migrations(&conn).expect("first run");
        run_migrations(&conn).expect("second run should succeed");
        assert_eq!(schema_version(&conn), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_settings_crud() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        set_setting(&conn, "gateway", "branch", "north").expect("set");
        assert_eq!(get_setting(&conn, "gateway", "branch"), Some("north".into()));

        set_setting(&conn, "gateway", "branch", "south").expect("update");
        assert_eq!(get_setting(&conn, "gateway", "branch"), Some("south".into()));
        assert_eq!(
            get_settings_in_category(&conn, "gateway"),
            serde_json::json!({ "branch": "south" })
        );

        delete_all_settings(&conn, "gateway").expect("delete");
        assert!(get_setting(&conn, "gateway", "branch").is_none());
    }
}
