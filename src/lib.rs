//! Job Orders Desk - offline mirror and workflow backend
//!
//! The UI shell calls the JSON command functions in [`commands`]. Everything
//! behind them talks to the hosted backend through a [`gateway::Gateway`]
//! and keeps a local SQLite mirror for offline reads.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod auth;
pub mod commands;
pub mod db;
pub mod diagnostics;
pub mod error;
pub mod gateway;
pub mod mirror;
pub mod models;
pub mod notifier;
pub mod storage;
pub mod sync;
pub mod system_config;
pub mod workflow;

pub(crate) fn value_str(v: &serde_json::Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(s) = v.get(*key).and_then(|x| x.as_str()) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

pub(crate) fn value_f64(v: &serde_json::Value, keys: &[&str]) -> Option<f64> {
    for key in keys {
        if let Some(n) = v.get(*key).and_then(|x| x.as_f64()) {
            return Some(n);
        }
    }
    None
}

// ============================================================================
// Logging
// ============================================================================

/// Install console + daily rolling file logging. The returned guard flushes
/// the file writer on drop, so the caller keeps it for the process lifetime.
pub fn init_logging(log_dir: &Path) -> WorkerGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,job_orders_lib=debug"));

    std::fs::create_dir_all(log_dir).ok();
    let pruned = diagnostics::prune_old_logs(log_dir);

    let file_appender = tracing_appender::rolling::daily(log_dir, diagnostics::LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!(
        log_dir = %log_dir.display(),
        pruned,
        "Starting Job Orders Desk v{}",
        env!("CARGO_PKG_VERSION")
    );
    guard
}

// ============================================================================
// App state
// ============================================================================

/// Open (and migrate) the local mirror database under `data_dir`.
pub fn open_database(data_dir: &Path) -> anyhow::Result<Arc<db::DbState>> {
    let state = db::init(data_dir)
        .map_err(anyhow::Error::msg)
        .with_context(|| format!("opening mirror database in {}", data_dir.display()))?;
    Ok(Arc::new(state))
}

/// Services shared by every command. Built once the backend credentials
/// are stored.
pub struct AppState {
    pub db: Arc<db::DbState>,
    pub sync: Arc<sync::SyncService>,
    pub workflow: workflow::JobWorkflow,
    pub roles: auth::RoleEvaluator,
    pub notifier: notifier::EditNotifier,
}

impl AppState {
    /// Open the mirror and connect to the configured backend.
    pub fn open(data_dir: &Path) -> anyhow::Result<Self> {
        let db = open_database(data_dir)?;
        Self::connect(db)
    }

    /// Connect an already-open mirror to the configured backend.
    pub fn connect(db: Arc<db::DbState>) -> anyhow::Result<Self> {
        let config = {
            let conn = db
                .conn
                .lock()
                .map_err(|e| anyhow::anyhow!("mirror lock poisoned: {e}"))?;
            storage::load_gateway_config(&conn).map_err(anyhow::Error::msg)?
        };
        let gateway = gateway::RestGateway::new(config)
            .map_err(anyhow::Error::msg)
            .context("creating backend client")?;
        Ok(Self::with_gateway(db, Arc::new(gateway)))
    }

    pub fn with_gateway(db: Arc<db::DbState>, gateway: Arc<dyn gateway::Gateway>) -> Self {
        let sync = Arc::new(sync::SyncService::new(db.clone(), gateway.clone()));
        Self {
            workflow: workflow::JobWorkflow::new(sync.clone()),
            roles: auth::RoleEvaluator::new(gateway.clone()),
            notifier: notifier::EditNotifier::new(gateway),
            sync,
            db,
        }
    }

    /// Identity of the signed-in user as last resolved.
    pub fn claims(&self) -> auth::IdentityClaims {
        self.roles.claims()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::gateway::testing::MemoryGateway;

    pub fn app_state() -> (Arc<MemoryGateway>, AppState) {
        let gateway = Arc::new(MemoryGateway::new());
        let state = AppState::with_gateway(Arc::new(db::test_state()), gateway.clone());
        (gateway, state)
    }
}
