//! Hosted backend client.
//!
//! The backend provides row storage (PostgREST-style REST), stored
//! procedures, authentication, and a change feed. [`Gateway`] is the seam
//! the mirror, workflow and notifier are written against; [`RestGateway`]
//! is the HTTP implementation.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::models::ts_from_db;
use crate::value_str;

/// Default timeout for REST and RPC requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

/// How often the change feed asks for new rows.
const FEED_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Rows fetched per change-feed poll.
const FEED_BATCH: usize = 100;

/// Buffered change-feed rows per subscriber.
const FEED_CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Query description
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, String),
    /// Case-insensitive substring match.
    ILike(String, String),
    Gt(String, String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub select: Option<String>,
    pub filters: Vec<Filter>,
    /// Column and descending flag.
    pub order: Option<(String, bool)>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(mut self, columns: &str) -> Self {
        self.select = Some(columns.to_string());
        self
    }

    pub fn eq(mut self, column: &str, value: impl Into<String>) -> Self {
        self.filters.push(Filter::Eq(column.to_string(), value.into()));
        self
    }

    pub fn ilike(mut self, column: &str, term: impl Into<String>) -> Self {
        self.filters.push(Filter::ILike(column.to_string(), term.into()));
        self
    }

    pub fn gt(mut self, column: &str, value: impl Into<String>) -> Self {
        self.filters.push(Filter::Gt(column.to_string(), value.into()));
        self
    }

    pub fn order_desc(mut self, column: &str) -> Self {
        self.order = Some((column.to_string(), true));
        self
    }

    pub fn order_asc(mut self, column: &str) -> Self {
        self.order = Some((column.to_string(), false));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// PostgREST query-string pairs.
    fn to_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![(
            "select".to_string(),
            self.select.clone().unwrap_or_else(|| "*".to_string()),
        )];
        for filter in &self.filters {
            match filter {
                Filter::Eq(col, v) => pairs.push((col.clone(), format!("eq.{v}"))),
                Filter::ILike(col, v) => pairs.push((col.clone(), format!("ilike.*{v}*"))),
                Filter::Gt(col, v) => pairs.push((col.clone(), format!("gt.{v}"))),
            }
        }
        if let Some((col, desc)) = &self.order {
            let dir = if *desc { "desc" } else { "asc" };
            pairs.push(("order".to_string(), format!("{col}.{dir}")));
        }
        if let Some(limit) = self.limit {
            pairs.push(("limit".to_string(), limit.to_string()));
        }
        pairs
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeEvent {
    Insert,
}

/// The signed-in backend user.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayUser {
    pub id: String,
    pub email: Option<String>,
    /// Raw `app_metadata` / `user_metadata` merged into one object.
    pub claims: Value,
}

// ---------------------------------------------------------------------------
// Gateway seam
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Gateway: Send + Sync {
    async fn query(&self, table: &str, query: &Query) -> Result<Vec<Value>, String>;

    /// Insert a row and return it as stored (with backend-assigned fields).
    async fn insert(&self, table: &str, record: Value) -> Result<Value, String>;

    async fn update(&self, table: &str, id: &str, partial: Value) -> Result<(), String>;

    async fn rpc(&self, function: &str, args: Value) -> Result<Value, String>;

    async fn current_user(&self) -> Result<Option<GatewayUser>, String>;

    /// Stream of rows inserted into `table` from now on. Dropping the
    /// receiver ends the subscription.
    fn subscribe_change_feed(
        &self,
        table: &str,
        event: ChangeEvent,
    ) -> Result<mpsc::Receiver<Value>, String>;
}

/// Whether a gateway error message is an authorization rejection.
pub fn is_permission_error(error: &str) -> bool {
    let lower = error.to_lowercase();
    lower.contains("permission denied")
        || lower.contains("not authorized")
        || lower.contains("access denied")
        || lower.contains("row-level security")
        || lower.contains("(http 401)")
        || lower.contains("(http 403)")
}

// ---------------------------------------------------------------------------
// REST implementation
// ---------------------------------------------------------------------------

/// Connection settings for [`RestGateway`].
#[derive(Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub anon_key: Zeroizing<String>,
    pub access_token: Option<Zeroizing<String>>,
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("base_url", &self.base_url)
            .field("anon_key", &"[REDACTED]")
            .field("access_token", &self.access_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Normalise the backend URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes and a trailing `/rest/v1` segment
pub fn normalize_gateway_url(url: &str) -> String {
    let mut url = url.trim().to_string();
    if url.is_empty() {
        return url;
    }

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }
    if url.ends_with("/rest/v1") {
        url.truncate(url.len() - "/rest/v1".len());
    }
    while url.ends_with('/') {
        url.pop();
    }
    url
}

/// Convert a `reqwest::Error` into a user-friendly message.
fn friendly_error(url: &str, err: &reqwest::Error) -> String {
    if err.is_connect() {
        return format!("Cannot reach backend at {url}");
    }
    if err.is_timeout() {
        return format!("Connection to {url} timed out");
    }
    if err.is_builder() {
        return format!("Invalid backend URL: {url}");
    }
    format!("Network error communicating with {url}: {err}")
}

/// Convert an HTTP status code into a user-friendly message.
fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "Session is invalid or expired".to_string(),
        403 => "Permission denied".to_string(),
        404 => "Backend endpoint not found".to_string(),
        409 => "Conflicting change rejected by backend".to_string(),
        s if s >= 500 => format!("Backend server error (HTTP {s})"),
        s => format!("Unexpected response from backend (HTTP {s})"),
    }
}

#[derive(Clone)]
pub struct RestGateway {
    config: GatewayConfig,
    client: Client,
}

impl RestGateway {
    pub fn new(config: GatewayConfig) -> Result<Self, String> {
        let base_url = normalize_gateway_url(&config.base_url);
        if base_url.is_empty() {
            return Err("Backend not configured: missing URL".into());
        }
        if config.anon_key.trim().is_empty() {
            return Err("Backend not configured: missing anon key".into());
        }
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| format!("Failed to create HTTP client: {e}"))?;
        Ok(Self {
            config: GatewayConfig { base_url, ..config },
            client,
        })
    }

    fn bearer(&self) -> &str {
        self.config
            .access_token
            .as_ref()
            .map(|t| t.as_str())
            .unwrap_or(self.config.anon_key.as_str())
    }

    fn url(&self, path: &str, pairs: &[(String, String)]) -> Result<Url, String> {
        let mut url = Url::parse(&format!("{}{path}", self.config.base_url))
            .map_err(|e| format!("Invalid backend URL: {e}"))?;
        if !pairs.is_empty() {
            let mut qp = url.query_pairs_mut();
            for (k, v) in pairs {
                qp.append_pair(k, v);
            }
        }
        Ok(url)
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
        prefer: Option<&str>,
    ) -> Result<Value, String> {
        let mut req = self
            .client
            .request(method, url)
            .header("apikey", self.config.anon_key.as_str())
            .header("Authorization", format!("Bearer {}", self.bearer()))
            .header("Content-Type", "application/json");
        if let Some(p) = prefer {
            req = req.header("Prefer", p);
        }
        if let Some(b) = body {
            req = req.json(b);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| friendly_error(&self.config.base_url, &e))?;
        let status = resp.status();
        let body_text = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            // PostgREST errors carry `message`, sometimes `hint` / `details`.
            let detail = match serde_json::from_str::<Value>(&body_text) {
                Ok(json) => {
                    let message = value_str(&json, &["message", "error_description", "error", "msg"])
                        .unwrap_or_else(|| status_error(status));
                    match value_str(&json, &["details", "hint"]) {
                        Some(details) => {
                            format!("{message} (HTTP {}): {details}", status.as_u16())
                        }
                        None => format!("{message} (HTTP {})", status.as_u16()),
                    }
                }
                Err(_) if !body_text.trim().is_empty() => format!(
                    "{} (HTTP {}): {}",
                    status_error(status),
                    status.as_u16(),
                    body_text.trim()
                ),
                Err(_) => format!("{} (HTTP {})", status_error(status), status.as_u16()),
            };
            return Err(detail);
        }

        if body_text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text).map_err(|e| format!("Invalid JSON from backend: {e}"))
    }
}

#[async_trait]
impl Gateway for RestGateway {
    async fn query(&self, table: &str, query: &Query) -> Result<Vec<Value>, String> {
        let url = self.url(&format!("/rest/v1/{table}"), &query.to_pairs())?;
        let rows = self.send(Method::GET, url, None, None).await?;
        debug!(table, count = rows.as_array().map(Vec::len), "backend query");
        match rows {
            Value::Array(items) => Ok(items),
            Value::Null => Ok(vec![]),
            other => Err(format!("Expected an array from {table}, got {other}")),
        }
    }

    async fn insert(&self, table: &str, record: Value) -> Result<Value, String> {
        let url = self.url(&format!("/rest/v1/{table}"), &[])?;
        let stored = self
            .send(Method::POST, url, Some(&record), Some("return=representation"))
            .await?;
        match stored {
            Value::Array(mut items) if !items.is_empty() => Ok(items.swap_remove(0)),
            Value::Object(_) => Ok(stored),
            _ => Err(format!("Insert into {table} returned no row")),
        }
    }

    async fn update(&self, table: &str, id: &str, partial: Value) -> Result<(), String> {
        let url = self.url(
            &format!("/rest/v1/{table}"),
            &[("id".to_string(), format!("eq.{id}"))],
        )?;
        let updated = self
            .send(Method::PATCH, url, Some(&partial), Some("return=representation"))
            .await?;
        // Row-level security hides rows instead of failing the request.
        if updated.as_array().map(Vec::is_empty).unwrap_or(false) {
            return Err(format!("Permission denied: {table} row {id} was not updated"));
        }
        Ok(())
    }

    async fn rpc(&self, function: &str, args: Value) -> Result<Value, String> {
        let url = self.url(&format!("/rest/v1/rpc/{function}"), &[])?;
        self.send(Method::POST, url, Some(&args), None).await
    }

    async fn current_user(&self) -> Result<Option<GatewayUser>, String> {
        if self.config.access_token.is_none() {
            return Ok(None);
        }
        let url = self.url("/auth/v1/user", &[])?;
        let user = match self.send(Method::GET, url, None, None).await {
            Ok(v) => v,
            Err(e) if e.contains("(HTTP 401)") => return Ok(None),
            Err(e) => return Err(e),
        };
        let Some(id) = value_str(&user, &["id"]) else {
            return Ok(None);
        };
        let mut claims = serde_json::Map::new();
        for key in ["user_metadata", "app_metadata"] {
            if let Some(Value::Object(meta)) = user.get(key) {
                for (k, v) in meta {
                    claims.insert(k.clone(), v.clone());
                }
            }
        }
        Ok(Some(GatewayUser {
            id,
            email: value_str(&user, &["email"]),
            claims: Value::Object(claims),
        }))
    }

    fn subscribe_change_feed(
        &self,
        table: &str,
        event: ChangeEvent,
    ) -> Result<mpsc::Receiver<Value>, String> {
        let ChangeEvent::Insert = event;
        let (tx, rx) = mpsc::channel(FEED_CHANNEL_CAPACITY);
        let gateway = self.clone();
        let table = table.to_string();
        let mut cursor = crate::models::ts_to_db(&chrono::Utc::now());

        tokio::spawn(async move {
            info!(table = %table, "change feed subscribed");
            let mut interval = tokio::time::interval(FEED_POLL_INTERVAL);
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    _ = interval.tick() => {}
                }
                let query = Query::new()
                    .gt("created_at", cursor.clone())
                    .order_asc("created_at")
                    .limit(FEED_BATCH);
                let rows = match gateway.query(&table, &query).await {
                    Ok(rows) => rows,
                    Err(e) => {
                        warn!(table = %table, error = %e, "change feed poll failed");
                        continue;
                    }
                };
                for row in rows {
                    if let Some(created) = value_str(&row, &["created_at"])
                        .and_then(|s| ts_from_db(&s))
                    {
                        cursor = crate::models::ts_to_db(&created);
                    }
                    if tx.send(row).await.is_err() {
                        break;
                    }
                }
            }
            info!(table = %table, "change feed closed");
        });

        Ok(rx)
    }
}

// ---------------------------------------------------------------------------
// In-memory gateway for tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    type RpcHandler = Box<dyn Fn(&Value) -> Result<Value, String> + Send + Sync>;

    /// Table store with scripted RPCs, call recording and a manual change feed.
    #[derive(Default)]
    pub struct MemoryGateway {
        tables: Mutex<HashMap<String, Vec<Value>>>,
        rpcs: Mutex<HashMap<String, RpcHandler>>,
        feeds: Mutex<Vec<(String, mpsc::Sender<Value>)>>,
        user: Mutex<Option<GatewayUser>>,
        fail_queries: Mutex<Option<String>>,
        fail_updates: Mutex<Option<String>>,
        query_delay: Mutex<Option<Duration>>,
        pub calls: Mutex<Vec<String>>,
    }

    fn cell(row: &Value, column: &str) -> Option<String> {
        match row.get(column)? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    impl MemoryGateway {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn seed(&self, table: &str, rows: Vec<Value>) {
            self.tables
                .lock()
                .unwrap()
                .entry(table.to_string())
                .or_default()
                .extend(rows);
        }

        pub fn rows(&self, table: &str) -> Vec<Value> {
            self.tables
                .lock()
                .unwrap()
                .get(table)
                .cloned()
                .unwrap_or_default()
        }

        pub fn on_rpc(
            &self,
            function: &str,
            handler: impl Fn(&Value) -> Result<Value, String> + Send + Sync + 'static,
        ) {
            self.rpcs
                .lock()
                .unwrap()
                .insert(function.to_string(), Box::new(handler));
        }

        pub fn set_user(&self, user: Option<GatewayUser>) {
            *self.user.lock().unwrap() = user;
        }

        pub fn fail_queries(&self, error: Option<&str>) {
            *self.fail_queries.lock().unwrap() = error.map(str::to_string);
        }

        pub fn fail_updates(&self, error: Option<&str>) {
            *self.fail_updates.lock().unwrap() = error.map(str::to_string);
        }

        pub fn delay_queries(&self, delay: Duration) {
            *self.query_delay.lock().unwrap() = Some(delay);
        }

        pub fn call_count(&self, prefix: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.starts_with(prefix))
                .count()
        }

        /// Push a row to every open feed on `table`, in call order.
        pub async fn emit(&self, table: &str, row: Value) {
            let senders: Vec<mpsc::Sender<Value>> = self
                .feeds
                .lock()
                .unwrap()
                .iter()
                .filter(|(t, s)| t == table && !s.is_closed())
                .map(|(_, s)| s.clone())
                .collect();
            for sender in senders {
                let _ = sender.send(row.clone()).await;
            }
        }

        pub fn open_feeds(&self, table: &str) -> usize {
            self.feeds
                .lock()
                .unwrap()
                .iter()
                .filter(|(t, s)| t == table && !s.is_closed())
                .count()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl Gateway for MemoryGateway {
        async fn query(&self, table: &str, query: &Query) -> Result<Vec<Value>, String> {
            self.record(format!("query:{table}"));
            let delay = *self.query_delay.lock().unwrap();
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }
            if let Some(e) = self.fail_queries.lock().unwrap().clone() {
                return Err(e);
            }
            let mut rows: Vec<Value> = self
                .rows(table)
                .into_iter()
                .filter(|row| {
                    query.filters.iter().all(|f| match f {
                        Filter::Eq(c, v) => cell(row, c).as_deref() == Some(v.as_str()),
                        Filter::ILike(c, v) => cell(row, c)
                            .map(|s| s.to_lowercase().contains(&v.to_lowercase()))
                            .unwrap_or(false),
                        Filter::Gt(c, v) => cell(row, c).map(|s| s > *v).unwrap_or(false),
                    })
                })
                .collect();
            if let Some((col, desc)) = &query.order {
                rows.sort_by(|a, b| {
                    let ord = cell(a, col).cmp(&cell(b, col));
                    if *desc {
                        ord.reverse()
                    } else {
                        ord
                    }
                });
            }
            if let Some(limit) = query.limit {
                rows.truncate(limit);
            }
            Ok(rows)
        }

        async fn insert(&self, table: &str, mut record: Value) -> Result<Value, String> {
            self.record(format!("insert:{table}"));
            if record.get("id").map(Value::is_null).unwrap_or(true) {
                record["id"] = Value::String(uuid::Uuid::new_v4().to_string());
            }
            if table == "job_orders" && record.get("job_order_number").is_none() {
                let next = self.rows(table).len() + 1001;
                record["job_order_number"] = Value::String(format!("JO-{next}"));
            }
            self.seed(table, vec![record.clone()]);
            Ok(record)
        }

        async fn update(&self, table: &str, id: &str, partial: Value) -> Result<(), String> {
            self.record(format!("update:{table}:{id}"));
            if let Some(e) = self.fail_updates.lock().unwrap().clone() {
                return Err(e);
            }
            let mut tables = self.tables.lock().unwrap();
            let row = tables
                .get_mut(table)
                .and_then(|rows| rows.iter_mut().find(|r| cell(r, "id").as_deref() == Some(id)))
                .ok_or_else(|| format!("Permission denied: {table} row {id} was not updated"))?;
            if let (Value::Object(target), Value::Object(fields)) = (row, partial) {
                for (k, v) in fields {
                    target.insert(k, v);
                }
            }
            Ok(())
        }

        async fn rpc(&self, function: &str, args: Value) -> Result<Value, String> {
            self.record(format!("rpc:{function}"));
            let rpcs = self.rpcs.lock().unwrap();
            match rpcs.get(function) {
                Some(handler) => handler(&args),
                None => Err(format!("Could not find the function {function} (HTTP 404)")),
            }
        }

        async fn current_user(&self) -> Result<Option<GatewayUser>, String> {
            Ok(self.user.lock().unwrap().clone())
        }

        fn subscribe_change_feed(
            &self,
            table: &str,
            _event: ChangeEvent,
        ) -> Result<mpsc::Receiver<Value>, String> {
            self.record(format!("subscribe:{table}"));
            let (tx, rx) = mpsc::channel(FEED_CHANNEL_CAPACITY);
            self.feeds.lock().unwrap().push((table.to_string(), tx));
            Ok(rx)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_gateway_url_adds_scheme_and_strips_rest_suffix() {
        assert_eq!(
            normalize_gateway_url("abc.backend.co/rest/v1/"),
            "https://abc.backend.co"
        );
        assert_eq!(normalize_gateway_url("localhost:54321/"), "http://localhost:54321");
        assert_eq!(normalize_gateway_url("  "), "");
    }

    #[test]
    fn query_renders_postgrest_pairs() {
        let q = Query::new()
            .eq("user_id", "u-1")
            .ilike("name", "acme")
            .order_desc("created_at")
            .limit(100);
        assert_eq!(
            q.to_pairs(),
            vec![
                ("select".to_string(), "*".to_string()),
                ("user_id".to_string(), "eq.u-1".to_string()),
                ("name".to_string(), "ilike.*acme*".to_string()),
                ("order".to_string(), "created_at.desc".to_string()),
                ("limit".to_string(), "100".to_string()),
            ]
        );
    }

    #[test]
    fn permission_errors_are_recognised() {
        assert!(is_permission_error("Permission denied (HTTP 403)"));
        assert!(is_permission_error(
            "new row violates row-level security policy (HTTP 401)"
        ));
        assert!(!is_permission_error("Backend server error (HTTP 502)"));
    }

    #[test]
    fn rest_gateway_requires_url_and_key() {
        let missing_url = RestGateway::new(GatewayConfig {
            base_url: String::new(),
            anon_key: Zeroizing::new("key".into()),
            access_token: None,
        });
        assert!(missing_url.is_err());

        let missing_key = RestGateway::new(GatewayConfig {
            base_url: "https://x.backend.co".into(),
            anon_key: Zeroizing::new(" ".into()),
            access_token: None,
        });
        assert!(missing_key.is_err());
    }

    #[tokio::test]
    async fn memory_gateway_filters_orders_and_limits() {
        let gw = testing::MemoryGateway::new();
        gw.seed(
            "notifications",
            (0..5)
                .map(|i| {
                    serde_json::json!({
                        "id": format!("n-{i}"),
                        "user_id": if i == 4 { "other" } else { "u-1" },
                        "created_at": format!("2026-01-0{}T00:00:00Z", i + 1),
                    })
                })
                .collect(),
        );
        let rows = gw
            .query(
                "notifications",
                &Query::new().eq("user_id", "u-1").order_desc("created_at").limit(2),
            )
            .await
            .unwrap();
        let ids: Vec<_> = rows.iter().filter_map(|r| value_str(r, &["id"])).collect();
        assert_eq!(ids, vec!["n-3", "n-2"]);
    }
}
