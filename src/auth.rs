//! Role resolution and permission checks.
//!
//! Roles are read from the backend `user_roles` table (plus any `role` /
//! `roles` claim on the auth user) once per session and carried around as
//! [`IdentityClaims`]. Permission checks are deny-by-default: an unknown
//! role or capability never grants anything, and a failed lookup leaves
//! the identity with no roles.

use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::error::{AppError, AppResult};
use crate::gateway::{Gateway, GatewayUser, Query};
use crate::value_str;

/// Backend table holding `(user_id, role)` rows.
const USER_ROLES_TABLE: &str = "user_roles";

// ---------------------------------------------------------------------------
// Roles and capabilities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Manager,
    JobOrderManager,
    Employee,
    Designer,
    Salesman,
}

impl Role {
    pub const ALL: [Role; 6] = [
        Role::Admin,
        Role::Manager,
        Role::JobOrderManager,
        Role::Employee,
        Role::Designer,
        Role::Salesman,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Manager => "manager",
            Role::JobOrderManager => "job_order_manager",
            Role::Employee => "employee",
            Role::Designer => "designer",
            Role::Salesman => "salesman",
        }
    }

    pub fn can(&self, capability: Capability) -> bool {
        capability.allowed_roles().contains(self)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = AppError;

    /// Exact match only; the role set is closed.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .iter()
            .copied()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| AppError::Validation(format!("Unknown role: {s}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    CreateJobOrders,
    ViewAllJobOrders,
    ViewOwnJobOrders,
    EditJobOrders,
    DeleteJobOrders,
    ManageCustomers,
    ApproveJobOrders,
    EditInvoice,
}

impl Capability {
    pub const ALL: [Capability; 8] = [
        Capability::CreateJobOrders,
        Capability::ViewAllJobOrders,
        Capability::ViewOwnJobOrders,
        Capability::EditJobOrders,
        Capability::DeleteJobOrders,
        Capability::ManageCustomers,
        Capability::ApproveJobOrders,
        Capability::EditInvoice,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::CreateJobOrders => "create_job_orders",
            Capability::ViewAllJobOrders => "view_all_job_orders",
            Capability::ViewOwnJobOrders => "view_own_job_orders",
            Capability::EditJobOrders => "edit_job_orders",
            Capability::DeleteJobOrders => "delete_job_orders",
            Capability::ManageCustomers => "manage_customers",
            Capability::ApproveJobOrders => "approve_job_orders",
            Capability::EditInvoice => "edit_invoice",
        }
    }

    /// Static permission table.
    pub fn allowed_roles(&self) -> &'static [Role] {
        use Role::*;
        match self {
            Capability::CreateJobOrders => &[Admin, Manager, JobOrderManager, Employee, Salesman],
            Capability::ViewAllJobOrders => &[Admin, Manager, JobOrderManager],
            Capability::ViewOwnJobOrders => {
                &[Admin, Manager, JobOrderManager, Employee, Designer, Salesman]
            }
            Capability::EditJobOrders => &[Admin, Manager, JobOrderManager, Designer],
            Capability::DeleteJobOrders => &[Admin, Manager],
            Capability::ManageCustomers => &[Admin, Manager, JobOrderManager, Salesman],
            Capability::ApproveJobOrders => &[Admin],
            Capability::EditInvoice => &[Admin, Manager],
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = AppError;

    /// Accepts `create_job_orders`, `createJobOrders` and `canCreateJobOrders`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();
        let normalized = normalized.strip_prefix("can").unwrap_or(&normalized);
        Capability::ALL
            .iter()
            .copied()
            .find(|c| c.as_str().replace('_', "") == normalized)
            .ok_or_else(|| AppError::Validation(format!("Unknown capability: {s}")))
    }
}

/// String-level check used by the UI bridge. Unknown roles and unknown
/// capabilities evaluate to `false`.
pub fn has_permission(role: &str, capability: &str) -> bool {
    match (role.parse::<Role>(), capability.parse::<Capability>()) {
        (Ok(role), Ok(capability)) => role.can(capability),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityClaims {
    pub user_id: String,
    pub email: Option<String>,
    pub roles: Vec<Role>,
}

impl IdentityClaims {
    pub fn new(user_id: impl Into<String>, roles: Vec<Role>) -> Self {
        Self {
            user_id: user_id.into(),
            email: None,
            roles,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.roles.contains(&Role::Admin)
    }

    pub fn can(&self, capability: Capability) -> bool {
        self.roles.iter().any(|r| r.can(capability))
    }

    pub fn require(&self, capability: Capability) -> AppResult<()> {
        if self.can(capability) {
            return Ok(());
        }
        Err(self.denied(capability))
    }

    pub fn denied(&self, capability: Capability) -> AppError {
        AppError::AccessDenied {
            user_id: self.user_id.clone(),
            roles: self.role_names(),
            capability: capability.as_str().to_string(),
        }
    }

    pub fn role_names(&self) -> Vec<String> {
        self.roles.iter().map(|r| r.as_str().to_string()).collect()
    }
}

/// Collect known roles from raw strings, dropping anything outside the
/// closed set.
fn parse_roles<'a>(user_id: &str, raw: impl IntoIterator<Item = &'a str>) -> Vec<Role> {
    let mut roles = Vec::new();
    for value in raw {
        match value.trim().parse::<Role>() {
            Ok(role) if !roles.contains(&role) => roles.push(role),
            Ok(_) => {}
            Err(_) => warn!(user_id, role = value, "ignoring unrecognized role"),
        }
    }
    roles.sort();
    roles
}

fn claim_roles(claims: &Value) -> Vec<String> {
    let mut out: Vec<String> = value_str(claims, &["role"]).into_iter().collect();
    if let Some(Value::Array(items)) = claims.get("roles") {
        out.extend(items.iter().filter_map(Value::as_str).map(str::to_string));
    }
    out
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum RoleState {
    /// No identity: no roles, not loading.
    Idle,
    Loading { user_id: String },
    Loaded(IdentityClaims),
    /// Lookup failed; the identity holds no roles.
    Failed { user_id: String, error: String },
}

impl RoleState {
    pub fn is_loading(&self) -> bool {
        matches!(self, RoleState::Loading { .. })
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            RoleState::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Effective claims; empty roles unless loaded.
    pub fn claims(&self) -> IdentityClaims {
        match self {
            RoleState::Idle => IdentityClaims::default(),
            RoleState::Loaded(claims) => claims.clone(),
            RoleState::Loading { user_id } | RoleState::Failed { user_id, .. } => {
                IdentityClaims::new(user_id.clone(), vec![])
            }
        }
    }

    pub fn to_json(&self) -> Value {
        let claims = self.claims();
        let user_id = Some(claims.user_id.clone()).filter(|id| !id.is_empty());
        serde_json::json!({
            "userId": user_id,
            "email": claims.email,
            "roles": claims.role_names(),
            "isAdmin": claims.is_admin(),
            "loading": self.is_loading(),
            "error": self.error(),
        })
    }
}

pub struct RoleEvaluator {
    gateway: Arc<dyn Gateway>,
    state: Mutex<RoleState>,
    generation: AtomicU64,
}

impl RoleEvaluator {
    pub fn new(gateway: Arc<dyn Gateway>) -> Self {
        Self {
            gateway,
            state: Mutex::new(RoleState::Idle),
            generation: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> RoleState {
        self.state
            .lock()
            .map(|s| s.clone())
            .unwrap_or(RoleState::Idle)
    }

    pub fn claims(&self) -> IdentityClaims {
        self.state().claims()
    }

    fn set_state(&self, generation: u64, next: RoleState) {
        // A newer resolve has started; its result wins.
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        if let Ok(mut state) = self.state.lock() {
            *state = next;
        }
    }

    /// Resolve roles for `user`. `None` resets to `Idle`.
    pub async fn resolve(&self, user: Option<&GatewayUser>) -> RoleState {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let Some(user) = user else {
            self.set_state(generation, RoleState::Idle);
            return RoleState::Idle;
        };

        self.set_state(
            generation,
            RoleState::Loading {
                user_id: user.id.clone(),
            },
        );

        let query = Query::new().select("role").eq("user_id", user.id.clone());
        let next = match self.gateway.query(USER_ROLES_TABLE, &query).await {
            Ok(rows) => {
                let mut raw: Vec<String> =
                    rows.iter().filter_map(|r| value_str(r, &["role"])).collect();
                raw.extend(claim_roles(&user.claims));
                let roles = parse_roles(&user.id, raw.iter().map(String::as_str));
                info!(user_id = %user.id, roles = ?roles, "roles resolved");
                RoleState::Loaded(IdentityClaims {
                    user_id: user.id.clone(),
                    email: user.email.clone(),
                    roles,
                })
            }
            Err(error) => {
                warn!(user_id = %user.id, error = %error, "role lookup failed");
                RoleState::Failed {
                    user_id: user.id.clone(),
                    error,
                }
            }
        };
        self.set_state(generation, next.clone());
        next
    }

    /// Resolve roles for whoever the gateway session belongs to.
    pub async fn resolve_current(&self) -> RoleState {
        match self.gateway.current_user().await {
            Ok(user) => self.resolve(user.as_ref()).await,
            Err(error) => {
                warn!(error = %error, "current user lookup failed");
                let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                let failed = RoleState::Failed {
                    user_id: String::new(),
                    error,
                };
                self.set_state(generation, failed.clone());
                failed
            }
        }
    }

    pub fn clear(&self) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_state(generation, RoleState::Idle);
    }
}
