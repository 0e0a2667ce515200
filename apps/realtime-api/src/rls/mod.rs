//! Row-level-security collaborator seam and fail-closed row authorization.
//!
//! The realtime engine does not own policies. It asks an [`RlsService`]
//! whether a table has RLS enabled, which policies apply, and whether a
//! policy condition (with `auth.*` calls already substituted) holds for a
//! concrete row.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::auth::api_key::SERVICE_ROLE;
use crate::auth::jwt::Claims;
use crate::realtime::events::Row;

pub use memory::MemoryPolicyStore;

/// Role assumed when a connection has no verified claims.
pub const ANONYMOUS_ROLE: &str = "anon";

/// Who is asking, as seen by policy evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthContext {
    pub user_id: Option<String>,
    pub role: String,
    /// Privileged contexts skip policy evaluation entirely.
    pub bypass_rls: bool,
    pub claims: Map<String, Value>,
}

impl AuthContext {
    pub fn anonymous() -> Self {
        Self {
            user_id: None,
            role: ANONYMOUS_ROLE.to_string(),
            bypass_rls: false,
            claims: Map::new(),
        }
    }

    pub fn from_claims(claims: &Claims) -> Self {
        let role = claims.role().unwrap_or(ANONYMOUS_ROLE).to_string();
        Self {
            user_id: claims.subject().map(str::to_string),
            bypass_rls: role == SERVICE_ROLE,
            role,
            claims: claims.as_map().clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PolicyCommand {
    Select,
    Insert,
    Update,
    Delete,
    All,
}

impl PolicyCommand {
    /// Whether a policy with this command governs reads.
    pub fn grants_select(self) -> bool {
        matches!(self, PolicyCommand::Select | PolicyCommand::All)
    }
}

/// A permissive row-level policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub name: String,
    pub command: PolicyCommand,
    /// Condition a visible row must satisfy. `None` or empty means every row.
    #[serde(default)]
    pub using_expr: Option<String>,
    /// Condition a written row must satisfy. Not consulted for reads.
    #[serde(default)]
    pub check_expr: Option<String>,
}

impl Policy {
    pub fn select(name: impl Into<String>, using_expr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: PolicyCommand::Select,
            using_expr: Some(using_expr.into()),
            check_expr: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RlsError {
    #[error("policy lookup failed for table {table}: {reason}")]
    Lookup { table: String, reason: String },
    #[error("could not evaluate condition `{condition}`: {reason}")]
    Evaluation { condition: String, reason: String },
}

/// The row-level-security service consumed by the realtime engine.
#[async_trait]
pub trait RlsService: Send + Sync {
    async fn is_rls_enabled(&self, table: &str) -> Result<bool, RlsError>;

    async fn policies_for_table(&self, table: &str) -> Result<Vec<Policy>, RlsError>;

    /// Rewrite `auth.uid()`, `auth.role()` and JWT-claim accessors in `expr`
    /// into literals for `ctx`.
    fn substitute_auth_functions(&self, expr: &str, ctx: &AuthContext) -> String;

    /// Whether `condition` holds for `row` of `table`.
    async fn evaluate(&self, table: &str, row: &Row, condition: &str) -> Result<bool, RlsError>;
}

/// Decide whether `ctx` may see `row` of `table`.
///
/// Fail-closed: any collaborator error, a missing row, or an RLS-enabled
/// table without a matching SELECT policy denies.
pub async fn authorize_row(
    rls: &dyn RlsService,
    ctx: &AuthContext,
    table: &str,
    row: Option<&Row>,
) -> bool {
    if ctx.bypass_rls {
        return true;
    }
    let Some(row) = row else {
        return false;
    };

    match rls.is_rls_enabled(table).await {
        Ok(false) => return true,
        Ok(true) => {}
        Err(e) => {
            tracing::warn!(%table, error = %e, "rls status lookup failed, denying");
            return false;
        }
    }

    let policies = match rls.policies_for_table(table).await {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(%table, error = %e, "rls policy lookup failed, denying");
            return false;
        }
    };

    for policy in policies.iter().filter(|p| p.command.grants_select()) {
        let using = policy.using_expr.as_deref().map(str::trim).unwrap_or("");
        if using.is_empty() {
            return true;
        }

        let condition = rls.substitute_auth_functions(using, ctx);
        match rls.evaluate(table, row, &condition).await {
            Ok(true) => return true,
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(%table, policy = %policy.name, error = %e, "policy evaluation failed, denying");
                return false;
            }
        }
    }

    false
}
