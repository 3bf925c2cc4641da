//! Tenant resolution and permission matching.
//!
//! Every external call carries an API credential. [`TenantGuard`] maps it to
//! an organization scope that the facade threads through every store call;
//! unknown and disabled credentials are rejected before any work happens.
//! Roles carry permission strings (possibly wildcarded) that transports
//! check against the per-operation table below.

use broker_core::{
    error::{BrokerError, Result},
    models::Scope,
    store::WorkspaceStore,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Resolves caller credentials into request scopes.
#[derive(Clone)]
pub struct TenantGuard<S> {
    store: Arc<S>,
}

impl<S: WorkspaceStore> TenantGuard<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Map a presented secret to its scope.
    ///
    /// # Returns
    /// * `Ok(Scope)` - the credential's organization and project
    /// * `Err(BrokerError::Unauthenticated)` - missing, unknown or disabled
    pub async fn authenticate(&self, secret: &str) -> Result<Scope> {
        let secret = secret.trim();
        if secret.is_empty() {
            return Err(BrokerError::Unauthenticated(
                "No API key provided".to_string(),
            ));
        }

        let resolution = self.store.resolve_api_key(secret).await?;
        match resolution {
            None => {
                warn!("rejected unknown API key");
                Err(BrokerError::Unauthenticated("Unknown API key".to_string()))
            }
            Some(resolution) if !resolution.enabled => {
                warn!(key_id = resolution.key_id, "rejected disabled API key");
                Err(BrokerError::Unauthenticated(
                    "API key has been revoked".to_string(),
                ))
            }
            Some(resolution) => {
                // last_used_at is advisory; a failure here must not fail the
                // request.
                if let Err(error) = self.store.touch_api_key(resolution.key_id).await {
                    debug!(%error, key_id = resolution.key_id, "failed to record key use");
                }
                Ok(Scope {
                    organization_id: resolution.organization_id,
                    project_id: resolution.project_id,
                    key_id: resolution.key_id,
                })
            }
        }
    }
}

/// Does a granted permission string cover a required one?
///
/// Matching is segment-wise on `:` left-to-right; a `*` segment matches the
/// remainder. `read:*` covers `read:tasks`, `*` covers everything,
/// `read:tasks` does not cover `read`.
pub fn permission_matches(granted: &str, required: &str) -> bool {
    let mut granted = granted.split(':');
    let mut required = required.split(':');
    loop {
        match (granted.next(), required.next()) {
            (None, None) => return true,
            (Some("*"), _) => return true,
            (Some(g), Some(r)) if g == r => continue,
            _ => return false,
        }
    }
}

/// Does any granted permission cover the required one?
pub fn has_permission(granted: &[String], required: &str) -> bool {
    granted.iter().any(|g| permission_matches(g, required))
}

/// Permission string an operation requires. Transports resolving role-based
/// callers check this table; project-scoped API keys carry the full set for
/// their project.
pub fn required_permission(operation: &str) -> Option<&'static str> {
    let permission = match operation {
        "get_task" | "task_context" | "query_tasks" | "search_tasks" | "task_summaries"
        | "task_statistics" | "recent_completions" | "approaching_deadline" | "overdue_tasks"
        | "stale_tasks" | "list_available" | "agent_performance" | "list_updates"
        | "activity_feed" | "list_related" | "list_versions" | "get_version" | "latest_version"
        | "diff_versions" | "list_recurring" | "list_tags" | "list_task_tags"
        | "list_templates" | "get_template" | "list_task_comments" | "get_comment_thread" => {
            "read:tasks"
        }
        "create_task" | "update_task" | "reserve_task" | "unlock_task" | "complete_task"
        | "verify_task" | "bulk_unlock" | "add_update" | "create_relationship"
        | "create_recurring" | "update_recurring" | "deactivate_recurring"
        | "create_instance_now" | "create_tag" | "assign_tag" | "remove_tag"
        | "create_template" | "create_task_from_template" | "create_comment"
        | "update_comment" | "delete_comment" => "write:tasks",
        "list_projects" => "read:projects",
        "create_project" => "admin:projects",
        "create_api_key" | "list_api_keys" | "revoke_api_key" | "rotate_api_key" => "admin:keys",
        _ => return None,
    };
    Some(permission)
}

/// Check a role's permission set against an operation.
pub fn check_permissions(granted: &[String], operation: &str) -> Result<()> {
    let Some(required) = required_permission(operation) else {
        return Err(BrokerError::Forbidden(format!(
            "Unknown operation '{operation}'"
        )));
    };
    if has_permission(granted, required) {
        Ok(())
    } else {
        Err(BrokerError::Forbidden(format!(
            "Operation '{operation}' requires permission '{required}'"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        assert!(permission_matches("read:tasks", "read:tasks"));
        assert!(!permission_matches("read:tasks", "write:tasks"));
    }

    #[test]
    fn test_wildcard_segments() {
        assert!(permission_matches("read:*", "read:tasks"));
        assert!(permission_matches("*", "admin:keys"));
        assert!(permission_matches("admin:*", "admin:keys"));
        assert!(!permission_matches("read:*", "write:tasks"));
    }

    #[test]
    fn test_prefix_is_not_a_wildcard() {
        assert!(!permission_matches("read", "read:tasks"));
        assert!(!permission_matches("read:tasks", "read"));
        assert!(!permission_matches("read:tasks:archive", "read:tasks"));
    }

    #[test]
    fn test_has_permission_over_a_set() {
        let granted = vec!["read:tasks".to_string(), "write:*".to_string()];
        assert!(has_permission(&granted, "write:tasks"));
        assert!(has_permission(&granted, "read:tasks"));
        assert!(!has_permission(&granted, "admin:keys"));
    }

    #[test]
    fn test_operation_table() {
        assert_eq!(required_permission("reserve_task"), Some("write:tasks"));
        assert_eq!(required_permission("query_tasks"), Some("read:tasks"));
        assert_eq!(required_permission("rotate_api_key"), Some("admin:keys"));
        assert_eq!(required_permission("frobnicate"), None);

        assert!(check_permissions(&["write:*".to_string()], "reserve_task").is_ok());
        let err = check_permissions(&["read:tasks".to_string()], "reserve_task").unwrap_err();
        assert!(matches!(err, BrokerError::Forbidden(_)));
    }
}
