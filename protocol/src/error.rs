//! Error envelope construction for transports.
//!
//! Logical failures share one envelope shape. Agent-facing (MCP-flavored)
//! transports serialize it inside a transport-level success; REST transports
//! pair it with [`BrokerError::status_code`]. Every envelope carries
//! actionable guidance so an agent knows which call to make next.

use broker_core::{error::BrokerError, protocol::ErrorEnvelope};

/// Build the transport envelope for a logical failure, with guidance in
/// `error_details`.
pub fn envelope(error: &BrokerError) -> ErrorEnvelope {
    ErrorEnvelope::new(error, guidance(error))
}

/// What the caller should do about this failure.
fn guidance(error: &BrokerError) -> Option<String> {
    let text = match error {
        BrokerError::NotFound(_) => {
            "Verify the id is correct; use query_tasks or list_available to discover valid ids. \
             Ids belonging to other organizations are reported as not found."
        }
        BrokerError::NotReservable { .. } => {
            "Only tasks with status 'available' (or complete-but-unverified) and no holder can \
             be reserved. Wait for the task to be released or pick another from list_available."
        }
        BrokerError::NotAssigned { .. } => {
            "Reserve the task first; only the agent holding the lease may unlock or complete it."
        }
        BrokerError::AlreadyVerified(_) => {
            "The task is finished. No further lease or verification calls are needed."
        }
        BrokerError::InvalidTransition(_, _) => {
            "Check the task's current status with get_task and use the lease operations \
             (reserve/unlock/complete/verify) for lifecycle changes."
        }
        BrokerError::CircularDependency(_) => {
            "The blocking graph must stay acyclic. Inspect existing edges with list_related \
             before adding blocking relationships."
        }
        BrokerError::Validation(_) => {
            "Fix the listed field and retry; nothing was changed."
        }
        BrokerError::Unauthenticated(_) => {
            "Provide a valid API key. Keys are issued per project via create_api_key."
        }
        BrokerError::Forbidden(_) => {
            "Your role lacks the required permission for this operation."
        }
        BrokerError::Transient(_) => {
            "Temporary database condition; retry with backoff."
        }
        BrokerError::Constraint(_)
        | BrokerError::Database(_)
        | BrokerError::Configuration(_)
        | BrokerError::Internal(_) => return None,
    };
    Some(text.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_core::models::TaskStatus;

    #[test]
    fn test_envelope_carries_kind_and_guidance() {
        let err = BrokerError::NotReservable {
            task_id: 3,
            status: TaskStatus::InProgress,
            holder: Some("a1".to_string()),
        };
        let env = envelope(&err);
        assert!(!env.success);
        assert_eq!(env.error_kind, "not_reservable");
        assert!(env.error.contains("Task 3"));
        assert!(env.error_details.unwrap().contains("list_available"));
    }

    #[test]
    fn test_internal_errors_carry_no_guidance() {
        let env = envelope(&BrokerError::Internal("invariant broken".to_string()));
        assert!(env.error_details.is_none());
        assert_eq!(env.error_kind, "internal");
    }
}
