//! Broker Core Library
//!
//! Foundational domain models, state-machine rules, and trait interfaces for
//! the task broker. All other crates depend on the types and interfaces
//! defined here.
//!
//! # Architecture
//!
//! - [`models`] - Core domain models (Task, statuses, relationships, audit
//!   records, tenancy entities)
//! - [`error`] - Error taxonomy and result handling
//! - [`state`] - Task state machine and lease rules
//! - [`store`] - Store trait family for transactional persistence
//! - [`protocol`] - Broker API trait, operation parameters, error envelope
//! - [`validation`] - Input validation applied before any state change
//!
//! # Example
//!
//! ```rust
//! use broker_core::{
//!     models::{NewTask, TaskType},
//!     validation::Validator,
//! };
//!
//! let task = NewTask::new(
//!     "Partition the log store",
//!     TaskType::Concrete,
//!     "Split the log table by month",
//!     "Queries over March hit exactly one partition",
//! );
//!
//! Validator::validate_new_task(&task).unwrap();
//! ```

pub mod error;
pub mod models;
pub mod protocol;
pub mod state;
pub mod store;
pub mod validation;

// Re-export commonly used types at the crate root for convenience
pub use error::{BrokerError, Result};
pub use models::{
    AgentType, CompletionOutcome, NewTask, Priority, RelationshipType, Scope, Task, TaskFilter,
    TaskPatch, TaskStatus, TaskType, TaskView, UpdateType, VerificationStatus,
};
pub use protocol::{
    ActivityFeedParams, AddUpdateParams, BrokerApi, BulkUnlockParams, CompleteTaskParams,
    CreateFromTemplateParams, CreateRecurringParams, CreateRelationshipParams, CreateTaskParams,
    ErrorEnvelope, QueryTasksParams, ReserveResponse,
};
pub use store::{AuditStore, RecurrenceStore, RelationshipStore, Store, TaskStore, WorkspaceStore};
pub use validation::{Validator, DEFAULT_QUERY_LIMIT, MAX_QUERY_LIMIT};

/// Current version of the core crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crate_constants() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_re_exports() {
        let status = TaskStatus::Available;
        assert_eq!(format!("{status}"), "available");

        let error = BrokerError::task_not_found(1);
        assert!(error.is_not_found());
    }
}
