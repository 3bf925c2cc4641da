use crate::models::TaskStatus;
use thiserror::Error;

/// Result type alias for broker operations
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Error taxonomy for the task broker.
///
/// Every failure an operation can return is one of these variants; panics are
/// reserved for programming errors. Each variant maps to a stable
/// `error_kind` tag for the transport envelope and to an HTTP-equivalent
/// status code. Transient store faults are the only retryable class, and
/// only read-only queries are ever retried.
///
/// # Examples
///
/// ```rust
/// use broker_core::error::BrokerError;
///
/// let err = BrokerError::task_not_found(42);
/// assert_eq!(err.error_kind(), "not_found");
/// assert_eq!(err.status_code(), 404);
/// assert!(!err.is_retryable());
/// ```
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BrokerError {
    /// Missing id, or an id belonging to another organization (cross-tenant
    /// probes deliberately answer not-found, never forbidden)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Reserve refused; carries the observed state for agent guidance
    #[error("Task {task_id} cannot be reserved. Current status: {status}, assigned to: {}", holder.as_deref().unwrap_or("none"))]
    NotReservable {
        task_id: i64,
        status: TaskStatus,
        holder: Option<String>,
    },

    /// Lease operation by a non-owning agent
    #[error("Task {task_id} is assigned to '{}'; only the assigned agent may do this", holder.as_deref().unwrap_or("none"))]
    NotAssigned {
        task_id: i64,
        holder: Option<String>,
    },

    /// Verify called on an already-verified task
    #[error("Task {0} is already verified")]
    AlreadyVerified(i64),

    /// Status change that the state machine forbids
    #[error("Invalid status transition from {0} to {1}")]
    InvalidTransition(TaskStatus, TaskStatus),

    /// Blocking-graph edge that would close a cycle
    #[error("Circular dependency detected: {0}")]
    CircularDependency(String),

    /// Input rejected before any state change
    #[error("Validation error: {0}")]
    Validation(String),

    /// Constraint violation surfaced by the store
    #[error("Database constraint error: {0}")]
    Constraint(String),

    /// Non-constraint database failure
    #[error("Database error: {0}")]
    Database(String),

    /// Transient store fault (pool timeout, I/O); safe to retry reads
    #[error("Transient database error: {0}")]
    Transient(String),

    /// Unknown, disabled or malformed credential
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// Authenticated but lacking the required permission
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Startup / configuration problem
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Invariant breach; indicates a bug, not caller error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    /// Not-found error for a task id
    pub fn task_not_found(id: i64) -> Self {
        Self::NotFound(format!("Task {id} not found"))
    }

    /// Not-found error for a project id
    pub fn project_not_found(id: i64) -> Self {
        Self::NotFound(format!("Project {id} not found"))
    }

    /// Validation error for an empty required field
    pub fn empty_field(field: &str) -> Self {
        Self::Validation(format!("Field '{field}' cannot be empty"))
    }

    /// Validation error for an out-of-range enum value
    pub fn invalid_enum(field: &str, value: &str, expected: &str) -> Self {
        Self::Validation(format!(
            "Invalid {field} '{value}'. Must be one of: {expected}"
        ))
    }

    /// Stable tag for the transport error envelope.
    pub fn error_kind(&self) -> &'static str {
        match self {
            BrokerError::NotFound(_) => "not_found",
            BrokerError::NotReservable { .. } => "not_reservable",
            BrokerError::NotAssigned { .. } => "not_assigned",
            BrokerError::AlreadyVerified(_) => "already_verified",
            BrokerError::InvalidTransition(_, _) => "invalid_input",
            BrokerError::Validation(_) => "invalid_input",
            BrokerError::CircularDependency(_) => "circular_dependency",
            BrokerError::Constraint(_) => "database_constraint_error",
            BrokerError::Database(_) | BrokerError::Transient(_) => "database_constraint_error",
            BrokerError::Unauthenticated(_) => "unauthenticated",
            BrokerError::Forbidden(_) => "forbidden",
            BrokerError::Configuration(_) | BrokerError::Internal(_) => "internal",
        }
    }

    /// HTTP-equivalent status code for REST transports.
    pub fn status_code(&self) -> u16 {
        match self {
            BrokerError::NotFound(_) => 404,
            BrokerError::NotReservable { .. } => 409,
            BrokerError::NotAssigned { .. } => 409,
            BrokerError::AlreadyVerified(_) => 409,
            BrokerError::InvalidTransition(_, _) => 422,
            BrokerError::Validation(_) => 422,
            BrokerError::CircularDependency(_) => 422,
            BrokerError::Constraint(_) => 500,
            BrokerError::Database(_) | BrokerError::Transient(_) => 500,
            BrokerError::Unauthenticated(_) => 401,
            BrokerError::Forbidden(_) => 403,
            BrokerError::Configuration(_) | BrokerError::Internal(_) => 500,
        }
    }

    /// Only transient store faults may be retried, and only for reads.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BrokerError::Transient(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BrokerError::NotFound(_))
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, BrokerError::Validation(_))
    }
}
