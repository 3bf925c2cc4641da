//! Task state machine rules.
//!
//! The rules here are pure: they decide whether a transition is legal and
//! what the lease operations require, without touching storage. The store
//! enforces them atomically with conditional row updates so that concurrent
//! callers race on `rows_affected` instead of on reads.

use crate::error::{BrokerError, Result};
use crate::models::{Task, TaskStatus, VerificationStatus};

/// Change-history labels emitted by the lease operations.
pub mod change {
    pub const CREATED: &str = "created";
    pub const LOCKED: &str = "locked";
    pub const LOCKED_FOR_VERIFICATION: &str = "locked_for_verification";
    pub const UNLOCKED: &str = "unlocked";
    pub const UNLOCKED_STALE: &str = "unlocked_stale";
    pub const COMPLETED: &str = "completed";
    pub const VERIFIED: &str = "verified";
    pub const FIELD_UPDATED: &str = "field_updated";
    pub const STATUS_CHANGED: &str = "status_changed";
    pub const RELATIONSHIP_ADDED: &str = "relationship_added";
    pub const RELATIONSHIP_REMOVED: &str = "relationship_removed";
}

/// Legal direct status changes via `update_fields`. Lease operations
/// (reserve/unlock/complete/verify) have their own preconditions and do not
/// go through this table.
pub fn can_transition(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;

    match (from, to) {
        (current, new) if current == new => false,

        (Available, InProgress | Blocked | Cancelled) => true,
        (InProgress, Available | Complete | Blocked | Cancelled) => true,
        (Blocked, Available | InProgress | Cancelled) => true,
        // Completed tasks only move back through an explicit verification
        // lease, never via a plain status write.
        (Complete, _) => false,
        (Cancelled, _) => false,

        _ => false,
    }
}

/// Validate a direct status write, producing the typed refusal.
pub fn validate_transition(from: TaskStatus, to: TaskStatus) -> Result<()> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(BrokerError::InvalidTransition(from, to))
    }
}

/// Which flavor of lease a reserve call would take on this row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseKind {
    /// Plain reservation of an available task
    Work,
    /// Reservation of a complete-but-unverified task for verification
    Verification,
}

/// Decide whether `task` can be reserved, and as what. Mirrors the
/// conditional UPDATE the store runs; used to produce precise refusals and
/// to pick the history label.
pub fn reserve_kind(task: &Task) -> Result<LeaseKind> {
    if task.assigned_agent.is_some() {
        return Err(BrokerError::NotReservable {
            task_id: task.id,
            status: task.task_status,
            holder: task.assigned_agent.clone(),
        });
    }
    match (task.task_status, task.verification_status) {
        (TaskStatus::Available, _) => Ok(LeaseKind::Work),
        (TaskStatus::Complete, VerificationStatus::Unverified) => Ok(LeaseKind::Verification),
        _ => Err(BrokerError::NotReservable {
            task_id: task.id,
            status: task.task_status,
            holder: None,
        }),
    }
}

/// Check lease ownership for unlock/complete.
pub fn require_owner(task: &Task, agent_id: &str) -> Result<()> {
    match task.assigned_agent.as_deref() {
        Some(holder) if holder == agent_id => Ok(()),
        holder => Err(BrokerError::NotAssigned {
            task_id: task.id,
            holder: holder.map(str::to_string),
        }),
    }
}

/// Status a released lease returns to. A verification lease (the row already
/// has `completed_at`) goes back to complete+unverified; a work lease goes
/// back to available. Keeps `completed_at` ⇔ `complete` intact.
pub fn release_target(task: &Task) -> TaskStatus {
    if task.completed_at.is_some() {
        TaskStatus::Complete
    } else {
        TaskStatus::Available
    }
}
