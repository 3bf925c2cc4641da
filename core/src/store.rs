use crate::error::Result;
use crate::models::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Task persistence and lease operations.
///
/// This is the single transactional gateway for task rows; all other
/// components receive it by interface and never bypass it. Implementations
/// must be thread-safe and support concurrent access. Every method that
/// reads or writes scoped rows takes a mandatory `org_id` predicate; the
/// store never infers tenancy itself. The handful of system-wide entry
/// points (the background loops, credential resolution) are documented as
/// such.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Create a task under the given organization, recording a `created`
    /// history entry and version 1.
    ///
    /// # Returns
    /// * `Ok(Task)` - the created task with assigned id and timestamps
    /// * `Err(BrokerError::NotFound)` - the project does not exist in scope
    /// * `Err(BrokerError::Validation)` - invalid content fields
    async fn create_task(&self, org_id: i64, task: NewTask, agent_id: &str) -> Result<Task>;

    /// Fetch a raw task row. `Ok(None)` for missing ids and for rows owned
    /// by another organization.
    async fn get_task(&self, org_id: i64, id: i64) -> Result<Option<Task>>;

    /// Apply a field patch. Emits one history record per changed field and a
    /// version snapshot when any snapshotted field changed. Direct status
    /// writes are validated against the transition table.
    async fn update_task_fields(
        &self,
        org_id: i64,
        id: i64,
        patch: TaskPatch,
        agent_id: &str,
    ) -> Result<Task>;

    /// Filtered listing. Default order is most-recently-updated first; see
    /// [`TaskOrder`] for the priority orderings.
    async fn query_tasks(&self, org_id: i64, filter: TaskFilter) -> Result<Vec<Task>>;

    /// Tokenized case-insensitive substring search across title,
    /// instructions and notes, ranked by distinct token hits then
    /// updated_at. An empty query returns up to `limit` scoped tasks.
    async fn search_tasks(&self, org_id: i64, query: &str, limit: u32) -> Result<Vec<Task>>;

    /// Aggregate counters over the filtered set.
    async fn task_statistics(&self, org_id: i64, filter: TaskFilter) -> Result<TaskStatistics>;

    /// Lightweight listing rows for dashboards.
    async fn task_summaries(&self, org_id: i64, filter: TaskFilter) -> Result<Vec<TaskSummary>>;

    /// The agent-facing "what should I do next" list.
    ///
    /// Implementation agents get concrete tasks, with needs-verification
    /// items first in their own bucket; breakdown agents get abstract/epic
    /// tasks and never see needs-verification items. Tasks whose effective
    /// status derives to `blocked` are excluded.
    async fn available_for_agent(
        &self,
        org_id: i64,
        agent_type: AgentType,
        project_id: Option<i64>,
        limit: u32,
    ) -> Result<Vec<Task>>;

    /// Tasks completed on or after `since`, most recent first.
    async fn recent_completions(
        &self,
        org_id: i64,
        since: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Task>>;

    /// Open tasks with a due date within `within_hours` from now.
    async fn approaching_deadline(
        &self,
        org_id: i64,
        within_hours: i64,
        limit: u32,
    ) -> Result<Vec<Task>>;

    /// Open tasks whose due date has passed.
    async fn overdue_tasks(&self, org_id: i64, limit: u32) -> Result<Vec<Task>>;

    /// In-progress tasks idle longer than `threshold_hours` (read-only; the
    /// reclaimer is what releases them).
    async fn stale_tasks(&self, org_id: i64, threshold_hours: i64) -> Result<Vec<Task>>;

    /// Completion statistics for one agent since a cutoff.
    async fn agent_performance(
        &self,
        org_id: i64,
        agent_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<AgentPerformance>;

    // Lease protocol. Each operation is defined by a precondition on the
    // current row and is enforced with an atomic conditional update: exactly
    // one concurrent caller observes rows-affected = 1.

    /// Reserve (lock) a task. Succeeds on `available` rows and on
    /// complete+unverified rows (verification lease, which keeps
    /// `completed_at`). Sets `started_at` on first reservation.
    ///
    /// # Returns
    /// * `Ok(Task)` - the reserved task, now in_progress
    /// * `Err(BrokerError::NotFound)` - unknown or cross-tenant id
    /// * `Err(BrokerError::NotReservable)` - with the observed status/holder
    async fn reserve(&self, org_id: i64, id: i64, agent_id: &str) -> Result<Task>;

    /// Release a lease held by `agent_id`. A verification lease returns to
    /// complete+unverified; a work lease returns to available.
    async fn unlock(&self, org_id: i64, id: i64, agent_id: &str) -> Result<Task>;

    /// Complete a task held by `agent_id`. When the row carries a
    /// `completed_at` from before the lease the call verifies instead.
    /// Fills `actual_hours` from `started_at` when not supplied. Runs the
    /// auto-complete propagation inside the same transaction.
    async fn complete(
        &self,
        org_id: i64,
        id: i64,
        agent_id: &str,
        notes: Option<String>,
        actual_hours: Option<f64>,
    ) -> Result<CompletionOutcome>;

    /// Mark a complete+unverified task verified. Any agent may verify.
    ///
    /// # Returns
    /// * `Err(BrokerError::AlreadyVerified)` - idempotency refusal
    /// * `Err(BrokerError::InvalidTransition)` - the task is not complete
    async fn verify(
        &self,
        org_id: i64,
        id: i64,
        agent_id: &str,
        notes: Option<String>,
    ) -> Result<Task>;

    /// Unlock several tasks in one transaction. In strict mode any failure
    /// rolls back every unlock; otherwise failures are reported per id.
    async fn bulk_unlock(
        &self,
        org_id: i64,
        ids: &[i64],
        agent_id: &str,
        strict: bool,
    ) -> Result<BulkUnlockReport>;

    /// System-wide reclaimer entry point (no tenant scope): release every
    /// in-progress task idle past `threshold_hours`, appending the stale
    /// `finding` update and the `unlocked_stale` history record per task.
    async fn reclaim_stale(&self, threshold_hours: i64, limit: u32) -> Result<Vec<ReclaimedLease>>;

    /// Bounded subtask-descendant check backing the derived-blocked
    /// computation.
    async fn has_blocked_descendant(&self, id: i64) -> Result<bool>;

    /// Connectivity probe for monitoring.
    async fn health_check(&self) -> Result<()>;
}

/// Relationship edges and the graph algorithms over them.
#[async_trait]
pub trait RelationshipStore: Send + Sync {
    /// Create an edge. Re-adding an existing `(parent, child, type)` triple
    /// is a no-op returning the existing id. Blocking edges are checked for
    /// cycles first and refused with `CircularDependency`. Adding a
    /// `blocked_by` edge persists `blocked` on the parent task. Records a
    /// `relationship_added` history entry against the parent.
    async fn create_relationship(
        &self,
        org_id: i64,
        parent_task_id: i64,
        child_task_id: i64,
        relationship_type: RelationshipType,
        agent_id: &str,
    ) -> Result<i64>;

    /// Remove an edge; records `relationship_removed`. Returns whether an
    /// edge existed.
    async fn delete_relationship(
        &self,
        org_id: i64,
        parent_task_id: i64,
        child_task_id: i64,
        relationship_type: RelationshipType,
        agent_id: &str,
    ) -> Result<bool>;

    /// Edges touching a task (either side), optionally filtered by type,
    /// joined with both endpoint titles.
    async fn related_tasks(
        &self,
        org_id: i64,
        task_id: i64,
        relationship_type: Option<RelationshipType>,
    ) -> Result<Vec<RelatedTask>>;

    /// Subtask parents of a task up to the root, nearest first. Visited
    /// tracking tolerates accidental cycles in non-blocking edge types.
    async fn ancestry(&self, org_id: i64, task_id: i64) -> Result<Vec<Task>>;

    /// Direct subtask children of a task.
    async fn subtask_children(&self, org_id: i64, task_id: i64) -> Result<Vec<Task>>;
}

/// Append-only audit streams: narrative updates, change history, version
/// snapshots, and the merged activity feed.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Append a narrative update; advances the task's `updated_at` (which is
    /// what the staleness clock measures).
    async fn add_update(
        &self,
        org_id: i64,
        task_id: i64,
        agent_id: &str,
        update_type: UpdateType,
        content: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<TaskUpdate>;

    /// Recent updates for a task, newest first.
    async fn task_updates(&self, org_id: i64, task_id: i64, limit: u32) -> Result<Vec<TaskUpdate>>;

    /// Recent change history for a task, newest first.
    async fn change_history(
        &self,
        org_id: i64,
        task_id: i64,
        limit: u32,
    ) -> Result<Vec<ChangeRecord>>;

    /// Merged feed of history and updates, chronological oldest-first,
    /// stable across sources by `created_at`. Repeated events with the same
    /// (task, label, detail) within the same second collapse to one in the
    /// presented feed; storage keeps them all.
    async fn activity_feed(&self, org_id: i64, filter: FeedFilter) -> Result<Vec<FeedEvent>>;

    /// All snapshots for a task, ascending version number.
    async fn task_versions(&self, org_id: i64, task_id: i64) -> Result<Vec<TaskVersion>>;

    async fn task_version(
        &self,
        org_id: i64,
        task_id: i64,
        version_number: i64,
    ) -> Result<Option<TaskVersion>>;

    async fn latest_version(&self, org_id: i64, task_id: i64) -> Result<Option<TaskVersion>>;
}

/// Recurrence schedules and materialization.
#[async_trait]
pub trait RecurrenceStore: Send + Sync {
    async fn create_recurrence(&self, org_id: i64, recurrence: NewRecurrence)
        -> Result<Recurrence>;

    async fn list_recurrences(&self, org_id: i64, active_only: bool) -> Result<Vec<Recurrence>>;

    async fn get_recurrence(&self, org_id: i64, id: i64) -> Result<Option<Recurrence>>;

    async fn update_recurrence(
        &self,
        org_id: i64,
        id: i64,
        patch: RecurrencePatch,
    ) -> Result<Recurrence>;

    /// Idempotent deactivation; returns whether the recurrence was active.
    async fn deactivate_recurrence(&self, org_id: i64, id: i64) -> Result<bool>;

    /// Clone the base task into a fresh available instance and advance
    /// `next_occurrence` one step. Deliberately NOT idempotent: every call
    /// produces a new instance. `org_id` is `None` when the materializer
    /// loop calls this system-wide.
    async fn materialize_instance(&self, org_id: Option<i64>, id: i64)
        -> Result<(Task, Recurrence)>;

    /// System-wide: active recurrences with `next_occurrence <= now`.
    async fn due_recurrences(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Recurrence>>;
}

/// Tenancy, credentials, and the auxiliary surfaces (tags, templates,
/// comments).
#[async_trait]
pub trait WorkspaceStore: Send + Sync {
    /// Bootstrap entry point; organizations are created administratively,
    /// not through a tenant scope.
    async fn create_organization(&self, name: &str, slug: &str) -> Result<Organization>;

    async fn create_project(&self, org_id: i64, project: NewProject) -> Result<Project>;

    async fn list_projects(&self, org_id: i64) -> Result<Vec<Project>>;

    async fn get_project(&self, org_id: i64, id: i64) -> Result<Option<Project>>;

    /// Issue a credential for a project. The cleartext secret is returned
    /// exactly once; only its hash and display prefix are stored.
    async fn create_api_key(&self, org_id: i64, project_id: i64, name: &str)
        -> Result<IssuedApiKey>;

    async fn list_api_keys(&self, org_id: i64, project_id: i64) -> Result<Vec<ApiKey>>;

    /// Idempotent; returns whether the key was enabled before the call.
    async fn revoke_api_key(&self, org_id: i64, key_id: i64) -> Result<bool>;

    /// Disable the old credential and issue a fresh one for the same
    /// project, atomically.
    async fn rotate_api_key(&self, org_id: i64, key_id: i64) -> Result<IssuedApiKey>;

    /// System-wide: map a presented secret to its credential record. This is
    /// the authentication entry point, so it runs before any scope exists.
    async fn resolve_api_key(&self, secret: &str) -> Result<Option<ApiKeyResolution>>;

    /// Record credential use (best effort, fire-and-forget semantics).
    async fn touch_api_key(&self, key_id: i64) -> Result<()>;

    // Teams, roles and memberships: attribute carriers for finer access
    // policies inside an organization. Enforcement happens in the facade's
    // permission table; the store only records who carries what.

    async fn create_team(
        &self,
        org_id: i64,
        name: &str,
        description: Option<&str>,
    ) -> Result<Team>;

    async fn create_role(&self, org_id: i64, name: &str, permissions: &[String]) -> Result<Role>;

    async fn create_membership(
        &self,
        org_id: i64,
        user_id: &str,
        team_id: Option<i64>,
        role_ids: &[i64],
    ) -> Result<Membership>;

    /// Union of the permission strings carried by every role attached to the
    /// user's memberships in this organization.
    async fn member_permissions(&self, org_id: i64, user_id: &str) -> Result<Vec<String>>;

    // Tags are globally named; creation is idempotent by name.

    async fn create_tag(&self, name: &str) -> Result<Tag>;

    async fn list_tags(&self) -> Result<Vec<Tag>>;

    async fn assign_tag(&self, org_id: i64, task_id: i64, tag_id: i64) -> Result<bool>;

    async fn remove_tag(&self, org_id: i64, task_id: i64, tag_id: i64) -> Result<bool>;

    async fn task_tags(&self, org_id: i64, task_id: i64) -> Result<Vec<Tag>>;

    // Templates

    async fn create_template(&self, org_id: i64, template: NewTemplate) -> Result<Template>;

    async fn list_templates(
        &self,
        org_id: i64,
        task_type: Option<TaskType>,
    ) -> Result<Vec<Template>>;

    async fn get_template(&self, org_id: i64, id: i64) -> Result<Option<Template>>;

    // Comments

    async fn create_comment(&self, org_id: i64, comment: NewComment) -> Result<Comment>;

    async fn task_comments(&self, org_id: i64, task_id: i64, limit: u32) -> Result<Vec<Comment>>;

    /// A root comment and all its transitive replies, oldest first.
    async fn comment_thread(&self, org_id: i64, comment_id: i64) -> Result<Vec<Comment>>;

    /// Only the author may edit.
    async fn update_comment(
        &self,
        org_id: i64,
        comment_id: i64,
        author_agent: &str,
        content: &str,
    ) -> Result<Comment>;

    /// Deletes the comment and cascades to its replies; returns the number
    /// of rows removed.
    async fn delete_comment(&self, org_id: i64, comment_id: i64, author_agent: &str)
        -> Result<u64>;
}

/// The full store contract the broker facade holds. Blanket-implemented for
/// any type providing all five concerns.
pub trait Store:
    TaskStore + RelationshipStore + AuditStore + RecurrenceStore + WorkspaceStore
{
}

impl<T> Store for T where
    T: TaskStore + RelationshipStore + AuditStore + RecurrenceStore + WorkspaceStore
{
}
