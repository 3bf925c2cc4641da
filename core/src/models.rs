use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Core task representation in the broker.
///
/// A task is a unit of work dispensed to autonomous agents. It moves through
/// a lifecycle of reservation (lease), completion and verification, and can
/// be linked to other tasks through typed relationships. Each task carries a
/// numeric id; scoping to an organization happens through its project.
///
/// # Examples
///
/// ```rust
/// use broker_core::models::{Task, TaskStatus, VerificationStatus};
///
/// # fn demo(task: Task) {
/// if task.needs_verification() {
///     // completed but unverified: reservable by a verification agent
///     assert_eq!(task.task_status, TaskStatus::Complete);
///     assert_eq!(task.verification_status, VerificationStatus::Unverified);
/// }
/// # }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    /// Auto-increment primary key
    pub id: i64,
    /// Owning project; tasks without a project are administrative only
    pub project_id: Option<i64>,
    /// Organization scope, denormalized from the project at creation
    pub organization_id: Option<i64>,
    /// Brief task title
    pub title: String,
    /// Concrete / abstract / epic
    pub task_type: TaskType,
    /// What to do
    pub task_instruction: String,
    /// How to verify completion (must be idempotent)
    pub verification_instruction: String,
    /// Free-form notes, appended over the task's life
    pub notes: Option<String>,
    /// Current lifecycle state
    pub task_status: TaskStatus,
    /// Orthogonal verification axis, meaningful after completion
    pub verification_status: VerificationStatus,
    /// Identity of the current lease holder
    pub assigned_agent: Option<String>,
    /// Scheduling priority
    pub priority: Priority,
    /// Optional deadline
    pub due_date: Option<DateTime<Utc>>,
    /// Estimated effort in hours
    pub estimated_hours: Option<f64>,
    /// Actual effort in hours, filled at completion
    pub actual_hours: Option<f64>,
    /// Set on first reservation, never cleared
    pub started_at: Option<DateTime<Utc>>,
    /// Set on completion; presence decides the unlock target state
    pub completed_at: Option<DateTime<Utc>>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Advances on every recorded change; staleness is measured against it
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Completed but not yet verified; surfaced to implementation agents as
    /// reservable work.
    pub fn needs_verification(&self) -> bool {
        self.task_status == TaskStatus::Complete
            && self.verification_status == VerificationStatus::Unverified
    }

    /// Whether a reserve attempt could succeed against this row.
    pub fn is_reservable(&self) -> bool {
        self.assigned_agent.is_none()
            && (self.task_status == TaskStatus::Available || self.needs_verification())
    }

    /// Estimated-vs-actual delta; defined only when both sides are present.
    pub fn time_delta_hours(&self) -> Option<f64> {
        match (self.actual_hours, self.estimated_hours) {
            (Some(actual), Some(estimated)) => Some(actual - estimated),
            _ => None,
        }
    }
}

/// Task lifecycle states.
///
/// `blocked` may be persisted (set when a `blocked_by` edge is added) and is
/// additionally derived at read time from blocked subtask descendants; see
/// [`TaskView`].
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Ready to be reserved
    Available,
    /// Leased by an agent
    InProgress,
    /// Finished; verification axis applies
    Complete,
    /// Waiting on a blocking dependency
    Blocked,
    /// Abandoned, terminal
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Available => "available",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Complete => "complete",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "available" => Some(TaskStatus::Available),
            "in_progress" => Some(TaskStatus::InProgress),
            "complete" => Some(TaskStatus::Complete),
            "blocked" => Some(TaskStatus::Blocked),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal states are never substituted by derived `blocked`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Complete | TaskStatus::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verification axis, orthogonal to [`TaskStatus`].
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Unverified,
    Verified,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationStatus::Unverified => "unverified",
            VerificationStatus::Verified => "verified",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unverified" => Some(VerificationStatus::Unverified),
            "verified" => Some(VerificationStatus::Verified),
            _ => None,
        }
    }
}

impl std::fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task granularity. Breakdown agents are offered abstract/epic tasks,
/// implementation agents concrete ones.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Concrete,
    Abstract,
    Epic,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Concrete => "concrete",
            TaskType::Abstract => "abstract",
            TaskType::Epic => "epic",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "concrete" => Some(TaskType::Concrete),
            "abstract" => Some(TaskType::Abstract),
            "epic" => Some(TaskType::Epic),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling priority, ranked `low < medium < high < critical`.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Priority::Low),
            "medium" => Some(Priority::Medium),
            "high" => Some(Priority::High),
            "critical" => Some(Priority::Critical),
            _ => None,
        }
    }

    /// Numeric rank used for ordering queries.
    pub fn rank(&self) -> u8 {
        match self {
            Priority::Low => 0,
            Priority::Medium => 1,
            Priority::High => 2,
            Priority::Critical => 3,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kinds of agent-authored narrative updates.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UpdateType {
    Progress,
    Note,
    Blocker,
    Question,
    Finding,
}

impl UpdateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateType::Progress => "progress",
            UpdateType::Note => "note",
            UpdateType::Blocker => "blocker",
            UpdateType::Question => "question",
            UpdateType::Finding => "finding",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "progress" => Some(UpdateType::Progress),
            "note" => Some(UpdateType::Note),
            "blocker" => Some(UpdateType::Blocker),
            "question" => Some(UpdateType::Question),
            "finding" => Some(UpdateType::Finding),
            _ => None,
        }
    }
}

/// Directed relationship edge types. `blocking(a, b)` is semantically the
/// inverse of `blocked_by(b, a)`; together they form the blocking graph,
/// which must stay acyclic.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipType {
    Subtask,
    Blocking,
    BlockedBy,
    Followup,
    Related,
}

impl RelationshipType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipType::Subtask => "subtask",
            RelationshipType::Blocking => "blocking",
            RelationshipType::BlockedBy => "blocked_by",
            RelationshipType::Followup => "followup",
            RelationshipType::Related => "related",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "subtask" => Some(RelationshipType::Subtask),
            "blocking" => Some(RelationshipType::Blocking),
            "blocked_by" => Some(RelationshipType::BlockedBy),
            "followup" => Some(RelationshipType::Followup),
            "related" => Some(RelationshipType::Related),
            _ => None,
        }
    }

    /// Whether this edge participates in the acyclic blocking graph.
    pub fn is_blocking(&self) -> bool {
        matches!(self, RelationshipType::Blocking | RelationshipType::BlockedBy)
    }
}

impl std::fmt::Display for RelationshipType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recurrence cadence for template-driven task materialization.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecurrenceType {
    Daily,
    Weekly,
    Monthly,
}

impl RecurrenceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecurrenceType::Daily => "daily",
            RecurrenceType::Weekly => "weekly",
            RecurrenceType::Monthly => "monthly",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "daily" => Some(RecurrenceType::Daily),
            "weekly" => Some(RecurrenceType::Weekly),
            "monthly" => Some(RecurrenceType::Monthly),
            _ => None,
        }
    }
}

/// Caller role deciding which task types are offered as available work.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    /// Works abstract/epic tasks, decomposing them
    Breakdown,
    /// Works concrete tasks; also offered needs-verification items
    Implementation,
}

impl AgentType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "breakdown" => Some(AgentType::Breakdown),
            "implementation" => Some(AgentType::Implementation),
            _ => None,
        }
    }
}

/// Data transfer object for creating new tasks
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewTask {
    pub project_id: Option<i64>,
    pub title: String,
    pub task_type: TaskType,
    pub task_instruction: String,
    pub verification_instruction: String,
    pub notes: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    pub due_date: Option<DateTime<Utc>>,
    pub estimated_hours: Option<f64>,
}

impl NewTask {
    /// Minimal constructor; scheduling fields default.
    pub fn new(
        title: impl Into<String>,
        task_type: TaskType,
        task_instruction: impl Into<String>,
        verification_instruction: impl Into<String>,
    ) -> Self {
        Self {
            project_id: None,
            title: title.into(),
            task_type,
            task_instruction: task_instruction.into(),
            verification_instruction: verification_instruction.into(),
            notes: None,
            priority: Priority::Medium,
            due_date: None,
            estimated_hours: None,
        }
    }
}

/// Field-level patch for task updates. Outer `Option` means "don't touch";
/// the inner `Option` on nullable columns clears the value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub task_type: Option<TaskType>,
    pub task_instruction: Option<String>,
    pub verification_instruction: Option<String>,
    pub notes: Option<Option<String>>,
    pub priority: Option<Priority>,
    pub due_date: Option<Option<DateTime<Utc>>>,
    pub estimated_hours: Option<Option<f64>>,
    pub actual_hours: Option<Option<f64>>,
    pub task_status: Option<TaskStatus>,
    pub verification_status: Option<VerificationStatus>,
}

impl TaskPatch {
    pub fn is_empty(&self) -> bool {
        self == &TaskPatch::default()
    }
}

/// Query ordering modes.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskOrder {
    /// Most recently updated first
    #[default]
    UpdatedAt,
    /// Priority rank descending, then updated_at descending
    Priority,
    /// Priority rank ascending, then updated_at descending
    PriorityAsc,
}

/// Filter criteria for querying tasks.
///
/// All fields are optional; multiple fields combine with AND logic. The
/// organization predicate is NOT part of the filter: it is a separate,
/// mandatory argument on every store call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskFilter {
    pub project_id: Option<i64>,
    pub task_status: Option<TaskStatus>,
    pub task_type: Option<TaskType>,
    pub priority: Option<Priority>,
    pub assigned_agent: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub updated_after: Option<DateTime<Utc>>,
    pub updated_before: Option<DateTime<Utc>>,
    pub due_after: Option<DateTime<Utc>>,
    pub due_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub order_by: TaskOrder,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// Read model wrapping a task row with the computed fields readers observe.
///
/// `effective_status` folds in two derivations: a task that is complete but
/// unverified reads as `available` (it is reservable for verification), and
/// a non-terminal task with a blocked subtask descendant reads as `blocked`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskView {
    #[serde(flatten)]
    pub task: Task,
    pub needs_verification: bool,
    pub effective_status: TaskStatus,
    pub time_delta_hours: Option<f64>,
}

impl TaskView {
    /// Build the read model. `blocked_descendant` is the result of the
    /// bounded subtask-descendant check for this task.
    pub fn new(task: Task, blocked_descendant: bool) -> Self {
        let needs_verification = task.needs_verification();
        let derived_blocked = !task.task_status.is_terminal()
            && (task.task_status == TaskStatus::Blocked || blocked_descendant);
        let effective_status = if derived_blocked {
            TaskStatus::Blocked
        } else if needs_verification {
            TaskStatus::Available
        } else {
            task.task_status
        };
        let time_delta_hours = task.time_delta_hours();
        let mut task = task;
        // Readers observe the derived substitution in the status field too;
        // the underlying row is untouched.
        if derived_blocked {
            task.task_status = TaskStatus::Blocked;
        }
        Self {
            task,
            needs_verification,
            effective_status,
            time_delta_hours,
        }
    }
}

/// Lightweight listing row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSummary {
    pub id: i64,
    pub project_id: Option<i64>,
    pub title: String,
    pub task_type: TaskType,
    pub task_status: TaskStatus,
    pub verification_status: VerificationStatus,
    pub priority: Priority,
    pub assigned_agent: Option<String>,
    pub due_date: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Aggregate counters over a filtered task set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskStatistics {
    pub total: u64,
    pub by_status: BTreeMap<String, u64>,
    pub by_type: BTreeMap<String, u64>,
    pub by_priority: BTreeMap<String, u64>,
    pub overdue: u64,
    pub avg_actual_hours: Option<f64>,
}

/// Per-agent completion statistics over a date range.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentPerformance {
    pub agent_id: String,
    pub completed: u64,
    pub verified: u64,
    pub avg_actual_hours: Option<f64>,
}

/// Project: container for tasks and the unit API credentials authenticate
/// against. Exactly one owning organization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Project {
    pub id: i64,
    pub organization_id: i64,
    pub name: String,
    pub local_path: Option<String>,
    pub origin_url: Option<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewProject {
    pub name: String,
    pub local_path: Option<String>,
    pub origin_url: Option<String>,
    pub description: Option<String>,
}

/// Tenancy root. Owns projects, API keys, teams and roles.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Organization {
    pub id: i64,
    pub name: String,
    pub slug: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Team {
    pub id: i64,
    pub organization_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Named set of permission strings; entries may be wildcarded (`read:*`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Role {
    pub id: i64,
    pub organization_id: i64,
    pub name: String,
    pub permissions: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Links a user identity to an organization, optionally a team, and zero or
/// more roles.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Membership {
    pub id: i64,
    pub organization_id: i64,
    pub team_id: Option<i64>,
    pub user_id: String,
    pub role_ids: Vec<i64>,
    pub created_at: DateTime<Utc>,
}

/// API credential metadata. The secret is stored as a one-way hash; only the
/// display prefix survives in read models.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiKey {
    pub id: i64,
    pub project_id: i64,
    pub organization_id: i64,
    pub name: String,
    pub key_prefix: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// A freshly created credential. `secret` is returned exactly once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IssuedApiKey {
    pub key: ApiKey,
    pub secret: String,
}

/// Result of resolving a presented secret against the credential table.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiKeyResolution {
    pub key_id: i64,
    pub project_id: i64,
    pub organization_id: i64,
    pub enabled: bool,
}

/// Request scope resolved from a credential by the tenant guard. Every
/// broker operation runs under exactly one scope.
#[derive(Debug, Clone, PartialEq)]
pub struct Scope {
    pub organization_id: i64,
    pub project_id: i64,
    pub key_id: i64,
}

/// Directed edge `(parent, child, type)`, unique per triple.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Relationship {
    pub id: i64,
    pub parent_task_id: i64,
    pub child_task_id: i64,
    pub relationship_type: RelationshipType,
    pub created_at: DateTime<Utc>,
}

/// Relationship joined with the titles of both endpoints, for listings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelatedTask {
    #[serde(flatten)]
    pub relationship: Relationship,
    pub parent_title: String,
    pub child_title: String,
}

/// Agent-authored narrative entry tied to a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskUpdate {
    pub id: i64,
    pub task_id: i64,
    pub agent_id: String,
    pub update_type: UpdateType,
    pub content: String,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Append-only change record; one per state transition, field mutation or
/// relationship event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeRecord {
    pub id: i64,
    pub task_id: i64,
    pub agent_id: String,
    pub change_type: String,
    pub field_name: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Snapshot of the content/scheduling fields, taken at creation (version 1)
/// and whenever one of them changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskVersion {
    pub id: i64,
    pub task_id: i64,
    pub version_number: i64,
    pub title: String,
    pub task_type: TaskType,
    pub task_instruction: String,
    pub verification_instruction: String,
    pub priority: Priority,
    pub estimated_hours: Option<f64>,
    pub due_date: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

/// One changed field between two versions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldChange {
    pub old_value: serde_json::Value,
    pub new_value: serde_json::Value,
}

impl TaskVersion {
    /// Fields whose values differ between `self` (old) and `other` (new).
    pub fn diff(&self, other: &TaskVersion) -> BTreeMap<String, FieldChange> {
        fn entry(
            out: &mut BTreeMap<String, FieldChange>,
            field: &str,
            old: serde_json::Value,
            new: serde_json::Value,
        ) {
            if old != new {
                out.insert(
                    field.to_string(),
                    FieldChange {
                        old_value: old,
                        new_value: new,
                    },
                );
            }
        }

        let mut out = BTreeMap::new();
        entry(&mut out, "title", self.title.clone().into(), other.title.clone().into());
        entry(
            &mut out,
            "task_type",
            self.task_type.as_str().into(),
            other.task_type.as_str().into(),
        );
        entry(
            &mut out,
            "task_instruction",
            self.task_instruction.clone().into(),
            other.task_instruction.clone().into(),
        );
        entry(
            &mut out,
            "verification_instruction",
            self.verification_instruction.clone().into(),
            other.verification_instruction.clone().into(),
        );
        entry(
            &mut out,
            "priority",
            self.priority.as_str().into(),
            other.priority.as_str().into(),
        );
        entry(
            &mut out,
            "estimated_hours",
            serde_json::json!(self.estimated_hours),
            serde_json::json!(other.estimated_hours),
        );
        entry(
            &mut out,
            "due_date",
            serde_json::json!(self.due_date),
            serde_json::json!(other.due_date),
        );
        entry(
            &mut out,
            "notes",
            serde_json::json!(self.notes),
            serde_json::json!(other.notes),
        );
        out
    }
}

/// Typed recurrence configuration; which field applies depends on the type.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RecurrenceConfig {
    /// 0 = Monday … 6 = Sunday; weekly recurrences
    pub day_of_week: Option<u8>,
    /// 1–31, clamped to month length; monthly recurrences
    pub day_of_month: Option<u8>,
}

/// A template task plus a schedule that materializes fresh instances.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Recurrence {
    pub id: i64,
    pub base_task_id: i64,
    pub recurrence_type: RecurrenceType,
    pub config: RecurrenceConfig,
    pub next_occurrence: DateTime<Utc>,
    pub last_occurrence_created: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewRecurrence {
    pub base_task_id: i64,
    pub recurrence_type: RecurrenceType,
    #[serde(default)]
    pub config: RecurrenceConfig,
    pub next_occurrence: DateTime<Utc>,
}

/// Partial update for a recurrence schedule.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RecurrencePatch {
    pub recurrence_type: Option<RecurrenceType>,
    pub config: Option<RecurrenceConfig>,
    pub next_occurrence: Option<DateTime<Utc>>,
    pub is_active: Option<bool>,
}

/// Globally named keyword; creation is idempotent by name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tag {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Named blueprint for creating tasks with pre-filled content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Template {
    pub id: i64,
    pub organization_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub task_type: TaskType,
    pub task_instruction: String,
    pub verification_instruction: String,
    pub priority: Priority,
    pub estimated_hours: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewTemplate {
    pub name: String,
    pub description: Option<String>,
    pub task_type: TaskType,
    pub task_instruction: String,
    pub verification_instruction: String,
    #[serde(default)]
    pub priority: Priority,
    pub estimated_hours: Option<f64>,
}

/// Threaded commentary on a task. Deleting a parent cascades to replies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Comment {
    pub id: i64,
    pub task_id: i64,
    pub author_agent: String,
    pub parent_comment_id: Option<i64>,
    pub content: String,
    pub mentions: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewComment {
    pub task_id: i64,
    pub author_agent: String,
    pub parent_comment_id: Option<i64>,
    pub content: String,
    #[serde(default)]
    pub mentions: Vec<String>,
}

/// Advisory warning attached to a successful reservation of a task that was
/// previously reclaimed as stale. Does not alter the state machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StaleWarning {
    pub is_stale: bool,
    pub previous_agent: String,
    pub unlocked_at: DateTime<Utc>,
    pub stale_finding: String,
    pub warning: String,
}

impl StaleWarning {
    /// Scan recent updates for the stale marker. Structured metadata wins;
    /// the substring convention is the fallback.
    pub fn scan(updates: &[TaskUpdate]) -> Option<StaleWarning> {
        for update in updates {
            if update.update_type != UpdateType::Finding {
                continue;
            }
            let meta_stale = update
                .metadata
                .as_ref()
                .and_then(|m| m.get("stale"))
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            let content = update.content.to_lowercase();
            let text_stale = content.contains("stale")
                || content.contains("abandoned")
                || content.contains("unlocked due to timeout");
            if meta_stale || text_stale {
                let previous_agent = update
                    .metadata
                    .as_ref()
                    .and_then(|m| m.get("previous_agent"))
                    .and_then(|v| v.as_str())
                    .unwrap_or(&update.agent_id)
                    .to_string();
                return Some(StaleWarning {
                    is_stale: true,
                    previous_agent,
                    unlocked_at: update.created_at,
                    stale_finding: update.content.clone(),
                    warning: "This task was previously abandoned and may have partially \
                              completed work. Verify all previous work before continuing."
                        .to_string(),
                });
            }
        }
        None
    }
}

/// One stale lease released by the reclaimer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReclaimedLease {
    pub task_id: i64,
    pub previous_agent: String,
    pub idle_since: DateTime<Utc>,
}

/// Per-id outcome of a bulk unlock.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BulkUnlockReport {
    pub unlocked: Vec<i64>,
    pub failed: Vec<BulkUnlockFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BulkUnlockFailure {
    pub task_id: i64,
    pub error: String,
}

/// Which stream a feed event came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FeedSource {
    History,
    Update,
}

/// Entry in the merged activity feed, chronological oldest-first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedEvent {
    pub task_id: i64,
    pub agent_id: String,
    pub source: FeedSource,
    /// change_type for history events, update_type for updates
    pub label: String,
    /// new_value for history events, content for updates
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Filter for the activity feed query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedFilter {
    pub task_id: Option<i64>,
    pub agent_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

/// Outcome of a `complete` call: a regular completion, or a verification
/// when the task had already been completed before.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum CompletionOutcome {
    Completed(Task),
    Verified(Task),
}

impl CompletionOutcome {
    pub fn task(&self) -> &Task {
        match self {
            CompletionOutcome::Completed(t) | CompletionOutcome::Verified(t) => t,
        }
    }

    pub fn verified(&self) -> bool {
        matches!(self, CompletionOutcome::Verified(_))
    }
}

/// Full read context for a task: the task, its project, subtask ancestry,
/// recent narrative and history, and the stale block when present.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskContext {
    pub task: TaskView,
    pub project: Option<Project>,
    pub ancestry: Vec<TaskSummary>,
    pub updates: Vec<TaskUpdate>,
    pub recent_changes: Vec<ChangeRecord>,
    pub stale_info: Option<StaleWarning>,
}

/// Synthetic agent identity used by the background loops and the propagator.
pub const SYSTEM_AGENT: &str = "system";

/// Notes written onto auto-completed parents.
pub const AUTO_COMPLETE_NOTES: &str = "Auto-completed: all subtasks complete";

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_task() -> Task {
        Task {
            id: 1,
            project_id: Some(1),
            organization_id: Some(1),
            title: "Index the corpus".to_string(),
            task_type: TaskType::Concrete,
            task_instruction: "Build the index".to_string(),
            verification_instruction: "Query returns hits".to_string(),
            notes: None,
            task_status: TaskStatus::Available,
            verification_status: VerificationStatus::Unverified,
            assigned_agent: None,
            priority: Priority::Medium,
            due_date: None,
            estimated_hours: Some(2.0),
            actual_hours: None,
            started_at: None,
            completed_at: None,
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            updated_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_needs_verification() {
        let mut task = sample_task();
        assert!(!task.needs_verification());

        task.task_status = TaskStatus::Complete;
        assert!(task.needs_verification());

        task.verification_status = VerificationStatus::Verified;
        assert!(!task.needs_verification());
    }

    #[test]
    fn test_reservable_states() {
        let mut task = sample_task();
        assert!(task.is_reservable());

        task.task_status = TaskStatus::Complete;
        assert!(task.is_reservable(), "needs-verification is reservable");

        task.verification_status = VerificationStatus::Verified;
        assert!(!task.is_reservable());

        task.task_status = TaskStatus::InProgress;
        task.verification_status = VerificationStatus::Unverified;
        task.assigned_agent = Some("a1".to_string());
        assert!(!task.is_reservable());
    }

    #[test]
    fn test_time_delta_requires_both_sides() {
        let mut task = sample_task();
        assert_eq!(task.time_delta_hours(), None);

        task.actual_hours = Some(3.5);
        assert_eq!(task.time_delta_hours(), Some(1.5));

        task.estimated_hours = None;
        assert_eq!(task.time_delta_hours(), None);
    }

    #[test]
    fn test_effective_status_needs_verification() {
        let mut task = sample_task();
        task.task_status = TaskStatus::Complete;
        let view = TaskView::new(task, false);
        assert!(view.needs_verification);
        assert_eq!(view.effective_status, TaskStatus::Available);
        assert_eq!(view.task.task_status, TaskStatus::Complete);
    }

    #[test]
    fn test_effective_status_derived_blocked() {
        let task = sample_task();
        let view = TaskView::new(task, true);
        assert_eq!(view.effective_status, TaskStatus::Blocked);
        assert_eq!(view.task.task_status, TaskStatus::Blocked);
    }

    #[test]
    fn test_derived_blocked_never_touches_terminal_rows() {
        let mut task = sample_task();
        task.task_status = TaskStatus::Complete;
        task.verification_status = VerificationStatus::Verified;
        let view = TaskView::new(task, true);
        assert_eq!(view.effective_status, TaskStatus::Complete);

        let mut task = sample_task();
        task.task_status = TaskStatus::Cancelled;
        let view = TaskView::new(task, true);
        assert_eq!(view.effective_status, TaskStatus::Cancelled);
    }

    #[test]
    fn test_enum_round_trips() {
        for s in ["available", "in_progress", "complete", "blocked", "cancelled"] {
            assert_eq!(TaskStatus::parse(s).unwrap().as_str(), s);
        }
        for s in ["subtask", "blocking", "blocked_by", "followup", "related"] {
            assert_eq!(RelationshipType::parse(s).unwrap().as_str(), s);
        }
        assert!(TaskStatus::parse("archived").is_none());
        assert!(RelationshipType::parse("child").is_none());
    }

    #[test]
    fn test_priority_ranking() {
        assert!(Priority::Critical.rank() > Priority::High.rank());
        assert!(Priority::High.rank() > Priority::Medium.rank());
        assert!(Priority::Medium.rank() > Priority::Low.rank());
    }

    #[test]
    fn test_serde_wire_names() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::InProgress).unwrap(),
            "\"in_progress\""
        );
        assert_eq!(
            serde_json::to_string(&RelationshipType::BlockedBy).unwrap(),
            "\"blocked_by\""
        );
        assert_eq!(
            serde_json::from_str::<Priority>("\"critical\"").unwrap(),
            Priority::Critical
        );
    }

    #[test]
    fn test_version_diff() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let v1 = TaskVersion {
            id: 1,
            task_id: 7,
            version_number: 1,
            title: "Old title".to_string(),
            task_type: TaskType::Concrete,
            task_instruction: "Do it".to_string(),
            verification_instruction: "Check it".to_string(),
            priority: Priority::Medium,
            estimated_hours: None,
            due_date: None,
            notes: None,
            created_by: "a1".to_string(),
            created_at: now,
        };
        let mut v2 = v1.clone();
        v2.version_number = 2;
        v2.title = "New title".to_string();
        v2.priority = Priority::High;
        v2.estimated_hours = Some(4.0);

        let diff = v1.diff(&v2);
        assert_eq!(diff.len(), 3);
        assert_eq!(diff["title"].old_value, serde_json::json!("Old title"));
        assert_eq!(diff["title"].new_value, serde_json::json!("New title"));
        assert_eq!(diff["priority"].new_value, serde_json::json!("high"));
        assert_eq!(diff["estimated_hours"].old_value, serde_json::Value::Null);
        assert!(!diff.contains_key("task_instruction"));
    }

    #[test]
    fn test_stale_warning_scan_metadata() {
        let update = TaskUpdate {
            id: 1,
            task_id: 9,
            agent_id: SYSTEM_AGENT.to_string(),
            update_type: UpdateType::Finding,
            content: "Task unlocked due to timeout. Previous agent: a1".to_string(),
            metadata: Some(serde_json::json!({"stale": true, "previous_agent": "a1"})),
            created_at: Utc::now(),
        };
        let warning = StaleWarning::scan(&[update]).unwrap();
        assert!(warning.is_stale);
        assert_eq!(warning.previous_agent, "a1");
        assert!(warning.stale_finding.contains("unlocked due to timeout"));
    }

    #[test]
    fn test_stale_warning_scan_substring_fallback() {
        let update = TaskUpdate {
            id: 1,
            task_id: 9,
            agent_id: "a1".to_string(),
            update_type: UpdateType::Finding,
            content: "Looks abandoned, picking it back up".to_string(),
            metadata: None,
            created_at: Utc::now(),
        };
        assert!(StaleWarning::scan(&[update]).is_some());

        let benign = TaskUpdate {
            id: 2,
            task_id: 9,
            agent_id: "a1".to_string(),
            update_type: UpdateType::Progress,
            content: "stale cache cleared".to_string(),
            metadata: None,
            created_at: Utc::now(),
        };
        assert!(
            StaleWarning::scan(&[benign]).is_none(),
            "only finding updates are scanned"
        );
    }
}
