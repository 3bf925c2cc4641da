//! Broker API surface.
//!
//! [`BrokerApi`] is the transport-agnostic operation set exposed to external
//! transports (REST, MCP, …). Transports authenticate a credential into a
//! [`Scope`] first and pass it to every call; the facade owns validation and
//! orchestration, never persistence.

use crate::error::{BrokerError, Result};
use crate::models::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Parameters for creating a task. Content fields plus an optional parent
/// edge created atomically with the task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTaskParams {
    pub title: String,
    pub task_type: TaskType,
    pub task_instruction: String,
    pub verification_instruction: String,
    pub agent_id: String,
    /// Defaults to the credential's project when omitted
    pub project_id: Option<i64>,
    pub notes: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    pub estimated_hours: Option<f64>,
    /// ISO-8601; naïve values are treated as UTC
    pub due_date: Option<String>,
    pub parent_task_id: Option<i64>,
    pub relationship_type: Option<RelationshipType>,
}

/// Parameters for task queries; dates arrive as ISO-8601 strings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryTasksParams {
    pub project_id: Option<i64>,
    pub task_status: Option<TaskStatus>,
    pub task_type: Option<TaskType>,
    pub priority: Option<Priority>,
    pub assigned_agent: Option<String>,
    pub created_after: Option<String>,
    pub created_before: Option<String>,
    pub updated_after: Option<String>,
    pub updated_before: Option<String>,
    pub due_after: Option<String>,
    pub due_before: Option<String>,
    #[serde(default)]
    pub order_by: TaskOrder,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl QueryTasksParams {
    /// Convert to the store filter, parsing date strings.
    pub fn to_filter(&self) -> Result<TaskFilter> {
        Ok(TaskFilter {
            project_id: self.project_id,
            task_status: self.task_status,
            task_type: self.task_type,
            priority: self.priority,
            assigned_agent: self.assigned_agent.clone(),
            created_after: parse_optional_datetime(&self.created_after)?,
            created_before: parse_optional_datetime(&self.created_before)?,
            updated_after: parse_optional_datetime(&self.updated_after)?,
            updated_before: parse_optional_datetime(&self.updated_before)?,
            due_after: parse_optional_datetime(&self.due_after)?,
            due_before: parse_optional_datetime(&self.due_before)?,
            order_by: self.order_by,
            limit: self.limit,
            offset: self.offset,
        })
    }
}

fn parse_optional_datetime(value: &Option<String>) -> Result<Option<DateTime<Utc>>> {
    match value {
        Some(s) => crate::validation::parse_datetime(s).map(Some),
        None => Ok(None),
    }
}

/// Parameters for completing a task; the followup block, when fully present,
/// creates and links a followup task in the same transaction scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteTaskParams {
    pub task_id: i64,
    pub agent_id: String,
    pub notes: Option<String>,
    pub actual_hours: Option<f64>,
    pub followup_title: Option<String>,
    pub followup_task_type: Option<TaskType>,
    pub followup_instruction: Option<String>,
    pub followup_verification: Option<String>,
}

impl CompleteTaskParams {
    pub fn new(task_id: i64, agent_id: impl Into<String>) -> Self {
        Self {
            task_id,
            agent_id: agent_id.into(),
            notes: None,
            actual_hours: None,
            followup_title: None,
            followup_task_type: None,
            followup_instruction: None,
            followup_verification: None,
        }
    }

    /// The followup block counts only when every field is present.
    pub fn followup(&self) -> Option<NewTask> {
        match (
            &self.followup_title,
            self.followup_task_type,
            &self.followup_instruction,
            &self.followup_verification,
        ) {
            (Some(title), Some(task_type), Some(instruction), Some(verification)) => {
                Some(NewTask::new(
                    title.clone(),
                    task_type,
                    instruction.clone(),
                    verification.clone(),
                ))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkUnlockParams {
    pub task_ids: Vec<i64>,
    pub agent_id: String,
    /// All-or-nothing when set; per-id reporting otherwise
    #[serde(default)]
    pub strict: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddUpdateParams {
    pub task_id: i64,
    pub agent_id: String,
    pub update_type: UpdateType,
    pub content: String,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActivityFeedParams {
    pub task_id: Option<i64>,
    pub agent_id: Option<String>,
    pub since: Option<String>,
    pub until: Option<String>,
    pub limit: Option<u32>,
}

impl ActivityFeedParams {
    pub fn to_filter(&self) -> Result<FeedFilter> {
        Ok(FeedFilter {
            task_id: self.task_id,
            agent_id: self.agent_id.clone(),
            since: parse_optional_datetime(&self.since)?,
            until: parse_optional_datetime(&self.until)?,
            limit: self.limit,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRelationshipParams {
    pub parent_task_id: i64,
    pub child_task_id: i64,
    pub relationship_type: RelationshipType,
    pub agent_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRecurringParams {
    pub base_task_id: i64,
    pub recurrence_type: RecurrenceType,
    #[serde(default)]
    pub config: RecurrenceConfig,
    /// ISO-8601; naïve values are treated as UTC
    pub next_occurrence: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateFromTemplateParams {
    pub template_id: i64,
    pub title: String,
    pub agent_id: String,
    pub project_id: Option<i64>,
    pub notes: Option<String>,
    /// Overrides the template's priority when set
    pub priority: Option<Priority>,
    pub due_date: Option<String>,
}

/// Successful reservation: the read model plus the advisory stale block when
/// the task had been reclaimed before.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReserveResponse {
    pub task: TaskView,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stale_warning: Option<StaleWarning>,
}

/// Outcome of a complete call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteResponse {
    pub task_id: i64,
    pub completed: bool,
    pub verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub followup_task_id: Option<i64>,
}

/// A freshly materialized recurrence instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaterializedInstance {
    pub task: TaskView,
    pub next_occurrence: DateTime<Utc>,
}

/// Logical-failure envelope shared by all transports. MCP-flavored
/// transports return it inside a transport-level success; REST maps
/// `error_kind` to a status code via [`BrokerError::status_code`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub success: bool,
    pub error: String,
    pub error_kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,
}

impl ErrorEnvelope {
    pub fn new(error: &BrokerError, details: Option<String>) -> Self {
        Self {
            success: false,
            error: error.to_string(),
            error_kind: error.error_kind().to_string(),
            error_details: details,
        }
    }
}

impl From<&BrokerError> for ErrorEnvelope {
    fn from(error: &BrokerError) -> Self {
        Self::new(error, None)
    }
}

/// Transport-agnostic broker operations.
///
/// Every method takes the resolved [`Scope`] first; referencing an id from
/// another organization answers `not_found`. Input validation happens at
/// this layer, before any state change.
#[async_trait]
pub trait BrokerApi: Send + Sync {
    // Tasks

    async fn create_task(&self, scope: &Scope, params: CreateTaskParams) -> Result<TaskView>;

    async fn get_task(&self, scope: &Scope, task_id: i64) -> Result<TaskView>;

    /// Task plus project, ancestry, recent updates/changes and stale info.
    async fn task_context(&self, scope: &Scope, task_id: i64) -> Result<TaskContext>;

    async fn query_tasks(&self, scope: &Scope, params: QueryTasksParams) -> Result<Vec<TaskView>>;

    async fn search_tasks(
        &self,
        scope: &Scope,
        query: String,
        limit: Option<u32>,
    ) -> Result<Vec<TaskView>>;

    async fn task_summaries(
        &self,
        scope: &Scope,
        params: QueryTasksParams,
    ) -> Result<Vec<TaskSummary>>;

    async fn task_statistics(
        &self,
        scope: &Scope,
        params: QueryTasksParams,
    ) -> Result<TaskStatistics>;

    async fn recent_completions(
        &self,
        scope: &Scope,
        within_days: Option<i64>,
        limit: Option<u32>,
    ) -> Result<Vec<TaskView>>;

    async fn approaching_deadline(
        &self,
        scope: &Scope,
        within_hours: Option<i64>,
        limit: Option<u32>,
    ) -> Result<Vec<TaskView>>;

    async fn overdue_tasks(&self, scope: &Scope, limit: Option<u32>) -> Result<Vec<TaskView>>;

    async fn stale_tasks(&self, scope: &Scope, hours: Option<i64>) -> Result<Vec<TaskView>>;

    /// The agent work queue; see [`crate::store::TaskStore::available_for_agent`].
    async fn list_available(
        &self,
        scope: &Scope,
        agent_type: AgentType,
        project_id: Option<i64>,
        limit: Option<u32>,
    ) -> Result<Vec<TaskView>>;

    async fn agent_performance(
        &self,
        scope: &Scope,
        agent_id: String,
        since: Option<String>,
    ) -> Result<AgentPerformance>;

    async fn update_task(
        &self,
        scope: &Scope,
        task_id: i64,
        patch: TaskPatch,
        agent_id: String,
    ) -> Result<TaskView>;

    // Lease protocol

    async fn reserve_task(
        &self,
        scope: &Scope,
        task_id: i64,
        agent_id: String,
    ) -> Result<ReserveResponse>;

    async fn unlock_task(&self, scope: &Scope, task_id: i64, agent_id: String)
        -> Result<TaskView>;

    async fn complete_task(
        &self,
        scope: &Scope,
        params: CompleteTaskParams,
    ) -> Result<CompleteResponse>;

    async fn verify_task(
        &self,
        scope: &Scope,
        task_id: i64,
        agent_id: String,
        notes: Option<String>,
    ) -> Result<TaskView>;

    async fn bulk_unlock(
        &self,
        scope: &Scope,
        params: BulkUnlockParams,
    ) -> Result<BulkUnlockReport>;

    // Updates & feed

    async fn add_update(&self, scope: &Scope, params: AddUpdateParams) -> Result<TaskUpdate>;

    async fn list_updates(
        &self,
        scope: &Scope,
        task_id: i64,
        limit: Option<u32>,
    ) -> Result<Vec<TaskUpdate>>;

    async fn activity_feed(
        &self,
        scope: &Scope,
        params: ActivityFeedParams,
    ) -> Result<Vec<FeedEvent>>;

    // Relationships

    async fn create_relationship(
        &self,
        scope: &Scope,
        params: CreateRelationshipParams,
    ) -> Result<i64>;

    async fn list_related(
        &self,
        scope: &Scope,
        task_id: i64,
        relationship_type: Option<RelationshipType>,
    ) -> Result<Vec<RelatedTask>>;

    // Versions

    async fn list_versions(&self, scope: &Scope, task_id: i64) -> Result<Vec<TaskVersion>>;

    async fn get_version(
        &self,
        scope: &Scope,
        task_id: i64,
        version_number: i64,
    ) -> Result<TaskVersion>;

    async fn latest_version(&self, scope: &Scope, task_id: i64) -> Result<TaskVersion>;

    async fn diff_versions(
        &self,
        scope: &Scope,
        task_id: i64,
        from_version: i64,
        to_version: i64,
    ) -> Result<BTreeMap<String, FieldChange>>;

    // Recurrence

    async fn create_recurring(
        &self,
        scope: &Scope,
        params: CreateRecurringParams,
    ) -> Result<Recurrence>;

    async fn list_recurring(&self, scope: &Scope, active_only: bool) -> Result<Vec<Recurrence>>;

    async fn update_recurring(
        &self,
        scope: &Scope,
        recurring_id: i64,
        patch: RecurrencePatch,
    ) -> Result<Recurrence>;

    async fn deactivate_recurring(&self, scope: &Scope, recurring_id: i64) -> Result<bool>;

    /// On-demand materialization; every call produces a new instance.
    async fn create_instance_now(
        &self,
        scope: &Scope,
        recurring_id: i64,
    ) -> Result<MaterializedInstance>;

    // Tags

    async fn create_tag(&self, scope: &Scope, name: String) -> Result<Tag>;

    async fn list_tags(&self, scope: &Scope) -> Result<Vec<Tag>>;

    async fn assign_tag(&self, scope: &Scope, task_id: i64, tag_id: i64) -> Result<bool>;

    async fn remove_tag(&self, scope: &Scope, task_id: i64, tag_id: i64) -> Result<bool>;

    async fn list_task_tags(&self, scope: &Scope, task_id: i64) -> Result<Vec<Tag>>;

    // Templates

    async fn create_template(&self, scope: &Scope, template: NewTemplate) -> Result<Template>;

    async fn list_templates(
        &self,
        scope: &Scope,
        task_type: Option<TaskType>,
    ) -> Result<Vec<Template>>;

    async fn get_template(&self, scope: &Scope, template_id: i64) -> Result<Template>;

    async fn create_task_from_template(
        &self,
        scope: &Scope,
        params: CreateFromTemplateParams,
    ) -> Result<TaskView>;

    // Comments

    async fn create_comment(&self, scope: &Scope, comment: NewComment) -> Result<Comment>;

    async fn list_task_comments(
        &self,
        scope: &Scope,
        task_id: i64,
        limit: Option<u32>,
    ) -> Result<Vec<Comment>>;

    async fn get_comment_thread(&self, scope: &Scope, comment_id: i64) -> Result<Vec<Comment>>;

    async fn update_comment(
        &self,
        scope: &Scope,
        comment_id: i64,
        agent_id: String,
        content: String,
    ) -> Result<Comment>;

    async fn delete_comment(&self, scope: &Scope, comment_id: i64, agent_id: String)
        -> Result<u64>;

    // Tenancy

    async fn list_projects(&self, scope: &Scope) -> Result<Vec<Project>>;

    async fn create_project(&self, scope: &Scope, project: NewProject) -> Result<Project>;

    /// Defaults to the credential's project when `project_id` is omitted.
    async fn create_api_key(
        &self,
        scope: &Scope,
        project_id: Option<i64>,
        name: String,
    ) -> Result<IssuedApiKey>;

    async fn list_api_keys(&self, scope: &Scope, project_id: Option<i64>)
        -> Result<Vec<ApiKey>>;

    async fn revoke_api_key(&self, scope: &Scope, key_id: i64) -> Result<bool>;

    async fn rotate_api_key(&self, scope: &Scope, key_id: i64) -> Result<IssuedApiKey>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_params_to_filter() {
        let params = QueryTasksParams {
            task_status: Some(TaskStatus::Available),
            created_after: Some("2024-05-01T00:00:00Z".to_string()),
            updated_before: Some("2024-06-01 12:30:00".to_string()),
            order_by: TaskOrder::Priority,
            limit: Some(25),
            ..Default::default()
        };

        let filter = params.to_filter().unwrap();
        assert_eq!(filter.task_status, Some(TaskStatus::Available));
        assert!(filter.created_after.is_some());
        assert!(filter.updated_before.is_some(), "naïve input is accepted as UTC");
        assert_eq!(filter.order_by, TaskOrder::Priority);
        assert_eq!(filter.limit, Some(25));
    }

    #[test]
    fn test_query_params_rejects_garbage_dates() {
        let params = QueryTasksParams {
            created_after: Some("yesterday".to_string()),
            ..Default::default()
        };
        assert!(params.to_filter().is_err());
    }

    #[test]
    fn test_followup_requires_all_fields() {
        let mut params = CompleteTaskParams::new(1, "a1");
        assert!(params.followup().is_none());

        params.followup_title = Some("Ship it".to_string());
        params.followup_task_type = Some(TaskType::Concrete);
        params.followup_instruction = Some("Deploy".to_string());
        assert!(params.followup().is_none(), "missing verification");

        params.followup_verification = Some("Smoke test passes".to_string());
        let followup = params.followup().unwrap();
        assert_eq!(followup.title, "Ship it");
        assert_eq!(followup.task_type, TaskType::Concrete);
    }

    #[test]
    fn test_error_envelope() {
        let err = BrokerError::task_not_found(9);
        let envelope = ErrorEnvelope::from(&err);
        assert!(!envelope.success);
        assert_eq!(envelope.error_kind, "not_found");
        assert!(envelope.error.contains("Task 9"));

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["success"], serde_json::json!(false));
        assert!(json.get("error_details").is_none());
    }
}
