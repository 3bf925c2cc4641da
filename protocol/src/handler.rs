//! The broker facade: orchestration of store calls under a tenant scope.
//!
//! [`Broker`] implements [`BrokerApi`] over any [`Store`]. It owns input
//! validation, limit clamping, derived-status assembly, the stale-warning
//! scan on reservation, and the composite operations (create-with-
//! relationship, followup-on-complete, template instantiation). Persistence
//! logic lives entirely below the store traits.

use async_trait::async_trait;
use broker_core::{
    error::{BrokerError, Result},
    models::*,
    protocol::*,
    store::Store,
    validation::{effective_limit, parse_datetime, Validator},
};
use chrono::{Duration, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Default staleness threshold, in hours, when a caller does not supply one.
pub const DEFAULT_TASK_TIMEOUT_HOURS: i64 = 24;

/// How many recent updates the reserve path scans for the stale marker.
const STALE_SCAN_LIMIT: u32 = 10;

/// Broker facade over a store.
#[derive(Clone)]
pub struct Broker<S> {
    store: Arc<S>,
}

impl<S: Store> Broker<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> Arc<S> {
        self.store.clone()
    }

    /// Assemble the read model: the derived-blocked check runs per read and
    /// only for rows it could affect.
    async fn view(&self, task: Task) -> Result<TaskView> {
        let blocked_descendant = if task.task_status.is_terminal() {
            false
        } else {
            self.store.has_blocked_descendant(task.id).await?
        };
        Ok(TaskView::new(task, blocked_descendant))
    }

    async fn views(&self, tasks: Vec<Task>) -> Result<Vec<TaskView>> {
        let mut views = Vec::with_capacity(tasks.len());
        for task in tasks {
            views.push(self.view(task).await?);
        }
        Ok(views)
    }

    async fn require_task(&self, scope: &Scope, task_id: i64) -> Result<Task> {
        self.store
            .get_task(scope.organization_id, task_id)
            .await?
            .ok_or_else(|| BrokerError::task_not_found(task_id))
    }

    fn clamped(filter: &mut TaskFilter) {
        filter.limit = Some(effective_limit(filter.limit));
    }
}

fn summarize(task: &Task) -> TaskSummary {
    TaskSummary {
        id: task.id,
        project_id: task.project_id,
        title: task.title.clone(),
        task_type: task.task_type,
        task_status: task.task_status,
        verification_status: task.verification_status,
        priority: task.priority,
        assigned_agent: task.assigned_agent.clone(),
        due_date: task.due_date,
        updated_at: task.updated_at,
    }
}

#[async_trait]
impl<S: Store> BrokerApi for Broker<S> {
    async fn create_task(&self, scope: &Scope, params: CreateTaskParams) -> Result<TaskView> {
        Validator::validate_agent_id(&params.agent_id)?;
        let due_date = params.due_date.as_deref().map(parse_datetime).transpose()?;

        let new_task = NewTask {
            // The credential's project is the default home for new tasks.
            project_id: params.project_id.or(Some(scope.project_id)),
            title: params.title,
            task_type: params.task_type,
            task_instruction: params.task_instruction,
            verification_instruction: params.verification_instruction,
            notes: params.notes,
            priority: params.priority,
            due_date,
            estimated_hours: params.estimated_hours,
        };
        Validator::validate_new_task(&new_task)?;

        let task = self
            .store
            .create_task(scope.organization_id, new_task, &params.agent_id)
            .await?;

        if let Some(parent_task_id) = params.parent_task_id {
            let relationship_type = params.relationship_type.unwrap_or(RelationshipType::Subtask);
            self.store
                .create_relationship(
                    scope.organization_id,
                    parent_task_id,
                    task.id,
                    relationship_type,
                    &params.agent_id,
                )
                .await?;
        }

        self.view(task).await
    }

    async fn get_task(&self, scope: &Scope, task_id: i64) -> Result<TaskView> {
        let task = self.require_task(scope, task_id).await?;
        self.view(task).await
    }

    async fn task_context(&self, scope: &Scope, task_id: i64) -> Result<TaskContext> {
        let org = scope.organization_id;
        let task = self.require_task(scope, task_id).await?;

        let project = match task.project_id {
            Some(project_id) => self.store.get_project(org, project_id).await?,
            None => None,
        };
        let ancestry = self
            .store
            .ancestry(org, task_id)
            .await?
            .iter()
            .map(summarize)
            .collect();
        let updates = self.store.task_updates(org, task_id, 20).await?;
        let recent_changes = self.store.change_history(org, task_id, 20).await?;
        let stale_info = StaleWarning::scan(&updates);

        Ok(TaskContext {
            task: self.view(task).await?,
            project,
            ancestry,
            updates,
            recent_changes,
            stale_info,
        })
    }

    async fn query_tasks(&self, scope: &Scope, params: QueryTasksParams) -> Result<Vec<TaskView>> {
        let mut filter = params.to_filter()?;
        Self::clamped(&mut filter);
        let tasks = self.store.query_tasks(scope.organization_id, filter).await?;
        self.views(tasks).await
    }

    async fn search_tasks(
        &self,
        scope: &Scope,
        query: String,
        limit: Option<u32>,
    ) -> Result<Vec<TaskView>> {
        let tasks = self
            .store
            .search_tasks(scope.organization_id, &query, effective_limit(limit))
            .await?;
        self.views(tasks).await
    }

    async fn task_summaries(
        &self,
        scope: &Scope,
        params: QueryTasksParams,
    ) -> Result<Vec<TaskSummary>> {
        let mut filter = params.to_filter()?;
        Self::clamped(&mut filter);
        self.store.task_summaries(scope.organization_id, filter).await
    }

    async fn task_statistics(
        &self,
        scope: &Scope,
        params: QueryTasksParams,
    ) -> Result<TaskStatistics> {
        let filter = params.to_filter()?;
        self.store.task_statistics(scope.organization_id, filter).await
    }

    async fn recent_completions(
        &self,
        scope: &Scope,
        within_days: Option<i64>,
        limit: Option<u32>,
    ) -> Result<Vec<TaskView>> {
        let since = Utc::now() - Duration::days(within_days.unwrap_or(7).max(0));
        let tasks = self
            .store
            .recent_completions(scope.organization_id, since, effective_limit(limit))
            .await?;
        self.views(tasks).await
    }

    async fn approaching_deadline(
        &self,
        scope: &Scope,
        within_hours: Option<i64>,
        limit: Option<u32>,
    ) -> Result<Vec<TaskView>> {
        let tasks = self
            .store
            .approaching_deadline(
                scope.organization_id,
                within_hours.unwrap_or(24).max(0),
                effective_limit(limit),
            )
            .await?;
        self.views(tasks).await
    }

    async fn overdue_tasks(&self, scope: &Scope, limit: Option<u32>) -> Result<Vec<TaskView>> {
        let tasks = self
            .store
            .overdue_tasks(scope.organization_id, effective_limit(limit))
            .await?;
        self.views(tasks).await
    }

    async fn stale_tasks(&self, scope: &Scope, hours: Option<i64>) -> Result<Vec<TaskView>> {
        let threshold = hours.unwrap_or(DEFAULT_TASK_TIMEOUT_HOURS);
        if threshold <= 0 {
            return Err(BrokerError::Validation(
                "hours must be a positive integer".to_string(),
            ));
        }
        let tasks = self.store.stale_tasks(scope.organization_id, threshold).await?;
        self.views(tasks).await
    }

    async fn list_available(
        &self,
        scope: &Scope,
        agent_type: AgentType,
        project_id: Option<i64>,
        limit: Option<u32>,
    ) -> Result<Vec<TaskView>> {
        let tasks = self
            .store
            .available_for_agent(
                scope.organization_id,
                agent_type,
                project_id,
                effective_limit(limit.or(Some(10))),
            )
            .await?;
        self.views(tasks).await
    }

    async fn agent_performance(
        &self,
        scope: &Scope,
        agent_id: String,
        since: Option<String>,
    ) -> Result<AgentPerformance> {
        Validator::validate_agent_id(&agent_id)?;
        let since = since.as_deref().map(parse_datetime).transpose()?;
        self.store
            .agent_performance(scope.organization_id, &agent_id, since)
            .await
    }

    async fn update_task(
        &self,
        scope: &Scope,
        task_id: i64,
        patch: TaskPatch,
        agent_id: String,
    ) -> Result<TaskView> {
        Validator::validate_agent_id(&agent_id)?;
        Validator::validate_patch(&patch)?;
        let task = self
            .store
            .update_task_fields(scope.organization_id, task_id, patch, &agent_id)
            .await?;
        self.view(task).await
    }

    // Lease protocol

    async fn reserve_task(
        &self,
        scope: &Scope,
        task_id: i64,
        agent_id: String,
    ) -> Result<ReserveResponse> {
        Validator::validate_agent_id(&agent_id)?;
        let task = self
            .store
            .reserve(scope.organization_id, task_id, &agent_id)
            .await?;

        // Advisory only: a previously reclaimed task warns its next holder.
        let updates = self
            .store
            .task_updates(scope.organization_id, task_id, STALE_SCAN_LIMIT)
            .await?;
        let stale_warning = StaleWarning::scan(&updates);

        Ok(ReserveResponse {
            task: self.view(task).await?,
            stale_warning,
        })
    }

    async fn unlock_task(
        &self,
        scope: &Scope,
        task_id: i64,
        agent_id: String,
    ) -> Result<TaskView> {
        Validator::validate_agent_id(&agent_id)?;
        let task = self
            .store
            .unlock(scope.organization_id, task_id, &agent_id)
            .await?;
        self.view(task).await
    }

    async fn complete_task(
        &self,
        scope: &Scope,
        params: CompleteTaskParams,
    ) -> Result<CompleteResponse> {
        Validator::validate_agent_id(&params.agent_id)?;
        let followup = params.followup();
        if let Some(ref followup) = followup {
            Validator::validate_new_task(followup)?;
        }

        let outcome = self
            .store
            .complete(
                scope.organization_id,
                params.task_id,
                &params.agent_id,
                params.notes.clone(),
                params.actual_hours,
            )
            .await?;

        let mut response = CompleteResponse {
            task_id: params.task_id,
            completed: true,
            verified: outcome.verified(),
            followup_task_id: None,
        };

        // Followups only attach to a fresh completion, never to a
        // verification, and land in the completed task's project.
        if let (CompletionOutcome::Completed(task), Some(mut followup)) = (&outcome, followup) {
            followup.project_id = task.project_id;
            let created = self
                .store
                .create_task(scope.organization_id, followup, &params.agent_id)
                .await?;
            self.store
                .create_relationship(
                    scope.organization_id,
                    params.task_id,
                    created.id,
                    RelationshipType::Followup,
                    &params.agent_id,
                )
                .await?;
            response.followup_task_id = Some(created.id);
        }

        Ok(response)
    }

    async fn verify_task(
        &self,
        scope: &Scope,
        task_id: i64,
        agent_id: String,
        notes: Option<String>,
    ) -> Result<TaskView> {
        Validator::validate_agent_id(&agent_id)?;
        let task = self
            .store
            .verify(scope.organization_id, task_id, &agent_id, notes)
            .await?;
        self.view(task).await
    }

    async fn bulk_unlock(
        &self,
        scope: &Scope,
        params: BulkUnlockParams,
    ) -> Result<BulkUnlockReport> {
        Validator::validate_agent_id(&params.agent_id)?;
        if params.task_ids.is_empty() {
            return Err(BrokerError::empty_field("task_ids"));
        }
        self.store
            .bulk_unlock(
                scope.organization_id,
                &params.task_ids,
                &params.agent_id,
                params.strict,
            )
            .await
    }

    // Updates & feed

    async fn add_update(&self, scope: &Scope, params: AddUpdateParams) -> Result<TaskUpdate> {
        Validator::validate_agent_id(&params.agent_id)?;
        Validator::validate_update_content(&params.content)?;
        self.store
            .add_update(
                scope.organization_id,
                params.task_id,
                &params.agent_id,
                params.update_type,
                &params.content,
                params.metadata,
            )
            .await
    }

    async fn list_updates(
        &self,
        scope: &Scope,
        task_id: i64,
        limit: Option<u32>,
    ) -> Result<Vec<TaskUpdate>> {
        self.require_task(scope, task_id).await?;
        self.store
            .task_updates(scope.organization_id, task_id, effective_limit(limit))
            .await
    }

    async fn activity_feed(
        &self,
        scope: &Scope,
        params: ActivityFeedParams,
    ) -> Result<Vec<FeedEvent>> {
        let filter = params.to_filter()?;
        self.store.activity_feed(scope.organization_id, filter).await
    }

    // Relationships

    async fn create_relationship(
        &self,
        scope: &Scope,
        params: CreateRelationshipParams,
    ) -> Result<i64> {
        Validator::validate_agent_id(&params.agent_id)?;
        self.store
            .create_relationship(
                scope.organization_id,
                params.parent_task_id,
                params.child_task_id,
                params.relationship_type,
                &params.agent_id,
            )
            .await
    }

    async fn list_related(
        &self,
        scope: &Scope,
        task_id: i64,
        relationship_type: Option<RelationshipType>,
    ) -> Result<Vec<RelatedTask>> {
        self.require_task(scope, task_id).await?;
        self.store
            .related_tasks(scope.organization_id, task_id, relationship_type)
            .await
    }

    // Versions

    async fn list_versions(&self, scope: &Scope, task_id: i64) -> Result<Vec<TaskVersion>> {
        self.require_task(scope, task_id).await?;
        self.store.task_versions(scope.organization_id, task_id).await
    }

    async fn get_version(
        &self,
        scope: &Scope,
        task_id: i64,
        version_number: i64,
    ) -> Result<TaskVersion> {
        self.store
            .task_version(scope.organization_id, task_id, version_number)
            .await?
            .ok_or_else(|| {
                BrokerError::NotFound(format!(
                    "Version {version_number} of task {task_id} not found"
                ))
            })
    }

    async fn latest_version(&self, scope: &Scope, task_id: i64) -> Result<TaskVersion> {
        self.store
            .latest_version(scope.organization_id, task_id)
            .await?
            .ok_or_else(|| BrokerError::NotFound(format!("Task {task_id} has no versions")))
    }

    async fn diff_versions(
        &self,
        scope: &Scope,
        task_id: i64,
        from_version: i64,
        to_version: i64,
    ) -> Result<BTreeMap<String, FieldChange>> {
        let from = self.get_version(scope, task_id, from_version).await?;
        let to = self.get_version(scope, task_id, to_version).await?;
        Ok(from.diff(&to))
    }

    // Recurrence

    async fn create_recurring(
        &self,
        scope: &Scope,
        params: CreateRecurringParams,
    ) -> Result<Recurrence> {
        Validator::validate_recurrence(params.recurrence_type, &params.config)?;
        let next_occurrence = parse_datetime(&params.next_occurrence)?;
        self.store
            .create_recurrence(
                scope.organization_id,
                NewRecurrence {
                    base_task_id: params.base_task_id,
                    recurrence_type: params.recurrence_type,
                    config: params.config,
                    next_occurrence,
                },
            )
            .await
    }

    async fn list_recurring(&self, scope: &Scope, active_only: bool) -> Result<Vec<Recurrence>> {
        self.store
            .list_recurrences(scope.organization_id, active_only)
            .await
    }

    async fn update_recurring(
        &self,
        scope: &Scope,
        recurring_id: i64,
        patch: RecurrencePatch,
    ) -> Result<Recurrence> {
        // The store validates the merged schedule, since the patch may
        // change type and config independently.
        self.store
            .update_recurrence(scope.organization_id, recurring_id, patch)
            .await
    }

    async fn deactivate_recurring(&self, scope: &Scope, recurring_id: i64) -> Result<bool> {
        self.store
            .deactivate_recurrence(scope.organization_id, recurring_id)
            .await
    }

    async fn create_instance_now(
        &self,
        scope: &Scope,
        recurring_id: i64,
    ) -> Result<MaterializedInstance> {
        let (task, recurrence) = self
            .store
            .materialize_instance(Some(scope.organization_id), recurring_id)
            .await?;
        Ok(MaterializedInstance {
            task: self.view(task).await?,
            next_occurrence: recurrence.next_occurrence,
        })
    }

    // Tags

    // Tags are globally named; the scope authenticates the caller but does
    // not partition the namespace.
    async fn create_tag(&self, _scope: &Scope, name: String) -> Result<Tag> {
        Validator::validate_tag_name(&name)?;
        self.store.create_tag(name.trim()).await
    }

    async fn list_tags(&self, _scope: &Scope) -> Result<Vec<Tag>> {
        self.store.list_tags().await
    }

    async fn assign_tag(&self, scope: &Scope, task_id: i64, tag_id: i64) -> Result<bool> {
        self.store
            .assign_tag(scope.organization_id, task_id, tag_id)
            .await
    }

    async fn remove_tag(&self, scope: &Scope, task_id: i64, tag_id: i64) -> Result<bool> {
        self.store
            .remove_tag(scope.organization_id, task_id, tag_id)
            .await
    }

    async fn list_task_tags(&self, scope: &Scope, task_id: i64) -> Result<Vec<Tag>> {
        self.require_task(scope, task_id).await?;
        self.store.task_tags(scope.organization_id, task_id).await
    }

    // Templates

    async fn create_template(&self, scope: &Scope, template: NewTemplate) -> Result<Template> {
        Validator::validate_template(&template)?;
        self.store
            .create_template(scope.organization_id, template)
            .await
    }

    async fn list_templates(
        &self,
        scope: &Scope,
        task_type: Option<TaskType>,
    ) -> Result<Vec<Template>> {
        self.store
            .list_templates(scope.organization_id, task_type)
            .await
    }

    async fn get_template(&self, scope: &Scope, template_id: i64) -> Result<Template> {
        self.store
            .get_template(scope.organization_id, template_id)
            .await?
            .ok_or_else(|| BrokerError::NotFound(format!("Template {template_id} not found")))
    }

    async fn create_task_from_template(
        &self,
        scope: &Scope,
        params: CreateFromTemplateParams,
    ) -> Result<TaskView> {
        Validator::validate_agent_id(&params.agent_id)?;
        let template = self.get_template(scope, params.template_id).await?;
        let due_date = params.due_date.as_deref().map(parse_datetime).transpose()?;

        let new_task = NewTask {
            project_id: params.project_id.or(Some(scope.project_id)),
            title: params.title,
            task_type: template.task_type,
            task_instruction: template.task_instruction,
            verification_instruction: template.verification_instruction,
            notes: params.notes,
            priority: params.priority.unwrap_or(template.priority),
            due_date,
            estimated_hours: template.estimated_hours,
        };
        Validator::validate_new_task(&new_task)?;

        let task = self
            .store
            .create_task(scope.organization_id, new_task, &params.agent_id)
            .await?;
        self.view(task).await
    }

    // Comments

    async fn create_comment(&self, scope: &Scope, comment: NewComment) -> Result<Comment> {
        Validator::validate_comment(&comment)?;
        self.store.create_comment(scope.organization_id, comment).await
    }

    async fn list_task_comments(
        &self,
        scope: &Scope,
        task_id: i64,
        limit: Option<u32>,
    ) -> Result<Vec<Comment>> {
        self.require_task(scope, task_id).await?;
        self.store
            .task_comments(scope.organization_id, task_id, effective_limit(limit))
            .await
    }

    async fn get_comment_thread(&self, scope: &Scope, comment_id: i64) -> Result<Vec<Comment>> {
        self.store
            .comment_thread(scope.organization_id, comment_id)
            .await
    }

    async fn update_comment(
        &self,
        scope: &Scope,
        comment_id: i64,
        agent_id: String,
        content: String,
    ) -> Result<Comment> {
        Validator::validate_agent_id(&agent_id)?;
        self.store
            .update_comment(scope.organization_id, comment_id, &agent_id, &content)
            .await
    }

    async fn delete_comment(
        &self,
        scope: &Scope,
        comment_id: i64,
        agent_id: String,
    ) -> Result<u64> {
        Validator::validate_agent_id(&agent_id)?;
        self.store
            .delete_comment(scope.organization_id, comment_id, &agent_id)
            .await
    }

    // Tenancy

    async fn list_projects(&self, scope: &Scope) -> Result<Vec<Project>> {
        self.store.list_projects(scope.organization_id).await
    }

    async fn create_project(&self, scope: &Scope, project: NewProject) -> Result<Project> {
        self.store.create_project(scope.organization_id, project).await
    }

    async fn create_api_key(
        &self,
        scope: &Scope,
        project_id: Option<i64>,
        name: String,
    ) -> Result<IssuedApiKey> {
        let project_id = project_id.unwrap_or(scope.project_id);
        self.store
            .create_api_key(scope.organization_id, project_id, &name)
            .await
    }

    async fn list_api_keys(
        &self,
        scope: &Scope,
        project_id: Option<i64>,
    ) -> Result<Vec<ApiKey>> {
        let project_id = project_id.unwrap_or(scope.project_id);
        self.store
            .list_api_keys(scope.organization_id, project_id)
            .await
    }

    async fn revoke_api_key(&self, scope: &Scope, key_id: i64) -> Result<bool> {
        self.store.revoke_api_key(scope.organization_id, key_id).await
    }

    async fn rotate_api_key(&self, scope: &Scope, key_id: i64) -> Result<IssuedApiKey> {
        self.store.rotate_api_key(scope.organization_id, key_id).await
    }
}
