use broker_core::{
    error::{BrokerError, Result},
    models::{
        ApiKey, ChangeRecord, Comment, Organization, Priority, Project, Recurrence,
        RecurrenceConfig, RecurrenceType, Relationship, RelationshipType, Tag, Task, TaskFilter,
        TaskOrder, TaskStatus, TaskSummary, TaskType, TaskUpdate, TaskVersion, Template,
        UpdateType, VerificationStatus,
    },
};
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};
use std::future::Future;
use std::time::Duration;

/// Column list shared by every task SELECT.
pub const TASK_COLUMNS: &str = "id, project_id, organization_id, title, task_type, \
     task_instruction, verification_instruction, notes, task_status, verification_status, \
     assigned_agent, priority, due_date, estimated_hours, actual_hours, started_at, \
     completed_at, created_at, updated_at";

/// SQL expression ranking priorities for ordered queries.
pub const PRIORITY_RANK_SQL: &str =
    "CASE priority WHEN 'critical' THEN 3 WHEN 'high' THEN 2 WHEN 'medium' THEN 1 ELSE 0 END";

fn bad_enum(column: &str, value: &str) -> BrokerError {
    BrokerError::Database(format!("Invalid {column} in database: {value}"))
}

pub fn parse_task_status(s: &str) -> Result<TaskStatus> {
    TaskStatus::parse(s).ok_or_else(|| bad_enum("task_status", s))
}

pub fn parse_task_type(s: &str) -> Result<TaskType> {
    TaskType::parse(s).ok_or_else(|| bad_enum("task_type", s))
}

pub fn parse_verification_status(s: &str) -> Result<VerificationStatus> {
    VerificationStatus::parse(s).ok_or_else(|| bad_enum("verification_status", s))
}

pub fn parse_priority(s: &str) -> Result<Priority> {
    Priority::parse(s).ok_or_else(|| bad_enum("priority", s))
}

pub fn parse_relationship_type(s: &str) -> Result<RelationshipType> {
    RelationshipType::parse(s).ok_or_else(|| bad_enum("relationship_type", s))
}

pub fn parse_update_type(s: &str) -> Result<UpdateType> {
    UpdateType::parse(s).ok_or_else(|| bad_enum("update_type", s))
}

pub fn parse_recurrence_type(s: &str) -> Result<RecurrenceType> {
    RecurrenceType::parse(s).ok_or_else(|| bad_enum("recurrence_type", s))
}

/// Convert a SQLite row into a [`Task`].
pub fn row_to_task(row: &SqliteRow) -> Result<Task> {
    let status: String = row.get("task_status");
    let verification: String = row.get("verification_status");
    let task_type: String = row.get("task_type");
    let priority: String = row.get("priority");

    Ok(Task {
        id: row.get("id"),
        project_id: row.get("project_id"),
        organization_id: row.get("organization_id"),
        title: row.get("title"),
        task_type: parse_task_type(&task_type)?,
        task_instruction: row.get("task_instruction"),
        verification_instruction: row.get("verification_instruction"),
        notes: row.get("notes"),
        task_status: parse_task_status(&status)?,
        verification_status: parse_verification_status(&verification)?,
        assigned_agent: row.get("assigned_agent"),
        priority: parse_priority(&priority)?,
        due_date: row.get("due_date"),
        estimated_hours: row.get("estimated_hours"),
        actual_hours: row.get("actual_hours"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

pub fn row_to_summary(row: &SqliteRow) -> Result<TaskSummary> {
    let status: String = row.get("task_status");
    let verification: String = row.get("verification_status");
    let task_type: String = row.get("task_type");
    let priority: String = row.get("priority");

    Ok(TaskSummary {
        id: row.get("id"),
        project_id: row.get("project_id"),
        title: row.get("title"),
        task_type: parse_task_type(&task_type)?,
        task_status: parse_task_status(&status)?,
        verification_status: parse_verification_status(&verification)?,
        priority: parse_priority(&priority)?,
        assigned_agent: row.get("assigned_agent"),
        due_date: row.get("due_date"),
        updated_at: row.get("updated_at"),
    })
}

pub fn row_to_relationship(row: &SqliteRow) -> Result<Relationship> {
    let rel_type: String = row.get("relationship_type");
    Ok(Relationship {
        id: row.get("id"),
        parent_task_id: row.get("parent_task_id"),
        child_task_id: row.get("child_task_id"),
        relationship_type: parse_relationship_type(&rel_type)?,
        created_at: row.get("created_at"),
    })
}

pub fn row_to_update(row: &SqliteRow) -> Result<TaskUpdate> {
    let update_type: String = row.get("update_type");
    let metadata: Option<String> = row.get("metadata");
    let metadata = match metadata {
        Some(raw) => Some(
            serde_json::from_str(&raw)
                .map_err(|e| BrokerError::Database(format!("Invalid update metadata: {e}")))?,
        ),
        None => None,
    };

    Ok(TaskUpdate {
        id: row.get("id"),
        task_id: row.get("task_id"),
        agent_id: row.get("agent_id"),
        update_type: parse_update_type(&update_type)?,
        content: row.get("content"),
        metadata,
        created_at: row.get("created_at"),
    })
}

pub fn row_to_change(row: &SqliteRow) -> ChangeRecord {
    ChangeRecord {
        id: row.get("id"),
        task_id: row.get("task_id"),
        agent_id: row.get("agent_id"),
        change_type: row.get("change_type"),
        field_name: row.get("field_name"),
        old_value: row.get("old_value"),
        new_value: row.get("new_value"),
        created_at: row.get("created_at"),
    }
}

pub fn row_to_version(row: &SqliteRow) -> Result<TaskVersion> {
    let task_type: String = row.get("task_type");
    let priority: String = row.get("priority");
    Ok(TaskVersion {
        id: row.get("id"),
        task_id: row.get("task_id"),
        version_number: row.get("version_number"),
        title: row.get("title"),
        task_type: parse_task_type(&task_type)?,
        task_instruction: row.get("task_instruction"),
        verification_instruction: row.get("verification_instruction"),
        priority: parse_priority(&priority)?,
        estimated_hours: row.get("estimated_hours"),
        due_date: row.get("due_date"),
        notes: row.get("notes"),
        created_by: row.get("created_by"),
        created_at: row.get("created_at"),
    })
}

pub fn row_to_recurrence(row: &SqliteRow) -> Result<Recurrence> {
    let rec_type: String = row.get("recurrence_type");
    let config: String = row.get("config");
    let config: RecurrenceConfig = serde_json::from_str(&config)
        .map_err(|e| BrokerError::Database(format!("Invalid recurrence config: {e}")))?;

    Ok(Recurrence {
        id: row.get("id"),
        base_task_id: row.get("base_task_id"),
        recurrence_type: parse_recurrence_type(&rec_type)?,
        config,
        next_occurrence: row.get("next_occurrence"),
        last_occurrence_created: row.get("last_occurrence_created"),
        is_active: row.get("is_active"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

pub fn row_to_project(row: &SqliteRow) -> Project {
    Project {
        id: row.get("id"),
        organization_id: row.get("organization_id"),
        name: row.get("name"),
        local_path: row.get("local_path"),
        origin_url: row.get("origin_url"),
        description: row.get("description"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

pub fn row_to_organization(row: &SqliteRow) -> Organization {
    Organization {
        id: row.get("id"),
        name: row.get("name"),
        slug: row.get("slug"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

pub fn row_to_api_key(row: &SqliteRow) -> ApiKey {
    ApiKey {
        id: row.get("id"),
        project_id: row.get("project_id"),
        organization_id: row.get("organization_id"),
        name: row.get("name"),
        key_prefix: row.get("key_prefix"),
        enabled: row.get("enabled"),
        created_at: row.get("created_at"),
        last_used_at: row.get("last_used_at"),
    }
}

pub fn row_to_tag(row: &SqliteRow) -> Tag {
    Tag {
        id: row.get("id"),
        name: row.get("name"),
        created_at: row.get("created_at"),
    }
}

pub fn row_to_template(row: &SqliteRow) -> Result<Template> {
    let task_type: String = row.get("task_type");
    let priority: String = row.get("priority");
    Ok(Template {
        id: row.get("id"),
        organization_id: row.get("organization_id"),
        name: row.get("name"),
        description: row.get("description"),
        task_type: parse_task_type(&task_type)?,
        task_instruction: row.get("task_instruction"),
        verification_instruction: row.get("verification_instruction"),
        priority: parse_priority(&priority)?,
        estimated_hours: row.get("estimated_hours"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

pub fn row_to_comment(row: &SqliteRow) -> Result<Comment> {
    let mentions: String = row.get("mentions");
    let mentions: Vec<String> = serde_json::from_str(&mentions)
        .map_err(|e| BrokerError::Database(format!("Invalid comment mentions: {e}")))?;

    Ok(Comment {
        id: row.get("id"),
        task_id: row.get("task_id"),
        author_agent: row.get("author_agent"),
        parent_comment_id: row.get("parent_comment_id"),
        content: row.get("content"),
        mentions,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

/// Map a sqlx error into the broker taxonomy. Constraint violations become
/// [`BrokerError::Constraint`]; pool timeouts and I/O faults are transient.
pub fn sqlx_error_to_broker_error(err: sqlx::Error) -> BrokerError {
    match &err {
        sqlx::Error::Database(db_err) => {
            let message = db_err.message();
            if message.contains("UNIQUE constraint failed")
                || message.contains("CHECK constraint failed")
                || message.contains("FOREIGN KEY constraint failed")
            {
                BrokerError::Constraint(format!(
                    "{message} (schema/migration mismatch is a common cause)"
                ))
            } else if message.contains("database is locked") {
                BrokerError::Transient(message.to_string())
            } else {
                BrokerError::Database(message.to_string())
            }
        }
        sqlx::Error::PoolTimedOut => BrokerError::Transient("Connection pool timeout".to_string()),
        sqlx::Error::Io(io_err) => BrokerError::Transient(format!("Database I/O error: {io_err}")),
        sqlx::Error::RowNotFound => {
            BrokerError::Database("Unexpected RowNotFound error".to_string())
        }
        _ => BrokerError::Database(format!("Database operation failed: {err}")),
    }
}

/// Retry policy for read-only queries: up to 3 attempts with exponential
/// backoff on transient faults. Writes are never routed through this.
pub async fn with_read_retry<T, F, Fut>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Err(err) if err.is_retryable() && attempt < 2 => {
                attempt += 1;
                let delay = Duration::from_millis(50 * 2u64.pow(attempt));
                tracing::warn!(attempt, error = %err, "retrying read-only query");
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}

/// Build the filtered task SELECT. The organization predicate is mandatory
/// and always first; absence of a scope is a contract violation upstream.
pub fn build_task_query<'a>(
    org_id: i64,
    filter: &'a TaskFilter,
    columns: &str,
) -> sqlx::QueryBuilder<'a, sqlx::Sqlite> {
    let mut qb: sqlx::QueryBuilder<sqlx::Sqlite> =
        sqlx::QueryBuilder::new(format!("SELECT {columns} FROM tasks WHERE organization_id = "));
    qb.push_bind(org_id);

    if let Some(project_id) = filter.project_id {
        qb.push(" AND project_id = ");
        qb.push_bind(project_id);
    }
    if let Some(status) = filter.task_status {
        qb.push(" AND task_status = ");
        qb.push_bind(status.as_str());
    }
    if let Some(task_type) = filter.task_type {
        qb.push(" AND task_type = ");
        qb.push_bind(task_type.as_str());
    }
    if let Some(priority) = filter.priority {
        qb.push(" AND priority = ");
        qb.push_bind(priority.as_str());
    }
    if let Some(ref agent) = filter.assigned_agent {
        qb.push(" AND assigned_agent = ");
        qb.push_bind(agent);
    }
    if let Some(created_after) = filter.created_after {
        qb.push(" AND created_at >= ");
        qb.push_bind(created_after);
    }
    if let Some(created_before) = filter.created_before {
        qb.push(" AND created_at <= ");
        qb.push_bind(created_before);
    }
    if let Some(updated_after) = filter.updated_after {
        qb.push(" AND updated_at >= ");
        qb.push_bind(updated_after);
    }
    if let Some(updated_before) = filter.updated_before {
        qb.push(" AND updated_at <= ");
        qb.push_bind(updated_before);
    }
    if let Some(due_after) = filter.due_after {
        qb.push(" AND due_date IS NOT NULL AND due_date >= ");
        qb.push_bind(due_after);
    }
    if let Some(due_before) = filter.due_before {
        qb.push(" AND due_date IS NOT NULL AND due_date <= ");
        qb.push_bind(due_before);
    }

    qb
}

/// Append the ORDER BY clause for a [`TaskOrder`].
pub fn push_task_order(qb: &mut sqlx::QueryBuilder<'_, sqlx::Sqlite>, order: TaskOrder) {
    match order {
        TaskOrder::UpdatedAt => {
            qb.push(" ORDER BY updated_at DESC");
        }
        TaskOrder::Priority => {
            qb.push(format!(" ORDER BY {PRIORITY_RANK_SQL} DESC, updated_at DESC"));
        }
        TaskOrder::PriorityAsc => {
            qb.push(format!(" ORDER BY {PRIORITY_RANK_SQL} ASC, updated_at DESC"));
        }
    }
}

/// Floor a timestamp to whole seconds, for same-second feed deduplication.
pub fn floor_to_second(ts: DateTime<Utc>) -> i64 {
    ts.timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Execute;

    #[test]
    fn test_enum_parsers_reject_unknown_values() {
        assert!(parse_task_status("available").is_ok());
        assert!(parse_task_status("Created").is_err());
        assert!(parse_relationship_type("blocked_by").is_ok());
        assert!(parse_relationship_type("depends_on").is_err());
        assert!(parse_priority("critical").is_ok());
        assert!(parse_priority("urgent").is_err());
    }

    #[test]
    fn test_task_query_shape() {
        let filter = TaskFilter {
            project_id: Some(3),
            task_status: Some(TaskStatus::Available),
            assigned_agent: Some("a1".to_string()),
            created_after: Some(Utc::now()),
            order_by: TaskOrder::Priority,
            ..Default::default()
        };

        let mut qb = build_task_query(1, &filter, TASK_COLUMNS);
        push_task_order(&mut qb, filter.order_by);
        let sql = qb.build().sql().to_string();

        assert!(sql.starts_with("SELECT id,"));
        assert!(sql.contains("organization_id = "));
        assert!(sql.contains("AND project_id = "));
        assert!(sql.contains("AND task_status = "));
        assert!(sql.contains("AND assigned_agent = "));
        assert!(sql.contains("AND created_at >= "));
        assert!(sql.contains("CASE priority"));
        assert!(sql.ends_with("updated_at DESC"));
    }

    #[test]
    fn test_default_order_is_recency() {
        let filter = TaskFilter::default();
        let mut qb = build_task_query(1, &filter, TASK_COLUMNS);
        push_task_order(&mut qb, filter.order_by);
        let sql = qb.build().sql().to_string();
        assert!(sql.ends_with("ORDER BY updated_at DESC"));
        assert!(!sql.contains("CASE priority"));
    }

    #[tokio::test]
    async fn test_read_retry_gives_up_on_permanent_errors() {
        let mut calls = 0u32;
        let result: Result<()> = with_read_retry(|| {
            calls += 1;
            async { Err(BrokerError::Database("syntax error".to_string())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1, "permanent errors are not retried");
    }

    #[tokio::test]
    async fn test_read_retry_retries_transient() {
        let mut calls = 0u32;
        let result: Result<u32> = with_read_retry(|| {
            calls += 1;
            let n = calls;
            async move {
                if n < 3 {
                    Err(BrokerError::Transient("pool timeout".to_string()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
    }
}
