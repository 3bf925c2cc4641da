use crate::common::{
    build_task_query, push_task_order, row_to_task, sqlx_error_to_broker_error, with_read_retry,
    PRIORITY_RANK_SQL, TASK_COLUMNS,
};
use async_trait::async_trait;
use broker_core::{
    error::{BrokerError, Result},
    models::{
        AgentPerformance, AgentType, BulkUnlockFailure, BulkUnlockReport, CompletionOutcome,
        NewTask, ReclaimedLease, Task, TaskFilter, TaskStatistics, TaskStatus, TaskSummary,
        UpdateType, AUTO_COMPLETE_NOTES, SYSTEM_AGENT,
    },
    state::{self, change, LeaseKind},
    store::TaskStore,
};
use chrono::{DateTime, Duration, Utc};
use sqlx::{migrate::MigrateDatabase, Row, Sqlite, SqliteConnection, SqlitePool};
use std::collections::{HashSet, VecDeque};

/// Upper bound on nodes visited by any graph walk (propagation, derived
/// blocked, ancestry). Tolerates accidental cycles in non-blocking edges.
pub(crate) const MAX_WALK_NODES: usize = 512;

/// SQLite implementation of the store trait family.
///
/// Persistence runs through a connection pool with WAL journaling for file
/// databases; every multi-row mutation is wrapped in a single transaction.
/// The lease protocol is enforced with conditional updates so that
/// concurrent callers race on `rows_affected` rather than on reads.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect to the given SQLite database URL (file path or `:memory:`),
    /// creating file databases that do not exist yet.
    pub async fn new(database_url: &str) -> Result<Self> {
        let db_url = if database_url.starts_with(":memory:") || database_url.starts_with("sqlite://")
        {
            database_url.to_string()
        } else {
            format!("sqlite://{database_url}")
        };

        if !db_url.contains(":memory:") && !Sqlite::database_exists(&db_url).await.unwrap_or(false)
        {
            Sqlite::create_database(&db_url).await.map_err(|error| {
                tracing::error!(%error, "failed to create database");
                BrokerError::Database(format!("Failed to create database: {error}"))
            })?;
            tracing::info!("database created");
        }

        let connect_options = if db_url == ":memory:" {
            sqlx::sqlite::SqliteConnectOptions::new()
                .filename(&db_url)
                .create_if_missing(true)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Memory)
                .busy_timeout(std::time::Duration::from_secs(30))
                .foreign_keys(true)
        } else {
            sqlx::sqlite::SqliteConnectOptions::new()
                .filename(db_url.replace("sqlite://", ""))
                .create_if_missing(true)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .busy_timeout(std::time::Duration::from_secs(30))
                .foreign_keys(true)
        };

        let pool = SqlitePool::connect_with(connect_options)
            .await
            .map_err(sqlx_error_to_broker_error)?;

        Ok(Self { pool })
    }

    /// Apply pending migrations; call once after construction.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| BrokerError::Database(format!("Migration failed: {e}")))?;
        tracing::info!("database migrations completed");
        Ok(())
    }

    /// Direct pool access, for tests that need raw SQL.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

// Transaction-level helpers shared across the store impls.

pub(crate) async fn fetch_task(conn: &mut SqliteConnection, id: i64) -> Result<Option<Task>> {
    let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(sqlx_error_to_broker_error)?;
    row.as_ref().map(row_to_task).transpose()
}

pub(crate) async fn fetch_task_scoped(
    conn: &mut SqliteConnection,
    org_id: i64,
    id: i64,
) -> Result<Option<Task>> {
    let row = sqlx::query(&format!(
        "SELECT {TASK_COLUMNS} FROM tasks WHERE id = ? AND organization_id = ?"
    ))
    .bind(id)
    .bind(org_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(sqlx_error_to_broker_error)?;
    row.as_ref().map(row_to_task).transpose()
}

#[allow(clippy::too_many_arguments)]
pub(crate) async fn record_history(
    conn: &mut SqliteConnection,
    task_id: i64,
    agent_id: &str,
    change_type: &str,
    field_name: Option<&str>,
    old_value: Option<&str>,
    new_value: Option<&str>,
    at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO change_history (task_id, agent_id, change_type, field_name, old_value, new_value, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(task_id)
    .bind(agent_id)
    .bind(change_type)
    .bind(field_name)
    .bind(old_value)
    .bind(new_value)
    .bind(at)
    .execute(&mut *conn)
    .await
    .map_err(sqlx_error_to_broker_error)?;
    Ok(())
}

pub(crate) async fn insert_update(
    conn: &mut SqliteConnection,
    task_id: i64,
    agent_id: &str,
    update_type: UpdateType,
    content: &str,
    metadata: Option<&serde_json::Value>,
    at: DateTime<Utc>,
) -> Result<i64> {
    let metadata = metadata.map(|m| m.to_string());
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO task_updates (task_id, agent_id, update_type, content, metadata, created_at) \
         VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(task_id)
    .bind(agent_id)
    .bind(update_type.as_str())
    .bind(content)
    .bind(metadata)
    .bind(at)
    .fetch_one(&mut *conn)
    .await
    .map_err(sqlx_error_to_broker_error)?;
    Ok(id)
}

/// Snapshot the content/scheduling fields of `task` as the next version.
pub(crate) async fn snapshot_version(
    conn: &mut SqliteConnection,
    task: &Task,
    created_by: &str,
    at: DateTime<Utc>,
) -> Result<i64> {
    let next: i64 = sqlx::query_scalar(
        "SELECT COALESCE(MAX(version_number), 0) + 1 FROM task_versions WHERE task_id = ?",
    )
    .bind(task.id)
    .fetch_one(&mut *conn)
    .await
    .map_err(sqlx_error_to_broker_error)?;

    sqlx::query(
        "INSERT INTO task_versions (task_id, version_number, title, task_type, task_instruction, \
         verification_instruction, priority, estimated_hours, due_date, notes, created_by, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(task.id)
    .bind(next)
    .bind(&task.title)
    .bind(task.task_type.as_str())
    .bind(&task.task_instruction)
    .bind(&task.verification_instruction)
    .bind(task.priority.as_str())
    .bind(task.estimated_hours)
    .bind(task.due_date)
    .bind(&task.notes)
    .bind(created_by)
    .bind(at)
    .execute(&mut *conn)
    .await
    .map_err(sqlx_error_to_broker_error)?;

    Ok(next)
}

/// Walk subtask parents of the just-completed task and auto-complete every
/// parent whose children are now all complete, recursing upward. Runs inside
/// the completing transaction so the whole chain commits or rolls back
/// together.
pub(crate) async fn propagate_auto_complete(
    conn: &mut SqliteConnection,
    completed_id: i64,
    now: DateTime<Utc>,
) -> Result<()> {
    let mut queue = VecDeque::from([completed_id]);
    let mut visited: HashSet<i64> = HashSet::new();

    while let Some(current) = queue.pop_front() {
        if !visited.insert(current) || visited.len() > MAX_WALK_NODES {
            continue;
        }

        let parents: Vec<i64> = sqlx::query_scalar(
            "SELECT parent_task_id FROM task_relationships \
             WHERE child_task_id = ? AND relationship_type = 'subtask'",
        )
        .bind(current)
        .fetch_all(&mut *conn)
        .await
        .map_err(sqlx_error_to_broker_error)?;

        for parent in parents {
            if visited.contains(&parent) {
                continue;
            }
            let Some(parent_task) = fetch_task(conn, parent).await? else {
                continue;
            };
            if parent_task.task_status.is_terminal() {
                continue;
            }

            let total: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM task_relationships \
                 WHERE parent_task_id = ? AND relationship_type = 'subtask'",
            )
            .bind(parent)
            .fetch_one(&mut *conn)
            .await
            .map_err(sqlx_error_to_broker_error)?;
            // A parent with zero subtasks never auto-completes.
            if total == 0 {
                continue;
            }

            let open: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM task_relationships tr \
                 JOIN tasks t ON t.id = tr.child_task_id \
                 WHERE tr.parent_task_id = ? AND tr.relationship_type = 'subtask' \
                 AND t.task_status <> 'complete'",
            )
            .bind(parent)
            .fetch_one(&mut *conn)
            .await
            .map_err(sqlx_error_to_broker_error)?;
            if open > 0 {
                continue;
            }

            sqlx::query(
                "UPDATE tasks SET task_status = 'complete', completed_at = ?, \
                 assigned_agent = NULL, notes = COALESCE(notes, ?), updated_at = ? WHERE id = ?",
            )
            .bind(now)
            .bind(AUTO_COMPLETE_NOTES)
            .bind(now)
            .bind(parent)
            .execute(&mut *conn)
            .await
            .map_err(sqlx_error_to_broker_error)?;

            record_history(
                conn,
                parent,
                SYSTEM_AGENT,
                change::COMPLETED,
                Some("task_status"),
                Some(parent_task.task_status.as_str()),
                Some(TaskStatus::Complete.as_str()),
                now,
            )
            .await?;

            tracing::info!(task_id = parent, "auto-completed parent task");
            queue.push_back(parent);
        }
    }

    Ok(())
}

/// Verification shared by `complete` (verification path) and `verify`.
async fn verify_in_tx(
    conn: &mut SqliteConnection,
    task: &Task,
    agent_id: &str,
    notes: Option<&str>,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "UPDATE tasks SET verification_status = 'verified', task_status = 'complete', \
         assigned_agent = NULL, updated_at = ? WHERE id = ?",
    )
    .bind(now)
    .bind(task.id)
    .execute(&mut *conn)
    .await
    .map_err(sqlx_error_to_broker_error)?;

    record_history(
        conn,
        task.id,
        agent_id,
        change::VERIFIED,
        Some("verification_status"),
        Some("unverified"),
        Some("verified"),
        now,
    )
    .await?;

    if let Some(notes) = notes {
        insert_update(conn, task.id, agent_id, UpdateType::Note, notes, None, now).await?;
    }
    Ok(())
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn create_task(&self, org_id: i64, task: NewTask, agent_id: &str) -> Result<Task> {
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await.map_err(sqlx_error_to_broker_error)?;

        // The project decides tenancy; it must exist in the caller's scope.
        let project_id = match task.project_id {
            Some(pid) => {
                let exists: bool = sqlx::query_scalar(
                    "SELECT EXISTS(SELECT 1 FROM projects WHERE id = ? AND organization_id = ?)",
                )
                .bind(pid)
                .bind(org_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(sqlx_error_to_broker_error)?;
                if !exists {
                    return Err(BrokerError::project_not_found(pid));
                }
                Some(pid)
            }
            None => None,
        };

        let now = Utc::now();
        let row = sqlx::query(&format!(
            "INSERT INTO tasks (project_id, organization_id, title, task_type, task_instruction, \
             verification_instruction, notes, task_status, verification_status, priority, \
             due_date, estimated_hours, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, 'available', 'unverified', ?, ?, ?, ?, ?) \
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(project_id)
        .bind(org_id)
        .bind(&task.title)
        .bind(task.task_type.as_str())
        .bind(&task.task_instruction)
        .bind(&task.verification_instruction)
        .bind(&task.notes)
        .bind(task.priority.as_str())
        .bind(task.due_date)
        .bind(task.estimated_hours)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(sqlx_error_to_broker_error)?;

        let created = row_to_task(&row)?;
        record_history(
            &mut tx,
            created.id,
            agent_id,
            change::CREATED,
            None,
            None,
            Some(created.task_status.as_str()),
            now,
        )
        .await?;
        snapshot_version(&mut tx, &created, agent_id, now).await?;

        tx.commit().await.map_err(sqlx_error_to_broker_error)?;
        Ok(created)
    }

    async fn get_task(&self, org_id: i64, id: i64) -> Result<Option<Task>> {
        with_read_retry(|| async move {
            let row = sqlx::query(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE id = ? AND organization_id = ?"
            ))
            .bind(id)
            .bind(org_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_error_to_broker_error)?;
            row.as_ref().map(row_to_task).transpose()
        })
        .await
    }

    async fn update_task_fields(
        &self,
        org_id: i64,
        id: i64,
        patch: broker_core::models::TaskPatch,
        agent_id: &str,
    ) -> Result<Task> {
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await.map_err(sqlx_error_to_broker_error)?;
        let Some(before) = fetch_task_scoped(&mut tx, org_id, id).await? else {
            return Err(BrokerError::task_not_found(id));
        };

        if patch.is_empty() {
            return Ok(before);
        }

        let now = Utc::now();
        // (field, old, new) for per-field history records
        let mut changes: Vec<(&'static str, Option<String>, Option<String>)> = Vec::new();
        let mut snapshot = false;
        let mut completing = false;

        let mut qb: sqlx::QueryBuilder<sqlx::Sqlite> = sqlx::QueryBuilder::new("UPDATE tasks SET ");
        let mut has_updates = false;

        if let Some(title) = &patch.title {
            if *title != before.title {
                if has_updates {
                    qb.push(", ");
                }
                has_updates = true;
                qb.push("title = ");
                qb.push_bind(title.clone());
                changes.push(("title", Some(before.title.clone()), Some(title.clone())));
                snapshot = true;
            }
        }
        if let Some(task_type) = patch.task_type {
            if task_type != before.task_type {
                if has_updates {
                    qb.push(", ");
                }
                has_updates = true;
                qb.push("task_type = ");
                qb.push_bind(task_type.as_str());
                changes.push((
                    "task_type",
                    Some(before.task_type.as_str().to_string()),
                    Some(task_type.as_str().to_string()),
                ));
                snapshot = true;
            }
        }
        if let Some(instruction) = &patch.task_instruction {
            if *instruction != before.task_instruction {
                if has_updates {
                    qb.push(", ");
                }
                has_updates = true;
                qb.push("task_instruction = ");
                qb.push_bind(instruction.clone());
                changes.push((
                    "task_instruction",
                    Some(before.task_instruction.clone()),
                    Some(instruction.clone()),
                ));
                snapshot = true;
            }
        }
        if let Some(instruction) = &patch.verification_instruction {
            if *instruction != before.verification_instruction {
                if has_updates {
                    qb.push(", ");
                }
                has_updates = true;
                qb.push("verification_instruction = ");
                qb.push_bind(instruction.clone());
                changes.push((
                    "verification_instruction",
                    Some(before.verification_instruction.clone()),
                    Some(instruction.clone()),
                ));
                snapshot = true;
            }
        }
        if let Some(notes) = &patch.notes {
            if *notes != before.notes {
                if has_updates {
                    qb.push(", ");
                }
                has_updates = true;
                qb.push("notes = ");
                qb.push_bind(notes.clone());
                changes.push(("notes", before.notes.clone(), notes.clone()));
                snapshot = true;
            }
        }
        if let Some(priority) = patch.priority {
            if priority != before.priority {
                if has_updates {
                    qb.push(", ");
                }
                has_updates = true;
                qb.push("priority = ");
                qb.push_bind(priority.as_str());
                changes.push((
                    "priority",
                    Some(before.priority.as_str().to_string()),
                    Some(priority.as_str().to_string()),
                ));
                snapshot = true;
            }
        }
        if let Some(due_date) = patch.due_date {
            if due_date != before.due_date {
                if has_updates {
                    qb.push(", ");
                }
                has_updates = true;
                qb.push("due_date = ");
                qb.push_bind(due_date);
                changes.push((
                    "due_date",
                    before.due_date.map(|d| d.to_rfc3339()),
                    due_date.map(|d| d.to_rfc3339()),
                ));
                snapshot = true;
            }
        }
        if let Some(estimated) = patch.estimated_hours {
            if estimated != before.estimated_hours {
                if has_updates {
                    qb.push(", ");
                }
                has_updates = true;
                qb.push("estimated_hours = ");
                qb.push_bind(estimated);
                changes.push((
                    "estimated_hours",
                    before.estimated_hours.map(|h| h.to_string()),
                    estimated.map(|h| h.to_string()),
                ));
                snapshot = true;
            }
        }
        if let Some(actual) = patch.actual_hours {
            if actual != before.actual_hours {
                if has_updates {
                    qb.push(", ");
                }
                has_updates = true;
                qb.push("actual_hours = ");
                qb.push_bind(actual);
                changes.push((
                    "actual_hours",
                    before.actual_hours.map(|h| h.to_string()),
                    actual.map(|h| h.to_string()),
                ));
            }
        }
        if let Some(status) = patch.task_status {
            if status != before.task_status {
                if status == TaskStatus::InProgress {
                    return Err(BrokerError::Validation(
                        "in_progress is entered by reserving the task, not by a field write"
                            .to_string(),
                    ));
                }
                state::validate_transition(before.task_status, status)?;
                if has_updates {
                    qb.push(", ");
                }
                has_updates = true;
                qb.push("task_status = ");
                qb.push_bind(status.as_str());
                // A lease cannot survive a direct status write (holder
                // non-null only while in_progress).
                if before.task_status == TaskStatus::InProgress {
                    qb.push(", assigned_agent = NULL");
                }
                if status == TaskStatus::Complete {
                    qb.push(", completed_at = ");
                    qb.push_bind(now);
                    completing = true;
                }
                changes.push((
                    "task_status",
                    Some(before.task_status.as_str().to_string()),
                    Some(status.as_str().to_string()),
                ));
            }
        }
        if let Some(verification) = patch.verification_status {
            if verification != before.verification_status {
                let will_have_completed = before.completed_at.is_some() || completing;
                if verification == broker_core::models::VerificationStatus::Verified
                    && !will_have_completed
                {
                    return Err(BrokerError::Validation(
                        "verification requires a completed task".to_string(),
                    ));
                }
                if has_updates {
                    qb.push(", ");
                }
                has_updates = true;
                qb.push("verification_status = ");
                qb.push_bind(verification.as_str());
                changes.push((
                    "verification_status",
                    Some(before.verification_status.as_str().to_string()),
                    Some(verification.as_str().to_string()),
                ));
            }
        }

        if !has_updates {
            // Everything in the patch matched the current row.
            return Ok(before);
        }

        qb.push(", updated_at = ");
        qb.push_bind(now);
        qb.push(" WHERE id = ");
        qb.push_bind(id);
        qb.build()
            .execute(&mut *tx)
            .await
            .map_err(sqlx_error_to_broker_error)?;

        for (field, old, new) in &changes {
            let change_type = if *field == "task_status" {
                change::STATUS_CHANGED
            } else {
                change::FIELD_UPDATED
            };
            record_history(
                &mut tx,
                id,
                agent_id,
                change_type,
                Some(*field),
                old.as_deref(),
                new.as_deref(),
                now,
            )
            .await?;
        }

        let after = fetch_task_scoped(&mut tx, org_id, id)
            .await?
            .ok_or_else(|| BrokerError::Internal(format!("task {id} vanished mid-update")))?;

        if snapshot {
            snapshot_version(&mut tx, &after, agent_id, now).await?;
        }
        if completing {
            propagate_auto_complete(&mut tx, id, now).await?;
        }

        tx.commit().await.map_err(sqlx_error_to_broker_error)?;
        Ok(after)
    }

    async fn query_tasks(&self, org_id: i64, filter: TaskFilter) -> Result<Vec<Task>> {
        with_read_retry(|| {
            let filter = filter.clone();
            async move {
                let mut qb = build_task_query(org_id, &filter, TASK_COLUMNS);
                push_task_order(&mut qb, filter.order_by);
                if let Some(limit) = filter.limit {
                    qb.push(" LIMIT ");
                    qb.push_bind(limit as i64);
                }
                if let Some(offset) = filter.offset {
                    qb.push(" OFFSET ");
                    qb.push_bind(offset as i64);
                }
                let rows = qb
                    .build()
                    .fetch_all(&self.pool)
                    .await
                    .map_err(sqlx_error_to_broker_error)?;
                rows.iter().map(row_to_task).collect()
            }
        })
        .await
    }

    async fn search_tasks(&self, org_id: i64, query: &str, limit: u32) -> Result<Vec<Task>> {
        let tokens: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .map(str::to_string)
            .collect();

        // An empty query degrades to a plain scoped listing.
        if tokens.is_empty() {
            let rows = sqlx::query(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE organization_id = ? \
                 ORDER BY updated_at DESC LIMIT ?"
            ))
            .bind(org_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_error_to_broker_error)?;
            return rows.iter().map(row_to_task).collect();
        }

        let mut qb: sqlx::QueryBuilder<sqlx::Sqlite> = sqlx::QueryBuilder::new(format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE organization_id = "
        ));
        qb.push_bind(org_id);
        qb.push(" AND (");
        for (i, token) in tokens.iter().enumerate() {
            if i > 0 {
                qb.push(" OR ");
            }
            let pattern = format!("%{token}%");
            qb.push("(lower(title) LIKE ");
            qb.push_bind(pattern.clone());
            qb.push(" OR lower(task_instruction) LIKE ");
            qb.push_bind(pattern.clone());
            qb.push(" OR lower(verification_instruction) LIKE ");
            qb.push_bind(pattern.clone());
            qb.push(" OR lower(COALESCE(notes, '')) LIKE ");
            qb.push_bind(pattern);
            qb.push(")");
        }
        qb.push(")");

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_error_to_broker_error)?;
        let mut tasks: Vec<Task> = rows.iter().map(row_to_task).collect::<Result<_>>()?;

        // Rank by number of distinct tokens hit, then recency.
        let rank = |task: &Task| -> usize {
            let haystack = format!(
                "{} {} {} {}",
                task.title.to_lowercase(),
                task.task_instruction.to_lowercase(),
                task.verification_instruction.to_lowercase(),
                task.notes.as_deref().unwrap_or("").to_lowercase()
            );
            tokens.iter().filter(|t| haystack.contains(t.as_str())).count()
        };
        tasks.sort_by(|a, b| {
            rank(b)
                .cmp(&rank(a))
                .then_with(|| b.updated_at.cmp(&a.updated_at))
        });
        tasks.truncate(limit as usize);
        Ok(tasks)
    }

    async fn task_statistics(&self, org_id: i64, filter: TaskFilter) -> Result<TaskStatistics> {
        let mut stats = TaskStatistics::default();

        let total: i64 = build_task_query(org_id, &filter, "COUNT(*) AS n")
            .build()
            .fetch_one(&self.pool)
            .await
            .map_err(sqlx_error_to_broker_error)?
            .get("n");
        stats.total = total as u64;

        for (column, target) in [
            ("task_status", &mut stats.by_status),
            ("task_type", &mut stats.by_type),
            ("priority", &mut stats.by_priority),
        ] {
            let mut qb = build_task_query(
                org_id,
                &filter,
                &format!("{column} AS k, COUNT(*) AS n"),
            );
            qb.push(format!(" GROUP BY {column}"));
            let rows = qb
                .build()
                .fetch_all(&self.pool)
                .await
                .map_err(sqlx_error_to_broker_error)?;
            for row in rows {
                let key: String = row.get("k");
                let n: i64 = row.get("n");
                target.insert(key, n as u64);
            }
        }

        let now = Utc::now();
        let mut qb = build_task_query(org_id, &filter, "COUNT(*) AS n");
        qb.push(" AND due_date IS NOT NULL AND due_date < ");
        qb.push_bind(now);
        qb.push(" AND task_status NOT IN ('complete', 'cancelled')");
        let overdue: i64 = qb
            .build()
            .fetch_one(&self.pool)
            .await
            .map_err(sqlx_error_to_broker_error)?
            .get("n");
        stats.overdue = overdue as u64;

        let mut qb = build_task_query(org_id, &filter, "AVG(actual_hours) AS avg_hours");
        qb.push(" AND actual_hours IS NOT NULL");
        let avg: Option<f64> = qb
            .build()
            .fetch_one(&self.pool)
            .await
            .map_err(sqlx_error_to_broker_error)?
            .get("avg_hours");
        stats.avg_actual_hours = avg;

        Ok(stats)
    }

    async fn task_summaries(&self, org_id: i64, filter: TaskFilter) -> Result<Vec<TaskSummary>> {
        with_read_retry(|| {
            let filter = filter.clone();
            async move {
                let mut qb = build_task_query(
                    org_id,
                    &filter,
                    "id, project_id, title, task_type, task_status, verification_status, \
                     priority, assigned_agent, due_date, updated_at",
                );
                push_task_order(&mut qb, filter.order_by);
                if let Some(limit) = filter.limit {
                    qb.push(" LIMIT ");
                    qb.push_bind(limit as i64);
                }
                let rows = qb
                    .build()
                    .fetch_all(&self.pool)
                    .await
                    .map_err(sqlx_error_to_broker_error)?;
                rows.iter().map(crate::common::row_to_summary).collect()
            }
        })
        .await
    }

    async fn available_for_agent(
        &self,
        org_id: i64,
        agent_type: AgentType,
        project_id: Option<i64>,
        limit: u32,
    ) -> Result<Vec<Task>> {
        let mut qb: sqlx::QueryBuilder<sqlx::Sqlite> = sqlx::QueryBuilder::new(format!(
            "SELECT {TASK_COLUMNS}, \
             CASE WHEN task_status = 'complete' AND verification_status = 'unverified' \
             THEN 0 ELSE 1 END AS bucket \
             FROM tasks WHERE organization_id = "
        ));
        qb.push_bind(org_id);
        qb.push(" AND assigned_agent IS NULL");
        match agent_type {
            AgentType::Implementation => {
                qb.push(
                    " AND task_type = 'concrete' AND (task_status = 'available' \
                     OR (task_status = 'complete' AND verification_status = 'unverified'))",
                );
            }
            AgentType::Breakdown => {
                // Needs-verification items are never offered for breakdown.
                qb.push(" AND task_type IN ('abstract', 'epic') AND task_status = 'available'");
            }
        }
        if let Some(pid) = project_id {
            qb.push(" AND project_id = ");
            qb.push_bind(pid);
        }
        qb.push(format!(
            " ORDER BY bucket ASC, {PRIORITY_RANK_SQL} DESC, updated_at DESC LIMIT "
        ));
        // Overfetch: derived-blocked filtering below may drop candidates.
        qb.push_bind((limit as i64).saturating_mul(2));

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_error_to_broker_error)?;
        let candidates: Vec<Task> = rows.iter().map(row_to_task).collect::<Result<_>>()?;

        let mut tasks = Vec::with_capacity(limit as usize);
        for task in candidates {
            if task.task_status == TaskStatus::Available
                && self.has_blocked_descendant(task.id).await?
            {
                continue;
            }
            tasks.push(task);
            if tasks.len() == limit as usize {
                break;
            }
        }
        Ok(tasks)
    }

    async fn recent_completions(
        &self,
        org_id: i64,
        since: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE organization_id = ? \
             AND task_status = 'complete' AND completed_at >= ? \
             ORDER BY completed_at DESC LIMIT ?"
        ))
        .bind(org_id)
        .bind(since)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(sqlx_error_to_broker_error)?;
        rows.iter().map(row_to_task).collect()
    }

    async fn approaching_deadline(
        &self,
        org_id: i64,
        within_hours: i64,
        limit: u32,
    ) -> Result<Vec<Task>> {
        let now = Utc::now();
        let horizon = now + Duration::hours(within_hours);
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE organization_id = ? \
             AND due_date IS NOT NULL AND due_date >= ? AND due_date <= ? \
             AND task_status NOT IN ('complete', 'cancelled') \
             ORDER BY due_date ASC LIMIT ?"
        ))
        .bind(org_id)
        .bind(now)
        .bind(horizon)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(sqlx_error_to_broker_error)?;
        rows.iter().map(row_to_task).collect()
    }

    async fn overdue_tasks(&self, org_id: i64, limit: u32) -> Result<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE organization_id = ? \
             AND due_date IS NOT NULL AND due_date < ? \
             AND task_status NOT IN ('complete', 'cancelled') \
             ORDER BY due_date ASC LIMIT ?"
        ))
        .bind(org_id)
        .bind(Utc::now())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(sqlx_error_to_broker_error)?;
        rows.iter().map(row_to_task).collect()
    }

    async fn stale_tasks(&self, org_id: i64, threshold_hours: i64) -> Result<Vec<Task>> {
        let cutoff = Utc::now() - Duration::hours(threshold_hours);
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE organization_id = ? \
             AND task_status = 'in_progress' AND updated_at < ? \
             ORDER BY updated_at ASC"
        ))
        .bind(org_id)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(sqlx_error_to_broker_error)?;
        rows.iter().map(row_to_task).collect()
    }

    async fn agent_performance(
        &self,
        org_id: i64,
        agent_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<AgentPerformance> {
        let completed: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM change_history ch JOIN tasks t ON t.id = ch.task_id \
             WHERE t.organization_id = ? AND ch.agent_id = ? AND ch.change_type = 'completed' \
             AND (? IS NULL OR ch.created_at >= ?)",
        )
        .bind(org_id)
        .bind(agent_id)
        .bind(since)
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(sqlx_error_to_broker_error)?;

        let verified: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM change_history ch JOIN tasks t ON t.id = ch.task_id \
             WHERE t.organization_id = ? AND ch.agent_id = ? AND ch.change_type = 'verified' \
             AND (? IS NULL OR ch.created_at >= ?)",
        )
        .bind(org_id)
        .bind(agent_id)
        .bind(since)
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(sqlx_error_to_broker_error)?;

        let avg_actual_hours: Option<f64> = sqlx::query_scalar(
            "SELECT AVG(t.actual_hours) FROM change_history ch JOIN tasks t ON t.id = ch.task_id \
             WHERE t.organization_id = ? AND ch.agent_id = ? AND ch.change_type = 'completed' \
             AND t.actual_hours IS NOT NULL AND (? IS NULL OR ch.created_at >= ?)",
        )
        .bind(org_id)
        .bind(agent_id)
        .bind(since)
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(sqlx_error_to_broker_error)?;

        Ok(AgentPerformance {
            agent_id: agent_id.to_string(),
            completed: completed as u64,
            verified: verified as u64,
            avg_actual_hours,
        })
    }

    async fn reserve(&self, org_id: i64, id: i64, agent_id: &str) -> Result<Task> {
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await.map_err(sqlx_error_to_broker_error)?;
        let Some(before) = fetch_task_scoped(&mut tx, org_id, id).await? else {
            return Err(BrokerError::task_not_found(id));
        };
        let kind = state::reserve_kind(&before)?;

        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE tasks SET assigned_agent = ?, task_status = 'in_progress', \
             started_at = COALESCE(started_at, ?), updated_at = ? \
             WHERE id = ? AND assigned_agent IS NULL \
             AND (task_status = 'available' \
                  OR (task_status = 'complete' AND verification_status = 'unverified'))",
        )
        .bind(agent_id)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(sqlx_error_to_broker_error)?;

        if result.rows_affected() == 0 {
            // Lost the race; report what the winner left behind.
            let observed = fetch_task_scoped(&mut tx, org_id, id)
                .await?
                .ok_or_else(|| BrokerError::task_not_found(id))?;
            return Err(BrokerError::NotReservable {
                task_id: id,
                status: observed.task_status,
                holder: observed.assigned_agent,
            });
        }

        let label = match kind {
            LeaseKind::Work => change::LOCKED,
            LeaseKind::Verification => change::LOCKED_FOR_VERIFICATION,
        };
        record_history(&mut tx, id, agent_id, label, None, None, Some(agent_id), now).await?;

        let task = fetch_task_scoped(&mut tx, org_id, id)
            .await?
            .ok_or_else(|| BrokerError::Internal(format!("task {id} vanished mid-reserve")))?;
        tx.commit().await.map_err(sqlx_error_to_broker_error)?;
        Ok(task)
    }

    async fn unlock(&self, org_id: i64, id: i64, agent_id: &str) -> Result<Task> {
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await.map_err(sqlx_error_to_broker_error)?;
        let Some(before) = fetch_task_scoped(&mut tx, org_id, id).await? else {
            return Err(BrokerError::task_not_found(id));
        };
        if before.task_status != TaskStatus::InProgress {
            return Err(BrokerError::NotAssigned {
                task_id: id,
                holder: before.assigned_agent,
            });
        }
        state::require_owner(&before, agent_id)?;

        let target = state::release_target(&before);
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE tasks SET assigned_agent = NULL, task_status = ?, updated_at = ? \
             WHERE id = ? AND assigned_agent = ? AND task_status = 'in_progress'",
        )
        .bind(target.as_str())
        .bind(now)
        .bind(id)
        .bind(agent_id)
        .execute(&mut *tx)
        .await
        .map_err(sqlx_error_to_broker_error)?;

        if result.rows_affected() == 0 {
            let observed = fetch_task_scoped(&mut tx, org_id, id)
                .await?
                .ok_or_else(|| BrokerError::task_not_found(id))?;
            return Err(BrokerError::NotAssigned {
                task_id: id,
                holder: observed.assigned_agent,
            });
        }

        record_history(
            &mut tx,
            id,
            agent_id,
            change::UNLOCKED,
            None,
            Some(agent_id),
            Some(target.as_str()),
            now,
        )
        .await?;

        let task = fetch_task_scoped(&mut tx, org_id, id)
            .await?
            .ok_or_else(|| BrokerError::Internal(format!("task {id} vanished mid-unlock")))?;
        tx.commit().await.map_err(sqlx_error_to_broker_error)?;
        Ok(task)
    }

    async fn complete(
        &self,
        org_id: i64,
        id: i64,
        agent_id: &str,
        notes: Option<String>,
        actual_hours: Option<f64>,
    ) -> Result<CompletionOutcome> {
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await.map_err(sqlx_error_to_broker_error)?;
        let Some(before) = fetch_task_scoped(&mut tx, org_id, id).await? else {
            return Err(BrokerError::task_not_found(id));
        };
        let now = Utc::now();

        // A task completed earlier and still unverified is a verification:
        // completing it again (with or without a verification lease)
        // verifies. An already-verified task refuses idempotently.
        if before.completed_at.is_some() {
            if before.verification_status == broker_core::models::VerificationStatus::Verified {
                return Err(BrokerError::AlreadyVerified(id));
            }
            if before.task_status == TaskStatus::InProgress {
                state::require_owner(&before, agent_id)?;
            }
            verify_in_tx(&mut tx, &before, agent_id, notes.as_deref(), now).await?;
            propagate_auto_complete(&mut tx, id, now).await?;
            let task = fetch_task_scoped(&mut tx, org_id, id)
                .await?
                .ok_or_else(|| BrokerError::Internal(format!("task {id} vanished mid-verify")))?;
            tx.commit().await.map_err(sqlx_error_to_broker_error)?;
            return Ok(CompletionOutcome::Verified(task));
        }

        if before.task_status != TaskStatus::InProgress {
            return Err(BrokerError::NotAssigned {
                task_id: id,
                holder: before.assigned_agent,
            });
        }
        state::require_owner(&before, agent_id)?;

        let actual = actual_hours.or_else(|| {
            before
                .started_at
                .map(|started| (now - started).num_seconds() as f64 / 3600.0)
        });

        let result = sqlx::query(
            "UPDATE tasks SET task_status = 'complete', verification_status = 'unverified', \
             completed_at = ?, assigned_agent = NULL, actual_hours = COALESCE(?, actual_hours), \
             notes = COALESCE(?, notes), updated_at = ? \
             WHERE id = ? AND assigned_agent = ? AND task_status = 'in_progress'",
        )
        .bind(now)
        .bind(actual)
        .bind(&notes)
        .bind(now)
        .bind(id)
        .bind(agent_id)
        .execute(&mut *tx)
        .await
        .map_err(sqlx_error_to_broker_error)?;

        if result.rows_affected() == 0 {
            let observed = fetch_task_scoped(&mut tx, org_id, id)
                .await?
                .ok_or_else(|| BrokerError::task_not_found(id))?;
            return Err(BrokerError::NotAssigned {
                task_id: id,
                holder: observed.assigned_agent,
            });
        }

        record_history(
            &mut tx,
            id,
            agent_id,
            change::COMPLETED,
            Some("task_status"),
            Some(before.task_status.as_str()),
            Some(TaskStatus::Complete.as_str()),
            now,
        )
        .await?;
        propagate_auto_complete(&mut tx, id, now).await?;

        let task = fetch_task_scoped(&mut tx, org_id, id)
            .await?
            .ok_or_else(|| BrokerError::Internal(format!("task {id} vanished mid-complete")))?;
        tx.commit().await.map_err(sqlx_error_to_broker_error)?;
        Ok(CompletionOutcome::Completed(task))
    }

    async fn verify(
        &self,
        org_id: i64,
        id: i64,
        agent_id: &str,
        notes: Option<String>,
    ) -> Result<Task> {
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await.map_err(sqlx_error_to_broker_error)?;
        let Some(before) = fetch_task_scoped(&mut tx, org_id, id).await? else {
            return Err(BrokerError::task_not_found(id));
        };
        if before.verification_status == broker_core::models::VerificationStatus::Verified {
            return Err(BrokerError::AlreadyVerified(id));
        }
        if before.task_status != TaskStatus::Complete {
            return Err(BrokerError::InvalidTransition(
                before.task_status,
                TaskStatus::Complete,
            ));
        }

        let now = Utc::now();
        verify_in_tx(&mut tx, &before, agent_id, notes.as_deref(), now).await?;

        let task = fetch_task_scoped(&mut tx, org_id, id)
            .await?
            .ok_or_else(|| BrokerError::Internal(format!("task {id} vanished mid-verify")))?;
        tx.commit().await.map_err(sqlx_error_to_broker_error)?;
        Ok(task)
    }

    async fn bulk_unlock(
        &self,
        org_id: i64,
        ids: &[i64],
        agent_id: &str,
        strict: bool,
    ) -> Result<BulkUnlockReport> {
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await.map_err(sqlx_error_to_broker_error)?;
        let now = Utc::now();
        let mut report = BulkUnlockReport::default();

        for &id in ids {
            let outcome: std::result::Result<(), String> =
                match fetch_task_scoped(&mut tx, org_id, id).await? {
                    None => Err(format!("Task {id} not found")),
                    Some(task) if task.task_status != TaskStatus::InProgress => {
                        Err(format!("Task {id} is not in_progress"))
                    }
                    Some(task) if task.assigned_agent.as_deref() != Some(agent_id) => Err(format!(
                        "Task {id} is assigned to '{}'",
                        task.assigned_agent.as_deref().unwrap_or("none")
                    )),
                    Some(task) => {
                        let target = state::release_target(&task);
                        sqlx::query(
                            "UPDATE tasks SET assigned_agent = NULL, task_status = ?, \
                             updated_at = ? WHERE id = ? AND assigned_agent = ? \
                             AND task_status = 'in_progress'",
                        )
                        .bind(target.as_str())
                        .bind(now)
                        .bind(id)
                        .bind(agent_id)
                        .execute(&mut *tx)
                        .await
                        .map_err(sqlx_error_to_broker_error)?;
                        record_history(
                            &mut tx,
                            id,
                            agent_id,
                            change::UNLOCKED,
                            None,
                            Some(agent_id),
                            Some(target.as_str()),
                            now,
                        )
                        .await?;
                        Ok(())
                    }
                };
            match outcome {
                Ok(()) => report.unlocked.push(id),
                Err(error) => report.failed.push(BulkUnlockFailure { task_id: id, error }),
            }
        }

        if strict && !report.failed.is_empty() {
            tx.rollback().await.map_err(sqlx_error_to_broker_error)?;
            report.unlocked.clear();
        } else {
            tx.commit().await.map_err(sqlx_error_to_broker_error)?;
        }
        Ok(report)
    }

    async fn reclaim_stale(&self, threshold_hours: i64, limit: u32) -> Result<Vec<ReclaimedLease>> {
        let cutoff = Utc::now() - Duration::hours(threshold_hours);
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM tasks WHERE task_status = 'in_progress' AND updated_at < ? \
             ORDER BY updated_at ASC LIMIT ?",
        )
        .bind(cutoff)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(sqlx_error_to_broker_error)?;

        let mut reclaimed = Vec::new();
        for id in ids {
            // One transaction per task: a crash mid-sweep leaves completed
            // releases committed and the rest for the next tick.
            let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await.map_err(sqlx_error_to_broker_error)?;
            let Some(task) = fetch_task(&mut tx, id).await? else {
                continue;
            };
            if task.task_status != TaskStatus::InProgress || task.updated_at >= cutoff {
                continue;
            }
            let Some(previous_agent) = task.assigned_agent.clone() else {
                continue;
            };

            let target = state::release_target(&task);
            let now = Utc::now();
            let result = sqlx::query(
                "UPDATE tasks SET assigned_agent = NULL, task_status = ?, updated_at = ? \
                 WHERE id = ? AND assigned_agent = ? AND task_status = 'in_progress'",
            )
            .bind(target.as_str())
            .bind(now)
            .bind(id)
            .bind(&previous_agent)
            .execute(&mut *tx)
            .await
            .map_err(sqlx_error_to_broker_error)?;
            if result.rows_affected() == 0 {
                // The holder acted between the scan and the release.
                continue;
            }

            let content = format!(
                "Task {id} unlocked due to timeout. Previously assigned to agent \
                 '{previous_agent}'."
            );
            let metadata =
                serde_json::json!({"stale": true, "previous_agent": previous_agent.clone()});
            insert_update(
                &mut tx,
                id,
                SYSTEM_AGENT,
                UpdateType::Finding,
                &content,
                Some(&metadata),
                now,
            )
            .await?;
            record_history(
                &mut tx,
                id,
                SYSTEM_AGENT,
                change::UNLOCKED_STALE,
                Some("assigned_agent"),
                Some(&previous_agent),
                None,
                now,
            )
            .await?;

            tx.commit().await.map_err(sqlx_error_to_broker_error)?;
            tracing::info!(task_id = id, %previous_agent, "reclaimed stale lease");
            reclaimed.push(ReclaimedLease {
                task_id: id,
                previous_agent,
                idle_since: task.updated_at,
            });
        }
        Ok(reclaimed)
    }

    async fn has_blocked_descendant(&self, id: i64) -> Result<bool> {
        let mut visited: HashSet<i64> = HashSet::from([id]);
        let mut queue = VecDeque::from([id]);

        while let Some(current) = queue.pop_front() {
            let children: Vec<(i64, String)> = sqlx::query_as(
                "SELECT t.id, t.task_status FROM task_relationships tr \
                 JOIN tasks t ON t.id = tr.child_task_id \
                 WHERE tr.parent_task_id = ? AND tr.relationship_type = 'subtask'",
            )
            .bind(current)
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_error_to_broker_error)?;

            for (child_id, status) in children {
                if status == "blocked" {
                    return Ok(true);
                }
                if visited.insert(child_id) && visited.len() <= MAX_WALK_NODES {
                    queue.push_back(child_id);
                }
            }
        }
        Ok(false)
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(sqlx_error_to_broker_error)?;
        Ok(())
    }
}
