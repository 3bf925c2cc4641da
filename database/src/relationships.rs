//! Relationship edges and the graph algorithms that depend on them.
//!
//! The blocking sub-graph (`blocking` + `blocked_by`) must stay acyclic;
//! every insertion normalizes the candidate to "X is blocked by Y" and runs
//! a bounded BFS from Y over blocker edges before touching the table.

use crate::common::{
    row_to_relationship, row_to_task, sqlx_error_to_broker_error, TASK_COLUMNS,
};
use crate::sqlite::{fetch_task_scoped, record_history, SqliteStore, MAX_WALK_NODES};
use async_trait::async_trait;
use broker_core::{
    error::{BrokerError, Result},
    models::{RelatedTask, RelationshipType, Task, TaskStatus},
    state::change,
    store::RelationshipStore,
};
use chrono::Utc;
use sqlx::{Row, SqliteConnection};
use std::collections::{HashSet, VecDeque};

/// Blockers of `task_id`: tasks Z such that "task_id is blocked by Z",
/// inferred from `blocked_by` outbound and `blocking` inbound edges. The
/// excluded pair is the candidate edge under validation.
async fn blockers_of(
    conn: &mut SqliteConnection,
    task_id: i64,
    exclude: (i64, i64),
) -> Result<Vec<i64>> {
    let rows = sqlx::query_scalar(
        "SELECT child_task_id FROM task_relationships \
         WHERE parent_task_id = ? AND relationship_type = 'blocked_by' \
         AND NOT (parent_task_id = ? AND child_task_id = ?) \
         UNION \
         SELECT parent_task_id FROM task_relationships \
         WHERE child_task_id = ? AND relationship_type = 'blocking' \
         AND NOT (parent_task_id = ? AND child_task_id = ?)",
    )
    .bind(task_id)
    .bind(exclude.0)
    .bind(exclude.1)
    .bind(task_id)
    .bind(exclude.0)
    .bind(exclude.1)
    .fetch_all(&mut *conn)
    .await
    .map_err(sqlx_error_to_broker_error)?;
    Ok(rows)
}

/// Would adding "blocked is blocked by blocker" close a cycle? BFS from the
/// blocker across blocker edges; reaching `blocked` means `blocked` already
/// (transitively) blocks the blocker.
async fn would_cycle(
    conn: &mut SqliteConnection,
    blocker: i64,
    blocked: i64,
    exclude: (i64, i64),
) -> Result<bool> {
    let mut visited: HashSet<i64> = HashSet::new();
    let mut queue = VecDeque::from([blocker]);

    while let Some(current) = queue.pop_front() {
        if current == blocked {
            return Ok(true);
        }
        if !visited.insert(current) || visited.len() > MAX_WALK_NODES {
            continue;
        }
        for next in blockers_of(conn, current, exclude).await? {
            if !visited.contains(&next) {
                queue.push_back(next);
            }
        }
    }
    Ok(false)
}

#[async_trait]
impl RelationshipStore for SqliteStore {
    async fn create_relationship(
        &self,
        org_id: i64,
        parent_task_id: i64,
        child_task_id: i64,
        relationship_type: RelationshipType,
        agent_id: &str,
    ) -> Result<i64> {
        if parent_task_id == child_task_id {
            return Err(BrokerError::Validation(
                "A task cannot be related to itself".to_string(),
            ));
        }

        let mut tx = self.pool().begin_with("BEGIN IMMEDIATE").await.map_err(sqlx_error_to_broker_error)?;

        // Both endpoints must exist in the caller's scope.
        let Some(parent) = fetch_task_scoped(&mut tx, org_id, parent_task_id).await? else {
            return Err(BrokerError::task_not_found(parent_task_id));
        };
        if fetch_task_scoped(&mut tx, org_id, child_task_id).await?.is_none() {
            return Err(BrokerError::task_not_found(child_task_id));
        }

        if relationship_type.is_blocking() {
            // Normalize to "blocked is blocked by blocker".
            let (blocked, blocker) = match relationship_type {
                RelationshipType::BlockedBy => (parent_task_id, child_task_id),
                _ => (child_task_id, parent_task_id),
            };

            // The inverse edge with the same endpoints is an immediate cycle,
            // in either stored orientation.
            let inverse: Option<i64> = sqlx::query_scalar(
                "SELECT id FROM task_relationships WHERE \
                 (parent_task_id = ? AND child_task_id = ? AND relationship_type = ?) \
                 OR (parent_task_id = ? AND child_task_id = ? AND relationship_type = ?) \
                 LIMIT 1",
            )
            .bind(parent_task_id)
            .bind(child_task_id)
            .bind(inverse_type(relationship_type).as_str())
            .bind(child_task_id)
            .bind(parent_task_id)
            .bind(relationship_type.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(sqlx_error_to_broker_error)?;
            if inverse.is_some() {
                return Err(BrokerError::CircularDependency(format!(
                    "task {blocker} and task {blocked} already block each other"
                )));
            }

            if would_cycle(&mut tx, blocker, blocked, (parent_task_id, child_task_id)).await? {
                return Err(BrokerError::CircularDependency(format!(
                    "task {blocked} (or something blocking it) already blocks task {blocker}"
                )));
            }
        }

        // Idempotent per (parent, child, type): re-adding returns the
        // existing id without another history record.
        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM task_relationships \
             WHERE parent_task_id = ? AND child_task_id = ? AND relationship_type = ?",
        )
        .bind(parent_task_id)
        .bind(child_task_id)
        .bind(relationship_type.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(sqlx_error_to_broker_error)?;
        if let Some(id) = existing {
            tx.commit().await.map_err(sqlx_error_to_broker_error)?;
            tracing::debug!(
                relationship_id = id,
                "relationship already exists, returning existing id"
            );
            return Ok(id);
        }

        let now = Utc::now();
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO task_relationships (parent_task_id, child_task_id, relationship_type, created_at) \
             VALUES (?, ?, ?, ?) RETURNING id",
        )
        .bind(parent_task_id)
        .bind(child_task_id)
        .bind(relationship_type.as_str())
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(sqlx_error_to_broker_error)?;

        record_history(
            &mut tx,
            parent_task_id,
            agent_id,
            change::RELATIONSHIP_ADDED,
            Some("relationship"),
            None,
            Some(&format!("{relationship_type}:{child_task_id}")),
            now,
        )
        .await?;

        // A new blocked_by edge persists blocked on the blocked task, but
        // never overrides a lease or a terminal state.
        if relationship_type == RelationshipType::BlockedBy
            && parent.task_status == TaskStatus::Available
        {
            sqlx::query(
                "UPDATE tasks SET task_status = 'blocked', updated_at = ? \
                 WHERE id = ? AND task_status = 'available'",
            )
            .bind(now)
            .bind(parent_task_id)
            .execute(&mut *tx)
            .await
            .map_err(sqlx_error_to_broker_error)?;
        }

        tx.commit().await.map_err(sqlx_error_to_broker_error)?;
        tracing::info!(
            relationship_id = id,
            parent = parent_task_id,
            child = child_task_id,
            relationship_type = %relationship_type,
            "created relationship"
        );
        Ok(id)
    }

    async fn delete_relationship(
        &self,
        org_id: i64,
        parent_task_id: i64,
        child_task_id: i64,
        relationship_type: RelationshipType,
        agent_id: &str,
    ) -> Result<bool> {
        let mut tx = self.pool().begin_with("BEGIN IMMEDIATE").await.map_err(sqlx_error_to_broker_error)?;
        if fetch_task_scoped(&mut tx, org_id, parent_task_id).await?.is_none() {
            return Err(BrokerError::task_not_found(parent_task_id));
        }

        let result = sqlx::query(
            "DELETE FROM task_relationships \
             WHERE parent_task_id = ? AND child_task_id = ? AND relationship_type = ?",
        )
        .bind(parent_task_id)
        .bind(child_task_id)
        .bind(relationship_type.as_str())
        .execute(&mut *tx)
        .await
        .map_err(sqlx_error_to_broker_error)?;

        let removed = result.rows_affected() > 0;
        if removed {
            record_history(
                &mut tx,
                parent_task_id,
                agent_id,
                change::RELATIONSHIP_REMOVED,
                Some("relationship"),
                Some(&format!("{relationship_type}:{child_task_id}")),
                None,
                Utc::now(),
            )
            .await?;
        }

        tx.commit().await.map_err(sqlx_error_to_broker_error)?;
        Ok(removed)
    }

    async fn related_tasks(
        &self,
        org_id: i64,
        task_id: i64,
        relationship_type: Option<RelationshipType>,
    ) -> Result<Vec<RelatedTask>> {
        let mut qb: sqlx::QueryBuilder<sqlx::Sqlite> = sqlx::QueryBuilder::new(
            "SELECT tr.id, tr.parent_task_id, tr.child_task_id, tr.relationship_type, \
             tr.created_at, t1.title AS parent_title, t2.title AS child_title \
             FROM task_relationships tr \
             JOIN tasks t1 ON tr.parent_task_id = t1.id \
             JOIN tasks t2 ON tr.child_task_id = t2.id \
             WHERE t1.organization_id = ",
        );
        qb.push_bind(org_id);
        qb.push(" AND (tr.parent_task_id = ");
        qb.push_bind(task_id);
        qb.push(" OR tr.child_task_id = ");
        qb.push_bind(task_id);
        qb.push(")");
        if let Some(rel_type) = relationship_type {
            qb.push(" AND tr.relationship_type = ");
            qb.push_bind(rel_type.as_str());
        }
        qb.push(" ORDER BY tr.created_at ASC");

        let rows = qb
            .build()
            .fetch_all(self.pool())
            .await
            .map_err(sqlx_error_to_broker_error)?;

        rows.iter()
            .map(|row| {
                Ok(RelatedTask {
                    relationship: row_to_relationship(row)?,
                    parent_title: row.get("parent_title"),
                    child_title: row.get("child_title"),
                })
            })
            .collect()
    }

    async fn ancestry(&self, org_id: i64, task_id: i64) -> Result<Vec<Task>> {
        let mut visited: HashSet<i64> = HashSet::from([task_id]);
        let mut queue = VecDeque::from([task_id]);
        let mut ancestors = Vec::new();

        while let Some(current) = queue.pop_front() {
            let rows = sqlx::query(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE organization_id = ? AND id IN \
                 (SELECT parent_task_id FROM task_relationships \
                  WHERE child_task_id = ? AND relationship_type = 'subtask')"
            ))
            .bind(org_id)
            .bind(current)
            .fetch_all(self.pool())
            .await
            .map_err(sqlx_error_to_broker_error)?;

            for row in &rows {
                let parent = row_to_task(row)?;
                if visited.insert(parent.id) && visited.len() <= MAX_WALK_NODES {
                    queue.push_back(parent.id);
                    ancestors.push(parent);
                }
            }
        }
        Ok(ancestors)
    }

    async fn subtask_children(&self, org_id: i64, task_id: i64) -> Result<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE organization_id = ? AND id IN \
             (SELECT child_task_id FROM task_relationships \
              WHERE parent_task_id = ? AND relationship_type = 'subtask') \
             ORDER BY id ASC"
        ))
        .bind(org_id)
        .bind(task_id)
        .fetch_all(self.pool())
        .await
        .map_err(sqlx_error_to_broker_error)?;
        rows.iter().map(row_to_task).collect()
    }
}

fn inverse_type(relationship_type: RelationshipType) -> RelationshipType {
    match relationship_type {
        RelationshipType::Blocking => RelationshipType::BlockedBy,
        RelationshipType::BlockedBy => RelationshipType::Blocking,
        other => other,
    }
}
