//! Append-only audit streams: narrative updates, change history, version
//! snapshots, and the merged activity feed.

use crate::common::{
    floor_to_second, row_to_change, row_to_update, row_to_version, sqlx_error_to_broker_error,
};
use crate::sqlite::{fetch_task_scoped, insert_update, SqliteStore};
use async_trait::async_trait;
use broker_core::{
    error::{BrokerError, Result},
    models::{ChangeRecord, FeedEvent, FeedFilter, FeedSource, TaskUpdate, TaskVersion, UpdateType},
    store::AuditStore,
    validation::effective_limit,
};
use chrono::Utc;
use sqlx::Row;
use std::collections::HashSet;

#[async_trait]
impl AuditStore for SqliteStore {
    async fn add_update(
        &self,
        org_id: i64,
        task_id: i64,
        agent_id: &str,
        update_type: UpdateType,
        content: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<TaskUpdate> {
        let mut tx = self.pool().begin_with("BEGIN IMMEDIATE").await.map_err(sqlx_error_to_broker_error)?;
        if fetch_task_scoped(&mut tx, org_id, task_id).await?.is_none() {
            return Err(BrokerError::task_not_found(task_id));
        }

        let now = Utc::now();
        let id = insert_update(
            &mut tx,
            task_id,
            agent_id,
            update_type,
            content,
            metadata.as_ref(),
            now,
        )
        .await?;

        // An in-progress task's staleness clock is its updated_at; every
        // recorded update advances it.
        sqlx::query("UPDATE tasks SET updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(task_id)
            .execute(&mut *tx)
            .await
            .map_err(sqlx_error_to_broker_error)?;

        tx.commit().await.map_err(sqlx_error_to_broker_error)?;

        Ok(TaskUpdate {
            id,
            task_id,
            agent_id: agent_id.to_string(),
            update_type,
            content: content.to_string(),
            metadata,
            created_at: now,
        })
    }

    async fn task_updates(&self, org_id: i64, task_id: i64, limit: u32) -> Result<Vec<TaskUpdate>> {
        let rows = sqlx::query(
            "SELECT u.id, u.task_id, u.agent_id, u.update_type, u.content, u.metadata, u.created_at \
             FROM task_updates u JOIN tasks t ON t.id = u.task_id \
             WHERE t.organization_id = ? AND u.task_id = ? \
             ORDER BY u.created_at DESC, u.id DESC LIMIT ?",
        )
        .bind(org_id)
        .bind(task_id)
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await
        .map_err(sqlx_error_to_broker_error)?;
        rows.iter().map(row_to_update).collect()
    }

    async fn change_history(
        &self,
        org_id: i64,
        task_id: i64,
        limit: u32,
    ) -> Result<Vec<ChangeRecord>> {
        let rows = sqlx::query(
            "SELECT ch.id, ch.task_id, ch.agent_id, ch.change_type, ch.field_name, \
             ch.old_value, ch.new_value, ch.created_at \
             FROM change_history ch JOIN tasks t ON t.id = ch.task_id \
             WHERE t.organization_id = ? AND ch.task_id = ? \
             ORDER BY ch.created_at DESC, ch.id DESC LIMIT ?",
        )
        .bind(org_id)
        .bind(task_id)
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await
        .map_err(sqlx_error_to_broker_error)?;
        Ok(rows.iter().map(row_to_change).collect())
    }

    async fn activity_feed(&self, org_id: i64, filter: FeedFilter) -> Result<Vec<FeedEvent>> {
        let limit = effective_limit(filter.limit);

        let mut history_qb: sqlx::QueryBuilder<sqlx::Sqlite> = sqlx::QueryBuilder::new(
            "SELECT ch.task_id, ch.agent_id, ch.change_type AS label, ch.new_value AS detail, \
             ch.created_at FROM change_history ch JOIN tasks t ON t.id = ch.task_id \
             WHERE t.organization_id = ",
        );
        history_qb.push_bind(org_id);
        let mut updates_qb: sqlx::QueryBuilder<sqlx::Sqlite> = sqlx::QueryBuilder::new(
            "SELECT u.task_id, u.agent_id, u.update_type AS label, u.content AS detail, \
             u.created_at FROM task_updates u JOIN tasks t ON t.id = u.task_id \
             WHERE t.organization_id = ",
        );
        updates_qb.push_bind(org_id);

        for (qb, alias) in [(&mut history_qb, "ch"), (&mut updates_qb, "u")] {
            if let Some(task_id) = filter.task_id {
                qb.push(format!(" AND {alias}.task_id = "));
                qb.push_bind(task_id);
            }
            if let Some(ref agent_id) = filter.agent_id {
                qb.push(format!(" AND {alias}.agent_id = "));
                qb.push_bind(agent_id.clone());
            }
            if let Some(since) = filter.since {
                qb.push(format!(" AND {alias}.created_at >= "));
                qb.push_bind(since);
            }
            if let Some(until) = filter.until {
                qb.push(format!(" AND {alias}.created_at <= "));
                qb.push_bind(until);
            }
            qb.push(format!(" ORDER BY {alias}.created_at ASC LIMIT "));
            qb.push_bind(limit as i64);
        }

        let mut events: Vec<FeedEvent> = Vec::new();
        for (qb, source) in [
            (&mut history_qb, FeedSource::History),
            (&mut updates_qb, FeedSource::Update),
        ] {
            let rows = qb
                .build()
                .fetch_all(self.pool())
                .await
                .map_err(sqlx_error_to_broker_error)?;
            for row in rows {
                events.push(FeedEvent {
                    task_id: row.get("task_id"),
                    agent_id: row.get("agent_id"),
                    source,
                    label: row.get("label"),
                    detail: row.get("detail"),
                    created_at: row.get("created_at"),
                });
            }
        }

        // Chronological oldest-first, stable across sources by created_at.
        events.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });

        // Same-second duplicates collapse in the presented feed only;
        // storage keeps every row.
        let mut seen: HashSet<(i64, String, Option<String>, i64)> = HashSet::new();
        events.retain(|event| {
            seen.insert((
                event.task_id,
                event.label.clone(),
                event.detail.clone(),
                floor_to_second(event.created_at),
            ))
        });

        events.truncate(limit as usize);
        Ok(events)
    }

    async fn task_versions(&self, org_id: i64, task_id: i64) -> Result<Vec<TaskVersion>> {
        let rows = sqlx::query(
            "SELECT v.* FROM task_versions v JOIN tasks t ON t.id = v.task_id \
             WHERE t.organization_id = ? AND v.task_id = ? ORDER BY v.version_number ASC",
        )
        .bind(org_id)
        .bind(task_id)
        .fetch_all(self.pool())
        .await
        .map_err(sqlx_error_to_broker_error)?;
        rows.iter().map(row_to_version).collect()
    }

    async fn task_version(
        &self,
        org_id: i64,
        task_id: i64,
        version_number: i64,
    ) -> Result<Option<TaskVersion>> {
        let row = sqlx::query(
            "SELECT v.* FROM task_versions v JOIN tasks t ON t.id = v.task_id \
             WHERE t.organization_id = ? AND v.task_id = ? AND v.version_number = ?",
        )
        .bind(org_id)
        .bind(task_id)
        .bind(version_number)
        .fetch_optional(self.pool())
        .await
        .map_err(sqlx_error_to_broker_error)?;
        row.as_ref().map(row_to_version).transpose()
    }

    async fn latest_version(&self, org_id: i64, task_id: i64) -> Result<Option<TaskVersion>> {
        let row = sqlx::query(
            "SELECT v.* FROM task_versions v JOIN tasks t ON t.id = v.task_id \
             WHERE t.organization_id = ? AND v.task_id = ? \
             ORDER BY v.version_number DESC LIMIT 1",
        )
        .bind(org_id)
        .bind(task_id)
        .fetch_optional(self.pool())
        .await
        .map_err(sqlx_error_to_broker_error)?;
        row.as_ref().map(row_to_version).transpose()
    }
}
