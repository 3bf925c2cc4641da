//! Tenancy tables, API credentials, and the auxiliary surfaces (tags,
//! templates, comments).

use crate::common::{
    row_to_api_key, row_to_comment, row_to_organization, row_to_project, row_to_tag,
    row_to_template, sqlx_error_to_broker_error,
};
use crate::sqlite::{fetch_task_scoped, SqliteStore};
use async_trait::async_trait;
use broker_core::{
    error::{BrokerError, Result},
    models::{
        ApiKey, ApiKeyResolution, Comment, IssuedApiKey, Membership, NewComment, NewProject,
        NewTemplate, Organization, Project, Role, Tag, TaskType, Team, Template,
    },
    store::WorkspaceStore,
};
use chrono::Utc;
use rand::RngCore;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqliteConnection};
use std::collections::VecDeque;

/// Displayed prefix length of a freshly issued credential.
const KEY_PREFIX_LEN: usize = 12;

/// Generate a credential secret: `tbk_` + 48 hex chars of CSPRNG output.
fn generate_secret() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("tbk_{}", hex::encode(bytes))
}

/// One-way digest stored in place of the secret.
pub(crate) fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

async fn issue_key(
    conn: &mut SqliteConnection,
    org_id: i64,
    project_id: i64,
    name: &str,
) -> Result<IssuedApiKey> {
    let secret = generate_secret();
    let key_hash = hash_secret(&secret);
    let key_prefix: String = secret.chars().take(KEY_PREFIX_LEN).collect();
    let now = Utc::now();

    let row = sqlx::query(
        "INSERT INTO api_keys (project_id, organization_id, name, key_hash, key_prefix, \
         enabled, created_at) VALUES (?, ?, ?, ?, ?, 1, ?) \
         RETURNING id, project_id, organization_id, name, key_prefix, enabled, created_at, \
         last_used_at",
    )
    .bind(project_id)
    .bind(org_id)
    .bind(name)
    .bind(&key_hash)
    .bind(&key_prefix)
    .bind(now)
    .fetch_one(&mut *conn)
    .await
    .map_err(sqlx_error_to_broker_error)?;

    Ok(IssuedApiKey {
        key: row_to_api_key(&row),
        secret,
    })
}

#[async_trait]
impl WorkspaceStore for SqliteStore {
    async fn create_organization(&self, name: &str, slug: &str) -> Result<Organization> {
        if name.trim().is_empty() {
            return Err(BrokerError::empty_field("name"));
        }
        if slug.trim().is_empty() {
            return Err(BrokerError::empty_field("slug"));
        }
        let now = Utc::now();
        let row = sqlx::query(
            "INSERT INTO organizations (name, slug, created_at, updated_at) VALUES (?, ?, ?, ?) \
             RETURNING id, name, slug, created_at, updated_at",
        )
        .bind(name)
        .bind(slug)
        .bind(now)
        .bind(now)
        .fetch_one(self.pool())
        .await
        .map_err(sqlx_error_to_broker_error)?;
        Ok(row_to_organization(&row))
    }

    async fn create_project(&self, org_id: i64, project: NewProject) -> Result<Project> {
        if project.name.trim().is_empty() {
            return Err(BrokerError::empty_field("name"));
        }
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM organizations WHERE id = ?)")
                .bind(org_id)
                .fetch_one(self.pool())
                .await
                .map_err(sqlx_error_to_broker_error)?;
        if !exists {
            return Err(BrokerError::NotFound(format!(
                "Organization {org_id} not found"
            )));
        }

        let now = Utc::now();
        let row = sqlx::query(
            "INSERT INTO projects (organization_id, name, local_path, origin_url, description, \
             created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?) \
             RETURNING id, organization_id, name, local_path, origin_url, description, \
             created_at, updated_at",
        )
        .bind(org_id)
        .bind(&project.name)
        .bind(&project.local_path)
        .bind(&project.origin_url)
        .bind(&project.description)
        .bind(now)
        .bind(now)
        .fetch_one(self.pool())
        .await
        .map_err(sqlx_error_to_broker_error)?;
        Ok(row_to_project(&row))
    }

    async fn list_projects(&self, org_id: i64) -> Result<Vec<Project>> {
        let rows = sqlx::query(
            "SELECT id, organization_id, name, local_path, origin_url, description, created_at, \
             updated_at FROM projects WHERE organization_id = ? ORDER BY name ASC",
        )
        .bind(org_id)
        .fetch_all(self.pool())
        .await
        .map_err(sqlx_error_to_broker_error)?;
        Ok(rows.iter().map(row_to_project).collect())
    }

    async fn get_project(&self, org_id: i64, id: i64) -> Result<Option<Project>> {
        let row = sqlx::query(
            "SELECT id, organization_id, name, local_path, origin_url, description, created_at, \
             updated_at FROM projects WHERE id = ? AND organization_id = ?",
        )
        .bind(id)
        .bind(org_id)
        .fetch_optional(self.pool())
        .await
        .map_err(sqlx_error_to_broker_error)?;
        Ok(row.as_ref().map(row_to_project))
    }

    async fn create_api_key(
        &self,
        org_id: i64,
        project_id: i64,
        name: &str,
    ) -> Result<IssuedApiKey> {
        if name.trim().is_empty() {
            return Err(BrokerError::empty_field("name"));
        }
        let mut tx = self.pool().begin_with("BEGIN IMMEDIATE").await.map_err(sqlx_error_to_broker_error)?;
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM projects WHERE id = ? AND organization_id = ?)",
        )
        .bind(project_id)
        .bind(org_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(sqlx_error_to_broker_error)?;
        if !exists {
            return Err(BrokerError::project_not_found(project_id));
        }

        let issued = issue_key(&mut tx, org_id, project_id, name).await?;
        tx.commit().await.map_err(sqlx_error_to_broker_error)?;
        Ok(issued)
    }

    async fn list_api_keys(&self, org_id: i64, project_id: i64) -> Result<Vec<ApiKey>> {
        let rows = sqlx::query(
            "SELECT id, project_id, organization_id, name, key_prefix, enabled, created_at, \
             last_used_at FROM api_keys WHERE project_id = ? AND organization_id = ? \
             ORDER BY created_at ASC",
        )
        .bind(project_id)
        .bind(org_id)
        .fetch_all(self.pool())
        .await
        .map_err(sqlx_error_to_broker_error)?;
        Ok(rows.iter().map(row_to_api_key).collect())
    }

    async fn revoke_api_key(&self, org_id: i64, key_id: i64) -> Result<bool> {
        let enabled: Option<bool> = sqlx::query_scalar(
            "SELECT enabled FROM api_keys WHERE id = ? AND organization_id = ?",
        )
        .bind(key_id)
        .bind(org_id)
        .fetch_optional(self.pool())
        .await
        .map_err(sqlx_error_to_broker_error)?;
        let Some(was_enabled) = enabled else {
            return Err(BrokerError::NotFound(format!("API key {key_id} not found")));
        };

        sqlx::query("UPDATE api_keys SET enabled = 0 WHERE id = ?")
            .bind(key_id)
            .execute(self.pool())
            .await
            .map_err(sqlx_error_to_broker_error)?;
        Ok(was_enabled)
    }

    async fn rotate_api_key(&self, org_id: i64, key_id: i64) -> Result<IssuedApiKey> {
        let mut tx = self.pool().begin_with("BEGIN IMMEDIATE").await.map_err(sqlx_error_to_broker_error)?;
        let row = sqlx::query(
            "SELECT id, project_id, organization_id, name, key_prefix, enabled, created_at, \
             last_used_at FROM api_keys WHERE id = ? AND organization_id = ?",
        )
        .bind(key_id)
        .bind(org_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(sqlx_error_to_broker_error)?;
        let Some(row) = row else {
            return Err(BrokerError::NotFound(format!("API key {key_id} not found")));
        };
        let old = row_to_api_key(&row);

        sqlx::query("UPDATE api_keys SET enabled = 0 WHERE id = ?")
            .bind(key_id)
            .execute(&mut *tx)
            .await
            .map_err(sqlx_error_to_broker_error)?;

        let issued = issue_key(&mut tx, org_id, old.project_id, &old.name).await?;
        tx.commit().await.map_err(sqlx_error_to_broker_error)?;
        tracing::info!(old_key_id = key_id, new_key_id = issued.key.id, "rotated API key");
        Ok(issued)
    }

    async fn resolve_api_key(&self, secret: &str) -> Result<Option<ApiKeyResolution>> {
        let key_hash = hash_secret(secret);
        let row: Option<(i64, i64, i64, bool)> = sqlx::query_as(
            "SELECT id, project_id, organization_id, enabled FROM api_keys WHERE key_hash = ?",
        )
        .bind(&key_hash)
        .fetch_optional(self.pool())
        .await
        .map_err(sqlx_error_to_broker_error)?;

        Ok(row.map(|(key_id, project_id, organization_id, enabled)| ApiKeyResolution {
            key_id,
            project_id,
            organization_id,
            enabled,
        }))
    }

    async fn touch_api_key(&self, key_id: i64) -> Result<()> {
        sqlx::query("UPDATE api_keys SET last_used_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(key_id)
            .execute(self.pool())
            .await
            .map_err(sqlx_error_to_broker_error)?;
        Ok(())
    }

    async fn create_team(
        &self,
        org_id: i64,
        name: &str,
        description: Option<&str>,
    ) -> Result<Team> {
        if name.trim().is_empty() {
            return Err(BrokerError::empty_field("name"));
        }
        let now = Utc::now();
        let row = sqlx::query(
            "INSERT INTO teams (organization_id, name, description, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?) \
             RETURNING id, organization_id, name, description, created_at, updated_at",
        )
        .bind(org_id)
        .bind(name)
        .bind(description)
        .bind(now)
        .bind(now)
        .fetch_one(self.pool())
        .await
        .map_err(sqlx_error_to_broker_error)?;

        Ok(Team {
            id: row.get("id"),
            organization_id: row.get("organization_id"),
            name: row.get("name"),
            description: row.get("description"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    async fn create_role(&self, org_id: i64, name: &str, permissions: &[String]) -> Result<Role> {
        if name.trim().is_empty() {
            return Err(BrokerError::empty_field("name"));
        }
        let now = Utc::now();
        let permissions_json = serde_json::to_string(permissions)
            .map_err(|e| BrokerError::Internal(format!("permission serialization failed: {e}")))?;
        let row = sqlx::query(
            "INSERT INTO roles (organization_id, name, permissions, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?) \
             RETURNING id, organization_id, name, permissions, created_at, updated_at",
        )
        .bind(org_id)
        .bind(name)
        .bind(permissions_json)
        .bind(now)
        .bind(now)
        .fetch_one(self.pool())
        .await
        .map_err(sqlx_error_to_broker_error)?;

        let stored: String = row.get("permissions");
        Ok(Role {
            id: row.get("id"),
            organization_id: row.get("organization_id"),
            name: row.get("name"),
            permissions: serde_json::from_str(&stored)
                .map_err(|e| BrokerError::Database(format!("Invalid role permissions: {e}")))?,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    async fn create_membership(
        &self,
        org_id: i64,
        user_id: &str,
        team_id: Option<i64>,
        role_ids: &[i64],
    ) -> Result<Membership> {
        if user_id.trim().is_empty() {
            return Err(BrokerError::empty_field("user_id"));
        }
        let now = Utc::now();
        let role_ids_json = serde_json::to_string(role_ids)
            .map_err(|e| BrokerError::Internal(format!("role id serialization failed: {e}")))?;
        let row = sqlx::query(
            "INSERT INTO memberships (organization_id, team_id, user_id, role_ids, created_at) \
             VALUES (?, ?, ?, ?, ?) \
             RETURNING id, organization_id, team_id, user_id, role_ids, created_at",
        )
        .bind(org_id)
        .bind(team_id)
        .bind(user_id)
        .bind(role_ids_json)
        .bind(now)
        .fetch_one(self.pool())
        .await
        .map_err(sqlx_error_to_broker_error)?;

        let stored: String = row.get("role_ids");
        Ok(Membership {
            id: row.get("id"),
            organization_id: row.get("organization_id"),
            team_id: row.get("team_id"),
            user_id: row.get("user_id"),
            role_ids: serde_json::from_str(&stored)
                .map_err(|e| BrokerError::Database(format!("Invalid membership roles: {e}")))?,
            created_at: row.get("created_at"),
        })
    }

    async fn member_permissions(&self, org_id: i64, user_id: &str) -> Result<Vec<String>> {
        let memberships: Vec<String> = sqlx::query_scalar(
            "SELECT role_ids FROM memberships WHERE organization_id = ? AND user_id = ?",
        )
        .bind(org_id)
        .bind(user_id)
        .fetch_all(self.pool())
        .await
        .map_err(sqlx_error_to_broker_error)?;

        let mut role_ids: Vec<i64> = Vec::new();
        for raw in memberships {
            let ids: Vec<i64> = serde_json::from_str(&raw)
                .map_err(|e| BrokerError::Database(format!("Invalid membership roles: {e}")))?;
            role_ids.extend(ids);
        }
        role_ids.sort_unstable();
        role_ids.dedup();

        let mut permissions: Vec<String> = Vec::new();
        for role_id in role_ids {
            let stored: Option<String> = sqlx::query_scalar(
                "SELECT permissions FROM roles WHERE id = ? AND organization_id = ?",
            )
            .bind(role_id)
            .bind(org_id)
            .fetch_optional(self.pool())
            .await
            .map_err(sqlx_error_to_broker_error)?;
            if let Some(stored) = stored {
                let role_permissions: Vec<String> = serde_json::from_str(&stored)
                    .map_err(|e| BrokerError::Database(format!("Invalid role permissions: {e}")))?;
                permissions.extend(role_permissions);
            }
        }
        permissions.sort();
        permissions.dedup();
        Ok(permissions)
    }

    async fn create_tag(&self, name: &str) -> Result<Tag> {
        if name.trim().is_empty() {
            return Err(BrokerError::empty_field("name"));
        }
        // Idempotent by name: the insert is a no-op when the tag exists.
        sqlx::query("INSERT INTO tags (name, created_at) VALUES (?, ?) ON CONFLICT(name) DO NOTHING")
            .bind(name)
            .bind(Utc::now())
            .execute(self.pool())
            .await
            .map_err(sqlx_error_to_broker_error)?;

        let row = sqlx::query("SELECT id, name, created_at FROM tags WHERE name = ?")
            .bind(name)
            .fetch_one(self.pool())
            .await
            .map_err(sqlx_error_to_broker_error)?;
        Ok(row_to_tag(&row))
    }

    async fn list_tags(&self) -> Result<Vec<Tag>> {
        let rows = sqlx::query("SELECT id, name, created_at FROM tags ORDER BY name ASC")
            .fetch_all(self.pool())
            .await
            .map_err(sqlx_error_to_broker_error)?;
        Ok(rows.iter().map(row_to_tag).collect())
    }

    async fn assign_tag(&self, org_id: i64, task_id: i64, tag_id: i64) -> Result<bool> {
        let mut tx = self.pool().begin_with("BEGIN IMMEDIATE").await.map_err(sqlx_error_to_broker_error)?;
        if fetch_task_scoped(&mut tx, org_id, task_id).await?.is_none() {
            return Err(BrokerError::task_not_found(task_id));
        }
        let tag_exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM tags WHERE id = ?)")
            .bind(tag_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(sqlx_error_to_broker_error)?;
        if !tag_exists {
            return Err(BrokerError::NotFound(format!("Tag {tag_id} not found")));
        }

        let result = sqlx::query(
            "INSERT INTO task_tags (task_id, tag_id) VALUES (?, ?) \
             ON CONFLICT(task_id, tag_id) DO NOTHING",
        )
        .bind(task_id)
        .bind(tag_id)
        .execute(&mut *tx)
        .await
        .map_err(sqlx_error_to_broker_error)?;

        tx.commit().await.map_err(sqlx_error_to_broker_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove_tag(&self, org_id: i64, task_id: i64, tag_id: i64) -> Result<bool> {
        let mut tx = self.pool().begin_with("BEGIN IMMEDIATE").await.map_err(sqlx_error_to_broker_error)?;
        if fetch_task_scoped(&mut tx, org_id, task_id).await?.is_none() {
            return Err(BrokerError::task_not_found(task_id));
        }
        let result = sqlx::query("DELETE FROM task_tags WHERE task_id = ? AND tag_id = ?")
            .bind(task_id)
            .bind(tag_id)
            .execute(&mut *tx)
            .await
            .map_err(sqlx_error_to_broker_error)?;
        tx.commit().await.map_err(sqlx_error_to_broker_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn task_tags(&self, org_id: i64, task_id: i64) -> Result<Vec<Tag>> {
        let rows = sqlx::query(
            "SELECT g.id, g.name, g.created_at FROM tags g \
             JOIN task_tags tt ON tt.tag_id = g.id \
             JOIN tasks t ON t.id = tt.task_id \
             WHERE tt.task_id = ? AND t.organization_id = ? ORDER BY g.name ASC",
        )
        .bind(task_id)
        .bind(org_id)
        .fetch_all(self.pool())
        .await
        .map_err(sqlx_error_to_broker_error)?;
        Ok(rows.iter().map(row_to_tag).collect())
    }

    async fn create_template(&self, org_id: i64, template: NewTemplate) -> Result<Template> {
        let now = Utc::now();
        let row = sqlx::query(
            "INSERT INTO templates (organization_id, name, description, task_type, \
             task_instruction, verification_instruction, priority, estimated_hours, created_at, \
             updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             RETURNING id, organization_id, name, description, task_type, task_instruction, \
             verification_instruction, priority, estimated_hours, created_at, updated_at",
        )
        .bind(org_id)
        .bind(&template.name)
        .bind(&template.description)
        .bind(template.task_type.as_str())
        .bind(&template.task_instruction)
        .bind(&template.verification_instruction)
        .bind(template.priority.as_str())
        .bind(template.estimated_hours)
        .bind(now)
        .bind(now)
        .fetch_one(self.pool())
        .await
        .map_err(sqlx_error_to_broker_error)?;
        row_to_template(&row)
    }

    async fn list_templates(
        &self,
        org_id: i64,
        task_type: Option<TaskType>,
    ) -> Result<Vec<Template>> {
        let mut qb: sqlx::QueryBuilder<sqlx::Sqlite> = sqlx::QueryBuilder::new(
            "SELECT id, organization_id, name, description, task_type, task_instruction, \
             verification_instruction, priority, estimated_hours, created_at, updated_at \
             FROM templates WHERE organization_id = ",
        );
        qb.push_bind(org_id);
        if let Some(task_type) = task_type {
            qb.push(" AND task_type = ");
            qb.push_bind(task_type.as_str());
        }
        qb.push(" ORDER BY name ASC");

        let rows = qb
            .build()
            .fetch_all(self.pool())
            .await
            .map_err(sqlx_error_to_broker_error)?;
        rows.iter().map(row_to_template).collect()
    }

    async fn get_template(&self, org_id: i64, id: i64) -> Result<Option<Template>> {
        let row = sqlx::query(
            "SELECT id, organization_id, name, description, task_type, task_instruction, \
             verification_instruction, priority, estimated_hours, created_at, updated_at \
             FROM templates WHERE id = ? AND organization_id = ?",
        )
        .bind(id)
        .bind(org_id)
        .fetch_optional(self.pool())
        .await
        .map_err(sqlx_error_to_broker_error)?;
        row.as_ref().map(row_to_template).transpose()
    }

    async fn create_comment(&self, org_id: i64, comment: NewComment) -> Result<Comment> {
        let mut tx = self.pool().begin_with("BEGIN IMMEDIATE").await.map_err(sqlx_error_to_broker_error)?;
        if fetch_task_scoped(&mut tx, org_id, comment.task_id).await?.is_none() {
            return Err(BrokerError::task_not_found(comment.task_id));
        }
        if let Some(parent_id) = comment.parent_comment_id {
            let parent_task: Option<i64> =
                sqlx::query_scalar("SELECT task_id FROM comments WHERE id = ?")
                    .bind(parent_id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(sqlx_error_to_broker_error)?;
            match parent_task {
                None => {
                    return Err(BrokerError::NotFound(format!(
                        "Comment {parent_id} not found"
                    )))
                }
                Some(task_id) if task_id != comment.task_id => {
                    return Err(BrokerError::Validation(
                        "Parent comment belongs to a different task".to_string(),
                    ))
                }
                Some(_) => {}
            }
        }

        let now = Utc::now();
        let mentions = serde_json::to_string(&comment.mentions)
            .map_err(|e| BrokerError::Internal(format!("mentions serialization failed: {e}")))?;
        let row = sqlx::query(
            "INSERT INTO comments (task_id, author_agent, parent_comment_id, content, mentions, \
             created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?) \
             RETURNING id, task_id, author_agent, parent_comment_id, content, mentions, \
             created_at, updated_at",
        )
        .bind(comment.task_id)
        .bind(&comment.author_agent)
        .bind(comment.parent_comment_id)
        .bind(&comment.content)
        .bind(mentions)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(sqlx_error_to_broker_error)?;

        let created = row_to_comment(&row)?;
        tx.commit().await.map_err(sqlx_error_to_broker_error)?;
        Ok(created)
    }

    async fn task_comments(&self, org_id: i64, task_id: i64, limit: u32) -> Result<Vec<Comment>> {
        let rows = sqlx::query(
            "SELECT c.id, c.task_id, c.author_agent, c.parent_comment_id, c.content, c.mentions, \
             c.created_at, c.updated_at FROM comments c JOIN tasks t ON t.id = c.task_id \
             WHERE c.task_id = ? AND t.organization_id = ? \
             ORDER BY c.created_at ASC, c.id ASC LIMIT ?",
        )
        .bind(task_id)
        .bind(org_id)
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await
        .map_err(sqlx_error_to_broker_error)?;
        rows.iter().map(row_to_comment).collect()
    }

    async fn comment_thread(&self, org_id: i64, comment_id: i64) -> Result<Vec<Comment>> {
        let root = sqlx::query(
            "SELECT c.id, c.task_id, c.author_agent, c.parent_comment_id, c.content, c.mentions, \
             c.created_at, c.updated_at FROM comments c JOIN tasks t ON t.id = c.task_id \
             WHERE c.id = ? AND t.organization_id = ?",
        )
        .bind(comment_id)
        .bind(org_id)
        .fetch_optional(self.pool())
        .await
        .map_err(sqlx_error_to_broker_error)?;
        let Some(root) = root.as_ref().map(row_to_comment).transpose()? else {
            return Err(BrokerError::NotFound(format!(
                "Comment {comment_id} not found"
            )));
        };

        let mut thread = vec![root];
        let mut queue: VecDeque<i64> = VecDeque::from([comment_id]);
        while let Some(current) = queue.pop_front() {
            let rows = sqlx::query(
                "SELECT id, task_id, author_agent, parent_comment_id, content, mentions, \
                 created_at, updated_at FROM comments WHERE parent_comment_id = ? \
                 ORDER BY created_at ASC, id ASC",
            )
            .bind(current)
            .fetch_all(self.pool())
            .await
            .map_err(sqlx_error_to_broker_error)?;
            for row in &rows {
                let reply = row_to_comment(row)?;
                queue.push_back(reply.id);
                thread.push(reply);
            }
        }
        Ok(thread)
    }

    async fn update_comment(
        &self,
        org_id: i64,
        comment_id: i64,
        author_agent: &str,
        content: &str,
    ) -> Result<Comment> {
        if content.trim().is_empty() {
            return Err(BrokerError::empty_field("content"));
        }
        let mut tx = self.pool().begin_with("BEGIN IMMEDIATE").await.map_err(sqlx_error_to_broker_error)?;
        let row = sqlx::query(
            "SELECT c.id, c.task_id, c.author_agent, c.parent_comment_id, c.content, c.mentions, \
             c.created_at, c.updated_at FROM comments c JOIN tasks t ON t.id = c.task_id \
             WHERE c.id = ? AND t.organization_id = ?",
        )
        .bind(comment_id)
        .bind(org_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(sqlx_error_to_broker_error)?;
        let Some(existing) = row.as_ref().map(row_to_comment).transpose()? else {
            return Err(BrokerError::NotFound(format!(
                "Comment {comment_id} not found"
            )));
        };
        if existing.author_agent != author_agent {
            return Err(BrokerError::Forbidden(
                "Only the author may edit a comment".to_string(),
            ));
        }

        let now = Utc::now();
        let row = sqlx::query(
            "UPDATE comments SET content = ?, updated_at = ? WHERE id = ? \
             RETURNING id, task_id, author_agent, parent_comment_id, content, mentions, \
             created_at, updated_at",
        )
        .bind(content)
        .bind(now)
        .bind(comment_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(sqlx_error_to_broker_error)?;
        let updated = row_to_comment(&row)?;
        tx.commit().await.map_err(sqlx_error_to_broker_error)?;
        Ok(updated)
    }

    async fn delete_comment(
        &self,
        org_id: i64,
        comment_id: i64,
        author_agent: &str,
    ) -> Result<u64> {
        let thread = self.comment_thread(org_id, comment_id).await?;
        let root = &thread[0];
        if root.author_agent != author_agent {
            return Err(BrokerError::Forbidden(
                "Only the author may delete a comment".to_string(),
            ));
        }

        // The parent FK cascades to transitive replies.
        sqlx::query("DELETE FROM comments WHERE id = ?")
            .bind(comment_id)
            .execute(self.pool())
            .await
            .map_err(sqlx_error_to_broker_error)?;
        Ok(thread.len() as u64)
    }
}
