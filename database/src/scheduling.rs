//! Recurrence schedules and instance materialization.

use crate::common::{row_to_recurrence, row_to_task, sqlx_error_to_broker_error, TASK_COLUMNS};
use crate::sqlite::{fetch_task, record_history, snapshot_version, SqliteStore};
use async_trait::async_trait;
use broker_core::{
    error::{BrokerError, Result},
    models::{
        NewRecurrence, Recurrence, RecurrenceConfig, RecurrencePatch, RecurrenceType, Task,
        SYSTEM_AGENT,
    },
    state::change,
    store::RecurrenceStore,
};
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};

/// Advance an occurrence one step.
///
/// Daily adds a day; weekly moves to the next configured weekday strictly
/// after `from`; monthly moves to the configured day of the following month,
/// clamped to that month's length. Time of day is preserved.
pub fn advance_occurrence(
    recurrence_type: RecurrenceType,
    config: &RecurrenceConfig,
    from: DateTime<Utc>,
) -> DateTime<Utc> {
    match recurrence_type {
        RecurrenceType::Daily => from + Duration::days(1),
        RecurrenceType::Weekly => {
            let target = config
                .day_of_week
                .unwrap_or(from.weekday().num_days_from_monday() as u8);
            let mut next = from + Duration::days(1);
            while next.weekday().num_days_from_monday() as u8 != target {
                next += Duration::days(1);
            }
            next
        }
        RecurrenceType::Monthly => {
            let (year, month) = if from.month() == 12 {
                (from.year() + 1, 1)
            } else {
                (from.year(), from.month() + 1)
            };
            let day = u32::from(config.day_of_month.unwrap_or(from.day() as u8))
                .clamp(1, days_in_month(year, month));
            NaiveDate::from_ymd_opt(year, month, day)
                .and_then(|date| {
                    date.and_hms_opt(from.hour(), from.minute(), from.second())
                })
                .map(|naive| Utc.from_utc_datetime(&naive))
                // Unreachable after clamping; fall back to a plain month hop.
                .unwrap_or(from + Duration::days(28))
        }
    }
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first| first.pred_opt())
        .map(|last| last.day())
        .unwrap_or(28)
}

const RECURRENCE_COLUMNS: &str = "id, base_task_id, recurrence_type, config, next_occurrence, \
     last_occurrence_created, is_active, created_at, updated_at";

#[async_trait]
impl RecurrenceStore for SqliteStore {
    async fn create_recurrence(
        &self,
        org_id: i64,
        recurrence: NewRecurrence,
    ) -> Result<Recurrence> {
        let mut tx = self.pool().begin_with("BEGIN IMMEDIATE").await.map_err(sqlx_error_to_broker_error)?;
        if crate::sqlite::fetch_task_scoped(&mut tx, org_id, recurrence.base_task_id)
            .await?
            .is_none()
        {
            return Err(BrokerError::task_not_found(recurrence.base_task_id));
        }

        let now = Utc::now();
        let config = serde_json::to_string(&recurrence.config)
            .map_err(|e| BrokerError::Internal(format!("config serialization failed: {e}")))?;
        let row = sqlx::query(&format!(
            "INSERT INTO recurring_tasks (base_task_id, recurrence_type, config, \
             next_occurrence, is_active, created_at, updated_at) \
             VALUES (?, ?, ?, ?, 1, ?, ?) RETURNING {RECURRENCE_COLUMNS}"
        ))
        .bind(recurrence.base_task_id)
        .bind(recurrence.recurrence_type.as_str())
        .bind(config)
        .bind(recurrence.next_occurrence)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(sqlx_error_to_broker_error)?;

        let created = row_to_recurrence(&row)?;
        tx.commit().await.map_err(sqlx_error_to_broker_error)?;
        Ok(created)
    }

    async fn list_recurrences(&self, org_id: i64, active_only: bool) -> Result<Vec<Recurrence>> {
        let mut qb: sqlx::QueryBuilder<sqlx::Sqlite> = sqlx::QueryBuilder::new(format!(
            "SELECT {} FROM recurring_tasks r JOIN tasks t ON t.id = r.base_task_id \
             WHERE t.organization_id = ",
            RECURRENCE_COLUMNS
                .split(", ")
                .map(|c| format!("r.{c}"))
                .collect::<Vec<_>>()
                .join(", ")
        ));
        qb.push_bind(org_id);
        if active_only {
            qb.push(" AND r.is_active = 1");
        }
        qb.push(" ORDER BY r.next_occurrence ASC");

        let rows = qb
            .build()
            .fetch_all(self.pool())
            .await
            .map_err(sqlx_error_to_broker_error)?;
        rows.iter().map(row_to_recurrence).collect()
    }

    async fn get_recurrence(&self, org_id: i64, id: i64) -> Result<Option<Recurrence>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM recurring_tasks r JOIN tasks t ON t.id = r.base_task_id \
             WHERE r.id = ? AND t.organization_id = ?",
            RECURRENCE_COLUMNS
                .split(", ")
                .map(|c| format!("r.{c}"))
                .collect::<Vec<_>>()
                .join(", ")
        ))
        .bind(id)
        .bind(org_id)
        .fetch_optional(self.pool())
        .await
        .map_err(sqlx_error_to_broker_error)?;
        row.as_ref().map(row_to_recurrence).transpose()
    }

    async fn update_recurrence(
        &self,
        org_id: i64,
        id: i64,
        patch: RecurrencePatch,
    ) -> Result<Recurrence> {
        let Some(current) = self.get_recurrence(org_id, id).await? else {
            return Err(BrokerError::NotFound(format!("Recurrence {id} not found")));
        };

        let recurrence_type = patch.recurrence_type.unwrap_or(current.recurrence_type);
        let config = patch.config.unwrap_or(current.config);
        let next_occurrence = patch.next_occurrence.unwrap_or(current.next_occurrence);
        let is_active = patch.is_active.unwrap_or(current.is_active);
        // The merged schedule must still be coherent (a weekly recurrence
        // needs its weekday even when only the type changed).
        broker_core::validation::Validator::validate_recurrence(recurrence_type, &config)?;

        let config_json = serde_json::to_string(&config)
            .map_err(|e| BrokerError::Internal(format!("config serialization failed: {e}")))?;
        sqlx::query(
            "UPDATE recurring_tasks SET recurrence_type = ?, config = ?, next_occurrence = ?, \
             is_active = ?, updated_at = ? WHERE id = ?",
        )
        .bind(recurrence_type.as_str())
        .bind(config_json)
        .bind(next_occurrence)
        .bind(is_active)
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await
        .map_err(sqlx_error_to_broker_error)?;

        self.get_recurrence(org_id, id)
            .await?
            .ok_or_else(|| BrokerError::Internal(format!("recurrence {id} vanished mid-update")))
    }

    async fn deactivate_recurrence(&self, org_id: i64, id: i64) -> Result<bool> {
        let Some(current) = self.get_recurrence(org_id, id).await? else {
            return Err(BrokerError::NotFound(format!("Recurrence {id} not found")));
        };
        if !current.is_active {
            return Ok(false);
        }
        sqlx::query("UPDATE recurring_tasks SET is_active = 0, updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(sqlx_error_to_broker_error)?;
        Ok(true)
    }

    async fn materialize_instance(
        &self,
        org_id: Option<i64>,
        id: i64,
    ) -> Result<(Task, Recurrence)> {
        let mut tx = self.pool().begin_with("BEGIN IMMEDIATE").await.map_err(sqlx_error_to_broker_error)?;

        let row = sqlx::query(&format!(
            "SELECT {RECURRENCE_COLUMNS} FROM recurring_tasks WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(sqlx_error_to_broker_error)?;
        let Some(recurrence) = row.as_ref().map(row_to_recurrence).transpose()? else {
            return Err(BrokerError::NotFound(format!("Recurrence {id} not found")));
        };

        let Some(base) = fetch_task(&mut tx, recurrence.base_task_id).await? else {
            return Err(BrokerError::task_not_found(recurrence.base_task_id));
        };
        // Tenant calls see someone else's recurrence as missing.
        if let Some(org_id) = org_id {
            if base.organization_id != Some(org_id) {
                return Err(BrokerError::NotFound(format!("Recurrence {id} not found")));
            }
        }
        if !recurrence.is_active {
            return Err(BrokerError::Validation(format!(
                "Recurrence {id} is not active"
            )));
        }

        // Clone the template's content fields into a fresh instance.
        let now = Utc::now();
        let row = sqlx::query(&format!(
            "INSERT INTO tasks (project_id, organization_id, title, task_type, task_instruction, \
             verification_instruction, notes, task_status, verification_status, priority, \
             estimated_hours, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, 'available', 'unverified', ?, ?, ?, ?) \
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(base.project_id)
        .bind(base.organization_id)
        .bind(&base.title)
        .bind(base.task_type.as_str())
        .bind(&base.task_instruction)
        .bind(&base.verification_instruction)
        .bind(&base.notes)
        .bind(base.priority.as_str())
        .bind(base.estimated_hours)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(sqlx_error_to_broker_error)?;
        let instance = row_to_task(&row)?;

        record_history(
            &mut tx,
            instance.id,
            SYSTEM_AGENT,
            change::CREATED,
            None,
            None,
            Some(instance.task_status.as_str()),
            now,
        )
        .await?;
        snapshot_version(&mut tx, &instance, SYSTEM_AGENT, now).await?;

        // Advance from the scheduled occurrence, not from now: a missed
        // occurrence is caught up one step per call, never backfilled.
        let next = advance_occurrence(
            recurrence.recurrence_type,
            &recurrence.config,
            recurrence.next_occurrence,
        );
        sqlx::query(
            "UPDATE recurring_tasks SET next_occurrence = ?, last_occurrence_created = ?, \
             updated_at = ? WHERE id = ?",
        )
        .bind(next)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(sqlx_error_to_broker_error)?;

        tx.commit().await.map_err(sqlx_error_to_broker_error)?;
        tracing::info!(
            recurrence_id = id,
            instance_id = instance.id,
            next_occurrence = %next,
            "materialized recurring task instance"
        );

        let updated = Recurrence {
            next_occurrence: next,
            last_occurrence_created: Some(now),
            updated_at: now,
            ..recurrence
        };
        Ok((instance, updated))
    }

    async fn due_recurrences(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Recurrence>> {
        let rows = sqlx::query(&format!(
            "SELECT {RECURRENCE_COLUMNS} FROM recurring_tasks \
             WHERE is_active = 1 AND next_occurrence <= ? \
             ORDER BY next_occurrence ASC LIMIT ?"
        ))
        .bind(now)
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await
        .map_err(sqlx_error_to_broker_error)?;
        rows.iter().map(row_to_recurrence).collect()
    }
}
