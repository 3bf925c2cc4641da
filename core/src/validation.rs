use crate::{
    error::{BrokerError, Result},
    models::{NewComment, NewTask, NewTemplate, RecurrenceConfig, RecurrenceType, TaskPatch},
};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};

/// Default page size applied when a caller omits `limit`.
pub const DEFAULT_QUERY_LIMIT: u32 = 100;

/// Hard ceiling no caller may exceed.
pub const MAX_QUERY_LIMIT: u32 = 1000;

/// Validation utilities for broker operations.
///
/// Everything here rejects before any state change; the store assumes its
/// inputs already passed through this layer.
pub struct Validator;

impl Validator {
    /// Validate an agent identity.
    ///
    /// Agent ids must:
    /// - Be 1-64 characters long
    /// - Contain only letters, numbers, hyphens, underscores, and dots
    /// - Start and end with a letter or number
    pub fn validate_agent_id(agent_id: &str) -> Result<()> {
        if agent_id.trim().is_empty() {
            return Err(BrokerError::empty_field("agent_id"));
        }

        if agent_id.len() > 64 {
            return Err(BrokerError::Validation(
                "Agent id must be at most 64 characters long".to_string(),
            ));
        }

        let first = agent_id.chars().next().unwrap();
        let last = agent_id.chars().last().unwrap();
        if !first.is_alphanumeric() || !last.is_alphanumeric() {
            return Err(BrokerError::Validation(
                "Agent id must start and end with a letter or number".to_string(),
            ));
        }

        let valid = agent_id
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.');
        if !valid {
            return Err(BrokerError::Validation(
                "Agent id can only contain letters, numbers, hyphens, underscores, and dots"
                    .to_string(),
            ));
        }

        Ok(())
    }

    /// Validate task content fields for creation.
    pub fn validate_new_task(task: &NewTask) -> Result<()> {
        if task.title.trim().is_empty() {
            return Err(BrokerError::empty_field("title"));
        }
        if task.task_instruction.trim().is_empty() {
            return Err(BrokerError::empty_field("task_instruction"));
        }
        if task.verification_instruction.trim().is_empty() {
            return Err(BrokerError::empty_field("verification_instruction"));
        }
        if let Some(hours) = task.estimated_hours {
            if !(hours > 0.0) {
                return Err(BrokerError::Validation(
                    "estimated_hours must be a positive number".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Validate a field patch. Emptiness is checked on fields being set;
    /// clearing a nullable field is always allowed.
    pub fn validate_patch(patch: &TaskPatch) -> Result<()> {
        if let Some(title) = &patch.title {
            if title.trim().is_empty() {
                return Err(BrokerError::empty_field("title"));
            }
        }
        if let Some(instruction) = &patch.task_instruction {
            if instruction.trim().is_empty() {
                return Err(BrokerError::empty_field("task_instruction"));
            }
        }
        if let Some(instruction) = &patch.verification_instruction {
            if instruction.trim().is_empty() {
                return Err(BrokerError::empty_field("verification_instruction"));
            }
        }
        if let Some(Some(hours)) = patch.estimated_hours {
            if !(hours > 0.0) {
                return Err(BrokerError::Validation(
                    "estimated_hours must be a positive number".to_string(),
                ));
            }
        }
        if let Some(Some(hours)) = patch.actual_hours {
            if !(hours >= 0.0) {
                return Err(BrokerError::Validation(
                    "actual_hours cannot be negative".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Validate narrative update content.
    pub fn validate_update_content(content: &str) -> Result<()> {
        if content.trim().is_empty() {
            return Err(BrokerError::empty_field("content"));
        }
        Ok(())
    }

    /// Validate a recurrence configuration against its type.
    pub fn validate_recurrence(
        recurrence_type: RecurrenceType,
        config: &RecurrenceConfig,
    ) -> Result<()> {
        match recurrence_type {
            RecurrenceType::Daily => Ok(()),
            RecurrenceType::Weekly => match config.day_of_week {
                Some(day) if day <= 6 => Ok(()),
                Some(day) => Err(BrokerError::Validation(format!(
                    "day_of_week must be 0-6 (Monday=0), got {day}"
                ))),
                None => Err(BrokerError::Validation(
                    "weekly recurrence requires config.day_of_week".to_string(),
                )),
            },
            RecurrenceType::Monthly => match config.day_of_month {
                Some(day) if (1..=31).contains(&day) => Ok(()),
                Some(day) => Err(BrokerError::Validation(format!(
                    "day_of_month must be 1-31, got {day}"
                ))),
                None => Err(BrokerError::Validation(
                    "monthly recurrence requires config.day_of_month".to_string(),
                )),
            },
        }
    }

    /// Validate a template blueprint.
    pub fn validate_template(template: &NewTemplate) -> Result<()> {
        if template.name.trim().is_empty() {
            return Err(BrokerError::empty_field("name"));
        }
        if template.task_instruction.trim().is_empty() {
            return Err(BrokerError::empty_field("task_instruction"));
        }
        if template.verification_instruction.trim().is_empty() {
            return Err(BrokerError::empty_field("verification_instruction"));
        }
        Ok(())
    }

    /// Validate a comment.
    pub fn validate_comment(comment: &NewComment) -> Result<()> {
        if comment.content.trim().is_empty() {
            return Err(BrokerError::empty_field("content"));
        }
        Self::validate_agent_id(&comment.author_agent)
    }

    /// Validate a tag name.
    pub fn validate_tag_name(name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(BrokerError::empty_field("name"));
        }
        if name.len() > 64 {
            return Err(BrokerError::Validation(
                "Tag name must be at most 64 characters long".to_string(),
            ));
        }
        Ok(())
    }
}

/// Clamp a requested limit into `[1, MAX_QUERY_LIMIT]`, defaulting to
/// [`DEFAULT_QUERY_LIMIT`].
pub fn effective_limit(requested: Option<u32>) -> u32 {
    requested
        .unwrap_or(DEFAULT_QUERY_LIMIT)
        .clamp(1, MAX_QUERY_LIMIT)
}

/// Parse an ISO-8601 timestamp. RFC 3339 values keep their offset; naïve
/// `YYYY-MM-DDTHH:MM:SS` (space-separated accepted) and bare dates are
/// treated as UTC.
pub fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
    let s = s.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    if let Some(midnight) = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
    {
        return Ok(Utc.from_utc_datetime(&midnight));
    }

    Err(BrokerError::Validation(format!(
        "Invalid timestamp '{s}'. Expected ISO-8601, e.g. 2024-05-01T12:00:00Z"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Priority, TaskType};

    #[test]
    fn test_agent_id_validation() {
        assert!(Validator::validate_agent_id("agent-1").is_ok());
        assert!(Validator::validate_agent_id("builder.worker_2").is_ok());
        assert!(Validator::validate_agent_id("system").is_ok());

        assert!(Validator::validate_agent_id("").is_err());
        assert!(Validator::validate_agent_id("   ").is_err());
        assert!(Validator::validate_agent_id("-leading").is_err());
        assert!(Validator::validate_agent_id("trailing-").is_err());
        assert!(Validator::validate_agent_id("has space").is_err());
        assert!(Validator::validate_agent_id(&"x".repeat(65)).is_err());
    }

    #[test]
    fn test_new_task_validation() {
        let mut task = NewTask::new("Title", TaskType::Concrete, "Do", "Check");
        assert!(Validator::validate_new_task(&task).is_ok());

        task.title = "  ".to_string();
        assert!(Validator::validate_new_task(&task).is_err());

        task.title = "Title".to_string();
        task.estimated_hours = Some(0.0);
        assert!(Validator::validate_new_task(&task).is_err());

        task.estimated_hours = Some(1.5);
        assert!(Validator::validate_new_task(&task).is_ok());
    }

    #[test]
    fn test_patch_validation() {
        let mut patch = TaskPatch::default();
        assert!(Validator::validate_patch(&patch).is_ok());

        patch.title = Some("".to_string());
        assert!(Validator::validate_patch(&patch).is_err());

        patch.title = Some("New".to_string());
        patch.priority = Some(Priority::High);
        patch.notes = Some(None); // clearing notes is fine
        assert!(Validator::validate_patch(&patch).is_ok());

        patch.estimated_hours = Some(Some(-1.0));
        assert!(Validator::validate_patch(&patch).is_err());
    }

    #[test]
    fn test_recurrence_validation() {
        let daily = RecurrenceConfig::default();
        assert!(Validator::validate_recurrence(RecurrenceType::Daily, &daily).is_ok());

        let weekly = RecurrenceConfig {
            day_of_week: Some(2),
            day_of_month: None,
        };
        assert!(Validator::validate_recurrence(RecurrenceType::Weekly, &weekly).is_ok());
        assert!(Validator::validate_recurrence(RecurrenceType::Weekly, &daily).is_err());

        let bad_weekly = RecurrenceConfig {
            day_of_week: Some(7),
            day_of_month: None,
        };
        assert!(Validator::validate_recurrence(RecurrenceType::Weekly, &bad_weekly).is_err());

        let monthly = RecurrenceConfig {
            day_of_week: None,
            day_of_month: Some(31),
        };
        assert!(Validator::validate_recurrence(RecurrenceType::Monthly, &monthly).is_ok());

        let bad_monthly = RecurrenceConfig {
            day_of_week: None,
            day_of_month: Some(0),
        };
        assert!(Validator::validate_recurrence(RecurrenceType::Monthly, &bad_monthly).is_err());
    }

    #[test]
    fn test_effective_limit() {
        assert_eq!(effective_limit(None), 100);
        assert_eq!(effective_limit(Some(10)), 10);
        assert_eq!(effective_limit(Some(0)), 1);
        assert_eq!(effective_limit(Some(5000)), 1000);
    }

    #[test]
    fn test_parse_datetime_variants() {
        assert!(parse_datetime("2024-05-01T12:00:00Z").is_ok());
        assert!(parse_datetime("2024-05-01T12:00:00+02:00").is_ok());
        assert!(parse_datetime("2024-05-01T12:00:00").is_ok());
        assert!(parse_datetime("2024-05-01 12:00:00").is_ok());
        assert!(parse_datetime("2024-05-01").is_ok());
        assert!(parse_datetime("not a date").is_err());

        // Naïve input is interpreted as UTC
        let naive = parse_datetime("2024-05-01T12:00:00").unwrap();
        let explicit = parse_datetime("2024-05-01T12:00:00Z").unwrap();
        assert_eq!(naive, explicit);
    }
}
