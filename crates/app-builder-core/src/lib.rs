//! Access-control and workflow engine for App Builder apps.
//!
//! Everything in this crate is a pure function over values. Storage, the
//! organizational directory and notification delivery are reached through the
//! [`OrgDirectory`] and [`NotificationSink`] traits.

use time::{OffsetDateTime, UtcOffset};

mod app_acl;
mod directory;
mod ids;
mod model;
mod notify;
mod process;
mod record_acl;
mod workflow;

pub use app_acl::{evaluate_app_permissions, AppAclRule, AppPermissions};
pub use directory::{resolve_entity, EntityRef, EntitySet, OrgDirectory, StaticDirectory};
pub use ids::{AppId, DepartmentId, EventId, JobTitleId, NotificationId, RecordId, UserId};
pub use model::{App, FieldDefinition, FieldType, Record, User, WorkflowEvent};
pub use notify::{Notification, NotificationEvent, NotificationKind, NotificationSink};
pub use process::{
    lint_process_definition, validate_process_definition, ActionDefinition, AssigneeKind,
    AssigneeSpec, DefinitionWarning, Selection, StatusDefinition, WorkflowDefinition,
};
pub use record_acl::{
    can_view_record, coerce_condition_text, ConditionOperator, FieldEquals, RecordAclRule,
    RecordCondition, RecordViewFilter, RecordViewPermissions, ViewClause, ViewGrant,
};
pub use workflow::{
    available_actions, execute_action, filter_pending_for_user, initial_status,
    is_terminal_status, preview_next_assignees, resolve_assignees, AssigneePreview,
    ExecuteRequest, ResolvedAssignees, Transition, DEFAULT_STATUS,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum EngineError {
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("directory error: {0}")]
    Directory(String),
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ErrorKind {
    Forbidden,
    BadRequest,
    NotFound,
    Transient,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Forbidden => "forbidden",
            Self::BadRequest => "bad_request",
            Self::NotFound => "not_found",
            Self::Transient => "transient",
        }
    }
}

impl EngineError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::Validation(_) => ErrorKind::BadRequest,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Directory(_) | Self::Storage(_) => ErrorKind::Transient,
        }
    }

    /// Only directory and storage failures are worth retrying; the engine
    /// itself never retries.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Directory(_) | Self::Storage(_))
    }

    /// Human-readable reason without the kind prefix.
    #[must_use]
    pub fn reason(&self) -> &str {
        match self {
            Self::Forbidden(reason)
            | Self::Validation(reason)
            | Self::NotFound(reason)
            | Self::Directory(reason)
            | Self::Storage(reason) => reason,
        }
    }
}

/// Parses an RFC3339 timestamp and enforces a UTC offset.
///
/// # Errors
/// Returns [`EngineError::Validation`] when the value is not RFC3339 or not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, EngineError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| EngineError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(EngineError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`EngineError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, EngineError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| EngineError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_map_to_stable_codes() {
        assert_eq!(
            EngineError::Forbidden("x".to_string()).kind().as_str(),
            "forbidden"
        );
        assert_eq!(
            EngineError::Validation("x".to_string()).kind().as_str(),
            "bad_request"
        );
        assert_eq!(
            EngineError::NotFound("x".to_string()).kind().as_str(),
            "not_found"
        );
        assert_eq!(
            EngineError::Directory("x".to_string()).kind().as_str(),
            "transient"
        );
    }

    #[test]
    fn only_directory_and_storage_errors_are_retryable() {
        assert!(EngineError::Directory("down".to_string()).is_retryable());
        assert!(EngineError::Storage("locked".to_string()).is_retryable());
        assert_eq!(
            EngineError::Storage("locked".to_string()).kind(),
            ErrorKind::Transient
        );
        assert!(!EngineError::Validation("bad".to_string()).is_retryable());
        assert!(!EngineError::Forbidden("no".to_string()).is_retryable());
    }

    #[test]
    fn parse_rfc3339_rejects_non_utc_offsets() {
        assert!(parse_rfc3339_utc("2026-02-07T12:00:00Z").is_ok());
        assert!(parse_rfc3339_utc("2026-02-07T12:00:00+09:00").is_err());
    }
}
