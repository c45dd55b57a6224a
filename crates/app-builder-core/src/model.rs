use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::app_acl::AppAclRule;
use crate::ids::{AppId, DepartmentId, EventId, JobTitleId, RecordId, UserId};
use crate::process::WorkflowDefinition;
use crate::record_acl::RecordAclRule;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct User {
    pub id: UserId,
    pub email: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub is_superuser: bool,
    #[serde(default)]
    pub department_id: Option<DepartmentId>,
    #[serde(default)]
    pub job_title_id: Option<JobTitleId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct App {
    pub id: AppId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Legacy apps may have no recorded creator.
    #[serde(default)]
    pub created_by: Option<UserId>,
    #[serde(default)]
    pub app_acl: Vec<AppAclRule>,
    #[serde(default)]
    pub record_acl: Vec<RecordAclRule>,
    #[serde(default)]
    pub process_management: WorkflowDefinition,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldType {
    SingleLineText,
    Number,
    MultiLineText,
    Date,
    Datetime,
    Checkbox,
    RadioButton,
    DropDown,
    File,
    Label,
    Link,
    Reference,
    UserSelection,
}

impl FieldType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SingleLineText => "SINGLE_LINE_TEXT",
            Self::Number => "NUMBER",
            Self::MultiLineText => "MULTI_LINE_TEXT",
            Self::Date => "DATE",
            Self::Datetime => "DATETIME",
            Self::Checkbox => "CHECKBOX",
            Self::RadioButton => "RADIO_BUTTON",
            Self::DropDown => "DROP_DOWN",
            Self::File => "FILE",
            Self::Label => "LABEL",
            Self::Link => "LINK",
            Self::Reference => "REFERENCE",
            Self::UserSelection => "USER_SELECTION",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "SINGLE_LINE_TEXT" => Some(Self::SingleLineText),
            "NUMBER" => Some(Self::Number),
            "MULTI_LINE_TEXT" => Some(Self::MultiLineText),
            "DATE" => Some(Self::Date),
            "DATETIME" => Some(Self::Datetime),
            "CHECKBOX" => Some(Self::Checkbox),
            "RADIO_BUTTON" => Some(Self::RadioButton),
            "DROP_DOWN" => Some(Self::DropDown),
            "FILE" => Some(Self::File),
            "LABEL" => Some(Self::Label),
            "LINK" => Some(Self::Link),
            "REFERENCE" => Some(Self::Reference),
            "USER_SELECTION" => Some(Self::UserSelection),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldDefinition {
    pub code: String,
    pub label: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub config: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowEvent {
    pub event_id: EventId,
    pub actor_id: UserId,
    pub action: String,
    pub from_status: String,
    pub to_status: String,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    pub id: RecordId,
    pub app_id: AppId,
    pub record_number: i64,
    pub data: Map<String, Value>,
    pub status: String,
    #[serde(default)]
    pub created_by: Option<UserId>,
    #[serde(default)]
    pub workflow_requester_id: Option<UserId>,
    /// Sorted and free of duplicates.
    #[serde(default)]
    pub workflow_approver_ids: Vec<UserId>,
    #[serde(default)]
    pub workflow_current_step: u32,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub workflow_submitted_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub workflow_decided_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub workflow_history: Vec<WorkflowEvent>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    /// Optimistic concurrency token, bumped on every persisted change.
    #[serde(default)]
    pub revision: i64,
}

impl Record {
    /// A fresh record as it looks before its first workflow transition.
    #[must_use]
    pub fn new(
        app_id: AppId,
        record_number: i64,
        data: Map<String, Value>,
        status: String,
        created_by: Option<UserId>,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            id: RecordId::new(),
            app_id,
            record_number,
            data,
            status,
            created_by,
            workflow_requester_id: None,
            workflow_approver_ids: Vec::new(),
            workflow_current_step: 0,
            workflow_submitted_at: None,
            workflow_decided_at: None,
            workflow_history: Vec::new(),
            created_at: now,
            updated_at: now,
            revision: 0,
        }
    }

    #[must_use]
    pub fn field(&self, code: &str) -> Option<&Value> {
        self.data.get(code)
    }

    #[must_use]
    pub fn is_assigned_to(&self, user_id: UserId) -> bool {
        self.workflow_approver_ids.contains(&user_id)
    }

    #[must_use]
    pub fn is_created_by(&self, user_id: UserId) -> bool {
        self.created_by == Some(user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_type_codes_round_trip_through_parse() {
        for field_type in [
            FieldType::SingleLineText,
            FieldType::Number,
            FieldType::UserSelection,
            FieldType::DropDown,
        ] {
            assert_eq!(FieldType::parse(field_type.as_str()), Some(field_type));
        }
        assert_eq!(FieldType::parse("user_selection"), None);
    }

    #[test]
    fn field_definition_uses_type_key() {
        let decoded: FieldDefinition = match serde_json::from_value(serde_json::json!({
            "code": "manager",
            "label": "Manager",
            "type": "USER_SELECTION"
        })) {
            Ok(value) => value,
            Err(err) => panic!("decode: {err}"),
        };
        assert_eq!(decoded.field_type, FieldType::UserSelection);
        assert!(!decoded.required);
    }
}
