use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::directory::EntityRef;
use crate::ids::UserId;
use crate::model::{FieldDefinition, FieldType};
use crate::EngineError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Selection {
    Single,
    #[default]
    All,
}

impl Selection {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::All => "all",
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub enum AssigneeKind {
    /// Nobody is assigned; entering the status decides the record.
    #[default]
    None,
    Creator,
    Users(Vec<UserId>),
    Field(String),
    Entities(Vec<EntityRef>),
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(try_from = "RawAssignee", into = "RawAssignee")]
pub struct AssigneeSpec {
    pub kind: AssigneeKind,
    pub selection: Selection,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct RawAssignee {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    selection: Option<Selection>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    user_ids: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    field_code: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    entities: Vec<EntityRef>,
}

impl TryFrom<RawAssignee> for AssigneeSpec {
    type Error = EngineError;

    fn try_from(raw: RawAssignee) -> Result<Self, Self::Error> {
        let kind = match raw.kind.as_deref().map(str::trim).unwrap_or_default() {
            "" => AssigneeKind::None,
            "creator" => AssigneeKind::Creator,
            "users" => AssigneeKind::Users(raw.user_ids),
            "field" => {
                let code = raw
                    .field_code
                    .map(|code| code.trim().to_string())
                    .filter(|code| !code.is_empty())
                    .ok_or_else(|| {
                        EngineError::Validation(
                            "assignee.type=field requires field_code".to_string(),
                        )
                    })?;
                AssigneeKind::Field(code)
            }
            "entities" => AssigneeKind::Entities(raw.entities),
            other => {
                return Err(EngineError::Validation(format!(
                    "unsupported assignee type: {other}"
                )))
            }
        };

        Ok(Self {
            kind,
            selection: raw.selection.unwrap_or_default(),
        })
    }
}

impl From<AssigneeSpec> for RawAssignee {
    fn from(spec: AssigneeSpec) -> Self {
        let selection = Some(spec.selection);
        match spec.kind {
            // The default selection is implied by an empty document.
            AssigneeKind::None => Self {
                selection: selection.filter(|value| *value != Selection::default()),
                ..Self::default()
            },
            AssigneeKind::Creator => Self {
                kind: Some("creator".to_string()),
                selection,
                ..Self::default()
            },
            AssigneeKind::Users(user_ids) => Self {
                kind: Some("users".to_string()),
                selection,
                user_ids,
                ..Self::default()
            },
            AssigneeKind::Field(field_code) => Self {
                kind: Some("field".to_string()),
                selection,
                field_code: Some(field_code),
                ..Self::default()
            },
            AssigneeKind::Entities(entities) => Self {
                kind: Some("entities".to_string()),
                selection,
                entities,
                ..Self::default()
            },
        }
    }
}

impl AssigneeSpec {
    #[must_use]
    pub fn new(kind: AssigneeKind, selection: Selection) -> Self {
        Self { kind, selection }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StatusDefinition {
    pub name: String,
    #[serde(default)]
    pub assignee: AssigneeSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ActionDefinition {
    pub name: String,
    #[serde(default, alias = "from")]
    pub from_status: String,
    #[serde(default, alias = "to")]
    pub to_status: String,
}

/// An app's status/action graph. Treated as an immutable value: edits build a
/// new definition and replace the old one wholesale.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct WorkflowDefinition {
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    statuses: Vec<StatusDefinition>,
    #[serde(default)]
    actions: Vec<ActionDefinition>,
}

impl WorkflowDefinition {
    #[must_use]
    pub fn new(
        enabled: bool,
        statuses: Vec<StatusDefinition>,
        actions: Vec<ActionDefinition>,
    ) -> Self {
        Self {
            enabled,
            statuses,
            actions,
        }
    }

    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Decodes a definition document. A JSON `null` yields the disabled default.
    ///
    /// # Errors
    /// Returns [`EngineError::Validation`] when the document has an unknown
    /// assignee type, entity type, or an otherwise malformed shape.
    pub fn from_json(value: &Value) -> Result<Self, EngineError> {
        if value.is_null() {
            return Ok(Self::disabled());
        }
        serde_json::from_value(value.clone()).map_err(|err| {
            EngineError::Validation(format!("invalid process definition: {err}"))
        })
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    #[must_use]
    pub fn statuses(&self) -> &[StatusDefinition] {
        &self.statuses
    }

    #[must_use]
    pub fn actions(&self) -> &[ActionDefinition] {
        &self.actions
    }

    #[must_use]
    pub fn find_status(&self, name: &str) -> Option<&StatusDefinition> {
        self.statuses.iter().find(|status| status.name == name)
    }

    /// First action named `name` leaving `from_status`.
    #[must_use]
    pub fn find_action(&self, name: &str, from_status: &str) -> Option<&ActionDefinition> {
        self.actions
            .iter()
            .find(|action| action.name == name && action.from_status == from_status)
    }

    /// A status is terminal when no action leaves it, whether or not the
    /// status itself is declared.
    #[must_use]
    pub fn is_terminal(&self, status: &str) -> bool {
        !self.actions.iter().any(|action| action.from_status == status)
    }
}

/// Rejects definitions whose field-based assignees point at a missing or
/// non-`USER_SELECTION` field. Nothing else blocks a save.
///
/// # Errors
/// Returns [`EngineError::Validation`] naming the offending status and field.
pub fn validate_process_definition(
    definition: &WorkflowDefinition,
    fields: &[FieldDefinition],
) -> Result<(), EngineError> {
    for status in definition.statuses() {
        let AssigneeKind::Field(code) = &status.assignee.kind else {
            continue;
        };
        match fields.iter().find(|field| &field.code == code) {
            None => {
                return Err(EngineError::Validation(format!(
                    "status '{}': assignee field '{code}' does not exist",
                    status.name
                )))
            }
            Some(field) if field.field_type != FieldType::UserSelection => {
                return Err(EngineError::Validation(format!(
                    "status '{}': assignee field '{code}' must be USER_SELECTION (found {})",
                    status.name,
                    field.field_type.as_str()
                )))
            }
            Some(_) => {}
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum DefinitionWarning {
    UndefinedFromStatus { action: String, status: String },
    UndefinedToStatus { action: String, status: String },
    DuplicateAction { action: String, from_status: String },
    DuplicateStatus { status: String },
}

/// Reports suspicious but accepted definition shapes.
#[must_use]
pub fn lint_process_definition(definition: &WorkflowDefinition) -> Vec<DefinitionWarning> {
    let mut warnings = Vec::new();

    let mut seen_statuses = BTreeSet::new();
    for status in definition.statuses() {
        if !seen_statuses.insert(status.name.as_str()) {
            warnings.push(DefinitionWarning::DuplicateStatus {
                status: status.name.clone(),
            });
        }
    }

    let mut seen_actions = BTreeSet::new();
    for action in definition.actions() {
        if !seen_statuses.contains(action.from_status.as_str()) {
            warnings.push(DefinitionWarning::UndefinedFromStatus {
                action: action.name.clone(),
                status: action.from_status.clone(),
            });
        }
        if !seen_statuses.contains(action.to_status.as_str()) {
            warnings.push(DefinitionWarning::UndefinedToStatus {
                action: action.name.clone(),
                status: action.to_status.clone(),
            });
        }
        if !seen_actions.insert((action.name.as_str(), action.from_status.as_str())) {
            warnings.push(DefinitionWarning::DuplicateAction {
                action: action.name.clone(),
                from_status: action.from_status.clone(),
            });
        }
    }

    warnings
}
