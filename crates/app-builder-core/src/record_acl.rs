use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::directory::EntityRef;
use crate::ids::UserId;
use crate::model::{Record, User};
use crate::EngineError;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(from = "String", into = "String")]
pub enum ConditionOperator {
    Equals,
    /// Kept so stored rules round-trip; rules using it never apply. A
    /// condition without an operator decodes to `Unsupported("")`.
    Unsupported(String),
}

impl From<String> for ConditionOperator {
    fn from(value: String) -> Self {
        if value == "=" {
            Self::Equals
        } else {
            Self::Unsupported(value)
        }
    }
}

impl From<ConditionOperator> for String {
    fn from(value: ConditionOperator) -> Self {
        match value {
            ConditionOperator::Equals => "=".to_string(),
            ConditionOperator::Unsupported(raw) => raw,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(try_from = "RawCondition", into = "RawCondition")]
pub struct RecordCondition {
    pub field: String,
    pub operator: ConditionOperator,
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawCondition {
    field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    operator: Option<ConditionOperator>,
    #[serde(default)]
    value: Value,
}

impl TryFrom<RawCondition> for RecordCondition {
    type Error = EngineError;

    fn try_from(raw: RawCondition) -> Result<Self, Self::Error> {
        if raw.field.trim().is_empty() {
            return Err(EngineError::Validation(
                "condition.field must not be empty".to_string(),
            ));
        }
        // Field codes become JSON path segments when compiled to SQL.
        if raw.field.contains('"') {
            return Err(EngineError::Validation(format!(
                "condition.field must not contain '\"': {}",
                raw.field
            )));
        }
        Ok(Self {
            field: raw.field,
            operator: raw
                .operator
                .unwrap_or_else(|| ConditionOperator::Unsupported(String::new())),
            value: raw.value,
        })
    }
}

impl From<RecordCondition> for RawCondition {
    fn from(condition: RecordCondition) -> Self {
        Self {
            field: condition.field,
            operator: match condition.operator {
                ConditionOperator::Unsupported(raw) if raw.is_empty() => None,
                operator => Some(operator),
            },
            value: condition.value,
        }
    }
}

impl RecordCondition {
    /// The equality test this condition stands for, or `None` when the
    /// operator is not supported and the owning rule must be skipped.
    #[must_use]
    pub fn equality(&self) -> Option<FieldEquals> {
        match self.operator {
            ConditionOperator::Equals => Some(FieldEquals {
                field: self.field.clone(),
                expected: coerce_condition_text(&self.value),
            }),
            ConditionOperator::Unsupported(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct RecordViewPermissions {
    #[serde(default)]
    pub view: Vec<EntityRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordAclRule {
    #[serde(default)]
    pub condition: Option<RecordCondition>,
    #[serde(default)]
    pub permissions: RecordViewPermissions,
}

impl RecordAclRule {
    fn applicable_test(&self) -> Option<FieldEquals> {
        self.condition.as_ref().and_then(RecordCondition::equality)
    }

    /// What this rule decides for `user` once its condition holds.
    #[must_use]
    pub fn grant_for(&self, user: &User) -> ViewGrant {
        let mut includes_creator = false;
        for entity in &self.permissions.view {
            match entity {
                EntityRef::Creator => includes_creator = true,
                other => {
                    if other.matches_user(user, None) {
                        return ViewGrant::Allow;
                    }
                }
            }
        }
        if includes_creator {
            ViewGrant::Creator(user.id)
        } else {
            ViewGrant::Deny
        }
    }
}

/// Text form used on both sides of an `=` comparison. `None` never matches.
#[must_use]
pub fn coerce_condition_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Array(_) | Value::Object(_) => serde_json::to_string(value).ok(),
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FieldEquals {
    pub field: String,
    pub expected: Option<String>,
}

impl FieldEquals {
    #[must_use]
    pub fn matches(&self, data: &Map<String, Value>) -> bool {
        let Some(expected) = self.expected.as_deref() else {
            return false;
        };
        data.get(&self.field)
            .and_then(coerce_condition_text)
            .is_some_and(|actual| actual == expected)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ViewGrant {
    Allow,
    Deny,
    /// Allowed only when the record was created by this user.
    Creator(UserId),
}

impl ViewGrant {
    #[must_use]
    pub fn allows(self, record: &Record) -> bool {
        match self {
            Self::Allow => true,
            Self::Deny => false,
            Self::Creator(user_id) => record.is_created_by(user_id),
        }
    }
}

/// Decides whether `user` may view `record`.
///
/// Rules are scanned in order; the first one whose condition holds decides.
/// Rules without a condition or with an unsupported operator are skipped, and
/// when no rule applies the record is visible.
#[must_use]
pub fn can_view_record(record: &Record, user: &User, rules: &[RecordAclRule]) -> bool {
    if user.is_superuser || rules.is_empty() {
        return true;
    }

    for (index, rule) in rules.iter().enumerate() {
        let Some(test) = rule.applicable_test() else {
            continue;
        };
        if !test.matches(&record.data) {
            continue;
        }
        let allowed = rule.grant_for(user).allows(record);
        tracing::debug!(
            record = %record.id,
            user = %user.id,
            rule = index,
            allowed,
            "record acl rule applied"
        );
        return allowed;
    }

    true
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ViewClause {
    /// Conditions of earlier rules, all of which must fail.
    pub unmatched: Vec<FieldEquals>,
    /// Condition of the deciding rule; `None` for the fallback clause.
    pub matched: Option<FieldEquals>,
    pub grant: ViewGrant,
}

impl ViewClause {
    fn matches(&self, record: &Record) -> bool {
        self.unmatched.iter().all(|test| !test.matches(&record.data))
            && self
                .matched
                .as_ref()
                .map_or(true, |test| test.matches(&record.data))
            && self.grant.allows(record)
    }
}

/// Listing predicate equivalent to [`can_view_record`] for one user, shaped
/// as an OR of clauses so storage adapters can compile it.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RecordViewFilter {
    AllowAll,
    AnyOf(Vec<ViewClause>),
}

impl RecordViewFilter {
    #[must_use]
    pub fn for_user(rules: &[RecordAclRule], user: &User) -> Self {
        if user.is_superuser {
            return Self::AllowAll;
        }

        let applicable: Vec<(FieldEquals, ViewGrant)> = rules
            .iter()
            .filter_map(|rule| {
                rule.applicable_test()
                    .map(|test| (test, rule.grant_for(user)))
            })
            .collect();
        if applicable.is_empty() {
            return Self::AllowAll;
        }

        let mut clauses = Vec::with_capacity(applicable.len() + 1);
        for (index, (test, grant)) in applicable.iter().enumerate() {
            clauses.push(ViewClause {
                unmatched: applicable[..index]
                    .iter()
                    .map(|(earlier, _)| earlier.clone())
                    .collect(),
                matched: Some(test.clone()),
                grant: *grant,
            });
        }
        clauses.push(ViewClause {
            unmatched: applicable.into_iter().map(|(test, _)| test).collect(),
            matched: None,
            grant: ViewGrant::Allow,
        });

        Self::AnyOf(clauses)
    }

    #[must_use]
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Self::AllowAll => true,
            Self::AnyOf(clauses) => clauses.iter().any(|clause| clause.matches(record)),
        }
    }
}
