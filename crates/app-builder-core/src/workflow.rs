use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::app_acl::evaluate_app_permissions;
use crate::directory::{resolve_entity, EntityRef, EntitySet, OrgDirectory};
use crate::ids::{EventId, UserId};
use crate::model::{App, Record, User, WorkflowEvent};
use crate::notify::NotificationEvent;
use crate::process::{ActionDefinition, AssigneeKind, AssigneeSpec, Selection, WorkflowDefinition};
use crate::EngineError;

pub const DEFAULT_STATUS: &str = "Draft";

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct ExecuteRequest {
    pub action_name: String,
    #[serde(default)]
    pub next_assignee_id: Option<UserId>,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub record: Record,
    /// Set only when the record reached a terminal status through someone
    /// other than its creator.
    pub notification: Option<NotificationEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ResolvedAssignees {
    /// Sorted and free of duplicates.
    pub candidates: Vec<UserId>,
    pub selection: Selection,
}

impl ResolvedAssignees {
    #[must_use]
    pub fn requires_choice(&self) -> bool {
        self.selection == Selection::Single && self.candidates.len() > 1
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AssigneePreview {
    pub action: String,
    pub to_status: String,
    pub candidates: Vec<UserId>,
    pub selection: Selection,
    pub requires_choice: bool,
}

/// Status a new record starts in.
///
/// An empty request means [`DEFAULT_STATUS`]. With an enabled workflow, a
/// default request is moved onto the first declared status.
#[must_use]
pub fn initial_status(definition: &WorkflowDefinition, requested: Option<&str>) -> String {
    let requested = requested
        .map(str::trim)
        .filter(|status| !status.is_empty())
        .unwrap_or(DEFAULT_STATUS);

    if definition.enabled() && requested == DEFAULT_STATUS {
        let first = definition
            .statuses()
            .first()
            .map(|status| status.name.trim())
            .filter(|name| !name.is_empty());
        if let Some(first) = first {
            return first.to_string();
        }
    }

    requested.to_string()
}

#[must_use]
pub fn is_terminal_status(definition: &WorkflowDefinition, status: &str) -> bool {
    definition.is_terminal(status)
}

/// Actions that may be taken from `status`, in definition order.
#[must_use]
pub fn available_actions<'a>(
    definition: &'a WorkflowDefinition,
    status: &str,
) -> Vec<&'a ActionDefinition> {
    if !definition.enabled() {
        return Vec::new();
    }
    definition
        .actions()
        .iter()
        .filter(|action| action.from_status == status)
        .collect()
}

/// Resolves who would be assigned by `spec` for this record.
///
/// # Errors
/// Returns [`EngineError::Validation`] when a user-selection field holds
/// something that is not a user id, and propagates directory failures.
pub fn resolve_assignees<D: OrgDirectory + ?Sized>(
    spec: &AssigneeSpec,
    record: &Record,
    directory: &D,
) -> Result<ResolvedAssignees, EngineError> {
    let mut resolved = BTreeSet::new();

    match &spec.kind {
        AssigneeKind::None => {}
        AssigneeKind::Creator => resolved.extend(record.created_by),
        AssigneeKind::Users(user_ids) => resolved.extend(user_ids.iter().copied()),
        AssigneeKind::Field(code) => resolved.extend(field_user_ids(record, code)?),
        AssigneeKind::Entities(entities) => {
            for entity in entities {
                if *entity == EntityRef::Everyone {
                    tracing::warn!(
                        record = %record.id,
                        "ignoring `everyone` in assignee entities; it names no concrete users"
                    );
                    continue;
                }
                match resolve_entity(*entity, record.created_by, directory)? {
                    EntitySet::Users(user_ids) => resolved.extend(user_ids),
                    EntitySet::Everyone => {}
                }
            }
        }
    }

    Ok(ResolvedAssignees {
        candidates: resolved.into_iter().collect(),
        selection: spec.selection,
    })
}

fn field_user_ids(record: &Record, code: &str) -> Result<BTreeSet<UserId>, EngineError> {
    let mut user_ids = BTreeSet::new();
    match record.field(code) {
        None | Some(Value::Null) => {}
        Some(Value::Array(items)) => {
            for item in items {
                user_ids.extend(field_user_id(code, item)?);
            }
        }
        Some(single) => user_ids.extend(field_user_id(code, single)?),
    }
    Ok(user_ids)
}

fn field_user_id(code: &str, value: &Value) -> Result<Option<UserId>, EngineError> {
    match value {
        Value::Null => Ok(None),
        Value::String(raw) if raw.trim().is_empty() => Ok(None),
        Value::String(raw) => UserId::parse(raw).map(Some).map_err(|_| {
            EngineError::Validation(format!("field '{code}' holds an invalid user id: {raw}"))
        }),
        other => Err(EngineError::Validation(format!(
            "field '{code}' must hold user ids, found {other}"
        ))),
    }
}

fn find_transition<'a>(
    definition: &'a WorkflowDefinition,
    action_name: &str,
    status: &str,
) -> Result<&'a ActionDefinition, EngineError> {
    if !definition.enabled() {
        return Err(EngineError::Validation(
            "process management is disabled".to_string(),
        ));
    }
    definition.find_action(action_name, status).ok_or_else(|| {
        EngineError::Validation("action is not allowed from current status".to_string())
    })
}

fn target_assignees<D: OrgDirectory + ?Sized>(
    definition: &WorkflowDefinition,
    action: &ActionDefinition,
    record: &Record,
    directory: &D,
) -> Result<ResolvedAssignees, EngineError> {
    if action.to_status.is_empty() {
        return Err(EngineError::Validation(
            "action must define target status".to_string(),
        ));
    }
    let status = definition.find_status(&action.to_status).ok_or_else(|| {
        EngineError::Validation("target status is not defined in process settings".to_string())
    })?;
    resolve_assignees(&status.assignee, record, directory)
}

fn ensure_actor_can_execute(record: &Record, actor: &User) -> Result<(), EngineError> {
    if actor.is_superuser {
        return Ok(());
    }
    if !record.workflow_approver_ids.is_empty() {
        if record.is_assigned_to(actor.id) {
            return Ok(());
        }
        return Err(EngineError::Forbidden(
            "only current assignee can execute this action".to_string(),
        ));
    }
    if record.is_created_by(actor.id) {
        return Ok(());
    }
    Err(EngineError::Forbidden(
        "only record creator can execute this action".to_string(),
    ))
}

/// Candidates the next status of `action_name` would be assigned to, without
/// executing anything.
///
/// # Errors
/// Fails the same way [`execute_action`] does for an unknown action, an
/// undefined target status, or an unresolvable assignee.
pub fn preview_next_assignees<D: OrgDirectory + ?Sized>(
    app: &App,
    record: &Record,
    action_name: &str,
    directory: &D,
) -> Result<AssigneePreview, EngineError> {
    let definition = &app.process_management;
    let action = find_transition(definition, action_name, &record.status)?;
    let resolved = target_assignees(definition, action, record, directory)?;
    Ok(AssigneePreview {
        action: action.name.clone(),
        to_status: action.to_status.clone(),
        requires_choice: resolved.requires_choice(),
        candidates: resolved.candidates,
        selection: resolved.selection,
    })
}

/// Executes a workflow action against a record and returns the new state.
///
/// The input record is left untouched; callers persist `Transition::record`
/// and deliver `Transition::notification`.
///
/// # Errors
/// Returns [`EngineError::Validation`] for a disabled workflow, an action not
/// available from the current status, an undefined target status or an
/// invalid assignee choice; [`EngineError::Forbidden`] when `actor` may not
/// act on the record; [`EngineError::Directory`] when assignee lookups fail.
pub fn execute_action<D: OrgDirectory + ?Sized>(
    app: &App,
    record: &Record,
    actor: &User,
    request: &ExecuteRequest,
    directory: &D,
    now: OffsetDateTime,
) -> Result<Transition, EngineError> {
    let definition = &app.process_management;
    let action = find_transition(definition, &request.action_name, &record.status)?;
    ensure_actor_can_execute(record, actor)?;
    let resolved = target_assignees(definition, action, record, directory)?;

    let mut approvers = resolved.candidates;
    if !approvers.is_empty() {
        if let Some(selected) = request.next_assignee_id {
            if !approvers.contains(&selected) {
                return Err(EngineError::Validation(
                    "next_assignee_id is not in candidate assignees".to_string(),
                ));
            }
            approvers = vec![selected];
        } else if resolved.selection == Selection::Single && approvers.len() > 1 {
            return Err(EngineError::Validation(
                "next_assignee_id is required for single-select step".to_string(),
            ));
        }
    }

    let to_status = action.to_status.clone();
    let mut next = record.clone();
    next.workflow_history.push(WorkflowEvent {
        event_id: EventId::new(),
        actor_id: actor.id,
        action: request.action_name.clone(),
        from_status: record.status.clone(),
        to_status: to_status.clone(),
        comment: request.comment.clone(),
        at: now,
    });
    if next.workflow_submitted_at.is_none() {
        next.workflow_submitted_at = Some(now);
        next.workflow_requester_id = record.created_by;
    }
    next.workflow_decided_at = if approvers.is_empty() { Some(now) } else { None };
    next.status.clone_from(&to_status);
    next.workflow_approver_ids = approvers;
    next.workflow_current_step = 0;
    next.updated_at = now;

    let notification = if definition.is_terminal(&to_status) {
        next.created_by
            .filter(|creator| *creator != actor.id)
            .map(|creator| {
                NotificationEvent::workflow_terminal(
                    creator,
                    next.app_id,
                    next.id,
                    next.record_number,
                    &request.action_name,
                    &to_status,
                )
            })
    } else {
        None
    };

    tracing::info!(
        record = %record.id,
        actor = %actor.id,
        action = %request.action_name,
        from = %record.status,
        to = %to_status,
        approvers = next.workflow_approver_ids.len(),
        terminal = definition.is_terminal(&to_status),
        "workflow transition"
    );

    Ok(Transition {
        record: next,
        notification,
    })
}

/// Keeps the records awaiting `user` in apps that `user` can still view.
#[must_use]
pub fn filter_pending_for_user(records: Vec<Record>, apps: &[App], user: &User) -> Vec<Record> {
    records
        .into_iter()
        .filter(|record| record.is_assigned_to(user.id))
        .filter(|record| {
            apps.iter()
                .find(|app| app.id == record.app_id)
                .is_some_and(|app| evaluate_app_permissions(app, user).view)
        })
        .collect()
}
