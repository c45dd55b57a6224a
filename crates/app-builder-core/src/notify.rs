use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::ids::{AppId, NotificationId, RecordId, UserId};
use crate::EngineError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    WorkflowTerminal,
}

impl NotificationKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WorkflowTerminal => "workflow_terminal",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "workflow_terminal" => Some(Self::WorkflowTerminal),
            _ => None,
        }
    }
}

/// Emitted by the workflow engine; the `event_id` lets sinks deduplicate.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NotificationEvent {
    pub event_id: NotificationId,
    pub user_id: UserId,
    pub app_id: AppId,
    pub record_id: RecordId,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
}

impl NotificationEvent {
    #[must_use]
    pub fn workflow_terminal(
        recipient: UserId,
        app_id: AppId,
        record_id: RecordId,
        record_number: i64,
        action_name: &str,
        to_status: &str,
    ) -> Self {
        Self {
            event_id: NotificationId::new(),
            user_id: recipient,
            app_id,
            record_id,
            kind: NotificationKind::WorkflowTerminal,
            title: format!("Record #{record_number} is now {to_status}"),
            message: format!(
                "Action \"{action_name}\" was executed and the record reached its final status \"{to_status}\"."
            ),
        }
    }
}

/// A delivered notification as kept in a user's inbox.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Notification {
    pub id: NotificationId,
    pub user_id: UserId,
    pub app_id: Option<AppId>,
    pub record_id: Option<RecordId>,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub read_at: Option<OffsetDateTime>,
}

impl Notification {
    #[must_use]
    pub fn is_read(&self) -> bool {
        self.read_at.is_some()
    }
}

/// Delivery boundary for engine notifications.
pub trait NotificationSink {
    /// # Errors
    /// Returns an error when the event could not be accepted for delivery.
    fn deliver(&mut self, event: &NotificationEvent) -> Result<(), EngineError>;
}

impl NotificationSink for Vec<NotificationEvent> {
    fn deliver(&mut self, event: &NotificationEvent) -> Result<(), EngineError> {
        if !self.iter().any(|existing| existing.event_id == event.event_id) {
            self.push(event.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_event_mentions_record_and_status() {
        let event = NotificationEvent::workflow_terminal(
            UserId::new(),
            AppId::new(),
            RecordId::new(),
            42,
            "Final Approve",
            "Approved",
        );
        assert_eq!(event.kind.as_str(), "workflow_terminal");
        assert_eq!(event.title, "Record #42 is now Approved");
        assert!(event.message.contains("\"Final Approve\""));
    }

    #[test]
    fn vec_sink_deduplicates_by_event_id() {
        let event = NotificationEvent::workflow_terminal(
            UserId::new(),
            AppId::new(),
            RecordId::new(),
            1,
            "Approve",
            "Done",
        );
        let mut sink: Vec<NotificationEvent> = Vec::new();
        for _ in 0..2 {
            if let Err(err) = sink.deliver(&event) {
                panic!("deliver: {err}");
            }
        }
        assert_eq!(sink.len(), 1);
    }
}
