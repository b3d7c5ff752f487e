use serde::{Deserialize, Serialize};

use crate::ids::{MessageId, SessionId, ToolCallId};
use crate::session::SessionStatus;

/// Events fanned out to live subscribers over the broadcast boundary.
/// Absence of subscribers is a no-op; nothing in the broker depends on a
/// receiver existing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerEvent {
    SessionStatusChanged {
        session_id: SessionId,
        from: SessionStatus,
        to: SessionStatus,
    },
    MessageAppended {
        session_id: SessionId,
        message_id: MessageId,
        role: String,
        sequence: i64,
    },
    AssistantText {
        session_id: SessionId,
        text: String,
    },
    ToolCallStarted {
        session_id: SessionId,
        tool_call_id: ToolCallId,
        tool_name: String,
    },
    ToolCallResolved {
        session_id: SessionId,
        tool_call_id: ToolCallId,
        status: String,
    },
    SessionFailed {
        session_id: SessionId,
        error: String,
    },
    SessionArchived {
        session_id: SessionId,
    },
}

impl BrokerEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::SessionStatusChanged { .. } => "session_status_changed",
            Self::MessageAppended { .. } => "message_appended",
            Self::AssistantText { .. } => "assistant_text",
            Self::ToolCallStarted { .. } => "tool_call_started",
            Self::ToolCallResolved { .. } => "tool_call_resolved",
            Self::SessionFailed { .. } => "session_failed",
            Self::SessionArchived { .. } => "session_archived",
        }
    }

    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::SessionStatusChanged { session_id, .. }
            | Self::MessageAppended { session_id, .. }
            | Self::AssistantText { session_id, .. }
            | Self::ToolCallStarted { session_id, .. }
            | Self::ToolCallResolved { session_id, .. }
            | Self::SessionFailed { session_id, .. }
            | Self::SessionArchived { session_id } => session_id,
        }
    }
}
