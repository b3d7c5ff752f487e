use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::AgentConfig;
use crate::ids::{SessionId, UserId};
use crate::metrics::SessionMetrics;

/// Lifecycle status of an agent session.
///
/// ARCHIVED is the only dead end; COMPLETED, FAILED and TERMINATED are
/// terminal for the conversation but may still move to ARCHIVED.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Connecting,
    Active,
    Waiting,
    Processing,
    Paused,
    Completed,
    Failed,
    Terminated,
    Archived,
}

impl SessionStatus {
    /// Targets reachable from this status.
    pub fn allowed_targets(&self) -> &'static [SessionStatus] {
        use SessionStatus::*;
        match self {
            Created => &[Connecting, Terminated],
            Connecting => &[Active, Failed],
            Active => &[Waiting, Processing, Paused, Completed, Failed, Terminated],
            Waiting => &[Active, Processing, Terminated],
            Processing => &[Active, Completed, Failed],
            Paused => &[Active, Terminated],
            Completed | Failed | Terminated => &[Archived],
            Archived => &[],
        }
    }

    pub fn can_transition_to(&self, target: SessionStatus) -> bool {
        self.allowed_targets().contains(&target)
    }

    /// Conversation is over; only archival remains.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Terminated)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Waiting => "waiting",
            Self::Processing => "processing",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
            Self::Archived => "archived",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "connecting" => Ok(Self::Connecting),
            "active" => Ok(Self::Active),
            "waiting" => Ok(Self::Waiting),
            "processing" => Ok(Self::Processing),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "terminated" => Ok(Self::Terminated),
            "archived" => Ok(Self::Archived),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// How the session was started.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    #[default]
    Interactive,
    NonInteractive,
    Forked,
}

impl std::fmt::Display for SessionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interactive => f.write_str("interactive"),
            Self::NonInteractive => f.write_str("non_interactive"),
            Self::Forked => f.write_str("forked"),
        }
    }
}

impl std::str::FromStr for SessionMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "interactive" => Ok(Self::Interactive),
            "non_interactive" => Ok(Self::NonInteractive),
            "forked" => Ok(Self::Forked),
            other => Err(format!("unknown session mode: {other}")),
        }
    }
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: SessionStatus, to: SessionStatus },
}

/// One logical, stateful conversation against the external agent runtime.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub user_id: UserId,
    pub mode: SessionMode,
    pub status: SessionStatus,
    pub working_directory: String,
    pub config: AgentConfig,
    pub metrics: SessionMetrics,
    /// Lineage back-reference for forked sessions. Never an ownership edge.
    pub parent_session_id: Option<SessionId>,
    pub error: Option<String>,
    pub result: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl Session {
    pub fn new(user_id: UserId, mode: SessionMode, config: AgentConfig, working_directory: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            user_id,
            mode,
            status: SessionStatus::Created,
            working_directory: working_directory.into(),
            config,
            metrics: SessionMetrics::default(),
            parent_session_id: None,
            error: None,
            result: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            duration_ms: None,
        }
    }

    /// Move to `target` if the transition table allows it.
    ///
    /// First entry to ACTIVE stamps `started_at`; entry to any terminal
    /// status stamps `completed_at` and fixes the duration (zero when the
    /// session never started).
    pub fn transition(&mut self, target: SessionStatus) -> Result<(), SessionError> {
        if !self.status.can_transition_to(target) {
            return Err(SessionError::InvalidTransition {
                from: self.status,
                to: target,
            });
        }

        let now = Utc::now();
        if target == SessionStatus::Active && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if target.is_terminal() {
            self.completed_at = Some(now);
            self.duration_ms = Some(
                self.started_at
                    .map_or(0, |started| (now - started).num_milliseconds().max(0)),
            );
        }
        self.status = target;
        self.updated_at = now;
        Ok(())
    }

    // Metric mutators are independent of the state machine.

    pub fn record_message(&mut self) {
        self.metrics.message_count += 1;
        self.updated_at = Utc::now();
    }

    pub fn record_tool_call(&mut self) {
        self.metrics.tool_call_count += 1;
        self.updated_at = Utc::now();
    }

    pub fn set_error(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.metrics.error_count += 1;
        self.updated_at = Utc::now();
    }
}
