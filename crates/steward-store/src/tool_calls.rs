use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use steward_core::ids::{MessageId, SessionId, ToolCallId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Pending,
    Running,
    Success,
    Error,
    Denied,
}

impl ToolCallStatus {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Denied)
    }
}

impl std::fmt::Display for ToolCallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
            Self::Denied => "denied",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for ToolCallStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            "denied" => Ok(Self::Denied),
            other => Err(format!("unknown tool call status: {other}")),
        }
    }
}

/// A stored tool invocation. Created pending when the tool-use event
/// arrives; resolved exactly once by the matching tool-result.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCallRow {
    pub id: String,
    pub session_id: SessionId,
    pub message_id: Option<MessageId>,
    pub tool_use_id: ToolCallId,
    pub tool_name: String,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub status: ToolCallStatus,
    pub created_at: String,
    pub resolved_at: Option<String>,
    pub duration_ms: Option<i64>,
}

pub struct ToolCallRepo {
    db: Database,
}

impl ToolCallRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Record a tool-use event as a pending call.
    #[instrument(skip(self, input), fields(session_id = %session_id, tool_name, tool_use_id = %tool_use_id))]
    pub fn insert_pending(
        &self,
        session_id: &SessionId,
        message_id: Option<&MessageId>,
        tool_use_id: &ToolCallId,
        tool_name: &str,
        input: &serde_json::Value,
    ) -> Result<ToolCallRow, StoreError> {
        let id = format!("tc_{}", uuid::Uuid::now_v7());
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO tool_calls (id, session_id, message_id, tool_use_id, tool_name, input, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7)",
                rusqlite::params![
                    id,
                    session_id.as_str(),
                    message_id.map(|m| m.as_str()),
                    tool_use_id.as_str(),
                    tool_name,
                    serde_json::to_string(input)?,
                    now,
                ],
            )?;

            Ok(ToolCallRow {
                id: id.clone(),
                session_id: session_id.clone(),
                message_id: message_id.cloned(),
                tool_use_id: tool_use_id.clone(),
                tool_name: tool_name.to_string(),
                input: input.clone(),
                output: None,
                status: ToolCallStatus::Pending,
                created_at: now.clone(),
                resolved_at: None,
                duration_ms: None,
            })
        })
    }

    /// Resolve the pending call matching `tool_use_id`. Returns the updated
    /// row, or `None` when no pending call matches (the caller logs and
    /// discards the orphan result).
    #[instrument(skip(self, output), fields(session_id = %session_id, tool_use_id = %tool_use_id, status = %status))]
    pub fn resolve(
        &self,
        session_id: &SessionId,
        tool_use_id: &ToolCallId,
        output: &serde_json::Value,
        status: ToolCallStatus,
    ) -> Result<Option<ToolCallRow>, StoreError> {
        debug_assert!(status.is_resolved());
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE tool_calls SET
                    output = ?1, status = ?2, resolved_at = ?3,
                    duration_ms = CAST((julianday(?3) - julianday(created_at)) * 86400000 AS INTEGER)
                 WHERE session_id = ?4 AND tool_use_id = ?5 AND status IN ('pending', 'running')",
                rusqlite::params![
                    serde_json::to_string(output)?,
                    status.to_string(),
                    now,
                    session_id.as_str(),
                    tool_use_id.as_str(),
                ],
            )?;
            if updated == 0 {
                return Ok(None);
            }
            self.get_by_tool_use_id_inner(conn, session_id, tool_use_id)
                .map(Some)
        })
    }

    #[instrument(skip(self), fields(session_id = %session_id, tool_use_id = %tool_use_id))]
    pub fn get_by_tool_use_id(
        &self,
        session_id: &SessionId,
        tool_use_id: &ToolCallId,
    ) -> Result<ToolCallRow, StoreError> {
        self.db
            .with_conn(|conn| self.get_by_tool_use_id_inner(conn, session_id, tool_use_id))
    }

    fn get_by_tool_use_id_inner(
        &self,
        conn: &rusqlite::Connection,
        session_id: &SessionId,
        tool_use_id: &ToolCallId,
    ) -> Result<ToolCallRow, StoreError> {
        let mut stmt = conn.prepare(
            "SELECT id, session_id, message_id, tool_use_id, tool_name, input, output, status,
                    created_at, resolved_at, duration_ms
             FROM tool_calls WHERE session_id = ?1 AND tool_use_id = ?2",
        )?;
        let mut rows = stmt.query([session_id.as_str(), tool_use_id.as_str()])?;
        match rows.next()? {
            Some(row) => row_to_tool_call(row),
            None => Err(StoreError::NotFound(format!("tool call {tool_use_id}"))),
        }
    }

    /// List a session's tool calls in creation order.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list(&self, session_id: &SessionId) -> Result<Vec<ToolCallRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, message_id, tool_use_id, tool_name, input, output, status,
                        created_at, resolved_at, duration_ms
                 FROM tool_calls WHERE session_id = ?1 ORDER BY created_at ASC, id ASC",
            )?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_tool_call(row)?);
            }
            Ok(results)
        })
    }

    pub fn count_pending(&self, session_id: &SessionId) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM tool_calls WHERE session_id = ?1 AND status IN ('pending', 'running')",
                [session_id.as_str()],
                |row| row.get(0),
            )
            .map_err(Into::into)
        })
    }
}

fn row_to_tool_call(row: &rusqlite::Row<'_>) -> Result<ToolCallRow, StoreError> {
    let input_str: String = row_helpers::get(row, 5, "tool_calls", "input")?;
    let output_str: Option<String> = row_helpers::get_opt(row, 6, "tool_calls", "output")?;
    let status_str: String = row_helpers::get(row, 7, "tool_calls", "status")?;

    Ok(ToolCallRow {
        id: row_helpers::get(row, 0, "tool_calls", "id")?,
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 1, "tool_calls", "session_id")?),
        message_id: row_helpers::get_opt::<String>(row, 2, "tool_calls", "message_id")?
            .map(MessageId::from_raw),
        tool_use_id: ToolCallId::from_raw(row_helpers::get::<String>(row, 3, "tool_calls", "tool_use_id")?),
        tool_name: row_helpers::get(row, 4, "tool_calls", "tool_name")?,
        input: row_helpers::parse_json(&input_str, "tool_calls", "input")?,
        output: output_str
            .map(|s| row_helpers::parse_json(&s, "tool_calls", "output"))
            .transpose()?,
        status: row_helpers::parse_enum(&status_str, "tool_calls", "status")?,
        created_at: row_helpers::get(row, 8, "tool_calls", "created_at")?,
        resolved_at: row_helpers::get_opt(row, 9, "tool_calls", "resolved_at")?,
        duration_ms: row_helpers::get_opt(row, 10, "tool_calls", "duration_ms")?,
    })
}
