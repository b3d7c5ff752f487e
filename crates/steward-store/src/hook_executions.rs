use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use steward_core::hooks::HookEvent;
use steward_core::ids::{HookExecutionId, SessionId, ToolCallId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Parameters for recording one hook invocation.
#[derive(Clone, Debug)]
pub struct HookExecutionInsert {
    pub session_id: SessionId,
    pub hook_event: HookEvent,
    pub hook_name: String,
    pub tool_use_id: Option<ToolCallId>,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub duration_us: i64,
    pub error_message: Option<String>,
}

/// One immutable, append-only record per hook invocation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HookExecutionRow {
    pub id: HookExecutionId,
    pub session_id: SessionId,
    pub hook_event: HookEvent,
    pub hook_name: String,
    pub tool_use_id: Option<ToolCallId>,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub duration_us: i64,
    pub error_message: Option<String>,
    pub created_at: String,
}

pub struct HookExecutionRepo {
    db: Database,
}

impl HookExecutionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, insert), fields(session_id = %insert.session_id, hook_event = %insert.hook_event, hook_name = %insert.hook_name))]
    pub fn record(&self, insert: HookExecutionInsert) -> Result<HookExecutionRow, StoreError> {
        let id = HookExecutionId::new();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO hook_executions
                     (id, session_id, hook_event, hook_name, tool_use_id, input, output, duration_us, error_message, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                rusqlite::params![
                    id.as_str(),
                    insert.session_id.as_str(),
                    insert.hook_event.to_string(),
                    insert.hook_name,
                    insert.tool_use_id.as_ref().map(|t| t.as_str()),
                    serde_json::to_string(&insert.input)?,
                    insert
                        .output
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                    insert.duration_us,
                    insert.error_message,
                    now,
                ],
            )?;

            Ok(HookExecutionRow {
                id,
                session_id: insert.session_id.clone(),
                hook_event: insert.hook_event,
                hook_name: insert.hook_name.clone(),
                tool_use_id: insert.tool_use_id.clone(),
                input: insert.input.clone(),
                output: insert.output.clone(),
                duration_us: insert.duration_us,
                error_message: insert.error_message.clone(),
                created_at: now,
            })
        })
    }

    /// List a session's hook executions, oldest first. Optionally filtered
    /// by event type.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list(
        &self,
        session_id: &SessionId,
        event: Option<HookEvent>,
    ) -> Result<Vec<HookExecutionRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut results = Vec::new();
            match event {
                Some(ev) => {
                    let mut stmt = conn.prepare(
                        "SELECT id, session_id, hook_event, hook_name, tool_use_id, input, output,
                                duration_us, error_message, created_at
                         FROM hook_executions WHERE session_id = ?1 AND hook_event = ?2
                         ORDER BY id ASC",
                    )?;
                    let mut rows =
                        stmt.query(rusqlite::params![session_id.as_str(), ev.to_string()])?;
                    while let Some(row) = rows.next()? {
                        results.push(row_to_execution(row)?);
                    }
                }
                None => {
                    let mut stmt = conn.prepare(
                        "SELECT id, session_id, hook_event, hook_name, tool_use_id, input, output,
                                duration_us, error_message, created_at
                         FROM hook_executions WHERE session_id = ?1 ORDER BY id ASC",
                    )?;
                    let mut rows = stmt.query([session_id.as_str()])?;
                    while let Some(row) = rows.next()? {
                        results.push(row_to_execution(row)?);
                    }
                }
            }
            Ok(results)
        })
    }
}

fn row_to_execution(row: &rusqlite::Row<'_>) -> Result<HookExecutionRow, StoreError> {
    let event_str: String = row_helpers::get(row, 2, "hook_executions", "hook_event")?;
    let input_str: String = row_helpers::get(row, 5, "hook_executions", "input")?;
    let output_str: Option<String> = row_helpers::get_opt(row, 6, "hook_executions", "output")?;

    Ok(HookExecutionRow {
        id: HookExecutionId::from_raw(row_helpers::get::<String>(row, 0, "hook_executions", "id")?),
        session_id: SessionId::from_raw(row_helpers::get::<String>(
            row,
            1,
            "hook_executions",
            "session_id",
        )?),
        hook_event: row_helpers::parse_enum(&event_str, "hook_executions", "hook_event")?,
        hook_name: row_helpers::get(row, 3, "hook_executions", "hook_name")?,
        tool_use_id: row_helpers::get_opt::<String>(row, 4, "hook_executions", "tool_use_id")?
            .map(ToolCallId::from_raw),
        input: row_helpers::parse_json(&input_str, "hook_executions", "input")?,
        output: output_str
            .map(|s| row_helpers::parse_json(&s, "hook_executions", "output"))
            .transpose()?,
        duration_us: row_helpers::get(row, 7, "hook_executions", "duration_us")?,
        error_message: row_helpers::get_opt(row, 8, "hook_executions", "error_message")?,
        created_at: row_helpers::get(row, 9, "hook_executions", "created_at")?,
    })
}
