use chrono::{DateTime, Utc};
use tracing::instrument;

use steward_core::config::AgentConfig;
use steward_core::ids::{SessionId, UserId};
use steward_core::metrics::SessionMetrics;
use steward_core::session::{Session, SessionStatus};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const SELECT_COLS: &str = "id, user_id, mode, status, working_directory, config, \
     parent_session_id, error, result, \
     message_count, tool_call_count, input_tokens, output_tokens, \
     cache_read_tokens, cache_creation_tokens, total_cost_usd, turn_count, \
     error_count, retry_count, \
     created_at, updated_at, started_at, completed_at, duration_ms";

pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persist a freshly created session.
    #[instrument(skip(self, session), fields(session_id = %session.id))]
    pub fn insert(&self, session: &Session) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, user_id, mode, status, working_directory, config,
                     parent_session_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    session.id.as_str(),
                    session.user_id.as_str(),
                    session.mode.to_string(),
                    session.status.to_string(),
                    session.working_directory,
                    serde_json::to_string(&session.config)?,
                    session.parent_session_id.as_ref().map(|p| p.as_str()),
                    session.created_at.to_rfc3339(),
                    session.updated_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    /// Get a session by ID.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn get(&self, id: &SessionId) -> Result<Session, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {SELECT_COLS} FROM sessions WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_session(row),
                None => Err(StoreError::NotFound(format!("session {id}"))),
            }
        })
    }

    /// Write back every mutable field of the session entity.
    #[instrument(skip(self, session), fields(session_id = %session.id, status = %session.status))]
    pub fn update(&self, session: &Session) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE sessions SET
                    status = ?1, error = ?2, result = ?3,
                    message_count = ?4, tool_call_count = ?5,
                    input_tokens = ?6, output_tokens = ?7,
                    cache_read_tokens = ?8, cache_creation_tokens = ?9,
                    total_cost_usd = ?10, turn_count = ?11,
                    error_count = ?12, retry_count = ?13,
                    updated_at = ?14, started_at = ?15, completed_at = ?16, duration_ms = ?17
                 WHERE id = ?18",
                rusqlite::params![
                    session.status.to_string(),
                    session.error,
                    session.result,
                    session.metrics.message_count as i64,
                    session.metrics.tool_call_count as i64,
                    session.metrics.input_tokens as i64,
                    session.metrics.output_tokens as i64,
                    session.metrics.cache_read_tokens as i64,
                    session.metrics.cache_creation_tokens as i64,
                    session.metrics.total_cost_usd,
                    session.metrics.turn_count,
                    session.metrics.error_count,
                    session.metrics.retry_count,
                    session.updated_at.to_rfc3339(),
                    session.started_at.map(|t| t.to_rfc3339()),
                    session.completed_at.map(|t| t.to_rfc3339()),
                    session.duration_ms,
                    session.id.as_str(),
                ],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("session {}", session.id)));
            }
            Ok(())
        })
    }

    /// List a user's sessions, newest first.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub fn list_for_user(
        &self,
        user_id: &UserId,
        status: Option<SessionStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Session>, StoreError> {
        self.db.with_conn(|conn| {
            let mut results = Vec::new();
            match status {
                Some(s) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {SELECT_COLS} FROM sessions
                         WHERE user_id = ?1 AND status = ?2
                         ORDER BY created_at DESC LIMIT ?3 OFFSET ?4"
                    ))?;
                    let mut rows = stmt.query(rusqlite::params![
                        user_id.as_str(),
                        s.to_string(),
                        limit,
                        offset
                    ])?;
                    while let Some(row) = rows.next()? {
                        results.push(row_to_session(row)?);
                    }
                }
                None => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {SELECT_COLS} FROM sessions
                         WHERE user_id = ?1
                         ORDER BY created_at DESC LIMIT ?2 OFFSET ?3"
                    ))?;
                    let mut rows =
                        stmt.query(rusqlite::params![user_id.as_str(), limit, offset])?;
                    while let Some(row) = rows.next()? {
                        results.push(row_to_session(row)?);
                    }
                }
            }
            Ok(results)
        })
    }

    /// Lineage lookup: sessions forked from the given parent.
    #[instrument(skip(self), fields(parent_id = %parent_id))]
    pub fn children(&self, parent_id: &SessionId) -> Result<Vec<Session>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLS} FROM sessions
                 WHERE parent_session_id = ?1 ORDER BY created_at ASC"
            ))?;
            let mut rows = stmt.query([parent_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_session(row)?);
            }
            Ok(results)
        })
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<Session, StoreError> {
    let mode_str: String = row_helpers::get(row, 2, "sessions", "mode")?;
    let status_str: String = row_helpers::get(row, 3, "sessions", "status")?;
    let config_str: String = row_helpers::get(row, 5, "sessions", "config")?;
    let config: AgentConfig =
        serde_json::from_str(&config_str).map_err(|e| StoreError::CorruptRow {
            table: "sessions",
            column: "config",
            detail: e.to_string(),
        })?;

    let parse_ts = |raw: String, col| row_helpers::parse_timestamp(&raw, "sessions", col);
    let parse_ts_opt = |raw: Option<String>, col| -> Result<Option<DateTime<Utc>>, StoreError> {
        raw.map(|r| row_helpers::parse_timestamp(&r, "sessions", col))
            .transpose()
    };

    Ok(Session {
        id: SessionId::from_raw(row_helpers::get::<String>(row, 0, "sessions", "id")?),
        user_id: UserId::from_raw(row_helpers::get::<String>(row, 1, "sessions", "user_id")?),
        mode: row_helpers::parse_enum(&mode_str, "sessions", "mode")?,
        status: row_helpers::parse_enum(&status_str, "sessions", "status")?,
        working_directory: row_helpers::get(row, 4, "sessions", "working_directory")?,
        config,
        parent_session_id: row_helpers::get_opt::<String>(row, 6, "sessions", "parent_session_id")?
            .map(SessionId::from_raw),
        error: row_helpers::get_opt(row, 7, "sessions", "error")?,
        result: row_helpers::get_opt(row, 8, "sessions", "result")?,
        metrics: SessionMetrics {
            message_count: row_helpers::get::<i64>(row, 9, "sessions", "message_count")? as u64,
            tool_call_count: row_helpers::get::<i64>(row, 10, "sessions", "tool_call_count")? as u64,
            input_tokens: row_helpers::get::<i64>(row, 11, "sessions", "input_tokens")? as u64,
            output_tokens: row_helpers::get::<i64>(row, 12, "sessions", "output_tokens")? as u64,
            cache_read_tokens: row_helpers::get::<i64>(row, 13, "sessions", "cache_read_tokens")?
                as u64,
            cache_creation_tokens: row_helpers::get::<i64>(
                row,
                14,
                "sessions",
                "cache_creation_tokens",
            )? as u64,
            total_cost_usd: row_helpers::get(row, 15, "sessions", "total_cost_usd")?,
            turn_count: row_helpers::get(row, 16, "sessions", "turn_count")?,
            error_count: row_helpers::get(row, 17, "sessions", "error_count")?,
            retry_count: row_helpers::get(row, 18, "sessions", "retry_count")?,
        },
        created_at: parse_ts(
            row_helpers::get::<String>(row, 19, "sessions", "created_at")?,
            "created_at",
        )?,
        updated_at: parse_ts(
            row_helpers::get::<String>(row, 20, "sessions", "updated_at")?,
            "updated_at",
        )?,
        started_at: parse_ts_opt(
            row_helpers::get_opt::<String>(row, 21, "sessions", "started_at")?,
            "started_at",
        )?,
        completed_at: parse_ts_opt(
            row_helpers::get_opt::<String>(row, 22, "sessions", "completed_at")?,
            "completed_at",
        )?,
        duration_ms: row_helpers::get_opt(row, 23, "sessions", "duration_ms")?,
    })
}
