use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use steward_core::ids::{DecisionId, SessionId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Parameters for recording one policy evaluation.
#[derive(Clone, Debug)]
pub struct DecisionInsert {
    pub session_id: SessionId,
    pub tool_name: String,
    pub tool_input: serde_json::Value,
    pub context: Option<serde_json::Value>,
    pub decision: String,
    pub reason: String,
    pub policy_name: String,
    pub duration_us: i64,
}

/// One immutable, append-only record per tool-permission check.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DecisionRow {
    pub id: DecisionId,
    pub session_id: SessionId,
    pub tool_name: String,
    pub tool_input: serde_json::Value,
    pub context: Option<serde_json::Value>,
    pub decision: String,
    pub reason: String,
    pub policy_name: String,
    pub duration_us: i64,
    pub created_at: String,
}

pub struct DecisionRepo {
    db: Database,
}

impl DecisionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, insert), fields(session_id = %insert.session_id, tool_name = %insert.tool_name, decision = %insert.decision))]
    pub fn record(&self, insert: DecisionInsert) -> Result<DecisionRow, StoreError> {
        let id = DecisionId::new();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO policy_decisions
                     (id, session_id, tool_name, tool_input, context, decision, reason, policy_name, duration_us, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                rusqlite::params![
                    id.as_str(),
                    insert.session_id.as_str(),
                    insert.tool_name,
                    serde_json::to_string(&insert.tool_input)?,
                    insert
                        .context
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                    insert.decision,
                    insert.reason,
                    insert.policy_name,
                    insert.duration_us,
                    now,
                ],
            )?;

            Ok(DecisionRow {
                id,
                session_id: insert.session_id.clone(),
                tool_name: insert.tool_name.clone(),
                tool_input: insert.tool_input.clone(),
                context: insert.context.clone(),
                decision: insert.decision.clone(),
                reason: insert.reason.clone(),
                policy_name: insert.policy_name.clone(),
                duration_us: insert.duration_us,
                created_at: now,
            })
        })
    }

    /// List a session's decisions, oldest first.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list(&self, session_id: &SessionId) -> Result<Vec<DecisionRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, tool_name, tool_input, context, decision, reason,
                        policy_name, duration_us, created_at
                 FROM policy_decisions WHERE session_id = ?1 ORDER BY id ASC",
            )?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_decision(row)?);
            }
            Ok(results)
        })
    }
}

fn row_to_decision(row: &rusqlite::Row<'_>) -> Result<DecisionRow, StoreError> {
    let input_str: String = row_helpers::get(row, 3, "policy_decisions", "tool_input")?;
    let context_str: Option<String> = row_helpers::get_opt(row, 4, "policy_decisions", "context")?;

    Ok(DecisionRow {
        id: DecisionId::from_raw(row_helpers::get::<String>(row, 0, "policy_decisions", "id")?),
        session_id: SessionId::from_raw(row_helpers::get::<String>(
            row,
            1,
            "policy_decisions",
            "session_id",
        )?),
        tool_name: row_helpers::get(row, 2, "policy_decisions", "tool_name")?,
        tool_input: row_helpers::parse_json(&input_str, "policy_decisions", "tool_input")?,
        context: context_str
            .map(|s| row_helpers::parse_json(&s, "policy_decisions", "context"))
            .transpose()?,
        decision: row_helpers::get(row, 5, "policy_decisions", "decision")?,
        reason: row_helpers::get(row, 6, "policy_decisions", "reason")?,
        policy_name: row_helpers::get(row, 7, "policy_decisions", "policy_name")?,
        duration_us: row_helpers::get(row, 8, "policy_decisions", "duration_us")?,
        created_at: row_helpers::get(row, 9, "policy_decisions", "created_at")?,
    })
}
