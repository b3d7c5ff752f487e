use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use steward_core::ids::SessionId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// A stored audit entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditRow {
    pub id: i64,
    pub event_type: String,
    pub session_id: Option<SessionId>,
    pub details: serde_json::Value,
    pub created_at: String,
}

/// Append-only audit sink. Writes are fire-and-forget for callers:
/// `log_event` swallows failures after logging them, so an audit outage
/// never aborts the operation being audited.
pub struct AuditRepo {
    db: Database,
}

impl AuditRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append an audit entry. Never fails from the caller's perspective.
    #[instrument(skip(self, details), fields(event_type))]
    pub fn log_event(
        &self,
        event_type: &str,
        session_id: Option<&SessionId>,
        details: &serde_json::Value,
    ) {
        if let Err(e) = self.try_log(event_type, session_id, details) {
            warn!(event_type, error = %e, "audit write failed, entry dropped");
        }
    }

    fn try_log(
        &self,
        event_type: &str,
        session_id: Option<&SessionId>,
        details: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO audit_log (event_type, session_id, details, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    event_type,
                    session_id.map(|s| s.as_str()),
                    serde_json::to_string(details)?,
                    now,
                ],
            )?;
            Ok(())
        })
    }

    /// List entries for a session, oldest first.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list(&self, session_id: &SessionId) -> Result<Vec<AuditRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, event_type, session_id, details, created_at
                 FROM audit_log WHERE session_id = ?1 ORDER BY id ASC",
            )?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_audit(row)?);
            }
            Ok(results)
        })
    }

    pub fn count(&self) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))
                .map_err(Into::into)
        })
    }
}

fn row_to_audit(row: &rusqlite::Row<'_>) -> Result<AuditRow, StoreError> {
    let details_str: String = row_helpers::get(row, 3, "audit_log", "details")?;
    Ok(AuditRow {
        id: row_helpers::get(row, 0, "audit_log", "id")?,
        event_type: row_helpers::get(row, 1, "audit_log", "event_type")?,
        session_id: row_helpers::get_opt::<String>(row, 2, "audit_log", "session_id")?
            .map(SessionId::from_raw),
        details: row_helpers::parse_json(&details_str, "audit_log", "details")?,
        created_at: row_helpers::get(row, 4, "audit_log", "created_at")?,
    })
}
