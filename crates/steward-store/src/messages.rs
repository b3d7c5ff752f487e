use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use steward_core::ids::{MessageId, SessionId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => f.write_str("user"),
            Self::Assistant => f.write_str("assistant"),
            Self::System => f.write_str("system"),
        }
    }
}

impl std::str::FromStr for MessageRole {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            other => Err(format!("unknown message role: {other}")),
        }
    }
}

/// A stored conversation message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: MessageId,
    pub session_id: SessionId,
    pub sequence: i64,
    pub role: MessageRole,
    pub content: serde_json::Value,
    pub created_at: String,
}

/// Per-session append lock so the sequence counter is assigned atomically.
struct SessionLocks {
    locks: HashMap<String, Arc<Mutex<()>>>,
}

impl SessionLocks {
    fn new() -> Self {
        Self {
            locks: HashMap::new(),
        }
    }

    fn get(&mut self, session_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

pub struct MessageRepo {
    db: Database,
    session_locks: Mutex<SessionLocks>,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            session_locks: Mutex::new(SessionLocks::new()),
        }
    }

    /// Append a message with the next strictly increasing sequence number
    /// for the session.
    #[instrument(skip(self, content), fields(session_id = %session_id, role = %role))]
    pub fn append(
        &self,
        session_id: &SessionId,
        role: MessageRole,
        content: serde_json::Value,
    ) -> Result<MessageRow, StoreError> {
        let lock = self.session_locks.lock().get(session_id.as_str());
        let _guard = lock.lock();

        self.db.with_conn(|conn| {
            let max_seq: i64 = conn.query_row(
                "SELECT COALESCE(MAX(sequence), -1) FROM messages WHERE session_id = ?1",
                [session_id.as_str()],
                |row| row.get(0),
            )?;

            let id = MessageId::new();
            let sequence = max_seq + 1;
            let now = Utc::now().to_rfc3339();

            conn.execute(
                "INSERT INTO messages (id, session_id, sequence, role, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    id.as_str(),
                    session_id.as_str(),
                    sequence,
                    role.to_string(),
                    serde_json::to_string(&content)?,
                    now,
                ],
            )?;

            Ok(MessageRow {
                id,
                session_id: session_id.clone(),
                sequence,
                role,
                content,
                created_at: now,
            })
        })
    }

    /// List a session's messages in sequence order.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list(&self, session_id: &SessionId) -> Result<Vec<MessageRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, sequence, role, content, created_at
                 FROM messages WHERE session_id = ?1 ORDER BY sequence ASC",
            )?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_message(row)?);
            }
            Ok(results)
        })
    }

    pub fn count(&self, session_id: &SessionId) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE session_id = ?1",
                [session_id.as_str()],
                |row| row.get(0),
            )
            .map_err(Into::into)
        })
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<MessageRow, StoreError> {
    let role_str: String = row_helpers::get(row, 3, "messages", "role")?;
    let content_str: String = row_helpers::get(row, 4, "messages", "content")?;

    Ok(MessageRow {
        id: MessageId::from_raw(row_helpers::get::<String>(row, 0, "messages", "id")?),
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 1, "messages", "session_id")?),
        sequence: row_helpers::get(row, 2, "messages", "sequence")?,
        role: row_helpers::parse_enum(&role_str, "messages", "role")?,
        content: row_helpers::parse_json(&content_str, "messages", "content")?,
        created_at: row_helpers::get(row, 5, "messages", "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::SessionRepo;
    use serde_json::json;
    use steward_core::config::AgentConfig;
    use steward_core::ids::UserId;
    use steward_core::session::{Session, SessionMode};

    fn setup() -> (Database, SessionId) {
        let db = Database::in_memory().unwrap();
        let session = Session::new(
            UserId::new(),
            SessionMode::Interactive,
            AgentConfig::default(),
            "/tmp",
        );
        SessionRepo::new(db.clone()).insert(&session).unwrap();
        (db, session.id)
    }

    #[test]
    fn append_assigns_sequences_from_zero() {
        let (db, sess_id) = setup();
        let repo = MessageRepo::new(db);

        let m0 = repo.append(&sess_id, MessageRole::User, json!({"text": "hi"})).unwrap();
        let m1 = repo
            .append(&sess_id, MessageRole::Assistant, json!({"text": "hello"}))
            .unwrap();

        assert_eq!(m0.sequence, 0);
        assert_eq!(m1.sequence, 1);
    }

    #[test]
    fn sequences_strictly_increase_per_session() {
        let (db, sess_id) = setup();
        let repo = MessageRepo::new(db);
        for i in 0..10 {
            let m = repo
                .append(&sess_id, MessageRole::Assistant, json!({"n": i}))
                .unwrap();
            assert_eq!(m.sequence, i);
        }
        let listed = repo.list(&sess_id).unwrap();
        for w in listed.windows(2) {
            assert!(w[0].sequence < w[1].sequence);
        }
    }

    #[test]
    fn sequences_are_independent_across_sessions() {
        let (db, sess_a) = setup();
        let session_b = Session::new(
            UserId::new(),
            SessionMode::Interactive,
            AgentConfig::default(),
            "/tmp",
        );
        SessionRepo::new(db.clone()).insert(&session_b).unwrap();

        let repo = MessageRepo::new(db);
        repo.append(&sess_a, MessageRole::User, json!({"text": "a"})).unwrap();
        let mb = repo
            .append(&session_b.id, MessageRole::User, json!({"text": "b"}))
            .unwrap();
        assert_eq!(mb.sequence, 0);
    }

    #[test]
    fn list_returns_in_order() {
        let (db, sess_id) = setup();
        let repo = MessageRepo::new(db);
        repo.append(&sess_id, MessageRole::User, json!({"text": "one"})).unwrap();
        repo.append(&sess_id, MessageRole::Assistant, json!({"text": "two"})).unwrap();

        let listed = repo.list(&sess_id).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].role, MessageRole::User);
        assert_eq!(listed[1].role, MessageRole::Assistant);
        assert_eq!(listed[1].content["text"], "two");
    }

    #[test]
    fn count_messages() {
        let (db, sess_id) = setup();
        let repo = MessageRepo::new(db);
        assert_eq!(repo.count(&sess_id).unwrap(), 0);
        repo.append(&sess_id, MessageRole::User, json!({})).unwrap();
        assert_eq!(repo.count(&sess_id).unwrap(), 1);
    }

    #[test]
    fn role_from_str_rejects_unknown() {
        assert!("assistant".parse::<MessageRole>().is_ok());
        assert!("robot".parse::<MessageRole>().is_err());
    }
}
