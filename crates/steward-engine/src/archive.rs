//! Archival boundary. The real archiver lives with the storage
//! collaborator; the broker only depends on this trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use steward_core::ids::SessionId;

/// Result of one archive request. Failures are reported as a status rather
/// than raised, so the caller can keep the session's metadata transition
/// independent of archival health.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ArchiveOutcome {
    Archived { location: String },
    Skipped { reason: String },
    Failed { reason: String },
}

#[async_trait]
pub trait WorkspaceArchiver: Send + Sync {
    /// Archive the session's working directory. Idempotent per session.
    async fn archive_working_directory(&self, session_id: &SessionId, path: &str)
        -> ArchiveOutcome;
}

/// Default archiver: records nothing, archives nothing.
pub struct NullArchiver;

#[async_trait]
impl WorkspaceArchiver for NullArchiver {
    async fn archive_working_directory(
        &self,
        session_id: &SessionId,
        path: &str,
    ) -> ArchiveOutcome {
        debug!(session_id = %session_id, path, "archival disabled, skipping");
        ArchiveOutcome::Skipped {
            reason: "archival disabled".into(),
        }
    }
}
