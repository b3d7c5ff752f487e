use steward_core::ids::SessionId;
use steward_core::runtime::RuntimeError;
use steward_core::session::{SessionError, SessionStatus};
use steward_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("client already exists for session {0}")]
    ClientAlreadyExists(SessionId),

    #[error("no client for session {0}")]
    ClientNotFound(SessionId),

    #[error("session {session_id} cannot accept messages (status: {status})")]
    SessionNotActive {
        session_id: SessionId,
        status: SessionStatus,
    },

    #[error("{0}")]
    Internal(String),
}
