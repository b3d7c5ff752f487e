//! Session orchestration: the connection pool, the stream relay, and the
//! orchestrator that drives session lifecycles while wiring policy and
//! hook callbacks into every pooled connection.

pub mod archive;
pub mod error;
pub mod gate;
pub mod orchestrator;
pub mod pool;
pub mod relay;

pub use archive::{ArchiveOutcome, NullArchiver, WorkspaceArchiver};
pub use error::EngineError;
pub use orchestrator::{SendOutcome, SessionOrchestrator};
pub use pool::{ClientPool, PoolConfig};
