pub mod audit;
pub mod database;
pub mod decisions;
pub mod error;
pub mod hook_executions;
pub mod messages;
pub mod row_helpers;
pub mod schema;
pub mod sessions;
pub mod tool_calls;

pub use database::Database;
pub use error::StoreError;
