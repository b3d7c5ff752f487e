#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("hook execution failed: {0}")]
    Execution(String),
}
