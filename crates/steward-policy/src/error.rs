#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("invalid tool pattern '{pattern}': {detail}")]
    InvalidPattern { pattern: String, detail: String },

    #[error("evaluation failed: {0}")]
    Evaluation(String),
}
