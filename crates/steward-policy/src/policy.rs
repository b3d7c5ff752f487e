use async_trait::async_trait;
use serde_json::Value;

use steward_core::ids::{SessionId, UserId};

use crate::error::PolicyError;

/// Evaluation context handed to each policy alongside the tool input.
#[derive(Clone, Debug, Default)]
pub struct PolicyContext {
    pub session_id: Option<SessionId>,
    pub user_id: Option<UserId>,
    pub working_directory: Option<String>,
}

impl PolicyContext {
    pub fn for_session(session_id: SessionId) -> Self {
        Self {
            session_id: Some(session_id),
            ..Default::default()
        }
    }

    /// JSON snapshot stored on decision records.
    pub fn snapshot(&self) -> Value {
        serde_json::json!({
            "session_id": self.session_id.as_ref().map(|s| s.as_str()),
            "user_id": self.user_id.as_ref().map(|u| u.as_str()),
            "working_directory": self.working_directory,
        })
    }
}

/// A single policy's vote on one tool invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PolicyVote {
    Allow,
    Deny { reason: String },
}

impl PolicyVote {
    pub fn deny(reason: impl Into<String>) -> Self {
        Self::Deny {
            reason: reason.into(),
        }
    }
}

/// A rule that votes allow/deny on a specific tool invocation.
///
/// Policies are registered once at startup and evaluated many times; they
/// must be cheap to call and must not assume exclusive access to anything.
#[async_trait]
pub trait Policy: Send + Sync {
    fn name(&self) -> &str;

    /// Lower priority runs first.
    fn priority(&self) -> u32;

    fn applies_to(&self, tool_name: &str) -> bool;

    async fn evaluate(
        &self,
        tool_name: &str,
        input: &Value,
        ctx: &PolicyContext,
    ) -> Result<PolicyVote, PolicyError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_snapshot_shape() {
        let sess = SessionId::new();
        let ctx = PolicyContext::for_session(sess.clone());
        let snap = ctx.snapshot();
        assert_eq!(snap["session_id"], sess.as_str());
        assert!(snap["user_id"].is_null());
    }

    #[test]
    fn vote_constructor() {
        let v = PolicyVote::deny("nope");
        assert_eq!(v, PolicyVote::Deny { reason: "nope".into() });
    }
}
