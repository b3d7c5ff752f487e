use async_trait::async_trait;

use steward_core::hooks::{HookDirective, HookPayload};
use steward_core::ids::SessionId;

use crate::error::HookError;

/// Context handed to each hook invocation.
#[derive(Clone, Debug)]
pub struct HookContext {
    pub session_id: SessionId,
    pub working_directory: Option<String>,
}

impl HookContext {
    pub fn for_session(session_id: SessionId) -> Self {
        Self {
            session_id,
            working_directory: None,
        }
    }
}

/// A side-effecting observer invoked at a lifecycle event.
///
/// Hooks must tolerate concurrent invocation across sessions. Returning an
/// error is contained by the pipeline and never surfaces to the tool call.
#[async_trait]
pub trait Hook: Send + Sync {
    fn name(&self) -> &str;

    /// Lower priority runs first; ties keep registration order.
    fn priority(&self) -> u32;

    async fn run(&self, payload: &HookPayload, ctx: &HookContext) -> Result<HookDirective, HookError>;
}
