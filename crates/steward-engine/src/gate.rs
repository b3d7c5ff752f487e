//! Adapters wiring the policy engine and hook pipeline into a pooled
//! connection's callbacks.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use steward_core::hooks::HookPayload;
use steward_core::ids::{SessionId, ToolCallId};
use steward_core::runtime::{PolicyVerdict, RuntimeObserver, ToolAuthorizer};
use steward_core::session::Session;
use steward_hooks::{HookContext, HookPipeline};
use steward_policy::{PolicyContext, PolicyEngine};

/// Tool-authorization callback backed by the policy engine.
pub struct PolicyAuthorizer {
    engine: Arc<PolicyEngine>,
    ctx: PolicyContext,
}

impl PolicyAuthorizer {
    pub fn for_session(engine: Arc<PolicyEngine>, session: &Session) -> Self {
        Self {
            engine,
            ctx: PolicyContext {
                session_id: Some(session.id.clone()),
                user_id: Some(session.user_id.clone()),
                working_directory: Some(session.working_directory.clone()),
            },
        }
    }
}

#[async_trait]
impl ToolAuthorizer for PolicyAuthorizer {
    async fn authorize(
        &self,
        tool_name: &str,
        input: &Value,
        _tool_use_id: &ToolCallId,
    ) -> PolicyVerdict {
        self.engine.evaluate(tool_name, input, &self.ctx).await
    }
}

/// Event-observer callback backed by the hook pipeline, for
/// runtime-initiated lifecycle events.
pub struct PipelineObserver {
    pipeline: Arc<HookPipeline>,
    ctx: HookContext,
}

impl PipelineObserver {
    pub fn for_session(pipeline: Arc<HookPipeline>, session: &Session) -> Self {
        Self {
            pipeline,
            ctx: HookContext {
                session_id: session.id.clone(),
                working_directory: Some(session.working_directory.clone()),
            },
        }
    }
}

#[async_trait]
impl RuntimeObserver for PipelineObserver {
    async fn notify(
        &self,
        _session_id: &SessionId,
        payload: HookPayload,
        tool_use_id: Option<ToolCallId>,
    ) {
        // The directive is observed for its side effects only; runtime
        // events cannot be blocked from here.
        let _ = self
            .pipeline
            .execute(&payload, tool_use_id.as_ref(), &self.ctx)
            .await;
    }
}
