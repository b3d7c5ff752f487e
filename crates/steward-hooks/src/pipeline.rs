use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use steward_core::hooks::{HookDirective, HookEvent, HookPayload};
use steward_core::ids::ToolCallId;
use steward_store::hook_executions::{HookExecutionInsert, HookExecutionRepo};

use crate::hook::{Hook, HookContext};

/// Runs all hooks registered for a lifecycle event, in priority order.
///
/// The merged result starts as `{continue: true}`; each hook's fields merge
/// over the accumulated ones and a hook clearing the continue flag stops
/// the remaining hooks for this event. A hook error is caught, recorded,
/// and skipped — one failing observer never blocks the tool call or the
/// other observers. Each invocation leaves exactly one execution record,
/// written best-effort.
pub struct HookPipeline {
    hooks: HashMap<HookEvent, Vec<Arc<dyn Hook>>>,
    executions: Option<HookExecutionRepo>,
}

impl HookPipeline {
    pub fn new() -> Self {
        Self {
            hooks: HashMap::new(),
            executions: None,
        }
    }

    /// Record every hook invocation into the execution log.
    pub fn with_execution_log(mut self, repo: HookExecutionRepo) -> Self {
        self.executions = Some(repo);
        self
    }

    /// Register a hook for an event. The event's bucket is re-sorted by
    /// ascending priority; the sort is stable so equal priorities keep
    /// registration order.
    pub fn register(&mut self, event: HookEvent, hook: Arc<dyn Hook>) {
        debug!(name = %hook.name(), %event, priority = hook.priority(), "hook registered");
        let bucket = self.hooks.entry(event).or_default();
        bucket.push(hook);
        bucket.sort_by_key(|h| h.priority());
    }

    pub fn has_hooks(&self, event: HookEvent) -> bool {
        self.hooks.get(&event).is_some_and(|b| !b.is_empty())
    }

    pub fn hook_count(&self, event: HookEvent) -> usize {
        self.hooks.get(&event).map_or(0, Vec::len)
    }

    /// Execute the pipeline for one lifecycle event.
    pub async fn execute(
        &self,
        payload: &HookPayload,
        tool_use_id: Option<&ToolCallId>,
        ctx: &HookContext,
    ) -> HookDirective {
        let event = payload.event();
        let Some(bucket) = self.hooks.get(&event).filter(|b| !b.is_empty()) else {
            // No hooks: default result, no database interaction.
            return HookDirective::default();
        };

        let input_snapshot =
            serde_json::to_value(payload).unwrap_or(serde_json::Value::Null);
        let mut merged = HookDirective::default();

        for hook in bucket {
            let started = Instant::now();
            match hook.run(payload, ctx).await {
                Ok(directive) => {
                    self.record(
                        event,
                        hook.name(),
                        tool_use_id,
                        ctx,
                        &input_snapshot,
                        Some(&directive),
                        started,
                        None,
                    );
                    merged.absorb(directive);
                    if !merged.continue_run {
                        debug!(hook = %hook.name(), %event, "hook stopped the pipeline");
                        break;
                    }
                }
                Err(e) => {
                    warn!(hook = %hook.name(), %event, error = %e, "hook failed, continuing with next");
                    self.record(
                        event,
                        hook.name(),
                        tool_use_id,
                        ctx,
                        &input_snapshot,
                        None,
                        started,
                        Some(e.to_string()),
                    );
                }
            }
        }

        merged
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        event: HookEvent,
        hook_name: &str,
        tool_use_id: Option<&ToolCallId>,
        ctx: &HookContext,
        input: &serde_json::Value,
        output: Option<&HookDirective>,
        started: Instant,
        error_message: Option<String>,
    ) {
        let Some(repo) = &self.executions else {
            return;
        };
        let insert = HookExecutionInsert {
            session_id: ctx.session_id.clone(),
            hook_event: event,
            hook_name: hook_name.to_string(),
            tool_use_id: tool_use_id.cloned(),
            input: input.clone(),
            output: output.map(|d| serde_json::to_value(d).unwrap_or(serde_json::Value::Null)),
            duration_us: started.elapsed().as_micros() as i64,
            error_message,
        };
        if let Err(e) = repo.record(insert) {
            warn!(hook_name, error = %e, "hook execution record write failed");
        }
    }
}

impl Default for HookPipeline {
    fn default() -> Self {
        Self::new()
    }
}
