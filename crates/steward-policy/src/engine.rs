use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, warn};

use steward_core::runtime::PolicyVerdict;
use steward_store::decisions::{DecisionInsert, DecisionRepo};

use crate::hash::stable_hash;
use crate::policy::{Policy, PolicyContext, PolicyVote};

/// Name recorded when no applicable policy voted.
const DEFAULT_POLICY_NAME: &str = "none";

#[derive(Clone)]
struct CachedOutcome {
    verdict: PolicyVerdict,
    policy_name: String,
    reason: String,
}

/// Evaluates registered policies against a single tool invocation.
///
/// Registration happens once at startup; the policy list is rebuilt as a
/// priority-sorted slice on each `register` so evaluation is a plain
/// in-order scan. The first deny wins and nothing can override it. A policy
/// that errors casts no vote and evaluation moves on — the engine fails
/// open by design; deployments wanting fail-closed semantics must map
/// errors to deny inside the policy itself.
pub struct PolicyEngine {
    policies: Vec<Arc<dyn Policy>>,
    decisions: Option<DecisionRepo>,
    cache: RwLock<HashMap<(String, String), CachedOutcome>>,
    cache_enabled: bool,
}

impl PolicyEngine {
    pub fn new() -> Self {
        Self {
            policies: Vec::new(),
            decisions: None,
            cache: RwLock::new(HashMap::new()),
            cache_enabled: false,
        }
    }

    /// Record every evaluation into the decision log.
    pub fn with_decision_log(mut self, repo: DecisionRepo) -> Self {
        self.decisions = Some(repo);
        self
    }

    /// Short-circuit repeated identical checks. Entries are never
    /// invalidated mid-session; call [`clear_cache`](Self::clear_cache) to
    /// reset explicitly.
    pub fn with_cache(mut self) -> Self {
        self.cache_enabled = true;
        self
    }

    /// Register a policy. The list is re-sorted by ascending priority;
    /// equal priorities keep registration order.
    pub fn register(&mut self, policy: Arc<dyn Policy>) {
        debug!(name = %policy.name(), priority = policy.priority(), "policy registered");
        self.policies.push(policy);
        self.policies.sort_by_key(|p| p.priority());
    }

    pub fn policy_count(&self) -> usize {
        self.policies.len()
    }

    pub fn clear_cache(&self) {
        self.cache.write().clear();
    }

    /// Evaluate all applicable policies for one tool invocation.
    ///
    /// Infallible: logging failures are swallowed and an empty policy set
    /// yields the default allow.
    pub async fn evaluate(
        &self,
        tool_name: &str,
        input: &Value,
        ctx: &PolicyContext,
    ) -> PolicyVerdict {
        let started = Instant::now();

        let cache_key = if self.cache_enabled {
            let key = (tool_name.to_string(), stable_hash(input));
            if let Some(hit) = self.cache.read().get(&key).cloned() {
                self.record_decision(tool_name, input, ctx, &hit, started);
                return hit.verdict;
            }
            Some(key)
        } else {
            None
        };

        let mut outcome = CachedOutcome {
            verdict: PolicyVerdict::Allow,
            policy_name: DEFAULT_POLICY_NAME.to_string(),
            reason: "no applicable policy denied".to_string(),
        };

        for policy in self.policies.iter().filter(|p| p.applies_to(tool_name)) {
            match policy.evaluate(tool_name, input, ctx).await {
                Ok(PolicyVote::Allow) => {}
                Ok(PolicyVote::Deny { reason }) => {
                    outcome = CachedOutcome {
                        verdict: PolicyVerdict::Deny {
                            reason: reason.clone(),
                        },
                        policy_name: policy.name().to_string(),
                        reason,
                    };
                    break;
                }
                Err(e) => {
                    // Fail open: an erroring policy casts no vote.
                    warn!(
                        policy = %policy.name(),
                        tool_name,
                        error = %e,
                        "policy evaluation failed, skipping its vote"
                    );
                }
            }
        }

        if let Some(key) = cache_key {
            self.cache.write().insert(key, outcome.clone());
        }
        self.record_decision(tool_name, input, ctx, &outcome, started);
        outcome.verdict
    }

    fn record_decision(
        &self,
        tool_name: &str,
        input: &Value,
        ctx: &PolicyContext,
        outcome: &CachedOutcome,
        started: Instant,
    ) {
        let Some(repo) = &self.decisions else {
            return;
        };
        let Some(session_id) = &ctx.session_id else {
            return;
        };
        let insert = DecisionInsert {
            session_id: session_id.clone(),
            tool_name: tool_name.to_string(),
            tool_input: input.clone(),
            context: Some(ctx.snapshot()),
            decision: outcome.verdict.decision_str().to_string(),
            reason: outcome.reason.clone(),
            policy_name: outcome.policy_name.clone(),
            duration_us: started.elapsed().as_micros() as i64,
        };
        if let Err(e) = repo.record(insert) {
            warn!(tool_name, error = %e, "decision record write failed, verdict unaffected");
        }
    }
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new()
    }
}
