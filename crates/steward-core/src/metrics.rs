use serde::{Deserialize, Serialize};

use crate::runtime::UsageReport;

/// Session-level accumulated totals, incremented as events arrive from the
/// runtime stream. Ordering follows stream order within a session.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub message_count: u64,
    pub tool_call_count: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
    pub total_cost_usd: f64,
    pub turn_count: u32,
    pub error_count: u32,
    pub retry_count: u32,
}

impl SessionMetrics {
    /// Fold a terminal result payload's usage into the running totals.
    pub fn accumulate(&mut self, usage: &UsageReport) {
        self.input_tokens += usage.input_tokens;
        self.output_tokens += usage.output_tokens;
        self.cache_read_tokens += usage.cache_read_tokens;
        self.cache_creation_tokens += usage.cache_creation_tokens;
        self.total_cost_usd += usage.cost_usd;
        self.turn_count += usage.num_turns;
    }
}
