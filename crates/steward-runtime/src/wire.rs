//! Line-delimited JSON protocol spoken by the external agent CLI.
//!
//! Incoming lines are typed message frames; outgoing lines are user
//! messages and control responses. Unknown frames and content blocks are
//! tolerated and skipped.

use serde::Deserialize;
use serde_json::{json, Value};

use steward_core::ids::ToolCallId;
use steward_core::runtime::{RuntimeEvent, UsageReport};

/// One parsed incoming frame.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Incoming {
    System {
        #[serde(default)]
        subtype: Option<String>,
    },
    Assistant {
        message: WireMessage,
    },
    User {
        message: WireMessage,
    },
    Result {
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        total_cost_usd: f64,
        #[serde(default)]
        num_turns: u32,
        #[serde(default)]
        usage: WireUsage,
    },
    ControlRequest {
        request_id: String,
        request: ControlRequest,
    },
    ControlResponse {},
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Default, Deserialize)]
pub struct WireMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum ControlRequest {
    CanUseTool {
        tool_name: String,
        #[serde(default)]
        input: Value,
        #[serde(default)]
        tool_use_id: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Default, Deserialize)]
pub struct WireUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
}

/// Parse one protocol line.
pub fn parse_line(line: &str) -> Result<Incoming, serde_json::Error> {
    serde_json::from_str(line)
}

/// Translate an incoming frame into zero or more runtime events.
pub fn events_from(incoming: Incoming) -> Vec<RuntimeEvent> {
    match incoming {
        Incoming::Assistant { message } | Incoming::User { message } => message
            .content
            .into_iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(RuntimeEvent::AssistantText { text }),
                ContentBlock::ToolUse { id, name, input } => Some(RuntimeEvent::ToolUse {
                    tool_use_id: ToolCallId::from_raw(id),
                    tool_name: name,
                    input,
                }),
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => Some(RuntimeEvent::ToolResult {
                    tool_use_id: ToolCallId::from_raw(tool_use_id),
                    output: content,
                    is_error,
                }),
                ContentBlock::Unknown => None,
            })
            .collect(),
        Incoming::Result {
            is_error,
            result,
            total_cost_usd,
            num_turns,
            usage,
        } => vec![RuntimeEvent::Completed {
            result,
            usage: UsageReport {
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                cache_read_tokens: usage.cache_read_input_tokens,
                cache_creation_tokens: usage.cache_creation_input_tokens,
                cost_usd: total_cost_usd,
                num_turns,
            },
            is_error,
        }],
        Incoming::System { .. }
        | Incoming::ControlRequest { .. }
        | Incoming::ControlResponse {}
        | Incoming::Unknown => Vec::new(),
    }
}

/// Outgoing user message frame.
pub fn user_message(prompt: &str) -> Value {
    json!({
        "type": "user",
        "message": {
            "role": "user",
            "content": [{"type": "text", "text": prompt}],
        },
    })
}

/// Outgoing allow response to a can_use_tool control request.
pub fn allow_response(request_id: &str, updated_input: &Value) -> Value {
    json!({
        "type": "control_response",
        "response": {
            "subtype": "success",
            "request_id": request_id,
            "response": {"behavior": "allow", "updatedInput": updated_input},
        },
    })
}

/// Outgoing deny response to a can_use_tool control request.
pub fn deny_response(request_id: &str, reason: &str) -> Value {
    json!({
        "type": "control_response",
        "response": {
            "subtype": "success",
            "request_id": request_id,
            "response": {"behavior": "deny", "message": reason},
        },
    })
}
