use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle events the hook pipeline fires on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookEvent {
    PreToolUse,
    PostToolUse,
    UserPromptSubmit,
    Stop,
    SubagentStop,
    PreCompact,
}

impl HookEvent {
    /// Events carrying a tool-use id.
    pub fn is_tool_scoped(&self) -> bool {
        matches!(self, Self::PreToolUse | Self::PostToolUse)
    }
}

impl std::fmt::Display for HookEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::PreToolUse => "pre_tool_use",
            Self::PostToolUse => "post_tool_use",
            Self::UserPromptSubmit => "user_prompt_submit",
            Self::Stop => "stop",
            Self::SubagentStop => "subagent_stop",
            Self::PreCompact => "pre_compact",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for HookEvent {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pre_tool_use" => Ok(Self::PreToolUse),
            "post_tool_use" => Ok(Self::PostToolUse),
            "user_prompt_submit" => Ok(Self::UserPromptSubmit),
            "stop" => Ok(Self::Stop),
            "subagent_stop" => Ok(Self::SubagentStop),
            "pre_compact" => Ok(Self::PreCompact),
            other => Err(format!("unknown hook event: {other}")),
        }
    }
}

/// Typed payload delivered to hooks, one closed variant per event.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HookPayload {
    PreToolUse {
        tool_name: String,
        tool_input: Value,
    },
    PostToolUse {
        tool_name: String,
        tool_input: Value,
        tool_output: Value,
    },
    UserPromptSubmit {
        prompt: String,
    },
    Stop {
        reason: Option<String>,
    },
    SubagentStop {
        agent_name: Option<String>,
    },
    PreCompact {
        trigger: String,
    },
}

impl HookPayload {
    pub fn event(&self) -> HookEvent {
        match self {
            Self::PreToolUse { .. } => HookEvent::PreToolUse,
            Self::PostToolUse { .. } => HookEvent::PostToolUse,
            Self::UserPromptSubmit { .. } => HookEvent::UserPromptSubmit,
            Self::Stop { .. } => HookEvent::Stop,
            Self::SubagentStop { .. } => HookEvent::SubagentStop,
            Self::PreCompact { .. } => HookEvent::PreCompact,
        }
    }
}

/// Accumulated outcome of a pipeline run.
///
/// Starts as `{continue: true}`; each hook's fields merge over the previous
/// ones and a hook clearing `continue_run` stops the pipeline.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HookDirective {
    pub continue_run: bool,
    #[serde(default)]
    pub fields: serde_json::Map<String, Value>,
}

impl Default for HookDirective {
    fn default() -> Self {
        Self {
            continue_run: true,
            fields: serde_json::Map::new(),
        }
    }
}

impl HookDirective {
    pub fn halt(reason: impl Into<String>) -> Self {
        let mut fields = serde_json::Map::new();
        fields.insert("reason".into(), Value::String(reason.into()));
        Self {
            continue_run: false,
            fields,
        }
    }

    /// Merge another directive over this one. Later keys overwrite.
    pub fn absorb(&mut self, other: HookDirective) {
        self.continue_run = other.continue_run;
        for (k, v) in other.fields {
            self.fields.insert(k, v);
        }
    }
}
