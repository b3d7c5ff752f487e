use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{McpServerConfig, PermissionMode};
use crate::hooks::HookPayload;
use crate::ids::{SessionId, ToolCallId};

/// Token/cost usage attached to a terminal result event.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageReport {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cost_usd: f64,
    pub num_turns: u32,
}

/// Typed events yielded by a runtime connection's receive stream.
///
/// Per query: zero or more AssistantText / ToolUse / ToolResult events,
/// then exactly one terminal Completed.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuntimeEvent {
    AssistantText {
        text: String,
    },
    ToolUse {
        tool_use_id: ToolCallId,
        tool_name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: ToolCallId,
        output: Value,
        is_error: bool,
    },
    Completed {
        result: Option<String>,
        usage: UsageReport,
        is_error: bool,
    },
}

impl RuntimeEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Verdict returned by a tool-authorization check.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum PolicyVerdict {
    Allow,
    Deny { reason: String },
}

impl PolicyVerdict {
    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow)
    }

    pub fn decision_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny { .. } => "deny",
        }
    }
}

/// Tool-authorization callback wired into a connection at create time.
/// The runtime consults it before every tool invocation.
#[async_trait]
pub trait ToolAuthorizer: Send + Sync {
    async fn authorize(&self, tool_name: &str, input: &Value, tool_use_id: &ToolCallId) -> PolicyVerdict;
}

/// Observer callback for runtime-initiated lifecycle events.
#[async_trait]
pub trait RuntimeObserver: Send + Sync {
    async fn notify(&self, session_id: &SessionId, payload: HookPayload, tool_use_id: Option<ToolCallId>);
}

/// Everything a runtime needs to open one session-scoped connection.
#[derive(Clone)]
pub struct ConnectSpec {
    pub session_id: SessionId,
    pub model: String,
    pub system_prompt: Option<String>,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub permission_mode: PermissionMode,
    pub working_directory: String,
    pub mcp_servers: HashMap<String, McpServerConfig>,
    pub authorizer: Arc<dyn ToolAuthorizer>,
    pub observer: Arc<dyn RuntimeObserver>,
}

impl std::fmt::Debug for ConnectSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectSpec")
            .field("session_id", &self.session_id)
            .field("model", &self.model)
            .field("permission_mode", &self.permission_mode)
            .field("working_directory", &self.working_directory)
            .field("allowed_tools", &self.allowed_tools)
            .field("disallowed_tools", &self.disallowed_tools)
            .field("mcp_servers", &self.mcp_servers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Errors raised at the runtime boundary. Transient errors are eligible for
/// connect-time retry with backoff; everything else fails the session.
#[derive(Clone, Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("connect timeout after {0:?}")]
    ConnectTimeout(Duration),
    #[error("spawn failed: {0}")]
    Spawn(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("runtime process exited: {0}")]
    ProcessExited(String),
    #[error("connection closed")]
    Closed,
}

impl RuntimeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectionFailed(_) | Self::ConnectTimeout(_))
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::ConnectionFailed(_) => "connection_failed",
            Self::ConnectTimeout(_) => "connect_timeout",
            Self::Spawn(_) => "spawn_failed",
            Self::Protocol(_) => "protocol_error",
            Self::ProcessExited(_) => "process_exited",
            Self::Closed => "closed",
        }
    }
}

pub type EventStream = Pin<Box<dyn Stream<Item = RuntimeEvent> + Send>>;

/// A live, session-scoped handle to the external runtime.
#[async_trait]
pub trait RuntimeConnection: Send + Sync {
    /// Forward a user prompt.
    async fn query(&mut self, prompt: &str) -> Result<(), RuntimeError>;

    /// Lazy, non-restartable event sequence for the in-flight query. Ends
    /// after yielding the terminal Completed event.
    fn receive(&mut self) -> EventStream;

    async fn close(&mut self) -> Result<(), RuntimeError>;
}

/// Factory for session-scoped connections. The runtime itself is opaque;
/// this is the entire surface the broker depends on.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    fn name(&self) -> &str;

    async fn connect(&self, spec: ConnectSpec) -> Result<Box<dyn RuntimeConnection>, RuntimeError>;
}
