use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// How the runtime treats tool invocations that no policy covers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    #[default]
    Default,
    AcceptEdits,
    Plan,
    BypassPermissions,
}

impl std::fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Default => f.write_str("default"),
            Self::AcceptEdits => f.write_str("accept_edits"),
            Self::Plan => f.write_str("plan"),
            Self::BypassPermissions => f.write_str("bypass_permissions"),
        }
    }
}

/// Launch configuration for an MCP tool server made available to a session.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Runtime configuration carried by every session. Copied wholesale into
/// forked children.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentConfig {
    pub model: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Tool-name glob patterns permitted for this session.
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    /// Tool-name glob patterns refused outright. Deny wins over allow.
    #[serde(default)]
    pub disallowed_tools: Vec<String>,
    #[serde(default)]
    pub permission_mode: PermissionMode,
    #[serde(default)]
    pub mcp_servers: HashMap<String, McpServerConfig>,
    #[serde(default)]
    pub max_turns: Option<u32>,
    /// Wall-clock bound on a single connect attempt.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_timeout_seconds() -> u64 {
    30
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-5".to_string(),
            system_prompt: None,
            allowed_tools: Vec::new(),
            disallowed_tools: Vec::new(),
            permission_mode: PermissionMode::Default,
            mcp_servers: HashMap::new(),
            max_turns: None,
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = AgentConfig::default();
        assert_eq!(cfg.permission_mode, PermissionMode::Default);
        assert!(cfg.allowed_tools.is_empty());
        assert_eq!(cfg.timeout_seconds, 30);
    }

    #[test]
    fn serde_roundtrip() {
        let mut cfg = AgentConfig::default();
        cfg.disallowed_tools.push("Bash".into());
        cfg.mcp_servers.insert(
            "search".into(),
            McpServerConfig {
                command: "mcp-search".into(),
                args: vec!["--stdio".into()],
                env: HashMap::new(),
            },
        );
        let json = serde_json::to_string(&cfg).unwrap();
        let parsed: AgentConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.disallowed_tools, vec!["Bash".to_string()]);
        assert_eq!(parsed.mcp_servers["search"].command, "mcp-search");
    }

    #[test]
    fn missing_fields_use_defaults() {
        let parsed: AgentConfig = serde_json::from_str(r#"{"model": "m1"}"#).unwrap();
        assert_eq!(parsed.model, "m1");
        assert_eq!(parsed.timeout_seconds, 30);
        assert!(parsed.mcp_servers.is_empty());
    }

    #[test]
    fn permission_mode_serde() {
        let json = serde_json::to_string(&PermissionMode::AcceptEdits).unwrap();
        assert_eq!(json, r#""accept_edits""#);
    }
}
