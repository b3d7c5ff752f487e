//! Built-in policies: session tool allow/deny lists and shell command
//! pattern denial.

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;

use steward_core::config::AgentConfig;

use crate::error::PolicyError;
use crate::policy::{Policy, PolicyContext, PolicyVote};

/// Shell-style tools whose input carries a `command` string.
const COMMAND_TOOLS: &[&str] = &["Bash", "Shell", "Exec"];

/// Command patterns denied by default.
pub fn default_deny_patterns() -> Vec<String> {
    vec![
        // rm -rf on root or wildcard root
        r"(?i)(sudo\s+)?rm\s+(-rf?|--force)\s+/(\s*$|\*)".to_string(),
        // fork bomb
        r":\(\)\s*\{\s*:\|\s*:\s*&\s*\}\s*;\s*:".to_string(),
        // raw writes to block devices
        r"(?i)(sudo\s+)?dd\s+if=.*of=/dev/[sh]d[a-z]".to_string(),
        r"(?i)>\s*/dev/[sh]d[a-z]".to_string(),
        // filesystem creation
        r"(?i)^(sudo\s+)?mkfs\.".to_string(),
    ]
}

/// Enforces the session's tool allow/deny lists (glob patterns over tool
/// names). Deny wins over allow; an empty allow list permits everything
/// not explicitly denied.
pub struct ToolListPolicy {
    allowed: Vec<glob::Pattern>,
    disallowed: Vec<glob::Pattern>,
}

impl ToolListPolicy {
    pub fn from_config(config: &AgentConfig) -> Result<Self, PolicyError> {
        Ok(Self {
            allowed: compile_globs(&config.allowed_tools)?,
            disallowed: compile_globs(&config.disallowed_tools)?,
        })
    }
}

fn compile_globs(patterns: &[String]) -> Result<Vec<glob::Pattern>, PolicyError> {
    patterns
        .iter()
        .map(|p| {
            glob::Pattern::new(p).map_err(|e| PolicyError::InvalidPattern {
                pattern: p.clone(),
                detail: e.to_string(),
            })
        })
        .collect()
}

#[async_trait]
impl Policy for ToolListPolicy {
    fn name(&self) -> &str {
        "tool_lists"
    }

    fn priority(&self) -> u32 {
        10
    }

    fn applies_to(&self, _tool_name: &str) -> bool {
        true
    }

    async fn evaluate(
        &self,
        tool_name: &str,
        _input: &Value,
        _ctx: &PolicyContext,
    ) -> Result<PolicyVote, PolicyError> {
        if self.disallowed.iter().any(|p| p.matches(tool_name)) {
            return Ok(PolicyVote::deny(format!("tool '{tool_name}' is disallowed")));
        }
        if !self.allowed.is_empty() && !self.allowed.iter().any(|p| p.matches(tool_name)) {
            return Ok(PolicyVote::deny(format!(
                "tool '{tool_name}' is not in the allow list"
            )));
        }
        Ok(PolicyVote::Allow)
    }
}

/// Denies shell commands matching any configured regex pattern.
pub struct CommandPatternPolicy {
    patterns: Vec<Regex>,
}

impl CommandPatternPolicy {
    pub fn new(patterns: &[String]) -> Result<Self, PolicyError> {
        let compiled = patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| PolicyError::InvalidPattern {
                    pattern: p.clone(),
                    detail: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns: compiled })
    }

    pub fn with_defaults() -> Self {
        Self::new(&default_deny_patterns()).expect("default patterns are valid")
    }
}

#[async_trait]
impl Policy for CommandPatternPolicy {
    fn name(&self) -> &str {
        "command_patterns"
    }

    fn priority(&self) -> u32 {
        20
    }

    fn applies_to(&self, tool_name: &str) -> bool {
        COMMAND_TOOLS.contains(&tool_name)
    }

    async fn evaluate(
        &self,
        _tool_name: &str,
        input: &Value,
        _ctx: &PolicyContext,
    ) -> Result<PolicyVote, PolicyError> {
        let Some(command) = input.get("command").and_then(Value::as_str) else {
            return Ok(PolicyVote::Allow);
        };
        for pattern in &self.patterns {
            if pattern.is_match(command) {
                return Ok(PolicyVote::deny(format!(
                    "command matches denied pattern '{}'",
                    pattern.as_str()
                )));
            }
        }
        Ok(PolicyVote::Allow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> PolicyContext {
        PolicyContext::default()
    }

    #[tokio::test]
    async fn disallowed_tool_denied() {
        let mut config = AgentConfig::default();
        config.disallowed_tools.push("Bash".into());
        let policy = ToolListPolicy::from_config(&config).unwrap();

        let vote = policy.evaluate("Bash", &json!({}), &ctx()).await.unwrap();
        assert!(matches!(vote, PolicyVote::Deny { .. }));

        let vote = policy.evaluate("Read", &json!({}), &ctx()).await.unwrap();
        assert_eq!(vote, PolicyVote::Allow);
    }

    #[tokio::test]
    async fn allow_list_excludes_everything_else() {
        let mut config = AgentConfig::default();
        config.allowed_tools.push("Read".into());
        config.allowed_tools.push("Glob".into());
        let policy = ToolListPolicy::from_config(&config).unwrap();

        assert_eq!(policy.evaluate("Read", &json!({}), &ctx()).await.unwrap(), PolicyVote::Allow);
        assert!(matches!(
            policy.evaluate("Bash", &json!({}), &ctx()).await.unwrap(),
            PolicyVote::Deny { .. }
        ));
    }

    #[tokio::test]
    async fn deny_wins_over_allow() {
        let mut config = AgentConfig::default();
        config.allowed_tools.push("*".into());
        config.disallowed_tools.push("Bash".into());
        let policy = ToolListPolicy::from_config(&config).unwrap();

        assert!(matches!(
            policy.evaluate("Bash", &json!({}), &ctx()).await.unwrap(),
            PolicyVote::Deny { .. }
        ));
    }

    #[tokio::test]
    async fn glob_patterns_match_tool_families() {
        let mut config = AgentConfig::default();
        config.disallowed_tools.push("mcp__*".into());
        let policy = ToolListPolicy::from_config(&config).unwrap();

        assert!(matches!(
            policy.evaluate("mcp__search__query", &json!({}), &ctx()).await.unwrap(),
            PolicyVote::Deny { .. }
        ));
        assert_eq!(policy.evaluate("Read", &json!({}), &ctx()).await.unwrap(), PolicyVote::Allow);
    }

    #[test]
    fn invalid_glob_is_rejected() {
        let mut config = AgentConfig::default();
        config.allowed_tools.push("[".into());
        assert!(matches!(
            ToolListPolicy::from_config(&config),
            Err(PolicyError::InvalidPattern { .. })
        ));
    }

    #[tokio::test]
    async fn command_pattern_denies_destructive_command() {
        let policy = CommandPatternPolicy::new(&[r"rm\s+-rf".to_string()]).unwrap();
        let vote = policy
            .evaluate("Bash", &json!({"command": "rm -rf /"}), &ctx())
            .await
            .unwrap();
        match vote {
            PolicyVote::Deny { reason } => assert!(reason.contains("denied pattern")),
            PolicyVote::Allow => panic!("destructive command must be denied"),
        }
    }

    #[tokio::test]
    async fn command_pattern_allows_benign_command() {
        let policy = CommandPatternPolicy::with_defaults();
        let vote = policy
            .evaluate("Bash", &json!({"command": "ls -la"}), &ctx())
            .await
            .unwrap();
        assert_eq!(vote, PolicyVote::Allow);
    }

    #[tokio::test]
    async fn defaults_catch_root_wipe_and_fork_bomb() {
        let policy = CommandPatternPolicy::with_defaults();
        for cmd in ["rm -rf /", "sudo rm -rf /*", ":(){ :|: &};:", "mkfs.ext4 /dev/sda1"] {
            let vote = policy
                .evaluate("Bash", &json!({"command": cmd}), &ctx())
                .await
                .unwrap();
            assert!(matches!(vote, PolicyVote::Deny { .. }), "{cmd} should be denied");
        }
    }

    #[tokio::test]
    async fn missing_command_field_allows() {
        let policy = CommandPatternPolicy::with_defaults();
        let vote = policy.evaluate("Bash", &json!({"script": "x"}), &ctx()).await.unwrap();
        assert_eq!(vote, PolicyVote::Allow);
    }

    #[test]
    fn applies_only_to_command_tools() {
        let policy = CommandPatternPolicy::with_defaults();
        assert!(policy.applies_to("Bash"));
        assert!(policy.applies_to("Shell"));
        assert!(!policy.applies_to("Read"));
    }

    #[test]
    fn invalid_regex_is_rejected() {
        assert!(matches!(
            CommandPatternPolicy::new(&["(".to_string()]),
            Err(PolicyError::InvalidPattern { .. })
        ));
    }
}
