//! Process-backed agent runtime.
//!
//! Spawns the agent CLI with stream-JSON input/output, answers its
//! tool-authorization control requests over stdin, and surfaces the typed
//! event stream to the broker.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use steward_core::hooks::HookPayload;
use steward_core::ids::{SessionId, ToolCallId};
use steward_core::runtime::{
    AgentRuntime, ConnectSpec, EventStream, PolicyVerdict, RuntimeConnection, RuntimeError,
    RuntimeEvent, RuntimeObserver, ToolAuthorizer,
};

use crate::wire;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Runtime that drives an external agent CLI process, one per connection.
pub struct ProcessRuntime {
    program: String,
    extra_args: Vec<String>,
}

impl ProcessRuntime {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            extra_args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }
}

/// CLI arguments derived from the connect spec.
fn build_args(spec: &ConnectSpec, extra: &[String]) -> Vec<String> {
    let mut args = vec![
        "--input-format".to_string(),
        "stream-json".to_string(),
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--verbose".to_string(),
        "--model".to_string(),
        spec.model.clone(),
        "--permission-mode".to_string(),
        spec.permission_mode.to_string(),
    ];
    if let Some(prompt) = &spec.system_prompt {
        args.push("--system-prompt".to_string());
        args.push(prompt.clone());
    }
    if !spec.allowed_tools.is_empty() {
        args.push("--allowed-tools".to_string());
        args.push(spec.allowed_tools.join(","));
    }
    if !spec.disallowed_tools.is_empty() {
        args.push("--disallowed-tools".to_string());
        args.push(spec.disallowed_tools.join(","));
    }
    if !spec.mcp_servers.is_empty() {
        let config = serde_json::json!({"mcpServers": spec.mcp_servers});
        args.push("--mcp-config".to_string());
        args.push(config.to_string());
    }
    args.extend(extra.iter().cloned());
    args
}

#[async_trait]
impl AgentRuntime for ProcessRuntime {
    fn name(&self) -> &str {
        "process"
    }

    async fn connect(&self, spec: ConnectSpec) -> Result<Box<dyn RuntimeConnection>, RuntimeError> {
        let args = build_args(&spec, &self.extra_args);
        debug!(program = %self.program, session_id = %spec.session_id, "spawning agent process");

        let mut child = tokio::process::Command::new(&self.program)
            .args(&args)
            .current_dir(&spec.working_directory)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| RuntimeError::Spawn(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RuntimeError::Spawn("no stdin handle".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RuntimeError::Spawn("no stdout handle".into()))?;
        if let Some(stderr) = child.stderr.take() {
            let session_id = spec.session_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(session_id = %session_id, line = %line, "agent stderr");
                }
            });
        }

        let stdin = Arc::new(Mutex::new(stdin));
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let reader_task = tokio::spawn(read_loop(
            stdout,
            events_tx,
            Arc::clone(&stdin),
            Arc::clone(&spec.authorizer),
            Arc::clone(&spec.observer),
            spec.session_id.clone(),
        ));

        Ok(Box::new(ProcessConnection {
            child,
            stdin,
            events_rx: Arc::new(Mutex::new(events_rx)),
            reader_task,
            closed: false,
        }))
    }
}

/// Reads stdout frames, answers control requests inline, and forwards
/// runtime events. Ends at EOF or when the receiver is dropped.
async fn read_loop(
    stdout: ChildStdout,
    events_tx: mpsc::Sender<RuntimeEvent>,
    stdin: Arc<Mutex<ChildStdin>>,
    authorizer: Arc<dyn ToolAuthorizer>,
    observer: Arc<dyn RuntimeObserver>,
    session_id: SessionId,
) {
    let mut lines = BufReader::new(stdout).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "agent stdout read failed");
                break;
            }
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let incoming = match wire::parse_line(trimmed) {
            Ok(incoming) => incoming,
            Err(e) => {
                debug!(session_id = %session_id, error = %e, "unparseable agent frame skipped");
                continue;
            }
        };

        match incoming {
            wire::Incoming::ControlRequest { request_id, request } => {
                handle_control_request(&stdin, &authorizer, &session_id, request_id, request).await;
            }
            wire::Incoming::System { subtype } => {
                if subtype.as_deref() == Some("compact_boundary") {
                    observer
                        .notify(
                            &session_id,
                            HookPayload::PreCompact { trigger: "auto".into() },
                            None,
                        )
                        .await;
                }
            }
            other => {
                for event in wire::events_from(other) {
                    if events_tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

async fn handle_control_request(
    stdin: &Arc<Mutex<ChildStdin>>,
    authorizer: &Arc<dyn ToolAuthorizer>,
    session_id: &SessionId,
    request_id: String,
    request: wire::ControlRequest,
) {
    let response = match request {
        wire::ControlRequest::CanUseTool {
            tool_name,
            input,
            tool_use_id,
        } => {
            let tool_use_id = tool_use_id
                .map(ToolCallId::from_raw)
                .unwrap_or_default();
            match authorizer.authorize(&tool_name, &input, &tool_use_id).await {
                PolicyVerdict::Allow => wire::allow_response(&request_id, &input),
                PolicyVerdict::Deny { reason } => {
                    debug!(session_id = %session_id, tool_name, reason, "tool denied");
                    wire::deny_response(&request_id, &reason)
                }
            }
        }
        wire::ControlRequest::Unknown => {
            // Unknown control subtypes are refused rather than silently allowed.
            wire::deny_response(&request_id, "unsupported control request")
        }
    };

    if let Err(e) = write_frame(stdin, &response).await {
        warn!(session_id = %session_id, error = %e, "control response write failed");
    }
}

async fn write_frame(
    stdin: &Arc<Mutex<ChildStdin>>,
    frame: &serde_json::Value,
) -> Result<(), RuntimeError> {
    let mut guard = stdin.lock().await;
    let line = frame.to_string();
    guard
        .write_all(line.as_bytes())
        .await
        .map_err(|e| RuntimeError::ProcessExited(e.to_string()))?;
    guard
        .write_all(b"\n")
        .await
        .map_err(|e| RuntimeError::ProcessExited(e.to_string()))?;
    guard
        .flush()
        .await
        .map_err(|e| RuntimeError::ProcessExited(e.to_string()))?;
    Ok(())
}

struct ProcessConnection {
    child: Child,
    stdin: Arc<Mutex<ChildStdin>>,
    events_rx: Arc<Mutex<mpsc::Receiver<RuntimeEvent>>>,
    reader_task: tokio::task::JoinHandle<()>,
    closed: bool,
}

#[async_trait]
impl RuntimeConnection for ProcessConnection {
    async fn query(&mut self, prompt: &str) -> Result<(), RuntimeError> {
        if self.closed {
            return Err(RuntimeError::Closed);
        }
        write_frame(&self.stdin, &wire::user_message(prompt)).await
    }

    fn receive(&mut self) -> EventStream {
        let rx = Arc::clone(&self.events_rx);
        Box::pin(futures::stream::unfold((rx, false), |(rx, done)| async move {
            if done {
                return None;
            }
            let event = rx.lock().await.recv().await?;
            let terminal = event.is_terminal();
            Some((event, (rx, terminal)))
        }))
    }

    async fn close(&mut self) -> Result<(), RuntimeError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.reader_task.abort();
        self.child
            .start_kill()
            .map_err(|e| RuntimeError::ProcessExited(e.to_string()))?;
        Ok(())
    }
}

impl Drop for ProcessConnection {
    fn drop(&mut self) {
        if !self.closed {
            self.reader_task.abort();
            let _ = self.child.start_kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use steward_core::config::{AgentConfig, McpServerConfig, PermissionMode};

    struct AllowAll;
    #[async_trait]
    impl ToolAuthorizer for AllowAll {
        async fn authorize(
            &self,
            _tool_name: &str,
            _input: &serde_json::Value,
            _tool_use_id: &ToolCallId,
        ) -> PolicyVerdict {
            PolicyVerdict::Allow
        }
    }

    struct NullObserver;
    #[async_trait]
    impl RuntimeObserver for NullObserver {
        async fn notify(
            &self,
            _session_id: &SessionId,
            _payload: HookPayload,
            _tool_use_id: Option<ToolCallId>,
        ) {
        }
    }

    fn spec() -> ConnectSpec {
        let mut config = AgentConfig::default();
        config.allowed_tools = vec!["Read".into(), "Glob".into()];
        config.disallowed_tools = vec!["Bash".into()];
        config.permission_mode = PermissionMode::AcceptEdits;
        config.mcp_servers.insert(
            "search".into(),
            McpServerConfig {
                command: "mcp-search".into(),
                args: vec![],
                env: Default::default(),
            },
        );
        ConnectSpec {
            session_id: SessionId::new(),
            model: config.model.clone(),
            system_prompt: Some("be brief".into()),
            allowed_tools: config.allowed_tools.clone(),
            disallowed_tools: config.disallowed_tools.clone(),
            permission_mode: config.permission_mode,
            working_directory: "/tmp".into(),
            mcp_servers: config.mcp_servers.clone(),
            authorizer: Arc::new(AllowAll),
            observer: Arc::new(NullObserver),
        }
    }

    #[test]
    fn args_carry_model_and_permission_mode() {
        let args = build_args(&spec(), &[]);
        let joined = args.join(" ");
        assert!(joined.contains("--output-format stream-json"));
        assert!(joined.contains("--model claude-sonnet-4-5"));
        assert!(joined.contains("--permission-mode accept_edits"));
        assert!(joined.contains("--system-prompt be brief"));
    }

    #[test]
    fn args_carry_tool_lists() {
        let args = build_args(&spec(), &[]);
        let allowed_idx = args.iter().position(|a| a == "--allowed-tools").unwrap();
        assert_eq!(args[allowed_idx + 1], "Read,Glob");
        let disallowed_idx = args.iter().position(|a| a == "--disallowed-tools").unwrap();
        assert_eq!(args[disallowed_idx + 1], "Bash");
    }

    #[test]
    fn args_carry_mcp_config() {
        let args = build_args(&spec(), &[]);
        let idx = args.iter().position(|a| a == "--mcp-config").unwrap();
        let config: serde_json::Value = serde_json::from_str(&args[idx + 1]).unwrap();
        assert_eq!(config["mcpServers"]["search"]["command"], "mcp-search");
    }

    #[test]
    fn empty_lists_are_omitted() {
        let mut s = spec();
        s.allowed_tools.clear();
        s.disallowed_tools.clear();
        s.mcp_servers.clear();
        s.system_prompt = None;
        let args = build_args(&s, &[]);
        assert!(!args.contains(&"--allowed-tools".to_string()));
        assert!(!args.contains(&"--disallowed-tools".to_string()));
        assert!(!args.contains(&"--mcp-config".to_string()));
        assert!(!args.contains(&"--system-prompt".to_string()));
    }

    #[test]
    fn extra_args_appended() {
        let args = build_args(&spec(), &["--dangerously-skip-permissions".to_string()]);
        assert_eq!(args.last().unwrap(), "--dangerously-skip-permissions");
    }

    #[tokio::test]
    async fn spawn_failure_is_fatal() {
        let runtime = ProcessRuntime::new("definitely-not-a-real-binary-4321");
        let err = runtime.connect(spec()).await.err().expect("spawn must fail");
        assert!(matches!(err, RuntimeError::Spawn(_)));
        assert!(!err.is_transient());
    }
}
