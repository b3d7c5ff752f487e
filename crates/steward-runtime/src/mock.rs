use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream;
use serde_json::json;
use tokio::sync::Mutex;

use steward_core::ids::ToolCallId;
use steward_core::runtime::{
    AgentRuntime, ConnectSpec, EventStream, PolicyVerdict, RuntimeConnection, RuntimeError,
    RuntimeEvent, ToolAuthorizer, UsageReport,
};

/// Pre-programmed behavior for one `connect` or `query` call.
pub enum MockScript {
    /// Events emitted for one query, in order.
    Events(Vec<RuntimeEvent>),
}

impl MockScript {
    /// A plain text reply followed by a successful result.
    pub fn text(text: &str) -> Self {
        Self::Events(vec![
            RuntimeEvent::AssistantText { text: text.into() },
            RuntimeEvent::Completed {
                result: Some(text.into()),
                usage: UsageReport {
                    input_tokens: 10,
                    output_tokens: 5,
                    cache_read_tokens: 0,
                    cache_creation_tokens: 0,
                    cost_usd: 0.001,
                    num_turns: 1,
                },
                is_error: false,
            },
        ])
    }

    /// One tool round trip, then a text reply and a successful result.
    pub fn tool_roundtrip(tool_use_id: &str, tool_name: &str, input: serde_json::Value) -> Self {
        Self::Events(vec![
            RuntimeEvent::ToolUse {
                tool_use_id: ToolCallId::from_raw(tool_use_id),
                tool_name: tool_name.into(),
                input,
            },
            RuntimeEvent::ToolResult {
                tool_use_id: ToolCallId::from_raw(tool_use_id),
                output: json!({"ok": true}),
                is_error: false,
            },
            RuntimeEvent::AssistantText { text: "done".into() },
            RuntimeEvent::Completed {
                result: Some("done".into()),
                usage: UsageReport {
                    input_tokens: 20,
                    output_tokens: 10,
                    cache_read_tokens: 0,
                    cache_creation_tokens: 0,
                    cost_usd: 0.002,
                    num_turns: 2,
                },
                is_error: false,
            },
        ])
    }
}

/// In-memory runtime that replays scripts instead of talking to anything.
///
/// Tool-use events are passed through the wired authorizer, the way the
/// real runtime consults its tool gate: a denied tool call emits a
/// synthesized error result instead of the scripted one.
pub struct MockRuntime {
    scripts: Arc<Mutex<VecDeque<Vec<RuntimeEvent>>>>,
    connect_failures: AtomicUsize,
    connect_attempts: Arc<AtomicUsize>,
    close_count: Arc<AtomicUsize>,
    fail_on_close: AtomicBool,
}

impl MockRuntime {
    pub fn new(scripts: Vec<MockScript>) -> Self {
        let queue = scripts
            .into_iter()
            .map(|s| match s {
                MockScript::Events(events) => events,
            })
            .collect();
        Self {
            scripts: Arc::new(Mutex::new(queue)),
            connect_failures: AtomicUsize::new(0),
            connect_attempts: Arc::new(AtomicUsize::new(0)),
            close_count: Arc::new(AtomicUsize::new(0)),
            fail_on_close: AtomicBool::new(false),
        }
    }

    /// Fail the first `n` connect attempts with a transient error.
    pub fn with_connect_failures(self, n: usize) -> Self {
        self.connect_failures.store(n, Ordering::Relaxed);
        self
    }

    /// Make every close fail (close failures must be logged, not raised).
    pub fn with_failing_close(self) -> Self {
        self.fail_on_close.store(true, Ordering::Relaxed);
        self
    }

    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::Relaxed)
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl AgentRuntime for MockRuntime {
    fn name(&self) -> &str {
        "mock"
    }

    async fn connect(&self, spec: ConnectSpec) -> Result<Box<dyn RuntimeConnection>, RuntimeError> {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);

        let remaining = self.connect_failures.load(Ordering::Relaxed);
        if remaining > 0 {
            self.connect_failures.store(remaining - 1, Ordering::Relaxed);
            return Err(RuntimeError::ConnectionFailed("mock connect refused".into()));
        }

        Ok(Box::new(MockConnection {
            scripts: Arc::clone(&self.scripts),
            authorizer: Arc::clone(&spec.authorizer),
            emitted: None,
            closed: false,
            close_count: Arc::clone(&self.close_count),
            fail_on_close: self.fail_on_close.load(Ordering::Relaxed),
        }))
    }
}

struct MockConnection {
    scripts: Arc<Mutex<VecDeque<Vec<RuntimeEvent>>>>,
    authorizer: Arc<dyn ToolAuthorizer>,
    emitted: Option<Vec<RuntimeEvent>>,
    closed: bool,
    close_count: Arc<AtomicUsize>,
    fail_on_close: bool,
}

impl MockConnection {
    /// Replay a script through the authorizer: a denied tool use keeps the
    /// tool-use event but replaces its scripted result with an error
    /// result, and drops the original.
    async fn authorize_script(&self, script: Vec<RuntimeEvent>) -> Vec<RuntimeEvent> {
        let mut denied: Vec<ToolCallId> = Vec::new();
        let mut out = Vec::with_capacity(script.len());

        for event in script {
            match event {
                RuntimeEvent::ToolUse {
                    tool_use_id,
                    tool_name,
                    input,
                } => {
                    let verdict = self
                        .authorizer
                        .authorize(&tool_name, &input, &tool_use_id)
                        .await;
                    out.push(RuntimeEvent::ToolUse {
                        tool_use_id: tool_use_id.clone(),
                        tool_name,
                        input,
                    });
                    if let PolicyVerdict::Deny { reason } = verdict {
                        out.push(RuntimeEvent::ToolResult {
                            tool_use_id: tool_use_id.clone(),
                            output: json!({"error": reason, "denied": true}),
                            is_error: true,
                        });
                        denied.push(tool_use_id);
                    }
                }
                RuntimeEvent::ToolResult { ref tool_use_id, .. }
                    if denied.contains(tool_use_id) => {}
                other => out.push(other),
            }
        }
        out
    }
}

#[async_trait]
impl RuntimeConnection for MockConnection {
    async fn query(&mut self, _prompt: &str) -> Result<(), RuntimeError> {
        if self.closed {
            return Err(RuntimeError::Closed);
        }
        let script = self
            .scripts
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| {
                vec![RuntimeEvent::Completed {
                    result: None,
                    usage: UsageReport::default(),
                    is_error: false,
                }]
            });
        self.emitted = Some(self.authorize_script(script).await);
        Ok(())
    }

    fn receive(&mut self) -> EventStream {
        let events = self.emitted.take().unwrap_or_default();
        Box::pin(stream::iter(events))
    }

    async fn close(&mut self) -> Result<(), RuntimeError> {
        self.closed = true;
        self.close_count.fetch_add(1, Ordering::Relaxed);
        if self.fail_on_close {
            return Err(RuntimeError::Protocol("mock close failure".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use steward_core::config::AgentConfig;
    use steward_core::hooks::HookPayload;
    use steward_core::ids::SessionId;
    use steward_core::runtime::RuntimeObserver;

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

    struct DenyAll;
    #[async_trait]
    impl ToolAuthorizer for DenyAll {
        async fn authorize(
            &self,
            tool_name: &str,
            _input: &serde_json::Value,
            _tool_use_id: &ToolCallId,
        ) -> PolicyVerdict {
            PolicyVerdict::Deny {
                reason: format!("{tool_name} refused"),
            }
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

    fn spec(authorizer: Arc<dyn ToolAuthorizer>) -> ConnectSpec {
        let config = AgentConfig::default();
        ConnectSpec {
            session_id: SessionId::new(),
            model: config.model,
            system_prompt: None,
            allowed_tools: Vec::new(),
            disallowed_tools: Vec::new(),
            permission_mode: Default::default(),
            working_directory: "/tmp".into(),
            mcp_servers: Default::default(),
            authorizer,
            observer: Arc::new(NullObserver),
        }
    }

    async fn drain(conn: &mut Box<dyn RuntimeConnection>) -> Vec<RuntimeEvent> {
        conn.receive().collect().await
    }

    #[tokio::test]
    async fn replays_text_script() {
        let runtime = MockRuntime::new(vec![MockScript::text("hello")]);
        let mut conn = runtime.connect(spec(Arc::new(AllowAll))).await.unwrap();
        conn.query("hi").await.unwrap();

        let events = drain(&mut conn).await;
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], RuntimeEvent::AssistantText { text } if text == "hello"));
        assert!(events[1].is_terminal());
    }

    #[tokio::test]
    async fn tool_roundtrip_passes_authorizer() {
        let runtime = MockRuntime::new(vec![MockScript::tool_roundtrip(
            "toolu_1",
            "Bash",
            json!({"command": "ls"}),
        )]);
        let mut conn = runtime.connect(spec(Arc::new(AllowAll))).await.unwrap();
        conn.query("run ls").await.unwrap();

        let events = drain(&mut conn).await;
        assert!(matches!(&events[0], RuntimeEvent::ToolUse { .. }));
        assert!(matches!(&events[1], RuntimeEvent::ToolResult { is_error: false, .. }));
    }

    #[tokio::test]
    async fn denied_tool_gets_error_result() {
        let runtime = MockRuntime::new(vec![MockScript::tool_roundtrip(
            "toolu_1",
            "Bash",
            json!({"command": "rm -rf /"}),
        )]);
        let mut conn = runtime.connect(spec(Arc::new(DenyAll))).await.unwrap();
        conn.query("wipe it").await.unwrap();

        let events = drain(&mut conn).await;
        // tool_use, synthesized error result, text, completed
        assert_eq!(events.len(), 4);
        match &events[1] {
            RuntimeEvent::ToolResult { output, is_error, .. } => {
                assert!(*is_error);
                assert_eq!(output["denied"], true);
                assert_eq!(output["error"], "Bash refused");
            }
            other => panic!("expected denied tool result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn connect_failures_then_success() {
        let runtime = MockRuntime::new(vec![MockScript::text("ok")]).with_connect_failures(2);

        assert!(runtime.connect(spec(Arc::new(AllowAll))).await.is_err());
        assert!(runtime.connect(spec(Arc::new(AllowAll))).await.is_err());
        assert!(runtime.connect(spec(Arc::new(AllowAll))).await.is_ok());
        assert_eq!(runtime.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn query_after_close_fails() {
        let runtime = MockRuntime::new(vec![MockScript::text("ok")]);
        let mut conn = runtime.connect(spec(Arc::new(AllowAll))).await.unwrap();
        conn.close().await.unwrap();
        assert!(matches!(conn.query("hi").await, Err(RuntimeError::Closed)));
        assert_eq!(runtime.close_count(), 1);
    }

    #[tokio::test]
    async fn receive_is_non_restartable() {
        let runtime = MockRuntime::new(vec![MockScript::text("once")]);
        let mut conn = runtime.connect(spec(Arc::new(AllowAll))).await.unwrap();
        conn.query("hi").await.unwrap();

        let first = drain(&mut conn).await;
        assert_eq!(first.len(), 2);
        let second = drain(&mut conn).await;
        assert!(second.is_empty(), "stream does not restart");
    }

    #[tokio::test]
    async fn exhausted_scripts_complete_empty() {
        let runtime = MockRuntime::new(vec![]);
        let mut conn = runtime.connect(spec(Arc::new(AllowAll))).await.unwrap();
        conn.query("hi").await.unwrap();
        let events = drain(&mut conn).await;
        assert_eq!(events.len(), 1);
        assert!(events[0].is_terminal());
    }
}
