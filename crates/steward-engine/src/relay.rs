//! Stream relay: consumes a connection's event stream, persisting
//! messages (with per-session sequence numbers) and tool calls, firing
//! pre/post tool-use hooks, and accumulating session metrics — in stream
//! order.

use std::sync::Arc;

use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use steward_core::events::BrokerEvent;
use steward_core::hooks::HookPayload;
use steward_core::runtime::{EventStream, RuntimeEvent};
use steward_core::session::Session;
use steward_hooks::{HookContext, HookPipeline};
use steward_store::audit::AuditRepo;
use steward_store::messages::{MessageRepo, MessageRole, MessageRow};
use steward_store::tool_calls::{ToolCallRepo, ToolCallStatus};
use steward_store::Database;

use crate::error::EngineError;

/// What one consumed exchange produced.
#[derive(Debug, Default)]
pub struct RelayOutcome {
    pub assistant_texts: Vec<String>,
    pub result: Option<String>,
    pub is_error: bool,
    pub got_terminal: bool,
}

pub struct StreamRelay {
    messages: MessageRepo,
    tool_calls: ToolCallRepo,
    hooks: Arc<HookPipeline>,
    audit: AuditRepo,
    events_tx: broadcast::Sender<BrokerEvent>,
}

impl StreamRelay {
    pub fn new(
        db: Database,
        hooks: Arc<HookPipeline>,
        events_tx: broadcast::Sender<BrokerEvent>,
    ) -> Self {
        Self {
            messages: MessageRepo::new(db.clone()),
            tool_calls: ToolCallRepo::new(db.clone()),
            hooks,
            audit: AuditRepo::new(db),
            events_tx,
        }
    }

    fn broadcast(&self, event: BrokerEvent) {
        // No subscribers is a no-op.
        let _ = self.events_tx.send(event);
    }

    fn hook_ctx(session: &Session) -> HookContext {
        HookContext {
            session_id: session.id.clone(),
            working_directory: Some(session.working_directory.clone()),
        }
    }

    /// Persist the outbound user prompt before it is forwarded.
    pub fn record_user_prompt(
        &self,
        session: &mut Session,
        prompt: &str,
    ) -> Result<MessageRow, EngineError> {
        let row = self
            .messages
            .append(&session.id, MessageRole::User, json!({"text": prompt}))?;
        session.record_message();
        self.broadcast(BrokerEvent::MessageAppended {
            session_id: session.id.clone(),
            message_id: row.id.clone(),
            role: row.role.to_string(),
            sequence: row.sequence,
        });
        Ok(row)
    }

    /// Consume the stream until its terminal result event.
    ///
    /// Events are applied strictly in arrival order. A tool-result with no
    /// matching pending tool call is logged, audited, and discarded.
    #[instrument(skip(self, session, stream, cancel), fields(session_id = %session.id))]
    pub async fn consume(
        &self,
        session: &mut Session,
        mut stream: EventStream,
        cancel: &CancellationToken,
    ) -> Result<RelayOutcome, EngineError> {
        let hook_ctx = Self::hook_ctx(session);
        let mut outcome = RelayOutcome::default();

        loop {
            let event = tokio::select! {
                event = stream.next() => match event {
                    Some(event) => event,
                    None => break,
                },
                _ = cancel.cancelled() => {
                    return Err(EngineError::Internal(
                        "session disconnected while consuming its stream".into(),
                    ));
                }
            };

            match event {
                RuntimeEvent::AssistantText { text } => {
                    let row = self.messages.append(
                        &session.id,
                        MessageRole::Assistant,
                        json!({"text": text}),
                    )?;
                    session.record_message();
                    self.broadcast(BrokerEvent::MessageAppended {
                        session_id: session.id.clone(),
                        message_id: row.id.clone(),
                        role: row.role.to_string(),
                        sequence: row.sequence,
                    });
                    self.broadcast(BrokerEvent::AssistantText {
                        session_id: session.id.clone(),
                        text: text.clone(),
                    });
                    outcome.assistant_texts.push(text);
                }

                RuntimeEvent::ToolUse {
                    tool_use_id,
                    tool_name,
                    input,
                } => {
                    self.hooks
                        .execute(
                            &HookPayload::PreToolUse {
                                tool_name: tool_name.clone(),
                                tool_input: input.clone(),
                            },
                            Some(&tool_use_id),
                            &hook_ctx,
                        )
                        .await;

                    self.tool_calls.insert_pending(
                        &session.id,
                        None,
                        &tool_use_id,
                        &tool_name,
                        &input,
                    )?;
                    session.record_tool_call();
                    self.broadcast(BrokerEvent::ToolCallStarted {
                        session_id: session.id.clone(),
                        tool_call_id: tool_use_id,
                        tool_name,
                    });
                }

                RuntimeEvent::ToolResult {
                    tool_use_id,
                    output,
                    is_error,
                } => {
                    let status = resolution_status(&output, is_error);
                    match self
                        .tool_calls
                        .resolve(&session.id, &tool_use_id, &output, status)?
                    {
                        Some(row) => {
                            self.hooks
                                .execute(
                                    &HookPayload::PostToolUse {
                                        tool_name: row.tool_name.clone(),
                                        tool_input: row.input.clone(),
                                        tool_output: output,
                                    },
                                    Some(&tool_use_id),
                                    &hook_ctx,
                                )
                                .await;
                            self.broadcast(BrokerEvent::ToolCallResolved {
                                session_id: session.id.clone(),
                                tool_call_id: tool_use_id,
                                status: status.to_string(),
                            });
                        }
                        None => {
                            warn!(
                                session_id = %session.id,
                                tool_use_id = %tool_use_id,
                                "tool result without matching pending call, discarded"
                            );
                            self.audit.log_event(
                                "orphan_tool_result",
                                Some(&session.id),
                                &json!({"tool_use_id": tool_use_id.as_str()}),
                            );
                        }
                    }
                }

                RuntimeEvent::Completed {
                    result,
                    usage,
                    is_error,
                } => {
                    session.metrics.accumulate(&usage);
                    self.hooks
                        .execute(
                            &HookPayload::Stop {
                                reason: result.clone(),
                            },
                            None,
                            &hook_ctx,
                        )
                        .await;
                    outcome.result = result;
                    outcome.is_error = is_error;
                    outcome.got_terminal = true;
                    break;
                }
            }
        }

        Ok(outcome)
    }
}

/// A runtime error result that was denied by policy resolves as denied,
/// any other error result as error.
fn resolution_status(output: &Value, is_error: bool) -> ToolCallStatus {
    if !is_error {
        return ToolCallStatus::Success;
    }
    if output.get("denied").and_then(Value::as_bool).unwrap_or(false) {
        ToolCallStatus::Denied
    } else {
        ToolCallStatus::Error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use steward_core::config::AgentConfig;
    use steward_core::hooks::{HookDirective, HookEvent};
    use steward_core::ids::{ToolCallId, UserId};
    use steward_core::runtime::UsageReport;
    use steward_core::session::SessionMode;
    use steward_hooks::{Hook, HookError};
    use steward_store::sessions::SessionRepo;

    fn setup() -> (Database, Session) {
        let db = Database::in_memory().unwrap();
        let session = Session::new(
            UserId::new(),
            SessionMode::Interactive,
            AgentConfig::default(),
            "/tmp",
        );
        SessionRepo::new(db.clone()).insert(&session).unwrap();
        (db, session)
    }

    fn relay(db: &Database) -> StreamRelay {
        let (tx, _rx) = broadcast::channel(64);
        StreamRelay::new(db.clone(), Arc::new(HookPipeline::new()), tx)
    }

    fn relay_with_hooks(db: &Database, hooks: HookPipeline) -> StreamRelay {
        let (tx, _rx) = broadcast::channel(64);
        StreamRelay::new(db.clone(), Arc::new(hooks), tx)
    }

    fn events(events: Vec<RuntimeEvent>) -> EventStream {
        Box::pin(stream::iter(events))
    }

    fn completed(turns: u32) -> RuntimeEvent {
        RuntimeEvent::Completed {
            result: Some("ok".into()),
            usage: UsageReport {
                input_tokens: 100,
                output_tokens: 40,
                cache_read_tokens: 0,
                cache_creation_tokens: 0,
                cost_usd: 0.01,
                num_turns: turns,
            },
            is_error: false,
        }
    }

    struct CountingHook {
        name: String,
        calls: AtomicUsize,
    }
    impl CountingHook {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                calls: AtomicUsize::new(0),
            })
        }
    }
    #[async_trait]
    impl Hook for CountingHook {
        fn name(&self) -> &str {
            &self.name
        }
        fn priority(&self) -> u32 {
            10
        }
        async fn run(
            &self,
            _payload: &HookPayload,
            _ctx: &HookContext,
        ) -> Result<HookDirective, HookError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(HookDirective::default())
        }
    }

    #[tokio::test]
    async fn persists_messages_in_sequence_order() {
        let (db, mut session) = setup();
        let relay = relay(&db);

        relay.record_user_prompt(&mut session, "hello").unwrap();
        let outcome = relay
            .consume(
                &mut session,
                events(vec![
                    RuntimeEvent::AssistantText { text: "one".into() },
                    RuntimeEvent::AssistantText { text: "two".into() },
                    completed(1),
                ]),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.assistant_texts, vec!["one", "two"]);
        assert!(outcome.got_terminal);

        let rows = MessageRepo::new(db).list(&session.id).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].sequence, 0);
        assert_eq!(rows[0].role, MessageRole::User);
        assert_eq!(rows[2].sequence, 2);
        assert_eq!(rows[2].content["text"], "two");
        assert_eq!(session.metrics.message_count, 3);
    }

    #[tokio::test]
    async fn tool_roundtrip_creates_and_resolves_record() {
        let (db, mut session) = setup();
        let relay = relay(&db);
        let tool_use = ToolCallId::from_raw("toolu_1");

        relay
            .consume(
                &mut session,
                events(vec![
                    RuntimeEvent::ToolUse {
                        tool_use_id: tool_use.clone(),
                        tool_name: "Read".into(),
                        input: json!({"path": "/etc/hosts"}),
                    },
                    RuntimeEvent::ToolResult {
                        tool_use_id: tool_use.clone(),
                        output: json!({"content": "127.0.0.1"}),
                        is_error: false,
                    },
                    completed(2),
                ]),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let calls = ToolCallRepo::new(db).list(&session.id).unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].status, ToolCallStatus::Success);
        assert_eq!(calls[0].output.as_ref().unwrap()["content"], "127.0.0.1");
        assert_eq!(session.metrics.tool_call_count, 1);
    }

    #[tokio::test]
    async fn fires_pre_and_post_tool_hooks() {
        let (db, mut session) = setup();
        let pre = CountingHook::new("pre");
        let post = CountingHook::new("post");
        let stop = CountingHook::new("stop");
        let mut pipeline = HookPipeline::new();
        pipeline.register(HookEvent::PreToolUse, pre.clone());
        pipeline.register(HookEvent::PostToolUse, post.clone());
        pipeline.register(HookEvent::Stop, stop.clone());
        let relay = relay_with_hooks(&db, pipeline);

        let tool_use = ToolCallId::from_raw("toolu_1");
        relay
            .consume(
                &mut session,
                events(vec![
                    RuntimeEvent::ToolUse {
                        tool_use_id: tool_use.clone(),
                        tool_name: "Read".into(),
                        input: json!({}),
                    },
                    RuntimeEvent::ToolResult {
                        tool_use_id: tool_use,
                        output: json!({}),
                        is_error: false,
                    },
                    completed(1),
                ]),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(pre.calls.load(Ordering::Relaxed), 1);
        assert_eq!(post.calls.load(Ordering::Relaxed), 1);
        assert_eq!(stop.calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn orphan_tool_result_discarded_and_audited() {
        let (db, mut session) = setup();
        let relay = relay(&db);

        let outcome = relay
            .consume(
                &mut session,
                events(vec![
                    RuntimeEvent::ToolResult {
                        tool_use_id: ToolCallId::from_raw("toolu_ghost"),
                        output: json!({}),
                        is_error: false,
                    },
                    completed(1),
                ]),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(outcome.got_terminal, "orphan result must not abort the stream");

        let audits = AuditRepo::new(db.clone()).list(&session.id).unwrap();
        assert!(audits.iter().any(|a| a.event_type == "orphan_tool_result"));
        assert!(ToolCallRepo::new(db).list(&session.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn completed_accumulates_metrics() {
        let (db, mut session) = setup();
        let relay = relay(&db);

        let outcome = relay
            .consume(&mut session, events(vec![completed(3)]), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.result.as_deref(), Some("ok"));
        assert_eq!(session.metrics.input_tokens, 100);
        assert_eq!(session.metrics.output_tokens, 40);
        assert_eq!(session.metrics.turn_count, 3);
        assert!((session.metrics.total_cost_usd - 0.01).abs() < 1e-9);
    }

    #[tokio::test]
    async fn stream_ending_without_terminal_is_reported() {
        let (db, mut session) = setup();
        let relay = relay(&db);

        let outcome = relay
            .consume(
                &mut session,
                events(vec![RuntimeEvent::AssistantText { text: "hi".into() }]),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(!outcome.got_terminal);
    }

    #[tokio::test]
    async fn cancelled_session_stops_consumption() {
        let (db, mut session) = setup();
        let relay = relay(&db);
        let cancel = CancellationToken::new();
        cancel.cancel();

        // A pending stream that never yields; cancellation must win.
        let stream: EventStream = Box::pin(stream::pending());
        let result = relay.consume(&mut session, stream, &cancel).await;
        assert!(matches!(result, Err(EngineError::Internal(_))));
    }

    #[tokio::test]
    async fn denied_result_resolves_as_denied() {
        let (db, mut session) = setup();
        let relay = relay(&db);
        let tool_use = ToolCallId::from_raw("toolu_1");

        relay
            .consume(
                &mut session,
                events(vec![
                    RuntimeEvent::ToolUse {
                        tool_use_id: tool_use.clone(),
                        tool_name: "Bash".into(),
                        input: json!({"command": "rm -rf /"}),
                    },
                    RuntimeEvent::ToolResult {
                        tool_use_id: tool_use,
                        output: json!({"error": "denied by policy", "denied": true}),
                        is_error: true,
                    },
                    completed(1),
                ]),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let calls = ToolCallRepo::new(db).list(&session.id).unwrap();
        assert_eq!(calls[0].status, ToolCallStatus::Denied);
    }

    #[test]
    fn resolution_status_mapping() {
        assert_eq!(resolution_status(&json!({}), false), ToolCallStatus::Success);
        assert_eq!(resolution_status(&json!({}), true), ToolCallStatus::Error);
        assert_eq!(
            resolution_status(&json!({"denied": true}), true),
            ToolCallStatus::Denied
        );
    }
}
