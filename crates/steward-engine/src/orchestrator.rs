//! Session orchestrator.
//!
//! Drives the session state machine, wires policy and hook callbacks into
//! newly created pooled connections, and relays each exchange's event
//! stream into persisted records.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::broadcast;
use tracing::{instrument, warn};

use steward_core::config::AgentConfig;
use steward_core::events::BrokerEvent;
use steward_core::hooks::HookPayload;
use steward_core::ids::{SessionId, UserId};
use steward_core::session::{Session, SessionMode, SessionStatus};
use steward_hooks::{HookContext, HookPipeline};
use steward_policy::PolicyEngine;
use steward_store::audit::AuditRepo;
use steward_store::sessions::SessionRepo;
use steward_store::Database;

use crate::archive::{ArchiveOutcome, WorkspaceArchiver};
use crate::error::EngineError;
use crate::gate::{PipelineObserver, PolicyAuthorizer};
use crate::pool::ClientPool;
use crate::relay::StreamRelay;

/// What a completed send-message exchange returned.
#[derive(Debug)]
pub struct SendOutcome {
    pub assistant_texts: Vec<String>,
    pub result: Option<String>,
    pub is_error: bool,
}

pub struct SessionOrchestrator {
    sessions: SessionRepo,
    relay: StreamRelay,
    pool: Arc<ClientPool>,
    policies: Arc<PolicyEngine>,
    hooks: Arc<HookPipeline>,
    audit: AuditRepo,
    archiver: Arc<dyn WorkspaceArchiver>,
    events_tx: broadcast::Sender<BrokerEvent>,
}

impl SessionOrchestrator {
    pub fn new(
        db: Database,
        pool: Arc<ClientPool>,
        policies: Arc<PolicyEngine>,
        hooks: Arc<HookPipeline>,
        archiver: Arc<dyn WorkspaceArchiver>,
        events_tx: broadcast::Sender<BrokerEvent>,
    ) -> Self {
        Self {
            sessions: SessionRepo::new(db.clone()),
            relay: StreamRelay::new(db.clone(), Arc::clone(&hooks), events_tx.clone()),
            pool,
            policies,
            hooks,
            audit: AuditRepo::new(db),
            archiver,
            events_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events_tx.subscribe()
    }

    fn broadcast(&self, event: BrokerEvent) {
        // No subscribers is a no-op.
        let _ = self.events_tx.send(event);
    }

    /// Transition, persist, and announce in one step.
    fn set_status(&self, session: &mut Session, target: SessionStatus) -> Result<(), EngineError> {
        let from = session.status;
        session.transition(target)?;
        self.sessions.update(session)?;
        self.broadcast(BrokerEvent::SessionStatusChanged {
            session_id: session.id.clone(),
            from,
            to: target,
        });
        Ok(())
    }

    #[instrument(skip(self, config), fields(user_id = %user_id))]
    pub fn create_session(
        &self,
        user_id: UserId,
        mode: SessionMode,
        config: AgentConfig,
        working_directory: &str,
    ) -> Result<Session, EngineError> {
        let session = Session::new(user_id, mode, config, working_directory);
        self.sessions.insert(&session)?;
        self.audit.log_event(
            "session_created",
            Some(&session.id),
            &json!({"mode": session.mode.to_string(), "model": session.config.model}),
        );
        Ok(session)
    }

    pub fn get_session(&self, session_id: &SessionId) -> Result<Session, EngineError> {
        Ok(self.sessions.get(session_id)?)
    }

    /// Send a user message to a session and relay the full exchange.
    ///
    /// Everything that fails after the initial status gate marks the
    /// session FAILED, persists the error, and re-raises once; connection
    /// retries already happened inside the pool and are not repeated here.
    #[instrument(skip(self, text), fields(session_id = %session_id))]
    pub async fn send_message(
        &self,
        session_id: &SessionId,
        text: &str,
    ) -> Result<SendOutcome, EngineError> {
        let mut session = self.sessions.get(session_id)?;

        if !matches!(
            session.status,
            SessionStatus::Created | SessionStatus::Active | SessionStatus::Connecting
        ) {
            return Err(EngineError::SessionNotActive {
                session_id: session.id.clone(),
                status: session.status,
            });
        }

        match self.run_exchange(&mut session, text).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                let from = session.status;
                session.set_error(e.to_string());
                if session.status.can_transition_to(SessionStatus::Failed) {
                    // Infallible: just checked against the table.
                    let _ = session.transition(SessionStatus::Failed);
                }
                if let Err(persist_err) = self.sessions.update(&session) {
                    warn!(session_id = %session.id, error = %persist_err, "failed to persist failure state");
                }
                self.broadcast(BrokerEvent::SessionStatusChanged {
                    session_id: session.id.clone(),
                    from,
                    to: session.status,
                });
                self.broadcast(BrokerEvent::SessionFailed {
                    session_id: session.id.clone(),
                    error: e.to_string(),
                });
                self.audit.log_event(
                    "session_failed",
                    Some(&session.id),
                    &json!({"error": e.to_string()}),
                );
                Err(e)
            }
        }
    }

    async fn run_exchange(
        &self,
        session: &mut Session,
        text: &str,
    ) -> Result<SendOutcome, EngineError> {
        if session.status == SessionStatus::Created {
            self.set_status(session, SessionStatus::Connecting)?;
        }

        if !self.pool.contains(&session.id) {
            let authorizer = Arc::new(PolicyAuthorizer::for_session(
                Arc::clone(&self.policies),
                session,
            ));
            let observer = Arc::new(PipelineObserver::for_session(
                Arc::clone(&self.hooks),
                session,
            ));
            self.pool.create_client(session, authorizer, observer).await?;
        }

        if session.status == SessionStatus::Connecting {
            self.set_status(session, SessionStatus::Active)?;
        }
        self.set_status(session, SessionStatus::Processing)?;

        let hook_ctx = HookContext {
            session_id: session.id.clone(),
            working_directory: Some(session.working_directory.clone()),
        };
        self.hooks
            .execute(
                &HookPayload::UserPromptSubmit {
                    prompt: text.to_string(),
                },
                None,
                &hook_ctx,
            )
            .await;

        self.relay.record_user_prompt(session, text)?;

        let client = self.pool.get_client(&session.id)?;
        client.query(text).await?;
        let stream = client.receive().await;
        let outcome = self
            .relay
            .consume(session, stream, &client.cancel_token())
            .await?;

        if !outcome.got_terminal {
            return Err(EngineError::Internal(
                "runtime stream ended without a result".into(),
            ));
        }

        session.result = outcome.result.clone();
        if outcome.is_error {
            session.set_error(
                outcome
                    .result
                    .clone()
                    .unwrap_or_else(|| "runtime reported an error result".into()),
            );
        }
        self.set_status(session, SessionStatus::Active)?;

        self.audit.log_event(
            "message_processed",
            Some(&session.id),
            &json!({
                "assistant_messages": outcome.assistant_texts.len(),
                "is_error": outcome.is_error,
            }),
        );

        Ok(SendOutcome {
            assistant_texts: outcome.assistant_texts,
            result: outcome.result,
            is_error: outcome.is_error,
        })
    }

    /// Create a new session seeded from a parent's configuration.
    ///
    /// The child records its lineage but starts with an empty runtime
    /// conversation: parent history is not replayed into the new pooled
    /// connection.
    #[instrument(skip(self), fields(parent_id = %parent_id))]
    pub fn fork_session(&self, parent_id: &SessionId) -> Result<Session, EngineError> {
        let parent = self.sessions.get(parent_id)?;
        let mut child = Session::new(
            parent.user_id.clone(),
            SessionMode::Forked,
            parent.config.clone(),
            parent.working_directory.clone(),
        );
        child.parent_session_id = Some(parent.id.clone());
        self.sessions.insert(&child)?;

        warn!(
            parent_id = %parent.id,
            child_id = %child.id,
            "forked session starts without parent conversation history"
        );
        self.audit.log_event(
            "session_forked",
            Some(&child.id),
            &json!({"parent_session_id": parent.id.as_str()}),
        );
        Ok(child)
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn terminate_session(&self, session_id: &SessionId) -> Result<Session, EngineError> {
        let mut session = self.sessions.get(session_id)?;
        self.set_status(&mut session, SessionStatus::Terminated)?;
        self.pool.disconnect_client(session_id).await;
        self.audit
            .log_event("session_terminated", Some(session_id), &json!({}));
        Ok(session)
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn complete_session(
        &self,
        session_id: &SessionId,
        result: Option<String>,
    ) -> Result<Session, EngineError> {
        let mut session = self.sessions.get(session_id)?;
        session.result = result;
        self.set_status(&mut session, SessionStatus::Completed)?;
        self.pool.disconnect_client(session_id).await;
        self.audit
            .log_event("session_completed", Some(session_id), &json!({}));
        Ok(session)
    }

    pub fn pause_session(&self, session_id: &SessionId) -> Result<Session, EngineError> {
        let mut session = self.sessions.get(session_id)?;
        self.set_status(&mut session, SessionStatus::Paused)?;
        Ok(session)
    }

    pub fn resume_session(&self, session_id: &SessionId) -> Result<Session, EngineError> {
        let mut session = self.sessions.get(session_id)?;
        self.set_status(&mut session, SessionStatus::Active)?;
        Ok(session)
    }

    /// Archive a terminal session: disconnect any pooled client, hand the
    /// working directory to the archiver, then mark the metadata archived.
    /// An archival failure is isolated and never blocks the transition.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn archive_session(&self, session_id: &SessionId) -> Result<Session, EngineError> {
        let mut session = self.sessions.get(session_id)?;
        if !session.status.can_transition_to(SessionStatus::Archived) {
            return Err(EngineError::Session(
                steward_core::session::SessionError::InvalidTransition {
                    from: session.status,
                    to: SessionStatus::Archived,
                },
            ));
        }

        self.pool.disconnect_client(session_id).await;

        let outcome = self
            .archiver
            .archive_working_directory(session_id, &session.working_directory)
            .await;
        match &outcome {
            ArchiveOutcome::Failed { reason } => {
                warn!(session_id = %session_id, reason, "workspace archival failed");
                self.audit.log_event(
                    "archive_failed",
                    Some(session_id),
                    &json!({"reason": reason}),
                );
            }
            _ => {
                self.audit.log_event(
                    "workspace_archived",
                    Some(session_id),
                    &json!({"outcome": outcome}),
                );
            }
        }

        self.set_status(&mut session, SessionStatus::Archived)?;
        self.broadcast(BrokerEvent::SessionArchived {
            session_id: session.id.clone(),
        });
        Ok(session)
    }

    /// Disconnect every pooled session; used at process shutdown.
    pub async fn shutdown(&self) -> usize {
        let swept = self.pool.cleanup_all().await;
        self.audit
            .log_event("shutdown", None, &json!({"disconnected": swept}));
        swept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use steward_core::hooks::{HookDirective, HookEvent};
    use steward_core::runtime::AgentRuntime;
    use steward_hooks::{Hook, HookError};
    use steward_policy::builtin::CommandPatternPolicy;
    use steward_runtime::{MockRuntime, MockScript};
    use steward_store::decisions::DecisionRepo;
    use steward_store::hook_executions::HookExecutionRepo;
    use steward_store::messages::MessageRepo;
    use steward_store::tool_calls::{ToolCallRepo, ToolCallStatus};
    use crate::pool::PoolConfig;

    struct Harness {
        db: Database,
        orchestrator: SessionOrchestrator,
        runtime: Arc<MockRuntime>,
        events_rx: broadcast::Receiver<BrokerEvent>,
    }

    struct HarnessConfig {
        scripts: Vec<MockScript>,
        connect_failures: usize,
        max_connect_attempts: u32,
        /// Policies to register; the engine itself is built inside `harness`
        /// so it can share the harness database for its decision log.
        policies: Vec<Arc<dyn steward_policy::Policy>>,
        hooks: HookPipeline,
        archiver: Arc<dyn WorkspaceArchiver>,
    }

    impl Default for HarnessConfig {
        fn default() -> Self {
            Self {
                scripts: Vec::new(),
                connect_failures: 0,
                max_connect_attempts: 3,
                policies: Vec::new(),
                hooks: HookPipeline::new(),
                archiver: Arc::new(crate::archive::NullArchiver),
            }
        }
    }

    fn harness(config: HarnessConfig) -> Harness {
        let db = Database::in_memory().unwrap();
        let runtime = Arc::new(
            MockRuntime::new(config.scripts).with_connect_failures(config.connect_failures),
        );
        let mut policies =
            PolicyEngine::new().with_decision_log(DecisionRepo::new(db.clone()));
        for policy in config.policies {
            policies.register(policy);
        }
        let pool = Arc::new(ClientPool::new(
            Arc::clone(&runtime) as Arc<dyn AgentRuntime>,
            PoolConfig {
                max_connect_attempts: config.max_connect_attempts,
                backoff_base: Duration::from_millis(1),
            },
        ));
        let (events_tx, events_rx) = broadcast::channel(256);
        let orchestrator = SessionOrchestrator::new(
            db.clone(),
            pool,
            Arc::new(policies),
            Arc::new(config.hooks),
            config.archiver,
            events_tx,
        );
        Harness {
            db,
            orchestrator,
            runtime,
            events_rx,
        }
    }

    fn new_session(h: &Harness) -> Session {
        h.orchestrator
            .create_session(
                UserId::new(),
                SessionMode::Interactive,
                AgentConfig::default(),
                "/tmp/project",
            )
            .unwrap()
    }

    fn drain_status_changes(rx: &mut broadcast::Receiver<BrokerEvent>) -> Vec<(SessionStatus, SessionStatus)> {
        let mut changes = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let BrokerEvent::SessionStatusChanged { from, to, .. } = event {
                changes.push((from, to));
            }
        }
        changes
    }

    #[tokio::test]
    async fn send_message_walks_the_status_sequence() {
        let mut h = harness(HarnessConfig {
            scripts: vec![MockScript::text("hello back")],
            ..Default::default()
        });
        let session = new_session(&h);

        let outcome = h.orchestrator.send_message(&session.id, "hi").await.unwrap();
        assert_eq!(outcome.assistant_texts, vec!["hello back"]);
        assert!(!outcome.is_error);

        let changes = drain_status_changes(&mut h.events_rx);
        use SessionStatus::*;
        assert_eq!(
            changes,
            vec![
                (Created, Connecting),
                (Connecting, Active),
                (Active, Processing),
                (Processing, Active),
            ]
        );

        let persisted = h.orchestrator.get_session(&session.id).unwrap();
        assert_eq!(persisted.status, Active);
        assert!(persisted.started_at.is_some());
        assert_eq!(persisted.result.as_deref(), Some("hello back"));
    }

    #[tokio::test]
    async fn tool_call_created_and_resolved_by_matching_result() {
        let h = harness(HarnessConfig {
            scripts: vec![MockScript::tool_roundtrip(
                "toolu_42",
                "Read",
                json!({"path": "/etc/hosts"}),
            )],
            ..Default::default()
        });
        let session = new_session(&h);
        h.orchestrator.send_message(&session.id, "read it").await.unwrap();

        let calls = ToolCallRepo::new(h.db.clone()).list(&session.id).unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tool_use_id.as_str(), "toolu_42");
        assert_eq!(calls[0].status, ToolCallStatus::Success);
        assert!(calls[0].resolved_at.is_some());

        let persisted = h.orchestrator.get_session(&session.id).unwrap();
        assert_eq!(persisted.metrics.tool_call_count, 1);
        assert_eq!(persisted.metrics.turn_count, 2);
    }

    #[tokio::test]
    async fn destructive_command_denied_with_decision_record() {
        let h = harness(HarnessConfig {
            scripts: vec![MockScript::tool_roundtrip(
                "toolu_1",
                "Bash",
                json!({"command": "rm -rf /"}),
            )],
            policies: vec![Arc::new(
                CommandPatternPolicy::new(&[r"rm\s+-rf".to_string()]).unwrap(),
            )],
            ..Default::default()
        });

        let session = new_session(&h);
        h.orchestrator.send_message(&session.id, "wipe it").await.unwrap();

        let calls = ToolCallRepo::new(h.db.clone()).list(&session.id).unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].status, ToolCallStatus::Denied);

        let decisions = DecisionRepo::new(h.db.clone()).list(&session.id).unwrap();
        let deny = decisions.iter().find(|d| d.decision == "deny").expect("deny recorded");
        assert_eq!(deny.policy_name, "command_patterns");
        assert_eq!(deny.tool_input["command"], "rm -rf /");
    }

    #[tokio::test]
    async fn erroring_pre_tool_hook_never_blocks_tool_calls() {
        struct ExplodingHook;
        #[async_trait]
        impl Hook for ExplodingHook {
            fn name(&self) -> &str {
                "exploding"
            }
            fn priority(&self) -> u32 {
                10
            }
            async fn run(
                &self,
                _payload: &HookPayload,
                _ctx: &HookContext,
            ) -> Result<HookDirective, HookError> {
                Err(HookError::Execution("always fails".into()))
            }
        }

        let scripts: Vec<MockScript> = (0..10)
            .map(|i| MockScript::tool_roundtrip(&format!("toolu_{i}"), "Read", json!({"n": i})))
            .collect();

        let db = Database::in_memory().unwrap();
        let mut hooks = HookPipeline::new().with_execution_log(HookExecutionRepo::new(db.clone()));
        hooks.register(HookEvent::PreToolUse, Arc::new(ExplodingHook));

        let runtime = Arc::new(MockRuntime::new(scripts));
        let pool = Arc::new(ClientPool::new(
            Arc::clone(&runtime) as Arc<dyn AgentRuntime>,
            PoolConfig {
                max_connect_attempts: 3,
                backoff_base: Duration::from_millis(1),
            },
        ));
        let orchestrator = SessionOrchestrator::new(
            db.clone(),
            pool,
            Arc::new(PolicyEngine::new()),
            Arc::new(hooks),
            Arc::new(crate::archive::NullArchiver),
            broadcast::channel(256).0,
        );

        let session = orchestrator
            .create_session(UserId::new(), SessionMode::Interactive, AgentConfig::default(), "/tmp")
            .unwrap();

        for i in 0..10 {
            let outcome = orchestrator
                .send_message(&session.id, &format!("call {i}"))
                .await
                .expect("tool call must succeed despite the failing hook");
            assert!(!outcome.is_error);
        }

        let calls = ToolCallRepo::new(db.clone()).list(&session.id).unwrap();
        assert_eq!(calls.len(), 10);
        assert!(calls.iter().all(|c| c.status == ToolCallStatus::Success));

        let records = HookExecutionRepo::new(db)
            .list(&session.id, Some(HookEvent::PreToolUse))
            .unwrap();
        assert_eq!(records.len(), 10);
        assert!(records.iter().all(|r| r.error_message.is_some()));
    }

    #[tokio::test]
    async fn connect_retries_then_session_reaches_active() {
        let mut h = harness(HarnessConfig {
            scripts: vec![MockScript::text("made it")],
            connect_failures: 2,
            max_connect_attempts: 3,
            ..Default::default()
        });
        let session = new_session(&h);

        h.orchestrator.send_message(&session.id, "hi").await.unwrap();
        assert_eq!(h.runtime.connect_attempts(), 3);

        let changes = drain_status_changes(&mut h.events_rx);
        assert!(
            changes.iter().all(|(_, to)| *to != SessionStatus::Failed),
            "no FAILED status may be observed: {changes:?}"
        );
        let persisted = h.orchestrator.get_session(&session.id).unwrap();
        assert_eq!(persisted.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn connect_exhaustion_fails_the_session() {
        let h = harness(HarnessConfig {
            scripts: vec![],
            connect_failures: 10,
            max_connect_attempts: 3,
            ..Default::default()
        });
        let session = new_session(&h);

        let err = h.orchestrator.send_message(&session.id, "hi").await.unwrap_err();
        assert!(matches!(err, EngineError::Runtime(_)));

        let persisted = h.orchestrator.get_session(&session.id).unwrap();
        assert_eq!(persisted.status, SessionStatus::Failed);
        assert!(persisted.error.is_some());
        assert!(persisted.completed_at.is_some());
    }

    #[tokio::test]
    async fn failed_session_rejects_further_messages() {
        let h = harness(HarnessConfig {
            scripts: vec![],
            connect_failures: 10,
            max_connect_attempts: 2,
            ..Default::default()
        });
        let session = new_session(&h);
        let _ = h.orchestrator.send_message(&session.id, "hi").await;

        let err = h.orchestrator.send_message(&session.id, "again").await.unwrap_err();
        assert!(matches!(err, EngineError::SessionNotActive { .. }));
    }

    #[tokio::test]
    async fn second_message_reuses_the_pooled_connection() {
        let mut h = harness(HarnessConfig {
            scripts: vec![MockScript::text("one"), MockScript::text("two")],
            ..Default::default()
        });
        let session = new_session(&h);

        h.orchestrator.send_message(&session.id, "first").await.unwrap();
        drain_status_changes(&mut h.events_rx);

        let outcome = h.orchestrator.send_message(&session.id, "second").await.unwrap();
        assert_eq!(outcome.assistant_texts, vec!["two"]);
        assert_eq!(h.runtime.connect_attempts(), 1, "one connection per session");

        use SessionStatus::*;
        let changes = drain_status_changes(&mut h.events_rx);
        assert_eq!(changes, vec![(Active, Processing), (Processing, Active)]);
    }

    #[tokio::test]
    async fn user_prompt_persisted_before_replies() {
        let h = harness(HarnessConfig {
            scripts: vec![MockScript::text("reply")],
            ..Default::default()
        });
        let session = new_session(&h);
        h.orchestrator.send_message(&session.id, "question").await.unwrap();

        let messages = MessageRepo::new(h.db.clone()).list(&session.id).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].sequence, 0);
        assert_eq!(messages[0].content["text"], "question");
        assert_eq!(messages[1].content["text"], "reply");
    }

    #[tokio::test]
    async fn user_prompt_submit_hook_fires_once_per_send() {
        struct CountingHook(AtomicUsize);
        #[async_trait]
        impl Hook for CountingHook {
            fn name(&self) -> &str {
                "prompt_counter"
            }
            fn priority(&self) -> u32 {
                10
            }
            async fn run(
                &self,
                _payload: &HookPayload,
                _ctx: &HookContext,
            ) -> Result<HookDirective, HookError> {
                self.0.fetch_add(1, Ordering::Relaxed);
                Ok(HookDirective::default())
            }
        }

        let counter = Arc::new(CountingHook(AtomicUsize::new(0)));
        let mut hooks = HookPipeline::new();
        hooks.register(HookEvent::UserPromptSubmit, counter.clone());

        let h = harness(HarnessConfig {
            scripts: vec![MockScript::text("a"), MockScript::text("b")],
            hooks,
            ..Default::default()
        });
        let session = new_session(&h);
        h.orchestrator.send_message(&session.id, "one").await.unwrap();
        h.orchestrator.send_message(&session.id, "two").await.unwrap();

        assert_eq!(counter.0.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn fork_copies_config_and_records_lineage() {
        let h = harness(HarnessConfig::default());
        let mut config = AgentConfig::default();
        config.disallowed_tools.push("Bash".into());
        let parent = h
            .orchestrator
            .create_session(UserId::new(), SessionMode::Interactive, config, "/tmp/parent")
            .unwrap();

        let child = h.orchestrator.fork_session(&parent.id).unwrap();
        assert_eq!(child.mode, SessionMode::Forked);
        assert_eq!(child.parent_session_id.as_ref(), Some(&parent.id));
        assert_eq!(child.config.disallowed_tools, vec!["Bash".to_string()]);
        assert_eq!(child.working_directory, "/tmp/parent");
        assert_eq!(child.status, SessionStatus::Created);
        assert_ne!(child.id, parent.id);

        let children = SessionRepo::new(h.db.clone()).children(&parent.id).unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, child.id);
    }

    #[tokio::test]
    async fn terminate_then_archive() {
        struct RecordingArchiver(AtomicUsize);
        #[async_trait]
        impl WorkspaceArchiver for RecordingArchiver {
            async fn archive_working_directory(
                &self,
                _session_id: &SessionId,
                path: &str,
            ) -> ArchiveOutcome {
                self.0.fetch_add(1, Ordering::Relaxed);
                ArchiveOutcome::Archived {
                    location: format!("archive://{path}"),
                }
            }
        }

        let archiver = Arc::new(RecordingArchiver(AtomicUsize::new(0)));
        let h = harness(HarnessConfig {
            scripts: vec![MockScript::text("hi")],
            archiver: archiver.clone(),
            ..Default::default()
        });
        let session = new_session(&h);
        h.orchestrator.send_message(&session.id, "hi").await.unwrap();

        h.orchestrator.terminate_session(&session.id).await.unwrap();
        let archived = h.orchestrator.archive_session(&session.id).await.unwrap();
        assert_eq!(archived.status, SessionStatus::Archived);
        assert_eq!(archiver.0.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn archive_failure_does_not_block_the_transition() {
        struct BrokenArchiver;
        #[async_trait]
        impl WorkspaceArchiver for BrokenArchiver {
            async fn archive_working_directory(
                &self,
                _session_id: &SessionId,
                _path: &str,
            ) -> ArchiveOutcome {
                ArchiveOutcome::Failed {
                    reason: "bucket unreachable".into(),
                }
            }
        }

        let h = harness(HarnessConfig {
            archiver: Arc::new(BrokenArchiver),
            ..Default::default()
        });
        let session = new_session(&h);
        h.orchestrator.terminate_session(&session.id).await.unwrap();

        let archived = h.orchestrator.archive_session(&session.id).await.unwrap();
        assert_eq!(archived.status, SessionStatus::Archived);
    }

    #[tokio::test]
    async fn archive_rejected_for_non_terminal_session() {
        let h = harness(HarnessConfig::default());
        let session = new_session(&h);

        let err = h.orchestrator.archive_session(&session.id).await.unwrap_err();
        assert!(matches!(err, EngineError::Session(_)));
        let persisted = h.orchestrator.get_session(&session.id).unwrap();
        assert_eq!(persisted.status, SessionStatus::Created);
    }

    #[tokio::test]
    async fn pause_and_resume() {
        let h = harness(HarnessConfig {
            scripts: vec![MockScript::text("hi")],
            ..Default::default()
        });
        let session = new_session(&h);
        h.orchestrator.send_message(&session.id, "hi").await.unwrap();

        let paused = h.orchestrator.pause_session(&session.id).unwrap();
        assert_eq!(paused.status, SessionStatus::Paused);

        let resumed = h.orchestrator.resume_session(&session.id).unwrap();
        assert_eq!(resumed.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn pause_requires_active() {
        let h = harness(HarnessConfig::default());
        let session = new_session(&h);
        assert!(matches!(
            h.orchestrator.pause_session(&session.id),
            Err(EngineError::Session(_))
        ));
    }

    #[tokio::test]
    async fn shutdown_disconnects_all_sessions() {
        let h = harness(HarnessConfig {
            scripts: vec![MockScript::text("a"), MockScript::text("b")],
            ..Default::default()
        });
        let s1 = new_session(&h);
        let s2 = new_session(&h);
        h.orchestrator.send_message(&s1.id, "hi").await.unwrap();
        h.orchestrator.send_message(&s2.id, "hi").await.unwrap();

        let swept = h.orchestrator.shutdown().await;
        assert_eq!(swept, 2);
        assert_eq!(h.runtime.close_count(), 2);
    }

    #[tokio::test]
    async fn complete_session_stores_result() {
        let h = harness(HarnessConfig {
            scripts: vec![MockScript::text("hi")],
            ..Default::default()
        });
        let session = new_session(&h);
        h.orchestrator.send_message(&session.id, "hi").await.unwrap();

        let completed = h
            .orchestrator
            .complete_session(&session.id, Some("all done".into()))
            .await
            .unwrap();
        assert_eq!(completed.status, SessionStatus::Completed);
        assert_eq!(completed.result.as_deref(), Some("all done"));
        assert!(completed.duration_ms.unwrap() >= 0);
    }
}
