//! Exclusive per-session connection pool.
//!
//! At most one live runtime connection exists per session id. A lazily
//! created per-session async mutex serializes create/disconnect for that
//! session only; unrelated sessions never contend.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use steward_core::ids::SessionId;
use steward_core::runtime::{
    AgentRuntime, ConnectSpec, EventStream, RuntimeConnection, RuntimeError, RuntimeObserver,
    ToolAuthorizer,
};
use steward_core::session::Session;

use crate::error::EngineError;

/// Connect retry/backoff settings.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Total connect attempts before giving up (>= 1).
    pub max_connect_attempts: u32,
    /// First retry delay; doubles on each subsequent attempt.
    pub backoff_base: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connect_attempts: 3,
            backoff_base: Duration::from_millis(200),
        }
    }
}

/// The pooled handle for one session's live connection.
pub struct ClientHandle {
    session_id: SessionId,
    conn: Mutex<Box<dyn RuntimeConnection>>,
    cancel: CancellationToken,
    task: SyncMutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle")
            .field("session_id", &self.session_id)
            .finish()
    }
}

impl ClientHandle {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub async fn query(&self, prompt: &str) -> Result<(), RuntimeError> {
        self.conn.lock().await.query(prompt).await
    }

    pub async fn receive(&self) -> EventStream {
        self.conn.lock().await.receive()
    }

    /// Token cancelled when the session is disconnected.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Associate a background task with this session; it is aborted on
    /// disconnect. A previously attached task is replaced and aborted.
    pub fn attach_task(&self, handle: JoinHandle<()>) {
        if let Some(old) = self.task.lock().replace(handle) {
            old.abort();
        }
    }
}

/// Owns the pool map and the per-session lock map. No global state: the
/// pool is constructed explicitly and shared by reference.
pub struct ClientPool {
    runtime: Arc<dyn AgentRuntime>,
    clients: DashMap<SessionId, Arc<ClientHandle>>,
    locks: DashMap<SessionId, Arc<Mutex<()>>>,
    config: PoolConfig,
}

impl ClientPool {
    pub fn new(runtime: Arc<dyn AgentRuntime>, config: PoolConfig) -> Self {
        Self {
            runtime,
            clients: DashMap::new(),
            locks: DashMap::new(),
            config,
        }
    }

    fn session_lock(&self, session_id: &SessionId) -> Arc<Mutex<()>> {
        self.locks
            .entry(session_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Open the session's single connection and register it in the pool.
    ///
    /// Fails with `ClientAlreadyExists` when a connection is pooled for
    /// this session, and with the underlying runtime error when the
    /// connection cannot be established; in the latter case no pool entry
    /// is left behind.
    #[instrument(skip(self, session, authorizer, observer), fields(session_id = %session.id))]
    pub async fn create_client(
        &self,
        session: &Session,
        authorizer: Arc<dyn ToolAuthorizer>,
        observer: Arc<dyn RuntimeObserver>,
    ) -> Result<Arc<ClientHandle>, EngineError> {
        let lock = self.session_lock(&session.id);
        let _guard = lock.lock().await;

        if self.clients.contains_key(&session.id) {
            return Err(EngineError::ClientAlreadyExists(session.id.clone()));
        }

        let spec = ConnectSpec {
            session_id: session.id.clone(),
            model: session.config.model.clone(),
            system_prompt: session.config.system_prompt.clone(),
            allowed_tools: session.config.allowed_tools.clone(),
            disallowed_tools: session.config.disallowed_tools.clone(),
            permission_mode: session.config.permission_mode,
            working_directory: session.working_directory.clone(),
            mcp_servers: session.config.mcp_servers.clone(),
            authorizer,
            observer,
        };
        let attempt_timeout = Duration::from_secs(session.config.timeout_seconds);

        let conn = self.connect_with_retry(spec, attempt_timeout).await?;

        let handle = Arc::new(ClientHandle {
            session_id: session.id.clone(),
            conn: Mutex::new(conn),
            cancel: CancellationToken::new(),
            task: SyncMutex::new(None),
        });
        self.clients.insert(session.id.clone(), Arc::clone(&handle));
        debug!(session_id = %session.id, "client pooled");
        Ok(handle)
    }

    /// Connect with exponential backoff on transient errors. Each attempt
    /// is bounded by the session's connect timeout.
    async fn connect_with_retry(
        &self,
        spec: ConnectSpec,
        attempt_timeout: Duration,
    ) -> Result<Box<dyn RuntimeConnection>, RuntimeError> {
        let mut attempt: u32 = 0;
        loop {
            let error = match tokio::time::timeout(attempt_timeout, self.runtime.connect(spec.clone()))
                .await
            {
                Ok(Ok(conn)) => return Ok(conn),
                Ok(Err(e)) => e,
                Err(_) => RuntimeError::ConnectTimeout(attempt_timeout),
            };

            attempt += 1;
            if !error.is_transient() || attempt >= self.config.max_connect_attempts.max(1) {
                return Err(error);
            }

            let delay = self
                .config
                .backoff_base
                .saturating_mul(1u32 << (attempt - 1).min(16));
            warn!(
                session_id = %spec.session_id,
                attempt,
                max_attempts = self.config.max_connect_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "connect failed, retrying with backoff"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Look up the pooled handle. Lock-free.
    pub fn get_client(&self, session_id: &SessionId) -> Result<Arc<ClientHandle>, EngineError> {
        self.clients
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| EngineError::ClientNotFound(session_id.clone()))
    }

    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.clients.contains_key(session_id)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Disconnect the session's connection if one is pooled. Idempotent:
    /// a second call is a no-op. Close failures are logged, never raised.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn disconnect_client(&self, session_id: &SessionId) {
        let lock = self.session_lock(session_id);
        {
            let _guard = lock.lock().await;

            if let Some((_, handle)) = self.clients.remove(session_id) {
                handle.cancel.cancel();
                if let Some(task) = handle.task.lock().take() {
                    task.abort();
                }
                let mut conn = handle.conn.lock().await;
                if let Err(e) = conn.close().await {
                    warn!(session_id = %session_id, error = %e, "connection close failed");
                }
                debug!(session_id = %session_id, "client disconnected");
            }
        }
        self.locks.remove(session_id);
    }

    /// Disconnect every pooled session. Per-session failures are contained
    /// inside `disconnect_client`, so one bad connection never aborts the
    /// sweep. Returns the number of sessions disconnected.
    #[instrument(skip(self))]
    pub async fn cleanup_all(&self) -> usize {
        let session_ids: Vec<SessionId> = self
            .clients
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for session_id in &session_ids {
            self.disconnect_client(session_id).await;
        }
        session_ids.len()
    }
}
