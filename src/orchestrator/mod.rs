//! Session lifecycle: prepare a working tree, launch the agent, watch it
//! finish, and clean up.
//!
//! Finalization has exactly one owner per session. The completion watcher
//! and `cancel_session` both claim the backend out of `active_backends`
//! and race on the terminal store transition; whoever wins the transition
//! closes the session's publish gate, which emits `session_completed`.

mod channel;
mod watcher;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use aira_common::models::{
    AgentSession, Project, SessionStatus, TaskStatus, volume_name,
};
use aira_common::store::PubSub;
use aira_runtime::{ContainerRuntime, RuntimeError, WorkspaceManager};
use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agent::{AgentBackend, Registry, SessionOptions};
use crate::decisions::DecisionExtractor;
use crate::errors::{AgentError, OrchestratorError};
use crate::hitl::{AnswerHandler, QuestionRouter};
use crate::store::Stores;

pub use channel::{HITL_CHANNEL_KEY, TRANSCRIPT_LINES};
pub use watcher::WatchTimings;

use channel::{SessionChannel, SessionHandler, publish_completed};

/// Error recorded on sessions found live after a restart.
pub const RESTART_ERROR: &str = "orchestrator restarted";

/// Upper bound on post-completion cleanup.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Orchestrator {
    stores: Stores,
    pubsub: Arc<dyn PubSub>,
    runtime: Arc<dyn ContainerRuntime>,
    workspace: Arc<dyn WorkspaceManager>,
    registry: Arc<Registry>,
    questions: Arc<dyn QuestionRouter>,
    extractor: DecisionExtractor,
    active_backends: Mutex<HashMap<Uuid, Arc<dyn AgentBackend>>>,
    channels: Mutex<HashMap<Uuid, Arc<SessionChannel>>>,
    timings: WatchTimings,
    stop_grace: Duration,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        stores: Stores,
        pubsub: Arc<dyn PubSub>,
        runtime: Arc<dyn ContainerRuntime>,
        workspace: Arc<dyn WorkspaceManager>,
        registry: Arc<Registry>,
        questions: Arc<dyn QuestionRouter>,
    ) -> Self {
        let extractor = DecisionExtractor::new(stores.adrs.clone());
        Self {
            stores,
            pubsub,
            runtime,
            workspace,
            registry,
            questions,
            extractor,
            active_backends: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            timings: WatchTimings::default(),
            stop_grace: Duration::from_secs(30),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_timings(mut self, timings: WatchTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Token cancelled by [`shutdown`](Self::shutdown); background tasks
    /// tied to the orchestrator's lifetime should observe it.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn is_active(&self, session_id: Uuid) -> bool {
        self.backends().contains_key(&session_id)
    }

    pub fn active_count(&self) -> usize {
        self.backends().len()
    }

    fn backends(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Arc<dyn AgentBackend>>> {
        self.active_backends
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn take_backend(&self, session_id: Uuid) -> Option<Arc<dyn AgentBackend>> {
        self.backends().remove(&session_id)
    }

    fn take_channel(&self, session_id: Uuid) -> Option<Arc<SessionChannel>> {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&session_id)
    }

    fn channel(&self, session_id: Uuid) -> Option<Arc<SessionChannel>> {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&session_id)
            .cloned()
    }

    // ── Operations ────────────────────────────────────────────────────

    /// Launch `agent_type` on a task in a fresh working tree.
    pub async fn start_task(
        self: &Arc<Self>,
        tenant_id: Uuid,
        task_id: Uuid,
        agent_type: &str,
        metadata: Map<String, Value>,
    ) -> Result<AgentSession, OrchestratorError> {
        if self.cancel.is_cancelled() {
            return Err(OrchestratorError::ShuttingDown);
        }

        let task = self.stores.tasks.get_task(tenant_id, task_id).await?;
        if !matches!(task.status, TaskStatus::Backlog | TaskStatus::InProgress) {
            return Err(OrchestratorError::InvalidSessionState(format!(
                "Cannot start task {} in state {}",
                task.id, task.status
            )));
        }
        if !self.registry.contains(agent_type) {
            return Err(AgentError::UnknownAgent(agent_type.to_string()).into());
        }
        let project = self
            .stores
            .projects
            .get_project(tenant_id, task.project_id)
            .await?;

        let session = AgentSession::new(tenant_id, project.id, Some(task.id), agent_type, metadata);
        let session = self.stores.sessions.create_session(session).await?;
        let channel = Arc::new(SessionChannel::new(tenant_id, session.id));
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.id, channel.clone());
        info!(
            %tenant_id,
            session_id = %session.id,
            task_id = %task.id,
            agent = agent_type,
            "starting agent session"
        );

        let work_dir = match self.prepare_workspace(&project, &session).await {
            Ok(dir) => dir,
            Err(e) => {
                error!(session_id = %session.id, "workspace preparation failed: {}", e);
                self.finish(&session, SessionStatus::Failed, Some(e.to_string()))
                    .await;
                return Err(OrchestratorError::Workspace(e));
            }
        };

        let backend = match self.registry.create(agent_type, self.runtime.clone()) {
            Ok(backend) => backend,
            Err(e) => {
                self.abort_start(&session, None, e.to_string()).await;
                return Err(e.into());
            }
        };
        backend.on_message(Arc::new(SessionHandler {
            backend: Arc::downgrade(&backend),
            channel: channel.clone(),
            pubsub: self.pubsub.clone(),
            questions: self.questions.clone(),
            hitl_channel: session.metadata_str(HITL_CHANNEL_KEY).map(str::to_string),
        }));

        let opts = SessionOptions {
            session_id: session.id,
            tenant_id,
            prompt: task.prompt(),
            image: session.metadata_str("image").map(str::to_string),
            volume_name: volume_name(project.id),
            mount_path: self.workspace.mount_path().to_string(),
            work_dir,
            branch_name: session.branch_name.clone(),
            env: HashMap::new(),
        };
        let started = match backend.start_session(opts).await {
            Ok(started) => started,
            Err(e) => {
                error!(session_id = %session.id, "agent failed to start: {}", e);
                self.abort_start(&session, Some(backend), e.to_string()).await;
                return Err(e.into());
            }
        };

        if let Err(e) = self
            .stores
            .sessions
            .set_container_id(tenant_id, session.id, &started.container_id)
            .await
        {
            warn!(session_id = %session.id, "failed to persist container id: {}", e);
        }
        self.backends().insert(session.id, backend);

        let running = match self
            .stores
            .sessions
            .update_session_status(tenant_id, session.id, SessionStatus::Running, None)
            .await
        {
            Ok(running) => running,
            Err(e) => {
                // Typically a cancel that landed while the agent was starting.
                warn!(session_id = %session.id, "could not mark session running: {}", e);
                let backend = self.take_backend(session.id);
                self.abort_start(&session, backend, e.to_string()).await;
                return Err(OrchestratorError::InvalidSessionState(format!(
                    "Session {} could not start: {}",
                    session.id, e
                )));
            }
        };

        if task.status == TaskStatus::Backlog {
            if let Err(e) = self
                .stores
                .tasks
                .update_task_status(tenant_id, task.id, TaskStatus::InProgress)
                .await
            {
                warn!(task_id = %task.id, "failed to move task to in_progress: {}", e);
            }
        }

        channel.open();
        tokio::spawn(watcher::watch(
            Arc::clone(self),
            tenant_id,
            session.id,
            started.stream_done,
        ));
        Ok(running)
    }

    /// Deliver a human's answer to a parked agent and resume the session.
    pub async fn handle_hitl_response(
        &self,
        tenant_id: Uuid,
        session_id: Uuid,
        answer: &str,
    ) -> Result<AgentSession, OrchestratorError> {
        let session = self.stores.sessions.get_session(tenant_id, session_id).await?;
        if session.status != SessionStatus::WaitingHitl {
            return Err(OrchestratorError::invalid_state(
                "resume",
                session_id,
                session.status,
            ));
        }
        let backend = self
            .backends()
            .get(&session_id)
            .cloned()
            .ok_or(OrchestratorError::SessionNotFound(session_id))?;

        backend.send_prompt(session_id, answer).await?;
        let session = self
            .stores
            .sessions
            .update_session_status(tenant_id, session_id, SessionStatus::Running, None)
            .await?;
        info!(%tenant_id, %session_id, "session resumed after HITL answer");
        Ok(session)
    }

    /// Return a session whose question expired to running and restart its
    /// agent's idle clock. Sessions with no live agent are left alone.
    pub async fn handle_hitl_timeout(
        &self,
        tenant_id: Uuid,
        session_id: Uuid,
    ) -> Result<(), OrchestratorError> {
        let Some(backend) = self.backends().get(&session_id).cloned() else {
            return Ok(());
        };
        if let Err(e) = self
            .stores
            .sessions
            .update_session_status(tenant_id, session_id, SessionStatus::Running, None)
            .await
        {
            debug!(%session_id, "session not waiting at question timeout: {}", e);
        }
        backend.resume_idle(session_id).await?;
        info!(%tenant_id, %session_id, "HITL question expired, idle timeout re-armed");
        Ok(())
    }

    /// Stop a session's agent and mark it cancelled. Cleanup is best-effort.
    pub async fn cancel_session(
        &self,
        tenant_id: Uuid,
        session_id: Uuid,
    ) -> Result<AgentSession, OrchestratorError> {
        let session = self.stores.sessions.get_session(tenant_id, session_id).await?;
        if session.status.is_terminal() {
            return Err(OrchestratorError::invalid_state(
                "cancel",
                session_id,
                session.status,
            ));
        }

        let backend = self.take_backend(session_id);
        if let Some(backend) = &backend {
            if let Err(e) = backend.cancel(session_id).await {
                warn!(%session_id, "backend cancel failed: {}", e);
            }
        }

        let cancelled = self
            .stores
            .sessions
            .set_session_completed(tenant_id, session_id, SessionStatus::Cancelled, None)
            .await;
        let cancelled = match cancelled {
            Ok(cancelled) => cancelled,
            Err(e) => {
                // The watcher finished the session first; it owns the rest.
                if let Some(backend) = backend {
                    self.dispose(session_id, backend).await;
                }
                return Err(e.into());
            }
        };
        info!(%tenant_id, %session_id, "session cancelled");

        self.cleanup(&cancelled, backend).await;
        self.close_channel(&cancelled).await;
        Ok(cancelled)
    }

    /// Fail every session left non-terminal by a previous process. Returns
    /// how many were recovered.
    pub async fn recover(&self) -> Result<usize, OrchestratorError> {
        let stale = self.stores.sessions.list_active_sessions().await?;
        let mut recovered = 0;
        for session in stale {
            if let Some(container_id) = session.container_id.as_deref().filter(|c| !c.is_empty()) {
                if let Err(e) = self.runtime.stop(container_id, self.stop_grace).await {
                    debug!(session_id = %session.id, container_id, "stop during recovery: {}", e);
                }
                if let Err(e) = self.runtime.remove(container_id).await {
                    warn!(session_id = %session.id, container_id, "remove during recovery: {}", e);
                }
            }

            let failed = match self
                .stores
                .sessions
                .set_session_completed(
                    session.tenant_id,
                    session.id,
                    SessionStatus::Failed,
                    Some(RESTART_ERROR.to_string()),
                )
                .await
            {
                Ok(failed) => failed,
                Err(e) => {
                    warn!(session_id = %session.id, "failed to recover session: {}", e);
                    continue;
                }
            };
            self.cleanup(&failed, None).await;
            self.close_channel(&failed).await;
            recovered += 1;
        }
        if recovered > 0 {
            info!(recovered, "marked stale sessions failed");
        }
        Ok(recovered)
    }

    /// Stop watchers and dispose every active backend. Sessions stay as
    /// they are; the next start's [`recover`](Self::recover) fails them.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let drained: Vec<(Uuid, Arc<dyn AgentBackend>)> = self.backends().drain().collect();
        info!(sessions = drained.len(), "shutting down orchestrator");
        for (session_id, backend) in drained {
            self.dispose(session_id, backend).await;
        }
    }

    // ── Internals ─────────────────────────────────────────────────────

    async fn prepare_workspace(
        &self,
        project: &Project,
        session: &AgentSession,
    ) -> Result<String, RuntimeError> {
        let volume = volume_name(project.id);
        self.workspace.ensure_volume(&volume).await?;
        self.workspace.clone_repo(&volume, &project.repo_url).await?;
        self.workspace.fetch(&volume).await?;
        self.workspace
            .create_working_tree(&volume, &session.branch_name, &base_ref(project))
            .await
    }

    /// Undo a start that got past workspace preparation.
    async fn abort_start(
        &self,
        session: &AgentSession,
        backend: Option<Arc<dyn AgentBackend>>,
        error: String,
    ) {
        if let Some(backend) = backend {
            self.dispose(session.id, backend).await;
        }
        self.remove_working_tree(session).await;
        self.finish(session, SessionStatus::Failed, Some(error)).await;
    }

    /// Record a terminal status and, if this call won the transition,
    /// publish `session_completed`.
    async fn finish(
        &self,
        session: &AgentSession,
        status: SessionStatus,
        error: Option<String>,
    ) -> Option<AgentSession> {
        match self
            .stores
            .sessions
            .set_session_completed(session.tenant_id, session.id, status, error)
            .await
        {
            Ok(done) => {
                self.close_channel(&done).await;
                Some(done)
            }
            Err(e) => {
                debug!(session_id = %session.id, "session already finalized: {}", e);
                if let Some(channel) = self.take_channel(session.id) {
                    channel.abandon();
                }
                None
            }
        }
    }

    /// Finalize a session whose agent exited. `error` is `None` on success.
    pub(crate) async fn complete(&self, tenant_id: Uuid, session_id: Uuid, error: Option<String>) {
        let Some(backend) = self.take_backend(session_id) else {
            debug!(%session_id, "session finalized elsewhere");
            return;
        };

        let status = if error.is_none() {
            SessionStatus::Completed
        } else {
            SessionStatus::Failed
        };
        let session = match self
            .stores
            .sessions
            .set_session_completed(tenant_id, session_id, status, error)
            .await
        {
            Ok(session) => session,
            Err(e) => {
                warn!(%session_id, "failed to record session completion: {}", e);
                self.dispose(session_id, backend).await;
                return;
            }
        };
        info!(
            %tenant_id,
            %session_id,
            status = %session.status,
            error = session.error.as_deref().unwrap_or(""),
            "agent session finished"
        );

        if session.status == SessionStatus::Completed {
            if let Some(task_id) = session.task_id {
                self.after_success(&session, task_id).await;
            }
        }
        self.cleanup(&session, Some(backend)).await;
        self.close_channel(&session).await;
    }

    /// Move the task to review and mine the transcript for decisions.
    async fn after_success(&self, session: &AgentSession, task_id: Uuid) {
        if let Err(e) = self
            .stores
            .tasks
            .update_task_status(session.tenant_id, task_id, TaskStatus::Review)
            .await
        {
            warn!(session_id = %session.id, %task_id, "failed to move task to review: {}", e);
        }

        let conversation = self
            .channel(session.id)
            .map(|c| c.transcript())
            .unwrap_or_default();
        let diff = match self
            .stores
            .projects
            .get_project(session.tenant_id, session.project_id)
            .await
        {
            Ok(project) => self
                .workspace
                .diff(&volume_name(project.id), &session.branch_name, &base_ref(&project))
                .await
                .unwrap_or_else(|e| {
                    warn!(session_id = %session.id, "diff unavailable: {}", e);
                    String::new()
                }),
            Err(e) => {
                warn!(session_id = %session.id, "project lookup failed: {}", e);
                String::new()
            }
        };

        match self
            .extractor
            .extract(
                session.tenant_id,
                session.project_id,
                session.id,
                &conversation,
                &diff,
            )
            .await
        {
            Ok(0) => {}
            Ok(created) => info!(session_id = %session.id, created, "implicit decisions recorded"),
            Err(e) => warn!(session_id = %session.id, "decision extraction failed: {}", e),
        }
    }

    async fn cleanup(&self, session: &AgentSession, backend: Option<Arc<dyn AgentBackend>>) {
        let work = async {
            if let Some(backend) = backend {
                self.dispose(session.id, backend).await;
            }
            self.remove_working_tree(session).await;
            if let Err(e) = self
                .questions
                .cancel_for_session(session.tenant_id, session.id)
                .await
            {
                warn!(session_id = %session.id, "failed to cancel pending questions: {}", e);
            }
        };
        if tokio::time::timeout(CLEANUP_TIMEOUT, work).await.is_err() {
            warn!(session_id = %session.id, "cleanup timed out");
        }
    }

    async fn dispose(&self, session_id: Uuid, backend: Arc<dyn AgentBackend>) {
        if let Err(e) = backend.dispose().await {
            warn!(%session_id, agent = backend.agent_type(), "backend dispose failed: {}", e);
        }
    }

    async fn remove_working_tree(&self, session: &AgentSession) {
        let volume = volume_name(session.project_id);
        if let Err(e) = self
            .workspace
            .remove_working_tree(&volume, &session.branch_name)
            .await
        {
            warn!(session_id = %session.id, branch = %session.branch_name, "failed to remove working tree: {}", e);
        }
    }

    async fn close_channel(&self, session: &AgentSession) {
        let error = session.error.as_deref();
        match self.take_channel(session.id) {
            Some(channel) => channel.close(self.pubsub.as_ref(), error).await,
            None => publish_completed(self.pubsub.as_ref(), session.tenant_id, session.id, error).await,
        }
    }
}

/// Remote-tracking ref new working trees fork from and diffs compare to.
fn base_ref(project: &Project) -> String {
    format!("origin/{}", project.base_branch())
}

#[async_trait]
impl AnswerHandler for Orchestrator {
    async fn on_answered(
        &self,
        tenant_id: Uuid,
        session_id: Uuid,
        answer: &str,
    ) -> anyhow::Result<()> {
        self.handle_hitl_response(tenant_id, session_id, answer)
            .await?;
        Ok(())
    }

    async fn on_expired(&self, tenant_id: Uuid, session_id: Uuid) -> anyhow::Result<()> {
        self.handle_hitl_timeout(tenant_id, session_id).await?;
        Ok(())
    }
}
