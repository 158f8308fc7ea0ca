//! [`AgentBackend`] that runs each session as a container.
//!
//! Each session gets one stream reader task. The reader is the only
//! producer of that session's envelopes, so the handler sees them in the
//! order the agent printed them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use aira_runtime::{ContainerRuntime, CreateOptions, LogStream};
use async_trait::async_trait;
use tokio::sync::{RwLock, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::transport::{AgentKind, Transport};
use super::{
    AgentBackend, AgentMessage, MessageHandler, MessageType, SessionOptions, StartedSession,
};
use crate::errors::AgentError;

/// One-shot exec that pipes its stdin into the agent's stdin.
pub fn stdin_command() -> Vec<String> {
    vec![
        "sh".to_string(),
        "-c".to_string(),
        "cat > /proc/1/fd/0".to_string(),
    ]
}

struct SessionHandle {
    container_id: String,
    cancel: CancellationToken,
    /// Set while an `ask_human` call is outstanding; suspends the idle clock.
    awaiting_input: Arc<AtomicBool>,
}

pub struct ContainerBackend {
    kind: AgentKind,
    runtime: Arc<dyn ContainerRuntime>,
    image: String,
    command: Option<Vec<String>>,
    stop_grace: Duration,
    sessions: RwLock<HashMap<Uuid, SessionHandle>>,
    handler: std::sync::RwLock<Option<Arc<dyn MessageHandler>>>,
}

impl ContainerBackend {
    pub fn new(kind: AgentKind, runtime: Arc<dyn ContainerRuntime>, image: &str) -> Self {
        Self {
            kind,
            runtime,
            image: image.to_string(),
            command: None,
            stop_grace: Duration::from_secs(30),
            sessions: RwLock::new(HashMap::new()),
            handler: std::sync::RwLock::new(None),
        }
    }

    /// Replace the agent executable and its fixed flags. The prompt is still
    /// appended for dialects that take it on the command line.
    pub fn with_command(mut self, command: Vec<String>) -> Self {
        if !command.is_empty() {
            self.command = Some(command);
        }
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    fn command_line(&self, prompt: &str) -> Vec<String> {
        match &self.command {
            None => self.kind.command(prompt),
            Some(prefix) => {
                let mut cmd = prefix.clone();
                if self.kind.initial_stdin(prompt).is_none() {
                    cmd.push(prompt.to_string());
                }
                cmd
            }
        }
    }

    fn current_handler(&self) -> Option<Arc<dyn MessageHandler>> {
        self.handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Start the created container and hand it its prompt.
    async fn launch(&self, container_id: &str, prompt: &str) -> Result<LogStream, AgentError> {
        self.runtime.start(container_id).await?;
        let logs = self.runtime.stream_logs(container_id).await?;
        if let Some(stdin) = self.kind.initial_stdin(prompt) {
            self.runtime
                .exec_stdin(container_id, &stdin_command(), stdin.as_bytes())
                .await?;
        }
        Ok(logs)
    }

    async fn discard(&self, container_id: &str) {
        if let Err(e) = self.runtime.stop(container_id, self.stop_grace).await {
            debug!(container_id, "stop after failed launch: {}", e);
        }
        if let Err(e) = self.runtime.remove(container_id).await {
            warn!(container_id, "failed to remove container after failed launch: {}", e);
        }
    }
}

#[async_trait]
impl AgentBackend for ContainerBackend {
    fn agent_type(&self) -> &str {
        self.kind.as_str()
    }

    async fn start_session(&self, opts: SessionOptions) -> Result<StartedSession, AgentError> {
        let create = CreateOptions {
            session_id: opts.session_id.to_string(),
            image: opts.image.clone().unwrap_or_else(|| self.image.clone()),
            volume_name: opts.volume_name.clone(),
            mount_path: opts.mount_path.clone(),
            work_dir: opts.work_dir.clone(),
            branch_name: opts.branch_name.clone(),
            env: opts.env.clone(),
            cmd: self.command_line(&opts.prompt),
            entrypoint: None,
            network_mode: None,
        };

        let container_id = self.runtime.create(&create).await?;
        let logs = match self.launch(&container_id, &opts.prompt).await {
            Ok(logs) => logs,
            Err(e) => {
                self.discard(&container_id).await;
                return Err(e);
            }
        };

        let cancel = CancellationToken::new();
        let awaiting_input = Arc::new(AtomicBool::new(false));
        self.sessions.write().await.insert(
            opts.session_id,
            SessionHandle {
                container_id: container_id.clone(),
                cancel: cancel.clone(),
                awaiting_input: awaiting_input.clone(),
            },
        );

        let (done_tx, done_rx) = oneshot::channel();
        let reader = StreamReader {
            session_id: opts.session_id,
            kind: self.kind,
            container_id: container_id.clone(),
            runtime: self.runtime.clone(),
            handler: self.current_handler(),
            cancel,
            awaiting_input,
            stop_grace: self.stop_grace,
        };
        tokio::spawn(reader.run(logs, done_tx));

        info!(
            session_id = %opts.session_id,
            container_id = %container_id,
            agent = self.kind.as_str(),
            "agent session started"
        );
        Ok(StartedSession {
            container_id,
            stream_done: done_rx,
        })
    }

    async fn send_prompt(&self, session_id: Uuid, text: &str) -> Result<(), AgentError> {
        let (container_id, awaiting_input) = {
            let sessions = self.sessions.read().await;
            let handle = sessions
                .get(&session_id)
                .ok_or(AgentError::SessionNotFound(session_id))?;
            (handle.container_id.clone(), handle.awaiting_input.clone())
        };

        let payload = format!("{text}\n");
        self.runtime
            .exec_stdin(&container_id, &stdin_command(), payload.as_bytes())
            .await?;
        awaiting_input.store(false, Ordering::SeqCst);
        debug!(session_id = %session_id, container_id = %container_id, "prompt delivered");
        Ok(())
    }

    async fn resume_idle(&self, session_id: Uuid) -> Result<(), AgentError> {
        let sessions = self.sessions.read().await;
        let handle = sessions
            .get(&session_id)
            .ok_or(AgentError::SessionNotFound(session_id))?;
        handle.awaiting_input.store(false, Ordering::SeqCst);
        debug!(session_id = %session_id, "idle timeout re-armed");
        Ok(())
    }

    async fn cancel(&self, session_id: Uuid) -> Result<(), AgentError> {
        let (container_id, token) = {
            let sessions = self.sessions.read().await;
            let handle = sessions
                .get(&session_id)
                .ok_or(AgentError::SessionNotFound(session_id))?;
            (handle.container_id.clone(), handle.cancel.clone())
        };

        let stopped = self.runtime.stop(&container_id, self.stop_grace).await;
        token.cancel();
        stopped?;
        info!(session_id = %session_id, container_id = %container_id, "agent session cancelled");
        Ok(())
    }

    fn on_message(&self, handler: Arc<dyn MessageHandler>) {
        *self.handler.write().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    async fn dispose(&self) -> Result<(), AgentError> {
        let mut drained: Vec<(Uuid, SessionHandle)> =
            self.sessions.write().await.drain().collect();
        drained.sort_by_key(|(id, _)| *id);

        let mut first_error: Option<AgentError> = None;
        for (session_id, handle) in drained {
            handle.cancel.cancel();
            let results = [
                self.runtime.stop(&handle.container_id, self.stop_grace).await,
                self.runtime.remove(&handle.container_id).await,
            ];
            for result in results {
                if let Err(e) = result {
                    if first_error.is_none() {
                        first_error = Some(e.into());
                    } else {
                        warn!(
                            session_id = %session_id,
                            container_id = %handle.container_id,
                            "dispose: {}", e
                        );
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Reassembles newline-terminated lines from arbitrarily split chunks.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            lines.push(line);
        }
        lines
    }

    fn finish(&mut self) -> Option<Vec<u8>> {
        (!self.pending.is_empty()).then(|| std::mem::take(&mut self.pending))
    }
}

struct StreamReader {
    session_id: Uuid,
    kind: AgentKind,
    container_id: String,
    runtime: Arc<dyn ContainerRuntime>,
    handler: Option<Arc<dyn MessageHandler>>,
    cancel: CancellationToken,
    awaiting_input: Arc<AtomicBool>,
    stop_grace: Duration,
}

impl StreamReader {
    async fn run(self, mut logs: LogStream, done: oneshot::Sender<()>) {
        let mut buffer = LineBuffer::default();
        let mut started = false;

        loop {
            let limit = if started {
                self.kind.idle_timeout()
            } else {
                self.kind.init_timeout()
            };

            let next = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = tokio::time::timeout(limit, logs.recv()) => next,
            };

            match next {
                Ok(Some(chunk)) => {
                    started = true;
                    for line in buffer.push(&chunk) {
                        self.deliver_line(&line).await;
                    }
                }
                Ok(None) => break,
                Err(_) if self.awaiting_input.load(Ordering::SeqCst) => continue,
                Err(_) => {
                    self.on_timeout(started, limit).await;
                    break;
                }
            }
        }

        if let Some(rest) = buffer.finish() {
            self.deliver_line(&rest).await;
        }
        debug!(session_id = %self.session_id, "stream reader finished");
        let _ = done.send(());
    }

    async fn deliver_line(&self, line: &[u8]) {
        let Some(text) = self.kind.filter_output(line) else {
            return;
        };
        let msg = AgentMessage::from_line(&self.kind, self.session_id, text);
        if msg.is_ask_human() {
            self.awaiting_input.store(true, Ordering::SeqCst);
        }
        self.deliver(msg).await;
    }

    async fn deliver(&self, msg: AgentMessage) {
        match &self.handler {
            Some(handler) => handler.handle(msg).await,
            None => debug!(session_id = %self.session_id, "no handler registered, dropping envelope"),
        }
    }

    async fn on_timeout(&self, started: bool, limit: Duration) {
        let phase = if started { "idle" } else { "init" };
        warn!(
            session_id = %self.session_id,
            container_id = %self.container_id,
            agent = self.kind.as_str(),
            "{} timeout after {}s, stopping container",
            phase,
            limit.as_secs()
        );
        let msg = AgentMessage::new(
            MessageType::Error,
            self.session_id,
            format!(
                "{} produced no output for {}s ({} timeout)",
                self.kind,
                limit.as_secs(),
                phase
            ),
        );
        self.deliver(msg).await;
        if let Err(e) = self.runtime.stop(&self.container_id, self.stop_grace).await {
            warn!(container_id = %self.container_id, "failed to stop timed-out container: {}", e);
        }
    }
}
