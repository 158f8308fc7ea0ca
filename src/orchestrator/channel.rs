//! Per-session publish gate and the message handler that feeds it.
//!
//! Envelopes wait behind the gate until the session is marked running, so
//! an early `ask_human` never races the `pending → running` edge. Closing
//! the gate publishes `session_completed`; anything arriving afterwards is
//! dropped.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use aira_common::models::session_channel;
use aira_common::store::PubSub;
use async_trait::async_trait;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::agent::{AgentBackend, AgentMessage, MessageHandler, MessageType};
use crate::hitl::{AskHumanInput, QuestionRouter};

/// Output lines retained per session for decision extraction.
pub const TRANSCRIPT_LINES: usize = 2000;

/// Session metadata key naming the chat channel for HITL questions.
pub const HITL_CHANNEL_KEY: &str = "hitl_channel";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    Held,
    Open,
    Closed,
}

pub struct SessionChannel {
    tenant_id: Uuid,
    session_id: Uuid,
    channel: String,
    gate: watch::Sender<Gate>,
    /// Serializes publishes against `close`.
    publish: tokio::sync::Mutex<()>,
    transcript: Mutex<VecDeque<String>>,
}

impl SessionChannel {
    pub fn new(tenant_id: Uuid, session_id: Uuid) -> Self {
        let (gate, _) = watch::channel(Gate::Held);
        Self {
            tenant_id,
            session_id,
            channel: session_channel(session_id),
            gate,
            publish: tokio::sync::Mutex::new(()),
            transcript: Mutex::new(VecDeque::new()),
        }
    }

    /// Let held and future envelopes through.
    pub fn open(&self) {
        self.gate.send_if_modified(|gate| {
            if *gate == Gate::Held {
                *gate = Gate::Open;
                true
            } else {
                false
            }
        });
    }

    /// Close without publishing; held envelopes are dropped.
    pub fn abandon(&self) {
        self.gate.send_replace(Gate::Closed);
    }

    pub fn is_closed(&self) -> bool {
        *self.gate.borrow() == Gate::Closed
    }

    /// Publish one envelope unless the gate has closed. Waits while held.
    pub async fn publish(&self, pubsub: &dyn PubSub, msg: &AgentMessage) -> bool {
        let mut rx = self.gate.subscribe();
        let passed = matches!(rx.wait_for(|g| *g != Gate::Held).await, Ok(g) if *g == Gate::Open);
        if !passed {
            trace!(session_id = %self.session_id, "gate closed, dropping envelope");
            return false;
        }

        let payload = match serde_json::to_vec(msg) {
            Ok(p) => p,
            Err(e) => {
                warn!(session_id = %self.session_id, "failed to encode envelope: {}", e);
                return false;
            }
        };

        let _guard = self.publish.lock().await;
        if self.is_closed() {
            return false;
        }
        if msg.kind == MessageType::Output {
            self.record(&msg.content);
        }
        if let Err(e) = pubsub.publish(self.tenant_id, &self.channel, payload).await {
            warn!(session_id = %self.session_id, channel = %self.channel, "publish failed: {}", e);
        }
        true
    }

    /// Close the gate and publish the completion event. Only the first call
    /// publishes.
    pub async fn close(&self, pubsub: &dyn PubSub, error: Option<&str>) {
        let _guard = self.publish.lock().await;
        let was_closed = !self.gate.send_if_modified(|gate| {
            if *gate == Gate::Closed {
                false
            } else {
                *gate = Gate::Closed;
                true
            }
        });
        if was_closed {
            return;
        }
        publish_completed(pubsub, self.tenant_id, self.session_id, error).await;
    }

    fn record(&self, line: &str) {
        let mut transcript = self
            .transcript
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if transcript.len() == TRANSCRIPT_LINES {
            transcript.pop_front();
        }
        transcript.push_back(line.to_string());
    }

    pub fn transcript(&self) -> Vec<String> {
        self.transcript
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

/// Publish `session_completed` outside any gate. Used directly for
/// sessions that never had one.
pub async fn publish_completed(
    pubsub: &dyn PubSub,
    tenant_id: Uuid,
    session_id: Uuid,
    error: Option<&str>,
) {
    let channel = session_channel(session_id);
    let body = json!({
        "type": "session_completed",
        "session_id": session_id,
        "error": error.unwrap_or_default(),
    });
    if let Err(e) = pubsub
        .publish(tenant_id, &channel, body.to_string().into_bytes())
        .await
    {
        warn!(%session_id, channel = %channel, "failed to publish session_completed: {}", e);
    }
}

/// Handler registered on a session's backend.
pub struct SessionHandler {
    pub backend: Weak<dyn AgentBackend>,
    pub channel: Arc<SessionChannel>,
    pub pubsub: Arc<dyn PubSub>,
    pub questions: Arc<dyn QuestionRouter>,
    pub hitl_channel: Option<String>,
}

#[async_trait]
impl MessageHandler for SessionHandler {
    async fn handle(&self, msg: AgentMessage) {
        if !self.channel.publish(self.pubsub.as_ref(), &msg).await {
            return;
        }
        if !msg.is_ask_human() {
            return;
        }
        let Some(call) = msg.tool_call else {
            return;
        };

        let input: AskHumanInput = match serde_json::from_value(call.input) {
            Ok(input) => input,
            Err(e) => {
                warn!(session_id = %msg.session_id, "malformed ask_human input: {}", e);
                self.resume_idle().await;
                return;
            }
        };
        let request = input.into_request(
            self.channel.tenant_id,
            self.channel.session_id,
            self.hitl_channel.as_deref(),
        );
        match self.questions.ask_question(request).await {
            Ok(question) => debug!(
                session_id = %msg.session_id,
                question_id = %question.id,
                "ask_human routed"
            ),
            Err(e) => {
                warn!(session_id = %msg.session_id, "failed to route ask_human: {}", e);
                self.resume_idle().await;
            }
        }
    }
}

impl SessionHandler {
    /// Nobody will answer; let the idle timeout apply again.
    async fn resume_idle(&self) {
        let Some(backend) = self.backend.upgrade() else {
            return;
        };
        if let Err(e) = backend.resume_idle(self.channel.session_id).await {
            debug!(session_id = %self.channel.session_id, "could not re-arm idle timeout: {}", e);
        }
    }
}
