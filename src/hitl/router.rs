use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use aira_common::StoreError;
use aira_common::models::{HitlQuestion, QuestionStatus, SessionStatus};
use aira_common::store::{QuestionStore, SessionStore};
use async_trait::async_trait;
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{AnswerHandler, AskRequest, QuestionRouter};
use crate::config::{EscalationConfig, HitlConfig};
use crate::errors::HitlError;
use crate::messenger::Messenger;

/// Posted into the question's thread when its deadline passes.
pub const TIMEOUT_NOTICE: &str =
    "No answer arrived before the deadline. The question has been cancelled.";

/// Start of the escalation message; followed by `(session <id>): <question>`.
pub const ESCALATION_PREFIX: &str = "HITL question timed out";

const THREAD_TITLE: &str = "Reply in this thread to answer.";

pub struct HitlRouter {
    questions: Arc<dyn QuestionStore>,
    sessions: Arc<dyn SessionStore>,
    messengers: HashMap<String, Arc<dyn Messenger>>,
    platform: String,
    default_channel: String,
    default_timeout: Duration,
    poll_interval: Duration,
    max_expired_per_tick: usize,
    escalation: EscalationConfig,
    answer_handler: OnceLock<Weak<dyn AnswerHandler>>,
}

impl HitlRouter {
    pub fn new(
        questions: Arc<dyn QuestionStore>,
        sessions: Arc<dyn SessionStore>,
        config: &HitlConfig,
    ) -> Self {
        Self {
            questions,
            sessions,
            messengers: HashMap::new(),
            platform: config.platform.clone(),
            default_channel: config.channel.clone(),
            default_timeout: config.default_timeout(),
            poll_interval: config.poll_interval(),
            max_expired_per_tick: config.max_expired_per_tick.max(1),
            escalation: config.escalation.clone(),
            answer_handler: OnceLock::new(),
        }
    }

    /// Register a messenger under its platform key.
    pub fn with_messenger(mut self, messenger: Arc<dyn Messenger>) -> Self {
        self.messengers
            .insert(messenger.platform().to_string(), messenger);
        self
    }

    /// Attach the component that resumes agents. Only the first call wins.
    pub fn set_answer_handler(&self, handler: Weak<dyn AnswerHandler>) -> bool {
        self.answer_handler.set(handler).is_ok()
    }

    fn messenger(&self, platform: &str) -> Result<&Arc<dyn Messenger>, HitlError> {
        self.messengers
            .get(platform)
            .ok_or_else(|| HitlError::UnknownPlatform(platform.to_string()))
    }

    fn answer_handler(&self) -> Result<Arc<dyn AnswerHandler>, HitlError> {
        self.answer_handler
            .get()
            .and_then(Weak::upgrade)
            .ok_or(HitlError::NoAnswerHandler)
    }

    /// Correlate a human reply with its question, record it, and resume
    /// the agent. Callback failures propagate.
    pub async fn handle_response(
        &self,
        tenant_id: Uuid,
        platform: &str,
        thread_id: &str,
        answer: &str,
        answered_by: &str,
    ) -> Result<HitlQuestion, HitlError> {
        let question = self
            .questions
            .get_question_by_thread(tenant_id, platform, thread_id)
            .await?;
        if question.status != QuestionStatus::Pending {
            return Err(HitlError::QuestionAlreadyAnswered {
                id: question.id,
                status: question.status.to_string(),
            });
        }
        let handler = self.answer_handler()?;

        let answered = self
            .questions
            .answer_question(tenant_id, question.id, answer, answered_by)
            .await
            .map_err(|e| match e {
                // Lost a race with another reply or the timeout watcher.
                StoreError::InvalidTransition { from, .. } => HitlError::QuestionAlreadyAnswered {
                    id: question.id,
                    status: from,
                },
                other => other.into(),
            })?;
        info!(
            %tenant_id,
            session_id = %answered.agent_session_id,
            question_id = %answered.id,
            answered_by,
            "HITL question answered"
        );

        handler
            .on_answered(tenant_id, answered.agent_session_id, answer)
            .await
            .map_err(HitlError::Callback)?;
        Ok(answered)
    }

    /// Expire every question whose deadline has passed, up to the per-tick
    /// bound. Returns how many were cancelled.
    pub async fn expire_once(&self) -> Result<usize, HitlError> {
        let expired = self
            .questions
            .list_expired_questions(Utc::now(), self.max_expired_per_tick)
            .await?;

        let mut cancelled = 0;
        for question in expired {
            if let Err(e) = self
                .questions
                .update_question_status(question.tenant_id, question.id, QuestionStatus::Cancelled)
                .await
            {
                debug!(question_id = %question.id, error = %e, "expired question already resolved");
                continue;
            }
            cancelled += 1;
            info!(
                tenant_id = %question.tenant_id,
                session_id = %question.agent_session_id,
                question_id = %question.id,
                "HITL question timed out"
            );
            self.notify_timeout(&question).await;
            self.release_session(&question).await;
        }
        Ok(cancelled)
    }

    async fn post_question(
        &self,
        messenger: &dyn Messenger,
        request: AskRequest,
    ) -> Result<HitlQuestion, HitlError> {
        let channel = request
            .channel
            .clone()
            .unwrap_or_else(|| self.default_channel.clone());

        let mut text = format!(
            "Agent session {} needs input:\n{}",
            request.session_id, request.question
        );
        if !request.options.is_empty() {
            text.push_str(&format!("\nOptions: {}", request.options.join(", ")));
        }
        let parent = messenger.post_message(&channel, &text).await?;
        let thread_id = messenger
            .create_thread(&channel, &parent, THREAD_TITLE)
            .await?;

        let now = Utc::now();
        let timeout = request.timeout.unwrap_or(self.default_timeout);
        let timeout_at = (!timeout.is_zero())
            .then(|| chrono::Duration::from_std(timeout).ok().map(|d| now + d))
            .flatten();

        Ok(self
            .questions
            .create_question(HitlQuestion {
                id: Uuid::new_v4(),
                tenant_id: request.tenant_id,
                agent_session_id: request.session_id,
                question: request.question,
                options: request.options,
                messenger_platform: messenger.platform().to_string(),
                messenger_thread_id: thread_id,
                status: QuestionStatus::Pending,
                timeout_at,
                answer: None,
                answered_by: None,
                answered_at: None,
                created_at: now,
            })
            .await?)
    }

    async fn release_session(&self, question: &HitlQuestion) {
        let Some(handler) = self.answer_handler.get().and_then(Weak::upgrade) else {
            return;
        };
        if let Err(e) = handler
            .on_expired(question.tenant_id, question.agent_session_id)
            .await
        {
            warn!(
                session_id = %question.agent_session_id,
                question_id = %question.id,
                error = %e,
                "failed to release session after timeout"
            );
        }
    }

    async fn notify_timeout(&self, question: &HitlQuestion) {
        match self.messenger(&question.messenger_platform) {
            Ok(messenger) => {
                if let Err(e) = messenger
                    .post_in_thread(&question.messenger_thread_id, TIMEOUT_NOTICE)
                    .await
                {
                    warn!(question_id = %question.id, error = %e, "failed to post timeout notice");
                }
            }
            Err(e) => warn!(question_id = %question.id, error = %e, "failed to post timeout notice"),
        }

        if !self.escalation.enabled {
            return;
        }
        let text = format!(
            "{ESCALATION_PREFIX} (session {}): {}",
            question.agent_session_id, question.question
        );
        let result = match self.messenger(&self.escalation.platform) {
            Ok(messenger) => messenger
                .post_message(&self.escalation.channel_id, &text)
                .await
                .map(|_| ())
                .map_err(HitlError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(question_id = %question.id, error = %e, "failed to escalate timed-out question");
        }
    }

    /// Run [`expire_once`](Self::expire_once) every poll interval until
    /// `cancel` fires.
    pub fn start_timeout_watcher(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(router.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = router.expire_once().await {
                            warn!(error = %e, "HITL timeout sweep failed");
                        }
                    }
                }
            }
            debug!("HITL timeout watcher stopped");
        })
    }
}

#[async_trait]
impl QuestionRouter for HitlRouter {
    /// Park the session, then post the question, open its thread and record
    /// it. Any failure after parking returns the session to running.
    async fn ask_question(&self, request: AskRequest) -> Result<HitlQuestion, HitlError> {
        let messenger = self.messenger(&self.platform)?;
        self.sessions
            .update_session_status(
                request.tenant_id,
                request.session_id,
                SessionStatus::WaitingHitl,
                None,
            )
            .await?;

        let (tenant_id, session_id) = (request.tenant_id, request.session_id);
        match self.post_question(messenger.as_ref(), request).await {
            Ok(question) => {
                info!(
                    %tenant_id,
                    %session_id,
                    question_id = %question.id,
                    thread_id = %question.messenger_thread_id,
                    "HITL question asked"
                );
                Ok(question)
            }
            Err(e) => {
                if let Err(revert) = self
                    .sessions
                    .update_session_status(tenant_id, session_id, SessionStatus::Running, None)
                    .await
                {
                    warn!(
                        %session_id,
                        error = %revert,
                        "failed to unpark session after ask failure"
                    );
                }
                Err(e)
            }
        }
    }

    async fn cancel_for_session(
        &self,
        tenant_id: Uuid,
        session_id: Uuid,
    ) -> Result<usize, HitlError> {
        Ok(self
            .questions
            .cancel_pending_questions(tenant_id, session_id)
            .await?)
    }
}
