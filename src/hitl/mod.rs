//! Human-in-the-loop questions.
//!
//! An agent parks itself with an `ask_human` tool call. The router posts the
//! question to a chat thread, records it, and moves the session to
//! `waiting_hitl`. A reply on the thread is correlated back by
//! `(tenant, platform, thread id)` and handed to the [`AnswerHandler`],
//! which resumes the agent.
//!
//! The orchestrator and the router reference each other only through the
//! two traits here: the orchestrator owns an `Arc<dyn QuestionRouter>`, the
//! router holds a `Weak<dyn AnswerHandler>` set after construction.

mod router;

use std::time::Duration;

use aira_common::models::HitlQuestion;
use async_trait::async_trait;
use serde::Deserialize;
use uuid::Uuid;

use crate::errors::HitlError;

pub use router::{ESCALATION_PREFIX, HitlRouter, TIMEOUT_NOTICE};

/// Resumes an agent once its question is answered.
#[async_trait]
pub trait AnswerHandler: Send + Sync {
    async fn on_answered(
        &self,
        tenant_id: Uuid,
        session_id: Uuid,
        answer: &str,
    ) -> anyhow::Result<()>;

    /// A pending question expired unanswered.
    async fn on_expired(&self, _tenant_id: Uuid, _session_id: Uuid) -> anyhow::Result<()> {
        Ok(())
    }
}

/// The orchestrator's view of the router.
#[async_trait]
pub trait QuestionRouter: Send + Sync {
    async fn ask_question(&self, request: AskRequest) -> Result<HitlQuestion, HitlError>;

    /// Cancel whatever the session still has pending. Returns the count.
    async fn cancel_for_session(
        &self,
        tenant_id: Uuid,
        session_id: Uuid,
    ) -> Result<usize, HitlError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct AskRequest {
    pub tenant_id: Uuid,
    pub session_id: Uuid,
    pub question: String,
    pub options: Vec<String>,
    /// `None` uses the router's default; zero means no deadline.
    pub timeout: Option<Duration>,
    /// `None` uses the router's default channel.
    pub channel: Option<String>,
}

/// Input of the `ask_human` tool call.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AskHumanInput {
    pub question: String,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub channel: Option<String>,
}

impl AskHumanInput {
    pub fn into_request(
        self,
        tenant_id: Uuid,
        session_id: Uuid,
        fallback_channel: Option<&str>,
    ) -> AskRequest {
        AskRequest {
            tenant_id,
            session_id,
            question: self.question,
            options: self.options,
            timeout: self.timeout_seconds.map(Duration::from_secs),
            channel: self
                .channel
                .filter(|c| !c.is_empty())
                .or_else(|| fallback_channel.map(str::to_string)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_minimal_input() {
        let input: AskHumanInput = serde_json::from_value(json!({"question": "Ship it?"})).unwrap();
        let req = input.into_request(Uuid::nil(), Uuid::nil(), None);
        assert_eq!(req.question, "Ship it?");
        assert!(req.options.is_empty());
        assert_eq!(req.timeout, None);
        assert_eq!(req.channel, None);
    }

    #[test]
    fn test_channel_precedence() {
        let input: AskHumanInput =
            serde_json::from_value(json!({"question": "Q", "channel": "C-call"})).unwrap();
        let req = input.into_request(Uuid::nil(), Uuid::nil(), Some("C-session"));
        assert_eq!(req.channel.as_deref(), Some("C-call"));

        let input: AskHumanInput =
            serde_json::from_value(json!({"question": "Q", "channel": ""})).unwrap();
        let req = input.into_request(Uuid::nil(), Uuid::nil(), Some("C-session"));
        assert_eq!(req.channel.as_deref(), Some("C-session"));
    }

    #[test]
    fn test_full_input() {
        let input: AskHumanInput = serde_json::from_value(json!({
            "question": "Which DB?",
            "options": ["pg", "mysql"],
            "timeout_seconds": 900
        }))
        .unwrap();
        let req = input.into_request(Uuid::nil(), Uuid::nil(), None);
        assert_eq!(req.options, vec!["pg", "mysql"]);
        assert_eq!(req.timeout, Some(Duration::from_secs(900)));
    }

    #[test]
    fn test_question_is_required() {
        assert!(serde_json::from_value::<AskHumanInput>(json!({"options": []})).is_err());
    }
}
