//! Typed error hierarchy for the orchestrator.
//!
//! One enum per subsystem:
//! - `AgentError` — registry lookups and backend session control
//! - `OrchestratorError` — session lifecycle operations
//! - `MessengerError` — chat platform adapters
//! - `HitlError` — question routing and answer correlation
//! - `ExtractionError` — decision post-processing

use aira_common::StoreError;
use aira_runtime::RuntimeError;
use thiserror::Error;
use uuid::Uuid;

/// Errors from the agent registry and backends.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Unknown agent type: {0}")]
    UnknownAgent(String),

    #[error("Session {0} is not managed by this backend")]
    SessionNotFound(Uuid),

    #[error("Container runtime error: {0}")]
    Runtime(#[from] RuntimeError),
}

/// Errors from session lifecycle operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("{0}")]
    NotFound(String),

    /// The operation is not legal for the session's (or its task's) state.
    #[error("{0}")]
    InvalidSessionState(String),

    #[error("No active backend for session {0}")]
    SessionNotFound(Uuid),

    #[error("Workspace preparation failed: {0}")]
    Workspace(#[source] RuntimeError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Store(StoreError),

    #[error("Orchestrator is shutting down")]
    ShuttingDown,
}

impl OrchestratorError {
    pub fn invalid_state(operation: &str, session_id: Uuid, status: impl std::fmt::Display) -> Self {
        Self::InvalidSessionState(format!(
            "Cannot {operation} session {session_id} in state {status}"
        ))
    }
}

impl From<StoreError> for OrchestratorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } => Self::NotFound(err.to_string()),
            other => Self::Store(other),
        }
    }
}

/// Errors from chat platform adapters.
#[derive(Debug, Error)]
pub enum MessengerError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{method} rejected by platform: {error}")]
    Api { method: &'static str, error: String },

    #[error("Malformed thread id: {0}")]
    InvalidThread(String),
}

/// Errors from the HITL router.
#[derive(Debug, Error)]
pub enum HitlError {
    #[error("Question {id} is already {status}")]
    QuestionAlreadyAnswered { id: Uuid, status: String },

    #[error("{0}")]
    NotFound(String),

    #[error("No messenger registered for platform {0}")]
    UnknownPlatform(String),

    #[error("Messenger error: {0}")]
    Messenger(#[from] MessengerError),

    #[error("Resuming the agent failed: {0}")]
    Callback(#[source] anyhow::Error),

    #[error("No answer handler attached to the router")]
    NoAnswerHandler,

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for HitlError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } => Self::NotFound(err.to_string()),
            other => Self::Store(other),
        }
    }
}

/// A store failure part-way through recording extracted decisions.
#[derive(Debug, Error)]
#[error("Decision extraction stopped after {created} ADR(s): {source}")]
pub struct ExtractionError {
    pub created: usize,
    #[source]
    pub source: StoreError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_not_found_maps_to_not_found() {
        let err: OrchestratorError = StoreError::not_found("task", "t1").into();
        assert!(matches!(err, OrchestratorError::NotFound(ref m) if m == "task t1 not found"));

        let err: HitlError = StoreError::not_found("hitl_question", "q1").into();
        assert!(matches!(err, HitlError::NotFound(_)));
    }

    #[test]
    fn test_invalid_transition_stays_a_store_error() {
        let err: OrchestratorError = StoreError::InvalidTransition {
            entity: "task",
            from: "done".into(),
            to: "review".into(),
        }
        .into();
        assert!(matches!(
            err,
            OrchestratorError::Store(StoreError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_invalid_session_state_message() {
        let err = OrchestratorError::invalid_state("cancel", Uuid::nil(), "completed");
        assert_eq!(
            err.to_string(),
            "Cannot cancel session 00000000-0000-0000-0000-000000000000 in state completed"
        );
    }

    #[test]
    fn test_agent_error_is_transparent() {
        let err: OrchestratorError = AgentError::UnknownAgent("gpt".into()).into();
        assert_eq!(err.to_string(), "Unknown agent type: gpt");
    }

    #[test]
    fn test_extraction_error_reports_count() {
        let err = ExtractionError {
            created: 2,
            source: StoreError::Backend(anyhow::anyhow!("disk full")),
        };
        assert_eq!(
            err.to_string(),
            "Decision extraction stopped after 2 ADR(s): Database error: disk full"
        );
    }
}
