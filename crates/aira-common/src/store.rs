//! Persistence and publish contracts.
//!
//! Every operation takes the caller's tenant and only sees that tenant's
//! rows; a row owned by another tenant reports `NotFound`. The two
//! `list_*` sweeps used by background watchers are the only cross-tenant
//! reads.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    Adr, AdrStatus, AgentSession, HitlQuestion, Project, QuestionStatus, SessionStatus, Task,
    TaskStatus,
};

#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn create_project(&self, project: Project) -> Result<Project, StoreError>;
    async fn get_project(&self, tenant_id: Uuid, id: Uuid) -> Result<Project, StoreError>;
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create_task(&self, task: Task) -> Result<Task, StoreError>;
    async fn get_task(&self, tenant_id: Uuid, id: Uuid) -> Result<Task, StoreError>;
    /// Fails with `InvalidTransition` when the move breaks the Kanban edges.
    async fn update_task_status(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        status: TaskStatus,
    ) -> Result<Task, StoreError>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(&self, session: AgentSession) -> Result<AgentSession, StoreError>;
    async fn get_session(&self, tenant_id: Uuid, id: Uuid) -> Result<AgentSession, StoreError>;
    /// Validates the lifecycle edge atomically; a concurrent terminal
    /// transition makes every later one fail with `InvalidTransition`.
    async fn update_session_status(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        status: SessionStatus,
        error: Option<String>,
    ) -> Result<AgentSession, StoreError>;
    /// Move to a terminal status and stamp `completed_at`.
    async fn set_session_completed(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        status: SessionStatus,
        error: Option<String>,
    ) -> Result<AgentSession, StoreError>;
    async fn set_container_id(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        container_id: &str,
    ) -> Result<(), StoreError>;
    /// Non-terminal sessions across all tenants, oldest first.
    async fn list_active_sessions(&self) -> Result<Vec<AgentSession>, StoreError>;
}

#[async_trait]
pub trait AdrStore: Send + Sync {
    async fn create_adr(&self, adr: Adr) -> Result<Adr, StoreError>;
    async fn get_adr(&self, tenant_id: Uuid, id: Uuid) -> Result<Adr, StoreError>;
    /// All ADRs of a project ordered by sequence.
    async fn list_adrs_by_project(
        &self,
        tenant_id: Uuid,
        project_id: Uuid,
    ) -> Result<Vec<Adr>, StoreError>;
    /// Allocate the next gap-free sequence number for a project.
    async fn next_adr_sequence(&self, tenant_id: Uuid, project_id: Uuid)
    -> Result<i64, StoreError>;
    async fn update_adr_status(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        status: AdrStatus,
    ) -> Result<Adr, StoreError>;
}

#[async_trait]
pub trait QuestionStore: Send + Sync {
    async fn create_question(&self, question: HitlQuestion) -> Result<HitlQuestion, StoreError>;
    async fn get_question(&self, tenant_id: Uuid, id: Uuid) -> Result<HitlQuestion, StoreError>;
    async fn get_question_by_thread(
        &self,
        tenant_id: Uuid,
        platform: &str,
        thread_id: &str,
    ) -> Result<HitlQuestion, StoreError>;
    /// Record the answer on a pending question; anything else is an
    /// `InvalidTransition`.
    async fn answer_question(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        answer: &str,
        answered_by: &str,
    ) -> Result<HitlQuestion, StoreError>;
    async fn update_question_status(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        status: QuestionStatus,
    ) -> Result<HitlQuestion, StoreError>;
    /// Pending questions whose deadline is at or before `now`, across all
    /// tenants, earliest deadline first.
    async fn list_expired_questions(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<HitlQuestion>, StoreError>;
    /// Cancel every pending question of a session. Returns how many moved.
    async fn cancel_pending_questions(
        &self,
        tenant_id: Uuid,
        session_id: Uuid,
    ) -> Result<usize, StoreError>;
}

/// Fire-and-forget fan-out of opaque payloads to channel subscribers.
#[async_trait]
pub trait PubSub: Send + Sync {
    async fn publish(&self, tenant_id: Uuid, channel: &str, payload: Vec<u8>)
    -> Result<(), StoreError>;
}
