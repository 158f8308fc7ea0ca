use std::collections::HashMap;

use aira_common::StoreError;
use aira_common::models::{
    Adr, AdrStatus, AgentSession, HitlQuestion, Project, QuestionStatus, SessionStatus, Task,
    TaskStatus,
};
use aira_common::store::{AdrStore, ProjectStore, QuestionStore, SessionStore, TaskStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Tenant ownership of a stored row.
trait Owned {
    const ENTITY: &'static str;
    fn tenant(&self) -> Uuid;
}

impl Owned for Project {
    const ENTITY: &'static str = "project";
    fn tenant(&self) -> Uuid {
        self.tenant_id
    }
}

impl Owned for Task {
    const ENTITY: &'static str = "task";
    fn tenant(&self) -> Uuid {
        self.tenant_id
    }
}

impl Owned for AgentSession {
    const ENTITY: &'static str = "agent_session";
    fn tenant(&self) -> Uuid {
        self.tenant_id
    }
}

impl Owned for HitlQuestion {
    const ENTITY: &'static str = "hitl_question";
    fn tenant(&self) -> Uuid {
        self.tenant_id
    }
}

impl Owned for Adr {
    const ENTITY: &'static str = "adr";
    fn tenant(&self) -> Uuid {
        self.tenant_id
    }
}

/// Rows of another tenant are reported as missing.
fn owned<T: Owned>(map: &HashMap<Uuid, T>, tenant_id: Uuid, id: Uuid) -> Result<&T, StoreError> {
    map.get(&id)
        .filter(|row| row.tenant() == tenant_id)
        .ok_or_else(|| StoreError::not_found(T::ENTITY, id))
}

fn owned_mut<T: Owned>(
    map: &mut HashMap<Uuid, T>,
    tenant_id: Uuid,
    id: Uuid,
) -> Result<&mut T, StoreError> {
    map.get_mut(&id)
        .filter(|row| row.tenant() == tenant_id)
        .ok_or_else(|| StoreError::not_found(T::ENTITY, id))
}

#[derive(Default)]
struct State {
    projects: HashMap<Uuid, Project>,
    tasks: HashMap<Uuid, Task>,
    sessions: HashMap<Uuid, AgentSession>,
    questions: HashMap<Uuid, HitlQuestion>,
    adrs: HashMap<Uuid, Adr>,
    adr_sequences: HashMap<(Uuid, Uuid), i64>,
}

/// Every capability held in memory behind one lock.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProjectStore for MemoryStore {
    async fn create_project(&self, project: Project) -> Result<Project, StoreError> {
        let mut state = self.state.write().await;
        if state.projects.contains_key(&project.id) {
            return Err(StoreError::Conflict {
                entity: "project",
                key: project.id.to_string(),
            });
        }
        state.projects.insert(project.id, project.clone());
        Ok(project)
    }

    async fn get_project(&self, tenant_id: Uuid, id: Uuid) -> Result<Project, StoreError> {
        let state = self.state.read().await;
        owned(&state.projects, tenant_id, id).cloned()
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn create_task(&self, task: Task) -> Result<Task, StoreError> {
        let mut state = self.state.write().await;
        owned(&state.projects, task.tenant_id, task.project_id)?;
        state.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn get_task(&self, tenant_id: Uuid, id: Uuid) -> Result<Task, StoreError> {
        let state = self.state.read().await;
        owned(&state.tasks, tenant_id, id).cloned()
    }

    async fn update_task_status(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        status: TaskStatus,
    ) -> Result<Task, StoreError> {
        let mut state = self.state.write().await;
        let task = owned_mut(&mut state.tasks, tenant_id, id)?;
        task.transition(status)?;
        Ok(task.clone())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create_session(&self, session: AgentSession) -> Result<AgentSession, StoreError> {
        let mut state = self.state.write().await;
        state.sessions.insert(session.id, session.clone());
        Ok(session)
    }

    async fn get_session(&self, tenant_id: Uuid, id: Uuid) -> Result<AgentSession, StoreError> {
        let state = self.state.read().await;
        owned(&state.sessions, tenant_id, id).cloned()
    }

    async fn update_session_status(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        status: SessionStatus,
        error: Option<String>,
    ) -> Result<AgentSession, StoreError> {
        let mut state = self.state.write().await;
        let session = owned_mut(&mut state.sessions, tenant_id, id)?;
        session.transition(status, error, Utc::now())?;
        Ok(session.clone())
    }

    async fn set_session_completed(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        status: SessionStatus,
        error: Option<String>,
    ) -> Result<AgentSession, StoreError> {
        if !status.is_terminal() {
            return Err(StoreError::InvalidTransition {
                entity: "agent_session",
                from: "any".to_string(),
                to: status.to_string(),
            });
        }
        self.update_session_status(tenant_id, id, status, error)
            .await
    }

    async fn set_container_id(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        container_id: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let session = owned_mut(&mut state.sessions, tenant_id, id)?;
        session.container_id = Some(container_id.to_string());
        Ok(())
    }

    async fn list_active_sessions(&self) -> Result<Vec<AgentSession>, StoreError> {
        let state = self.state.read().await;
        let mut active: Vec<AgentSession> = state
            .sessions
            .values()
            .filter(|s| !s.status.is_terminal())
            .cloned()
            .collect();
        active.sort_by_key(|s| s.created_at);
        Ok(active)
    }
}

#[async_trait]
impl AdrStore for MemoryStore {
    async fn create_adr(&self, adr: Adr) -> Result<Adr, StoreError> {
        let mut state = self.state.write().await;
        let duplicate = state.adrs.values().any(|a| {
            a.tenant_id == adr.tenant_id
                && a.project_id == adr.project_id
                && a.sequence == adr.sequence
        });
        if duplicate {
            return Err(StoreError::Conflict {
                entity: "adr",
                key: format!("{}#{}", adr.project_id, adr.sequence),
            });
        }
        state.adrs.insert(adr.id, adr.clone());
        Ok(adr)
    }

    async fn get_adr(&self, tenant_id: Uuid, id: Uuid) -> Result<Adr, StoreError> {
        let state = self.state.read().await;
        owned(&state.adrs, tenant_id, id).cloned()
    }

    async fn list_adrs_by_project(
        &self,
        tenant_id: Uuid,
        project_id: Uuid,
    ) -> Result<Vec<Adr>, StoreError> {
        let state = self.state.read().await;
        let mut adrs: Vec<Adr> = state
            .adrs
            .values()
            .filter(|a| a.tenant_id == tenant_id && a.project_id == project_id)
            .cloned()
            .collect();
        adrs.sort_by_key(|a| a.sequence);
        Ok(adrs)
    }

    async fn next_adr_sequence(
        &self,
        tenant_id: Uuid,
        project_id: Uuid,
    ) -> Result<i64, StoreError> {
        let mut state = self.state.write().await;
        let next = state
            .adr_sequences
            .entry((tenant_id, project_id))
            .or_insert(0);
        *next += 1;
        Ok(*next)
    }

    async fn update_adr_status(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        status: AdrStatus,
    ) -> Result<Adr, StoreError> {
        let mut state = self.state.write().await;
        let adr = owned_mut(&mut state.adrs, tenant_id, id)?;
        if !adr.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                entity: "adr",
                from: adr.status.to_string(),
                to: status.to_string(),
            });
        }
        adr.status = status;
        Ok(adr.clone())
    }
}

#[async_trait]
impl QuestionStore for MemoryStore {
    async fn create_question(&self, question: HitlQuestion) -> Result<HitlQuestion, StoreError> {
        let mut state = self.state.write().await;
        let duplicate = state.questions.values().any(|q| {
            q.tenant_id == question.tenant_id
                && q.messenger_platform == question.messenger_platform
                && q.messenger_thread_id == question.messenger_thread_id
        });
        if duplicate {
            return Err(StoreError::Conflict {
                entity: "hitl_question",
                key: format!(
                    "{}/{}",
                    question.messenger_platform, question.messenger_thread_id
                ),
            });
        }
        state.questions.insert(question.id, question.clone());
        Ok(question)
    }

    async fn get_question(&self, tenant_id: Uuid, id: Uuid) -> Result<HitlQuestion, StoreError> {
        let state = self.state.read().await;
        owned(&state.questions, tenant_id, id).cloned()
    }

    async fn get_question_by_thread(
        &self,
        tenant_id: Uuid,
        platform: &str,
        thread_id: &str,
    ) -> Result<HitlQuestion, StoreError> {
        let state = self.state.read().await;
        state
            .questions
            .values()
            .find(|q| {
                q.tenant_id == tenant_id
                    && q.messenger_platform == platform
                    && q.messenger_thread_id == thread_id
            })
            .cloned()
            .ok_or_else(|| StoreError::not_found("hitl_question", format!("{platform}/{thread_id}")))
    }

    async fn answer_question(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        answer: &str,
        answered_by: &str,
    ) -> Result<HitlQuestion, StoreError> {
        let mut state = self.state.write().await;
        let question = owned_mut(&mut state.questions, tenant_id, id)?;
        question.answer(answer, answered_by, Utc::now())?;
        Ok(question.clone())
    }

    async fn update_question_status(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        status: QuestionStatus,
    ) -> Result<HitlQuestion, StoreError> {
        let mut state = self.state.write().await;
        let question = owned_mut(&mut state.questions, tenant_id, id)?;
        question.resolve(status)?;
        Ok(question.clone())
    }

    async fn list_expired_questions(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<HitlQuestion>, StoreError> {
        let state = self.state.read().await;
        let mut expired: Vec<HitlQuestion> = state
            .questions
            .values()
            .filter(|q| q.is_expired(now))
            .cloned()
            .collect();
        expired.sort_by_key(|q| q.timeout_at);
        expired.truncate(limit);
        Ok(expired)
    }

    async fn cancel_pending_questions(
        &self,
        tenant_id: Uuid,
        session_id: Uuid,
    ) -> Result<usize, StoreError> {
        let mut state = self.state.write().await;
        let mut cancelled = 0;
        for question in state.questions.values_mut().filter(|q| {
            q.tenant_id == tenant_id
                && q.agent_session_id == session_id
                && q.status == QuestionStatus::Pending
        }) {
            question.status = QuestionStatus::Cancelled;
            cancelled += 1;
        }
        Ok(cancelled)
    }
}
