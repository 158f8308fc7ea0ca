use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::StoreError;

/// Prefix of every agent branch; the remainder is the session id.
pub const BRANCH_PREFIX: &str = "aira/";

/// Prefix of the per-project repository volume.
pub const VOLUME_PREFIX: &str = "aira-repo-";

pub fn branch_name(session_id: Uuid) -> String {
    format!("{BRANCH_PREFIX}{session_id}")
}

pub fn volume_name(project_id: Uuid) -> String {
    format!("{VOLUME_PREFIX}{project_id}")
}

/// Publish channel carrying one session's events.
pub fn session_channel(session_id: Uuid) -> String {
    format!("agent:{session_id}")
}

// ── Projects and tasks ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Project {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub repo_url: String,
    /// Base branch new working trees fork from. `None` means `main`.
    pub branch: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Project {
    pub fn new(tenant_id: Uuid, name: &str, repo_url: &str, branch: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            name: name.to_string(),
            repo_url: repo_url.to_string(),
            branch,
            created_at: Utc::now(),
        }
    }

    pub fn base_branch(&self) -> &str {
        match self.branch.as_deref() {
            Some(b) if !b.is_empty() => b,
            _ => "main",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Backlog,
    InProgress,
    Review,
    Done,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backlog => "backlog",
            Self::InProgress => "in_progress",
            Self::Review => "review",
            Self::Done => "done",
        }
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Backlog, InProgress) | (InProgress, Review) | (Review, Done) | (Review, InProgress)
        )
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backlog" => Ok(Self::Backlog),
            "in_progress" => Ok(Self::InProgress),
            "review" => Ok(Self::Review),
            "done" => Ok(Self::Done),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub project_id: Uuid,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(tenant_id: Uuid, project_id: Uuid, title: &str, description: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            project_id,
            title: title.to_string(),
            description: description.to_string(),
            status: TaskStatus::Backlog,
            created_at: now,
            updated_at: now,
        }
    }

    /// The prompt handed to an agent working this task.
    pub fn prompt(&self) -> String {
        if self.description.trim().is_empty() {
            self.title.clone()
        } else {
            format!("{}\n\n{}", self.title, self.description)
        }
    }

    pub fn transition(&mut self, next: TaskStatus) -> Result<(), StoreError> {
        if !self.status.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                entity: "task",
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

// ── Agent sessions ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Running,
    WaitingHitl,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::WaitingHitl => "waiting_hitl",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Terminal states have no outgoing edges. A parked session may end
    /// directly when its container exits while the question is open.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match self {
            Pending => matches!(next, Running | Failed | Cancelled),
            Running => matches!(next, WaitingHitl | Completed | Failed | Cancelled),
            WaitingHitl => matches!(next, Running | Completed | Failed | Cancelled),
            Completed | Failed | Cancelled => false,
        }
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "waiting_hitl" => Ok(Self::WaitingHitl),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid session status: {}", s)),
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentSession {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub project_id: Uuid,
    pub task_id: Option<Uuid>,
    pub agent_type: String,
    pub status: SessionStatus,
    pub container_id: Option<String>,
    pub branch_name: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl AgentSession {
    pub fn new(
        tenant_id: Uuid,
        project_id: Uuid,
        task_id: Option<Uuid>,
        agent_type: &str,
        metadata: Map<String, Value>,
    ) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            tenant_id,
            project_id,
            task_id,
            agent_type: agent_type.to_string(),
            status: SessionStatus::Pending,
            container_id: None,
            branch_name: branch_name(id),
            started_at: None,
            completed_at: None,
            error: None,
            metadata,
            created_at: Utc::now(),
        }
    }

    /// Apply a status change, keeping `started_at` and `completed_at`
    /// consistent with the new status.
    pub fn transition(
        &mut self,
        next: SessionStatus,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if !self.status.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                entity: "agent_session",
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        if next == SessionStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
            if error.is_some() {
                self.error = error;
            }
        }
        Ok(())
    }

    /// Optional string value from the session metadata.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}

// ── HITL questions ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QuestionStatus {
    Pending,
    Answered,
    Timeout,
    Cancelled,
}

impl QuestionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Answered => "answered",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

impl FromStr for QuestionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "answered" => Ok(Self::Answered),
            "timeout" => Ok(Self::Timeout),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid question status: {}", s)),
        }
    }
}

impl fmt::Display for QuestionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HitlQuestion {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub agent_session_id: Uuid,
    pub question: String,
    #[serde(default)]
    pub options: Vec<String>,
    pub messenger_platform: String,
    pub messenger_thread_id: String,
    pub status: QuestionStatus,
    pub timeout_at: Option<DateTime<Utc>>,
    pub answer: Option<String>,
    pub answered_by: Option<String>,
    pub answered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl HitlQuestion {
    /// Record a human answer. Only pending questions accept one.
    pub fn answer(
        &mut self,
        answer: &str,
        answered_by: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.resolve(QuestionStatus::Answered)?;
        self.answer = Some(answer.to_string());
        self.answered_by = Some(answered_by.to_string());
        self.answered_at = Some(now);
        Ok(())
    }

    /// Move a pending question to a final state.
    pub fn resolve(&mut self, next: QuestionStatus) -> Result<(), StoreError> {
        if self.status != QuestionStatus::Pending || next == QuestionStatus::Pending {
            return Err(StoreError::InvalidTransition {
                entity: "hitl_question",
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == QuestionStatus::Pending && self.timeout_at.is_some_and(|t| t <= now)
    }
}

// ── Architecture decision records ─────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AdrStatus {
    Draft,
    Proposed,
    Accepted,
    Rejected,
    Deprecated,
    Superseded,
}

impl AdrStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Proposed => "proposed",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Deprecated => "deprecated",
            Self::Superseded => "superseded",
        }
    }

    pub fn can_transition_to(&self, next: AdrStatus) -> bool {
        use AdrStatus::*;
        matches!(
            (self, next),
            (Draft, Proposed)
                | (Draft, Rejected)
                | (Proposed, Accepted)
                | (Proposed, Rejected)
                | (Accepted, Deprecated)
                | (Accepted, Superseded)
        )
    }
}

impl FromStr for AdrStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "proposed" => Ok(Self::Proposed),
            "accepted" => Ok(Self::Accepted),
            "rejected" => Ok(Self::Rejected),
            "deprecated" => Ok(Self::Deprecated),
            "superseded" => Ok(Self::Superseded),
            _ => Err(format!("Invalid ADR status: {}", s)),
        }
    }
}

impl fmt::Display for AdrStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AdrConsequences {
    #[serde(default)]
    pub good: Vec<String>,
    #[serde(default)]
    pub bad: Vec<String>,
    #[serde(default)]
    pub neutral: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Adr {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub project_id: Uuid,
    /// Gap-free per (tenant, project), starting at 1.
    pub sequence: i64,
    pub title: String,
    pub status: AdrStatus,
    pub context: String,
    pub decision: String,
    #[serde(default)]
    pub drivers: Vec<String>,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub consequences: AdrConsequences,
    pub agent_session_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}
