use std::path::Path;
use std::sync::Arc;

use aira_common::StoreError;
use aira_common::models::{
    Adr, AdrConsequences, AdrStatus, AgentSession, HitlQuestion, Project, QuestionStatus,
    SessionStatus, Task, TaskStatus,
};
use aira_common::store::{AdrStore, ProjectStore, QuestionStore, SessionStore, TaskStore};
use anyhow::{Context, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};
use uuid::Uuid;

/// SQLite-backed store.
///
/// Wraps one connection behind `Arc<Mutex>` and runs every statement on
/// tokio's blocking pool via `spawn_blocking`, so synchronous SQLite I/O
/// never ties up async worker threads. The mutex also serializes the
/// read-validate-write sequences used for status transitions.
#[derive(Clone)]
pub struct SqliteStore {
    inner: Arc<std::sync::Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a database at `path` and run migrations.
    pub fn new(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        Self::init(conn)
    }

    /// In-memory database (for tests and ephemeral runs).
    pub fn new_in_memory() -> anyhow::Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> anyhow::Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        run_migrations(&conn).context("Failed to run migrations")?;
        Ok(Self {
            inner: Arc::new(std::sync::Mutex::new(conn)),
        })
    }

    /// Run a closure with the connection on a blocking thread.
    async fn call<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|e| anyhow!("DB lock poisoned: {}", e))?;
            f(&mut guard)
        })
        .await
        .context("DB task panicked")?
    }
}

fn run_migrations(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS projects (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            name TEXT NOT NULL,
            repo_url TEXT NOT NULL,
            branch TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
            title TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT 'backlog',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS agent_sessions (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            project_id TEXT NOT NULL,
            task_id TEXT,
            agent_type TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            container_id TEXT,
            branch_name TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT,
            error TEXT,
            metadata TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS hitl_questions (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            agent_session_id TEXT NOT NULL,
            question TEXT NOT NULL,
            options TEXT NOT NULL DEFAULT '[]',
            messenger_platform TEXT NOT NULL,
            messenger_thread_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            timeout_at TEXT,
            answer TEXT,
            answered_by TEXT,
            answered_at TEXT,
            created_at TEXT NOT NULL,
            UNIQUE(tenant_id, messenger_platform, messenger_thread_id)
        );

        CREATE TABLE IF NOT EXISTS adrs (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            project_id TEXT NOT NULL,
            sequence INTEGER NOT NULL,
            title TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'draft',
            context TEXT NOT NULL DEFAULT '',
            decision TEXT NOT NULL DEFAULT '',
            drivers TEXT NOT NULL DEFAULT '[]',
            options TEXT NOT NULL DEFAULT '[]',
            consequences TEXT NOT NULL DEFAULT '{}',
            agent_session_id TEXT,
            created_at TEXT NOT NULL,
            UNIQUE(tenant_id, project_id, sequence)
        );

        CREATE TABLE IF NOT EXISTS adr_sequences (
            tenant_id TEXT NOT NULL,
            project_id TEXT NOT NULL,
            last INTEGER NOT NULL,
            PRIMARY KEY (tenant_id, project_id)
        );

        CREATE INDEX IF NOT EXISTS idx_tasks_project ON tasks(tenant_id, project_id);
        CREATE INDEX IF NOT EXISTS idx_sessions_status ON agent_sessions(status);
        CREATE INDEX IF NOT EXISTS idx_questions_expiry ON hitl_questions(status, timeout_at);
        CREATE INDEX IF NOT EXISTS idx_questions_session ON hitl_questions(tenant_id, agent_session_id);
        CREATE INDEX IF NOT EXISTS idx_adrs_project ON adrs(tenant_id, project_id);
        ",
    )
}

// ── Column encoding ───────────────────────────────────────────────────

/// Fixed-width UTC timestamps so that text comparison orders correctly.
fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn opt_ts(t: &Option<DateTime<Utc>>) -> Option<String> {
    t.as_ref().map(ts)
}

fn parse_ts(s: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid timestamp: {}", s))?
        .with_timezone(&Utc))
}

fn parse_opt_ts(s: Option<String>) -> anyhow::Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

fn parse_uuid(s: &str) -> anyhow::Result<Uuid> {
    Uuid::parse_str(s).with_context(|| format!("Invalid uuid: {}", s))
}

fn parse_enum<T: std::str::FromStr<Err = String>>(s: &str) -> anyhow::Result<T> {
    s.parse().map_err(|e: String| anyhow!(e))
}

fn to_json<T: serde::Serialize>(value: &T) -> anyhow::Result<String> {
    serde_json::to_string(value).context("Failed to encode JSON column")
}

fn from_json<T: serde::de::DeserializeOwned>(s: &str) -> anyhow::Result<T> {
    serde_json::from_str(s).context("Failed to decode JSON column")
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation)
}

// ── Row types ─────────────────────────────────────────────────────────

const PROJECT_COLUMNS: &str = "id, tenant_id, name, repo_url, branch, created_at";

struct ProjectRow {
    id: String,
    tenant_id: String,
    name: String,
    repo_url: String,
    branch: Option<String>,
    created_at: String,
}

impl ProjectRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            tenant_id: row.get(1)?,
            name: row.get(2)?,
            repo_url: row.get(3)?,
            branch: row.get(4)?,
            created_at: row.get(5)?,
        })
    }

    fn into_project(self) -> anyhow::Result<Project> {
        Ok(Project {
            id: parse_uuid(&self.id)?,
            tenant_id: parse_uuid(&self.tenant_id)?,
            name: self.name,
            repo_url: self.repo_url,
            branch: self.branch,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

const TASK_COLUMNS: &str =
    "id, tenant_id, project_id, title, description, status, created_at, updated_at";

struct TaskRow {
    id: String,
    tenant_id: String,
    project_id: String,
    title: String,
    description: String,
    status: String,
    created_at: String,
    updated_at: String,
}

impl TaskRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            tenant_id: row.get(1)?,
            project_id: row.get(2)?,
            title: row.get(3)?,
            description: row.get(4)?,
            status: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn into_task(self) -> anyhow::Result<Task> {
        Ok(Task {
            id: parse_uuid(&self.id)?,
            tenant_id: parse_uuid(&self.tenant_id)?,
            project_id: parse_uuid(&self.project_id)?,
            title: self.title,
            description: self.description,
            status: parse_enum(&self.status)?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

const SESSION_COLUMNS: &str = "id, tenant_id, project_id, task_id, agent_type, status, container_id, branch_name, started_at, completed_at, error, metadata, created_at";

struct SessionRow {
    id: String,
    tenant_id: String,
    project_id: String,
    task_id: Option<String>,
    agent_type: String,
    status: String,
    container_id: Option<String>,
    branch_name: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    error: Option<String>,
    metadata: String,
    created_at: String,
}

impl SessionRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            tenant_id: row.get(1)?,
            project_id: row.get(2)?,
            task_id: row.get(3)?,
            agent_type: row.get(4)?,
            status: row.get(5)?,
            container_id: row.get(6)?,
            branch_name: row.get(7)?,
            started_at: row.get(8)?,
            completed_at: row.get(9)?,
            error: row.get(10)?,
            metadata: row.get(11)?,
            created_at: row.get(12)?,
        })
    }

    fn into_session(self) -> anyhow::Result<AgentSession> {
        Ok(AgentSession {
            id: parse_uuid(&self.id)?,
            tenant_id: parse_uuid(&self.tenant_id)?,
            project_id: parse_uuid(&self.project_id)?,
            task_id: self.task_id.as_deref().map(parse_uuid).transpose()?,
            agent_type: self.agent_type,
            status: parse_enum(&self.status)?,
            container_id: self.container_id,
            branch_name: self.branch_name,
            started_at: parse_opt_ts(self.started_at)?,
            completed_at: parse_opt_ts(self.completed_at)?,
            error: self.error,
            metadata: from_json(&self.metadata)?,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

const QUESTION_COLUMNS: &str = "id, tenant_id, agent_session_id, question, options, messenger_platform, messenger_thread_id, status, timeout_at, answer, answered_by, answered_at, created_at";

struct QuestionRow {
    id: String,
    tenant_id: String,
    agent_session_id: String,
    question: String,
    options: String,
    messenger_platform: String,
    messenger_thread_id: String,
    status: String,
    timeout_at: Option<String>,
    answer: Option<String>,
    answered_by: Option<String>,
    answered_at: Option<String>,
    created_at: String,
}

impl QuestionRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            tenant_id: row.get(1)?,
            agent_session_id: row.get(2)?,
            question: row.get(3)?,
            options: row.get(4)?,
            messenger_platform: row.get(5)?,
            messenger_thread_id: row.get(6)?,
            status: row.get(7)?,
            timeout_at: row.get(8)?,
            answer: row.get(9)?,
            answered_by: row.get(10)?,
            answered_at: row.get(11)?,
            created_at: row.get(12)?,
        })
    }

    fn into_question(self) -> anyhow::Result<HitlQuestion> {
        Ok(HitlQuestion {
            id: parse_uuid(&self.id)?,
            tenant_id: parse_uuid(&self.tenant_id)?,
            agent_session_id: parse_uuid(&self.agent_session_id)?,
            question: self.question,
            options: from_json(&self.options)?,
            messenger_platform: self.messenger_platform,
            messenger_thread_id: self.messenger_thread_id,
            status: parse_enum(&self.status)?,
            timeout_at: parse_opt_ts(self.timeout_at)?,
            answer: self.answer,
            answered_by: self.answered_by,
            answered_at: parse_opt_ts(self.answered_at)?,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

const ADR_COLUMNS: &str = "id, tenant_id, project_id, sequence, title, status, context, decision, drivers, options, consequences, agent_session_id, created_at";

struct AdrRow {
    id: String,
    tenant_id: String,
    project_id: String,
    sequence: i64,
    title: String,
    status: String,
    context: String,
    decision: String,
    drivers: String,
    options: String,
    consequences: String,
    agent_session_id: Option<String>,
    created_at: String,
}

impl AdrRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            tenant_id: row.get(1)?,
            project_id: row.get(2)?,
            sequence: row.get(3)?,
            title: row.get(4)?,
            status: row.get(5)?,
            context: row.get(6)?,
            decision: row.get(7)?,
            drivers: row.get(8)?,
            options: row.get(9)?,
            consequences: row.get(10)?,
            agent_session_id: row.get(11)?,
            created_at: row.get(12)?,
        })
    }

    fn into_adr(self) -> anyhow::Result<Adr> {
        let consequences: AdrConsequences = from_json(&self.consequences)?;
        Ok(Adr {
            id: parse_uuid(&self.id)?,
            tenant_id: parse_uuid(&self.tenant_id)?,
            project_id: parse_uuid(&self.project_id)?,
            sequence: self.sequence,
            title: self.title,
            status: parse_enum(&self.status)?,
            context: self.context,
            decision: self.decision,
            drivers: from_json(&self.drivers)?,
            options: from_json(&self.options)?,
            consequences,
            agent_session_id: self.agent_session_id.as_deref().map(parse_uuid).transpose()?,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

// ── Tenant-scoped loaders ─────────────────────────────────────────────

fn load_project(conn: &Connection, tenant_id: Uuid, id: Uuid) -> Result<Project, StoreError> {
    let row = conn
        .query_row(
            &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1 AND tenant_id = ?2"),
            params![id.to_string(), tenant_id.to_string()],
            ProjectRow::read,
        )
        .optional()
        .context("Failed to query project")?
        .ok_or_else(|| StoreError::not_found("project", id))?;
    Ok(row.into_project()?)
}

fn load_task(conn: &Connection, tenant_id: Uuid, id: Uuid) -> Result<Task, StoreError> {
    let row = conn
        .query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1 AND tenant_id = ?2"),
            params![id.to_string(), tenant_id.to_string()],
            TaskRow::read,
        )
        .optional()
        .context("Failed to query task")?
        .ok_or_else(|| StoreError::not_found("task", id))?;
    Ok(row.into_task()?)
}

fn load_session(conn: &Connection, tenant_id: Uuid, id: Uuid) -> Result<AgentSession, StoreError> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {SESSION_COLUMNS} FROM agent_sessions WHERE id = ?1 AND tenant_id = ?2"
            ),
            params![id.to_string(), tenant_id.to_string()],
            SessionRow::read,
        )
        .optional()
        .context("Failed to query agent session")?
        .ok_or_else(|| StoreError::not_found("agent_session", id))?;
    Ok(row.into_session()?)
}

fn load_question(
    conn: &Connection,
    tenant_id: Uuid,
    id: Uuid,
) -> Result<HitlQuestion, StoreError> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {QUESTION_COLUMNS} FROM hitl_questions WHERE id = ?1 AND tenant_id = ?2"
            ),
            params![id.to_string(), tenant_id.to_string()],
            QuestionRow::read,
        )
        .optional()
        .context("Failed to query HITL question")?
        .ok_or_else(|| StoreError::not_found("hitl_question", id))?;
    Ok(row.into_question()?)
}

fn load_adr(conn: &Connection, tenant_id: Uuid, id: Uuid) -> Result<Adr, StoreError> {
    let row = conn
        .query_row(
            &format!("SELECT {ADR_COLUMNS} FROM adrs WHERE id = ?1 AND tenant_id = ?2"),
            params![id.to_string(), tenant_id.to_string()],
            AdrRow::read,
        )
        .optional()
        .context("Failed to query ADR")?
        .ok_or_else(|| StoreError::not_found("adr", id))?;
    Ok(row.into_adr()?)
}

fn write_session_state(conn: &Connection, session: &AgentSession) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE agent_sessions
         SET status = ?1, started_at = ?2, completed_at = ?3, error = ?4
         WHERE id = ?5",
        params![
            session.status.as_str(),
            opt_ts(&session.started_at),
            opt_ts(&session.completed_at),
            session.error,
            session.id.to_string(),
        ],
    )
    .context("Failed to update agent session")?;
    Ok(())
}

fn write_question_state(conn: &Connection, question: &HitlQuestion) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE hitl_questions
         SET status = ?1, answer = ?2, answered_by = ?3, answered_at = ?4
         WHERE id = ?5",
        params![
            question.status.as_str(),
            question.answer,
            question.answered_by,
            opt_ts(&question.answered_at),
            question.id.to_string(),
        ],
    )
    .context("Failed to update HITL question")?;
    Ok(())
}

// ── Capabilities ──────────────────────────────────────────────────────

#[async_trait]
impl ProjectStore for SqliteStore {
    async fn create_project(&self, project: Project) -> Result<Project, StoreError> {
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO projects (id, tenant_id, name, repo_url, branch, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    project.id.to_string(),
                    project.tenant_id.to_string(),
                    project.name,
                    project.repo_url,
                    project.branch,
                    ts(&project.created_at),
                ],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::Conflict {
                        entity: "project",
                        key: project.id.to_string(),
                    }
                } else {
                    anyhow::Error::new(e).context("Failed to insert project").into()
                }
            })?;
            Ok(project)
        })
        .await
    }

    async fn get_project(&self, tenant_id: Uuid, id: Uuid) -> Result<Project, StoreError> {
        self.call(move |conn| load_project(conn, tenant_id, id)).await
    }
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn create_task(&self, task: Task) -> Result<Task, StoreError> {
        self.call(move |conn| {
            load_project(conn, task.tenant_id, task.project_id)?;
            conn.execute(
                "INSERT INTO tasks (id, tenant_id, project_id, title, description, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    task.id.to_string(),
                    task.tenant_id.to_string(),
                    task.project_id.to_string(),
                    task.title,
                    task.description,
                    task.status.as_str(),
                    ts(&task.created_at),
                    ts(&task.updated_at),
                ],
            )
            .context("Failed to insert task")?;
            Ok(task)
        })
        .await
    }

    async fn get_task(&self, tenant_id: Uuid, id: Uuid) -> Result<Task, StoreError> {
        self.call(move |conn| load_task(conn, tenant_id, id)).await
    }

    async fn update_task_status(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        status: TaskStatus,
    ) -> Result<Task, StoreError> {
        self.call(move |conn| {
            let tx = conn.transaction().context("Failed to begin transaction")?;
            let mut task = load_task(&tx, tenant_id, id)?;
            task.transition(status)?;
            tx.execute(
                "UPDATE tasks SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![task.status.as_str(), ts(&task.updated_at), id.to_string()],
            )
            .context("Failed to update task status")?;
            tx.commit().context("Failed to commit task status")?;
            Ok(task)
        })
        .await
    }
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn create_session(&self, session: AgentSession) -> Result<AgentSession, StoreError> {
        self.call(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO agent_sessions ({SESSION_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
                ),
                params![
                    session.id.to_string(),
                    session.tenant_id.to_string(),
                    session.project_id.to_string(),
                    session.task_id.map(|t| t.to_string()),
                    session.agent_type,
                    session.status.as_str(),
                    session.container_id,
                    session.branch_name,
                    opt_ts(&session.started_at),
                    opt_ts(&session.completed_at),
                    session.error,
                    to_json(&session.metadata)?,
                    ts(&session.created_at),
                ],
            )
            .context("Failed to insert agent session")?;
            Ok(session)
        })
        .await
    }

    async fn get_session(&self, tenant_id: Uuid, id: Uuid) -> Result<AgentSession, StoreError> {
        self.call(move |conn| load_session(conn, tenant_id, id)).await
    }

    async fn update_session_status(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        status: SessionStatus,
        error: Option<String>,
    ) -> Result<AgentSession, StoreError> {
        self.call(move |conn| {
            let tx = conn.transaction().context("Failed to begin transaction")?;
            let mut session = load_session(&tx, tenant_id, id)?;
            session.transition(status, error, Utc::now())?;
            write_session_state(&tx, &session)?;
            tx.commit().context("Failed to commit session status")?;
            Ok(session)
        })
        .await
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
        let container_id = container_id.to_string();
        self.call(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE agent_sessions SET container_id = ?1 WHERE id = ?2 AND tenant_id = ?3",
                    params![container_id, id.to_string(), tenant_id.to_string()],
                )
                .context("Failed to set container id")?;
            if changed == 0 {
                return Err(StoreError::not_found("agent_session", id));
            }
            Ok(())
        })
        .await
    }

    async fn list_active_sessions(&self) -> Result<Vec<AgentSession>, StoreError> {
        self.call(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {SESSION_COLUMNS} FROM agent_sessions
                     WHERE status NOT IN ('completed', 'failed', 'cancelled')
                     ORDER BY created_at"
                ))
                .context("Failed to prepare list_active_sessions")?;
            let rows = stmt
                .query_map([], SessionRow::read)
                .context("Failed to query active sessions")?;
            let mut sessions = Vec::new();
            for row in rows {
                sessions.push(row.context("Failed to read session row")?.into_session()?);
            }
            Ok(sessions)
        })
        .await
    }
}

#[async_trait]
impl AdrStore for SqliteStore {
    async fn create_adr(&self, adr: Adr) -> Result<Adr, StoreError> {
        self.call(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO adrs ({ADR_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
                ),
                params![
                    adr.id.to_string(),
                    adr.tenant_id.to_string(),
                    adr.project_id.to_string(),
                    adr.sequence,
                    adr.title,
                    adr.status.as_str(),
                    adr.context,
                    adr.decision,
                    to_json(&adr.drivers)?,
                    to_json(&adr.options)?,
                    to_json(&adr.consequences)?,
                    adr.agent_session_id.map(|s| s.to_string()),
                    ts(&adr.created_at),
                ],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::Conflict {
                        entity: "adr",
                        key: format!("{}#{}", adr.project_id, adr.sequence),
                    }
                } else {
                    anyhow::Error::new(e).context("Failed to insert ADR").into()
                }
            })?;
            Ok(adr)
        })
        .await
    }

    async fn get_adr(&self, tenant_id: Uuid, id: Uuid) -> Result<Adr, StoreError> {
        self.call(move |conn| load_adr(conn, tenant_id, id)).await
    }

    async fn list_adrs_by_project(
        &self,
        tenant_id: Uuid,
        project_id: Uuid,
    ) -> Result<Vec<Adr>, StoreError> {
        self.call(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {ADR_COLUMNS} FROM adrs
                     WHERE tenant_id = ?1 AND project_id = ?2
                     ORDER BY sequence"
                ))
                .context("Failed to prepare list_adrs_by_project")?;
            let rows = stmt
                .query_map(
                    params![tenant_id.to_string(), project_id.to_string()],
                    AdrRow::read,
                )
                .context("Failed to query ADRs")?;
            let mut adrs = Vec::new();
            for row in rows {
                adrs.push(row.context("Failed to read ADR row")?.into_adr()?);
            }
            Ok(adrs)
        })
        .await
    }

    async fn next_adr_sequence(
        &self,
        tenant_id: Uuid,
        project_id: Uuid,
    ) -> Result<i64, StoreError> {
        self.call(move |conn| {
            let next: i64 = conn
                .query_row(
                    "INSERT INTO adr_sequences (tenant_id, project_id, last) VALUES (?1, ?2, 1)
                     ON CONFLICT(tenant_id, project_id) DO UPDATE SET last = last + 1
                     RETURNING last",
                    params![tenant_id.to_string(), project_id.to_string()],
                    |row| row.get(0),
                )
                .context("Failed to allocate ADR sequence")?;
            Ok(next)
        })
        .await
    }

    async fn update_adr_status(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        status: AdrStatus,
    ) -> Result<Adr, StoreError> {
        self.call(move |conn| {
            let tx = conn.transaction().context("Failed to begin transaction")?;
            let mut adr = load_adr(&tx, tenant_id, id)?;
            if !adr.status.can_transition_to(status) {
                return Err(StoreError::InvalidTransition {
                    entity: "adr",
                    from: adr.status.to_string(),
                    to: status.to_string(),
                });
            }
            adr.status = status;
            tx.execute(
                "UPDATE adrs SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id.to_string()],
            )
            .context("Failed to update ADR status")?;
            tx.commit().context("Failed to commit ADR status")?;
            Ok(adr)
        })
        .await
    }
}

#[async_trait]
impl QuestionStore for SqliteStore {
    async fn create_question(&self, question: HitlQuestion) -> Result<HitlQuestion, StoreError> {
        self.call(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO hitl_questions ({QUESTION_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
                ),
                params![
                    question.id.to_string(),
                    question.tenant_id.to_string(),
                    question.agent_session_id.to_string(),
                    question.question,
                    to_json(&question.options)?,
                    question.messenger_platform,
                    question.messenger_thread_id,
                    question.status.as_str(),
                    opt_ts(&question.timeout_at),
                    question.answer,
                    question.answered_by,
                    opt_ts(&question.answered_at),
                    ts(&question.created_at),
                ],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::Conflict {
                        entity: "hitl_question",
                        key: format!(
                            "{}/{}",
                            question.messenger_platform, question.messenger_thread_id
                        ),
                    }
                } else {
                    anyhow::Error::new(e)
                        .context("Failed to insert HITL question")
                        .into()
                }
            })?;
            Ok(question)
        })
        .await
    }

    async fn get_question(&self, tenant_id: Uuid, id: Uuid) -> Result<HitlQuestion, StoreError> {
        self.call(move |conn| load_question(conn, tenant_id, id))
            .await
    }

    async fn get_question_by_thread(
        &self,
        tenant_id: Uuid,
        platform: &str,
        thread_id: &str,
    ) -> Result<HitlQuestion, StoreError> {
        let platform = platform.to_string();
        let thread_id = thread_id.to_string();
        self.call(move |conn| {
            let row = conn
                .query_row(
                    &format!(
                        "SELECT {QUESTION_COLUMNS} FROM hitl_questions
                         WHERE tenant_id = ?1 AND messenger_platform = ?2 AND messenger_thread_id = ?3"
                    ),
                    params![tenant_id.to_string(), platform, thread_id],
                    QuestionRow::read,
                )
                .optional()
                .context("Failed to query HITL question by thread")?
                .ok_or_else(|| {
                    StoreError::not_found("hitl_question", format!("{platform}/{thread_id}"))
                })?;
            Ok(row.into_question()?)
        })
        .await
    }

    async fn answer_question(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        answer: &str,
        answered_by: &str,
    ) -> Result<HitlQuestion, StoreError> {
        let answer = answer.to_string();
        let answered_by = answered_by.to_string();
        self.call(move |conn| {
            let tx = conn.transaction().context("Failed to begin transaction")?;
            let mut question = load_question(&tx, tenant_id, id)?;
            question.answer(&answer, &answered_by, Utc::now())?;
            write_question_state(&tx, &question)?;
            tx.commit().context("Failed to commit answer")?;
            Ok(question)
        })
        .await
    }

    async fn update_question_status(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        status: QuestionStatus,
    ) -> Result<HitlQuestion, StoreError> {
        self.call(move |conn| {
            let tx = conn.transaction().context("Failed to begin transaction")?;
            let mut question = load_question(&tx, tenant_id, id)?;
            question.resolve(status)?;
            write_question_state(&tx, &question)?;
            tx.commit().context("Failed to commit question status")?;
            Ok(question)
        })
        .await
    }

    async fn list_expired_questions(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<HitlQuestion>, StoreError> {
        self.call(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {QUESTION_COLUMNS} FROM hitl_questions
                     WHERE status = 'pending' AND timeout_at IS NOT NULL AND timeout_at <= ?1
                     ORDER BY timeout_at
                     LIMIT ?2"
                ))
                .context("Failed to prepare list_expired_questions")?;
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            let rows = stmt
                .query_map(params![ts(&now), limit], QuestionRow::read)
                .context("Failed to query expired questions")?;
            let mut questions = Vec::new();
            for row in rows {
                questions.push(row.context("Failed to read question row")?.into_question()?);
            }
            Ok(questions)
        })
        .await
    }

    async fn cancel_pending_questions(
        &self,
        tenant_id: Uuid,
        session_id: Uuid,
    ) -> Result<usize, StoreError> {
        self.call(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE hitl_questions SET status = 'cancelled'
                     WHERE tenant_id = ?1 AND agent_session_id = ?2 AND status = 'pending'",
                    params![tenant_id.to_string(), session_id.to_string()],
                )
                .context("Failed to cancel pending questions")?;
            Ok(changed)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, json};

    fn store() -> SqliteStore {
        SqliteStore::new_in_memory().unwrap()
    }

    async fn seeded() -> (SqliteStore, Uuid, Project, Task) {
        let store = store();
        let tenant = Uuid::new_v4();
        let project = store
            .create_project(Project::new(
                tenant,
                "api",
                "https://example.com/api.git",
                Some("develop".into()),
            ))
            .await
            .unwrap();
        let task = store
            .create_task(Task::new(tenant, project.id, "Add auth", "JWT please"))
            .await
            .unwrap();
        (store, tenant, project, task)
    }

    fn question(tenant: Uuid, session: Uuid, thread: &str) -> HitlQuestion {
        HitlQuestion {
            id: Uuid::new_v4(),
            tenant_id: tenant,
            agent_session_id: session,
            question: "Which DB?".into(),
            options: vec!["pg".into(), "mysql".into()],
            messenger_platform: "slack".into(),
            messenger_thread_id: thread.into(),
            status: QuestionStatus::Pending,
            timeout_at: None,
            answer: None,
            answered_by: None,
            answered_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 6);
    }

    #[test]
    fn test_timestamps_sort_as_text() {
        let early = DateTime::parse_from_rfc3339("2026-01-01T09:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let late = early + chrono::Duration::milliseconds(1500);
        assert!(ts(&early) < ts(&late));
        assert_eq!(parse_ts(&ts(&late)).unwrap(), late);
    }

    #[tokio::test]
    async fn test_project_and_task_roundtrip() {
        let (store, tenant, project, task) = seeded().await;
        let loaded = store.get_project(tenant, project.id).await.unwrap();
        assert_eq!(loaded.base_branch(), "develop");

        let loaded = store.get_task(tenant, task.id).await.unwrap();
        assert_eq!(loaded.title, "Add auth");
        assert_eq!(loaded.status, TaskStatus::Backlog);
        assert!(store
            .get_task(Uuid::new_v4(), task.id)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_task_status_edges() {
        let (store, tenant, _project, task) = seeded().await;
        let err = store
            .update_task_status(tenant, task.id, TaskStatus::Review)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        store
            .update_task_status(tenant, task.id, TaskStatus::InProgress)
            .await
            .unwrap();
        let task = store
            .update_task_status(tenant, task.id, TaskStatus::Review)
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Review);
        assert_eq!(
            store.get_task(tenant, task.id).await.unwrap().status,
            TaskStatus::Review
        );
    }

    #[tokio::test]
    async fn test_session_lifecycle_persists() {
        let (store, tenant, project, task) = seeded().await;
        let mut metadata = Map::new();
        metadata.insert("hitl_channel".into(), json!("C42"));
        let session = store
            .create_session(AgentSession::new(tenant, project.id, Some(task.id), "codex", metadata))
            .await
            .unwrap();

        store.set_container_id(tenant, session.id, "abc123").await.unwrap();
        store
            .update_session_status(tenant, session.id, SessionStatus::Running, None)
            .await
            .unwrap();
        assert_eq!(store.list_active_sessions().await.unwrap().len(), 1);

        let done = store
            .set_session_completed(
                tenant,
                session.id,
                SessionStatus::Failed,
                Some("agent exited with code 2".into()),
            )
            .await
            .unwrap();
        assert!(done.completed_at.is_some());

        let loaded = store.get_session(tenant, session.id).await.unwrap();
        assert_eq!(loaded.status, SessionStatus::Failed);
        assert_eq!(loaded.container_id.as_deref(), Some("abc123"));
        assert_eq!(loaded.error.as_deref(), Some("agent exited with code 2"));
        assert_eq!(loaded.metadata_str("hitl_channel"), Some("C42"));
        assert!(loaded.started_at.is_some());
        assert!(store.list_active_sessions().await.unwrap().is_empty());

        let err = store
            .update_session_status(tenant, session.id, SessionStatus::Running, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_set_container_id_on_foreign_session() {
        let (store, tenant, project, _task) = seeded().await;
        let session = store
            .create_session(AgentSession::new(tenant, project.id, None, "claude", Map::new()))
            .await
            .unwrap();
        assert!(store
            .set_container_id(Uuid::new_v4(), session.id, "c")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_question_thread_unique_per_tenant() {
        let (store, tenant, _project, _task) = seeded().await;
        let session = Uuid::new_v4();
        store.create_question(question(tenant, session, "C1:1.0")).await.unwrap();
        let err = store
            .create_question(question(tenant, session, "C1:1.0"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
        store
            .create_question(question(Uuid::new_v4(), session, "C1:1.0"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_answer_and_lookup_by_thread() {
        let (store, tenant, _project, _task) = seeded().await;
        let q = store
            .create_question(question(tenant, Uuid::new_v4(), "C1:3.0"))
            .await
            .unwrap();
        store.answer_question(tenant, q.id, "pg", "U7").await.unwrap();

        let loaded = store
            .get_question_by_thread(tenant, "slack", "C1:3.0")
            .await
            .unwrap();
        assert_eq!(loaded.status, QuestionStatus::Answered);
        assert_eq!(loaded.answer.as_deref(), Some("pg"));
        assert_eq!(loaded.answered_by.as_deref(), Some("U7"));
        assert_eq!(loaded.options, vec!["pg", "mysql"]);

        let err = store.answer_question(tenant, q.id, "mysql", "U8").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_expired_questions_and_session_cancel() {
        let (store, tenant, _project, _task) = seeded().await;
        let now = Utc::now();
        let session = Uuid::new_v4();

        let mut late = question(tenant, session, "late");
        late.timeout_at = Some(now - chrono::Duration::seconds(5));
        let mut later = question(tenant, session, "later");
        later.timeout_at = Some(now - chrono::Duration::seconds(50));
        let mut future = question(tenant, session, "future");
        future.timeout_at = Some(now + chrono::Duration::seconds(50));
        for q in [late, later, future] {
            store.create_question(q).await.unwrap();
        }

        let expired = store.list_expired_questions(now, 10).await.unwrap();
        let threads: Vec<_> = expired.iter().map(|q| q.messenger_thread_id.as_str()).collect();
        assert_eq!(threads, vec!["later", "late"]);
        assert_eq!(store.list_expired_questions(now, 1).await.unwrap().len(), 1);

        assert_eq!(store.cancel_pending_questions(tenant, session).await.unwrap(), 3);
        assert!(store.list_expired_questions(now, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_adr_sequence_and_listing() {
        let (store, tenant, project, _task) = seeded().await;
        for expected in 1..=3 {
            let seq = store.next_adr_sequence(tenant, project.id).await.unwrap();
            assert_eq!(seq, expected);
            store
                .create_adr(Adr {
                    id: Uuid::new_v4(),
                    tenant_id: tenant,
                    project_id: project.id,
                    sequence: seq,
                    title: format!("Use option {seq}"),
                    status: AdrStatus::Draft,
                    context: "ctx".into(),
                    decision: format!("Use option {seq}"),
                    drivers: vec![],
                    options: vec![format!("option {seq}")],
                    consequences: AdrConsequences {
                        neutral: vec!["review".into()],
                        ..Default::default()
                    },
                    agent_session_id: Some(Uuid::new_v4()),
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        let adrs = store.list_adrs_by_project(tenant, project.id).await.unwrap();
        assert_eq!(adrs.len(), 3);
        assert_eq!(adrs[2].title, "Use option 3");
        assert_eq!(adrs[0].consequences.neutral, vec!["review"]);
        assert!(store
            .list_adrs_by_project(Uuid::new_v4(), project.id)
            .await
            .unwrap()
            .is_empty());

        let proposed = store
            .update_adr_status(tenant, adrs[0].id, AdrStatus::Proposed)
            .await
            .unwrap();
        assert_eq!(proposed.status, AdrStatus::Proposed);
        assert!(store
            .update_adr_status(tenant, adrs[0].id, AdrStatus::Draft)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_concurrent_sequence_allocation() {
        let store = store();
        let tenant = Uuid::new_v4();
        let project = Uuid::new_v4();
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.next_adr_sequence(tenant, project).await.unwrap()
            }));
        }
        let mut seen = Vec::new();
        for handle in handles {
            seen.push(handle.await.unwrap());
        }
        seen.sort();
        assert_eq!(seen, (1..=16).collect::<Vec<i64>>());
    }
}
