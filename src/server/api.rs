use aira_common::StoreError;
use aira_common::models::{Project, Task};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::error;
use uuid::Uuid;

use super::{SharedState, Tenant};
use crate::errors::{AgentError, HitlError, OrchestratorError};

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    pub repo_url: String,
    pub branch: Option<String>,
}

#[derive(Deserialize)]
pub struct CreateTaskRequest {
    pub project_id: Uuid,
    pub title: String,
    pub description: Option<String>,
}

#[derive(Deserialize)]
pub struct StartTaskRequest {
    pub agent_type: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Deserialize)]
pub struct HitlResponseRequest {
    pub platform: Option<String>,
    pub thread_id: String,
    pub answer: String,
    pub answered_by: String,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => {
                error!("internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };
        (status, Json(json!({"error": message}))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } => ApiError::NotFound(err.to_string()),
            StoreError::InvalidTransition { .. } | StoreError::Conflict { .. } => {
                ApiError::Conflict(err.to_string())
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::NotFound(msg) => ApiError::NotFound(msg),
            OrchestratorError::SessionNotFound(_) => ApiError::NotFound(err.to_string()),
            OrchestratorError::InvalidSessionState(msg) => ApiError::Conflict(msg),
            OrchestratorError::Agent(AgentError::UnknownAgent(_)) => {
                ApiError::BadRequest(err.to_string())
            }
            OrchestratorError::Agent(AgentError::SessionNotFound(_)) => {
                ApiError::NotFound(err.to_string())
            }
            OrchestratorError::Store(store) => store.into(),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<HitlError> for ApiError {
    fn from(err: HitlError) -> Self {
        match err {
            HitlError::NotFound(msg) => ApiError::NotFound(msg),
            HitlError::QuestionAlreadyAnswered { .. } => ApiError::Conflict(err.to_string()),
            HitlError::UnknownPlatform(_) => ApiError::BadRequest(err.to_string()),
            HitlError::Store(store) => store.into(),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/agents", get(list_agents))
        .route("/api/projects", post(create_project))
        .route("/api/tasks", post(create_task))
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/tasks/{id}/start", post(start_task))
        .route("/api/sessions/{id}", get(get_session))
        .route("/api/sessions/{id}/cancel", post(cancel_session))
        .route("/api/hitl/responses", post(hitl_response))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_agents(State(state): State<SharedState>) -> Json<Value> {
    Json(json!({ "agents": state.orchestrator.registry().available() }))
}

async fn create_project(
    State(state): State<SharedState>,
    Tenant(tenant_id): Tenant,
    Json(req): Json<CreateProjectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.name.trim().is_empty() || req.repo_url.trim().is_empty() {
        return Err(ApiError::BadRequest("name and repo_url are required".into()));
    }
    let project = Project::new(tenant_id, req.name.trim(), req.repo_url.trim(), req.branch);
    let project = state.stores.projects.create_project(project).await?;
    Ok((StatusCode::CREATED, Json(project)))
}

async fn create_task(
    State(state): State<SharedState>,
    Tenant(tenant_id): Tenant,
    Json(req): Json<CreateTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.title.trim().is_empty() {
        return Err(ApiError::BadRequest("title is required".into()));
    }
    let task = Task::new(
        tenant_id,
        req.project_id,
        req.title.trim(),
        req.description.as_deref().unwrap_or_default(),
    );
    let task = state.stores.tasks.create_task(task).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

async fn get_task(
    State(state): State<SharedState>,
    Tenant(tenant_id): Tenant,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state.stores.tasks.get_task(tenant_id, id).await?;
    Ok(Json(task))
}

async fn start_task(
    State(state): State<SharedState>,
    Tenant(tenant_id): Tenant,
    Path(id): Path<Uuid>,
    Json(req): Json<StartTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state
        .orchestrator
        .start_task(tenant_id, id, &req.agent_type, req.metadata)
        .await?;
    Ok((StatusCode::CREATED, Json(session)))
}

async fn get_session(
    State(state): State<SharedState>,
    Tenant(tenant_id): Tenant,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state.stores.sessions.get_session(tenant_id, id).await?;
    Ok(Json(session))
}

async fn cancel_session(
    State(state): State<SharedState>,
    Tenant(tenant_id): Tenant,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state.orchestrator.cancel_session(tenant_id, id).await?;
    Ok(Json(session))
}

async fn hitl_response(
    State(state): State<SharedState>,
    Tenant(tenant_id): Tenant,
    Json(req): Json<HitlResponseRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let platform = req
        .platform
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| state.hitl_platform.clone());
    let question = state
        .hitl
        .handle_response(
            tenant_id,
            &platform,
            &req.thread_id,
            &req.answer,
            &req.answered_by,
        )
        .await?;
    Ok(Json(question))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn status_and_error(err: ApiError) -> (StatusCode, String) {
        let response = err.into_response();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        (status, body["error"].as_str().unwrap().to_string())
    }

    #[tokio::test]
    async fn test_orchestrator_errors_map_to_status() {
        let cases = [
            (
                OrchestratorError::NotFound("task t not found".into()),
                StatusCode::NOT_FOUND,
            ),
            (
                OrchestratorError::invalid_state("cancel", Uuid::nil(), "completed"),
                StatusCode::CONFLICT,
            ),
            (
                AgentError::UnknownAgent("gpt".into()).into(),
                StatusCode::BAD_REQUEST,
            ),
            (
                OrchestratorError::Store(StoreError::InvalidTransition {
                    entity: "task",
                    from: "done".into(),
                    to: "review".into(),
                }),
                StatusCode::CONFLICT,
            ),
            (OrchestratorError::ShuttingDown, StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            let (status, _) = status_and_error(err.into()).await;
            assert_eq!(status, expected);
        }
    }

    #[tokio::test]
    async fn test_hitl_errors_map_to_status() {
        let (status, message) = status_and_error(
            HitlError::QuestionAlreadyAnswered {
                id: Uuid::nil(),
                status: "answered".into(),
            }
            .into(),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(message.contains("already answered"));

        let (status, _) =
            status_and_error(HitlError::NotFound("hitl_question x not found".into()).into()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
