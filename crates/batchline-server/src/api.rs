//! HTTP handlers.
//!
//! Handlers only read the store and enqueue work; all task mutation happens
//! in the scheduler. Bodies are parsed through [`ValidatedJson`] so every
//! malformed payload maps to 400 with a validation message, and submission
//! payloads reject unknown keys to keep the contract closed.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json,
    extract::{Form, FromRequest, Path, Query, Request, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::json;
use tracing::info;

use crate::auth::AuthPrincipal;
use crate::error::ApiError;
use crate::openai::{
    ChatCompletionRequest, ChatCompletionResponse, CompletionRequest, CompletionResponse,
    ModelList,
};
use crate::queue::QueuedTask;
use crate::task::{GenerationParams, Priority, Task, TaskRecord, TaskStatus};
use crate::Service;

/// Hard cap on items per `POST /inference/batch` call.
const MAX_SUBMIT_BATCH: usize = 100;

/// Rough per-queued-task wait estimate, in seconds, reported back to
/// submitters.
const ESTIMATED_SECONDS_PER_TASK: u64 = 2;

/// JSON extractor that turns every deserialization failure into a 400
/// validation error (axum's stock extractor splits them across 400/415/422).
pub struct ValidatedJson<T>(pub T);

impl<S, T> FromRequest<S> for ValidatedJson<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = axum::body::Bytes::from_request(req, state)
            .await
            .map_err(|_| ApiError::Validation("unreadable request body".to_string()))?;
        serde_json::from_slice(&bytes)
            .map(ValidatedJson)
            .map_err(|e| ApiError::Validation(format!("invalid request body: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct TokenForm {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: &'static str,
}

pub async fn issue_token(
    State(service): State<Arc<Service>>,
    Form(form): Form<TokenForm>,
) -> Result<Json<TokenResponse>, ApiError> {
    let token = service.authenticator.issue(&form.username, &form.password)?;
    Ok(Json(TokenResponse { access_token: token, token_type: "bearer" }))
}

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

/// Async submission body. The parameter set is closed: unknown keys are a
/// validation error, not an extension point.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubmitRequest {
    pub prompt: String,
    #[serde(default)]
    pub priority: Priority,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub model: Option<String>,
}

impl SubmitRequest {
    fn validated_params(&self, max_prompt_chars: usize) -> Result<GenerationParams, ApiError> {
        if self.prompt.trim().is_empty() {
            return Err(ApiError::Validation("prompt must not be empty".to_string()));
        }
        if self.prompt.chars().count() > max_prompt_chars {
            return Err(ApiError::Validation(format!(
                "prompt exceeds {max_prompt_chars} characters"
            )));
        }
        let mut params = GenerationParams::default();
        if let Some(max_tokens) = self.max_tokens {
            if !(1..=4096).contains(&max_tokens) {
                return Err(ApiError::Validation(
                    "max_tokens must be between 1 and 4096".to_string(),
                ));
            }
            params.max_tokens = max_tokens;
        }
        if let Some(temperature) = self.temperature {
            if !temperature.is_finite() || !(0.0..=2.0).contains(&temperature) {
                return Err(ApiError::Validation(
                    "temperature must be between 0.0 and 2.0".to_string(),
                ));
            }
            params.temperature = temperature;
        }
        if let Some(model) = &self.model {
            if model.is_empty() {
                return Err(ApiError::Validation("model must not be empty".to_string()));
            }
            params.model = model.clone();
        }
        Ok(params)
    }
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub task_id: String,
    pub status: TaskStatus,
    pub queue_position: usize,
    pub estimated_wait_time: u64,
}

pub async fn submit_async(
    State(service): State<Arc<Service>>,
    AuthPrincipal(principal): AuthPrincipal,
    ValidatedJson(request): ValidatedJson<SubmitRequest>,
) -> Result<Json<SubmitResponse>, ApiError> {
    let params = request.validated_params(service.settings.capacity.max_prompt_chars)?;
    let task = Task::new(&principal, request.priority, request.prompt, params);
    let response = enqueue_task(&service, task).await?;
    Ok(Json(response))
}

pub async fn submit_batch(
    State(service): State<Arc<Service>>,
    AuthPrincipal(principal): AuthPrincipal,
    ValidatedJson(requests): ValidatedJson<Vec<SubmitRequest>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if requests.is_empty() {
        return Err(ApiError::Validation("batch must contain at least one request".to_string()));
    }
    if requests.len() > MAX_SUBMIT_BATCH {
        return Err(ApiError::Validation(format!(
            "batch size limited to {MAX_SUBMIT_BATCH} requests"
        )));
    }

    // All-or-nothing: validate every item before creating anything.
    let max_prompt = service.settings.capacity.max_prompt_chars;
    let mut tasks = Vec::with_capacity(requests.len());
    for request in &requests {
        let params = request.validated_params(max_prompt)?;
        tasks.push(Task::new(&principal, request.priority, request.prompt.clone(), params));
    }

    let task_ids: Vec<String> = tasks.iter().map(|t| t.task_id.clone()).collect();
    let queued: Vec<QueuedTask> = tasks
        .iter()
        .map(|t| QueuedTask { task_id: t.task_id.clone(), priority: t.priority })
        .collect();

    for task in tasks {
        service.store.create(task).await;
    }
    if service.queue.enqueue_many(queued).await.is_err() {
        for id in &task_ids {
            service.store.remove(id).await;
        }
        return Err(ApiError::QueueFull { retry_after: ESTIMATED_SECONDS_PER_TASK });
    }
    for _ in &task_ids {
        service.stats.record_request();
    }

    info!(count = task_ids.len(), principal = %principal, "batch submission accepted");
    Ok(Json(json!({ "task_ids": task_ids, "count": task_ids.len() })))
}

/// Create the store record and enqueue; on a full queue the record is
/// removed again so nothing orphaned survives.
async fn enqueue_task(service: &Service, task: Task) -> Result<SubmitResponse, ApiError> {
    let task_id = task.task_id.clone();
    let priority = task.priority;
    service.store.create(task).await;

    let position = match service
        .queue
        .enqueue(QueuedTask { task_id: task_id.clone(), priority })
        .await
    {
        Ok(position) => position,
        Err(full) => {
            service.store.remove(&task_id).await;
            return Err(ApiError::QueueFull {
                retry_after: (full.depth as u64 * ESTIMATED_SECONDS_PER_TASK)
                    .clamp(1, 60),
            });
        }
    };
    service.stats.record_request();

    info!(task_id = %task_id, priority = ?priority, queue_position = position, "task queued");
    Ok(SubmitResponse {
        task_id,
        status: TaskStatus::Queued,
        queue_position: position,
        estimated_wait_time: position as u64 * ESTIMATED_SECONDS_PER_TASK,
    })
}

// ---------------------------------------------------------------------------
// Task reads
// ---------------------------------------------------------------------------

pub async fn get_task(
    State(service): State<Arc<Service>>,
    AuthPrincipal(_principal): AuthPrincipal,
    Path(task_id): Path<String>,
) -> Result<Json<TaskRecord>, ApiError> {
    match service.store.get(&task_id).await {
        Some(task) => Ok(Json(task.record())),
        None => Err(ApiError::NotFound(task_id)),
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
}

pub async fn list_tasks(
    State(service): State<Arc<Service>>,
    AuthPrincipal(principal): AuthPrincipal,
    Query(query): Query<ListQuery>,
) -> Json<Vec<TaskRecord>> {
    let limit = query.limit.unwrap_or(100).min(100);
    Json(service.store.list(&principal, limit).await)
}

// ---------------------------------------------------------------------------
// Health and stats
// ---------------------------------------------------------------------------

pub async fn health(State(service): State<Arc<Service>>) -> Json<serde_json::Value> {
    let settings = &service.settings.batch;
    let in_flight = settings.max_concurrent_batches - service.slots.available_permits();
    Json(json!({
        "status": "healthy",
        "mode": service.adapter.mode(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "batching": {
            "config": settings,
            "queue_depth": service.queue.len().await,
            "lanes": service.queue.depths().await,
            "in_flight_batches": in_flight,
        },
    }))
}

pub async fn stats(State(service): State<Arc<Service>>) -> Json<serde_json::Value> {
    let by_status = service.store.counts_by_status().await;
    let total: u64 = by_status.values().sum();
    Json(json!({
        "batching": service.stats.snapshot(),
        "tasks": { "total": total, "by_status": by_status },
        "config": {
            "batch": service.settings.batch,
            "capacity": service.settings.capacity,
            "mode": service.adapter.mode(),
        },
    }))
}

pub async fn root() -> &'static str {
    "batchline inference gateway"
}

// ---------------------------------------------------------------------------
// OpenAI-compatible passthroughs
// ---------------------------------------------------------------------------

/// Principal recorded for unauthenticated `/v1/*` traffic.
const OPENAI_PRINCIPAL: &str = "openai-client";

pub async fn chat_completions(
    State(service): State<Arc<Service>>,
    ValidatedJson(request): ValidatedJson<ChatCompletionRequest>,
) -> Result<Json<ChatCompletionResponse>, ApiError> {
    let prompt = request
        .messages
        .last()
        .map(|m| m.content.clone())
        .ok_or_else(|| ApiError::Validation("messages must not be empty".to_string()))?;

    let submit = SubmitRequest {
        prompt,
        priority: Priority::Normal,
        max_tokens: request.max_tokens,
        temperature: request.temperature,
        model: request.model.clone(),
    };
    let task = run_to_completion(&service, submit).await?;
    let result = task.result.ok_or_else(|| {
        ApiError::Internal("completed task without a result".to_string())
    })?;

    let model = request.model.unwrap_or_else(|| service.adapter.served_model().to_string());
    Ok(Json(ChatCompletionResponse::synthesize(&model, result.response, result.tokens_generated)))
}

pub async fn completions(
    State(service): State<Arc<Service>>,
    ValidatedJson(request): ValidatedJson<CompletionRequest>,
) -> Result<Json<CompletionResponse>, ApiError> {
    let submit = SubmitRequest {
        prompt: request.prompt,
        priority: Priority::Normal,
        max_tokens: request.max_tokens,
        temperature: request.temperature,
        model: request.model.clone(),
    };
    let task = run_to_completion(&service, submit).await?;
    let result = task.result.ok_or_else(|| {
        ApiError::Internal("completed task without a result".to_string())
    })?;

    let model = request.model.unwrap_or_else(|| service.adapter.served_model().to_string());
    Ok(Json(CompletionResponse::synthesize(&model, result.response, result.tokens_generated)))
}

pub async fn list_models(State(service): State<Arc<Service>>) -> Json<ModelList> {
    Json(ModelList::single(service.adapter.served_model()))
}

/// Push a synchronous request through the batching discipline: enqueue like
/// any other task, then wait for the scheduler to settle it.
async fn run_to_completion(service: &Service, submit: SubmitRequest) -> Result<Task, ApiError> {
    let params = submit.validated_params(service.settings.capacity.max_prompt_chars)?;
    let task = Task::new(OPENAI_PRINCIPAL, submit.priority, submit.prompt, params);
    let task_id = task.task_id.clone();
    enqueue_task(service, task).await?;

    // Budget: the upstream call itself plus one batching window, with slack
    // for dispatch scheduling.
    let wait_budget = service.settings.engine.request_timeout
        + service.settings.batch.batch_wait_timeout
        + Duration::from_secs(5);

    let task = service
        .store
        .wait_terminal(&task_id, wait_budget)
        .await
        .ok_or_else(|| ApiError::Upstream("timed out waiting for completion".to_string()))?;

    match task.status {
        TaskStatus::Completed => Ok(task),
        _ => {
            let reason = task.error.clone().unwrap_or_else(|| "unknown failure".to_string());
            Err(ApiError::Upstream(reason))
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers shared with the router
// ---------------------------------------------------------------------------

/// 404 fallback in the API's error shape.
pub async fn not_found() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "no such endpoint", "error_code": "NOT_FOUND" })),
    )
}
