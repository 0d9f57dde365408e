use axum::{
    extract::{Extension, Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use super::{error_body, is_valid_task_id, require_backend_account, store_error_response};
use crate::{
    backend::{backend_status, DiffusionRequest, JobAuth, JobState, JobStatus, SubmittedJob, UpscaleRequest},
    db::GenerationTask,
    error::Result,
    middleware::AuthenticatedUser,
    plans::TaskKind,
    state::AppState,
};

const MAX_PROMPT_LEN: usize = 4_000;
const MAX_IMAGE_URLS: usize = 5;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImagineRequest {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default)]
    pub aspect_ratio: Option<String>,
    #[serde(default)]
    pub image_urls: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpscaleBody {
    pub job_id: String,
    pub index: u8,
}

#[derive(Debug, Deserialize)]
pub struct TaskListQuery {
    pub limit: Option<usize>,
}

pub async fn imagine(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(body): Json<ImagineRequest>,
) -> Response {
    let prompt = body.prompt.trim();
    if prompt.is_empty() {
        return error_body(StatusCode::BAD_REQUEST, "Prompt is required.");
    }
    if prompt.chars().count() > MAX_PROMPT_LEN {
        return error_body(StatusCode::BAD_REQUEST, "Prompt is too long.");
    }
    let image_urls = body
        .image_urls
        .map(|urls| {
            urls.into_iter()
                .map(|url| url.trim().to_string())
                .filter(|url| !url.is_empty())
                .collect::<Vec<_>>()
        })
        .filter(|urls| !urls.is_empty());
    if let Some(urls) = &image_urls {
        if urls.len() > MAX_IMAGE_URLS
            || urls
                .iter()
                .any(|url| !url.starts_with("https://") && !url.starts_with("http://"))
        {
            return error_body(StatusCode::BAD_REQUEST, "Invalid image URLs.");
        }
    }

    let request = DiffusionRequest {
        prompt: prompt.to_string(),
        negative_prompt: body.negative_prompt.filter(|value| !value.trim().is_empty()),
        aspect_ratio: body.aspect_ratio.filter(|value| !value.trim().is_empty()),
        image_urls,
    };

    submit_paid_job(&state, &user, TaskKind::Imagine, |backend, account_id| async move {
        backend
            .submit_diffusion(JobAuth::Account(&account_id), &request)
            .await
    })
    .await
}

pub async fn upscale(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(body): Json<UpscaleBody>,
) -> Response {
    if !(1..=4).contains(&body.index) {
        return error_body(StatusCode::BAD_REQUEST, "Index must be between 1 and 4.");
    }
    if !is_valid_task_id(&body.job_id) {
        return error_body(StatusCode::BAD_REQUEST, "Invalid job ID.");
    }
    match state.store.tasks.find_for_user(&body.job_id, &user.user_id) {
        Ok(Some(_)) => {}
        Ok(None) => return error_body(StatusCode::NOT_FOUND, "Task not found."),
        Err(error) => return store_error_response(error, "loading task"),
    }

    let request = UpscaleRequest {
        job_id: body.job_id,
        index: body.index,
    };

    submit_paid_job(&state, &user, TaskKind::Upscale, |backend, account_id| async move {
        backend
            .submit_upscale(JobAuth::Account(&account_id), &request)
            .await
    })
    .await
}

/// Spends the task's credits, submits it and refunds the spend when the
/// backend rejects the submission.
async fn submit_paid_job<F, Fut>(
    state: &AppState,
    user: &AuthenticatedUser,
    kind: TaskKind,
    submit: F,
) -> Response
where
    F: FnOnce(crate::backend::BackendClient, String) -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<SubmittedJob>>,
{
    let account_id = match require_backend_account(state, &user.user_id).await {
        Ok(account_id) => account_id,
        Err(response) => return response,
    };

    let cost = kind.cost();
    let request_id = Uuid::new_v4();
    let spend = match state.store.ledger.spend(
        &user.user_id,
        cost,
        kind.as_str(),
        Some(&format!("spend:{request_id}")),
    ) {
        Ok(spend) => spend,
        Err(error) => return store_error_response(error, "spending credits"),
    };

    let job = match submit(state.backend.clone(), account_id).await {
        Ok(job) => job,
        Err(error) => {
            tracing::error!(user_id = %user.user_id, kind = kind.as_str(), error = ?error, "job submission failed, refunding");
            let reference = format!("refund:{request_id}");
            if let Err(refund_error) =
                state
                    .store
                    .ledger
                    .refund(&user.user_id, cost, "submission failed", &reference)
            {
                tracing::error!(user_id = %user.user_id, reference = %reference, error = %refund_error, "refund after failed submission failed");
            }
            let status = match backend_status(&error) {
                Some(400 | 422) => StatusCode::BAD_REQUEST,
                _ => StatusCode::BAD_GATEWAY,
            };
            return error_body(status, "The generation backend rejected the request.");
        }
    };

    if !is_valid_task_id(&job.task_id) {
        tracing::warn!(task_id = %job.task_id, "backend returned an unusual task id");
    }
    if let Err(error) = state
        .store
        .tasks
        .create(&job.task_id, &user.user_id, kind.as_str(), cost)
    {
        tracing::error!(task_id = %job.task_id, error = %error, "failed to record generation task, refunding");
        let reference = format!("refund:{request_id}");
        if let Err(refund_error) =
            state
                .store
                .ledger
                .refund(&user.user_id, cost, "task not recorded", &reference)
        {
            tracing::error!(user_id = %user.user_id, reference = %reference, error = %refund_error, "refund after unrecorded task failed");
        }
        return error_body(
            StatusCode::INTERNAL_SERVER_ERROR,
            "The task could not be recorded. Your credits were refunded.",
        );
    }

    tracing::info!(user_id = %user.user_id, task_id = %job.task_id, kind = kind.as_str(), cost, "generation job submitted");
    (
        StatusCode::ACCEPTED,
        Json(json!({
            "taskId": job.task_id,
            "status": job.status.unwrap_or_else(|| "submitted".to_string()),
            "cost": cost,
            "balance": spend.balance_after,
        })),
    )
        .into_response()
}

pub async fn list_tasks(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Query(query): Query<TaskListQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    match state.store.tasks.list_for_user(&user.user_id, limit) {
        Ok(tasks) => (StatusCode::OK, Json(json!({ "tasks": tasks }))).into_response(),
        Err(error) => store_error_response(error, "listing tasks"),
    }
}

pub async fn get_task(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(task_id): Path<String>,
) -> Response {
    if !is_valid_task_id(&task_id) {
        return error_body(StatusCode::BAD_REQUEST, "Invalid task ID.");
    }
    let task = match state.store.tasks.find_for_user(&task_id, &user.user_id) {
        Ok(Some(task)) => task,
        Ok(None) => return error_body(StatusCode::NOT_FOUND, "Task not found."),
        Err(error) => return store_error_response(error, "loading task"),
    };

    if is_settled(&task) {
        return (StatusCode::OK, Json(json!({ "task": task, "job": Value::Null }))).into_response();
    }

    let account_id = match require_backend_account(&state, &user.user_id).await {
        Ok(account_id) => account_id,
        Err(response) => return response,
    };
    match state
        .backend
        .job_status(JobAuth::Account(&account_id), &task_id)
        .await
    {
        Ok(status) => {
            if let Err(error) = record_job_status(&state, &task, &status) {
                tracing::error!(task_id = %task_id, error = %error, "failed to record job status");
            }
            let task = state
                .store
                .tasks
                .find_for_user(&task_id, &user.user_id)
                .ok()
                .flatten()
                .unwrap_or(task);
            (StatusCode::OK, Json(json!({ "task": task, "job": status.raw }))).into_response()
        }
        Err(error) => {
            tracing::warn!(task_id = %task_id, error = %error, "backend status lookup failed");
            (StatusCode::OK, Json(json!({ "task": task, "job": Value::Null }))).into_response()
        }
    }
}

fn is_settled(task: &GenerationTask) -> bool {
    JobState::parse(&task.status).is_terminal()
}

/// Stores the backend's view of a task and refunds its cost once if it failed.
pub(crate) fn record_job_status(
    state: &AppState,
    task: &GenerationTask,
    status: &JobStatus,
) -> Result<()> {
    if task.status != status.status.as_str() {
        state
            .store
            .tasks
            .update_status(&task.task_id, status.status.as_str())?;
    }

    if status.status == JobState::Failed && !task.refunded {
        let reference = format!("refund:task:{}", task.task_id);
        let refunded = state.store.ledger.refund(
            &task.user_id,
            task.cost,
            "generation failed",
            &reference,
        )?;
        state.store.tasks.mark_refunded(&task.task_id)?;
        if refunded.is_some() {
            tracing::info!(task_id = %task.task_id, user_id = %task.user_id, cost = task.cost, "refunded failed task");
        }
    }
    Ok(())
}
