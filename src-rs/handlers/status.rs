use std::{convert::Infallible, time::Duration};

use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::stream::{self, Stream};
use serde_json::{json, Value};
use tokio::time::Instant;

use super::{error_body, generation::record_job_status, is_valid_task_id, store_error_response};
use crate::{
    backend::{backend_status, JobAuth, JobState},
    db::GenerationTask,
    middleware::ApiKeyUser,
    state::AppState,
};

const FIRST_DELAY: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(10);
const STREAM_DEADLINE: Duration = Duration::from_secs(10 * 60);

pub async fn task_status(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiKeyUser>,
    Path(task_id): Path<String>,
) -> Response {
    let task = match owned_task(&state, &caller, &task_id) {
        Ok(task) => task,
        Err(response) => return response,
    };

    match state
        .backend
        .job_status(JobAuth::ApiKey(&caller.api_key), &task_id)
        .await
    {
        Ok(status) => {
            if let Err(error) = record_job_status(&state, &task, &status) {
                tracing::error!(task_id = %task_id, error = %error, "failed to record job status");
            }
            (StatusCode::OK, Json(status.raw)).into_response()
        }
        Err(error) if backend_status(&error) == Some(404) => {
            error_body(StatusCode::NOT_FOUND, "Task not found.")
        }
        Err(error) => {
            tracing::error!(task_id = %task_id, error = ?error, "failed to fetch task status");
            error_body(StatusCode::BAD_GATEWAY, "Error fetching task status")
        }
    }
}

/// Streams `status` events until the job settles, then a final `done` event.
pub async fn task_status_stream(
    State(state): State<AppState>,
    Extension(caller): Extension<ApiKeyUser>,
    Path(task_id): Path<String>,
) -> Response {
    let task = match owned_task(&state, &caller, &task_id) {
        Ok(task) => task,
        Err(response) => return response,
    };

    let poller = Poller {
        state,
        api_key: caller.api_key,
        task,
        phase: Phase::Poll,
        delay: Duration::ZERO,
        deadline: Instant::now() + STREAM_DEADLINE,
    };

    Sse::new(status_events(poller))
        .keep_alive(KeepAlive::default())
        .into_response()
}

fn owned_task(
    state: &AppState,
    caller: &ApiKeyUser,
    task_id: &str,
) -> Result<GenerationTask, Response> {
    if !is_valid_task_id(task_id) {
        return Err(error_body(StatusCode::BAD_REQUEST, "Invalid task ID."));
    }
    match state.store.tasks.find_for_user(task_id, &caller.user_id) {
        Ok(Some(task)) => Ok(task),
        Ok(None) => Err(error_body(StatusCode::NOT_FOUND, "Task not found.")),
        Err(error) => Err(store_error_response(error, "loading task")),
    }
}

enum Phase {
    Poll,
    Finish(&'static str),
    Done,
}

struct Poller {
    state: AppState,
    api_key: String,
    task: GenerationTask,
    phase: Phase,
    delay: Duration,
    deadline: Instant,
}

impl Poller {
    fn next_delay(&mut self) -> Duration {
        let current = self.delay;
        self.delay = next_backoff(current);
        current
    }
}

/// First poll is immediate, then 1s doubling up to 10s.
fn next_backoff(current: Duration) -> Duration {
    if current.is_zero() {
        FIRST_DELAY
    } else {
        (current * 2).min(MAX_DELAY)
    }
}

fn status_events(poller: Poller) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(poller, |mut poller| async move {
        match poller.phase {
            Phase::Done => None,
            Phase::Finish(reason) => {
                poller.phase = Phase::Done;
                let event = Event::default()
                    .event("done")
                    .data(json!({ "reason": reason }).to_string());
                Some((Ok(event), poller))
            }
            Phase::Poll => {
                let delay = poller.next_delay();
                if Instant::now() + delay >= poller.deadline {
                    poller.phase = Phase::Done;
                    let event = Event::default()
                        .event("done")
                        .data(json!({ "reason": "timeout" }).to_string());
                    return Some((Ok(event), poller));
                }
                tokio::time::sleep(delay).await;

                let event = poll_once(&mut poller).await;
                Some((Ok(event), poller))
            }
        }
    })
}

async fn poll_once(poller: &mut Poller) -> Event {
    let task_id = poller.task.task_id.clone();
    match poller
        .state
        .backend
        .job_status(JobAuth::ApiKey(&poller.api_key), &task_id)
        .await
    {
        Ok(status) => {
            if let Err(error) = record_job_status(&poller.state, &poller.task, &status) {
                tracing::error!(task_id = %task_id, error = %error, "failed to record job status");
            }
            poller.task.status = status.status.as_str().to_string();
            if status.status == JobState::Failed {
                poller.task.refunded = true;
            }
            if status.status.is_terminal() {
                poller.phase = Phase::Finish(status.status.as_str());
            }
            status_event(status.raw)
        }
        Err(error) => {
            tracing::warn!(task_id = %task_id, error = %error, "status poll failed");
            if backend_status(&error) == Some(404) {
                poller.phase = Phase::Finish("not_found");
            }
            Event::default()
                .event("error")
                .data(json!({ "error": "Error fetching task status" }).to_string())
        }
    }
}

fn status_event(raw: Value) -> Event {
    Event::default().event("status").data(raw.to_string())
}
