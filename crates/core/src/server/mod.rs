use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Semaphore};
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::driver::{BatchReport, GenerationDriver, SampleEvent, SampleFailure};
use crate::error::GenerationError;
use crate::progress::{check_generation_progress, ProgressSnapshot, ProgressTracker};
use crate::request::GenerationRequest;
use crate::session::{GenerationSession, OutputManager, SessionSlot};

const MAX_SAMPLE_COUNT: u32 = 100;
const WS_CHANNEL_CAPACITY: usize = 64;

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    jobs: DashMap<String, Job>,
    device_semaphore: Arc<Semaphore>,
    progress_senders: DashMap<String, broadcast::Sender<JobWsEvent>>,
    config: AppConfig,
    driver: GenerationDriver,
    outputs: OutputManager,
    slot: SessionSlot,
}

impl AppState {
    pub fn new(config: AppConfig, driver: GenerationDriver) -> Self {
        let outputs = OutputManager::new(
            config.paths.outputs_dir.clone(),
            config.generation.tool_name.clone(),
        )
        .with_intermediate_dir(config.sampler.save_intermediate);

        Self {
            inner: Arc::new(AppStateInner {
                jobs: DashMap::new(),
                device_semaphore: Arc::new(Semaphore::new(1)),
                progress_senders: DashMap::new(),
                config,
                driver,
                outputs,
                slot: SessionSlot::new(),
            }),
        }
    }

    pub fn session_slot(&self) -> &SessionSlot {
        &self.inner.slot
    }

    /// Sample count of the job that owns `session`, if it is known.
    fn sample_count_for(&self, session: &GenerationSession) -> Option<(String, u32)> {
        self.inner.jobs.iter().find_map(|entry| {
            let job = entry.value();
            (job.session.as_ref() == Some(session))
                .then(|| (job.id.clone(), job.request.sample_count))
        })
    }
}

#[derive(Clone)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub prompt: String,
    pub request: GenerationRequest,
    pub session: Option<GenerationSession>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: ProgressSnapshot,
    pub failures: Vec<SampleFailure>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::CompletedWithErrors | Self::Failed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobWsEvent {
    Session {
        output_directory: PathBuf,
        label: String,
    },
    Sample {
        event: SampleEvent,
        progress: ProgressSnapshot,
        status_text: String,
    },
    /// Current progress, sent once to a socket that joins mid-run.
    Progress {
        progress: ProgressSnapshot,
        status_text: String,
    },
    Finished {
        status: JobStatus,
        error: Option<String>,
    },
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenerateRequestBody {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default)]
    pub sample_count: Option<u32>,
}

#[derive(Serialize)]
pub struct CreateJobResponse {
    pub id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize)]
pub struct JobResponse {
    pub id: String,
    pub status: JobStatus,
    pub prompt: String,
    pub sample_count: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub session: Option<GenerationSession>,
    pub progress: ProgressSnapshot,
    pub status_text: String,
    pub failures: Vec<SampleFailure>,
    pub error: Option<String>,
    pub duration_ms: Option<i64>,
}

#[derive(Serialize)]
pub struct SessionResponse {
    pub session: Option<GenerationSession>,
    pub job_id: Option<String>,
    pub progress: Option<ProgressSnapshot>,
    pub status_text: Option<String>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/config", get(get_config))
        .route("/api/generate", post(create_generation))
        .route("/api/jobs", get(list_jobs))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/jobs/{id}/ws", any(job_ws))
        .route("/api/jobs/{id}/samples/{number}", get(get_job_sample))
        .route("/api/session", get(get_session))
        .route("/api/session/samples/{number}", get(get_session_sample))
        .route("/api/session/restart", post(restart_session))
        .route("/api/{*path}", any(api_route_not_found))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn api_route_not_found(Path(path): Path<String>) -> AppError {
    AppError::NotFound(format!("api endpoint not found: /api/{path}"))
}

async fn get_config(State(state): State<AppState>) -> Json<AppConfig> {
    let mut config = state.inner.config.clone();
    config.service.url = config.service.display_url();
    Json(config)
}

async fn create_generation(
    State(state): State<AppState>,
    Json(payload): Json<GenerateRequestBody>,
) -> Result<(StatusCode, Json<CreateJobResponse>), AppError> {
    let generation = &state.inner.config.generation;
    let sample_count = payload.sample_count.unwrap_or(generation.sample_count);
    if sample_count > MAX_SAMPLE_COUNT {
        return Err(AppError::BadRequest(format!(
            "sample_count must be at most {MAX_SAMPLE_COUNT}, got {sample_count}"
        )));
    }

    let negative_prompt = payload
        .negative_prompt
        .unwrap_or_else(|| generation.negative_prompt.clone());
    let request =
        GenerationRequest::from_prompt(&payload.prompt, &negative_prompt, sample_count, generation)
            .map_err(|e| AppError::BadRequest(format!("{e:#}")))?;

    let created = create_and_spawn_job(&state, payload.prompt.trim().to_string(), request);
    Ok((StatusCode::CREATED, Json(created)))
}

fn create_and_spawn_job(
    state: &AppState,
    prompt: String,
    request: GenerationRequest,
) -> CreateJobResponse {
    let id = Uuid::new_v4().to_string();
    let now = Utc::now();

    let (tx, _rx) = broadcast::channel::<JobWsEvent>(WS_CHANNEL_CAPACITY);
    state.inner.progress_senders.insert(id.clone(), tx);

    let sample_count = request.sample_count;
    let job = Job {
        id: id.clone(),
        status: JobStatus::Queued,
        prompt,
        progress: ProgressSnapshot::new(0, sample_count),
        request,
        session: None,
        created_at: now,
        started_at: None,
        completed_at: None,
        failures: Vec::new(),
        error: None,
    };
    state.inner.jobs.insert(id.clone(), job);

    let state_clone = state.clone();
    let job_id = id.clone();
    tokio::spawn(async move {
        run_job(state_clone, job_id).await;
    });

    info!(job_id = %id, samples = sample_count, "Generation job created");

    CreateJobResponse {
        id,
        status: JobStatus::Queued,
        created_at: now,
    }
}

async fn run_job(state: AppState, job_id: String) {
    let _permit = match state.inner.device_semaphore.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return,
    };

    let request = {
        let Some(mut job) = state.inner.jobs.get_mut(&job_id) else {
            return;
        };
        job.status = JobStatus::Running;
        job.started_at = Some(Utc::now());
        job.request.clone()
    };

    // Clone the sender up front so no DashMap guard is held inside the
    // blocking closure.
    let ws_tx = state
        .inner
        .progress_senders
        .get(&job_id)
        .map(|sender| sender.clone());
    let inner = Arc::clone(&state.inner);
    let job_id_for_closure = job_id.clone();

    let result = tokio::task::spawn_blocking(move || {
        run_generation(&inner, &job_id_for_closure, &request, ws_tx.as_ref())
    })
    .await;

    let (status, error_message, failures) = match result {
        Ok(Ok(report)) if report.is_success() => (JobStatus::Completed, None, Vec::new()),
        Ok(Ok(report)) => (JobStatus::CompletedWithErrors, None, report.failed),
        Ok(Err(err)) => {
            error!(job_id = %job_id, error = %err, "Generation job failed");
            (JobStatus::Failed, Some(err.to_string()), Vec::new())
        }
        Err(join_err) => {
            error!(job_id = %job_id, error = %join_err, "Generation task panicked");
            (
                JobStatus::Failed,
                Some(format!("generation task panicked: {join_err}")),
                Vec::new(),
            )
        }
    };

    if let Some(mut job) = state.inner.jobs.get_mut(&job_id) {
        job.status = status;
        job.error = error_message.clone();
        if !failures.is_empty() {
            job.failures = failures;
        }
        job.completed_at = Some(Utc::now());
    }

    if let Some((_, tx)) = state.inner.progress_senders.remove(&job_id) {
        let _ = tx.send(JobWsEvent::Finished {
            status,
            error: error_message,
        });
    }

    info!(job_id = %job_id, status = ?status, "Generation job finished");
}

fn run_generation(
    inner: &AppStateInner,
    job_id: &str,
    request: &GenerationRequest,
    ws_tx: Option<&broadcast::Sender<JobWsEvent>>,
) -> Result<BatchReport, GenerationError> {
    let session = inner
        .driver
        .open_session(&inner.outputs, &inner.slot, request)?;

    if let Some(mut job) = inner.jobs.get_mut(job_id) {
        job.session = Some(session.clone());
    }
    if let Some(tx) = ws_tx {
        let _ = tx.send(JobWsEvent::Session {
            output_directory: session.output_directory.clone(),
            label: session.label.clone(),
        });
    }

    let mut tracker = ProgressTracker::new(request.sample_count);
    inner.driver.run(&session, request, |event| {
        let progress = tracker.apply(&event).unwrap_or_else(|| tracker.snapshot());

        if let Some(mut job) = inner.jobs.get_mut(job_id) {
            job.progress = progress;
            if let SampleEvent::Failed { index, error, .. } = &event {
                job.failures.push(SampleFailure {
                    index: *index,
                    error: error.clone(),
                });
            }
        }

        if let Some(tx) = ws_tx {
            let _ = tx.send(JobWsEvent::Sample {
                event,
                progress,
                status_text: progress.status_text(),
            });
        }
    })
}

async fn list_jobs(State(state): State<AppState>) -> Json<Vec<JobResponse>> {
    let mut jobs: Vec<JobResponse> = state
        .inner
        .jobs
        .iter()
        .map(|entry| job_to_response(entry.value()))
        .collect();
    jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Json(jobs)
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobResponse>, AppError> {
    let job = state
        .inner
        .jobs
        .get(&id)
        .ok_or_else(|| AppError::NotFound(format!("job not found: {id}")))?;

    Ok(Json(job_to_response(job.value())))
}

async fn job_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let status = state
        .inner
        .jobs
        .get(&id)
        .map(|job| job.status)
        .ok_or_else(|| AppError::NotFound(format!("job not found: {id}")))?;

    let rx = state
        .inner
        .progress_senders
        .get(&id)
        .map(|sender| sender.subscribe())
        .ok_or_else(|| {
            AppError::Conflict(format!("job {id} is {status:?} and has no live progress"))
        })?;

    // Read the job after subscribing so nothing falls between the two.
    let catch_up = state
        .inner
        .jobs
        .get(&id)
        .map(|job| catch_up_events(&job))
        .unwrap_or_default();

    Ok(ws.on_upgrade(move |socket| handle_ws(socket, catch_up, rx)))
}

/// Events that bring a late subscriber up to the job's current state.
fn catch_up_events(job: &Job) -> Vec<JobWsEvent> {
    let Some(session) = &job.session else {
        return Vec::new();
    };
    vec![
        JobWsEvent::Session {
            output_directory: session.output_directory.clone(),
            label: session.label.clone(),
        },
        JobWsEvent::Progress {
            progress: job.progress,
            status_text: job.progress.status_text(),
        },
    ]
}

async fn send_ws_event(socket: &mut WebSocket, event: &JobWsEvent) -> bool {
    let Ok(json) = serde_json::to_string(event) else {
        return false;
    };
    socket.send(Message::Text(json.into())).await.is_ok()
}

async fn handle_ws(
    mut socket: WebSocket,
    catch_up: Vec<JobWsEvent>,
    mut rx: broadcast::Receiver<JobWsEvent>,
) {
    for event in &catch_up {
        if !send_ws_event(&mut socket, event).await {
            return;
        }
    }

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(update) => {
                        if !send_ws_event(&mut socket, &update).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("WebSocket receiver lagged by {n} messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    _ => {}
                }
            }
        }
    }
}

async fn get_job_sample(
    State(state): State<AppState>,
    Path((id, number)): Path<(String, u32)>,
) -> Result<Response, AppError> {
    let (session, sample_count) = {
        let job = state
            .inner
            .jobs
            .get(&id)
            .ok_or_else(|| AppError::NotFound(format!("job not found: {id}")))?;
        let session = job
            .session
            .clone()
            .ok_or_else(|| AppError::Conflict(format!("job {id} has not started yet")))?;
        (session, job.request.sample_count)
    };

    serve_sample(&session, sample_count, number).await
}

async fn get_session(State(state): State<AppState>) -> Json<SessionResponse> {
    let Some(session) = state.inner.slot.current() else {
        return Json(SessionResponse {
            session: None,
            job_id: None,
            progress: None,
            status_text: None,
        });
    };

    let owner = state.sample_count_for(&session);
    let progress = owner.as_ref().map(|(_, total)| {
        ProgressSnapshot::new(check_generation_progress(&session, *total), *total)
    });

    Json(SessionResponse {
        job_id: owner.map(|(job_id, _)| job_id),
        status_text: progress.map(|progress| progress.status_text()),
        progress,
        session: Some(session),
    })
}

async fn get_session_sample(
    State(state): State<AppState>,
    Path(number): Path<u32>,
) -> Result<Response, AppError> {
    let session = state
        .inner
        .slot
        .current()
        .ok_or_else(|| AppError::NotFound("no active generation session".to_string()))?;
    let sample_count = state
        .sample_count_for(&session)
        .map(|(_, total)| total)
        .unwrap_or(u32::MAX);

    serve_sample(&session, sample_count, number).await
}

async fn restart_session(State(state): State<AppState>) -> Json<SessionResponse> {
    state.inner.slot.reset();
    Json(SessionResponse {
        session: None,
        job_id: None,
        progress: None,
        status_text: None,
    })
}

/// Serve the 1-based sample `number` of `session`.
async fn serve_sample(
    session: &GenerationSession,
    sample_count: u32,
    number: u32,
) -> Result<Response, AppError> {
    if number == 0 {
        return Err(AppError::BadRequest(
            "sample numbers start at 1".to_string(),
        ));
    }
    if number > sample_count {
        return Err(AppError::NotFound(format!(
            "sample {number} is out of range (session has {sample_count})"
        )));
    }

    let path = session
        .display_sample_path(number)
        .ok_or_else(|| AppError::BadRequest("sample numbers start at 1".to_string()))?;
    if !path.is_file() {
        return Err(AppError::Conflict(format!(
            "sample {number} has not been generated yet"
        )));
    }

    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| AppError::Internal(format!("failed to read sample: {e}")))?;
    let mime = mime_guess::from_path(&path).first_or_octet_stream();

    Ok(([(header::CONTENT_TYPE, mime.to_string())], bytes).into_response())
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}

fn job_to_response(job: &Job) -> JobResponse {
    JobResponse {
        id: job.id.clone(),
        status: job.status,
        prompt: job.prompt.clone(),
        sample_count: job.request.sample_count,
        created_at: job.created_at,
        started_at: job.started_at,
        completed_at: job.completed_at,
        session: job.session.clone(),
        progress: job.progress,
        status_text: job.progress.status_text(),
        failures: job.failures.clone(),
        error: job.error.clone(),
        duration_ms: job_duration_ms(job),
    }
}

fn job_duration_ms(job: &Job) -> Option<i64> {
    let started = job.started_at?;
    let finished = job.completed_at?;
    Some((finished - started).num_milliseconds().max(0))
}
