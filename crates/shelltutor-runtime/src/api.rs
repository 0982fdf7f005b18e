//! HTTP API for driving lessons from a browser or script.
//!
//! # Endpoints
//!
//! - `GET /api/lessons` - List the catalog
//! - `GET /api/state` - Current lesson state and machine readiness
//! - `POST /api/lessons/:index/select` - Make a lesson active
//! - `PUT /api/command` - Replace the command text
//! - `POST /api/run` - Run the command and evaluate it
//! - `POST /api/advance` - Move on after a passed lesson
//! - `POST /api/console/toggle` - Show or hide the console
//! - `POST /api/assistant/toggle` - Show or hide the assistant
//! - `GET /ws` - WebSocket event stream
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use shelltutor_runtime::{create_router, AppState, LessonCatalog, LessonController};
//! use shelltutor_vm::{DeviceStack, ScriptedBackend, VmSession};
//!
//! # async fn example() {
//! let session = Arc::new(VmSession::new(
//!     Arc::new(ScriptedBackend::new()),
//!     DeviceStack::new("debian:bookworm-slim"),
//! ));
//! let controller = LessonController::new(LessonCatalog::builtin(), session, 0).unwrap();
//! let router = create_router(AppState::new(controller, "http://127.0.0.1:5000/chat"));
//!
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:3000").await.unwrap();
//! axum::serve(listener, router).await.unwrap();
//! # }
//! ```

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use shelltutor_vm::{Readiness, VmSession};
use tokio::sync::Mutex;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::catalog::Lesson;
use crate::controller::{LessonController, LessonRunState, PendingRun, RunStatus};
use crate::websocket::{ws_handler, EventBroadcaster, RunReport, TutorEvent};

// ============================================================================
// Request/Response Types
// ============================================================================

/// Request body for `PUT /api/command`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    /// New command text.
    pub command: String,
}

/// Snapshot returned by every state-changing endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateResponse {
    /// Lesson state.
    pub state: LessonRunState,
    /// Derived run status.
    pub status: RunStatus,
    /// Machine readiness.
    pub readiness: Readiness,
    /// The active lesson.
    pub lesson: Lesson,
    /// Number of lessons in the catalog.
    pub lesson_count: usize,
    /// Whether `POST /api/advance` would move on.
    pub can_advance: bool,
    /// Assistant location, present while the assistant is shown.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assistant_url: Option<String>,
}

/// Error response body returned on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Description of the error.
    pub error: String,
}

// ============================================================================
// Application State
// ============================================================================

/// Shared state for HTTP and WebSocket handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// The lesson controller.
    pub controller: Arc<Mutex<LessonController>>,
    /// The machine session the controller runs commands on.
    pub session: Arc<VmSession>,
    /// Event fan-out for WebSocket clients.
    pub broadcaster: EventBroadcaster,
    /// Where the assistant overlay points.
    pub assistant_url: String,
}

impl AppState {
    /// Wraps `controller` for sharing across handlers.
    #[must_use]
    pub fn new(controller: LessonController, assistant_url: impl Into<String>) -> Self {
        let session = Arc::clone(controller.session());
        Self::with_shared(
            Arc::new(Mutex::new(controller)),
            session,
            EventBroadcaster::default(),
            assistant_url,
        )
    }

    /// Builds the state around a controller and broadcaster shared with
    /// other front ends. `session` must be the controller's session.
    #[must_use]
    pub fn with_shared(
        controller: Arc<Mutex<LessonController>>,
        session: Arc<VmSession>,
        broadcaster: EventBroadcaster,
        assistant_url: impl Into<String>,
    ) -> Self {
        Self {
            controller,
            session,
            broadcaster,
            assistant_url: assistant_url.into(),
        }
    }

    fn snapshot(&self, controller: &LessonController) -> StateResponse {
        let state = controller.state().clone();
        StateResponse {
            status: state.status(),
            assistant_url: state
                .assistant_visible
                .then(|| self.assistant_url.clone()),
            state,
            readiness: self.session.readiness(),
            lesson: controller.active_lesson().clone(),
            lesson_count: controller.catalog().count(),
            can_advance: controller.can_advance(),
        }
    }
}

// ============================================================================
// API Error Type
// ============================================================================

#[derive(Debug)]
enum ApiError {
    /// No such lesson.
    NotFound(String),
    /// The request conflicts with the current lesson state.
    Conflict(String),
    /// The machine cannot take commands yet.
    MachineUnavailable(String),
    /// Internal server error.
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::Conflict(msg) => (StatusCode::CONFLICT, msg),
            Self::MachineUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

// ============================================================================
// Router Setup
// ============================================================================

/// Creates the router with the API under `/api` and the event stream at
/// `/ws`, with permissive CORS and request tracing.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/lessons", get(handle_lessons))
        .route("/lessons/:index/select", post(handle_select))
        .route("/state", get(handle_state))
        .route("/command", put(handle_command))
        .route("/run", post(handle_run))
        .route("/advance", post(handle_advance))
        .route("/console/toggle", post(handle_console_toggle))
        .route("/assistant/toggle", post(handle_assistant_toggle));

    Router::new()
        .nest("/api", api_routes)
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(Arc::new(state))
}

// ============================================================================
// Handlers
// ============================================================================

/// Handler for `GET /api/lessons`.
async fn handle_lessons(State(state): State<Arc<AppState>>) -> Json<Vec<Lesson>> {
    let controller = state.controller.lock().await;
    Json(controller.catalog().lessons().to_vec())
}

/// Handler for `GET /api/state`.
async fn handle_state(State(state): State<Arc<AppState>>) -> Json<StateResponse> {
    let controller = state.controller.lock().await;
    Json(state.snapshot(&controller))
}

/// Handler for `POST /api/lessons/:index/select`.
async fn handle_select(
    State(state): State<Arc<AppState>>,
    Path(index): Path<usize>,
) -> Result<Json<StateResponse>, ApiError> {
    let mut controller = state.controller.lock().await;

    let lesson = controller.select_lesson(index).map_err(|e| {
        warn!(index, "Lesson selection rejected");
        ApiError::NotFound(e.to_string())
    })?;
    let lesson = lesson.clone();

    state.broadcaster.send(TutorEvent::lesson_changed(
        lesson,
        controller.state().clone(),
    ));
    Ok(Json(state.snapshot(&controller)))
}

/// Handler for `PUT /api/command`.
async fn handle_command(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CommandRequest>,
) -> Result<Json<StateResponse>, ApiError> {
    let mut controller = state.controller.lock().await;

    if !controller.edit_command(request.command) {
        return Err(ApiError::Conflict(
            "A command is running; the command text cannot change until it finishes".into(),
        ));
    }
    Ok(Json(state.snapshot(&controller)))
}

/// Handler for `POST /api/run`.
///
/// The controller lock is released while the command executes, so state
/// and selection requests are served in the meantime. Execution and
/// completion run in their own task, so a client that goes away mid-run
/// cannot leave the run unresolved.
async fn handle_run(State(state): State<Arc<AppState>>) -> Result<Json<RunReport>, ApiError> {
    let pending = {
        let mut controller = state.controller.lock().await;
        if controller.state().is_running {
            return Err(ApiError::Conflict("A command is already running".into()));
        }
        controller.begin_run().ok_or_else(|| {
            ApiError::MachineUnavailable(format!(
                "Lesson machine is {}; commands run once it is ready",
                state.session.readiness()
            ))
        })?
    };

    state.broadcaster.send(TutorEvent::run_started(
        pending.lesson_index(),
        pending.command(),
    ));

    let completion = tokio::spawn(finish_run(Arc::clone(&state), pending));
    let report = completion.await.map_err(|e| {
        warn!(error = %e, "Run task did not complete");
        ApiError::Internal(format!("Run task failed: {e}"))
    })?;

    report
        .map(Json)
        .ok_or_else(|| ApiError::Conflict("The run did not start".into()))
}

/// Executes `pending`, resolves it on the controller and broadcasts the
/// report.
async fn finish_run(state: Arc<AppState>, pending: PendingRun) -> Option<RunReport> {
    let result = pending.execute().await;

    let mut controller = state.controller.lock().await;
    let outcome = controller.complete_run(pending, result);
    let report = RunReport::from_outcome(&outcome, controller.state().clone());
    drop(controller);

    if let Some(report) = &report {
        info!(verdict = ?report.verdict, "Run reported");
        state
            .broadcaster
            .send(TutorEvent::run_finished(report.clone()));
    }
    report
}

/// Handler for `POST /api/advance`.
async fn handle_advance(
    State(state): State<Arc<AppState>>,
) -> Result<Json<StateResponse>, ApiError> {
    let mut controller = state.controller.lock().await;

    let Some(lesson) = controller.advance().cloned() else {
        let reason = if controller.state().last_success {
            "This is the last lesson"
        } else {
            "Pass the current lesson before moving on"
        };
        return Err(ApiError::Conflict(reason.into()));
    };

    state.broadcaster.send(TutorEvent::lesson_changed(
        lesson,
        controller.state().clone(),
    ));
    Ok(Json(state.snapshot(&controller)))
}

/// Handler for `POST /api/console/toggle`.
async fn handle_console_toggle(State(state): State<Arc<AppState>>) -> Json<StateResponse> {
    let mut controller = state.controller.lock().await;
    controller.toggle_console_visibility();
    Json(state.snapshot(&controller))
}

/// Handler for `POST /api/assistant/toggle`.
async fn handle_assistant_toggle(State(state): State<Arc<AppState>>) -> Json<StateResponse> {
    let mut controller = state.controller.lock().await;
    controller.toggle_assistant();
    Json(state.snapshot(&controller))
}

// ============================================================================
// Tests
// ============================================================================
