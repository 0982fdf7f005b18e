//! WebSocket event types and broadcasting for live lesson observation.
//!
//! Every connected client receives the same stream of [`TutorEvent`]s as the
//! learner selects lessons, runs commands and the machine boots.
//!
//! # Event Types
//!
//! - `connected` - Sent when a client connects, includes current state
//! - `readiness_changed` - The lesson machine moved to a new readiness
//! - `lesson_changed` - A different lesson became active
//! - `run_started` - A command started executing
//! - `console_output` - The machine printed something
//! - `run_finished` - A run resolved, with its evaluation
//! - `error` - Something went wrong outside a run
//!
//! # Example
//!
//! ```no_run
//! use shelltutor_runtime::websocket::{EventBroadcaster, TutorEvent};
//! use shelltutor_vm::Readiness;
//!
//! # async fn example() {
//! let broadcaster = EventBroadcaster::new(100);
//! let mut receiver = broadcaster.subscribe();
//!
//! broadcaster.send(TutorEvent::readiness_changed(Readiness::Ready));
//!
//! if let Ok(event) = receiver.recv().await {
//!     println!("Received: {}", event.event_name());
//! }
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use shelltutor_vm::{ConsoleChunk, ConsoleSink, Readiness, VmSession};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::api::AppState;
use crate::catalog::Lesson;
use crate::controller::{LessonRunState, RunOutcome};

// ============================================================================
// Event Payloads
// ============================================================================

/// Payload for the `connected` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectedPayload {
    /// Current lesson state.
    pub state: LessonRunState,
    /// Current machine readiness.
    pub readiness: Readiness,
    /// The active lesson.
    pub lesson: Lesson,
}

/// Payload for the `readiness_changed` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessPayload {
    /// New readiness.
    pub readiness: Readiness,
}

/// Payload for the `lesson_changed` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LessonChangedPayload {
    /// The newly active lesson.
    pub lesson: Lesson,
    /// State after the change.
    pub state: LessonRunState,
}

/// Payload for the `run_started` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStartedPayload {
    /// Lesson the command runs against.
    pub lesson_index: usize,
    /// Command text being executed.
    pub command: String,
    /// When the run started.
    pub timestamp: DateTime<Utc>,
}

/// How a run resolved, as reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunVerdict {
    /// Output contained the expected fragment.
    Passed,
    /// Output was captured but did not match.
    Mismatch,
    /// The machine was not ready.
    NoResult,
    /// Execution failed.
    Failed,
    /// The lesson changed while the command ran.
    Stale,
}

/// Payload for the `run_finished` event, also returned by `POST /api/run`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// How the run resolved.
    pub verdict: RunVerdict,
    /// Trimmed output, when output was evaluated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Exit code reported by the machine, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    /// Failure description for `failed` runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// State after the run.
    pub state: LessonRunState,
}

impl RunReport {
    /// Builds a report from a resolved run. Returns `None` for runs that
    /// never started.
    #[must_use]
    pub fn from_outcome(outcome: &RunOutcome, state: LessonRunState) -> Option<Self> {
        let mut report = Self {
            verdict: RunVerdict::NoResult,
            output: None,
            exit_code: None,
            error: None,
            state,
        };
        match outcome {
            RunOutcome::Evaluated(result) => {
                report.verdict = if result.success {
                    RunVerdict::Passed
                } else {
                    RunVerdict::Mismatch
                };
                report.output = Some(result.raw_output.clone());
                report.exit_code = result.exit_code;
            }
            RunOutcome::NoResult => {}
            RunOutcome::Failed(message) => {
                report.verdict = RunVerdict::Failed;
                report.error = Some(message.clone());
            }
            RunOutcome::Stale => report.verdict = RunVerdict::Stale,
            RunOutcome::Ignored => return None,
        }
        Some(report)
    }

    /// Whether the run passed.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.verdict == RunVerdict::Passed
    }
}

/// Payload for the `error` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Human-readable error message.
    pub message: String,
}

// ============================================================================
// Event Enum
// ============================================================================

/// Events pushed to WebSocket clients.
///
/// Serialized as JSON objects with "event" and "payload" fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum TutorEvent {
    /// Sent when a client connects.
    Connected(ConnectedPayload),
    /// Sent when the machine's readiness changes.
    ReadinessChanged(ReadinessPayload),
    /// Sent when a different lesson becomes active.
    LessonChanged(LessonChangedPayload),
    /// Sent when a command starts.
    RunStarted(RunStartedPayload),
    /// Sent for every piece of console output.
    ConsoleOutput(ConsoleChunk),
    /// Sent when a run resolves.
    RunFinished(RunReport),
    /// Sent when an error occurs.
    Error(ErrorPayload),
}

impl TutorEvent {
    /// Creates a `Connected` event.
    #[must_use]
    pub const fn connected(state: LessonRunState, readiness: Readiness, lesson: Lesson) -> Self {
        Self::Connected(ConnectedPayload {
            state,
            readiness,
            lesson,
        })
    }

    /// Creates a `ReadinessChanged` event.
    #[must_use]
    pub const fn readiness_changed(readiness: Readiness) -> Self {
        Self::ReadinessChanged(ReadinessPayload { readiness })
    }

    /// Creates a `LessonChanged` event.
    #[must_use]
    pub const fn lesson_changed(lesson: Lesson, state: LessonRunState) -> Self {
        Self::LessonChanged(LessonChangedPayload { lesson, state })
    }

    /// Creates a `RunStarted` event.
    #[must_use]
    pub fn run_started(lesson_index: usize, command: impl Into<String>) -> Self {
        Self::RunStarted(RunStartedPayload {
            lesson_index,
            command: command.into(),
            timestamp: Utc::now(),
        })
    }

    /// Creates a `ConsoleOutput` event.
    #[must_use]
    pub const fn console_output(chunk: ConsoleChunk) -> Self {
        Self::ConsoleOutput(chunk)
    }

    /// Creates a `RunFinished` event.
    #[must_use]
    pub const fn run_finished(report: RunReport) -> Self {
        Self::RunFinished(report)
    }

    /// Creates an `Error` event.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(ErrorPayload {
            message: message.into(),
        })
    }

    /// Returns the event name as a string.
    #[must_use]
    pub const fn event_name(&self) -> &'static str {
        match self {
            Self::Connected(_) => "connected",
            Self::ReadinessChanged(_) => "readiness_changed",
            Self::LessonChanged(_) => "lesson_changed",
            Self::RunStarted(_) => "run_started",
            Self::ConsoleOutput(_) => "console_output",
            Self::RunFinished(_) => "run_finished",
            Self::Error(_) => "error",
        }
    }
}

// ============================================================================
// Event Broadcaster
// ============================================================================

/// Fans [`TutorEvent`]s out to every connected client.
///
/// Events are not kept for clients that connect later.
#[derive(Debug, Clone)]
pub struct EventBroadcaster {
    sender: broadcast::Sender<TutorEvent>,
}

impl EventBroadcaster {
    /// Creates a broadcaster buffering `capacity` events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Creates a new subscriber.
    ///
    /// A subscriber that falls behind receives `Lagged` and misses events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TutorEvent> {
        self.sender.subscribe()
    }

    /// Broadcasts an event and returns how many subscribers will see it.
    pub fn send(&self, event: TutorEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Returns the number of active subscribers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(100)
    }
}

/// Spawns a task relaying readiness changes and console output from the
/// machine to `broadcaster`.
///
/// The task runs until aborted.
pub fn spawn_event_forwarder(
    session: Arc<VmSession>,
    console: ConsoleSink,
    broadcaster: EventBroadcaster,
) -> JoinHandle<()> {
    let mut readiness = session.subscribe_readiness();
    let mut chunks = console.subscribe();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = readiness.changed() => {
                    if changed.is_err() {
                        debug!("Readiness channel closed");
                        break;
                    }
                    let current = *readiness.borrow_and_update();
                    broadcaster.send(TutorEvent::readiness_changed(current));
                    if current == Readiness::Failed {
                        broadcaster.send(TutorEvent::error(
                            "Lesson machine failed to start; see the server log",
                        ));
                    }
                }
                chunk = chunks.recv() => {
                    match chunk {
                        Ok(chunk) => {
                            broadcaster.send(TutorEvent::console_output(chunk));
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(missed = n, "Console relay lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
    })
}

// ============================================================================
// WebSocket Handler
// ============================================================================

/// Maximum number of missed pong responses before disconnecting.
const MAX_MISSED_PONGS: u8 = 3;

/// Interval between heartbeat pings.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Handler for `GET /ws`. Upgrades the connection and streams events.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    info!("New WebSocket connection request");
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn connected_event(state: &AppState) -> TutorEvent {
    let controller = state.controller.lock().await;
    TutorEvent::connected(
        controller.state().clone(),
        state.session.readiness(),
        controller.active_lesson().clone(),
    )
}

/// Serves one client: sends `connected`, then forwards broadcast events and
/// keeps the connection alive with pings until the client goes away.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    // Subscribe before reading the snapshot so nothing falls in between.
    let mut events = state.broadcaster.subscribe();

    let connected_json = match serde_json::to_string(&connected_event(&state).await) {
        Ok(json) => json,
        Err(e) => {
            warn!("Failed to serialize connected event: {}", e);
            return;
        }
    };
    if sender.send(Message::Text(connected_json)).await.is_err() {
        debug!("Client disconnected before receiving connected event");
        return;
    }
    info!(clients = state.broadcaster.receiver_count(), "WebSocket client connected");

    let mut heartbeat = interval(HEARTBEAT_INTERVAL);
    let mut missed_pongs = 0u8;

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => missed_pongs = 0,
                    Some(Ok(Message::Close(_))) => {
                        info!("Client requested close");
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(_) | Message::Binary(_))) => {
                        debug!("Ignoring message from client");
                    }
                    Some(Err(e)) => {
                        debug!("WebSocket error: {}", e);
                        break;
                    }
                    None => break,
                }
            }

            event = events.recv() => {
                match event {
                    Ok(event) => {
                        let json = match serde_json::to_string(&event) {
                            Ok(json) => json,
                            Err(e) => {
                                warn!(event = event.event_name(), "Failed to serialize event: {}", e);
                                continue;
                            }
                        };
                        if sender.send(Message::Text(json)).await.is_err() {
                            debug!("Failed to send event, client disconnected");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Client lagged, missed {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Broadcaster closed");
                        break;
                    }
                }
            }

            _ = heartbeat.tick() => {
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
                missed_pongs += 1;
                if missed_pongs >= MAX_MISSED_PONGS {
                    info!("Client missed {} pongs, closing connection", MAX_MISSED_PONGS);
                    break;
                }
            }
        }
    }

    info!("WebSocket client disconnected");
}

// ============================================================================
// Tests
// ============================================================================
