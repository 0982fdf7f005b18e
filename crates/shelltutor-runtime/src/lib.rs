//! shelltutor lesson runtime
//!
//! Lesson catalog, output evaluation, the lesson controller state machine,
//! and the HTTP and WebSocket surfaces that drive it.

pub mod api;
pub mod catalog;
pub mod config;
pub mod controller;
pub mod error;
pub mod evaluator;
pub mod websocket;

pub use api::{create_router, AppState, CommandRequest, ErrorResponse, StateResponse};
pub use catalog::{Lesson, LessonCatalog, LessonSpec};
pub use config::{Config, MachineConfig};
pub use controller::{LessonController, LessonRunState, PendingRun, RunOutcome, RunStatus};
pub use error::{Result, TutorError};
pub use evaluator::evaluate;
pub use websocket::{spawn_event_forwarder, EventBroadcaster, RunReport, RunVerdict, TutorEvent};
