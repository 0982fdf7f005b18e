//! Lesson controller state machine.
//!
//! [`LessonController`] ties the catalog, the machine session, the command
//! runner and the evaluator together and owns the [`LessonRunState`] the
//! presentation layer renders.
//!
//! The exposed run status moves between three states:
//! - `Idle` -> `Running` on [`run`](LessonController::run) when the machine is ready
//! - `Running` -> `Succeeded` when the output satisfies the lesson
//! - `Running` -> `Idle` on a mismatch, a failure or an unready machine
//! - any state -> `Idle` on a lesson change
//!
//! Runs are split into [`begin_run`](LessonController::begin_run) and
//! [`complete_run`](LessonController::complete_run) so that the command can
//! execute while nothing else is borrowed or locked.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use shelltutor_vm::{CommandRunner, ConsoleSink, ExecutionResult, VmError, VmSession};
use tracing::{debug, info, warn};

use crate::catalog::{Lesson, LessonCatalog};
use crate::error::{Result, TutorError};
use crate::evaluator::evaluate;

// ============================================================================
// RunStatus
// ============================================================================

/// Run status derived from [`LessonRunState`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Waiting for the learner.
    #[default]
    Idle,
    /// A command is executing.
    Running,
    /// The last run satisfied the lesson.
    Succeeded,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
        }
    }
}

// ============================================================================
// LessonRunState
// ============================================================================

/// Everything the presentation layer shows about the current lesson.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LessonRunState {
    /// Index of the active lesson; always valid for the catalog.
    pub active_lesson_index: usize,
    /// Command text the next run will execute.
    pub editable_command_text: String,
    /// Whether a command is in flight.
    pub is_running: bool,
    /// Whether the last run on this lesson passed.
    pub last_success: bool,
    /// Whether the console is shown.
    pub console_visible: bool,
    /// Trimmed output of the last run on this lesson.
    pub last_output: String,
    /// Whether the assistant overlay is shown.
    pub assistant_visible: bool,
}

impl LessonRunState {
    fn for_lesson(lesson: &Lesson) -> Self {
        Self {
            active_lesson_index: lesson.index,
            editable_command_text: lesson.starter_command.clone(),
            is_running: false,
            last_success: false,
            console_visible: true,
            last_output: String::new(),
            assistant_visible: false,
        }
    }

    /// Current run status.
    ///
    /// # Examples
    ///
    /// ```
    /// use shelltutor_runtime::{LessonCatalog, LessonController, RunStatus};
    /// # use std::sync::Arc;
    /// # use shelltutor_vm::{DeviceStack, ScriptedBackend, VmSession};
    /// # let session = Arc::new(VmSession::new(
    /// #     Arc::new(ScriptedBackend::new()),
    /// #     DeviceStack::new("debian:bookworm-slim"),
    /// # ));
    ///
    /// let controller = LessonController::new(LessonCatalog::builtin(), session, 0).unwrap();
    /// assert_eq!(controller.state().status(), RunStatus::Idle);
    /// ```
    #[must_use]
    pub const fn status(&self) -> RunStatus {
        if self.is_running {
            RunStatus::Running
        } else if self.last_success {
            RunStatus::Succeeded
        } else {
            RunStatus::Idle
        }
    }
}

// ============================================================================
// Runs
// ============================================================================

/// A run that has started and still has to execute.
///
/// Carries everything needed to execute without touching the controller.
#[derive(Debug, Clone)]
pub struct PendingRun {
    lesson_index: usize,
    command: String,
    generation: u64,
    runner: CommandRunner,
    session: Arc<VmSession>,
}

impl PendingRun {
    /// Lesson the run was started on.
    #[must_use]
    pub const fn lesson_index(&self) -> usize {
        self.lesson_index
    }

    /// Command text being executed.
    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Executes the command on the machine.
    pub async fn execute(&self) -> std::result::Result<Option<ExecutionResult>, VmError> {
        self.runner.run(&self.session, &self.command).await
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Output was captured and evaluated; `success` is filled in.
    Evaluated(ExecutionResult),
    /// The machine was not ready, nothing executed.
    NoResult,
    /// Execution failed; state is as if the run never happened.
    Failed(String),
    /// The lesson changed while the command ran; the result was dropped.
    Stale,
    /// The run was not started.
    Ignored,
}

impl RunOutcome {
    /// Returns whether the run passed.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Evaluated(result) if result.success)
    }
}

// ============================================================================
// LessonController
// ============================================================================

/// Lesson progression state machine.
#[derive(Debug)]
pub struct LessonController {
    catalog: LessonCatalog,
    session: Arc<VmSession>,
    runner: CommandRunner,
    console: ConsoleSink,
    state: LessonRunState,
    generation: u64,
}

impl LessonController {
    /// Creates a controller on lesson `start_lesson`.
    ///
    /// A fresh console sink is created and bound to `session`.
    ///
    /// # Errors
    ///
    /// Returns `TutorError::LessonOutOfRange` if `start_lesson` is not in the
    /// catalog.
    pub fn new(
        catalog: LessonCatalog,
        session: Arc<VmSession>,
        start_lesson: usize,
    ) -> Result<Self> {
        let state = catalog
            .get(start_lesson)
            .map(LessonRunState::for_lesson)
            .ok_or_else(|| TutorError::lesson_out_of_range(start_lesson, catalog.count()))?;

        let console = ConsoleSink::new();
        session.bind_console(console.clone());

        Ok(Self {
            catalog,
            session,
            runner: CommandRunner::default(),
            console,
            state,
            generation: 0,
        })
    }

    /// Replaces the command runner.
    #[must_use]
    pub fn with_runner(mut self, runner: CommandRunner) -> Self {
        self.runner = runner;
        self
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> &LessonRunState {
        &self.state
    }

    /// The lesson catalog.
    #[must_use]
    pub const fn catalog(&self) -> &LessonCatalog {
        &self.catalog
    }

    /// The active lesson.
    #[must_use]
    pub fn active_lesson(&self) -> &Lesson {
        // The active index is only ever set from a catalog lookup.
        &self.catalog.lessons()[self.state.active_lesson_index]
    }

    /// The machine session.
    #[must_use]
    pub const fn session(&self) -> &Arc<VmSession> {
        &self.session
    }

    /// The console sink owned by this controller.
    #[must_use]
    pub const fn console(&self) -> &ConsoleSink {
        &self.console
    }

    /// Whether a next lesson can be unlocked.
    #[must_use]
    pub fn can_advance(&self) -> bool {
        self.state.last_success && self.catalog.next(self.state.active_lesson_index).is_some()
    }

    /// Makes `index` the active lesson.
    ///
    /// Resets the command text to the lesson's starter command and clears the
    /// last success and output. A run in flight keeps `is_running` until it
    /// resolves, but its result is dropped.
    ///
    /// # Errors
    ///
    /// Returns `TutorError::LessonOutOfRange` and leaves the state untouched
    /// if `index` is not in the catalog.
    pub fn select_lesson(&mut self, index: usize) -> Result<&Lesson> {
        let lesson = self
            .catalog
            .get(index)
            .ok_or_else(|| TutorError::lesson_out_of_range(index, self.catalog.count()))?;

        self.generation += 1;
        self.state.active_lesson_index = index;
        self.state.editable_command_text = lesson.starter_command.clone();
        self.state.last_success = false;
        self.state.last_output.clear();

        info!(lesson = index, title = %lesson.title, "Lesson selected");
        Ok(lesson)
    }

    /// Replaces the command text. Ignored while running.
    pub fn edit_command(&mut self, text: impl Into<String>) -> bool {
        if self.state.is_running {
            debug!("Edit ignored while a command is running");
            return false;
        }
        self.state.editable_command_text = text.into();
        true
    }

    /// Puts the active lesson's starter command back. Ignored while running.
    pub fn reset_command(&mut self) -> bool {
        let starter = self.active_lesson().starter_command.clone();
        self.edit_command(starter)
    }

    /// Starts a run of the current command text.
    ///
    /// Returns `None` without changing anything while a run is in flight or
    /// when the machine is not ready.
    pub fn begin_run(&mut self) -> Option<PendingRun> {
        if self.state.is_running {
            debug!("Run ignored, a command is already running");
            return None;
        }
        if !self.session.is_ready() {
            debug!(readiness = %self.session.readiness(), "Run ignored, machine not ready");
            return None;
        }

        self.state.is_running = true;
        self.state.last_success = false;

        info!(
            lesson = self.state.active_lesson_index,
            command = %self.state.editable_command_text,
            "Run started"
        );
        Some(PendingRun {
            lesson_index: self.state.active_lesson_index,
            command: self.state.editable_command_text.clone(),
            generation: self.generation,
            runner: self.runner.clone(),
            session: Arc::clone(&self.session),
        })
    }

    /// Applies the result of `pending`.
    ///
    /// `is_running` is cleared on every path.
    pub fn complete_run(
        &mut self,
        pending: PendingRun,
        result: std::result::Result<Option<ExecutionResult>, VmError>,
    ) -> RunOutcome {
        self.state.is_running = false;

        if pending.generation != self.generation {
            debug!(
                lesson = pending.lesson_index,
                "Lesson changed during run, discarding result"
            );
            return RunOutcome::Stale;
        }

        match result {
            Ok(Some(mut result)) => {
                let expected = &self.active_lesson().expected_output;
                result.success = evaluate(&result.raw_output, expected);
                self.state.last_output.clone_from(&result.raw_output);
                self.state.last_success = result.success;
                info!(
                    lesson = pending.lesson_index,
                    success = result.success,
                    "Run finished"
                );
                RunOutcome::Evaluated(result)
            }
            Ok(None) => {
                debug!("Run produced no result");
                RunOutcome::NoResult
            }
            Err(e) => {
                warn!(lesson = pending.lesson_index, error = %e, "Command execution failed");
                RunOutcome::Failed(e.to_string())
            }
        }
    }

    /// Runs the current command to completion.
    pub async fn run(&mut self) -> RunOutcome {
        let Some(pending) = self.begin_run() else {
            return RunOutcome::Ignored;
        };
        let result = pending.execute().await;
        self.complete_run(pending, result)
    }

    /// Moves to the next lesson after a successful run.
    ///
    /// Returns the new lesson, or `None` (and changes nothing) when the last
    /// run did not pass or this is the last lesson.
    pub fn advance(&mut self) -> Option<&Lesson> {
        if !self.state.last_success {
            debug!("Advance ignored, lesson not passed");
            return None;
        }
        let Some(next) = self.catalog.next(self.state.active_lesson_index) else {
            debug!("Advance ignored, already on the last lesson");
            return None;
        };
        self.select_lesson(next).ok()
    }

    /// Shows or hides the console and returns the new visibility.
    ///
    /// Showing it re-binds the same sink, so its contents survive.
    pub fn toggle_console_visibility(&mut self) -> bool {
        self.state.console_visible = !self.state.console_visible;
        if self.state.console_visible {
            self.session.bind_console(self.console.clone());
        }
        debug!(visible = self.state.console_visible, "Console toggled");
        self.state.console_visible
    }

    /// Shows or hides the assistant overlay and returns the new visibility.
    pub fn toggle_assistant(&mut self) -> bool {
        self.state.assistant_visible = !self.state.assistant_visible;
        debug!(visible = self.state.assistant_visible, "Assistant toggled");
        self.state.assistant_visible
    }
}

// ============================================================================
// Tests
// ============================================================================
