//! Plain-text rendering for the REPL.

use std::fmt::Write;

use shelltutor_runtime::{Lesson, LessonCatalog, LessonRunState, RunOutcome, RunStatus};
use shelltutor_vm::Readiness;

/// REPL command reference.
pub const HELP: &str = "\
Commands:
  show            Show the current lesson
  lessons         List all lessons
  lesson <n>      Jump to lesson n
  edit <command>  Replace the command to run
  reset           Restore the lesson's starter command
  run             Run the command on the lesson machine
  next            Go to the next lesson after passing this one
  console         Show or hide console output
  tutor           Show or hide the assistant
  status          Show machine and lesson status
  boot            Retry starting the lesson machine
  help            Show this help
  quit            Leave shelltutor";

/// The active lesson with its command.
pub fn lesson(lesson: &Lesson, count: usize, state: &LessonRunState) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{} ({}/{count})", lesson.title, lesson.index + 1);
    let _ = writeln!(out);
    for line in lesson.description.lines() {
        if line.is_empty() {
            let _ = writeln!(out);
        } else {
            let _ = writeln!(out, "  {line}");
        }
    }
    let _ = writeln!(out);
    let _ = write!(out, "  $ {}", state.editable_command_text);
    out
}

/// The whole catalog, marking the active lesson.
pub fn lessons(catalog: &LessonCatalog, active: usize) -> String {
    catalog
        .lessons()
        .iter()
        .map(|l| {
            let marker = if l.index == active { '>' } else { ' ' };
            format!("{marker} {:>2}. {}", l.index + 1, l.title)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// One-line machine readiness.
pub fn readiness(readiness: Readiness) -> String {
    match readiness {
        Readiness::Uninitialized => "machine: not started".to_string(),
        Readiness::Loading => "machine: booting...".to_string(),
        Readiness::Ready => "machine: ready".to_string(),
        Readiness::Failed => "machine: failed to start (type 'boot' to retry)".to_string(),
    }
}

/// Machine and lesson status block.
pub fn status(state: &LessonRunState, machine: Readiness, count: usize) -> String {
    let run = match state.status() {
        RunStatus::Idle => "idle",
        RunStatus::Running => "running",
        RunStatus::Succeeded => "passed",
    };
    let on_off = |flag: bool| if flag { "shown" } else { "hidden" };
    format!(
        "{}\nlesson: {}/{count}\nrun: {run}\nconsole: {}\nassistant: {}",
        readiness(machine),
        state.active_lesson_index + 1,
        on_off(state.console_visible),
        on_off(state.assistant_visible),
    )
}

/// Result of a run. `console` is the captured text when the console is shown.
pub fn outcome(outcome: &RunOutcome, console: Option<&str>, can_advance: bool) -> String {
    let mut out = String::new();
    if let (Some(text), RunOutcome::Evaluated(_)) = (console, outcome) {
        let text = text.trim_end();
        if !text.is_empty() {
            let _ = writeln!(out, "{text}");
        }
    }
    match outcome {
        RunOutcome::Evaluated(result) if result.success => {
            out.push_str("✓ Correct!");
            if can_advance {
                out.push_str(" Type 'next' to continue.");
            } else {
                out.push_str(" That was the last lesson.");
            }
        }
        RunOutcome::Evaluated(_) => {
            out.push_str("✗ Not quite. Compare the output with what the lesson asks for.");
        }
        RunOutcome::NoResult | RunOutcome::Ignored => {
            out.push_str("Nothing ran. The machine is not ready yet.");
        }
        RunOutcome::Failed(message) => {
            let _ = write!(out, "Command failed: {message}");
        }
        RunOutcome::Stale => out.push_str("The lesson changed while the command ran."),
    }
    out
}
