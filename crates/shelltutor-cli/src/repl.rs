//! Interactive terminal front end.

use std::io::Write;
use std::str::FromStr;

use shelltutor_runtime::{LessonController, RunOutcome};
use shelltutor_vm::Readiness;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::render;

// ============================================================================
// Commands
// ============================================================================

/// A parsed REPL line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplCommand {
    /// Blank line.
    Empty,
    /// Show the current lesson.
    Show,
    /// List the catalog.
    Lessons,
    /// Jump to a lesson by its 1-based number.
    Lesson(usize),
    /// Replace the command text.
    Edit(String),
    /// Restore the starter command.
    Reset,
    /// Run the command.
    Run,
    /// Advance after a pass.
    Next,
    /// Toggle the console.
    Console,
    /// Toggle the assistant.
    Tutor,
    /// Show status.
    Status,
    /// Retry machine bring-up.
    Boot,
    /// Show help.
    Help,
    /// Leave.
    Quit,
}

impl FromStr for ReplCommand {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (word, rest) = line
            .split_once(char::is_whitespace)
            .map_or((line, ""), |(w, r)| (w, r.trim()));

        let command = match word {
            "" => Self::Empty,
            "show" => Self::Show,
            "lessons" => Self::Lessons,
            "lesson" => {
                let number: usize = rest
                    .parse()
                    .map_err(|_| format!("'lesson' needs a lesson number, got '{rest}'"))?;
                Self::Lesson(number)
            }
            "edit" => {
                if rest.is_empty() {
                    return Err("'edit' needs the command to run, e.g. edit ls -la".to_string());
                }
                Self::Edit(rest.to_string())
            }
            "reset" => Self::Reset,
            "run" => Self::Run,
            "next" => Self::Next,
            "console" => Self::Console,
            "tutor" => Self::Tutor,
            "status" => Self::Status,
            "boot" => Self::Boot,
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            other => return Err(format!("Unknown command '{other}'. Type 'help' for commands.")),
        };
        Ok(command)
    }
}

// ============================================================================
// Repl
// ============================================================================

/// REPL session driving a [`LessonController`].
#[derive(Debug)]
pub struct Repl {
    controller: LessonController,
    assistant_url: String,
    boot: Option<JoinHandle<()>>,
}

impl Repl {
    /// Creates a REPL. `boot` is the machine bring-up already in flight.
    pub fn new(
        controller: LessonController,
        assistant_url: impl Into<String>,
        boot: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            controller,
            assistant_url: assistant_url.into(),
            boot,
        }
    }

    /// The controller.
    pub const fn controller(&self) -> &LessonController {
        &self.controller
    }

    /// Stops any bring-up still in flight and hands the controller back.
    pub fn finish(self) -> LessonController {
        if let Some(boot) = self.boot {
            boot.abort();
        }
        self.controller
    }

    fn show(&self) -> String {
        render::lesson(
            self.controller.active_lesson(),
            self.controller.catalog().count(),
            self.controller.state(),
        )
    }

    /// Applies one command and returns the text to print.
    pub async fn execute(&mut self, command: ReplCommand) -> String {
        debug!(?command, "REPL command");
        match command {
            ReplCommand::Empty | ReplCommand::Quit => String::new(),
            ReplCommand::Show => self.show(),
            ReplCommand::Lessons => render::lessons(
                self.controller.catalog(),
                self.controller.state().active_lesson_index,
            ),
            ReplCommand::Lesson(number) => {
                let index = number.checked_sub(1).unwrap_or(usize::MAX);
                if self.controller.select_lesson(index).is_ok() {
                    self.show()
                } else {
                    format!(
                        "There is no lesson {number}. Lessons go from 1 to {}.",
                        self.controller.catalog().count()
                    )
                }
            }
            ReplCommand::Edit(text) => {
                if self.controller.edit_command(text) {
                    format!("  $ {}", self.controller.state().editable_command_text)
                } else {
                    "A command is running.".to_string()
                }
            }
            ReplCommand::Reset => {
                self.controller.reset_command();
                format!("  $ {}", self.controller.state().editable_command_text)
            }
            ReplCommand::Run => self.run().await,
            ReplCommand::Next => {
                if self.controller.advance().is_some() {
                    self.show()
                } else if self.controller.state().last_success {
                    "You finished the last lesson.".to_string()
                } else {
                    "Pass this lesson first: type 'run'.".to_string()
                }
            }
            ReplCommand::Console => {
                if self.controller.toggle_console_visibility() {
                    let text = self.controller.console().contents();
                    let text = text.trim_end();
                    if text.is_empty() {
                        "Console shown.".to_string()
                    } else {
                        format!("Console shown.\n{text}")
                    }
                } else {
                    "Console hidden.".to_string()
                }
            }
            ReplCommand::Tutor => {
                if self.controller.toggle_assistant() {
                    format!("Assistant: {}", self.assistant_url)
                } else {
                    "Assistant hidden.".to_string()
                }
            }
            ReplCommand::Status => render::status(
                self.controller.state(),
                self.controller.session().readiness(),
                self.controller.catalog().count(),
            ),
            ReplCommand::Boot => self.boot(),
            ReplCommand::Help => render::HELP.to_string(),
        }
    }

    async fn run(&mut self) -> String {
        let readiness = self.controller.session().readiness();
        if !readiness.is_ready() {
            return format!("Nothing ran. {}", render::readiness(readiness));
        }

        let outcome = self.controller.run().await;
        let console = self
            .controller
            .state()
            .console_visible
            .then(|| self.controller.console().contents());
        if let RunOutcome::Evaluated(result) = &outcome {
            info!(
                success = result.success,
                duration_ms = result.duration_ms,
                "Command evaluated"
            );
        }
        render::outcome(&outcome, console.as_deref(), self.controller.can_advance())
    }

    fn boot(&mut self) -> String {
        let readiness = self.controller.session().readiness();
        if !readiness.can_initialize() {
            return render::readiness(readiness);
        }
        if let Some(previous) = self.boot.take() {
            previous.abort();
        }
        self.boot = Some(crate::spawn_boot(std::sync::Arc::clone(
            self.controller.session(),
        )));
        "Starting the lesson machine...".to_string()
    }

    /// Reads commands from `input` until `quit`, end of input or Ctrl-C,
    /// writing replies and readiness changes to `out`.
    pub async fn run_loop<R, W>(&mut self, input: R, out: &mut W) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: Write,
    {
        let mut lines = input.lines();
        let mut readiness = self.controller.session().subscribe_readiness();

        writeln!(out, "{}", self.show())?;
        writeln!(out, "{}", render::readiness(*readiness.borrow_and_update()))?;

        loop {
            write!(out, "> ")?;
            out.flush()?;

            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        writeln!(out)?;
                        break;
                    };
                    match line.parse::<ReplCommand>() {
                        Ok(ReplCommand::Quit) => break,
                        Ok(command) => {
                            let reply = self.execute(command).await;
                            if !reply.is_empty() {
                                writeln!(out, "{reply}")?;
                            }
                        }
                        Err(message) => writeln!(out, "{message}")?,
                    }
                }
                changed = readiness.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current: Readiness = *readiness.borrow_and_update();
                    writeln!(out, "\n{}", render::readiness(current))?;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C, leaving");
                    writeln!(out)?;
                    break;
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use shelltutor_runtime::LessonCatalog;
    use shelltutor_vm::{DeviceStack, ScriptedBackend, ScriptedReply, VmSession};

    use super::*;

    fn repl() -> Repl {
        let backend = ScriptedBackend::new()
            .with_reply(
                r#"echo "Hello, World!""#,
                ScriptedReply::stdout("Hello, World!\n"),
            )
            .with_reply("echo nope", ScriptedReply::stdout("nope\n"));
        let session = Arc::new(VmSession::new(
            Arc::new(backend),
            DeviceStack::new("debian:bookworm-slim"),
        ));
        let controller = LessonController::new(LessonCatalog::builtin(), session, 0).unwrap();
        Repl::new(controller, "http://127.0.0.1:5000/chat", None)
    }

    async fn booted() -> Repl {
        let repl = repl();
        repl.controller().session().initialize().await.unwrap();
        repl
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!("".parse::<ReplCommand>().unwrap(), ReplCommand::Empty);
        assert_eq!("  run ".parse::<ReplCommand>().unwrap(), ReplCommand::Run);
        assert_eq!(
            "lesson 3".parse::<ReplCommand>().unwrap(),
            ReplCommand::Lesson(3)
        );
        assert_eq!(
            "edit  ls -la  ".parse::<ReplCommand>().unwrap(),
            ReplCommand::Edit("ls -la".to_string())
        );
        assert_eq!("exit".parse::<ReplCommand>().unwrap(), ReplCommand::Quit);
    }

    #[test]
    fn test_parse_errors() {
        assert!("lesson".parse::<ReplCommand>().unwrap_err().contains("lesson number"));
        assert!("edit".parse::<ReplCommand>().is_err());
        assert!("dance"
            .parse::<ReplCommand>()
            .unwrap_err()
            .contains("Unknown command 'dance'"));
    }

    #[tokio::test]
    async fn test_run_before_boot_does_nothing() {
        let mut repl = repl();

        let reply = repl.execute(ReplCommand::Run).await;

        assert!(reply.starts_with("Nothing ran."));
        assert!(!repl.controller().state().is_running);
    }

    #[tokio::test]
    async fn test_run_pass_then_next() {
        let mut repl = booted().await;

        let reply = repl.execute(ReplCommand::Run).await;
        assert!(reply.contains("Hello, World!"));
        assert!(reply.contains("Correct!"));

        let reply = repl.execute(ReplCommand::Next).await;
        assert!(reply.starts_with("Lesson 2: Listing Files with ls (2/8)"));
        assert_eq!(repl.controller().state().editable_command_text, "ls -la");
    }

    #[tokio::test]
    async fn test_next_without_pass() {
        let mut repl = booted().await;
        repl.execute(ReplCommand::Edit("echo nope".into())).await;
        repl.execute(ReplCommand::Run).await;

        let reply = repl.execute(ReplCommand::Next).await;

        assert_eq!(reply, "Pass this lesson first: type 'run'.");
        assert_eq!(repl.controller().state().active_lesson_index, 0);
    }

    #[tokio::test]
    async fn test_lesson_numbers_are_one_based() {
        let mut repl = repl();

        let reply = repl.execute(ReplCommand::Lesson(8)).await;
        assert!(reply.starts_with("Lesson 8: Appending to Files"));

        let reply = repl.execute(ReplCommand::Lesson(0)).await;
        assert_eq!(reply, "There is no lesson 0. Lessons go from 1 to 8.");
        assert_eq!(repl.controller().state().active_lesson_index, 7);
    }

    #[tokio::test]
    async fn test_hidden_console_is_not_printed() {
        let mut repl = booted().await;
        assert_eq!(repl.execute(ReplCommand::Console).await, "Console hidden.");

        let reply = repl.execute(ReplCommand::Run).await;
        assert!(!reply.contains("Hello, World!\n"));
        assert!(reply.contains("Correct!"));

        let reply = repl.execute(ReplCommand::Console).await;
        assert_eq!(reply, "Console shown.\nHello, World!");
    }

    #[tokio::test]
    async fn test_tutor_toggle() {
        let mut repl = repl();
        assert_eq!(
            repl.execute(ReplCommand::Tutor).await,
            "Assistant: http://127.0.0.1:5000/chat"
        );
        assert_eq!(repl.execute(ReplCommand::Tutor).await, "Assistant hidden.");
    }

    #[tokio::test]
    async fn test_boot_command_brings_machine_up() {
        let mut repl = repl();
        let mut readiness = repl.controller().session().subscribe_readiness();

        assert_eq!(
            repl.execute(ReplCommand::Boot).await,
            "Starting the lesson machine..."
        );
        tokio::time::timeout(Duration::from_secs(2), readiness.wait_for(|r| r.is_ready()))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(repl.execute(ReplCommand::Boot).await, "machine: ready");
        repl.finish();
    }

    #[tokio::test]
    async fn test_run_loop_until_quit() {
        let mut repl = booted().await;
        let input: &[u8] = b"run\nnext\nquit\nrun\n";
        let mut out = Vec::new();

        repl.run_loop(input, &mut out).await.unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("Lesson 1: Introduction & Echo Command (1/8)"));
        assert!(text.contains("machine: ready"));
        assert!(text.contains("Correct!"));
        assert!(text.contains("Lesson 2: Listing Files with ls (2/8)"));
        assert_eq!(repl.controller().state().active_lesson_index, 1);
        assert!(!repl.controller().state().last_success);
    }
}
