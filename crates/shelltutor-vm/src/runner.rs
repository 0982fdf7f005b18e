//! Dispatching learner commands to the lesson machine.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::{ExecRequest, VmError, VmSession};

/// Default shell used for `-c` invocations.
pub const DEFAULT_SHELL: &str = "/bin/bash";

/// Default working directory inside the machine.
pub const DEFAULT_WORKING_DIR: &str = "/app";

/// Default `PATH` given to commands.
pub const DEFAULT_SEARCH_PATH: &str = "/usr/bin:/bin";

/// Default limit on a single command.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Captured outcome of one command.
///
/// `success` is always `false` when produced by [`CommandRunner::run`]; the
/// caller classifies the output and fills it in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Console text with surrounding whitespace trimmed.
    pub raw_output: String,
    /// Whether the output satisfied the lesson.
    pub success: bool,
    /// Exit code reported by the machine.
    pub exit_code: Option<i64>,
    /// Wall-clock run time in milliseconds.
    pub duration_ms: u64,
    /// When the command finished.
    pub finished_at: DateTime<Utc>,
}

/// Sends shell commands to a [`VmSession`].
///
/// A runner never guards against overlapping calls; callers keep a single
/// command in flight.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use shelltutor_vm::CommandRunner;
///
/// let runner = CommandRunner::default().with_timeout(Duration::from_secs(5));
/// let request = runner.request("ls -la");
///
/// assert_eq!(request.argv(), vec!["/bin/bash", "-c", "ls -la"]);
/// assert_eq!(request.cwd, "/app");
/// assert_eq!(request.env, vec!["PATH=/usr/bin:/bin"]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRunner {
    shell: String,
    working_dir: String,
    search_path: String,
    timeout: Duration,
}

impl Default for CommandRunner {
    fn default() -> Self {
        Self {
            shell: DEFAULT_SHELL.to_string(),
            working_dir: DEFAULT_WORKING_DIR.to_string(),
            search_path: DEFAULT_SEARCH_PATH.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl CommandRunner {
    /// Sets the shell.
    #[must_use]
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = dir.into();
        self
    }

    /// Sets the `PATH` value.
    #[must_use]
    pub fn with_search_path(mut self, path: impl Into<String>) -> Self {
        self.search_path = path.into();
        self
    }

    /// Sets the per-command timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The per-command timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Builds the exec request for `command`.
    #[must_use]
    pub fn request(&self, command: &str) -> ExecRequest {
        ExecRequest::shell(&self.shell, command)
            .with_env("PATH", &self.search_path)
            .with_cwd(&self.working_dir)
    }

    /// Runs `command` and returns the trimmed console text.
    ///
    /// Resolves to `Ok(None)` without touching anything when the session is
    /// not ready. Otherwise the bound console is cleared, the command is run
    /// to completion, and the console is read back.
    ///
    /// # Errors
    ///
    /// Fails when no console is bound, when the machine rejects the call, or
    /// when the command outlives the timeout.
    #[instrument(skip(self, session))]
    pub async fn run(
        &self,
        session: &VmSession,
        command: &str,
    ) -> Result<Option<ExecutionResult>, VmError> {
        if !session.is_ready() {
            debug!(readiness = %session.readiness(), "Machine not ready, ignoring run");
            return Ok(None);
        }

        let console = session.console().ok_or(VmError::ConsoleNotBound)?;
        console.clear();

        let request = self.request(command);
        let started = Instant::now();
        let exit_code = tokio::time::timeout(self.timeout, session.execute(&request))
            .await
            .map_err(|_| {
                warn!(timeout_secs = self.timeout.as_secs(), "Command timed out");
                VmError::ExecTimeout {
                    seconds: self.timeout.as_secs(),
                }
            })??;
        let elapsed = started.elapsed();

        let raw_output = console.contents().trim().to_string();
        info!(
            exit_code = ?exit_code,
            duration_ms = elapsed.as_millis(),
            output_len = raw_output.len(),
            "Command finished"
        );

        Ok(Some(ExecutionResult {
            raw_output,
            success: false,
            exit_code,
            duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            finished_at: Utc::now(),
        }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{ConsoleSink, ConsoleStream, DeviceStack, ScriptedBackend, ScriptedReply};
    use std::sync::Arc;

    async fn ready_session(
        backend: ScriptedBackend,
    ) -> (Arc<ScriptedBackend>, VmSession, ConsoleSink) {
        let backend = Arc::new(backend);
        let session = VmSession::new(backend.clone(), DeviceStack::new("alpine:latest"));
        let sink = ConsoleSink::new();
        session.bind_console(sink.clone());
        session.initialize().await.unwrap();
        (backend, session, sink)
    }

    #[tokio::test]
    async fn run_before_ready_is_a_noop() {
        let backend = Arc::new(ScriptedBackend::new());
        let session = VmSession::new(backend.clone(), DeviceStack::new("alpine:latest"));
        let sink = ConsoleSink::new();
        sink.write(ConsoleStream::Stdout, "left over");
        session.bind_console(sink.clone());

        let result = CommandRunner::default().run(&session, "ls").await.unwrap();

        assert!(result.is_none());
        assert!(backend.executed().is_empty());
        assert_eq!(sink.contents(), "left over");
    }

    #[tokio::test]
    async fn run_trims_captured_output() {
        let backend = ScriptedBackend::new().with_reply(
            r#"echo "Hello, World!""#,
            ScriptedReply::stdout("\n  Hello, World!\n"),
        );
        let (_, session, _) = ready_session(backend).await;

        let result = CommandRunner::default()
            .run(&session, r#"echo "Hello, World!""#)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(result.raw_output, "Hello, World!");
        assert!(!result.success);
        assert_eq!(result.exit_code, Some(0));
    }

    #[tokio::test]
    async fn run_clears_previous_output() {
        let backend = ScriptedBackend::new().with_reply("pwd", ScriptedReply::stdout("/app\n"));
        let (_, session, sink) = ready_session(backend).await;
        sink.write(ConsoleStream::Stdout, "stale output\n");

        let result = CommandRunner::default()
            .run(&session, "pwd")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(result.raw_output, "/app");
    }

    #[tokio::test]
    async fn run_passes_shell_cwd_and_path() {
        let (backend, session, _) = ready_session(ScriptedBackend::new()).await;
        let runner = CommandRunner::default()
            .with_shell("/bin/sh")
            .with_working_dir("/work")
            .with_search_path("/bin");

        runner.run(&session, "mkdir testdir && ls").await.unwrap();

        let executed = backend.executed();
        assert_eq!(executed.len(), 1);
        assert_eq!(executed[0].argv(), vec!["/bin/sh", "-c", "mkdir testdir && ls"]);
        assert_eq!(executed[0].cwd, "/work");
        assert_eq!(executed[0].env, vec!["PATH=/bin"]);
    }

    #[tokio::test]
    async fn stderr_is_captured() {
        let (_, session, _) = ready_session(ScriptedBackend::new()).await;

        let result = CommandRunner::default()
            .run(&session, "nosuchcmd")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(result.raw_output, "bash: nosuchcmd: command not found");
        assert_eq!(result.exit_code, Some(127));
    }

    #[tokio::test]
    async fn execution_failure_is_returned() {
        let backend = ScriptedBackend::new().with_reply("boom", ScriptedReply::failure());
        let (_, session, _) = ready_session(backend).await;

        let err = CommandRunner::default().run(&session, "boom").await.unwrap_err();

        assert!(matches!(err, VmError::ExecFailed(_)));
    }

    #[tokio::test]
    async fn missing_console_is_an_error() {
        let backend = Arc::new(ScriptedBackend::new());
        let session = VmSession::new(backend, DeviceStack::new("alpine:latest"));
        session.initialize().await.unwrap();

        let err = CommandRunner::default().run(&session, "ls").await.unwrap_err();

        assert!(matches!(err, VmError::ConsoleNotBound));
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let backend = ScriptedBackend::new().with_reply(
            "sleep 10",
            ScriptedReply::stdout("").with_delay(Duration::from_secs(10)),
        );
        let (_, session, _) = ready_session(backend).await;
        let runner = CommandRunner::default().with_timeout(Duration::from_millis(50));

        let err = runner.run(&session, "sleep 10").await.unwrap_err();

        assert!(matches!(err, VmError::ExecTimeout { .. }));
    }
}
