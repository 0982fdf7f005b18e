//! In-memory machine backend driven by canned replies.
//!
//! [`ScriptedBackend`] answers each shell command from a table keyed by the
//! command text, so lessons can be exercised without a container engine.
//! Replies can be built in code or loaded from a JSON scenario file:
//!
//! ```json
//! {
//!   "echo \"Hello, World!\"": { "stdout": "Hello, World!\n" },
//!   "cat missing": { "stderr": "cat: missing: No such file or directory\n", "exitCode": 1 }
//! }
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    ConsoleSink, ConsoleStream, DeviceStack, ExecRequest, MachineBackend, MachineHandle, VmError,
};

/// Canned result for one command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScriptedReply {
    /// Text written to standard output.
    pub stdout: String,
    /// Text written to standard error.
    pub stderr: String,
    /// Exit code reported for the command.
    pub exit_code: i64,
    /// Simulated run time in milliseconds.
    pub delay_ms: u64,
    /// Fail the execution call itself instead of producing output.
    pub fail: bool,
}

impl ScriptedReply {
    /// Successful reply printing `text` on stdout.
    #[must_use]
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            stdout: text.into(),
            ..Self::default()
        }
    }

    /// Reply printing `text` on stderr with `exit_code`.
    #[must_use]
    pub fn stderr(text: impl Into<String>, exit_code: i64) -> Self {
        Self {
            stderr: text.into(),
            exit_code,
            ..Self::default()
        }
    }

    /// Reply whose execution call fails.
    #[must_use]
    pub fn failure() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Delays the reply by `delay`.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }
}

/// A [`MachineBackend`] that never leaves the process.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    replies: HashMap<String, ScriptedReply>,
    connect_error: Mutex<Option<String>>,
    boot_delay: Duration,
    executed: Mutex<Vec<ExecRequest>>,
    provisions: AtomicUsize,
    teardowns: AtomicUsize,
}

impl ScriptedBackend {
    /// Backend with no canned replies.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads replies from a JSON scenario file.
    pub fn from_file(path: &Path) -> Result<Self, VmError> {
        let content = std::fs::read_to_string(path)?;
        let replies: HashMap<String, ScriptedReply> = serde_json::from_str(&content)
            .map_err(|e| VmError::InvalidScenario(e.to_string()))?;
        Ok(Self {
            replies,
            ..Self::default()
        })
    }

    /// Adds a reply for `command`.
    #[must_use]
    pub fn with_reply(mut self, command: impl Into<String>, reply: ScriptedReply) -> Self {
        self.replies.insert(command.into(), reply);
        self
    }

    /// Makes `connect` fail with `message` until [`recover`](Self::recover).
    #[must_use]
    pub fn failing_connect(self, message: impl Into<String>) -> Self {
        *self.connect_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(message.into());
        self
    }

    /// Makes provisioning take `delay`.
    #[must_use]
    pub const fn with_boot_delay(mut self, delay: Duration) -> Self {
        self.boot_delay = delay;
        self
    }

    /// Clears a connect failure.
    pub fn recover(&self) {
        *self.connect_error.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Commands executed so far, oldest first.
    #[must_use]
    pub fn executed(&self) -> Vec<ExecRequest> {
        self.executed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of machines provisioned.
    #[must_use]
    pub fn provision_count(&self) -> usize {
        self.provisions.load(Ordering::SeqCst)
    }

    /// Number of machines torn down.
    #[must_use]
    pub fn teardown_count(&self) -> usize {
        self.teardowns.load(Ordering::SeqCst)
    }

    fn reply_for(&self, request: &ExecRequest) -> ScriptedReply {
        let command = request.args.last().map_or("", String::as_str);
        self.replies.get(command).cloned().unwrap_or_else(|| {
            let name = command.split_whitespace().next().unwrap_or(command);
            ScriptedReply::stderr(format!("bash: {name}: command not found\n"), 127)
        })
    }
}

#[async_trait]
impl MachineBackend for ScriptedBackend {
    async fn connect(&self, _stack: &DeviceStack) -> Result<(), VmError> {
        let error = self
            .connect_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        error.map_or(Ok(()), |message| Err(VmError::ServiceUnavailable(message)))
    }

    async fn provision(&self, stack: &DeviceStack) -> Result<MachineHandle, VmError> {
        if !self.boot_delay.is_zero() {
            tokio::time::sleep(self.boot_delay).await;
        }
        let image = stack.image().unwrap_or_default();
        let count = self.provisions.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(count, "Scripted machine provisioned");
        Ok(MachineHandle::new(
            format!("scripted-{count}"),
            "scripted",
            image,
        ))
    }

    async fn execute(
        &self,
        _machine: &MachineHandle,
        request: &ExecRequest,
        console: &ConsoleSink,
    ) -> Result<Option<i64>, VmError> {
        self.executed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());

        let reply = self.reply_for(request);
        if reply.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(reply.delay_ms)).await;
        }
        if reply.fail {
            return Err(VmError::ExecFailed("scripted failure".to_string()));
        }

        console.write(ConsoleStream::Stdout, reply.stdout);
        console.write(ConsoleStream::Stderr, reply.stderr);
        Ok(Some(reply.exit_code))
    }

    async fn teardown(&self, _machine: &MachineHandle) -> Result<(), VmError> {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn unknown_command_reports_not_found() {
        let backend = ScriptedBackend::new();
        let reply = backend.reply_for(&ExecRequest::shell("/bin/bash", "frobnicate --all"));
        assert_eq!(reply.exit_code, 127);
        assert_eq!(reply.stderr, "bash: frobnicate: command not found\n");
    }

    #[test]
    fn reply_deserializes_with_defaults() {
        let reply: ScriptedReply = serde_json::from_str(r#"{"stdout":"hi"}"#).unwrap();
        assert_eq!(reply, ScriptedReply::stdout("hi"));
    }

    #[test]
    fn from_file_loads_replies() {
        let path = std::env::temp_dir().join(format!(
            "shelltutor-scenario-{}.json",
            std::process::id()
        ));
        let mut file = std::fs::File::create(&path).unwrap();
        write!(file, r#"{{"ls": {{"stdout": "a b\n"}}, "false": {{"exitCode": 1}}}}"#).unwrap();

        let backend = ScriptedBackend::from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(backend.replies.len(), 2);
        assert_eq!(backend.replies["false"].exit_code, 1);
    }

    #[tokio::test]
    async fn execute_writes_both_streams_and_records_request() {
        let backend = ScriptedBackend::new()
            .with_reply("cat x", ScriptedReply::stderr("cat: x: No such file\n", 1));
        let stack = DeviceStack::new("alpine:latest");
        let machine = backend.provision(&stack).await.unwrap();
        let console = ConsoleSink::new();

        let code = backend
            .execute(&machine, &ExecRequest::shell("/bin/bash", "cat x"), &console)
            .await
            .unwrap();

        assert_eq!(code, Some(1));
        assert_eq!(console.contents(), "cat: x: No such file\n");
        assert_eq!(backend.executed().len(), 1);
    }
}
