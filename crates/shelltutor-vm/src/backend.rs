//! Boundary to the service that actually runs the lesson machine.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ConsoleSink, DeviceStack, VmError};

/// A machine that has been brought up by a [`MachineBackend`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineHandle {
    /// Identifier assigned by the backend.
    pub id: String,
    /// Human-readable machine name.
    pub name: String,
    /// Image the root overlay is layered on.
    pub image: String,
    /// When the machine finished booting.
    pub started_at: DateTime<Utc>,
}

impl MachineHandle {
    /// Creates a handle stamped with the current time.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            image: image.into(),
            started_at: Utc::now(),
        }
    }
}

/// A single program invocation inside the machine.
///
/// # Example
///
/// ```
/// use shelltutor_vm::ExecRequest;
///
/// let request = ExecRequest::shell("/bin/bash", "ls -la")
///     .with_env("PATH", "/usr/bin:/bin")
///     .with_cwd("/app");
///
/// assert_eq!(request.argv(), vec!["/bin/bash", "-c", "ls -la"]);
/// assert_eq!(request.env, vec!["PATH=/usr/bin:/bin"]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecRequest {
    /// Absolute path of the program to run.
    pub program: String,
    /// Arguments after the program name.
    pub args: Vec<String>,
    /// Environment as `KEY=VALUE` strings.
    pub env: Vec<String>,
    /// Working directory inside the machine.
    pub cwd: String,
}

impl ExecRequest {
    /// Runs `command` as one `-c` invocation of `shell`.
    #[must_use]
    pub fn shell(shell: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            program: shell.into(),
            args: vec!["-c".to_string(), command.into()],
            env: Vec::new(),
            cwd: "/".to_string(),
        }
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.env.push(format!("{}={}", key.as_ref(), value.as_ref()));
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = cwd.into();
        self
    }

    /// Program followed by its arguments.
    #[must_use]
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

/// Asynchronous command-execution service hosting the lesson machine.
///
/// Implementations write everything the machine prints into the console sink
/// passed to [`execute`](Self::execute); the caller reads the sink once the
/// call resolves.
#[async_trait]
pub trait MachineBackend: Send + Sync + std::fmt::Debug {
    /// Reaches the service and makes sure the stack's image can be used.
    async fn connect(&self, stack: &DeviceStack) -> Result<(), VmError>;

    /// Assembles the device stack and boots the machine.
    async fn provision(&self, stack: &DeviceStack) -> Result<MachineHandle, VmError>;

    /// Runs `request` to completion, streaming output into `console`.
    ///
    /// Returns the exit code when the service reports one.
    async fn execute(
        &self,
        machine: &MachineHandle,
        request: &ExecRequest,
        console: &ConsoleSink,
    ) -> Result<Option<i64>, VmError>;

    /// Shuts the machine down and releases it.
    async fn teardown(&self, machine: &MachineHandle) -> Result<(), VmError>;
}
