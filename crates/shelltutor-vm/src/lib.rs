//! shelltutor machine sessions
//!
//! Owns the single lesson machine a learner types commands into: assembling its
//! device stack, binding the console sink that captures output, and dispatching
//! shell commands to it.
//!
//! The machine itself lives behind the [`MachineBackend`] trait. Production
//! builds use [`DockerBackend`], which realises the machine as a Docker
//! container through bollard; [`ScriptedBackend`] answers from canned replies
//! for offline runs and tests.

pub mod backend;
pub mod console;
pub mod devices;
pub mod docker;
pub mod runner;
pub mod scripted;
pub mod session;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use backend::{ExecRequest, MachineBackend, MachineHandle};
pub use console::{ConsoleChunk, ConsoleSink, ConsoleStream};
pub use devices::{Device, DeviceStack};
pub use docker::DockerBackend;
pub use runner::{CommandRunner, ExecutionResult};
pub use scripted::{ScriptedBackend, ScriptedReply};
pub use session::VmSession;

/// Errors that can occur while driving the lesson machine.
#[derive(Debug, Error)]
pub enum VmError {
    /// The execution service could not be reached.
    #[error("machine service unavailable: {0}")]
    ServiceUnavailable(String),

    /// The machine image is missing and could not be fetched.
    #[error("machine image not available: {image}")]
    ImageUnavailable {
        /// The image reference that was requested.
        image: String,
    },

    /// The device stack is malformed.
    #[error("invalid device stack: {0}")]
    InvalidDeviceStack(String),

    /// Assembling devices or booting the machine failed.
    #[error("failed to bring up machine: {0}")]
    ProvisionFailed(String),

    /// Running a command inside the machine failed.
    #[error("command execution failed: {0}")]
    ExecFailed(String),

    /// The command did not finish within the configured timeout.
    #[error("command timed out after {seconds}s")]
    ExecTimeout {
        /// The timeout that elapsed.
        seconds: u64,
    },

    /// No console sink was bound when output had to be captured.
    #[error("no console sink is bound to the session")]
    ConsoleNotBound,

    /// Stopping or removing the machine failed.
    #[error("failed to tear down machine: {0}")]
    TeardownFailed(String),

    /// The session is not in a state that allows the operation.
    #[error("invalid session state: expected {expected}, found {actual}")]
    InvalidState {
        /// The readiness the operation needs.
        expected: Readiness,
        /// The readiness the session is actually in.
        actual: Readiness,
    },

    /// A scripted scenario file could not be parsed.
    #[error("invalid scenario file: {0}")]
    InvalidScenario(String),

    /// Docker API error.
    #[error("docker API error: {0}")]
    DockerApi(#[from] bollard::errors::Error),

    /// Host filesystem error while preparing devices.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Lifecycle stage of a [`VmSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    /// Nothing has been started yet.
    #[default]
    Uninitialized,
    /// Connecting to the service or assembling the machine.
    Loading,
    /// The machine accepts commands.
    Ready,
    /// Bring-up failed; commands are ignored until a manual retry.
    Failed,
}

impl Readiness {
    /// Returns whether commands may be dispatched.
    #[must_use]
    pub const fn is_ready(self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Returns whether `initialize` would start a new bring-up.
    #[must_use]
    pub const fn can_initialize(self) -> bool {
        matches!(self, Self::Uninitialized | Self::Failed)
    }
}

impl std::fmt::Display for Readiness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Loading => write!(f, "loading"),
            Self::Ready => write!(f, "ready"),
            Self::Failed => write!(f, "failed"),
        }
    }
}
