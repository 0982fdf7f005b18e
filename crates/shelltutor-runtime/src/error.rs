//! Error types for the shelltutor runtime.
//!
//! This module defines the error hierarchy for configuration loading, lesson
//! catalog parsing, machine bring-up, and the presentation surfaces.

use std::path::PathBuf;

use shelltutor_vm::{Readiness, VmError};

/// A specialized `Result` type for shelltutor runtime operations.
pub type Result<T> = std::result::Result<T, TutorError>;

/// Errors that can occur while running lessons.
///
/// Variants are grouped by subsystem and include actionable suggestions
/// where possible to help users resolve issues.
#[derive(Debug, thiserror::Error)]
pub enum TutorError {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Invalid JSON syntax in configuration file.
    #[error("Invalid JSON in config file '{path}': {message}\n\nSuggestion: Validate your shelltutor.json with a JSON linter")]
    ConfigParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Description of the parse error.
        message: String,
    },

    /// Configuration validation failed.
    #[error("Invalid configuration: {message}\n\nSuggestion: {suggestion}")]
    ConfigValidationError {
        /// Description of the validation failure.
        message: String,
        /// Actionable suggestion for the user.
        suggestion: String,
    },

    // ========================================================================
    // Lesson Catalog Errors
    // ========================================================================
    /// Lesson file was not found at the specified path.
    #[error("Lesson file not found: '{path}'\n\nSuggestion: Check the 'lessons' field in shelltutor.json or pass --lessons")]
    LessonsNotFound {
        /// Path where the lesson file was expected.
        path: PathBuf,
    },

    /// Lesson file is not a valid JSON lesson list.
    #[error("Invalid lesson file '{path}': {message}\n\nSuggestion: The file must be a JSON array of {{title, description, starterCommand, expectedOutput}} objects")]
    LessonsParseError {
        /// Path to the lesson file.
        path: PathBuf,
        /// Description of the parse error.
        message: String,
    },

    /// A lesson record is unusable.
    #[error("Invalid lesson catalog: {message}\n\nSuggestion: Every lesson needs a title and a non-empty expected output")]
    InvalidLessons {
        /// What is wrong with the catalog.
        message: String,
    },

    /// A lesson index outside the catalog was requested.
    #[error("No lesson at index {index} (catalog has {count} lessons)")]
    LessonOutOfRange {
        /// The requested index.
        index: usize,
        /// Number of lessons in the catalog.
        count: usize,
    },

    // ========================================================================
    // Machine Errors
    // ========================================================================
    /// Docker daemon is not available or not running.
    #[error("Docker is required but not available: {message}\n\nSuggestion: Ensure Docker is installed and the daemon is running (try 'docker info')")]
    DockerNotAvailable {
        /// What the daemon connection reported.
        message: String,
    },

    /// The machine image was not found and could not be pulled.
    #[error("Machine image not found: '{image}'\n\nSuggestion: Pull the image first with 'docker pull {image}' or set machine.pullImage to true")]
    ImageNotFound {
        /// Name of the missing image.
        image: String,
    },

    /// The lesson machine is not accepting commands.
    #[error("Lesson machine is {readiness}\n\nSuggestion: Wait for the machine to boot, or run 'boot' to retry after a failure")]
    MachineNotReady {
        /// Current readiness.
        readiness: Readiness,
    },

    /// Any other machine failure.
    #[error("Lesson machine error: {0}")]
    Machine(VmError),

    // ========================================================================
    // General I/O Errors
    // ========================================================================
    /// General I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<VmError> for TutorError {
    fn from(error: VmError) -> Self {
        match error {
            VmError::ServiceUnavailable(message) => Self::DockerNotAvailable { message },
            VmError::ImageUnavailable { image } => Self::ImageNotFound { image },
            VmError::InvalidState { actual, .. } => Self::MachineNotReady { readiness: actual },
            other => Self::Machine(other),
        }
    }
}

impl TutorError {
    /// Creates a new `ConfigParseError` with the given path and message.
    #[must_use]
    pub fn config_parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::ConfigParseError {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates a new `ConfigValidationError` with the given message and suggestion.
    #[must_use]
    pub fn config_validation(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::ConfigValidationError {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Creates a new `LessonsNotFound` error.
    #[must_use]
    pub fn lessons_not_found(path: impl Into<PathBuf>) -> Self {
        Self::LessonsNotFound { path: path.into() }
    }

    /// Creates a new `LessonsParseError`.
    #[must_use]
    pub fn lessons_parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::LessonsParseError {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates a new `InvalidLessons` error.
    #[must_use]
    pub fn invalid_lessons(message: impl Into<String>) -> Self {
        Self::InvalidLessons {
            message: message.into(),
        }
    }

    /// Creates a new `LessonOutOfRange` error.
    #[must_use]
    pub const fn lesson_out_of_range(index: usize, count: usize) -> Self {
        Self::LessonOutOfRange { index, count }
    }

    /// Returns `true` if this error is transient and the action may be retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::MachineNotReady { .. }
                | Self::Machine(VmError::ExecFailed(_) | VmError::ExecTimeout { .. })
        )
    }

    /// Returns `true` if this error is fatal and requires immediate termination.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConfigParseError { .. }
                | Self::ConfigValidationError { .. }
                | Self::LessonsNotFound { .. }
                | Self::LessonsParseError { .. }
                | Self::InvalidLessons { .. }
                | Self::DockerNotAvailable { .. }
                | Self::ImageNotFound { .. }
        )
    }
}
