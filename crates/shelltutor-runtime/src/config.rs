//! Configuration types for shelltutor.
//!
//! Configuration lives in `shelltutor.json` (camelCase keys). Every field has
//! a default, so the file is optional and may set only what it needs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shelltutor_vm::{CommandRunner, DeviceStack};

use crate::error::{Result, TutorError};

/// The default config file name.
const CONFIG_FILE_NAME: &str = "shelltutor.json";

/// Default assistant overlay address.
fn default_assistant_url() -> String {
    "http://127.0.0.1:5000/chat".to_string()
}

/// Default machine image.
fn default_image() -> String {
    "debian:bookworm-slim".to_string()
}

/// Default machine container name.
fn default_machine_name() -> String {
    "shelltutor-vm".to_string()
}

fn default_shell() -> String {
    shelltutor_vm::runner::DEFAULT_SHELL.to_string()
}

fn default_working_dir() -> String {
    shelltutor_vm::runner::DEFAULT_WORKING_DIR.to_string()
}

fn default_search_path() -> String {
    shelltutor_vm::runner::DEFAULT_SEARCH_PATH.to_string()
}

/// Default host directory backing the working directory.
fn default_host_work_dir() -> String {
    ".shelltutor/app".to_string()
}

fn default_cache_volume() -> String {
    "shelltutor-cache".to_string()
}

fn default_cache_path() -> String {
    "/var/cache/shelltutor".to_string()
}

fn default_scratch_path() -> String {
    "/data".to_string()
}

const fn default_scratch_size_mb() -> u32 {
    64
}

/// Default per-command timeout in seconds.
const fn default_command_timeout() -> u64 {
    30
}

/// Default value for boolean options that default to true.
const fn default_true() -> bool {
    true
}

/// Main configuration for shelltutor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Lesson file replacing the built-in course.
    #[serde(default)]
    pub lessons: Option<String>,

    /// Lesson selected at startup.
    #[serde(default)]
    pub start_lesson: usize,

    /// Address of the assistant overlay.
    #[serde(default = "default_assistant_url")]
    pub assistant_url: String,

    /// Lesson machine settings.
    #[serde(default)]
    pub machine: MachineConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lessons: None,
            start_lesson: 0,
            assistant_url: default_assistant_url(),
            machine: MachineConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration from the current working directory.
    ///
    /// Looks for `shelltutor.json` in the current directory. If not found,
    /// returns the default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but contains invalid JSON.
    pub fn load() -> Result<Self> {
        let current_dir = std::env::current_dir().map_err(|e| {
            TutorError::config_parse(
                "<current directory>",
                format!("cannot determine current directory: {e}"),
            )
        })?;
        Self::load_from_dir(&current_dir)
    }

    /// Loads configuration from a specific directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but contains invalid JSON.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        Self::load_from_file(&dir.join(CONFIG_FILE_NAME))
    }

    /// Loads configuration from a specific file path.
    ///
    /// If the file does not exist, returns the default configuration.
    ///
    /// # Errors
    ///
    /// Returns `TutorError::ConfigParseError` if the file cannot be read or
    /// parsed, and `TutorError::ConfigValidationError` if a value is invalid.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                config.validate()?;
                return Ok(config);
            }
            Err(e) => {
                return Err(TutorError::config_parse(
                    path,
                    format!("failed to read file: {e}"),
                ));
            }
        };

        let config: Self = serde_json::from_str(&contents)
            .map_err(|e| TutorError::config_parse(path, e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `TutorError::ConfigValidationError` if any check fails.
    pub fn validate(&self) -> Result<()> {
        if let Some(lessons) = &self.lessons {
            if lessons.trim().is_empty() {
                return Err(TutorError::config_validation(
                    "lessons path must not be empty",
                    "Remove the 'lessons' field to use the built-in course, or point it at a lesson file",
                ));
            }
        }

        if !(self.assistant_url.starts_with("http://")
            || self.assistant_url.starts_with("https://"))
        {
            return Err(TutorError::config_validation(
                format!("assistantUrl is not an http(s) URL: '{}'", self.assistant_url),
                "Set assistantUrl to an address such as http://127.0.0.1:5000/chat",
            ));
        }

        self.machine.validate()
    }

    /// Path of the lesson file, if one is configured.
    #[must_use]
    pub fn lessons_path(&self) -> Option<PathBuf> {
        self.lessons.as_ref().map(PathBuf::from)
    }
}

/// Lesson machine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineConfig {
    /// Image the root overlay is layered on.
    #[serde(default = "default_image")]
    pub image: String,

    /// Container name for the machine.
    #[serde(default = "default_machine_name")]
    pub name: String,

    /// Shell commands are passed to with `-c`.
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Working directory inside the machine.
    #[serde(default = "default_working_dir")]
    pub working_dir: String,

    /// `PATH` given to commands.
    #[serde(default = "default_search_path")]
    pub search_path: String,

    /// Host directory mounted at the working directory.
    #[serde(default = "default_host_work_dir")]
    pub host_work_dir: String,

    /// Named volume used as the local cache device.
    #[serde(default = "default_cache_volume")]
    pub cache_volume: String,

    /// Mount path of the cache device.
    #[serde(default = "default_cache_path")]
    pub cache_path: String,

    /// Mount path of the scratch store.
    #[serde(default = "default_scratch_path")]
    pub scratch_path: String,

    /// Size of the scratch store in megabytes.
    #[serde(default = "default_scratch_size_mb")]
    pub scratch_size_mb: u32,

    /// Limit on a single command in seconds.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_seconds: u64,

    /// Pull the image if it is not present locally.
    #[serde(default = "default_true")]
    pub pull_image: bool,

    /// Leave the machine container behind on exit.
    #[serde(default)]
    pub keep_on_exit: bool,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            name: default_machine_name(),
            shell: default_shell(),
            working_dir: default_working_dir(),
            search_path: default_search_path(),
            host_work_dir: default_host_work_dir(),
            cache_volume: default_cache_volume(),
            cache_path: default_cache_path(),
            scratch_path: default_scratch_path(),
            scratch_size_mb: default_scratch_size_mb(),
            command_timeout_seconds: default_command_timeout(),
            pull_image: default_true(),
            keep_on_exit: false,
        }
    }
}

impl MachineConfig {
    /// Validates the machine settings.
    ///
    /// # Errors
    ///
    /// Returns `TutorError::ConfigValidationError` if any check fails.
    pub fn validate(&self) -> Result<()> {
        if self.image.trim().is_empty() {
            return Err(TutorError::config_validation(
                "machine.image must not be empty",
                "Set machine.image to a Docker image such as debian:bookworm-slim",
            ));
        }

        if self.name.trim().is_empty() {
            return Err(TutorError::config_validation(
                "machine.name must not be empty",
                "Set machine.name to a valid container name",
            ));
        }

        for (key, value) in [
            ("machine.shell", &self.shell),
            ("machine.workingDir", &self.working_dir),
            ("machine.cachePath", &self.cache_path),
            ("machine.scratchPath", &self.scratch_path),
        ] {
            if !value.starts_with('/') {
                return Err(TutorError::config_validation(
                    format!("{key} must be an absolute path, got '{value}'"),
                    format!("Use an absolute path inside the machine for {key}"),
                ));
            }
        }

        if self.host_work_dir.trim().is_empty() {
            return Err(TutorError::config_validation(
                "machine.hostWorkDir must not be empty",
                "Provide a host directory for the working directory (relative paths are resolved against the project directory)",
            ));
        }

        if self.command_timeout_seconds == 0 {
            return Err(TutorError::config_validation(
                "machine.commandTimeoutSeconds must be greater than 0",
                "Set machine.commandTimeoutSeconds to at least 1 in your shelltutor.json",
            ));
        }

        if self.scratch_size_mb == 0 {
            return Err(TutorError::config_validation(
                "machine.scratchSizeMb must be greater than 0",
                "Set machine.scratchSizeMb to at least 1 in your shelltutor.json",
            ));
        }

        Ok(())
    }

    /// Per-command timeout.
    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_seconds)
    }

    /// Host directory for the working directory, resolved against `base_dir`.
    #[must_use]
    pub fn host_work_dir(&self, base_dir: &Path) -> PathBuf {
        let path = Path::new(&self.host_work_dir);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            base_dir.join(path)
        }
    }

    /// Device stack the machine boots with.
    ///
    /// Root overlay, cache volume, host working directory, scratch store and
    /// `/dev`, in that order.
    #[must_use]
    pub fn device_stack(&self, base_dir: &Path) -> DeviceStack {
        let scratch_bytes = i64::from(self.scratch_size_mb) * 1024 * 1024;
        DeviceStack::new(&self.image)
            .with_cache(&self.cache_volume, &self.cache_path)
            .with_host_dir(self.host_work_dir(base_dir), &self.working_dir)
            .with_scratch(&self.scratch_path, Some(scratch_bytes))
            .with_devices("/dev")
    }

    /// Runner dispatching commands with these settings.
    #[must_use]
    pub fn command_runner(&self) -> CommandRunner {
        CommandRunner::default()
            .with_shell(&self.shell)
            .with_working_dir(&self.working_dir)
            .with_search_path(&self.search_path)
            .with_timeout(self.command_timeout())
    }
}
