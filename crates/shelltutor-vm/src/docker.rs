//! Docker-backed lesson machine.
//!
//! This module provides [`DockerBackend`], a [`MachineBackend`] that realises
//! the lesson machine as a long-running Docker container driven through
//! bollard. Commands run as `docker exec` instances inside it.

use std::path::Path;

use async_trait::async_trait;
use bollard::container::{
    Config as BollardConfig, CreateContainerOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, Mount as BollardMount, MountTmpfsOptions, MountTypeEnum};
use bollard::Docker;
use futures::StreamExt;
use tracing::{debug, info, instrument, warn};

use crate::{
    ConsoleSink, ConsoleStream, Device, DeviceStack, ExecRequest, MachineBackend, MachineHandle,
    VmError,
};

/// Seconds Docker waits for the machine to stop before killing it.
const DEFAULT_STOP_TIMEOUT_SECS: i64 = 5;

/// Runs the lesson machine as a Docker container.
///
/// # Example
///
/// ```no_run
/// use shelltutor_vm::{DeviceStack, DockerBackend, MachineBackend};
///
/// # async fn example() -> Result<(), shelltutor_vm::VmError> {
/// let backend = DockerBackend::new("shelltutor-vm")?.with_pull_image(true);
/// let stack = DeviceStack::new("debian:bookworm-slim").with_devices("/dev");
///
/// backend.connect(&stack).await?;
/// let machine = backend.provision(&stack).await?;
/// println!("Machine up: {}", machine.id);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct DockerBackend {
    /// The bollard Docker client instance.
    docker: Docker,
    /// Container name used for the machine.
    name: String,
    /// Pull the image when it is not present locally.
    pull_image: bool,
    /// Leave the container behind on teardown.
    keep_on_exit: bool,
    /// Grace period for stopping the container.
    stop_timeout_secs: i64,
}

impl DockerBackend {
    /// Connects to the local Docker daemon.
    ///
    /// Uses the default local connection method (Unix socket on Linux/macOS,
    /// named pipe on Windows). No request is sent until
    /// [`connect`](MachineBackend::connect) is called.
    pub fn new(name: impl Into<String>) -> Result<Self, VmError> {
        let docker = Docker::connect_with_local_defaults()?;
        debug!("Docker client configured");
        Ok(Self {
            docker,
            name: name.into(),
            pull_image: true,
            keep_on_exit: false,
            stop_timeout_secs: DEFAULT_STOP_TIMEOUT_SECS,
        })
    }

    /// Sets whether a missing image is pulled.
    #[must_use]
    pub const fn with_pull_image(mut self, pull_image: bool) -> Self {
        self.pull_image = pull_image;
        self
    }

    /// Sets whether the container survives teardown.
    #[must_use]
    pub const fn with_keep_on_exit(mut self, keep_on_exit: bool) -> Self {
        self.keep_on_exit = keep_on_exit;
        self
    }

    /// Returns a reference to the underlying Docker client.
    #[must_use]
    pub const fn docker(&self) -> &Docker {
        &self.docker
    }

    /// Returns the container name used for the machine.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Makes sure `image` is available locally, pulling it if allowed.
    #[instrument(skip(self))]
    async fn ensure_image(&self, image: &str) -> Result<(), VmError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => {
                debug!("Image present locally");
                return Ok(());
            }
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(e.into()),
        }

        if !self.pull_image {
            return Err(VmError::ImageUnavailable {
                image: image.to_string(),
            });
        }

        let (repository, tag) = split_image_reference(image);
        info!(repository, tag, "Pulling machine image");
        let options = CreateImageOptions {
            from_image: repository.to_string(),
            tag: tag.to_string(),
            ..Default::default()
        };

        let mut progress = self.docker.create_image(Some(options), None, None);
        while let Some(step) = progress.next().await {
            match step {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(status = %status, "Pull progress");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Image pull failed");
                    return Err(VmError::ImageUnavailable {
                        image: image.to_string(),
                    });
                }
            }
        }

        info!("Image pulled");
        Ok(())
    }

    /// Removes a leftover container with our name from an earlier run.
    async fn remove_stale(&self) -> Result<(), VmError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self
            .docker
            .remove_container(&self.name, Some(options))
            .await
        {
            Ok(()) => {
                warn!(container_name = %self.name, "Removed stale machine container");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(VmError::ProvisionFailed(format!(
                "cannot remove stale container '{}': {e}",
                self.name
            ))),
        }
    }
}

#[async_trait]
impl MachineBackend for DockerBackend {
    #[instrument(skip(self, stack))]
    async fn connect(&self, stack: &DeviceStack) -> Result<(), VmError> {
        self.docker
            .ping()
            .await
            .map_err(|e| VmError::ServiceUnavailable(e.to_string()))?;
        debug!("Docker daemon health check passed");

        let image = stack
            .image()
            .ok_or_else(|| VmError::InvalidDeviceStack("no overlay image".to_string()))?;
        self.ensure_image(image).await
    }

    #[instrument(skip(self, stack), fields(name = %self.name))]
    async fn provision(&self, stack: &DeviceStack) -> Result<MachineHandle, VmError> {
        stack.validate()?;

        for host_dir in stack.host_dirs() {
            tokio::fs::create_dir_all(host_dir).await?;
            validate_host_dir(host_dir)?;
        }

        let image = stack
            .image()
            .ok_or_else(|| VmError::InvalidDeviceStack("no overlay image".to_string()))?
            .to_string();

        let mounts = stack
            .devices()
            .iter()
            .filter_map(convert_device_to_bollard)
            .collect::<Vec<_>>();

        let host_config = HostConfig {
            mounts: Some(mounts),
            init: Some(true),
            ..Default::default()
        };

        let config = BollardConfig {
            image: Some(image.clone()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            host_config: Some(host_config),
            ..Default::default()
        };

        self.remove_stale().await?;

        debug!(devices = stack.devices().len(), "Creating machine container");
        let create_options = CreateContainerOptions {
            name: self.name.as_str(),
            platform: None,
        };
        let response = self
            .docker
            .create_container(Some(create_options), config)
            .await
            .map_err(|e| VmError::ProvisionFailed(e.to_string()))?;

        for warning in &response.warnings {
            warn!(container_id = %response.id, warning = %warning, "Docker warning during machine creation");
        }

        self.docker
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| VmError::ProvisionFailed(e.to_string()))?;

        info!(container_id = %response.id, image = %image, "Machine container running");
        Ok(MachineHandle::new(response.id, &self.name, image))
    }

    #[instrument(skip(self, request, console), fields(machine = %machine.id))]
    async fn execute(
        &self,
        machine: &MachineHandle,
        request: &ExecRequest,
        console: &ConsoleSink,
    ) -> Result<Option<i64>, VmError> {
        let options = CreateExecOptions {
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            cmd: Some(request.argv()),
            env: Some(request.env.clone()),
            working_dir: Some(request.cwd.clone()),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(&machine.id, options)
            .await
            .map_err(|e| VmError::ExecFailed(format!("cannot create exec: {e}")))?;
        debug!(exec_id = %exec.id, "Exec created");

        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| VmError::ExecFailed(format!("cannot start exec: {e}")))?;

        if let StartExecResults::Attached { mut output, .. } = started {
            let mut stdout = FrameDecoder::default();
            let mut stderr = FrameDecoder::default();
            while let Some(frame) = output.next().await {
                match frame.map_err(|e| VmError::ExecFailed(e.to_string()))? {
                    LogOutput::StdOut { message } | LogOutput::Console { message } => {
                        console.write(ConsoleStream::Stdout, stdout.decode(&message));
                    }
                    LogOutput::StdErr { message } => {
                        console.write(ConsoleStream::Stderr, stderr.decode(&message));
                    }
                    LogOutput::StdIn { .. } => {}
                }
            }
            console.write(ConsoleStream::Stdout, stdout.finish());
            console.write(ConsoleStream::Stderr, stderr.finish());
        }

        let exit_code = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| VmError::ExecFailed(format!("cannot inspect exec: {e}")))?
            .exit_code;
        debug!(exit_code = ?exit_code, "Exec finished");
        Ok(exit_code)
    }

    #[instrument(skip(self), fields(machine = %machine.id))]
    async fn teardown(&self, machine: &MachineHandle) -> Result<(), VmError> {
        if self.keep_on_exit {
            info!("Keeping machine container as configured");
            return Ok(());
        }

        match self
            .docker
            .stop_container(
                &machine.id,
                Some(StopContainerOptions {
                    t: self.stop_timeout_secs,
                }),
            )
            .await
        {
            Ok(()) => debug!("Machine stopped"),
            Err(e) if is_not_found(&e) => return Ok(()),
            Err(e) => warn!(error = %e, "Failed to stop machine, removing anyway"),
        }

        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(&machine.id, Some(options))
            .await
            .map_err(|e| VmError::TeardownFailed(e.to_string()))?;

        info!("Machine removed");
        Ok(())
    }
}

/// Decodes one output stream whose frames may split UTF-8 sequences.
///
/// An incomplete sequence at the end of a frame is held until the next one.
#[derive(Debug, Default)]
struct FrameDecoder {
    pending: Vec<u8>,
}

impl FrameDecoder {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut text = String::new();
        let mut rest = self.pending.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    text.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        self.pending = rest.to_vec();
        text
    }

    /// Flushes a dangling partial sequence once the stream has ended.
    fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

/// Returns whether the daemon answered 404.
fn is_not_found(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// Splits `repo[:tag]` into repository and tag, defaulting the tag to `latest`.
///
/// A colon inside the registry host (`localhost:5000/img`) is not a tag.
fn split_image_reference(image: &str) -> (&str, &str) {
    let name_start = image.rfind('/').map_or(0, |slash| slash + 1);
    match image[name_start..].rfind(':') {
        Some(colon) => {
            let split = name_start + colon;
            (&image[..split], &image[split + 1..])
        }
        None => (image, "latest"),
    }
}

/// Validates that a host directory exists before it is bound.
fn validate_host_dir(path: &Path) -> Result<(), VmError> {
    if !path.is_dir() {
        return Err(VmError::InvalidDeviceStack(format!(
            "host directory does not exist: {}",
            path.display()
        )));
    }

    debug!(path = %path.display(), "Validated host directory exists");
    Ok(())
}

/// Converts a device to bollard's mount format.
///
/// The overlay is the container's own root filesystem and `/dev` is populated
/// by the engine, so neither becomes an explicit mount.
fn convert_device_to_bollard(device: &Device) -> Option<BollardMount> {
    match device {
        Device::Overlay { .. } | Device::Devices { .. } => None,
        Device::Cache { volume, path } => Some(BollardMount {
            target: Some(path.clone()),
            source: Some(volume.clone()),
            typ: Some(MountTypeEnum::VOLUME),
            read_only: Some(false),
            ..Default::default()
        }),
        Device::HostDir {
            host_path,
            path,
            read_only,
        } => Some(BollardMount {
            target: Some(path.clone()),
            source: Some(host_path.to_string_lossy().into_owned()),
            typ: Some(MountTypeEnum::BIND),
            read_only: Some(*read_only),
            ..Default::default()
        }),
        Device::Scratch { path, size_bytes } => Some(BollardMount {
            target: Some(path.clone()),
            typ: Some(MountTypeEnum::TMPFS),
            tmpfs_options: Some(MountTmpfsOptions {
                size_bytes: *size_bytes,
                ..Default::default()
            }),
            ..Default::default()
        }),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    // ------------------------------------------------------------------------
    // Output decoding
    // ------------------------------------------------------------------------

    #[test]
    fn frame_decoder_joins_split_character() {
        let mut decoder = FrameDecoder::default();
        assert_eq!(decoder.decode(b"caf\xC3"), "caf");
        assert_eq!(decoder.decode(b"\xA9 ok\n"), "\u{e9} ok\n");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn frame_decoder_replaces_invalid_bytes() {
        let mut decoder = FrameDecoder::default();
        assert_eq!(decoder.decode(b"a\xFFb"), "a\u{fffd}b");
    }

    #[test]
    fn frame_decoder_flushes_dangling_tail() {
        let mut decoder = FrameDecoder::default();
        assert_eq!(decoder.decode(b"end\xE2\x82"), "end");
        assert_eq!(decoder.finish(), "\u{fffd}");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn frame_decoder_passes_ascii_through() {
        let mut decoder = FrameDecoder::default();
        assert_eq!(decoder.decode(b"ls -la\n"), "ls -la\n");
    }

    #[test]
    fn split_image_reference_with_tag() {
        assert_eq!(
            split_image_reference("debian:bookworm-slim"),
            ("debian", "bookworm-slim")
        );
    }

    #[test]
    fn split_image_reference_defaults_to_latest() {
        assert_eq!(split_image_reference("alpine"), ("alpine", "latest"));
    }

    #[test]
    fn split_image_reference_ignores_registry_port() {
        assert_eq!(
            split_image_reference("localhost:5000/lessons/base"),
            ("localhost:5000/lessons/base", "latest")
        );
        assert_eq!(
            split_image_reference("localhost:5000/lessons/base:v2"),
            ("localhost:5000/lessons/base", "v2")
        );
    }

    #[test]
    fn validate_host_dir_nonexistent() {
        let result = validate_host_dir(Path::new("/nonexistent/path/12345"));
        assert!(
            matches!(result, Err(VmError::InvalidDeviceStack(_))),
            "Expected InvalidDeviceStack, got: {result:?}"
        );
    }

    #[test]
    fn validate_host_dir_exists() {
        let result = validate_host_dir(Path::new("/tmp"));
        assert!(result.is_ok(), "Expected Ok for /tmp, got: {result:?}");
    }

    #[test]
    fn overlay_and_devices_are_not_mounts() {
        let overlay = Device::Overlay {
            image: "alpine:latest".to_string(),
        };
        let devs = Device::Devices {
            path: "/dev".to_string(),
        };
        assert!(convert_device_to_bollard(&overlay).is_none());
        assert!(convert_device_to_bollard(&devs).is_none());
    }

    #[test]
    fn host_dir_becomes_bind_mount() {
        let device = Device::HostDir {
            host_path: PathBuf::from("/host/app"),
            path: "/app".to_string(),
            read_only: false,
        };
        let mount = convert_device_to_bollard(&device).unwrap();

        assert_eq!(mount.source, Some("/host/app".to_string()));
        assert_eq!(mount.target, Some("/app".to_string()));
        assert_eq!(mount.typ, Some(MountTypeEnum::BIND));
        assert_eq!(mount.read_only, Some(false));
    }

    #[test]
    fn cache_becomes_named_volume() {
        let device = Device::Cache {
            volume: "shelltutor-cache".to_string(),
            path: "/var/cache/shelltutor".to_string(),
        };
        let mount = convert_device_to_bollard(&device).unwrap();

        assert_eq!(mount.source, Some("shelltutor-cache".to_string()));
        assert_eq!(mount.typ, Some(MountTypeEnum::VOLUME));
    }

    #[test]
    fn scratch_becomes_sized_tmpfs() {
        let device = Device::Scratch {
            path: "/data".to_string(),
            size_bytes: Some(1024),
        };
        let mount = convert_device_to_bollard(&device).unwrap();

        assert_eq!(mount.target, Some("/data".to_string()));
        assert_eq!(mount.typ, Some(MountTypeEnum::TMPFS));
        assert_eq!(mount.tmpfs_options.unwrap().size_bytes, Some(1024));
    }

    #[test]
    fn not_found_detection() {
        let missing = BollardError::DockerResponseServerError {
            status_code: 404,
            message: "No such container".to_string(),
        };
        let conflict = BollardError::DockerResponseServerError {
            status_code: 409,
            message: "Conflict".to_string(),
        };
        assert!(is_not_found(&missing));
        assert!(!is_not_found(&conflict));
    }

    #[tokio::test]
    #[ignore = "requires running Docker daemon"]
    async fn machine_runs_shell_commands() {
        let backend = DockerBackend::new("shelltutor-test-exec").expect("docker client");
        let work = std::env::temp_dir().join("shelltutor-test-exec");
        let stack = DeviceStack::new("debian:bookworm-slim")
            .with_host_dir(&work, "/app")
            .with_scratch("/data", None)
            .with_devices("/dev");

        backend.connect(&stack).await.expect("connect");
        let machine = backend.provision(&stack).await.expect("provision");

        let console = ConsoleSink::new();
        let request = ExecRequest::shell("/bin/bash", r#"echo "Hello, World!""#)
            .with_env("PATH", "/usr/bin:/bin")
            .with_cwd("/app");
        let exit_code = backend
            .execute(&machine, &request, &console)
            .await
            .expect("execute");

        assert_eq!(exit_code, Some(0));
        assert_eq!(console.contents().trim(), "Hello, World!");

        backend.teardown(&machine).await.expect("teardown");
        std::fs::remove_dir_all(&work).ok();
    }
}
