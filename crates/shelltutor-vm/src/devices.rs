//! Device stack assembled into the lesson machine.
//!
//! A [`DeviceStack`] describes what the machine boots with: a root overlay
//! disk, a local cache, a host-backed working directory, a scratch store and
//! the device-node mount. Backends translate the stack into whatever their
//! execution service understands.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::VmError;

/// A single device in the machine's storage stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Device {
    /// Root filesystem: a base image with a writable overlay on top.
    Overlay {
        /// Image the root disk is layered on.
        image: String,
    },
    /// Named local cache that outlives individual machines.
    Cache {
        /// Name of the backing volume.
        volume: String,
        /// Mount path inside the machine.
        path: String,
    },
    /// Host directory exposed inside the machine.
    HostDir {
        /// Path on the host filesystem.
        host_path: PathBuf,
        /// Mount path inside the machine.
        path: String,
        /// Whether the machine may only read it.
        read_only: bool,
    },
    /// In-memory scratch store, discarded with the machine.
    Scratch {
        /// Mount path inside the machine.
        path: String,
        /// Size limit in bytes, if any.
        size_bytes: Option<i64>,
    },
    /// Device-node enumeration.
    Devices {
        /// Mount path inside the machine, normally `/dev`.
        path: String,
    },
}

impl Device {
    /// Returns the path this device occupies inside the machine.
    #[must_use]
    pub fn mount_path(&self) -> &str {
        match self {
            Self::Overlay { .. } => "/",
            Self::Cache { path, .. }
            | Self::HostDir { path, .. }
            | Self::Scratch { path, .. }
            | Self::Devices { path } => path,
        }
    }

    /// Short name used in logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Overlay { .. } => "overlay",
            Self::Cache { .. } => "cache",
            Self::HostDir { .. } => "host_dir",
            Self::Scratch { .. } => "scratch",
            Self::Devices { .. } => "devices",
        }
    }
}

/// Ordered set of devices the machine is brought up with.
///
/// # Example
///
/// ```
/// use shelltutor_vm::DeviceStack;
///
/// let stack = DeviceStack::new("debian:bookworm-slim")
///     .with_cache("shelltutor-cache", "/var/cache/shelltutor")
///     .with_host_dir("/tmp/shelltutor/app", "/app")
///     .with_scratch("/data", Some(64 * 1024 * 1024))
///     .with_devices("/dev");
///
/// assert_eq!(stack.image(), Some("debian:bookworm-slim"));
/// assert_eq!(stack.devices().len(), 5);
/// assert!(stack.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStack {
    devices: Vec<Device>,
}

impl DeviceStack {
    /// Starts a stack whose root overlay is layered on `image`.
    #[must_use]
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            devices: vec![Device::Overlay {
                image: image.into(),
            }],
        }
    }

    /// Adds a named cache volume.
    #[must_use]
    pub fn with_cache(mut self, volume: impl Into<String>, path: impl Into<String>) -> Self {
        self.devices.push(Device::Cache {
            volume: volume.into(),
            path: path.into(),
        });
        self
    }

    /// Adds a read-write host directory.
    #[must_use]
    pub fn with_host_dir(mut self, host_path: impl Into<PathBuf>, path: impl Into<String>) -> Self {
        self.devices.push(Device::HostDir {
            host_path: host_path.into(),
            path: path.into(),
            read_only: false,
        });
        self
    }

    /// Adds an in-memory scratch store.
    #[must_use]
    pub fn with_scratch(mut self, path: impl Into<String>, size_bytes: Option<i64>) -> Self {
        self.devices.push(Device::Scratch {
            path: path.into(),
            size_bytes,
        });
        self
    }

    /// Adds the device-node mount.
    #[must_use]
    pub fn with_devices(mut self, path: impl Into<String>) -> Self {
        self.devices.push(Device::Devices { path: path.into() });
        self
    }

    /// All devices in assembly order.
    #[must_use]
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// The image backing the root overlay.
    #[must_use]
    pub fn image(&self) -> Option<&str> {
        self.devices.iter().find_map(|device| match device {
            Device::Overlay { image } => Some(image.as_str()),
            _ => None,
        })
    }

    /// Host directories that must exist before the machine boots.
    pub fn host_dirs(&self) -> impl Iterator<Item = &Path> {
        self.devices.iter().filter_map(|device| match device {
            Device::HostDir { host_path, .. } => Some(host_path.as_path()),
            _ => None,
        })
    }

    /// Checks that the stack can be assembled.
    ///
    /// The stack needs exactly one overlay with a non-empty image, every
    /// other device must sit on a distinct absolute path, and cache volumes
    /// must be named.
    pub fn validate(&self) -> Result<(), VmError> {
        let overlays = self
            .devices
            .iter()
            .filter(|device| matches!(device, Device::Overlay { .. }))
            .count();
        if overlays != 1 {
            return Err(VmError::InvalidDeviceStack(format!(
                "expected exactly one overlay device, found {overlays}"
            )));
        }

        if self.image().is_some_and(|image| image.trim().is_empty()) {
            return Err(VmError::InvalidDeviceStack(
                "overlay image must not be empty".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for device in &self.devices {
            let path = device.mount_path();
            if !path.starts_with('/') {
                return Err(VmError::InvalidDeviceStack(format!(
                    "{} device path must be absolute: {path}",
                    device.kind()
                )));
            }
            if !seen.insert(path) {
                return Err(VmError::InvalidDeviceStack(format!(
                    "more than one device mounted at {path}"
                )));
            }
            if let Device::Cache { volume, .. } = device {
                if volume.trim().is_empty() {
                    return Err(VmError::InvalidDeviceStack(
                        "cache volume name must not be empty".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }
}
