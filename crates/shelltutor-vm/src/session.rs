//! The single lesson machine session.
//!
//! [`VmSession`] owns the lifecycle of one machine: bring-up through a
//! [`MachineBackend`], the console sink output is captured into, and the
//! readiness state that gates command dispatch.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    ConsoleSink, DeviceStack, ExecRequest, MachineBackend, MachineHandle, Readiness, VmError,
};

/// One machine connection, shared by everything that dispatches commands.
///
/// Readiness moves `Uninitialized → Loading → Ready | Failed` and can be
/// watched through [`subscribe_readiness`](Self::subscribe_readiness).
#[derive(Debug)]
pub struct VmSession {
    backend: Arc<dyn MachineBackend>,
    stack: DeviceStack,
    readiness: watch::Sender<Readiness>,
    machine: Mutex<Option<MachineHandle>>,
    console: StdMutex<Option<ConsoleSink>>,
}

impl VmSession {
    /// Creates an uninitialized session that will boot `stack` on `backend`.
    #[must_use]
    pub fn new(backend: Arc<dyn MachineBackend>, stack: DeviceStack) -> Self {
        let (readiness, _) = watch::channel(Readiness::Uninitialized);
        Self {
            backend,
            stack,
            readiness,
            machine: Mutex::new(None),
            console: StdMutex::new(None),
        }
    }

    /// Returns the current readiness.
    #[must_use]
    pub fn readiness(&self) -> Readiness {
        *self.readiness.borrow()
    }

    /// Returns whether commands may be dispatched.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.readiness().is_ready()
    }

    /// Subscribes to readiness changes.
    #[must_use]
    pub fn subscribe_readiness(&self) -> watch::Receiver<Readiness> {
        self.readiness.subscribe()
    }

    /// The device stack this session boots.
    #[must_use]
    pub const fn stack(&self) -> &DeviceStack {
        &self.stack
    }

    /// Handle of the running machine, if any.
    pub async fn machine(&self) -> Option<MachineHandle> {
        self.machine.lock().await.clone()
    }

    /// Brings the machine up.
    ///
    /// Does nothing while `Loading` or `Ready`. From `Uninitialized` or
    /// `Failed` it connects to the service, assembles the device stack and
    /// boots. Any failure moves the session to `Failed`, is logged, and is
    /// returned; nothing is retried.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> Result<(), VmError> {
        let started = self.readiness.send_if_modified(|state| {
            if state.can_initialize() {
                *state = Readiness::Loading;
                true
            } else {
                false
            }
        });
        if !started {
            debug!(readiness = %self.readiness(), "Initialize ignored");
            return Ok(());
        }

        info!(
            image = ?self.stack.image(),
            devices = self.stack.devices().len(),
            "Booting lesson machine"
        );

        match self.bring_up().await {
            Ok(handle) => {
                info!(machine = %handle.id, "Lesson machine ready");
                *self.machine.lock().await = Some(handle);
                self.readiness.send_replace(Readiness::Ready);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Lesson machine failed to start");
                self.readiness.send_replace(Readiness::Failed);
                Err(e)
            }
        }
    }

    async fn bring_up(&self) -> Result<MachineHandle, VmError> {
        self.stack.validate()?;
        self.backend.connect(&self.stack).await?;
        debug!("Execution service reachable");
        self.backend.provision(&self.stack).await
    }

    /// Attaches `sink` as the console; replaces any previous binding.
    ///
    /// Independent of readiness and of the machine itself.
    pub fn bind_console(&self, sink: ConsoleSink) {
        let mut console = self.console.lock().unwrap_or_else(PoisonError::into_inner);
        if console.as_ref().is_some_and(|bound| bound.same_as(&sink)) {
            debug!("Console re-bound");
        } else {
            debug!("Console bound");
        }
        *console = Some(sink);
    }

    /// The currently bound console sink.
    #[must_use]
    pub fn console(&self) -> Option<ConsoleSink> {
        self.console
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Runs `request` on the machine, writing its output to the bound console.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::InvalidState`] unless the session is `Ready` and
    /// [`VmError::ConsoleNotBound`] when no sink is attached.
    pub async fn execute(&self, request: &ExecRequest) -> Result<Option<i64>, VmError> {
        let actual = self.readiness();
        if !actual.is_ready() {
            return Err(VmError::InvalidState {
                expected: Readiness::Ready,
                actual,
            });
        }

        let console = self.console().ok_or(VmError::ConsoleNotBound)?;
        let machine = self
            .machine()
            .await
            .ok_or(VmError::InvalidState {
                expected: Readiness::Ready,
                actual: Readiness::Uninitialized,
            })?;

        self.backend.execute(&machine, request, &console).await
    }

    /// Tears the machine down and returns the session to `Uninitialized`.
    ///
    /// The console binding is kept.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<(), VmError> {
        let handle = self.machine.lock().await.take();
        self.readiness.send_replace(Readiness::Uninitialized);

        let Some(handle) = handle else {
            debug!("No machine to tear down");
            return Ok(());
        };

        match self.backend.teardown(&handle).await {
            Ok(()) => {
                info!(machine = %handle.id, "Lesson machine shut down");
                Ok(())
            }
            Err(e) => {
                warn!(machine = %handle.id, error = %e, "Lesson machine teardown failed");
                Err(e)
            }
        }
    }
}
