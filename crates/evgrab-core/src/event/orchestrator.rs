// Evgrab Orchestrator
// Opens and grabs every device, runs the readiness loop, tears down once

use std::os::raw::c_int;
use std::path::{Path, PathBuf};

use log::{debug, error, info, warn};

use super::control::{ControlChannel, ControlError, ShutdownHandle, TERM_SIGNALS};
use super::multiplex::{MultiplexError, Multiplexer, Token, MAX_EVENTS};
use super::sink::EventSink;
use crate::input::{DeviceBackend, DeviceRegistry, InitError, RegistryError};

/// Lifecycle of an [`Orchestrator`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum OrchestratorState {
    Idle,
    Initializing,
    Running,
    Terminating,
    Terminated,
}

/// How the event loop ended without an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// No devices were supplied; nothing was opened
    NoDevices,
    /// The control channel fired
    Requested,
}

/// Fatal errors. Every one of them has already torn everything down.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Init(#[from] InitError),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error(transparent)]
    Multiplex(#[from] MultiplexError),

    #[error("operation not allowed in state {0}")]
    InvalidState(OrchestratorState),
}

/// Knobs for a capture session
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    /// Grab every device exclusively
    pub grab: bool,
    /// Upper bound of ready sources handled per wait
    pub max_events: usize,
    /// Signals that request termination
    pub signals: Vec<c_int>,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            grab: true,
            max_events: MAX_EVENTS,
            signals: TERM_SIGNALS.to_vec(),
        }
    }
}

/// Owns the registry, the control channel and the multiplexer, and drives
/// them through `Idle -> Initializing -> Running -> Terminating -> Terminated`.
///
/// Teardown runs exactly once whichever path reaches it, including drop.
pub struct Orchestrator<B: DeviceBackend> {
    backend: B,
    options: CaptureOptions,
    registry: DeviceRegistry<B::Source>,
    control: Option<ControlChannel>,
    multiplexer: Option<Multiplexer>,
    state: OrchestratorState,
    teardowns: usize,
}

impl<B: DeviceBackend> Orchestrator<B> {
    pub fn new(backend: B, options: CaptureOptions) -> Self {
        Self {
            backend,
            options,
            registry: DeviceRegistry::new(),
            control: None,
            multiplexer: None,
            state: OrchestratorState::Idle,
            teardowns: 0,
        }
    }

    /// Add a device to capture. Only allowed before [`Orchestrator::start`].
    pub fn add_device(&mut self, path: impl Into<PathBuf>) -> Result<(), OrchestratorError> {
        if self.state != OrchestratorState::Idle {
            return Err(OrchestratorError::InvalidState(self.state));
        }
        self.registry.append(path)?;
        Ok(())
    }

    pub fn add_devices<I, P>(&mut self, paths: I) -> Result<(), OrchestratorError>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        for path in paths {
            self.add_device(path)?;
        }
        Ok(())
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    pub fn registry(&self) -> &DeviceRegistry<B::Source> {
        &self.registry
    }

    pub fn options(&self) -> &CaptureOptions {
        &self.options
    }

    /// How many times teardown actually ran (0 or 1)
    pub fn teardown_count(&self) -> usize {
        self.teardowns
    }

    /// Handle to stop a running loop from the outside
    pub fn shutdown_handle(&self) -> Result<ShutdownHandle, OrchestratorError> {
        let control = self.control.as_ref().ok_or(ControlError::NotArmed)?;
        Ok(control.shutdown_handle()?)
    }

    /// Open, grab and register every device, then arm the control channel.
    ///
    /// With no devices this is a no-op and the orchestrator stays idle. Any
    /// failure releases everything acquired so far before returning.
    pub fn start(&mut self, sink: &mut dyn EventSink) -> Result<(), OrchestratorError> {
        if self.state != OrchestratorState::Idle {
            return Err(OrchestratorError::InvalidState(self.state));
        }
        if self.registry.is_empty() {
            debug!("no devices supplied, staying idle");
            return Ok(());
        }

        self.state = OrchestratorState::Initializing;
        if let Err(e) = self.initialize(sink) {
            error!("startup failed: {}", e);
            self.teardown();
            return Err(e);
        }
        self.state = OrchestratorState::Running;
        info!("capturing {} device(s)", self.registry.len());
        Ok(())
    }

    fn initialize(&mut self, sink: &mut dyn EventSink) -> Result<(), OrchestratorError> {
        self.multiplexer = Some(Multiplexer::new()?);

        let grab = self.options.grab;
        for handle in self.registry.iter_mut() {
            sink.announce(handle.path());
            handle.initialize(&self.backend, grab)?;
        }

        if let Some(multiplexer) = self.multiplexer.as_mut() {
            for (index, handle) in self.registry.iter().enumerate() {
                if let Some(fd) = handle.readiness_fd() {
                    multiplexer.register(fd, Token::Device(index))?;
                }
            }
        }

        let control = ControlChannel::arm_with(&self.options.signals)?;
        let fd = control.readiness_fd();
        self.control = Some(control);
        if let (Some(multiplexer), Some(fd)) = (self.multiplexer.as_mut(), fd) {
            multiplexer.register(fd, Token::Control)?;
        }
        Ok(())
    }

    /// Wait and dispatch until termination is requested or the wait fails.
    pub fn run_loop(
        &mut self,
        sink: &mut dyn EventSink,
    ) -> Result<Termination, OrchestratorError> {
        match self.state {
            OrchestratorState::Running => {}
            OrchestratorState::Idle => return Ok(Termination::NoDevices),
            other => return Err(OrchestratorError::InvalidState(other)),
        }

        loop {
            let ready = match self.multiplexer.as_mut() {
                Some(multiplexer) => multiplexer.wait(self.options.max_events),
                None => Err(MultiplexError::Disposed),
            };
            let ready = match ready {
                Ok(ready) => ready,
                Err(e) => {
                    error!("{}", e);
                    self.teardown();
                    return Err(e.into());
                }
            };

            for token in ready {
                let requested = self
                    .control
                    .as_ref()
                    .is_some_and(|control| control.is_termination_requested(token));
                if requested {
                    info!("termination requested, shutting down");
                    self.teardown();
                    return Ok(Termination::Requested);
                }
                if let Token::Device(index) = token {
                    self.dispatch(index, sink);
                }
            }
        }
    }

    /// [`Orchestrator::start`] followed by [`Orchestrator::run_loop`]
    pub fn run(&mut self, sink: &mut dyn EventSink) -> Result<Termination, OrchestratorError> {
        self.start(sink)?;
        self.run_loop(sink)
    }

    fn dispatch(&mut self, index: usize, sink: &mut dyn EventSink) {
        let Some(handle) = self.registry.get_mut(index) else {
            warn!("readiness reported for unknown device #{}", index);
            return;
        };
        let path: PathBuf = handle.path().to_path_buf();
        for item in handle.decode_ready() {
            match item {
                Ok(decoded) => sink.emit(&path, &decoded),
                Err(e) => warn!("{}", e),
            }
        }
    }

    /// Release every device, then the control channel, then the multiplexer.
    ///
    /// Runs at most once; later calls (and an idle orchestrator) do nothing.
    pub fn teardown(&mut self) {
        if matches!(
            self.state,
            OrchestratorState::Idle | OrchestratorState::Terminated
        ) {
            return;
        }
        self.state = OrchestratorState::Terminating;

        let failed = self.registry.release_all();
        if !failed.is_empty() {
            warn!("{} device(s) failed to release cleanly", failed.len());
        }
        if let Some(control) = self.control.as_mut() {
            control.dispose();
        }
        if let Some(multiplexer) = self.multiplexer.as_mut() {
            multiplexer.dispose();
        }

        self.state = OrchestratorState::Terminated;
        self.teardowns += 1;
        debug!("teardown complete");
    }

    /// Paths of the devices in registry order
    pub fn device_paths(&self) -> Vec<&Path> {
        self.registry.paths()
    }
}

impl<B: DeviceBackend> Drop for Orchestrator<B> {
    fn drop(&mut self) {
        self.teardown();
    }
}
