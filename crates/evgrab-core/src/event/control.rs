// Evgrab Control Channel
// Termination requests turned into a readiness source

use std::io::{self, Write};
use std::os::raw::c_int;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

use log::debug;
use signal_hook::consts::{FORBIDDEN, SIGINT, SIGTERM};
use signal_hook::SigId;

use super::multiplex::Token;

/// Signals that request termination
pub const TERM_SIGNALS: &[c_int] = &[SIGINT, SIGTERM];

/// Errors setting up the control channel
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("failed to adapt interrupt signal to the event loop: {0}")]
    SetupFailed(#[source] io::Error),

    #[error("control channel is not armed")]
    NotArmed,
}

/// Self-pipe that becomes readable once termination is requested.
///
/// Signal handlers (and [`ShutdownHandle::request`]) write a byte into the
/// pipe; nothing ever reads it back, so the read end stays ready from then on.
pub struct ControlChannel {
    reader: Option<UnixStream>,
    writer: Option<UnixStream>,
    signals: Vec<SigId>,
}

impl ControlChannel {
    /// Arm the channel for SIGINT and SIGTERM.
    ///
    /// From here on those signals no longer terminate the process; they make
    /// the channel ready instead.
    pub fn arm() -> Result<Self, ControlError> {
        Self::arm_with(TERM_SIGNALS)
    }

    /// Arm the channel for an explicit set of signals. With no signals the
    /// channel only fires through a [`ShutdownHandle`].
    pub fn arm_with(signals: &[c_int]) -> Result<Self, ControlError> {
        let (reader, writer) = UnixStream::pair().map_err(ControlError::SetupFailed)?;
        reader.set_nonblocking(true).map_err(ControlError::SetupFailed)?;
        writer.set_nonblocking(true).map_err(ControlError::SetupFailed)?;

        let mut channel = Self {
            reader: Some(reader),
            writer: Some(writer),
            signals: Vec::with_capacity(signals.len()),
        };
        for &signal in signals {
            if FORBIDDEN.contains(&signal) {
                channel.dispose();
                return Err(ControlError::SetupFailed(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("signal {} cannot be handled", signal),
                )));
            }
            let result = channel
                .clone_writer()
                .and_then(|pipe| signal_hook::low_level::pipe::register(signal, pipe));
            match result {
                Ok(id) => channel.signals.push(id),
                Err(e) => {
                    channel.dispose();
                    return Err(ControlError::SetupFailed(e));
                }
            }
        }
        debug!("control channel armed for {} signal(s)", signals.len());
        Ok(channel)
    }

    /// Handle that can request termination without a signal
    pub fn shutdown_handle(&self) -> Result<ShutdownHandle, ControlError> {
        let writer = self.clone_writer().map_err(ControlError::SetupFailed)?;
        Ok(ShutdownHandle { writer })
    }

    /// Whether a readiness notification came from this channel
    pub fn is_termination_requested(&self, token: Token) -> bool {
        token == Token::Control
    }

    /// Descriptor to register for readiness, until disposed
    pub fn readiness_fd(&self) -> Option<RawFd> {
        self.reader.as_ref().map(AsRawFd::as_raw_fd)
    }

    pub fn is_disposed(&self) -> bool {
        self.reader.is_none()
    }

    /// Unregister the signal handlers and close the pipe. Idempotent.
    pub fn dispose(&mut self) {
        for id in self.signals.drain(..) {
            signal_hook::low_level::unregister(id);
        }
        if self.reader.take().is_some() {
            debug!("control channel disposed");
        }
        self.writer = None;
    }

    fn clone_writer(&self) -> io::Result<UnixStream> {
        match &self.writer {
            Some(writer) => writer.try_clone(),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Requests termination of a running event loop.
#[derive(Debug)]
pub struct ShutdownHandle {
    writer: UnixStream,
}

impl ShutdownHandle {
    pub fn request(&self) {
        // A full pipe already means a pending request
        let _ = (&self.writer).write(&[1]);
    }

    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(Self {
            writer: self.writer.try_clone()?,
        })
    }
}
