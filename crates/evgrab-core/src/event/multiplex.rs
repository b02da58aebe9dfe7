// Evgrab Multiplexer
// epoll readiness wait over device descriptors and the control channel

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use log::debug;

/// Default number of ready sources returned by one wait
pub const MAX_EVENTS: usize = 10;

const CONTROL_DATA: u64 = u64::MAX;

/// Routes a readiness notification back to its owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum Token {
    /// The control channel
    Control,
    /// Device at this index of the registry
    Device(usize),
}

impl Token {
    fn to_data(self) -> u64 {
        match self {
            Token::Control => CONTROL_DATA,
            Token::Device(index) => index as u64,
        }
    }

    fn from_data(data: u64) -> Self {
        if data == CONTROL_DATA {
            Token::Control
        } else {
            Token::Device(data as usize)
        }
    }
}

/// Errors from the readiness facility. All of them are fatal to the loop.
#[derive(Debug, thiserror::Error)]
pub enum MultiplexError {
    #[error("failed to create epoll: {0}")]
    Create(#[source] io::Error),

    #[error("failed to add {token} to epoll: {source}")]
    Register {
        token: Token,
        #[source]
        source: io::Error,
    },

    #[error("epoll file descriptor failure: {0}")]
    Wait(#[source] io::Error),

    #[error("multiplexer already disposed")]
    Disposed,
}

/// Waits for readiness across tagged descriptors.
pub struct Multiplexer {
    epoll: Option<OwnedFd>,
    registered: usize,
}

impl Multiplexer {
    pub fn new() -> Result<Self, MultiplexError> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(MultiplexError::Create(io::Error::last_os_error()));
        }
        Ok(Self {
            epoll: Some(unsafe { OwnedFd::from_raw_fd(fd) }),
            registered: 0,
        })
    }

    /// Watch `fd` for input, reporting it as `token`
    pub fn register(&mut self, fd: RawFd, token: Token) -> Result<(), MultiplexError> {
        let epoll = self.epoll.as_ref().ok_or(MultiplexError::Disposed)?;
        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: token.to_data(),
        };
        let rc =
            unsafe { libc::epoll_ctl(epoll.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event) };
        if rc < 0 {
            return Err(MultiplexError::Register {
                token,
                source: io::Error::last_os_error(),
            });
        }
        self.registered += 1;
        debug!("registered {} (fd {})", token, fd);
        Ok(())
    }

    /// Number of sources registered so far
    pub fn registered(&self) -> usize {
        self.registered
    }

    /// Block until at least one source is ready and return up to
    /// `max_events` of them. There is no timeout.
    ///
    /// `max_events` must be positive; the kernel rejects a zero-sized batch.
    pub fn wait(&mut self, max_events: usize) -> Result<Vec<Token>, MultiplexError> {
        let epoll = self.epoll.as_ref().ok_or(MultiplexError::Disposed)?;
        let capacity = max_events.min(libc::c_int::MAX as usize);
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; capacity];

        loop {
            let rc = unsafe {
                libc::epoll_wait(
                    epoll.as_raw_fd(),
                    events.as_mut_ptr(),
                    capacity as libc::c_int,
                    -1,
                )
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                // A signal landed while we slept; its handler has already
                // made the control channel ready.
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(MultiplexError::Wait(err));
            }
            return Ok(events[..rc as usize]
                .iter()
                .map(|event| Token::from_data(event.u64))
                .collect());
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.epoll.is_none()
    }

    /// Close the epoll descriptor. Idempotent.
    pub fn dispose(&mut self) {
        if self.epoll.take().is_some() {
            debug!("multiplexer disposed");
        }
        self.registered = 0;
    }
}
