// Evgrab Input Layer - Device Handles
// Open/grab lifecycle and the per-device decode state machine

use std::collections::VecDeque;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use log::{debug, warn};

use super::event::{DecodeStatus, Decoded, RawEvent};
use super::source::{Capabilities, DeviceBackend, DeviceState, EventSource};

/// Whether the handle holds an exclusive grab on its device
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum GrabState {
    Ungrabbed,
    Grabbed,
}

/// Decoder state of a device stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum DecodeState {
    /// Events are read in kernel order
    Normal,
    /// The kernel dropped events; synthesized state events are being replayed
    Resyncing,
}

/// Errors raised while bringing a device up. All of them abort startup.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("failed to initialize file descriptor for: {}", path.display())]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to initialize evdev device for path: {}", path.display())]
    ProtocolInitFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to grab device for path: {}", path.display())]
    GrabFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl InitError {
    /// Path of the device that failed
    pub fn path(&self) -> &Path {
        match self {
            InitError::OpenFailed { path, .. }
            | InitError::ProtocolInitFailed { path, .. }
            | InitError::GrabFailed { path, .. } => path,
        }
    }
}

/// Errors raised while decoding a ready device. These never tear the device down.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("device is not open: {}", .0.display())]
    NotOpen(PathBuf),

    #[error("failed to read events from {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to resynchronize {}: {source}", path.display())]
    Resync {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Failure to give back an exclusive grab. The handle is released regardless.
#[derive(Debug, thiserror::Error)]
#[error("failed to ungrab {}: {source}", path.display())]
pub struct ReleaseError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

struct OpenDevice<S> {
    source: S,
    capabilities: Capabilities,
    tracked: DeviceState,
    grab: GrabState,
}

/// One input device: its descriptor, grab and decode state.
///
/// A handle starts unopened, is brought up by [`DeviceHandle::initialize`] and
/// returned to the unopened state by [`DeviceHandle::release`].
pub struct DeviceHandle<S: EventSource> {
    path: PathBuf,
    device: Option<OpenDevice<S>>,
    decode: DecodeState,
    /// Events read from the kernel but not yet decoded
    pending: VecDeque<RawEvent>,
    /// Synthesized events still to be replayed while resyncing
    resync: VecDeque<RawEvent>,
}

impl<S: EventSource> DeviceHandle<S> {
    /// Create an unopened handle for `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            device: None,
            decode: DecodeState::Normal,
            pending: VecDeque::new(),
            resync: VecDeque::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.device.is_some()
    }

    pub fn grab_state(&self) -> GrabState {
        self.device
            .as_ref()
            .map_or(GrabState::Ungrabbed, |device| device.grab)
    }

    pub fn decode_state(&self) -> DecodeState {
        self.decode
    }

    /// Capability snapshot taken at open time, if the device is open
    pub fn capabilities(&self) -> Option<&Capabilities> {
        self.device.as_ref().map(|device| &device.capabilities)
    }

    /// Descriptor to register for readiness, if the device is open
    pub fn readiness_fd(&self) -> Option<RawFd> {
        self.device.as_ref().map(|device| device.source.as_raw_fd())
    }

    /// Open the device, snapshot its capabilities and optionally grab it.
    ///
    /// When the grab fails the device stays open and readable; the caller
    /// decides whether that is fatal.
    pub fn initialize<B>(&mut self, backend: &B, request_grab: bool) -> Result<(), InitError>
    where
        B: DeviceBackend<Source = S>,
    {
        if self.is_open() {
            if let Err(e) = self.release() {
                warn!("{}", e);
            }
        }

        let source = backend
            .open(&self.path)
            .map_err(|source| InitError::OpenFailed {
                path: self.path.clone(),
                source,
            })?;
        let protocol_failed = |source| InitError::ProtocolInitFailed {
            path: self.path.clone(),
            source,
        };
        let capabilities = source.capabilities().map_err(protocol_failed)?;
        let tracked = source.current_state().map_err(protocol_failed)?;

        let mut device = OpenDevice {
            source,
            capabilities,
            tracked,
            grab: GrabState::Ungrabbed,
        };
        let grab_result = if request_grab {
            device.source.grab()
        } else {
            Ok(())
        };
        if request_grab && grab_result.is_ok() {
            device.grab = GrabState::Grabbed;
        }

        debug!(
            "opened {} ({}), grab: {}",
            self.path.display(),
            device.capabilities.name.as_deref().unwrap_or("Unknown"),
            device.grab
        );
        self.device = Some(device);
        self.decode = DecodeState::Normal;

        grab_result.map_err(|source| InitError::GrabFailed {
            path: self.path.clone(),
            source,
        })
    }

    /// Decode the events available right now without blocking.
    ///
    /// The returned iterator ends when the device has no more data. A read
    /// failure is yielded once and also ends it.
    pub fn decode_ready(&mut self) -> Decoder<'_, S> {
        Decoder {
            handle: self,
            finished: false,
        }
    }

    /// Ungrab (if grabbed) and close the device. Calling it again is a no-op.
    pub fn release(&mut self) -> Result<(), ReleaseError> {
        self.pending.clear();
        self.resync.clear();
        self.decode = DecodeState::Normal;

        let Some(mut device) = self.device.take() else {
            return Ok(());
        };

        let mut result = Ok(());
        if device.grab == GrabState::Grabbed {
            if let Err(source) = device.source.ungrab() {
                result = Err(ReleaseError {
                    path: self.path.clone(),
                    source,
                });
            }
        }
        // Dropping the source closes the descriptor
        drop(device);
        debug!("released {}", self.path.display());
        result
    }

    fn next_raw(&mut self) -> Result<Option<RawEvent>, DecodeError> {
        if let Some(event) = self.pending.pop_front() {
            return Ok(Some(event));
        }

        let device = self
            .device
            .as_mut()
            .ok_or_else(|| DecodeError::NotOpen(self.path.clone()))?;
        loop {
            match device.source.fetch() {
                Ok(batch) => {
                    self.pending.extend(batch);
                    return Ok(self.pending.pop_front());
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(DecodeError::Read {
                        path: self.path.clone(),
                        source,
                    })
                }
            }
        }
    }

    /// Enter `Resyncing` after a SYN_DROPPED.
    ///
    /// The rest of the interrupted frame (up to and including its SYN_REPORT)
    /// and everything else already queued by the kernel is discarded, then the
    /// device state is queried and the difference to the tracked state is
    /// queued for replay.
    fn begin_resync(&mut self, marker: RawEvent) -> Result<(), DecodeError> {
        while let Some(event) = self.next_raw()? {
            if event.is_report() {
                break;
            }
        }

        let device = self
            .device
            .as_mut()
            .ok_or_else(|| DecodeError::NotOpen(self.path.clone()))?;

        // Everything still queued is already part of the state queried below
        self.pending.clear();
        loop {
            match device.source.fetch() {
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(DecodeError::Resync {
                        path: self.path.clone(),
                        source,
                    })
                }
            }
        }

        let current = device
            .source
            .current_state()
            .map_err(|source| DecodeError::Resync {
                path: self.path.clone(),
                source,
            })?;
        let delta = device.tracked.diff(&current, &device.capabilities);
        device.tracked = current;

        debug!(
            "{}: events dropped, replaying {} state change(s)",
            self.path.display(),
            delta.len()
        );
        self.resync.clear();
        self.resync.push_back(marker);
        self.resync.extend(delta);
        self.resync.push_back(RawEvent::report());
        self.decode = DecodeState::Resyncing;
        Ok(())
    }
}

/// Lazy, finite sequence of the records a device has ready.
pub struct Decoder<'a, S: EventSource> {
    handle: &'a mut DeviceHandle<S>,
    finished: bool,
}

impl<S: EventSource> Decoder<'_, S> {
    /// Decode state of the underlying handle at this point of the sequence
    pub fn state(&self) -> DecodeState {
        self.handle.decode
    }
}

impl<S: EventSource> Iterator for Decoder<'_, S> {
    type Item = Result<Decoded, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let handle = &mut *self.handle;

        loop {
            if handle.decode == DecodeState::Resyncing {
                if let Some(raw) = handle.resync.pop_front() {
                    return Some(Ok(Decoded {
                        status: DecodeStatus::Sync,
                        record: raw.into(),
                    }));
                }
                debug!("{}: resync complete", handle.path.display());
                handle.decode = DecodeState::Normal;
            }

            let raw = match handle.next_raw() {
                Ok(Some(raw)) => raw,
                Ok(None) => {
                    self.finished = true;
                    return None;
                }
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            };

            if raw.is_dropped() {
                if let Err(e) = handle.begin_resync(raw) {
                    handle.pending.clear();
                    self.finished = true;
                    return Some(Err(e));
                }
                continue;
            }

            if let Some(device) = handle.device.as_mut() {
                device.tracked.apply(&raw);
            }
            return Some(Ok(Decoded {
                status: DecodeStatus::Success,
                record: raw.into(),
            }));
        }
    }
}

impl<S: EventSource> Drop for DeviceHandle<S> {
    fn drop(&mut self) {
        // Never leave a device grabbed behind us
        if let Some(device) = self.device.as_mut() {
            if device.grab == GrabState::Grabbed {
                let _ = device.source.ungrab();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codes::{EV_KEY, EV_SYN, SYN_DROPPED};
    use crate::input::event::EventRecord;
    use crate::input::source::EventBatch;
    use std::cell::RefCell;
    use std::os::unix::net::UnixStream;
    use std::rc::Rc;

    #[derive(Default)]
    struct Script {
        batches: VecDeque<io::Result<Vec<RawEvent>>>,
        state: DeviceState,
        fail_capabilities: bool,
        fail_grab: bool,
        grabs: usize,
        ungrabs: usize,
        closes: usize,
    }

    struct ScriptedSource {
        script: Rc<RefCell<Script>>,
        fd: UnixStream,
    }

    impl AsRawFd for ScriptedSource {
        fn as_raw_fd(&self) -> RawFd {
            self.fd.as_raw_fd()
        }
    }

    impl Drop for ScriptedSource {
        fn drop(&mut self) {
            self.script.borrow_mut().closes += 1;
        }
    }

    impl EventSource for ScriptedSource {
        fn fetch(&mut self) -> io::Result<EventBatch> {
            match self.script.borrow_mut().batches.pop_front() {
                Some(batch) => batch.map(|events| events.into_iter().collect()),
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }

        fn capabilities(&self) -> io::Result<Capabilities> {
            if self.script.borrow().fail_capabilities {
                return Err(io::Error::from_raw_os_error(libc::ENOTTY));
            }
            Ok(Capabilities {
                name: Some("Scripted Keyboard".to_string()),
                event_types: [EV_SYN, EV_KEY].into_iter().collect(),
                keys: (1..=60).collect(),
                ..Capabilities::default()
            })
        }

        fn current_state(&self) -> io::Result<DeviceState> {
            Ok(self.script.borrow().state.clone())
        }

        fn grab(&mut self) -> io::Result<()> {
            let mut script = self.script.borrow_mut();
            if script.fail_grab {
                return Err(io::Error::from_raw_os_error(libc::EBUSY));
            }
            script.grabs += 1;
            Ok(())
        }

        fn ungrab(&mut self) -> io::Result<()> {
            self.script.borrow_mut().ungrabs += 1;
            Ok(())
        }
    }

    struct ScriptedBackend {
        script: Rc<RefCell<Script>>,
        missing: bool,
    }

    impl DeviceBackend for ScriptedBackend {
        type Source = ScriptedSource;

        fn open(&self, _path: &Path) -> io::Result<ScriptedSource> {
            if self.missing {
                return Err(io::ErrorKind::NotFound.into());
            }
            let (fd, _peer) = UnixStream::pair()?;
            Ok(ScriptedSource {
                script: self.script.clone(),
                fd,
            })
        }
    }

    fn backend() -> (ScriptedBackend, Rc<RefCell<Script>>) {
        let script = Rc::new(RefCell::new(Script::default()));
        (
            ScriptedBackend {
                script: script.clone(),
                missing: false,
            },
            script,
        )
    }

    fn key(code: u16, value: i32) -> RawEvent {
        RawEvent::new(EV_KEY, code, value)
    }

    fn records(handle: &mut DeviceHandle<ScriptedSource>) -> Vec<Decoded> {
        handle.decode_ready().map(|item| item.unwrap()).collect()
    }

    #[test]
    fn test_initialize_with_grab() {
        let (backend, script) = backend();
        let mut handle = DeviceHandle::new("/dev/input/event3");
        handle.initialize(&backend, true).unwrap();

        assert!(handle.is_open());
        assert_eq!(handle.grab_state(), GrabState::Grabbed);
        assert_eq!(handle.decode_state(), DecodeState::Normal);
        assert!(handle.readiness_fd().is_some());
        assert_eq!(
            handle.capabilities().and_then(|c| c.name.as_deref()),
            Some("Scripted Keyboard")
        );
        assert_eq!(script.borrow().grabs, 1);
    }

    #[test]
    fn test_initialize_without_grab() {
        let (backend, script) = backend();
        let mut handle = DeviceHandle::new("/dev/input/event3");
        handle.initialize(&backend, false).unwrap();

        assert_eq!(handle.grab_state(), GrabState::Ungrabbed);
        assert_eq!(script.borrow().grabs, 0);
    }

    #[test]
    fn test_open_failure() {
        let (mut backend, _script) = backend();
        backend.missing = true;
        let mut handle = DeviceHandle::new("/dev/input/event9");

        let err = handle.initialize(&backend, true).unwrap_err();
        assert!(matches!(err, InitError::OpenFailed { .. }));
        assert_eq!(err.path(), Path::new("/dev/input/event9"));
        assert!(!handle.is_open());
    }

    #[test]
    fn test_capability_failure() {
        let (backend, script) = backend();
        script.borrow_mut().fail_capabilities = true;
        let mut handle = DeviceHandle::new("/dev/input/event3");

        let err = handle.initialize(&backend, true).unwrap_err();
        assert!(matches!(err, InitError::ProtocolInitFailed { .. }));
        assert!(!handle.is_open());
        // the opened source was dropped
        assert_eq!(script.borrow().closes, 1);
    }

    #[test]
    fn test_grab_failure_leaves_device_readable() {
        let (backend, script) = backend();
        script.borrow_mut().fail_grab = true;
        script
            .borrow_mut()
            .batches
            .push_back(Ok(vec![key(30, 1), RawEvent::report()]));
        let mut handle = DeviceHandle::new("/dev/input/event3");

        let err = handle.initialize(&backend, true).unwrap_err();
        assert!(matches!(err, InitError::GrabFailed { .. }));
        assert!(handle.is_open());
        assert_eq!(handle.grab_state(), GrabState::Ungrabbed);
        assert_eq!(records(&mut handle).len(), 2);
    }

    #[test]
    fn test_decode_key_press() {
        let (backend, script) = backend();
        script
            .borrow_mut()
            .batches
            .push_back(Ok(vec![key(30, 1), RawEvent::report()]));
        let mut handle = DeviceHandle::new("/dev/input/event3");
        handle.initialize(&backend, true).unwrap();

        let decoded = records(&mut handle);
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].status, DecodeStatus::Success);
        assert_eq!(decoded[0].record, EventRecord::new("EV_KEY", "KEY_A", 1));
        assert_eq!(decoded[1].record, EventRecord::new("EV_SYN", "SYN_REPORT", 0));
        assert_eq!(handle.decode_state(), DecodeState::Normal);
    }

    #[test]
    fn test_decode_preserves_order_across_batches() {
        let (backend, script) = backend();
        {
            let mut script = script.borrow_mut();
            script.batches.push_back(Ok(vec![key(30, 1), RawEvent::report()]));
            script.batches.push_back(Ok(vec![key(30, 0), RawEvent::report()]));
        }
        let mut handle = DeviceHandle::new("/dev/input/event3");
        handle.initialize(&backend, false).unwrap();

        let values: Vec<i32> = records(&mut handle)
            .into_iter()
            .filter(|d| d.record.type_name == "EV_KEY")
            .map(|d| d.record.value)
            .collect();
        assert_eq!(values, vec![1, 0]);
    }

    #[test]
    fn test_decode_without_data_is_empty() {
        let (backend, _script) = backend();
        let mut handle = DeviceHandle::new("/dev/input/event3");
        handle.initialize(&backend, true).unwrap();

        assert!(records(&mut handle).is_empty());
        assert_eq!(handle.decode_state(), DecodeState::Normal);
    }

    #[test]
    fn test_decode_unopened_device() {
        let mut handle: DeviceHandle<ScriptedSource> = DeviceHandle::new("/dev/input/event3");
        let items: Vec<_> = handle.decode_ready().collect();
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(DecodeError::NotOpen(_))));
    }

    #[test]
    fn test_overflow_resyncs_to_device_state() {
        let (backend, script) = backend();
        let mut handle = DeviceHandle::new("/dev/input/event3");
        handle.initialize(&backend, true).unwrap();
        {
            let mut script = script.borrow_mut();
            script.batches.push_back(Ok(vec![
                key(30, 1),
                RawEvent::report(),
                RawEvent::new(EV_SYN, SYN_DROPPED, 0),
                // rest of the broken frame, discarded
                key(48, 1),
            ]));
            script.batches.push_back(Ok(vec![RawEvent::report(), key(31, 1)]));
            // while events were lost: A released, B and S pressed
            script.state.keys.insert(48);
            script.state.keys.insert(31);
        }

        let mut decoder = handle.decode_ready();
        let mut seen = Vec::new();
        while let Some(item) = decoder.next() {
            let decoded = item.unwrap();
            seen.push((decoded.status, decoded.record.to_string(), decoder.state()));
        }
        drop(decoder);

        let expected = vec![
            (DecodeStatus::Success, "EV_KEY KEY_A 1", DecodeState::Normal),
            (DecodeStatus::Success, "EV_SYN SYN_REPORT 0", DecodeState::Normal),
            (DecodeStatus::Sync, "EV_SYN SYN_DROPPED 0", DecodeState::Resyncing),
            (DecodeStatus::Sync, "EV_KEY KEY_A 0", DecodeState::Resyncing),
            (DecodeStatus::Sync, "EV_KEY KEY_S 1", DecodeState::Resyncing),
            (DecodeStatus::Sync, "EV_KEY KEY_B 1", DecodeState::Resyncing),
            (DecodeStatus::Sync, "EV_SYN SYN_REPORT 0", DecodeState::Resyncing),
        ];
        let seen: Vec<_> = seen
            .iter()
            .map(|(status, record, state)| (*status, record.as_str(), *state))
            .collect();
        assert_eq!(seen, expected);
        assert_eq!(handle.decode_state(), DecodeState::Normal);
        assert!(script.borrow().batches.is_empty());
    }

    #[test]
    fn test_overflow_drops_frames_queued_behind_it() {
        let (backend, script) = backend();
        let mut handle = DeviceHandle::new("/dev/input/event3");
        handle.initialize(&backend, true).unwrap();
        {
            let mut script = script.borrow_mut();
            // a newer complete frame arrives in the same read as the drop
            script.batches.push_back(Ok(vec![
                RawEvent::new(EV_SYN, SYN_DROPPED, 0),
                RawEvent::report(),
                key(48, 1),
                RawEvent::report(),
            ]));
            script.batches.push_back(Ok(vec![key(49, 1), RawEvent::report()]));
            script.state.keys.insert(48);
            script.state.keys.insert(49);
        }

        let rendered: Vec<String> = records(&mut handle)
            .iter()
            .map(|d| format!("{} {}", d.status, d.record))
            .collect();
        assert_eq!(
            rendered,
            vec![
                "sync EV_SYN SYN_DROPPED 0",
                "sync EV_KEY KEY_B 1",
                "sync EV_KEY KEY_N 1",
                "sync EV_SYN SYN_REPORT 0",
            ]
        );

        // events arriving after the resync decode normally
        script
            .borrow_mut()
            .batches
            .push_back(Ok(vec![key(48, 0), RawEvent::report()]));
        let after = records(&mut handle);
        assert_eq!(after.len(), 2);
        assert!(after.iter().all(|d| d.status == DecodeStatus::Success));
        assert_eq!(after[0].record, EventRecord::new("EV_KEY", "KEY_B", 0));
    }

    #[test]
    fn test_overflow_without_state_change() {
        let (backend, script) = backend();
        script.borrow_mut().batches.push_back(Ok(vec![
            RawEvent::new(EV_SYN, SYN_DROPPED, 0),
            RawEvent::report(),
        ]));
        let mut handle = DeviceHandle::new("/dev/input/event3");
        handle.initialize(&backend, true).unwrap();

        let decoded = records(&mut handle);
        // marker and the closing report only
        assert_eq!(decoded.len(), 2);
        assert!(decoded.iter().all(|d| d.status == DecodeStatus::Sync));
        assert_eq!(handle.decode_state(), DecodeState::Normal);
    }

    #[test]
    fn test_read_error_is_reported_once() {
        let (backend, script) = backend();
        {
            let mut script = script.borrow_mut();
            script
                .batches
                .push_back(Err(io::Error::from_raw_os_error(libc::ENODEV)));
            script.batches.push_back(Ok(vec![key(30, 1)]));
        }
        let mut handle = DeviceHandle::new("/dev/input/event3");
        handle.initialize(&backend, true).unwrap();

        let items: Vec<_> = handle.decode_ready().collect();
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(DecodeError::Read { .. })));
        assert!(handle.is_open());

        // the next readiness round continues normally
        assert_eq!(records(&mut handle).len(), 1);
    }

    #[test]
    fn test_release_is_idempotent() {
        let (backend, script) = backend();
        let mut handle = DeviceHandle::new("/dev/input/event3");
        handle.initialize(&backend, true).unwrap();

        handle.release().unwrap();
        handle.release().unwrap();

        assert!(!handle.is_open());
        assert!(handle.capabilities().is_none());
        assert_eq!(handle.grab_state(), GrabState::Ungrabbed);
        let script = script.borrow();
        assert_eq!(script.ungrabs, 1);
        assert_eq!(script.closes, 1);
    }

    #[test]
    fn test_drop_ungrabs() {
        let (backend, script) = backend();
        {
            let mut handle = DeviceHandle::new("/dev/input/event3");
            handle.initialize(&backend, true).unwrap();
        }
        let script = script.borrow();
        assert_eq!(script.ungrabs, 1);
        assert_eq!(script.closes, 1);
    }
}
