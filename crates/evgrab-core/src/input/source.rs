// Evgrab Input Layer - Device Sources
// The seam between device handles and the kernel device they read from

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use smallvec::SmallVec;

use super::event::RawEvent;
use crate::codes::{ABS_MT_SLOT, EV_ABS, EV_KEY, EV_LED, EV_SW};

/// Events returned by a single read from a device.
pub type EventBatch = SmallVec<[RawEvent; 16]>;

/// An open input device.
///
/// `fetch` must not block: when the kernel buffer is empty it fails with
/// [`io::ErrorKind::WouldBlock`].
pub trait EventSource: AsRawFd {
    /// Read the events currently buffered by the kernel
    fn fetch(&mut self) -> io::Result<EventBatch>;

    /// Query the protocol metadata needed to decode this device
    fn capabilities(&self) -> io::Result<Capabilities>;

    /// Query the current state of keys, LEDs, switches and absolute axes
    fn current_state(&self) -> io::Result<DeviceState>;

    /// Request exclusive access (EVIOCGRAB)
    fn grab(&mut self) -> io::Result<()>;

    /// Release exclusive access
    fn ungrab(&mut self) -> io::Result<()>;
}

/// Opens device paths into sources.
pub trait DeviceBackend {
    type Source: EventSource;

    /// Open `path` for non-blocking reads
    fn open(&self, path: &Path) -> io::Result<Self::Source>;
}

/// Device capabilities, captured once when the device is opened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Name reported by the device, if any
    pub name: Option<String>,
    /// Supported event types (EV_*)
    pub event_types: BTreeSet<u16>,
    /// Supported EV_KEY codes
    pub keys: BTreeSet<u16>,
    /// Supported EV_LED codes
    pub leds: BTreeSet<u16>,
    /// Supported EV_SW codes
    pub switches: BTreeSet<u16>,
    /// Supported EV_ABS codes
    pub absolute_axes: BTreeSet<u16>,
}

impl Capabilities {
    pub fn supports(&self, event_type: u16) -> bool {
        self.event_types.contains(&event_type)
    }

    pub fn supports_code(&self, event_type: u16, code: u16) -> bool {
        let codes = match event_type {
            EV_KEY => &self.keys,
            EV_LED => &self.leds,
            EV_SW => &self.switches,
            EV_ABS => &self.absolute_axes,
            _ => return self.supports(event_type),
        };
        self.supports(event_type) && codes.contains(&code)
    }
}

/// Stateful part of a device: what is held down, lit, switched or where an
/// absolute axis currently sits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceState {
    pub keys: BTreeSet<u16>,
    pub leds: BTreeSet<u16>,
    pub switches: BTreeSet<u16>,
    pub absolute: BTreeMap<u16, i32>,
}

impl DeviceState {
    /// Update the state with an event read from the stream.
    pub fn apply(&mut self, event: &RawEvent) {
        match event.event_type {
            EV_KEY => toggle(&mut self.keys, event.code, event.value),
            EV_LED => toggle(&mut self.leds, event.code, event.value),
            EV_SW => toggle(&mut self.switches, event.code, event.value),
            EV_ABS if event.code < ABS_MT_SLOT => {
                self.absolute.insert(event.code, event.value);
            }
            _ => {}
        }
    }

    /// Events that move a reader from `self` to `current`, restricted to
    /// codes the device supports. Does not include the closing SYN_REPORT.
    pub fn diff(&self, current: &DeviceState, capabilities: &Capabilities) -> Vec<RawEvent> {
        let mut events = Vec::new();
        diff_set(EV_KEY, &self.keys, &current.keys, capabilities, &mut events);
        diff_set(EV_LED, &self.leds, &current.leds, capabilities, &mut events);
        diff_set(EV_SW, &self.switches, &current.switches, capabilities, &mut events);

        for (&axis, &value) in &current.absolute {
            if axis >= ABS_MT_SLOT || !capabilities.supports_code(EV_ABS, axis) {
                continue;
            }
            if self.absolute.get(&axis) != Some(&value) {
                events.push(RawEvent::new(EV_ABS, axis, value));
            }
        }
        events
    }
}

fn toggle(set: &mut BTreeSet<u16>, code: u16, value: i32) {
    // value 2 is autorepeat, the key stays down
    if value == 0 {
        set.remove(&code);
    } else {
        set.insert(code);
    }
}

fn diff_set(
    event_type: u16,
    known: &BTreeSet<u16>,
    current: &BTreeSet<u16>,
    capabilities: &Capabilities,
    out: &mut Vec<RawEvent>,
) {
    for &code in known.difference(current) {
        if capabilities.supports_code(event_type, code) {
            out.push(RawEvent::new(event_type, code, 0));
        }
    }
    for &code in current.difference(known) {
        if capabilities.supports_code(event_type, code) {
            out.push(RawEvent::new(event_type, code, 1));
        }
    }
}
