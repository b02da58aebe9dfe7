// Evgrab Input Layer - Event Values
// Raw kernel events and the normalized records handed to the sink

use std::fmt;

use crate::codes::{self, EV_SYN, SYN_DROPPED, SYN_REPORT, UNKNOWN_NAME};

/// A single `input_event` as read from the device, without its timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawEvent {
    pub event_type: u16,
    pub code: u16,
    pub value: i32,
}

impl RawEvent {
    pub const fn new(event_type: u16, code: u16, value: i32) -> Self {
        Self {
            event_type,
            code,
            value,
        }
    }

    /// The `EV_SYN/SYN_REPORT` frame terminator
    pub const fn report() -> Self {
        Self::new(EV_SYN, SYN_REPORT, 0)
    }

    /// Kernel signal that its buffer overflowed and events were discarded
    pub fn is_dropped(&self) -> bool {
        self.event_type == EV_SYN && self.code == SYN_DROPPED
    }

    pub fn is_report(&self) -> bool {
        self.event_type == EV_SYN && self.code == SYN_REPORT
    }
}

#[cfg(feature = "evdev-backend")]
impl From<evdev::InputEvent> for RawEvent {
    fn from(event: evdev::InputEvent) -> Self {
        Self::new(event.event_type().0, event.code(), event.value())
    }
}

/// Normalized, named form of a decoded event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub type_name: String,
    pub code_name: String,
    pub value: i32,
}

impl EventRecord {
    pub fn new(type_name: impl Into<String>, code_name: impl Into<String>, value: i32) -> Self {
        Self {
            type_name: type_name.into(),
            code_name: code_name.into(),
            value,
        }
    }
}

impl From<RawEvent> for EventRecord {
    fn from(raw: RawEvent) -> Self {
        Self::new(
            codes::event_type_name(raw.event_type).unwrap_or(UNKNOWN_NAME),
            codes::event_code_name(raw.event_type, raw.code).unwrap_or(UNKNOWN_NAME),
            raw.value,
        )
    }
}

impl fmt::Display for EventRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.type_name, self.code_name, self.value)
    }
}

/// How a record was produced by the decoder.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    strum_macros::Display,
    strum_macros::AsRefStr,
    strum_macros::EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum DecodeStatus {
    /// Read from the device stream in order
    Success,
    /// Produced while resynchronizing after a drop
    Sync,
}

/// A record together with the status of the decode that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub status: DecodeStatus,
    pub record: EventRecord,
}
