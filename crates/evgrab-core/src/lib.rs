// Evgrab Core Library
// Exclusive capture of evdev input devices behind a single readiness loop

pub mod codes;
pub mod event;
pub mod input;
pub mod settings;

pub use event::{
    CaptureOptions, ControlChannel, ControlError, EventSink, MultiplexError, Multiplexer,
    Orchestrator, OrchestratorError, OrchestratorState, ShutdownHandle, Termination, Token,
};
pub use input::{
    validate_device_path, Capabilities, DecodeError, DecodeState, DecodeStatus, Decoded,
    DeviceBackend, DeviceHandle, DeviceRegistry, DeviceState, EventRecord, EventSource,
    GrabState, InitError, PathError, RawEvent, RegistryError, ReleaseError,
};
#[cfg(feature = "evdev-backend")]
pub use input::{EvdevBackend, EvdevSource};
pub use settings::{Settings, SettingsError};
