// Evgrab Input Layer
// Device handles, their registry and the sources they read from

pub mod device;
pub mod event;
#[cfg(feature = "evdev-backend")]
mod evdev_backend;
pub mod registry;
pub mod source;
mod validate;

pub use device::{
    DecodeError, DecodeState, Decoder, DeviceHandle, GrabState, InitError, ReleaseError,
};
pub use event::{DecodeStatus, Decoded, EventRecord, RawEvent};
#[cfg(feature = "evdev-backend")]
pub use evdev_backend::{EvdevBackend, EvdevSource};
pub use registry::{DeviceRegistry, RegistryError};
pub use source::{Capabilities, DeviceBackend, DeviceState, EventBatch, EventSource};
pub use validate::{validate_device_path, PathError};
