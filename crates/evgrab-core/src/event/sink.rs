// Evgrab Event Sink
// Where decoded records are handed to the caller

use std::path::Path;

use crate::input::Decoded;

/// Receives every record the event loop decodes.
pub trait EventSink {
    /// Called once per device, in registry order, before it is opened
    fn announce(&mut self, _path: &Path) {}

    /// Called for each decoded record, in device stream order
    fn emit(&mut self, path: &Path, decoded: &Decoded);
}

impl<F> EventSink for F
where
    F: FnMut(&Path, &Decoded),
{
    fn emit(&mut self, path: &Path, decoded: &Decoded) {
        self(path, decoded)
    }
}
