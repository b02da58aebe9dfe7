// Evgrab Input Layer - Device Registry
// Ordered ownership of every device handle

use std::path::{Path, PathBuf};

use log::warn;

use super::device::{DeviceHandle, ReleaseError};
use super::source::EventSource;

/// Errors from growing the registry
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("failed to allocate device handle for: {}", .0.display())]
    Allocation(PathBuf),
}

/// Devices in the order they were supplied.
///
/// Duplicate paths are accepted; each one gets its own handle.
pub struct DeviceRegistry<S: EventSource> {
    handles: Vec<DeviceHandle<S>>,
}

impl<S: EventSource> DeviceRegistry<S> {
    pub fn new() -> Self {
        Self {
            handles: Vec::new(),
        }
    }

    /// Append an unopened handle for `path`
    pub fn append(
        &mut self,
        path: impl Into<PathBuf>,
    ) -> Result<&mut DeviceHandle<S>, RegistryError> {
        let path = path.into();
        if self.handles.try_reserve(1).is_err() {
            return Err(RegistryError::Allocation(path));
        }
        let index = self.handles.len();
        self.handles.push(DeviceHandle::new(path));
        Ok(&mut self.handles[index])
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&DeviceHandle<S>> {
        self.handles.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut DeviceHandle<S>> {
        self.handles.get_mut(index)
    }

    /// Handles in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &DeviceHandle<S>> {
        self.handles.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut DeviceHandle<S>> {
        self.handles.iter_mut()
    }

    /// Paths in insertion order
    pub fn paths(&self) -> Vec<&Path> {
        self.handles.iter().map(DeviceHandle::path).collect()
    }

    /// Release every handle in insertion order.
    ///
    /// A failing device does not stop the others from being released; its
    /// error is logged and returned.
    pub fn release_all(&mut self) -> Vec<ReleaseError> {
        let mut errors = Vec::new();
        for handle in &mut self.handles {
            if let Err(e) = handle.release() {
                warn!("{}", e);
                errors.push(e);
            }
        }
        errors
    }
}

impl<S: EventSource> Default for DeviceRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}
