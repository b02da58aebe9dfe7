// Evgrab Input Layer - Path Validation
// Checks a device path before it is handed to the registry

use std::ffi::CString;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

/// Reasons a path cannot be captured
#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("{} is not a valid device", .0.display())]
    NotADevice(PathBuf),

    #[error("{} is not readable", .0.display())]
    NotReadable(PathBuf),
}

/// Check that `path` exists, is a character device and is readable by us.
pub fn validate_device_path(path: &Path) -> Result<(), PathError> {
    let metadata = fs::metadata(path).map_err(|_| PathError::NotADevice(path.to_path_buf()))?;
    if !metadata.file_type().is_char_device() {
        return Err(PathError::NotADevice(path.to_path_buf()));
    }
    if !is_readable(path) {
        return Err(PathError::NotReadable(path.to_path_buf()));
    }
    Ok(())
}

fn is_readable(path: &Path) -> bool {
    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    unsafe { libc::access(c_path.as_ptr(), libc::R_OK) == 0 }
}
