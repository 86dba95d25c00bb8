//! Thin wrapper over extended attributes. Operates on the entry itself, never on a
//! symlink's target.

use std::io;
use std::path::Path;

use tracing::debug;

use crate::error::{FsError, FsResult};

pub const SENSITIVITY: &str = "user.sensitivity";

#[cfg(target_os = "linux")]
const NO_ATTR: i32 = libc::ENODATA;
#[cfg(not(target_os = "linux"))]
const NO_ATTR: i32 = libc::ENOATTR;

fn is_missing(err: &io::Error) -> bool {
    err.raw_os_error() == Some(NO_ATTR)
}

// Linux aliases EOPNOTSUPP to ENOTSUP
#[cfg(target_os = "linux")]
fn is_unsupported(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ENOTSUP)
}
#[cfg(not(target_os = "linux"))]
fn is_unsupported(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::ENOTSUP) | Some(libc::EOPNOTSUPP))
}

/// Read an attribute. Missing attributes and filesystems without xattr support read as `None`.
pub fn get(host: &Path, name: &str, logical: &str) -> FsResult<Option<Vec<u8>>> {
    match xattr::get(host, name) {
        Ok(v) => Ok(v),
        Err(e) if is_missing(&e) || is_unsupported(&e) => Ok(None),
        Err(e) => Err(FsError::from_io(&e, logical)),
    }
}

pub fn set(host: &Path, name: &str, value: &[u8], logical: &str) -> FsResult<()> {
    debug!(target: "storage::core", "setxattr {} {} ({} bytes)", logical, name, value.len());
    match xattr::set(host, name, value) {
        Ok(()) => Ok(()),
        Err(e) if is_unsupported(&e) => {
            Err(FsError::critical(format!("{}: extended attribute {} not supported", logical, name)))
        }
        Err(e) => Err(FsError::from_io(&e, logical)),
    }
}

/// Remove an attribute; removing a missing attribute succeeds.
pub fn remove(host: &Path, name: &str, logical: &str) -> FsResult<()> {
    debug!(target: "storage::core", "removexattr {} {}", logical, name);
    match xattr::remove(host, name) {
        Ok(()) => Ok(()),
        Err(e) if is_missing(&e) || is_unsupported(&e) => Ok(()),
        Err(e) => Err(FsError::from_io(&e, logical)),
    }
}
