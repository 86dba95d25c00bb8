//! Unified error model for the storage core.
//! Every public operation returns `FsResult<T>`; the outer RPC layer maps errors with
//! `code_str()` / `http_status()` instead of matching on io errors itself.

use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "detail", rename_all = "snake_case")]
pub enum FsError {
    /// Target or one of its ancestors does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// Conflict policy violation.
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// Denied by the OS or by the ACL check.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    /// A user or group has no local identity.
    #[error("no local identity for '{0}'")]
    NoIdentityMapping(String),
    /// Unexpected OS failure. Aborts the current top-level operation.
    #[error("critical: {0}")]
    Critical(String),
}

pub type FsResult<T> = Result<T, FsError>;

impl FsError {
    pub fn not_found<S: Into<String>>(path: S) -> Self { FsError::NotFound(path.into()) }
    pub fn already_exists<S: Into<String>>(path: S) -> Self { FsError::AlreadyExists(path.into()) }
    pub fn permission<S: Into<String>>(path: S) -> Self { FsError::PermissionDenied(path.into()) }
    pub fn bad_request<S: Into<String>>(msg: S) -> Self { FsError::BadRequest(msg.into()) }
    pub fn critical<S: Into<String>>(msg: S) -> Self { FsError::Critical(msg.into()) }

    /// Classify an io error raised while operating on `path`.
    pub fn from_io(err: &io::Error, path: &str) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => return FsError::NotFound(path.to_string()),
            io::ErrorKind::PermissionDenied => return FsError::PermissionDenied(path.to_string()),
            io::ErrorKind::AlreadyExists => return FsError::AlreadyExists(path.to_string()),
            _ => {}
        }
        match err.raw_os_error() {
            Some(libc::EPERM) | Some(libc::EACCES) => FsError::PermissionDenied(path.to_string()),
            Some(libc::ENOENT) | Some(libc::ENOTDIR) => FsError::NotFound(path.to_string()),
            Some(libc::EEXIST) => FsError::AlreadyExists(path.to_string()),
            Some(libc::ENAMETOOLONG) => FsError::BadRequest(format!("path too long: {}", path)),
            // the tree changed under a recursive operation
            Some(libc::ENOTEMPTY) => FsError::Critical(format!("{}: directory not empty", path)),
            _ => FsError::Critical(format!("{}: {}", path, err)),
        }
    }

    pub fn code_str(&self) -> &'static str {
        match self {
            FsError::NotFound(_) => "not_found",
            FsError::AlreadyExists(_) => "already_exists",
            FsError::PermissionDenied(_) => "permission_denied",
            FsError::BadRequest(_) => "bad_request",
            FsError::NoIdentityMapping(_) => "no_identity_mapping",
            FsError::Critical(_) => "critical",
        }
    }

    /// Map to HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            FsError::NotFound(_) => 404,
            FsError::AlreadyExists(_) => 409,
            FsError::PermissionDenied(_) => 403,
            FsError::BadRequest(_) => 400,
            FsError::NoIdentityMapping(_) => 400,
            FsError::Critical(_) => 500,
        }
    }

    /// Expected conditions the caller can recover from; everything else aborts.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, FsError::Critical(_))
    }
}

impl From<io::Error> for FsError {
    fn from(err: io::Error) -> Self {
        FsError::from_io(&err, "<stream>")
    }
}

/// Attach a logical path to io results.
pub trait IoResultExt<T> {
    fn at(self, path: &str) -> FsResult<T>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn at(self, path: &str) -> FsResult<T> {
        self.map_err(|e| FsError::from_io(&e, path))
    }
}
