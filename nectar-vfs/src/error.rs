use std::io;

use thiserror::Error;

/// Errors surfaced by the virtual filesystem.
///
/// The variants deliberately mirror the POSIX conditions the rest of the
/// daemon renders to clients ("No such file or directory", EACCES, ...).
#[derive(Debug, Error)]
pub enum VfsError {
    #[error("no such file or directory")]
    NotFound,
    #[error("permission denied")]
    PermissionDenied,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("file exists")]
    AlreadyExists,
    #[error("too many levels of symbolic links")]
    LinkLoop,
    #[error("bad filesystem image: {0}")]
    BadImage(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl VfsError {
    /// Collapse a host-filesystem error from the upper layer into the
    /// matching VFS condition, keeping everything else as plain I/O.
    pub fn from_upper(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => VfsError::NotFound,
            io::ErrorKind::PermissionDenied => VfsError::PermissionDenied,
            io::ErrorKind::AlreadyExists => VfsError::AlreadyExists,
            _ => VfsError::Io(err),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, VfsError::NotFound)
    }
}

impl From<VfsError> for io::Error {
    fn from(err: VfsError) -> io::Error {
        let kind = match &err {
            VfsError::NotFound => io::ErrorKind::NotFound,
            VfsError::PermissionDenied => io::ErrorKind::PermissionDenied,
            VfsError::AlreadyExists => io::ErrorKind::AlreadyExists,
            VfsError::Io(e) => e.kind(),
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, VfsError>;
