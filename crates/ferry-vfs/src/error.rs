//! Storage errors.
//!
//! Path-carrying variants hold the backend path as text so they can be
//! logged without the backend's path type.

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VfsError {
    #[error("{0}: no such file or directory")]
    NotFound(String),

    #[error("{0}: already exists")]
    AlreadyExists(String),

    /// Refused by the storage layer itself, below the user's permissions.
    #[error("{0}: access refused by backend")]
    PermissionDenied(String),

    #[error("{0}: not a directory")]
    NotADirectory(String),

    #[error("{0}: is a directory")]
    IsADirectory(String),

    #[error("{0}: directory not empty")]
    DirectoryNotEmpty(String),

    /// The resolved path lies outside the backend root.
    #[error("{0}: outside the backend root")]
    PathEscapesRoot(String),

    #[error("{0}: invalid path")]
    InvalidPath(String),

    #[error("{0}: not a symlink")]
    NotASymlink(String),

    /// Work on an open file was stopped through its cancel token.
    #[error("cancelled")]
    Cancelled,

    /// I/O on a handle after `close`.
    #[error("handle already closed")]
    Closed,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("{0}")]
    Other(String),
}

macro_rules! path_error {
    ($($fn_name:ident => $variant:ident),* $(,)?) => {
        $(
            pub fn $fn_name(path: impl Into<String>) -> Self {
                Self::$variant(path.into())
            }
        )*
    };
}

impl VfsError {
    path_error! {
        not_found => NotFound,
        already_exists => AlreadyExists,
        permission_denied => PermissionDenied,
        not_a_directory => NotADirectory,
        is_a_directory => IsADirectory,
        directory_not_empty => DirectoryNotEmpty,
        path_escapes_root => PathEscapesRoot,
        invalid_path => InvalidPath,
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Closest OS error kind, for errors raised by backends as well as
    /// those passed through from the OS.
    pub fn kind(&self) -> io::ErrorKind {
        match self {
            Self::NotFound(_) => io::ErrorKind::NotFound,
            Self::AlreadyExists(_) => io::ErrorKind::AlreadyExists,
            Self::PermissionDenied(_) | Self::PathEscapesRoot(_) => io::ErrorKind::PermissionDenied,
            Self::NotADirectory(_) => io::ErrorKind::NotADirectory,
            Self::IsADirectory(_) => io::ErrorKind::IsADirectory,
            Self::DirectoryNotEmpty(_) => io::ErrorKind::DirectoryNotEmpty,
            Self::InvalidPath(_) | Self::NotASymlink(_) => io::ErrorKind::InvalidInput,
            Self::Cancelled => io::ErrorKind::Interrupted,
            Self::Io(e) => e.kind(),
            Self::Closed | Self::Other(_) => io::ErrorKind::Other,
        }
    }

    /// Nothing exists at the path.
    pub fn is_not_found(&self) -> bool {
        self.kind() == io::ErrorKind::NotFound
    }

    /// The backend refused access, including root escapes.
    pub fn is_permission_denied(&self) -> bool {
        self.kind() == io::ErrorKind::PermissionDenied
    }
}

pub type VfsResult<T> = Result<T, VfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_detection() {
        assert!(VfsError::not_found("a").is_not_found());
        assert!(VfsError::Io(io::Error::from(io::ErrorKind::NotFound)).is_not_found());
        assert!(!VfsError::is_a_directory("a").is_not_found());
    }

    #[test]
    fn test_permission_detection() {
        assert!(VfsError::permission_denied("a").is_permission_denied());
        assert!(VfsError::path_escapes_root("../x").is_permission_denied());
        assert!(!VfsError::Cancelled.is_permission_denied());
    }

    #[test]
    fn test_messages_lead_with_path() {
        assert_eq!(
            VfsError::directory_not_empty("/a").to_string(),
            "/a: directory not empty"
        );
        assert_eq!(VfsError::Closed.kind(), io::ErrorKind::Other);
    }
}
