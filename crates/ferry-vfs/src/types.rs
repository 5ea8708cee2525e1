//! Metadata, attribute changes and open flags.
//!
//! Shared by the backends and the request dispatcher. Everything here is
//! plain data and serializable, so a protocol layer can encode it however
//! it likes.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// What a path points at. Symlinks are only reported by `lstat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    File,
    Directory,
    Symlink,
}

impl FileType {
    pub fn is_file(&self) -> bool {
        *self == FileType::File
    }

    pub fn is_dir(&self) -> bool {
        *self == FileType::Directory
    }

    pub fn is_symlink(&self) -> bool {
        *self == FileType::Symlink
    }
}

/// Metadata of one path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileAttr {
    /// Bytes for files, target length for symlinks, 0 for directories.
    pub size: u64,
    pub kind: FileType,
    /// Permission bits, e.g. `0o644`.
    pub perm: u32,
    pub mtime: SystemTime,
    pub atime: Option<SystemTime>,
    /// Owner ids, when the backend tracks ownership.
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl FileAttr {
    fn fresh(kind: FileType, size: u64, perm: u32) -> Self {
        let now = SystemTime::now();
        Self {
            size,
            kind,
            perm,
            mtime: now,
            atime: Some(now),
            uid: None,
            gid: None,
        }
    }

    /// A just-created regular file.
    pub fn file(size: u64, perm: u32) -> Self {
        Self::fresh(FileType::File, size, perm)
    }

    /// A just-created directory.
    pub fn directory(perm: u32) -> Self {
        Self::fresh(FileType::Directory, 0, perm)
    }

    /// A just-created symlink whose target path is `target_len` bytes.
    pub fn symlink(target_len: u64) -> Self {
        Self::fresh(FileType::Symlink, target_len, 0o777)
    }

    pub fn is_file(&self) -> bool {
        self.kind.is_file()
    }

    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    pub fn is_symlink(&self) -> bool {
        self.kind.is_symlink()
    }
}

/// One listing entry. Carries its metadata so a listing needs no stat per
/// name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirEntry {
    /// Base name only.
    pub name: String,
    pub attr: FileAttr,
}

impl DirEntry {
    pub fn new(name: impl Into<String>, attr: FileAttr) -> Self {
        Self {
            name: name.into(),
            attr,
        }
    }

    pub fn kind(&self) -> FileType {
        self.attr.kind
    }
}

/// Changes applied by `setattr`. A `None` field is left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetAttr {
    /// Truncate or extend to this length.
    pub size: Option<u64>,
    pub mtime: Option<SystemTime>,
    pub atime: Option<SystemTime>,
    pub perm: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl SetAttr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_perm(mut self, perm: u32) -> Self {
        self.perm = Some(perm);
        self
    }

    /// Owner and group always change together.
    pub fn with_owner(mut self, uid: u32, gid: u32) -> Self {
        (self.uid, self.gid) = (Some(uid), Some(gid));
        self
    }

    /// Access and modification times always change together.
    pub fn with_times(mut self, atime: SystemTime, mtime: SystemTime) -> Self {
        (self.atime, self.mtime) = (Some(atime), Some(mtime));
        self
    }

    /// Nothing to change.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Open flags as requested by a protocol client.
///
/// `append` is carried so the dispatcher can detect resume requests; it is
/// never forwarded to a backend (see [`OsOpenFlags`]).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    /// Client asked to continue at the end of the file.
    pub append: bool,
    pub create: bool,
    pub truncate: bool,
    pub exclusive: bool,
}

impl OpenFlags {
    pub fn read() -> Self {
        Self {
            read: true,
            ..Default::default()
        }
    }

    pub fn write() -> Self {
        Self {
            write: true,
            ..Default::default()
        }
    }

    /// Create and truncate, the usual "upload" open.
    pub fn create_truncate() -> Self {
        Self {
            write: true,
            create: true,
            truncate: true,
            ..Default::default()
        }
    }

    /// Append to an existing file (resume).
    pub fn append() -> Self {
        Self {
            write: true,
            append: true,
            ..Default::default()
        }
    }

    /// Translate to the flags a backend open receives.
    ///
    /// Positional writes cannot work with an OS append mode, so `append` is
    /// dropped here and only used to detect resumes.
    pub fn to_os_flags(&self) -> OsOpenFlags {
        OsOpenFlags {
            read: self.read && self.write,
            create: self.create,
            truncate: self.truncate,
            exclusive: self.exclusive,
        }
    }
}

/// Flags for a backend write open.
///
/// Write access is implied. There is deliberately no append flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsOpenFlags {
    /// Open read-write instead of write-only.
    pub read: bool,
    /// Create a missing file.
    pub create: bool,
    /// Drop existing content.
    pub truncate: bool,
    /// Refuse to open a file that already exists.
    pub exclusive: bool,
}

impl OsOpenFlags {
    /// Write-only, create, truncate.
    pub fn create_truncate() -> Self {
        Self {
            read: false,
            create: true,
            truncate: true,
            exclusive: false,
        }
    }
}

/// What a backend can do beyond the basic operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Renames are atomic, so uploads can be staged and moved into place.
    pub atomic_upload: bool,
    /// Storage lives on this host and its usage is tracked in the local
    /// quota ledger as it changes.
    pub local_quota_ledger: bool,
    /// Ownership can be set on created paths.
    pub ownership: bool,
}
