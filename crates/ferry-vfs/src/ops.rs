//! VFS operations trait.
//!
//! Virtual request paths are turned into backend paths once, through
//! [`VfsOps::resolve_path`]. Every other operation takes the resolved path.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use super::types::{Capabilities, DirEntry, FileAttr, OsOpenFlags, SetAttr};
use super::VfsResult;

/// Prefix of staging file names used for atomic uploads.
pub const ATOMIC_UPLOAD_PREFIX: &str = ".ferry-upload.";

/// A file opened for streaming I/O.
///
/// Reads and writes are positional, so a protocol layer can service
/// out-of-order requests against one handle.
#[async_trait]
pub trait FileHandle: Send + Sync {
    /// Read into `buf` starting at `offset`. Returns 0 at end of file.
    async fn read_at(&mut self, buf: &mut [u8], offset: u64) -> VfsResult<usize>;

    /// Write all of `data` at `offset`. Returns the number of bytes written.
    async fn write_at(&mut self, data: &[u8], offset: u64) -> VfsResult<usize>;

    /// Flush and release the handle. Further I/O fails with `Closed`.
    async fn close(&mut self) -> VfsResult<()>;
}

/// Result of an open: the handle plus the token that aborts work on it.
pub struct OpenFile {
    pub handle: Box<dyn FileHandle>,
    pub cancel: CancellationToken,
}

impl OpenFile {
    pub fn new(handle: Box<dyn FileHandle>) -> Self {
        Self {
            handle,
            cancel: CancellationToken::new(),
        }
    }
}

impl std::fmt::Debug for OpenFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenFile")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Core VFS operations trait.
#[async_trait]
pub trait VfsOps: Send + Sync {
    // ========================================================================
    // Identity
    // ========================================================================

    /// Short backend name for logs ("local", "memory", ...).
    fn name(&self) -> &str;

    /// What this backend supports.
    fn capabilities(&self) -> Capabilities;

    // ========================================================================
    // Path resolution
    // ========================================================================

    /// Map a virtual path (always `/`-rooted) to this backend's path.
    ///
    /// Fails if the path would escape the backend root.
    async fn resolve_path(&self, virtual_path: &str) -> VfsResult<PathBuf>;

    /// Staging path for an atomic upload to `path`.
    ///
    /// The staging file lives next to the target so the final rename never
    /// crosses a device.
    fn atomic_upload_path(&self, path: &Path) -> PathBuf {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let staging = format!("{ATOMIC_UPLOAD_PREFIX}{}.{name}", uuid::Uuid::new_v4().simple());
        match path.parent() {
            Some(parent) => parent.join(staging),
            None => PathBuf::from(staging),
        }
    }

    // ========================================================================
    // Reading
    // ========================================================================

    /// Get file attributes, following symlinks.
    async fn stat(&self, path: &Path) -> VfsResult<FileAttr>;

    /// Get file attributes without following a final symlink.
    async fn lstat(&self, path: &Path) -> VfsResult<FileAttr>;

    /// Read directory entries, sorted by name.
    async fn readdir(&self, path: &Path) -> VfsResult<Vec<DirEntry>>;

    /// Read symbolic link target.
    async fn readlink(&self, path: &Path) -> VfsResult<PathBuf>;

    /// Open an existing file for reading, positioned at `offset`.
    async fn open_read(&self, path: &Path, offset: u64) -> VfsResult<OpenFile>;

    // ========================================================================
    // Writing
    // ========================================================================

    /// Open a file for writing with the given flags.
    async fn open_write(&self, path: &Path, flags: OsOpenFlags) -> VfsResult<OpenFile>;

    /// Create a new directory.
    async fn mkdir(&self, path: &Path, mode: u32) -> VfsResult<FileAttr>;

    /// Remove a file or symlink.
    async fn unlink(&self, path: &Path) -> VfsResult<()>;

    /// Remove an empty directory.
    async fn rmdir(&self, path: &Path) -> VfsResult<()>;

    /// Rename a file or directory, replacing a file at `to`.
    async fn rename(&self, from: &Path, to: &Path) -> VfsResult<()>;

    /// Set file attributes. Fields left `None` are not touched.
    async fn setattr(&self, path: &Path, attr: SetAttr) -> VfsResult<FileAttr>;

    /// Create a symbolic link at `link` pointing to `target`.
    async fn symlink(&self, target: &Path, link: &Path) -> VfsResult<FileAttr>;

    /// Hand ownership of a freshly created path to `uid`/`gid`.
    ///
    /// Backends without ownership ignore this.
    async fn set_owner(&self, path: &Path, uid: u32, gid: u32) -> VfsResult<()> {
        let _ = (path, uid, gid);
        Ok(())
    }

    // ========================================================================
    // Convenience methods (default implementations)
    // ========================================================================

    /// Check if a path exists (without following a final symlink).
    async fn exists(&self, path: &Path) -> bool {
        self.lstat(path).await.is_ok()
    }

    /// Read entire file contents.
    async fn read_all(&self, path: &Path) -> VfsResult<Vec<u8>> {
        let mut file = self.open_read(path, 0).await?;
        let mut out = Vec::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.handle.read_at(&mut buf, out.len() as u64).await?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        file.handle.close().await?;
        Ok(out)
    }

    /// Write entire file contents, creating or truncating.
    async fn write_all(&self, path: &Path, data: &[u8]) -> VfsResult<()> {
        let mut file = self.open_write(path, OsOpenFlags::create_truncate()).await?;
        file.handle.write_at(data, 0).await?;
        file.handle.close().await
    }
}
