//! Local filesystem backend.
//!
//! Provides access to real filesystem paths, with path security
//! to prevent escaping the root directory.

use async_trait::async_trait;
use std::fs::FileTimes;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::error::{VfsError, VfsResult};
use crate::ops::{FileHandle, OpenFile, VfsOps};
use crate::types::{Capabilities, DirEntry, FileAttr, FileType, OsOpenFlags, SetAttr};

/// Mode for files created by uploads.
const DEFAULT_FILE_MODE: u32 = 0o644;

/// Local filesystem backend.
///
/// All operations are relative to `root`. For example, if `root` is
/// `/srv/ferry/amy`, then the virtual path `/docs/a.txt` resolves to
/// `/srv/ferry/amy/docs/a.txt`.
///
/// Path security is enforced: attempts to escape via `..`, via a
/// symlinked parent directory or by following a symlink that points out of
/// the root are blocked. Operations on the link itself (`lstat`, `unlink`,
/// `rename`) never follow it.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
    ownership: bool,
}

impl LocalBackend {
    /// Create a new local filesystem rooted at the given path.
    ///
    /// The root is canonicalized at construction time to handle symlinks
    /// (e.g. macOS `/tmp` → `/private/tmp`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root: PathBuf = root.into();
        let root = dunce::canonicalize(&root).unwrap_or(root);
        Self {
            root,
            ownership: false,
        }
    }

    /// Enable chown of created paths. Needs a privileged process.
    pub fn with_ownership(mut self, ownership: bool) -> Self {
        self.ownership = ownership;
        self
    }

    /// Get the root path.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_under_root(&self, canonical: &Path) -> VfsResult<()> {
        if canonical.starts_with(&self.root) {
            Ok(())
        } else {
            Err(VfsError::path_escapes_root(format!(
                "{} is not under {}",
                canonical.display(),
                self.root.display()
            )))
        }
    }

    /// Verify that the closest existing ancestor of `full` is under root.
    ///
    /// The final component is left alone so `lstat` still sees symlinks.
    async fn check_contained(&self, full: &Path) -> VfsResult<()> {
        let mut ancestor = full.parent();
        while let Some(dir) = ancestor {
            if fs::try_exists(dir).await? {
                return self.ensure_under_root(&fs::canonicalize(dir).await?);
            }
            ancestor = dir.parent();
        }
        Ok(())
    }

    /// Verify that following the final component of `path` stays under root.
    ///
    /// A dangling link is judged by where a create through it would land.
    async fn check_followed(&self, path: &Path) -> VfsResult<()> {
        let is_link = match fs::symlink_metadata(path).await {
            Ok(meta) => meta.file_type().is_symlink(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if !is_link {
            return Ok(());
        }
        match fs::canonicalize(path).await {
            Ok(canonical) => self.ensure_under_root(&canonical),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let referent = fs::read_link(path).await?;
                let base = path.parent().unwrap_or(self.root.as_path());
                self.check_contained(&base.join(referent)).await
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Convert std::fs::Metadata to FileAttr.
    fn metadata_to_attr(meta: &std::fs::Metadata) -> FileAttr {
        let kind = if meta.is_dir() {
            FileType::Directory
        } else if meta.file_type().is_symlink() {
            FileType::Symlink
        } else {
            FileType::File
        };

        FileAttr {
            size: meta.len(),
            kind,
            perm: meta.permissions().mode() & 0o7777,
            mtime: meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH),
            atime: meta.accessed().ok(),
            uid: Some(meta.uid()),
            gid: Some(meta.gid()),
        }
    }
}

/// Run a blocking std call off the async workers.
async fn blocking<F>(op: F) -> VfsResult<()>
where
    F: FnOnce() -> std::io::Result<()> + Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| VfsError::other(format!("blocking task failed: {e}")))?
        .map_err(VfsError::from)
}

/// Open handle on a local file.
struct LocalFile {
    file: Option<fs::File>,
    cancel: CancellationToken,
}

impl LocalFile {
    fn file(&mut self) -> VfsResult<&mut fs::File> {
        if self.cancel.is_cancelled() {
            return Err(VfsError::Cancelled);
        }
        self.file.as_mut().ok_or(VfsError::Closed)
    }
}

#[async_trait]
impl FileHandle for LocalFile {
    async fn read_at(&mut self, buf: &mut [u8], offset: u64) -> VfsResult<usize> {
        let file = self.file()?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let n = file.read(buf).await?;
        Ok(n)
    }

    async fn write_at(&mut self, data: &[u8], offset: u64) -> VfsResult<usize> {
        let file = self.file()?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        Ok(data.len())
    }

    async fn close(&mut self) -> VfsResult<()> {
        let mut file = self.file.take().ok_or(VfsError::Closed)?;
        file.flush().await?;
        Ok(())
    }
}

fn local_open(file: fs::File) -> OpenFile {
    let cancel = CancellationToken::new();
    OpenFile {
        handle: Box::new(LocalFile {
            file: Some(file),
            cancel: cancel.clone(),
        }),
        cancel,
    }
}

#[async_trait]
impl VfsOps for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            atomic_upload: true,
            local_quota_ledger: true,
            ownership: self.ownership,
        }
    }

    async fn resolve_path(&self, virtual_path: &str) -> VfsResult<PathBuf> {
        if virtual_path.contains('\0') {
            return Err(VfsError::invalid_path(virtual_path));
        }

        // Lexical clean first; `..` never climbs above the virtual root
        let mut relative = PathBuf::new();
        for component in Path::new(virtual_path).components() {
            match component {
                Component::ParentDir => {
                    relative.pop();
                }
                Component::Normal(s) => relative.push(s),
                _ => {}
            }
        }

        let full = self.root.join(relative);
        self.check_contained(&full).await?;
        Ok(full)
    }

    async fn stat(&self, path: &Path) -> VfsResult<FileAttr> {
        self.check_followed(path).await?;
        let meta = fs::metadata(path).await?;
        Ok(Self::metadata_to_attr(&meta))
    }

    async fn lstat(&self, path: &Path) -> VfsResult<FileAttr> {
        let meta = fs::symlink_metadata(path).await?;
        Ok(Self::metadata_to_attr(&meta))
    }

    async fn readdir(&self, path: &Path) -> VfsResult<Vec<DirEntry>> {
        self.check_followed(path).await?;
        let mut entries = Vec::new();
        let mut dir = fs::read_dir(path).await?;

        while let Some(entry) = dir.next_entry().await? {
            let meta = entry.metadata().await?;
            entries.push(DirEntry::new(
                entry.file_name().to_string_lossy(),
                Self::metadata_to_attr(&meta),
            ));
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn readlink(&self, path: &Path) -> VfsResult<PathBuf> {
        fs::read_link(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::InvalidInput {
                VfsError::NotASymlink(path.display().to_string())
            } else {
                VfsError::from(e)
            }
        })
    }

    async fn open_read(&self, path: &Path, offset: u64) -> VfsResult<OpenFile> {
        self.check_followed(path).await?;
        let mut file = fs::File::open(path).await?;
        if file.metadata().await?.is_dir() {
            return Err(VfsError::is_a_directory(path.display().to_string()));
        }
        if offset > 0 {
            file.seek(std::io::SeekFrom::Start(offset)).await?;
        }
        Ok(local_open(file))
    }

    async fn open_write(&self, path: &Path, flags: OsOpenFlags) -> VfsResult<OpenFile> {
        self.check_followed(path).await?;
        let mut options = fs::OpenOptions::new();
        options
            .write(true)
            .read(flags.read)
            .truncate(flags.truncate)
            .mode(DEFAULT_FILE_MODE);
        if flags.create && flags.exclusive {
            options.create_new(true);
        } else {
            options.create(flags.create);
        }

        let file = options.open(path).await?;
        Ok(local_open(file))
    }

    async fn mkdir(&self, path: &Path, mode: u32) -> VfsResult<FileAttr> {
        fs::DirBuilder::new().mode(mode).create(path).await?;

        let meta = fs::metadata(path).await?;
        Ok(Self::metadata_to_attr(&meta))
    }

    async fn unlink(&self, path: &Path) -> VfsResult<()> {
        if path == self.root {
            return Err(VfsError::permission_denied("cannot remove root"));
        }
        fs::remove_file(path).await.map_err(VfsError::from)
    }

    async fn rmdir(&self, path: &Path) -> VfsResult<()> {
        if path == self.root {
            return Err(VfsError::permission_denied("cannot remove root"));
        }
        fs::remove_dir(path).await.map_err(VfsError::from)
    }

    async fn rename(&self, from: &Path, to: &Path) -> VfsResult<()> {
        fs::rename(from, to).await.map_err(VfsError::from)
    }

    async fn setattr(&self, path: &Path, attr: SetAttr) -> VfsResult<FileAttr> {
        self.check_followed(path).await?;
        if let Some(size) = attr.size {
            let file = fs::OpenOptions::new().write(true).open(path).await?;
            file.set_len(size).await?;
        }

        if let Some(perm) = attr.perm {
            let permissions = std::fs::Permissions::from_mode(perm);
            fs::set_permissions(path, permissions).await?;
        }

        if attr.atime.is_some() || attr.mtime.is_some() {
            let mut times = FileTimes::new();
            if let Some(atime) = attr.atime {
                times = times.set_accessed(atime);
            }
            if let Some(mtime) = attr.mtime {
                times = times.set_modified(mtime);
            }
            let owned = path.to_path_buf();
            blocking(move || std::fs::File::open(owned)?.set_times(times)).await?;
        }

        if attr.uid.is_some() || attr.gid.is_some() {
            let (owned, uid, gid) = (path.to_path_buf(), attr.uid, attr.gid);
            blocking(move || std::os::unix::fs::chown(owned, uid, gid)).await?;
        }

        self.lstat(path).await
    }

    async fn symlink(&self, target: &Path, link: &Path) -> VfsResult<FileAttr> {
        fs::symlink(target, link).await?;
        self.lstat(link).await
    }

    async fn set_owner(&self, path: &Path, uid: u32, gid: u32) -> VfsResult<()> {
        if !self.ownership {
            return Ok(());
        }
        let owned = path.to_path_buf();
        blocking(move || std::os::unix::fs::lchown(owned, Some(uid), Some(gid))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup() -> (LocalBackend, TempDir) {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(dir.path());
        (backend, dir)
    }

    async fn resolve(backend: &LocalBackend, path: &str) -> PathBuf {
        backend.resolve_path(path).await.unwrap()
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let (backend, _dir) = setup().await;
        let path = resolve(&backend, "/test.txt").await;

        backend.write_all(&path, b"hello world").await.unwrap();
        let data = backend.read_all(&path).await.unwrap();
        assert_eq!(data, b"hello world");
    }

    #[tokio::test]
    async fn test_positional_io() {
        let (backend, _dir) = setup().await;
        let path = resolve(&backend, "/test.txt").await;

        let mut file = backend
            .open_write(&path, OsOpenFlags::create_truncate())
            .await
            .unwrap();
        file.handle.write_at(b"world", 6).await.unwrap();
        file.handle.write_at(b"hello ", 0).await.unwrap();
        file.handle.close().await.unwrap();

        let mut file = backend.open_read(&path, 0).await.unwrap();
        let mut buf = [0u8; 5];
        let n = file.handle.read_at(&mut buf, 6).await.unwrap();
        assert_eq!(&buf[..n], b"world");
    }

    #[tokio::test]
    async fn test_closed_handle() {
        let (backend, _dir) = setup().await;
        let path = resolve(&backend, "/test.txt").await;

        let mut file = backend
            .open_write(&path, OsOpenFlags::create_truncate())
            .await
            .unwrap();
        file.handle.close().await.unwrap();
        assert!(matches!(file.handle.close().await, Err(VfsError::Closed)));
        assert!(matches!(
            file.handle.write_at(b"x", 0).await,
            Err(VfsError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_open_write_without_truncate_keeps_data() {
        let (backend, _dir) = setup().await;
        let path = resolve(&backend, "/test.txt").await;
        backend.write_all(&path, b"abc").await.unwrap();

        let mut file = backend.open_write(&path, OsOpenFlags::default()).await.unwrap();
        file.handle.write_at(b"def", 3).await.unwrap();
        file.handle.close().await.unwrap();

        assert_eq!(backend.read_all(&path).await.unwrap(), b"abcdef");
    }

    #[tokio::test]
    async fn test_mkdir_and_readdir() {
        let (backend, _dir) = setup().await;

        let subdir = resolve(&backend, "/subdir").await;
        backend.mkdir(&subdir, 0o755).await.unwrap();
        backend
            .write_all(&resolve(&backend, "/subdir/file.txt").await, b"")
            .await
            .unwrap();
        backend
            .write_all(&resolve(&backend, "/root.txt").await, b"abc")
            .await
            .unwrap();

        let entries = backend.readdir(backend.root()).await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["root.txt", "subdir"]);
        assert_eq!(entries[0].attr.size, 3);
        assert!(entries[1].attr.is_dir());
    }

    #[tokio::test]
    async fn test_dotdot_is_clamped_to_root() {
        let (backend, _dir) = setup().await;

        let resolved = resolve(&backend, "/../../../etc/passwd").await;
        assert_eq!(resolved, backend.root().join("etc/passwd"));
    }

    #[tokio::test]
    async fn test_symlinked_parent_escape_blocked() {
        let (backend, dir) = setup().await;
        let outside = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("out")).unwrap();

        let result = backend.resolve_path("/out/secret.txt").await;
        assert!(matches!(result, Err(VfsError::PathEscapesRoot(_))));
    }

    #[tokio::test]
    async fn test_symlink_out_of_root_not_followed() {
        let (backend, dir) = setup().await;
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret"), b"hidden").unwrap();
        std::os::unix::fs::symlink(outside.path().join("secret"), dir.path().join("link"))
            .unwrap();
        std::os::unix::fs::symlink(outside.path().join("fresh"), dir.path().join("dangling"))
            .unwrap();

        let link = resolve(&backend, "/link").await;
        assert!(matches!(backend.stat(&link).await, Err(VfsError::PathEscapesRoot(_))));
        assert!(matches!(
            backend.open_read(&link, 0).await,
            Err(VfsError::PathEscapesRoot(_))
        ));
        assert!(matches!(
            backend.open_write(&link, OsOpenFlags::create_truncate()).await,
            Err(VfsError::PathEscapesRoot(_))
        ));
        assert_eq!(std::fs::read(outside.path().join("secret")).unwrap(), b"hidden");

        let dangling = resolve(&backend, "/dangling").await;
        assert!(matches!(
            backend.open_write(&dangling, OsOpenFlags::create_truncate()).await,
            Err(VfsError::PathEscapesRoot(_))
        ));
        assert!(!outside.path().join("fresh").exists());

        // The link itself is still visible and removable.
        assert!(backend.lstat(&link).await.unwrap().is_symlink());
        backend.unlink(&link).await.unwrap();
        assert!(outside.path().join("secret").exists());
    }

    #[tokio::test]
    async fn test_symlink_and_lstat() {
        let (backend, _dir) = setup().await;
        let target = resolve(&backend, "/target.txt").await;
        let link = resolve(&backend, "/link.txt").await;
        backend.write_all(&target, b"content").await.unwrap();

        backend.symlink(&target, &link).await.unwrap();

        assert_eq!(backend.readlink(&link).await.unwrap(), target);
        assert!(backend.lstat(&link).await.unwrap().is_symlink());
        assert!(backend.stat(&link).await.unwrap().is_file());
    }

    #[tokio::test]
    async fn test_readlink_on_file() {
        let (backend, _dir) = setup().await;
        let path = resolve(&backend, "/plain.txt").await;
        backend.write_all(&path, b"").await.unwrap();

        let result = backend.readlink(&path).await;
        assert!(matches!(result, Err(VfsError::NotASymlink(_))));
    }

    #[tokio::test]
    async fn test_rename() {
        let (backend, _dir) = setup().await;
        let old = resolve(&backend, "/old.txt").await;
        let new = resolve(&backend, "/new.txt").await;
        backend.write_all(&old, b"content").await.unwrap();

        backend.rename(&old, &new).await.unwrap();

        assert!(!backend.exists(&old).await);
        assert_eq!(backend.read_all(&new).await.unwrap(), b"content");
    }

    #[tokio::test]
    async fn test_setattr_perm_and_times() {
        let (backend, _dir) = setup().await;
        let path = resolve(&backend, "/test.txt").await;
        backend.write_all(&path, b"hello world").await.unwrap();

        let mtime = std::time::UNIX_EPOCH + std::time::Duration::from_secs(1_000_000);
        let attr = backend
            .setattr(&path, SetAttr::new().with_perm(0o600).with_times(mtime, mtime))
            .await
            .unwrap();
        assert_eq!(attr.perm, 0o600);
        assert_eq!(attr.mtime, mtime);
        assert_eq!(attr.size, 11);
    }

    #[tokio::test]
    async fn test_setattr_size() {
        let (backend, _dir) = setup().await;
        let path = resolve(&backend, "/test.txt").await;
        backend.write_all(&path, b"hello world").await.unwrap();

        let attr = backend
            .setattr(
                &path,
                SetAttr {
                    size: Some(5),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(attr.size, 5);
        assert_eq!(backend.read_all(&path).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_open_read_directory_fails() {
        let (backend, _dir) = setup().await;
        let result = backend.open_read(backend.root(), 0).await;
        assert!(matches!(result, Err(VfsError::IsADirectory(_))));
    }
}
