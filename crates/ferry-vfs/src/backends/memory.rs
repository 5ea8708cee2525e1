//! In-memory filesystem backend.
//!
//! Used for tests and ephemeral sessions. All data is lost when dropped.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio_util::sync::CancellationToken;

use crate::error::{VfsError, VfsResult};
use crate::ops::{FileHandle, OpenFile, VfsOps};
use crate::types::{Capabilities, DirEntry, FileAttr, FileType, OsOpenFlags, SetAttr};

/// Symlink hops followed before giving up.
const MAX_SYMLINK_HOPS: usize = 40;

/// Entry in the memory filesystem.
#[derive(Debug, Clone)]
enum Entry {
    File { data: Vec<u8>, attr: FileAttr },
    Directory { attr: FileAttr },
    Symlink { target: PathBuf, attr: FileAttr },
}

impl Entry {
    fn attr(&self) -> &FileAttr {
        match self {
            Entry::File { attr, .. } => attr,
            Entry::Directory { attr } => attr,
            Entry::Symlink { attr, .. } => attr,
        }
    }

    fn attr_mut(&mut self) -> &mut FileAttr {
        match self {
            Entry::File { attr, .. } => attr,
            Entry::Directory { attr } => attr,
            Entry::Symlink { attr, .. } => attr,
        }
    }
}

type Entries = Arc<RwLock<HashMap<PathBuf, Entry>>>;

/// In-memory filesystem backend.
///
/// Thread-safe via an internal `RwLock`; open handles share the same map.
/// Paths are stored relative to the root, so the root itself is `""`.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    entries: Entries,
    capabilities: Capabilities,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Create a new empty in-memory filesystem that behaves like local disk:
    /// atomic renames, locally tracked quota and ownership.
    pub fn new() -> Self {
        let mut entries = HashMap::new();
        entries.insert(
            PathBuf::from(""),
            Entry::Directory {
                attr: FileAttr::directory(0o755),
            },
        );
        Self {
            entries: Arc::new(RwLock::new(entries)),
            capabilities: Capabilities {
                atomic_upload: true,
                local_quota_ledger: true,
                ownership: true,
            },
        }
    }

    /// Override the advertised capabilities, e.g. to behave like an object
    /// store without a local ledger.
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Normalize a path: remove leading `/`, resolve `.` and `..`.
    fn normalize(path: &Path) -> PathBuf {
        let mut result = PathBuf::new();
        for component in path.components() {
            match component {
                Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
                Component::ParentDir => {
                    result.pop();
                }
                Component::Normal(s) => {
                    result.push(s);
                }
            }
        }
        result
    }

    /// Get the path string for error messages.
    fn path_str(path: &Path) -> String {
        format!("/{}", path.display())
    }

    /// Follow symlinks until a non-link path (existing or not) is reached.
    fn follow(entries: &HashMap<PathBuf, Entry>, path: &Path) -> VfsResult<PathBuf> {
        let mut current = path.to_path_buf();
        for _ in 0..MAX_SYMLINK_HOPS {
            match entries.get(&current) {
                Some(Entry::Symlink { target, .. }) => {
                    current = if target.is_absolute() {
                        Self::normalize(target)
                    } else {
                        let base = current.parent().unwrap_or(Path::new(""));
                        Self::normalize(&base.join(target))
                    };
                }
                _ => return Ok(current),
            }
        }
        Err(VfsError::other("too many symbolic links"))
    }

    /// Fail unless the parent of `path` is an existing directory.
    fn check_parent(entries: &HashMap<PathBuf, Entry>, path: &Path) -> VfsResult<()> {
        let parent = path.parent().unwrap_or(Path::new(""));
        match entries.get(parent) {
            Some(Entry::Directory { .. }) => Ok(()),
            Some(_) => Err(VfsError::not_a_directory(Self::path_str(parent))),
            None => Err(VfsError::not_found(Self::path_str(parent))),
        }
    }

    fn open_handle(&self, path: PathBuf, writable: bool) -> OpenFile {
        let cancel = CancellationToken::new();
        let handle = MemoryFile {
            entries: Arc::clone(&self.entries),
            path,
            writable,
            closed: false,
            cancel: cancel.clone(),
        };
        OpenFile {
            handle: Box::new(handle),
            cancel,
        }
    }
}

/// Open handle into a [`MemoryBackend`] file.
struct MemoryFile {
    entries: Entries,
    path: PathBuf,
    writable: bool,
    closed: bool,
    cancel: CancellationToken,
}

impl MemoryFile {
    fn check_usable(&self) -> VfsResult<()> {
        if self.closed {
            return Err(VfsError::Closed);
        }
        if self.cancel.is_cancelled() {
            return Err(VfsError::Cancelled);
        }
        Ok(())
    }
}

#[async_trait]
impl FileHandle for MemoryFile {
    async fn read_at(&mut self, buf: &mut [u8], offset: u64) -> VfsResult<usize> {
        self.check_usable()?;
        let entries = self.entries.read();
        match entries.get(&self.path) {
            Some(Entry::File { data, .. }) => {
                let start = (offset as usize).min(data.len());
                let end = (start + buf.len()).min(data.len());
                buf[..end - start].copy_from_slice(&data[start..end]);
                Ok(end - start)
            }
            Some(_) => Err(VfsError::other("not a regular file")),
            None => Err(VfsError::not_found(MemoryBackend::path_str(&self.path))),
        }
    }

    async fn write_at(&mut self, data: &[u8], offset: u64) -> VfsResult<usize> {
        self.check_usable()?;
        if !self.writable {
            return Err(VfsError::permission_denied("handle opened read-only"));
        }
        let mut entries = self.entries.write();
        match entries.get_mut(&self.path) {
            Some(Entry::File {
                data: file_data,
                attr,
            }) => {
                let offset = offset as usize;
                if offset + data.len() > file_data.len() {
                    file_data.resize(offset + data.len(), 0);
                }
                file_data[offset..offset + data.len()].copy_from_slice(data);
                attr.size = file_data.len() as u64;
                attr.mtime = SystemTime::now();
                Ok(data.len())
            }
            Some(_) => Err(VfsError::other("not a regular file")),
            None => Err(VfsError::not_found(MemoryBackend::path_str(&self.path))),
        }
    }

    async fn close(&mut self) -> VfsResult<()> {
        if self.closed {
            return Err(VfsError::Closed);
        }
        self.closed = true;
        Ok(())
    }
}

#[async_trait]
impl VfsOps for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn resolve_path(&self, virtual_path: &str) -> VfsResult<PathBuf> {
        if virtual_path.contains('\0') {
            return Err(VfsError::invalid_path(virtual_path));
        }
        Ok(Path::new("/").join(Self::normalize(Path::new(virtual_path))))
    }

    async fn stat(&self, path: &Path) -> VfsResult<FileAttr> {
        let normalized = Self::normalize(path);
        let entries = self.entries.read();
        let target = Self::follow(&entries, &normalized)?;
        entries
            .get(&target)
            .map(|e| e.attr().clone())
            .ok_or_else(|| VfsError::not_found(Self::path_str(&normalized)))
    }

    async fn lstat(&self, path: &Path) -> VfsResult<FileAttr> {
        let normalized = Self::normalize(path);
        let entries = self.entries.read();
        entries
            .get(&normalized)
            .map(|e| e.attr().clone())
            .ok_or_else(|| VfsError::not_found(Self::path_str(&normalized)))
    }

    async fn readdir(&self, path: &Path) -> VfsResult<Vec<DirEntry>> {
        let normalized = Self::normalize(path);
        let entries = self.entries.read();
        let dir = Self::follow(&entries, &normalized)?;

        match entries.get(&dir) {
            Some(Entry::Directory { .. }) => {}
            Some(_) => return Err(VfsError::not_a_directory(Self::path_str(&normalized))),
            None => return Err(VfsError::not_found(Self::path_str(&normalized))),
        }

        let mut result: Vec<DirEntry> = entries
            .iter()
            .filter(|(entry_path, _)| {
                entry_path.as_os_str().len() > 0 && entry_path.parent() == Some(dir.as_path())
            })
            .filter_map(|(entry_path, entry)| {
                entry_path
                    .file_name()
                    .map(|name| DirEntry::new(name.to_string_lossy(), entry.attr().clone()))
            })
            .collect();

        // Sort for consistent ordering
        result.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(result)
    }

    async fn readlink(&self, path: &Path) -> VfsResult<PathBuf> {
        let normalized = Self::normalize(path);
        let entries = self.entries.read();
        match entries.get(&normalized) {
            Some(Entry::Symlink { target, .. }) => Ok(target.clone()),
            Some(_) => Err(VfsError::NotASymlink(Self::path_str(&normalized))),
            None => Err(VfsError::not_found(Self::path_str(&normalized))),
        }
    }

    async fn open_read(&self, path: &Path, offset: u64) -> VfsResult<OpenFile> {
        let _ = offset;
        let normalized = Self::normalize(path);
        let target = {
            let entries = self.entries.read();
            let target = Self::follow(&entries, &normalized)?;
            match entries.get(&target) {
                Some(Entry::File { .. }) => target,
                Some(Entry::Directory { .. }) => {
                    return Err(VfsError::is_a_directory(Self::path_str(&normalized)));
                }
                Some(Entry::Symlink { .. }) => return Err(VfsError::other("dangling symlink")),
                None => return Err(VfsError::not_found(Self::path_str(&normalized))),
            }
        };
        Ok(self.open_handle(target, false))
    }

    async fn open_write(&self, path: &Path, flags: OsOpenFlags) -> VfsResult<OpenFile> {
        let normalized = Self::normalize(path);
        let target = {
            let mut entries = self.entries.write();
            let target = Self::follow(&entries, &normalized)?;
            match entries.get_mut(&target) {
                Some(Entry::File { data, attr }) => {
                    if flags.create && flags.exclusive {
                        return Err(VfsError::already_exists(Self::path_str(&normalized)));
                    }
                    if flags.truncate {
                        data.clear();
                        attr.size = 0;
                        attr.mtime = SystemTime::now();
                    }
                }
                Some(Entry::Directory { .. }) => {
                    return Err(VfsError::is_a_directory(Self::path_str(&normalized)));
                }
                Some(Entry::Symlink { .. }) => return Err(VfsError::other("dangling symlink")),
                None => {
                    if !flags.create {
                        return Err(VfsError::not_found(Self::path_str(&normalized)));
                    }
                    Self::check_parent(&entries, &target)?;
                    entries.insert(
                        target.clone(),
                        Entry::File {
                            data: Vec::new(),
                            attr: FileAttr::file(0, 0o644),
                        },
                    );
                }
            }
            target
        };
        Ok(self.open_handle(target, true))
    }

    async fn mkdir(&self, path: &Path, mode: u32) -> VfsResult<FileAttr> {
        let normalized = Self::normalize(path);
        let mut entries = self.entries.write();

        if entries.contains_key(&normalized) {
            return Err(VfsError::already_exists(Self::path_str(&normalized)));
        }
        Self::check_parent(&entries, &normalized)?;

        let attr = FileAttr::directory(mode);
        entries.insert(normalized, Entry::Directory { attr: attr.clone() });
        Ok(attr)
    }

    async fn unlink(&self, path: &Path) -> VfsResult<()> {
        let normalized = Self::normalize(path);
        if normalized.as_os_str().is_empty() {
            return Err(VfsError::permission_denied("cannot remove root"));
        }

        let mut entries = self.entries.write();
        match entries.get(&normalized) {
            Some(Entry::Directory { .. }) => {
                Err(VfsError::is_a_directory(Self::path_str(&normalized)))
            }
            Some(_) => {
                entries.remove(&normalized);
                Ok(())
            }
            None => Err(VfsError::not_found(Self::path_str(&normalized))),
        }
    }

    async fn rmdir(&self, path: &Path) -> VfsResult<()> {
        let normalized = Self::normalize(path);
        if normalized.as_os_str().is_empty() {
            return Err(VfsError::permission_denied("cannot remove root"));
        }

        let mut entries = self.entries.write();
        match entries.get(&normalized) {
            Some(Entry::Directory { .. }) => {}
            Some(_) => return Err(VfsError::not_a_directory(Self::path_str(&normalized))),
            None => return Err(VfsError::not_found(Self::path_str(&normalized))),
        }

        let has_children = entries.keys().any(|k| k.parent() == Some(normalized.as_path()));
        if has_children {
            return Err(VfsError::directory_not_empty(Self::path_str(&normalized)));
        }

        entries.remove(&normalized);
        Ok(())
    }

    async fn rename(&self, from: &Path, to: &Path) -> VfsResult<()> {
        let from_normalized = Self::normalize(from);
        let to_normalized = Self::normalize(to);
        if from_normalized == to_normalized {
            return Ok(());
        }

        let mut entries = self.entries.write();
        Self::check_parent(&entries, &to_normalized)?;

        let is_dir = match entries.get(&from_normalized) {
            Some(entry) => matches!(entry, Entry::Directory { .. }),
            None => return Err(VfsError::not_found(Self::path_str(&from_normalized))),
        };
        match entries.get(&to_normalized) {
            Some(Entry::Directory { .. }) if !is_dir => {
                return Err(VfsError::is_a_directory(Self::path_str(&to_normalized)));
            }
            Some(Entry::Directory { .. }) => {
                if entries.keys().any(|k| k.parent() == Some(to_normalized.as_path())) {
                    return Err(VfsError::directory_not_empty(Self::path_str(&to_normalized)));
                }
            }
            Some(_) if is_dir => {
                return Err(VfsError::not_a_directory(Self::path_str(&to_normalized)));
            }
            _ => {}
        }
        if is_dir && to_normalized.starts_with(&from_normalized) {
            return Err(VfsError::invalid_path("cannot move a directory into itself"));
        }

        let Some(entry) = entries.remove(&from_normalized) else {
            return Err(VfsError::not_found(Self::path_str(&from_normalized)));
        };

        // Directories carry their whole subtree along
        if is_dir {
            let children: Vec<_> = entries
                .keys()
                .filter(|k| k.starts_with(&from_normalized))
                .cloned()
                .collect();

            for child in children {
                if let (Some(child_entry), Ok(relative)) =
                    (entries.remove(&child), child.strip_prefix(&from_normalized))
                {
                    entries.insert(to_normalized.join(relative), child_entry);
                }
            }
        }

        entries.insert(to_normalized, entry);
        Ok(())
    }

    async fn setattr(&self, path: &Path, set: SetAttr) -> VfsResult<FileAttr> {
        let normalized = Self::normalize(path);
        let mut entries = self.entries.write();
        let target = Self::follow(&entries, &normalized)?;

        let entry = entries
            .get_mut(&target)
            .ok_or_else(|| VfsError::not_found(Self::path_str(&normalized)))?;

        if let Some(size) = set.size {
            if let Entry::File { data, attr } = entry {
                data.resize(size as usize, 0);
                attr.size = size;
            }
        }

        let attr = entry.attr_mut();
        if let Some(mtime) = set.mtime {
            attr.mtime = mtime;
        }
        if let Some(atime) = set.atime {
            attr.atime = Some(atime);
        }
        if let Some(perm) = set.perm {
            attr.perm = perm;
        }
        if let Some(uid) = set.uid {
            attr.uid = Some(uid);
        }
        if let Some(gid) = set.gid {
            attr.gid = Some(gid);
        }

        Ok(entry.attr().clone())
    }

    async fn symlink(&self, target: &Path, link: &Path) -> VfsResult<FileAttr> {
        let normalized = Self::normalize(link);
        let mut entries = self.entries.write();

        if entries.contains_key(&normalized) {
            return Err(VfsError::already_exists(Self::path_str(&normalized)));
        }
        Self::check_parent(&entries, &normalized)?;

        let attr = FileAttr::symlink(target.as_os_str().len() as u64);
        entries.insert(
            normalized,
            Entry::Symlink {
                target: target.to_path_buf(),
                attr: attr.clone(),
            },
        );
        Ok(attr)
    }

    async fn set_owner(&self, path: &Path, uid: u32, gid: u32) -> VfsResult<()> {
        if !self.capabilities.ownership {
            return Ok(());
        }
        let normalized = Self::normalize(path);
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(&normalized)
            .ok_or_else(|| VfsError::not_found(Self::path_str(&normalized)))?;
        let attr = entry.attr_mut();
        attr.uid = Some(uid);
        attr.gid = Some(gid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write_file(fs: &MemoryBackend, path: &str, data: &[u8]) {
        fs.write_all(Path::new(path), data).await.unwrap();
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let fs = MemoryBackend::new();
        write_file(&fs, "test.txt", b"hello world").await;

        let data = fs.read_all(Path::new("test.txt")).await.unwrap();
        assert_eq!(data, b"hello world");
        assert_eq!(fs.stat(Path::new("test.txt")).await.unwrap().size, 11);
    }

    #[tokio::test]
    async fn test_positional_read() {
        let fs = MemoryBackend::new();
        write_file(&fs, "test.txt", b"hello world").await;

        let mut file = fs.open_read(Path::new("test.txt"), 0).await.unwrap();
        let mut buf = [0u8; 5];
        let n = file.handle.read_at(&mut buf, 6).await.unwrap();
        assert_eq!(&buf[..n], b"world");
        assert_eq!(file.handle.read_at(&mut buf, 11).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_open_write_without_create_fails() {
        let fs = MemoryBackend::new();
        let result = fs.open_write(Path::new("missing.txt"), OsOpenFlags::default()).await;
        assert!(result.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_open_write_exclusive() {
        let fs = MemoryBackend::new();
        write_file(&fs, "a.txt", b"x").await;
        let flags = OsOpenFlags {
            create: true,
            exclusive: true,
            ..Default::default()
        };
        let result = fs.open_write(Path::new("a.txt"), flags).await;
        assert!(matches!(result, Err(VfsError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_open_write_keeps_content_without_truncate() {
        let fs = MemoryBackend::new();
        write_file(&fs, "a.txt", b"0123456789").await;

        let mut file = fs.open_write(Path::new("a.txt"), OsOpenFlags::default()).await.unwrap();
        file.handle.write_at(b"abc", 10).await.unwrap();
        file.handle.close().await.unwrap();

        let data = fs.read_all(Path::new("a.txt")).await.unwrap();
        assert_eq!(data, b"0123456789abc");
    }

    #[tokio::test]
    async fn test_cancelled_handle_rejects_io() {
        let fs = MemoryBackend::new();
        let mut file = fs
            .open_write(Path::new("a.txt"), OsOpenFlags::create_truncate())
            .await
            .unwrap();
        file.cancel.cancel();
        let result = file.handle.write_at(b"abc", 0).await;
        assert!(matches!(result, Err(VfsError::Cancelled)));
    }

    #[tokio::test]
    async fn test_create_requires_parent() {
        let fs = MemoryBackend::new();
        let result = fs
            .open_write(Path::new("no/such/dir.txt"), OsOpenFlags::create_truncate())
            .await;
        assert!(result.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_mkdir_and_readdir() {
        let fs = MemoryBackend::new();
        fs.mkdir(Path::new("subdir"), 0o755).await.unwrap();
        write_file(&fs, "subdir/file.txt", b"abc").await;
        write_file(&fs, "root.txt", b"").await;

        let entries = fs.readdir(Path::new("")).await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["root.txt", "subdir"]);

        let subentries = fs.readdir(Path::new("subdir")).await.unwrap();
        assert_eq!(subentries.len(), 1);
        assert_eq!(subentries[0].name, "file.txt");
        assert_eq!(subentries[0].attr.size, 3);
    }

    #[tokio::test]
    async fn test_unlink_directory_fails() {
        let fs = MemoryBackend::new();
        fs.mkdir(Path::new("dir"), 0o755).await.unwrap();
        let result = fs.unlink(Path::new("dir")).await;
        assert!(matches!(result, Err(VfsError::IsADirectory(_))));
    }

    #[tokio::test]
    async fn test_rmdir_not_empty() {
        let fs = MemoryBackend::new();
        fs.mkdir(Path::new("nonempty"), 0o755).await.unwrap();
        write_file(&fs, "nonempty/file.txt", b"").await;

        let result = fs.rmdir(Path::new("nonempty")).await;
        assert!(matches!(result, Err(VfsError::DirectoryNotEmpty(_))));
    }

    #[tokio::test]
    async fn test_rename_replaces_file() {
        let fs = MemoryBackend::new();
        write_file(&fs, "old.txt", b"new content").await;
        write_file(&fs, "new.txt", b"stale").await;

        fs.rename(Path::new("old.txt"), Path::new("new.txt")).await.unwrap();

        assert!(!fs.exists(Path::new("old.txt")).await);
        let data = fs.read_all(Path::new("new.txt")).await.unwrap();
        assert_eq!(data, b"new content");
    }

    #[tokio::test]
    async fn test_rename_directory_moves_children() {
        let fs = MemoryBackend::new();
        fs.mkdir(Path::new("a"), 0o755).await.unwrap();
        write_file(&fs, "a/f.txt", b"x").await;

        fs.rename(Path::new("a"), Path::new("b")).await.unwrap();
        assert!(fs.exists(Path::new("b/f.txt")).await);
        assert!(!fs.exists(Path::new("a/f.txt")).await);
    }

    #[tokio::test]
    async fn test_symlink_stat_and_lstat() {
        let fs = MemoryBackend::new();
        write_file(&fs, "target.txt", b"content").await;
        fs.symlink(Path::new("target.txt"), Path::new("link"))
            .await
            .unwrap();

        assert_eq!(fs.readlink(Path::new("link")).await.unwrap(), Path::new("target.txt"));
        assert!(fs.lstat(Path::new("link")).await.unwrap().is_symlink());
        let followed = fs.stat(Path::new("link")).await.unwrap();
        assert!(followed.is_file());
        assert_eq!(followed.size, 7);
    }

    #[tokio::test]
    async fn test_setattr_leaves_absent_fields() {
        let fs = MemoryBackend::new();
        write_file(&fs, "a.txt", b"abc").await;
        fs.set_owner(Path::new("a.txt"), 10, 20).await.unwrap();

        let attr = fs
            .setattr(Path::new("a.txt"), SetAttr::new().with_perm(0o600))
            .await
            .unwrap();
        assert_eq!(attr.perm, 0o600);
        assert_eq!(attr.uid, Some(10));
        assert_eq!(attr.gid, Some(20));
        assert_eq!(attr.size, 3);
    }

    #[tokio::test]
    async fn test_set_owner_without_capability_is_noop() {
        let fs = MemoryBackend::new().with_capabilities(Capabilities::default());
        write_file(&fs, "a.txt", b"abc").await;
        fs.set_owner(Path::new("a.txt"), 10, 20).await.unwrap();
        assert_eq!(fs.lstat(Path::new("a.txt")).await.unwrap().uid, None);
    }

    #[tokio::test]
    async fn test_path_normalization() {
        let fs = MemoryBackend::new();
        let resolved = fs.resolve_path("/a/./b/../c.txt").await.unwrap();
        assert_eq!(resolved, PathBuf::from("/a/c.txt"));
        assert_eq!(fs.resolve_path("/../..").await.unwrap(), PathBuf::from("/"));
    }

    #[tokio::test]
    async fn test_atomic_upload_path_is_sibling() {
        let fs = MemoryBackend::new();
        let staging = fs.atomic_upload_path(Path::new("dir/file.bin"));
        assert_eq!(staging.parent(), Some(Path::new("dir")));
        let name = staging.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(crate::ops::ATOMIC_UPLOAD_PREFIX));
        assert!(name.ends_with(".file.bin"));
    }
}
