//! Shared harness for dispatcher integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use ferry_kernel::{
    MemoryLedger, Permission, PermissionRules, Request, RequestDispatcher, Session,
    TransferSettings, UploadMode, UserProfile,
};
use ferry_kernel::request::Operation;
use ferry_vfs::{
    ATOMIC_UPLOAD_PREFIX, Capabilities, DirEntry, FileAttr, MemoryBackend, OpenFile, OpenFlags,
    OsOpenFlags, SetAttr, VfsError, VfsOps, VfsResult,
};

/// Route test logs through the test writer. Safe to call repeatedly.
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ferry=debug")),
        )
        .with_test_writer()
        .try_init();
}

// ============================================================================
// Counting backend
// ============================================================================

/// Memory backend that counts opens, renames and mutations, and can be
/// told to fail opens of staging files.
pub struct CountingBackend {
    inner: MemoryBackend,
    opens: AtomicUsize,
    renames: AtomicUsize,
    mutations: AtomicUsize,
    fail_staging_open: AtomicBool,
}

impl CountingBackend {
    pub fn new(inner: MemoryBackend) -> Self {
        Self {
            inner,
            opens: AtomicUsize::new(0),
            renames: AtomicUsize::new(0),
            mutations: AtomicUsize::new(0),
            fail_staging_open: AtomicBool::new(false),
        }
    }

    /// Backend as seen by tests, bypassing the counters.
    pub fn inner(&self) -> &MemoryBackend {
        &self.inner
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn renames(&self) -> usize {
        self.renames.load(Ordering::SeqCst)
    }

    pub fn mutations(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    pub fn fail_staging_opens(&self, fail: bool) {
        self.fail_staging_open.store(fail, Ordering::SeqCst);
    }

    fn mutated(&self) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
    }
}

fn is_staging(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().starts_with(ATOMIC_UPLOAD_PREFIX))
        .unwrap_or(false)
}

#[async_trait]
impl VfsOps for CountingBackend {
    fn name(&self) -> &str {
        "counting"
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    async fn resolve_path(&self, virtual_path: &str) -> VfsResult<PathBuf> {
        self.inner.resolve_path(virtual_path).await
    }

    fn atomic_upload_path(&self, path: &Path) -> PathBuf {
        self.inner.atomic_upload_path(path)
    }

    async fn stat(&self, path: &Path) -> VfsResult<FileAttr> {
        self.inner.stat(path).await
    }

    async fn lstat(&self, path: &Path) -> VfsResult<FileAttr> {
        self.inner.lstat(path).await
    }

    async fn readdir(&self, path: &Path) -> VfsResult<Vec<DirEntry>> {
        self.inner.readdir(path).await
    }

    async fn readlink(&self, path: &Path) -> VfsResult<PathBuf> {
        self.inner.readlink(path).await
    }

    async fn open_read(&self, path: &Path, offset: u64) -> VfsResult<OpenFile> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.inner.open_read(path, offset).await
    }

    async fn open_write(&self, path: &Path, flags: OsOpenFlags) -> VfsResult<OpenFile> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if is_staging(path) && self.fail_staging_open.load(Ordering::SeqCst) {
            return Err(VfsError::other("injected open failure"));
        }
        self.mutated();
        self.inner.open_write(path, flags).await
    }

    async fn mkdir(&self, path: &Path, mode: u32) -> VfsResult<FileAttr> {
        self.mutated();
        self.inner.mkdir(path, mode).await
    }

    async fn unlink(&self, path: &Path) -> VfsResult<()> {
        self.mutated();
        self.inner.unlink(path).await
    }

    async fn rmdir(&self, path: &Path) -> VfsResult<()> {
        self.mutated();
        self.inner.rmdir(path).await
    }

    async fn rename(&self, from: &Path, to: &Path) -> VfsResult<()> {
        self.renames.fetch_add(1, Ordering::SeqCst);
        self.mutated();
        self.inner.rename(from, to).await
    }

    async fn setattr(&self, path: &Path, attr: SetAttr) -> VfsResult<FileAttr> {
        self.mutated();
        self.inner.setattr(path, attr).await
    }

    async fn symlink(&self, target: &Path, link: &Path) -> VfsResult<FileAttr> {
        self.mutated();
        self.inner.symlink(target, link).await
    }

    async fn set_owner(&self, path: &Path, uid: u32, gid: u32) -> VfsResult<()> {
        self.inner.set_owner(path, uid, gid).await
    }
}

// ============================================================================
// Harness
// ============================================================================

/// A session over a counting memory backend and a fresh ledger.
pub struct Harness {
    pub fs: Arc<CountingBackend>,
    pub ledger: Arc<MemoryLedger>,
    pub session: Arc<Session>,
    pub dispatcher: RequestDispatcher,
}

impl Harness {
    pub fn new(user: UserProfile, mode: UploadMode) -> Self {
        Self::with_backend(user, mode, MemoryBackend::new())
    }

    pub fn with_backend(user: UserProfile, mode: UploadMode, backend: MemoryBackend) -> Self {
        init_tracing();
        let fs = Arc::new(CountingBackend::new(backend));
        let ledger = Arc::new(MemoryLedger::new());
        let settings = TransferSettings {
            upload_mode: mode,
            ..Default::default()
        };
        let session = Arc::new(Session::new(
            Arc::new(user),
            fs.clone(),
            ledger.clone(),
            settings,
        ));
        let dispatcher = RequestDispatcher::new(Arc::clone(&session));
        Self {
            fs,
            ledger,
            session,
            dispatcher,
        }
    }

    /// Seed a file without touching the counters.
    pub async fn put(&self, path: &str, data: &[u8]) {
        self.fs.inner().write_all(Path::new(path), data).await.unwrap();
    }

    pub async fn mkdir(&self, path: &str) {
        self.fs.inner().mkdir(Path::new(path), 0o755).await.unwrap();
    }

    pub async fn get(&self, path: &str) -> Vec<u8> {
        self.fs.inner().read_all(Path::new(path)).await.unwrap()
    }

    pub async fn exists(&self, path: &str) -> bool {
        self.fs.inner().exists(Path::new(path)).await
    }

    /// Names of staging files left in `dir`.
    pub async fn staging_files(&self, dir: &str) -> Vec<String> {
        self.fs
            .inner()
            .readdir(Path::new(dir))
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .filter(|n| n.starts_with(ATOMIC_UPLOAD_PREFIX))
            .collect()
    }
}

/// A user with every permission everywhere.
pub fn full_access(name: &str) -> UserProfile {
    UserProfile::new(name)
        .with_ids(1000, 1000)
        .with_permissions(PermissionRules::root([Permission::Any]))
}

pub fn upload(path: &str) -> Request {
    Request::new(Operation::Write, path).with_flags(OpenFlags::create_truncate())
}

pub fn resume(path: &str) -> Request {
    Request::new(Operation::Write, path).with_flags(OpenFlags::append())
}
