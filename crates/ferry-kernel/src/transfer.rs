//! Streaming transfers.
//!
//! A [`Transfer`] wraps one open backend handle. The protocol layer streams
//! bytes through it and closes it; a disconnect may abort it from another
//! task. Either way the finalize hook runs exactly once: it closes the
//! handle, moves a staged upload into place (or discards it) and commits
//! the quota delta.

use dashmap::DashMap;
use ferry_vfs::{FileHandle, OpenFile, VfsOps};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{DispatchError, DispatchResult};
use crate::planner::{TransferPlan, UploadMode};
use crate::quota::{QuotaEnforcer, WriteLimit};

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum TransferKind {
    Upload,
    Download,
}

// ============================================================================
// Registry
// ============================================================================

/// In-flight transfers of one session.
#[derive(Debug, Default)]
pub struct TransferRegistry {
    transfers: DashMap<Uuid, Transfer>,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, transfer: &Transfer) {
        self.transfers.insert(transfer.id(), transfer.clone());
    }

    fn unregister(&self, id: Uuid) {
        self.transfers.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    /// Snapshot of the registered transfers.
    pub fn snapshot(&self) -> Vec<Transfer> {
        self.transfers.iter().map(|t| t.value().clone()).collect()
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Builds transfers bound to one session's backend and registry.
pub struct TransferFactory {
    fs: Arc<dyn VfsOps>,
    registry: Arc<TransferRegistry>,
    mode: UploadMode,
}

impl TransferFactory {
    pub fn new(fs: Arc<dyn VfsOps>, registry: Arc<TransferRegistry>, mode: UploadMode) -> Self {
        Self { fs, registry, mode }
    }

    /// A download with no size limit and no quota accounting.
    pub fn download(&self, file: OpenFile, virtual_path: &str, path: PathBuf) -> Transfer {
        self.build(TransferParts {
            file,
            kind: TransferKind::Download,
            virtual_path: virtual_path.to_string(),
            write_path: path.clone(),
            final_path: path,
            is_new_file: false,
            min_write_offset: 0,
            initial_size: 0,
            limit: WriteLimit::Unlimited,
            quota: None,
        })
    }

    /// An upload shaped by `plan`, committing to `quota` at finalize.
    pub fn upload(
        &self,
        file: OpenFile,
        virtual_path: &str,
        plan: &TransferPlan,
        quota: QuotaEnforcer,
    ) -> Transfer {
        self.build(TransferParts {
            file,
            kind: TransferKind::Upload,
            virtual_path: virtual_path.to_string(),
            final_path: plan.final_path().to_path_buf(),
            write_path: plan.write_path().to_path_buf(),
            is_new_file: plan.is_new_file(),
            min_write_offset: plan.min_write_offset(),
            initial_size: plan.initial_size(),
            limit: plan.write_limit(),
            quota: Some(quota),
        })
    }

    fn build(&self, parts: TransferParts) -> Transfer {
        let OpenFile { handle, cancel } = parts.file;
        let transfer = Transfer {
            inner: Arc::new(TransferInner {
                id: Uuid::new_v4(),
                kind: parts.kind,
                virtual_path: parts.virtual_path,
                final_path: parts.final_path,
                write_path: parts.write_path,
                mode: self.mode,
                is_new_file: parts.is_new_file,
                min_write_offset: parts.min_write_offset,
                initial_size: parts.initial_size,
                limit: parts.limit,
                handle: tokio::sync::Mutex::new(handle),
                cancel,
                bytes: AtomicU64::new(0),
                error: parking_lot::Mutex::new(None),
                finalized: AtomicBool::new(false),
                started: Instant::now(),
                fs: Arc::clone(&self.fs),
                quota: parts.quota,
                registry: Arc::downgrade(&self.registry),
            }),
        };
        self.registry.register(&transfer);
        transfer
    }
}

struct TransferParts {
    file: OpenFile,
    kind: TransferKind,
    virtual_path: String,
    final_path: PathBuf,
    write_path: PathBuf,
    is_new_file: bool,
    min_write_offset: u64,
    initial_size: u64,
    limit: WriteLimit,
    quota: Option<QuotaEnforcer>,
}

// ============================================================================
// Transfer
// ============================================================================

/// Handle to one in-flight transfer. Clones share state.
#[derive(Clone)]
pub struct Transfer {
    inner: Arc<TransferInner>,
}

struct TransferInner {
    id: Uuid,
    kind: TransferKind,
    virtual_path: String,
    final_path: PathBuf,
    write_path: PathBuf,
    mode: UploadMode,
    is_new_file: bool,
    min_write_offset: u64,
    initial_size: u64,
    limit: WriteLimit,
    handle: tokio::sync::Mutex<Box<dyn FileHandle>>,
    cancel: CancellationToken,
    bytes: AtomicU64,
    error: parking_lot::Mutex<Option<DispatchError>>,
    finalized: AtomicBool,
    started: Instant,
    fs: Arc<dyn VfsOps>,
    quota: Option<QuotaEnforcer>,
    registry: Weak<TransferRegistry>,
}

impl std::fmt::Debug for Transfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transfer")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("path", &self.inner.virtual_path)
            .field("bytes", &self.bytes_transferred())
            .field("finalized", &self.is_finalized())
            .finish()
    }
}

impl Transfer {
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn kind(&self) -> TransferKind {
        self.inner.kind
    }

    pub fn virtual_path(&self) -> &str {
        &self.inner.virtual_path
    }

    pub fn min_write_offset(&self) -> u64 {
        self.inner.min_write_offset
    }

    pub fn initial_size(&self) -> u64 {
        self.inner.initial_size
    }

    pub fn write_limit(&self) -> WriteLimit {
        self.inner.limit
    }

    /// Bytes sent (download) or received (upload) so far.
    pub fn bytes_transferred(&self) -> u64 {
        self.inner.bytes.load(Ordering::Acquire)
    }

    pub fn is_finalized(&self) -> bool {
        self.inner.finalized.load(Ordering::Acquire)
    }

    /// Read from the file at `offset`. Downloads only.
    pub async fn read_at(&self, buf: &mut [u8], offset: u64) -> DispatchResult<usize> {
        if self.inner.kind != TransferKind::Download {
            return Err(DispatchError::unsupported("read on an upload"));
        }
        let mut handle = self.inner.handle.lock().await;
        if self.is_finalized() {
            return Err(DispatchError::TransferAborted("transfer closed".into()));
        }
        match handle.read_at(buf, offset).await {
            Ok(n) => {
                self.inner.bytes.fetch_add(n as u64, Ordering::AcqRel);
                Ok(n)
            }
            Err(e) => Err(self.fail(e.into())),
        }
    }

    /// Write `data` at `offset`. Uploads only.
    pub async fn write_at(&self, data: &[u8], offset: u64) -> DispatchResult<usize> {
        if self.inner.kind != TransferKind::Upload {
            return Err(DispatchError::unsupported("write on a download"));
        }
        let mut handle = self.inner.handle.lock().await;
        if self.is_finalized() {
            return Err(DispatchError::TransferAborted("transfer closed".into()));
        }
        if offset < self.inner.min_write_offset {
            return Err(self.fail(DispatchError::InvalidOffset {
                offset,
                min: self.inner.min_write_offset,
            }));
        }
        let received = self.inner.bytes.load(Ordering::Acquire);
        if !self.inner.limit.permits(received + data.len() as u64) {
            return Err(self.fail(DispatchError::quota_exceeded(format!(
                "write of {} bytes exceeds the {} byte limit",
                data.len(),
                self.inner.limit.as_raw()
            ))));
        }
        match handle.write_at(data, offset).await {
            Ok(n) => {
                self.inner.bytes.fetch_add(n as u64, Ordering::AcqRel);
                Ok(n)
            }
            Err(e) => Err(self.fail(e.into())),
        }
    }

    /// Finish the transfer. Returns the first error seen, if any.
    ///
    /// Finalizing again is a no-op.
    pub async fn close(&self) -> DispatchResult<()> {
        self.finalize().await
    }

    /// Abort the transfer: record `reason`, cancel backend work and
    /// finalize.
    pub async fn abort(&self, reason: &str) -> DispatchResult<()> {
        if self.is_finalized() {
            return Ok(());
        }
        self.fail(DispatchError::TransferAborted(reason.to_string()));
        self.inner.cancel.cancel();
        self.finalize().await
    }

    /// Record `err` as the transfer error if it is the first one. Returns
    /// an error for the current caller.
    fn fail(&self, err: DispatchError) -> DispatchError {
        let mut slot = self.inner.error.lock();
        if slot.is_some() {
            return err;
        }
        tracing::warn!(transfer = %self.inner.id, path = %self.inner.virtual_path, error = %err, "transfer error");
        let echoed = echo(&err);
        *slot = Some(err);
        echoed
    }

    async fn finalize(&self) -> DispatchResult<()> {
        let inner = &self.inner;
        if inner.finalized.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        {
            let mut handle = inner.handle.lock().await;
            if let Err(e) = handle.close().await {
                self.fail(e.into());
            }
        }

        let failed = inner.error.lock().is_some();
        let mut discarded = false;
        if inner.kind == TransferKind::Upload && inner.write_path != inner.final_path {
            if !failed || inner.mode == UploadMode::AtomicWithResume {
                if let Err(e) = inner.fs.rename(&inner.write_path, &inner.final_path).await {
                    tracing::error!(
                        source = %inner.write_path.display(),
                        dest = %inner.final_path.display(),
                        error = %e,
                        "atomic upload rename failed"
                    );
                    self.fail(e.into());
                }
            } else {
                if let Err(e) = inner.fs.unlink(&inner.write_path).await {
                    tracing::warn!(path = %inner.write_path.display(), error = %e, "unable to remove failed atomic upload");
                }
                discarded = true;
            }
        }

        let bytes = self.bytes_transferred();
        if let (TransferKind::Upload, Some(quota)) = (inner.kind, &inner.quota) {
            let final_size = if discarded {
                0
            } else {
                inner.min_write_offset + bytes
            };
            let files_delta = match (discarded, inner.is_new_file) {
                (false, true) => 1,
                (true, false) => -1,
                _ => 0,
            };
            let size_delta = final_size as i64 - inner.initial_size as i64;
            quota.commit(&inner.virtual_path, files_delta, size_delta);
        }

        if let Some(registry) = inner.registry.upgrade() {
            registry.unregister(inner.id);
        }

        let result = match inner.error.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        };
        tracing::info!(
            transfer = %inner.id,
            kind = %inner.kind,
            path = %inner.virtual_path,
            bytes,
            discarded,
            elapsed_ms = inner.started.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "transfer finished"
        );
        result
    }
}

/// Error handed to the caller that hit a failure, while the original is
/// kept for `close`.
fn echo(err: &DispatchError) -> DispatchError {
    match err {
        DispatchError::InvalidOffset { offset, min } => DispatchError::InvalidOffset {
            offset: *offset,
            min: *min,
        },
        DispatchError::QuotaExceeded(msg) => DispatchError::QuotaExceeded(msg.clone()),
        DispatchError::TransferAborted(msg) => DispatchError::TransferAborted(msg.clone()),
        other => DispatchError::TransferAborted(other.to_string()),
    }
}
