//! Upload planning: where a write goes, from which offset, with what budget.
//!
//! A [`TransferPlan`] is computed once per write request. Its fields are
//! private and only readable afterwards.

use ferry_vfs::{OpenFile, OpenFlags, OsOpenFlags, VfsOps};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::DispatchResult;
use crate::quota::{QuotaCheck, QuotaEnforcer, QuotaError, WriteLimit};

/// How uploads over existing files are made visible.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum UploadMode {
    /// Write the final path in place.
    #[default]
    Standard,
    /// Stage the upload and rename it into place on success. A failed
    /// upload is discarded.
    Atomic,
    /// Like `Atomic`, but a failed upload is still renamed into place so
    /// the client can resume it.
    AtomicWithResume,
}

impl UploadMode {
    pub fn is_atomic(&self) -> bool {
        !matches!(self, UploadMode::Standard)
    }
}

/// The decided shape of one upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPlan {
    final_path: PathBuf,
    write_path: PathBuf,
    min_write_offset: u64,
    initial_size: u64,
    write_limit: WriteLimit,
    is_new_file: bool,
    is_resume: bool,
    os_flags: OsOpenFlags,
    reclaim: u64,
}

impl TransferPlan {
    /// Where the data must end up.
    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    /// Where the data is written while the transfer runs.
    pub fn write_path(&self) -> &Path {
        &self.write_path
    }

    /// True when writing to a staging path.
    pub fn is_staged(&self) -> bool {
        self.write_path != self.final_path
    }

    /// Writes below this offset are rejected.
    pub fn min_write_offset(&self) -> u64 {
        self.min_write_offset
    }

    /// Bytes already accounted in the ledger for this file.
    pub fn initial_size(&self) -> u64 {
        self.initial_size
    }

    pub fn write_limit(&self) -> WriteLimit {
        self.write_limit
    }

    pub fn is_new_file(&self) -> bool {
        self.is_new_file
    }

    pub fn is_resume(&self) -> bool {
        self.is_resume
    }

    pub fn os_flags(&self) -> OsOpenFlags {
        self.os_flags
    }

    /// Bytes to release from the ledger once the target is open.
    pub fn reclaim(&self) -> u64 {
        self.reclaim
    }
}

/// Decides write targets for one backend under one upload mode.
pub struct AtomicUploadPlanner<'a> {
    fs: &'a dyn VfsOps,
    mode: UploadMode,
}

impl<'a> AtomicUploadPlanner<'a> {
    pub fn new(fs: &'a dyn VfsOps, mode: UploadMode) -> Self {
        Self { fs, mode }
    }

    /// Whether overwrites go through a staging path.
    pub fn uses_staging(&self) -> bool {
        self.mode.is_atomic() && self.fs.capabilities().atomic_upload
    }

    /// Plan an upload that creates `final_path`.
    pub fn plan_new_file(
        &self,
        final_path: PathBuf,
        check: &QuotaCheck,
    ) -> Result<TransferPlan, QuotaError> {
        let write_limit = QuotaEnforcer::max_write_size(check, false, 0)?;
        Ok(TransferPlan {
            write_path: final_path.clone(),
            final_path,
            min_write_offset: 0,
            initial_size: 0,
            write_limit,
            is_new_file: true,
            is_resume: false,
            os_flags: OsOpenFlags::create_truncate(),
            reclaim: 0,
        })
    }

    /// Plan an upload over the existing regular file at `final_path`.
    ///
    /// A resume (append without truncate) keeps the stored bytes and only
    /// accepts writes past them. Anything else replaces the file, so its
    /// bytes are either reclaimed up front (local ledger) or carried as the
    /// initial size for reconciliation at finalize.
    pub fn plan_existing(
        &self,
        final_path: PathBuf,
        flags: OpenFlags,
        file_size: u64,
        check: &QuotaCheck,
    ) -> Result<TransferPlan, QuotaError> {
        let os_flags = flags.to_os_flags();
        let is_resume = flags.append && !os_flags.truncate;
        let mut write_limit = QuotaEnforcer::max_write_size(check, is_resume, file_size)?;

        let write_path = if self.uses_staging() {
            self.fs.atomic_upload_path(&final_path)
        } else {
            final_path.clone()
        };

        let (min_write_offset, initial_size, reclaim) = if is_resume {
            (file_size, file_size, 0)
        } else {
            write_limit = write_limit.extend(file_size);
            if self.fs.capabilities().local_quota_ledger {
                (0, 0, file_size)
            } else {
                (0, file_size, 0)
            }
        };

        Ok(TransferPlan {
            final_path,
            write_path,
            min_write_offset,
            initial_size,
            write_limit,
            is_new_file: false,
            is_resume,
            os_flags,
            reclaim,
        })
    }

    /// Open the plan's write target.
    ///
    /// With staging, the final path is renamed to the staging path first so
    /// a resume sees the stored bytes. If the open then fails the rename is
    /// undone; the final path must not be left missing silently.
    pub async fn open(&self, plan: &TransferPlan) -> DispatchResult<OpenFile> {
        if !plan.is_staged() {
            return Ok(self.fs.open_write(&plan.write_path, plan.os_flags).await?);
        }

        if let Err(e) = self.fs.rename(&plan.final_path, &plan.write_path).await {
            tracing::warn!(
                source = %plan.final_path.display(),
                dest = %plan.write_path.display(),
                error = %e,
                "error renaming existing file for atomic upload"
            );
            return Err(e.into());
        }

        match self.fs.open_write(&plan.write_path, plan.os_flags).await {
            Ok(file) => Ok(file),
            Err(open_err) => {
                match self.fs.rename(&plan.write_path, &plan.final_path).await {
                    Ok(()) => tracing::error!(
                        path = %plan.final_path.display(),
                        error = %open_err,
                        "open after staging rename failed, original file restored"
                    ),
                    Err(restore_err) => tracing::error!(
                        path = %plan.final_path.display(),
                        staging = %plan.write_path.display(),
                        error = %open_err,
                        restore_error = %restore_err,
                        "open after staging rename failed and restore failed, final path is missing"
                    ),
                }
                Err(open_err.into())
            }
        }
    }
}
