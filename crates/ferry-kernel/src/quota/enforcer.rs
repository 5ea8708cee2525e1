//! Budget checks and ledger updates for one user.

use std::sync::Arc;

use crate::user::UserProfile;
use crate::vpath;

use super::{QuotaCheck, QuotaError, QuotaLedger, Usage, WriteLimit};

/// Which ledger(s) a path is accounted against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaScope {
    /// The user's own ledger.
    User,
    /// A virtual folder's ledger, and the user's too when included.
    Folder {
        name: String,
        included_in_user_quota: bool,
    },
}

/// Quota checks for one user against a shared ledger.
///
/// Cheap to clone; holds no state beyond its references.
#[derive(Clone)]
pub struct QuotaEnforcer {
    user: Arc<UserProfile>,
    ledger: Arc<dyn QuotaLedger>,
    tracking: bool,
}

impl std::fmt::Debug for QuotaEnforcer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaEnforcer")
            .field("user", &self.user.username())
            .field("tracking", &self.tracking)
            .finish()
    }
}

impl QuotaEnforcer {
    pub fn new(user: Arc<UserProfile>, ledger: Arc<dyn QuotaLedger>, tracking: bool) -> Self {
        Self {
            user,
            ledger,
            tracking,
        }
    }

    pub fn is_tracking(&self) -> bool {
        self.tracking
    }

    /// Scope of the file at `virtual_path`, decided by its parent directory.
    pub fn scope(&self, virtual_path: &str) -> QuotaScope {
        match self.user.virtual_folder_for(&vpath::parent(virtual_path)) {
            Some(folder) => QuotaScope::Folder {
                name: folder.name.clone(),
                included_in_user_quota: folder.included_in_user_quota,
            },
            None => QuotaScope::User,
        }
    }

    /// Whether a write to `virtual_path` is permitted at all.
    ///
    /// A folder that does not count toward the user quota is checked against
    /// its own limits; everything else against the user's. File limits only
    /// matter for new files.
    pub fn has_space(&self, is_new_file: bool, virtual_path: &str) -> QuotaCheck {
        if !self.tracking {
            return QuotaCheck::unlimited();
        }

        let dir = vpath::parent(virtual_path);
        let (quota_size, quota_files, usage) = match self.user.virtual_folder_for(&dir) {
            Some(folder) if !folder.included_in_user_quota => {
                if folder.has_no_quota_restrictions(is_new_file) {
                    return QuotaCheck::unlimited();
                }
                (
                    folder.quota_size,
                    folder.quota_files,
                    self.ledger.folder_usage(&folder.name),
                )
            }
            _ => {
                if self.user.has_no_quota_restrictions(is_new_file) {
                    return QuotaCheck::unlimited();
                }
                (
                    self.user.quota_size(),
                    self.user.quota_files(),
                    self.ledger.user_usage(self.user.username()),
                )
            }
        };

        let Usage {
            files: used_files,
            size: used_size,
        } = match usage {
            Ok(usage) => usage,
            Err(e) => {
                tracing::warn!(user = %self.user.username(), error = %e, "unable to read used quota");
                return QuotaCheck {
                    has_space: false,
                    quota_size,
                    quota_files,
                    used_size: 0,
                    used_files: 0,
                };
            }
        };

        let files_exhausted = is_new_file && quota_files > 0 && used_files >= quota_files;
        let size_exhausted = quota_size > 0 && used_size >= quota_size;
        QuotaCheck {
            has_space: !(files_exhausted || size_exhausted),
            quota_size,
            quota_files,
            used_size,
            used_files,
        }
    }

    /// Write budget for an upload, see [`QuotaCheck::max_write_size`].
    pub fn max_write_size(
        check: &QuotaCheck,
        is_resume: bool,
        existing: u64,
    ) -> Result<WriteLimit, QuotaError> {
        check.max_write_size(is_resume, existing)
    }

    /// Release `size` bytes of the file at `virtual_path` right away.
    pub fn reclaim(&self, virtual_path: &str, size: u64) {
        self.commit(virtual_path, 0, -(size as i64));
    }

    /// Apply signed deltas for the file at `virtual_path` to its scope.
    pub fn commit(&self, virtual_path: &str, files_delta: i64, size_delta: i64) {
        if !self.tracking || (files_delta == 0 && size_delta == 0) {
            return;
        }
        self.commit_to(&self.scope(virtual_path), files_delta, size_delta);
    }

    /// Apply signed deltas to an explicit scope.
    pub fn commit_to(&self, scope: &QuotaScope, files_delta: i64, size_delta: i64) {
        if !self.tracking {
            return;
        }
        let username = self.user.username();
        let result = match scope {
            QuotaScope::Folder {
                name,
                included_in_user_quota,
            } => self
                .ledger
                .update_folder(name, files_delta, size_delta)
                .and_then(|_| {
                    if *included_in_user_quota {
                        self.ledger.update_user(username, files_delta, size_delta)
                    } else {
                        Ok(())
                    }
                }),
            QuotaScope::User => self.ledger.update_user(username, files_delta, size_delta),
        };

        match result {
            Ok(()) => tracing::debug!(
                user = %username,
                ?scope,
                files_delta,
                size_delta,
                "quota updated"
            ),
            Err(e) => tracing::warn!(user = %username, ?scope, error = %e, "quota update failed"),
        }
    }
}
